//! Frame acquisition: ring buffer, sources, recording and playback.

pub mod engine;
pub mod player;
pub mod recorder;
pub mod ring_buffer;
pub mod source;

pub use engine::{CalibrationFeed, CaptureEngine, CaptureOptions};
pub use player::{PlayStatus, RawPlayer};
pub use recorder::{RawFileHeader, Recorder, RecorderOptions};
pub use ring_buffer::{FrameRing, DEFAULT_RING_CAPACITY};
pub use source::{AutoCalibrationMode, DeviceOption, RawSource, RegisterIo, SyntheticSource};
