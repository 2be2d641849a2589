//! Real-time stereo-vision disparity engine.
//!
//! This library contains the core data path of a stereo depth camera
//! product: the ring-buffered capture pipeline with recording and playback,
//! the decoder for the FPGA disparity wire format, the SSD block matcher
//! with back-matching validation, and the averaging and hole-completion
//! post-processing over the disparity block grid.
//!
//! Camera vendor transport, calibration, color processing and GUI live
//! outside this crate; they plug in through the [`capture::RawSource`] and
//! [`capture::RegisterIo`] traits.

pub mod capture;
pub mod error;
pub mod frame;
pub mod params;
pub mod pipeline;
pub mod process;

pub use error::{EngineError, EngineResult};
pub use frame::{
    BlockGrid, CameraCalibration, CameraModel, ColorMode, DisparityImage, Frame, FramePayload,
    GrabMode, GrayImage, Rect, ShutterMode,
};
pub use params::{EngineParameters, ParameterStore, ParameterValue};
pub use pipeline::{AreaStatistics, Pipeline, PipelineConfig, StartOptions};
