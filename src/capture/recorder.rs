//! Append-only framed recording of raw camera data.
//!
//! A recording starts with one fixed little-endian header describing the
//! camera (model, modes, geometry, stereo calibration constants) followed by
//! one record per frame: a small frame header plus the raw interleaved
//! plane. The format is deliberately dumb so the player can seek by record
//! arithmetic.
//!
//! Files rotate on a wall-clock interval and when free disk space falls
//! below a floor; recording refuses to start at all when the target volume
//! has less than the configured minimum capacity. Append failures are
//! logged and swallowed so a full disk never takes the capture loop down.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::Disks;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::frame::{
    CameraCalibration, CameraModel, ColorMode, Frame, FramePayload, GrabMode, ShutterMode,
};

/// File magic, "PLAX" in little-endian byte order.
pub const RAW_FILE_MAGIC: u32 = 0x5841_4C50;

/// Size of the fixed file header in bytes.
pub const RAW_FILE_HEADER_SIZE: u64 = 44;

/// Size of one per-frame record header in bytes.
pub const FRAME_RECORD_HEADER_SIZE: u64 = 28;

/// Record type tag: grayscale payload.
pub const FRAME_TYPE_MONO: i32 = 1;

/// Record type tag: color payload (paired with a mono record).
pub const FRAME_TYPE_COLOR: i32 = 2;

/// Fixed header written once at the start of every recording.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawFileHeader {
    /// Camera model the stream came from.
    pub model: CameraModel,
    /// Grab mode of the session.
    pub grab: GrabMode,
    /// Color mode of the session.
    pub color: ColorMode,
    /// Shutter mode of the session.
    pub shutter: ShutterMode,
    /// Image width in pixels.
    pub max_width: usize,
    /// Image height in pixels.
    pub max_height: usize,
    /// Stereo calibration constants of the recording camera.
    pub calibration: CameraCalibration,
}

impl RawFileHeader {
    /// Serializes the header in the fixed little-endian layout.
    pub fn write_to(&self, writer: &mut impl Write) -> EngineResult<()> {
        writer.write_all(&RAW_FILE_MAGIC.to_le_bytes())?;
        writer.write_all(&self.model.tag().to_le_bytes())?;
        writer.write_all(&self.grab.tag().to_le_bytes())?;
        writer.write_all(&self.color.tag().to_le_bytes())?;
        writer.write_all(&self.shutter.tag().to_le_bytes())?;
        writer.write_all(&(self.max_width as i32).to_le_bytes())?;
        writer.write_all(&(self.max_height as i32).to_le_bytes())?;
        writer.write_all(&self.calibration.d_inf.to_le_bytes())?;
        writer.write_all(&self.calibration.bf.to_le_bytes())?;
        writer.write_all(&self.calibration.base_length.to_le_bytes())?;
        writer.write_all(&self.calibration.dz.to_le_bytes())?;
        Ok(())
    }

    /// Parses a header previously written with [`RawFileHeader::write_to`].
    pub fn read_from(reader: &mut impl Read) -> EngineResult<Self> {
        let magic = read_u32(reader)?;
        if magic != RAW_FILE_MAGIC {
            return Err(EngineError::ReadFailed(format!(
                "bad file magic 0x{magic:08X}"
            )));
        }
        let model = CameraModel::from_tag(read_i32(reader)?);
        let grab = GrabMode::from_tag(read_i32(reader)?)
            .ok_or_else(|| EngineError::ReadFailed("unknown grab mode tag".to_string()))?;
        let color = ColorMode::from_tag(read_i32(reader)?)
            .ok_or_else(|| EngineError::ReadFailed("unknown color mode tag".to_string()))?;
        let shutter = ShutterMode::from_tag(read_i32(reader)?)
            .ok_or_else(|| EngineError::ReadFailed("unknown shutter mode tag".to_string()))?;
        let max_width = read_i32(reader)?;
        let max_height = read_i32(reader)?;
        if max_width <= 0 || max_height <= 0 {
            return Err(EngineError::ReadFailed(format!(
                "bad image geometry {max_width}x{max_height}"
            )));
        }
        let calibration = CameraCalibration {
            d_inf: read_f32(reader)?,
            bf: read_f32(reader)?,
            base_length: read_f32(reader)?,
            dz: read_f32(reader)?,
        };
        Ok(Self {
            model,
            grab,
            color,
            shutter,
            max_width: max_width as usize,
            max_height: max_height as usize,
            calibration,
        })
    }
}

/// Header of one frame record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRecordHeader {
    /// Monotonic frame index from the source.
    pub index: u64,
    /// Record type, [`FRAME_TYPE_MONO`] or [`FRAME_TYPE_COLOR`].
    pub frame_type: i32,
    /// Sensor gain at capture.
    pub gain: i32,
    /// Sensor exposure at capture.
    pub exposure: i32,
    /// Per-sensor error code.
    pub error_code: i32,
    /// Payload length in bytes.
    pub data_size: u32,
}

impl FrameRecordHeader {
    /// Serializes the record header.
    pub fn write_to(&self, writer: &mut impl Write) -> EngineResult<()> {
        writer.write_all(&(self.index as i64).to_le_bytes())?;
        writer.write_all(&self.frame_type.to_le_bytes())?;
        writer.write_all(&self.gain.to_le_bytes())?;
        writer.write_all(&self.exposure.to_le_bytes())?;
        writer.write_all(&self.error_code.to_le_bytes())?;
        writer.write_all(&self.data_size.to_le_bytes())?;
        Ok(())
    }

    /// Parses a record header.
    pub fn read_from(reader: &mut impl Read) -> EngineResult<Self> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let index = i64::from_le_bytes(buf).max(0) as u64;
        Ok(Self {
            index,
            frame_type: read_i32(reader)?,
            gain: read_i32(reader)?,
            exposure: read_i32(reader)?,
            error_code: read_i32(reader)?,
            data_size: read_u32(reader)?,
        })
    }
}

fn read_i32(reader: &mut impl Read) -> EngineResult<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u32(reader: &mut impl Read) -> EngineResult<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32(reader: &mut impl Read) -> EngineResult<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

/// Recording policy.
#[derive(Clone, Debug)]
pub struct RecorderOptions {
    /// Directory recordings are written into.
    pub directory: PathBuf,
    /// Start a fresh file after this much wall-clock time.
    pub rotation_interval: Option<Duration>,
    /// Refuse to start recording when the volume has less than this many
    /// bytes available.
    pub minimum_capacity: u64,
    /// Rotate to a fresh file when free space drops below this floor.
    pub capacity_floor: u64,
}

impl RecorderOptions {
    /// Policy writing into `directory` with the stock 20 GB start threshold.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            rotation_interval: None,
            minimum_capacity: 20 * 1024 * 1024 * 1024,
            capacity_floor: 1024 * 1024 * 1024,
        }
    }

    /// Disables every capacity check; used by tests and bounded replays.
    pub fn without_capacity_checks(mut self) -> Self {
        self.minimum_capacity = 0;
        self.capacity_floor = 0;
        self
    }

    /// Sets the wall-clock rotation interval.
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = Some(interval);
        self
    }
}

/// Appends captured frames to rotating record files.
pub struct Recorder {
    options: RecorderOptions,
    header: RawFileHeader,
    writer: Option<BufWriter<File>>,
    current_path: PathBuf,
    opened_at: DateTime<Utc>,
    frames_written: u64,
    scratch: Vec<u8>,
}

impl Recorder {
    /// Opens the first record file.
    ///
    /// Fails with [`EngineError::OpenFailed`] when the target volume does
    /// not have `minimum_capacity` bytes available.
    pub fn start(options: RecorderOptions, header: RawFileHeader) -> EngineResult<Self> {
        std::fs::create_dir_all(&options.directory)?;
        if options.minimum_capacity > 0 {
            if let Some(available) = available_capacity(&options.directory) {
                if available < options.minimum_capacity {
                    return Err(EngineError::OpenFailed(format!(
                        "{} bytes free, {} required to start recording",
                        available, options.minimum_capacity
                    )));
                }
            }
        }
        let scratch = vec![0u8; header.max_width * header.max_height * 2];
        let mut recorder = Self {
            options,
            header,
            writer: None,
            current_path: PathBuf::new(),
            opened_at: Utc::now(),
            frames_written: 0,
            scratch,
        };
        recorder.open_new_file()?;
        Ok(recorder)
    }

    /// Path of the file currently being written.
    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    /// Frames appended across all files of this session.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Appends one frame.
    ///
    /// I/O failures are logged and reported but leave the recorder usable;
    /// the capture loop keeps running either way.
    pub fn append(&mut self, frame: &Frame) -> EngineResult<()> {
        self.maybe_rotate();
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        let data: &[u8] = match &frame.payload {
            FramePayload::Raw { packed } => packed,
            FramePayload::Encoded { interleaved } => interleaved,
            FramePayload::Rectified { reference, compare } => {
                // Re-interleave into the wire layout: even byte compare,
                // odd byte reference.
                let n = reference.width * reference.height;
                self.scratch.resize(2 * n, 0);
                for (i, chunk) in self.scratch.chunks_exact_mut(2).enumerate().take(n) {
                    chunk[0] = compare.data[i];
                    chunk[1] = reference.data[i];
                }
                &self.scratch
            }
            FramePayload::Empty => {
                return Err(EngineError::InvalidParameter(
                    "cannot record an empty frame".to_string(),
                ));
            }
        };

        let record = FrameRecordHeader {
            index: frame.index,
            frame_type: FRAME_TYPE_MONO,
            gain: frame.gain,
            exposure: frame.exposure,
            error_code: frame.error_code,
            data_size: data.len() as u32,
        };
        let result = record
            .write_to(writer)
            .and_then(|()| writer.write_all(data).map_err(EngineError::from));
        match result {
            Ok(()) => {
                self.frames_written += 1;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, path = %self.current_path.display(), "record append failed");
                Err(e)
            }
        }
    }

    /// Flushes and closes the current file.
    pub fn stop(&mut self) -> EngineResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                path = %self.current_path.display(),
                frames = self.frames_written,
                "recording closed"
            );
        }
        Ok(())
    }

    fn maybe_rotate(&mut self) {
        let interval_hit = self
            .options
            .rotation_interval
            .is_some_and(|interval| {
                let elapsed = Utc::now().signed_duration_since(self.opened_at);
                elapsed.to_std().map(|e| e >= interval).unwrap_or(false)
            });
        let floor_hit = self.options.capacity_floor > 0
            && available_capacity(&self.options.directory)
                .is_some_and(|available| available < self.options.capacity_floor);
        if (interval_hit || floor_hit) && self.writer.is_some() {
            info!(interval_hit, floor_hit, "rotating record file");
            if let Err(e) = self.open_new_file() {
                warn!(error = %e, "rotation failed, recording suspended");
                self.writer = None;
            }
        }
    }

    fn open_new_file(&mut self) -> EngineResult<()> {
        if let Some(mut old) = self.writer.take() {
            if let Err(e) = old.flush() {
                warn!(error = %e, "flush of rotated file failed");
            }
        }
        let name = format!("record_{}.dat", Utc::now().format("%Y%m%d_%H%M%S_%3f"));
        let path = self.options.directory.join(name);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        self.header.write_to(&mut writer)?;
        info!(path = %path.display(), "recording started");
        self.current_path = path;
        self.opened_at = Utc::now();
        self.writer = Some(writer);
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "recorder close failed");
        }
    }
}

/// Free bytes on the volume holding `path`, or `None` when the volume cannot
/// be identified.
pub fn available_capacity(path: &Path) -> Option<u64> {
    let target = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
