//! Frame source abstraction and the synthetic test device.
//!
//! [`RawSource`] is the contract every frame producer satisfies: the USB
//! camera transport behind the vendor SDK, the file player, and the
//! deterministic [`SyntheticSource`] used by tests and offline runs. The
//! engine only ever talks to this trait, so sources are interchangeable at
//! session start.
//!
//! Device control goes through a small polymorphic option surface
//! ([`DeviceOption`] plus [`ParameterValue`]) instead of one setter per
//! primitive type, and raw register access is split into [`RegisterIo`] so
//! that the self-calibration module can drive registers without holding a
//! reference to the whole source.

use std::time::Duration;

use chrono::Utc;

use crate::error::{EngineError, EngineResult};
use crate::frame::{
    ColorMode, Frame, FramePayload, GrabMode, GrayImage, ShutterMode, ENCODED_BLOCK,
};
use crate::params::ParameterValue;

/// Auto-calibration state of the camera head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoCalibrationMode {
    /// Calibration disabled.
    Off,
    /// Continuous self-calibration running.
    Running,
    /// One-shot calibration requested by the host.
    ManualStart,
}

/// Controllable device option names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceOption {
    /// Shutter control mode.
    ShutterMode,
    /// Exposure value in device units (range and polarity are device
    /// specific).
    Exposure,
    /// Analog gain.
    Gain,
    /// High dynamic range mode.
    Hdr,
    /// High resolution mode.
    HighResolution,
    /// Auto-calibration state.
    AutoCalibration,
    /// Occlusion removal strength, 0..=7.
    OcclusionRemoval,
    /// Peculiar (speckle) removal switch.
    PeculiarRemoval,
}

/// Raw register access, split out so collaborators like self-calibration can
/// be handed register I/O without a reference to the whole source.
pub trait RegisterIo {
    /// Issues a read request; `wbuf` carries the request bytes and the reply
    /// is written into `rbuf`.
    fn read_register(&mut self, wbuf: &[u8], rbuf: &mut [u8]) -> EngineResult<()>;

    /// Issues a write request.
    fn write_register(&mut self, wbuf: &[u8]) -> EngineResult<()>;
}

/// A producer of timestamped raw frames.
///
/// Contract: `open` before `start`, `start` before any `read`; reads are
/// delivered in capture order; options may be changed while running.
pub trait RawSource: RegisterIo + Send {
    /// Establishes the device connection.
    fn open(&mut self) -> EngineResult<()>;

    /// Releases the device connection.
    fn close(&mut self) -> EngineResult<()>;

    /// Starts the grab in the given mode.
    fn start(&mut self, mode: GrabMode, color: ColorMode) -> EngineResult<()>;

    /// Stops the grab.
    fn stop(&mut self) -> EngineResult<()>;

    /// Blocks up to `wait` for the next frame.
    ///
    /// Returns [`EngineError::NoImage`] when nothing arrived in time and
    /// [`EngineError::Calibrating`] while the head recalibrates.
    fn read(&mut self, wait: Duration) -> EngineResult<Frame>;

    /// Reads a device option.
    fn get_option(&mut self, option: DeviceOption) -> EngineResult<ParameterValue>;

    /// Writes a device option. Settable while running.
    fn set_option(&mut self, option: DeviceOption, value: ParameterValue) -> EngineResult<()>;
}

/// Register addresses of the camera-side disparity filters.
const REG_OCCLUSION_REMOVAL: u8 = 0x81;
const REG_PECULIAR_REMOVAL: u8 = 0x82;

/// Deterministic in-process source.
///
/// Produces a constant-gradient stereo pair whose compare image is the
/// reference shifted right by a configurable amount, or the matching encoded
/// stream in parallax mode. Useful for tests and for exercising the pipeline
/// without hardware.
pub struct SyntheticSource {
    width: usize,
    height: usize,
    shift: usize,
    frame_limit: Option<u64>,
    opened: bool,
    running: bool,
    mode: GrabMode,
    color: ColorMode,
    index: u64,
    shutter: ShutterMode,
    exposure: i32,
    gain: i32,
    hdr: bool,
    high_resolution: bool,
    calibration: AutoCalibrationMode,
    registers: [u8; 256],
}

impl SyntheticSource {
    /// Creates a source emitting `width x height` frames with the compare
    /// image shifted right by `shift` pixels.
    pub fn new(width: usize, height: usize, shift: usize) -> Self {
        Self {
            width,
            height,
            shift,
            frame_limit: None,
            opened: false,
            running: false,
            mode: GrabMode::Corrected,
            color: ColorMode::Mono,
            index: 0,
            shutter: ShutterMode::Manual,
            exposure: 500,
            gain: 0,
            hdr: false,
            high_resolution: false,
            calibration: AutoCalibrationMode::Off,
            registers: [0; 256],
        }
    }

    /// Stops delivering after `limit` frames; further reads yield `NoImage`.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Reference-image intensity at a pixel: a constant-gradient ramp, so
    /// the SSD profile around an exact integer shift is symmetric.
    fn reference_at(x: usize, y: usize) -> u8 {
        ((x * 3 + y) & 0xFF) as u8
    }

    fn rectified_payload(&self) -> FramePayload {
        let mut reference = GrayImage::new(self.width, self.height);
        let mut compare = GrayImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                reference.data[y * self.width + x] = Self::reference_at(x, y);
                let src_x = x.saturating_sub(self.shift);
                compare.data[y * self.width + x] = Self::reference_at(src_x, y);
            }
        }
        FramePayload::Rectified { reference, compare }
    }

    fn encoded_payload(&self) -> FramePayload {
        // Interleaved wire layout: even bytes carry the encoded disparity
        // plane, odd bytes the reference image.
        let mut interleaved = vec![0u8; 2 * self.width * self.height];
        for y in 0..self.height {
            for x in 0..self.width {
                interleaved[(y * self.width + x) * 2 + 1] = Self::reference_at(x, y);
            }
        }
        let disp = self.shift.min(95) as u8;
        for by in (0..self.height).step_by(ENCODED_BLOCK) {
            for bx in (0..self.width).step_by(ENCODED_BLOCK) {
                let base = by * self.width + bx;
                interleaved[2 * base] = disp;
                interleaved[2 * (base + 1)] = 0x00;
                interleaved[2 * (base + 2)] = 0xFF;
                interleaved[2 * (base + 3)] = 0xFF;
            }
        }
        FramePayload::Encoded { interleaved }
    }
}

impl RegisterIo for SyntheticSource {
    fn read_register(&mut self, wbuf: &[u8], rbuf: &mut [u8]) -> EngineResult<()> {
        let Some(&address) = wbuf.first() else {
            return Err(EngineError::InvalidParameter(
                "empty register read request".to_string(),
            ));
        };
        if let Some(out) = rbuf.first_mut() {
            *out = self.registers[address as usize];
        }
        Ok(())
    }

    fn write_register(&mut self, wbuf: &[u8]) -> EngineResult<()> {
        let [address, value, ..] = wbuf else {
            return Err(EngineError::InvalidParameter(
                "register write needs address and value".to_string(),
            ));
        };
        self.registers[*address as usize] = *value;
        Ok(())
    }
}

impl RawSource for SyntheticSource {
    fn open(&mut self) -> EngineResult<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        self.opened = false;
        self.running = false;
        Ok(())
    }

    fn start(&mut self, mode: GrabMode, color: ColorMode) -> EngineResult<()> {
        if !self.opened {
            return Err(EngineError::GrabStartFailed("source not open".to_string()));
        }
        self.mode = mode;
        self.color = color;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> EngineResult<()> {
        self.running = false;
        Ok(())
    }

    fn read(&mut self, _wait: Duration) -> EngineResult<Frame> {
        if !self.running {
            return Err(EngineError::NoImage);
        }
        if let Some(limit) = self.frame_limit {
            if self.index >= limit {
                return Err(EngineError::NoImage);
            }
        }
        if self.calibration == AutoCalibrationMode::ManualStart {
            // One frame worth of calibration, then back to normal delivery.
            self.calibration = AutoCalibrationMode::Off;
            return Err(EngineError::Calibrating);
        }

        let payload = match self.mode {
            GrabMode::Parallax => self.encoded_payload(),
            _ => self.rectified_payload(),
        };
        // Double shutter alternates long and short exposures 4:1.
        let exposure = match self.shutter {
            ShutterMode::Double | ShutterMode::Double2 if self.index % 2 == 1 => self.exposure / 4,
            _ => self.exposure,
        };
        let frame = Frame {
            width: self.width,
            height: self.height,
            index: self.index,
            timestamp: Utc::now(),
            gain: self.gain,
            exposure,
            error_code: 0,
            payload,
        };
        self.index += 1;
        Ok(frame)
    }

    fn get_option(&mut self, option: DeviceOption) -> EngineResult<ParameterValue> {
        let value = match option {
            DeviceOption::ShutterMode => ParameterValue::Shutter(self.shutter),
            DeviceOption::Exposure => ParameterValue::Int(i64::from(self.exposure)),
            DeviceOption::Gain => ParameterValue::Int(i64::from(self.gain)),
            DeviceOption::Hdr => ParameterValue::Bool(self.hdr),
            DeviceOption::HighResolution => ParameterValue::Bool(self.high_resolution),
            DeviceOption::AutoCalibration => ParameterValue::Int(match self.calibration {
                AutoCalibrationMode::Off => 0,
                AutoCalibrationMode::Running => 1,
                AutoCalibrationMode::ManualStart => 2,
            }),
            DeviceOption::OcclusionRemoval => {
                ParameterValue::Int(i64::from(self.registers[REG_OCCLUSION_REMOVAL as usize]))
            }
            DeviceOption::PeculiarRemoval => {
                ParameterValue::Bool(self.registers[REG_PECULIAR_REMOVAL as usize] != 0)
            }
        };
        Ok(value)
    }

    fn set_option(&mut self, option: DeviceOption, value: ParameterValue) -> EngineResult<()> {
        let invalid = || {
            EngineError::InvalidParameter(format!("{option:?} does not accept {value:?}"))
        };
        match option {
            DeviceOption::ShutterMode => {
                self.shutter = value.as_shutter().ok_or_else(invalid)?;
            }
            DeviceOption::Exposure => {
                let v = value.as_i64().ok_or_else(invalid)?;
                self.exposure = i32::try_from(v).map_err(|_| invalid())?;
            }
            DeviceOption::Gain => {
                let v = value.as_i64().ok_or_else(invalid)?;
                self.gain = i32::try_from(v).map_err(|_| invalid())?;
            }
            DeviceOption::Hdr => self.hdr = value.as_bool().ok_or_else(invalid)?,
            DeviceOption::HighResolution => {
                self.high_resolution = value.as_bool().ok_or_else(invalid)?;
            }
            DeviceOption::AutoCalibration => {
                self.calibration = match value.as_i64().ok_or_else(invalid)? {
                    0 => AutoCalibrationMode::Off,
                    1 => AutoCalibrationMode::Running,
                    2 => AutoCalibrationMode::ManualStart,
                    _ => return Err(invalid()),
                };
            }
            DeviceOption::OcclusionRemoval => {
                let level = value.as_i64().ok_or_else(invalid)?;
                if !(0..=7).contains(&level) {
                    return Err(invalid());
                }
                self.write_register(&[REG_OCCLUSION_REMOVAL, level as u8])?;
            }
            DeviceOption::PeculiarRemoval => {
                let on = value.as_bool().ok_or_else(invalid)?;
                self.write_register(&[REG_PECULIAR_REMOVAL, u8::from(on)])?;
            }
        }
        Ok(())
    }
}
