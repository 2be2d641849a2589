//! Playback of recorded raw files through the [`RawSource`] interface.
//!
//! The player is the inverse of the recorder: it validates the file header,
//! checks camera-model compatibility, then streams one frame per `read`
//! call, pacing itself with a configurable inter-frame sleep. Color
//! recordings carry a mono+color record pair per acquisition; the color
//! record is skipped because the color pipeline lives outside this crate.
//!
//! Frames come back as [`FramePayload::Raw`] so they take the same decoder
//! path a live encoded stream does.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::capture::recorder::{
    FrameRecordHeader, RawFileHeader, FRAME_RECORD_HEADER_SIZE, RAW_FILE_HEADER_SIZE,
};
use crate::capture::source::{DeviceOption, RawSource, RegisterIo};
use crate::error::{EngineError, EngineResult};
use crate::frame::{CameraModel, ColorMode, Frame, FramePayload, GrabMode};
use crate::params::ParameterValue;

/// Playback position report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayStatus {
    /// Index of the next frame `read` will deliver.
    pub position: u64,
    /// Total number of frames in the file.
    pub total: u64,
}

/// Streams frames out of a recorded file.
pub struct RawPlayer {
    path: PathBuf,
    header: RawFileHeader,
    reader: BufReader<File>,
    /// Sleep inserted before each delivered frame to pace playback.
    interval: Duration,
    position: u64,
    total: u64,
    running: bool,
}

impl RawPlayer {
    /// Opens a recording and verifies it matches the session's camera model.
    pub fn open(
        path: &Path,
        expected_model: CameraModel,
        interval: Duration,
    ) -> EngineResult<Self> {
        if !path.exists() {
            return Err(EngineError::FileNotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = RawFileHeader::read_from(&mut reader)?;
        if header.model != expected_model {
            return Err(EngineError::ModelMismatch {
                expected: expected_model,
                found: header.model,
            });
        }

        let total = count_frames(file_size, &header);
        info!(
            path = %path.display(),
            frames = total,
            width = header.max_width,
            height = header.max_height,
            "playback file opened"
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            reader,
            interval,
            position: 0,
            total,
            running: false,
        })
    }

    /// The file header, including the recording camera's calibration.
    pub fn header(&self) -> &RawFileHeader {
        &self.header
    }

    /// Current playback position.
    pub fn status(&self) -> PlayStatus {
        PlayStatus {
            position: self.position,
            total: self.total,
        }
    }

    /// Repositions playback at `frame_number`.
    pub fn seek(&mut self, frame_number: u64) -> EngineResult<()> {
        if frame_number > self.total {
            return Err(EngineError::InvalidParameter(format!(
                "seek to frame {frame_number} beyond end of file ({})",
                self.total
            )));
        }
        let offset = RAW_FILE_HEADER_SIZE + frame_number * self.acquisition_size();
        self.reader.seek(SeekFrom::Start(offset))?;
        self.position = frame_number;
        Ok(())
    }

    /// Bytes of one acquisition on disk: a mono record, plus a color record
    /// in color recordings.
    fn acquisition_size(&self) -> u64 {
        let record = FRAME_RECORD_HEADER_SIZE
            + (self.header.max_width * self.header.max_height * 2) as u64;
        match self.header.color {
            ColorMode::Mono => record,
            ColorMode::Color => record * 2,
        }
    }

    fn read_record(&mut self) -> EngineResult<(FrameRecordHeader, Vec<u8>)> {
        let record = FrameRecordHeader::read_from(&mut self.reader)?;
        let expected = (self.header.max_width * self.header.max_height * 2) as u32;
        if record.data_size != expected {
            return Err(EngineError::ReadFailed(format!(
                "record {} carries {} bytes, expected {}",
                record.index, record.data_size, expected
            )));
        }
        let mut data = vec![0u8; record.data_size as usize];
        std::io::Read::read_exact(&mut self.reader, &mut data)?;
        Ok((record, data))
    }
}

fn count_frames(file_size: u64, header: &RawFileHeader) -> u64 {
    let record = FRAME_RECORD_HEADER_SIZE + (header.max_width * header.max_height * 2) as u64;
    let acquisition = match header.color {
        ColorMode::Mono => record,
        ColorMode::Color => record * 2,
    };
    file_size.saturating_sub(RAW_FILE_HEADER_SIZE) / acquisition
}

impl RegisterIo for RawPlayer {
    fn read_register(&mut self, _wbuf: &[u8], _rbuf: &mut [u8]) -> EngineResult<()> {
        Err(EngineError::InvalidMode(
            "playback sources expose no device registers".to_string(),
        ))
    }

    fn write_register(&mut self, _wbuf: &[u8]) -> EngineResult<()> {
        Err(EngineError::InvalidMode(
            "playback sources expose no device registers".to_string(),
        ))
    }
}

impl RawSource for RawPlayer {
    fn open(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        self.running = false;
        Ok(())
    }

    fn start(&mut self, mode: GrabMode, color: ColorMode) -> EngineResult<()> {
        if mode != self.header.grab || color != self.header.color {
            return Err(EngineError::InvalidMode(format!(
                "file {} was recorded in {:?}/{:?}",
                self.path.display(),
                self.header.grab,
                self.header.color
            )));
        }
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
        if self.position >= self.total {
            return Err(EngineError::NoImage);
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        let (record, data) = self.read_record()?;
        if self.header.color == ColorMode::Color {
            // The color record of the pair is not processed here.
            let (_color_record, _color_data) = self.read_record()?;
        }
        self.position += 1;
        Ok(Frame {
            width: self.header.max_width,
            height: self.header.max_height,
            index: record.index,
            timestamp: Utc::now(),
            gain: record.gain,
            exposure: record.exposure,
            error_code: record.error_code,
            payload: FramePayload::Raw { packed: data },
        })
    }

    fn get_option(&mut self, option: DeviceOption) -> EngineResult<ParameterValue> {
        match option {
            DeviceOption::ShutterMode => Ok(ParameterValue::Shutter(self.header.shutter)),
            _ => Err(EngineError::InvalidMode(format!(
                "{option:?} is not available during playback"
            ))),
        }
    }

    fn set_option(&mut self, option: DeviceOption, _value: ParameterValue) -> EngineResult<()> {
        Err(EngineError::InvalidMode(format!(
            "{option:?} cannot be set during playback"
        )))
    }
}
