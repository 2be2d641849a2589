//! Session orchestration: capture into the ring, route each frame through
//! the processing stages, answer result queries.
//!
//! A [`Pipeline`] owns one engine instance end to end: the frame ring, the
//! capture worker, the band pool and every processing stage, plus the
//! buffers they work in. Multiple pipelines are independently
//! constructible; nothing here is process-global.
//!
//! Routing per frame:
//!
//! - encoded / raw payloads go through the decoder; with averaging enabled
//!   the block grid then passes the averager and the completer before the
//!   per-pixel expansion, otherwise the mask-based direct decode writes the
//!   pixels itself.
//! - rectified pairs go through the block matcher (whose back-matching
//!   blend already finalizes the grid) and then the same expansion.
//!
//! Parameter updates land at frame boundaries only; fatal errors
//! short-circuit a query while transient ones leave the previous output
//! untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::capture::engine::{CaptureEngine, CaptureOptions};
use crate::capture::player::RawPlayer;
use crate::capture::recorder::{RawFileHeader, Recorder, RecorderOptions};
use crate::capture::ring_buffer::{FrameRing, DEFAULT_RING_CAPACITY};
use crate::capture::source::RawSource;
use crate::error::{EngineError, EngineResult};
use crate::frame::{
    BlockGrid, CameraCalibration, CameraModel, ColorMode, DisparityImage, Frame, FramePayload,
    GrabMode, GrayImage, Rect, ShutterMode, SUBPIXEL_SCALE,
};
use crate::params::{EngineParameters, ParameterStore};
use crate::process::averaging::Averager;
use crate::process::bands::BandPool;
use crate::process::completion::Completer;
use crate::process::decoder::Decoder;
use crate::process::matching::BlockMatcher;
use crate::process::{
    contrast_offset, expand_to_image, export_grid, DisparityBuffers, StageGeometry,
};

/// Static session configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Camera model of the session; selects contrast offsets and recording
    /// compatibility.
    pub model: CameraModel,
    /// Maximum image width in pixels.
    pub width: usize,
    /// Maximum image height in pixels.
    pub height: usize,
    /// Frame ring capacity.
    pub ring_capacity: usize,
    /// Per-read wait of the capture worker.
    pub wait: Duration,
    /// Stereo calibration constants.
    pub calibration: CameraCalibration,
}

impl PipelineConfig {
    /// Standard configuration for a camera model and resolution.
    pub fn new(model: CameraModel, width: usize, height: usize) -> Self {
        Self {
            model,
            width,
            height,
            ring_capacity: DEFAULT_RING_CAPACITY,
            wait: Duration::from_millis(100),
            calibration: CameraCalibration::default(),
        }
    }
}

/// Per-session start options.
#[derive(Clone, Debug)]
pub struct StartOptions {
    /// Grab mode requested from the source.
    pub mode: GrabMode,
    /// Color mode requested from the source.
    pub color: ColorMode,
    /// Shutter mode, recorded in file headers and driving the double
    /// shutter merge.
    pub shutter: ShutterMode,
    /// Record the raw stream while capturing.
    pub record: Option<RecorderOptions>,
}

impl StartOptions {
    /// Plain mono capture in the given mode.
    pub fn new(mode: GrabMode) -> Self {
        Self {
            mode,
            color: ColorMode::Mono,
            shutter: ShutterMode::Single,
            record: None,
        }
    }
}

/// Statistics of the per-pixel disparity over a rectangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AreaStatistics {
    /// Smallest valid disparity.
    pub min: f32,
    /// Largest valid disparity.
    pub max: f32,
    /// Mean of the valid disparities.
    pub mean: f32,
    /// Standard deviation of the valid disparities.
    pub stdev: f32,
    /// Number of valid pixels in the rectangle.
    pub valid_count: usize,
}

/// One complete disparity engine instance.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<ParameterStore>,
    params: EngineParameters,
    ring: Arc<FrameRing>,
    capture: CaptureEngine,
    pool: BandPool,
    decoder: Decoder,
    matcher: BlockMatcher,
    averager: Averager,
    completer: Completer,
    bufs: DisparityBuffers,
    reference: GrayImage,
    compare: GrayImage,
    last_image: DisparityImage,
    last_geometry: Option<StageGeometry>,
    mode: GrabMode,
    running: bool,
}

impl Pipeline {
    /// Builds an engine with all buffers allocated at maximum resolution.
    pub fn new(config: PipelineConfig, store: Arc<ParameterStore>) -> EngineResult<Self> {
        let params = store.snapshot();
        params.validate()?;

        // Smallest supported block edge is 2, which bounds the grid size.
        let max_cells = (config.width / 2) * (config.height / 2);
        let max_dim = (config.width.max(config.height)) / 2;
        let ring = Arc::new(FrameRing::new(config.ring_capacity));
        let capture = CaptureEngine::new(Arc::clone(&ring));
        let pool = BandPool::new(params.system.band_count);

        let mut matcher = BlockMatcher::new(
            params.matching,
            params.back_matching,
            contrast_offset(config.model),
            max_cells,
        );
        matcher.set_use_opencl(params.system.use_opencl);
        let mut averager = Averager::new(params.averaging, max_cells);
        averager.set_use_opencl(params.system.use_opencl);
        let completer = Completer::new(
            params.completion,
            params.averaging.win_h,
            params.averaging.win_w,
            max_dim,
        );

        Ok(Self {
            decoder: Decoder::new(params.limit),
            matcher,
            averager,
            completer,
            bufs: DisparityBuffers::new(max_cells),
            reference: GrayImage::new(config.width, config.height),
            compare: GrayImage::new(config.width, config.height),
            last_image: DisparityImage::new(config.width, config.height),
            last_geometry: None,
            mode: GrabMode::Corrected,
            running: false,
            ring,
            capture,
            pool,
            params,
            store,
            config,
        })
    }

    /// Starts a capture session on the given source.
    pub fn start(&mut self, mut source: Box<dyn RawSource>, options: StartOptions) -> EngineResult<()> {
        if self.running {
            return Err(EngineError::GrabStartFailed("session already running".to_string()));
        }
        source.open()?;

        let recorder = match &options.record {
            Some(record_options) => {
                let header = RawFileHeader {
                    model: self.config.model,
                    grab: options.mode,
                    color: options.color,
                    shutter: options.shutter,
                    max_width: self.config.width,
                    max_height: self.config.height,
                    calibration: self.config.calibration,
                };
                Some(Recorder::start(record_options.clone(), header)?)
            }
            None => None,
        };

        let mut capture_options = CaptureOptions::new(options.mode, options.color);
        capture_options.wait = self.config.wait;
        capture_options.merge_double_shutter = options.shutter == ShutterMode::Double;
        self.capture.start(source, recorder, None, capture_options)?;
        self.mode = options.mode;
        self.running = true;
        Ok(())
    }

    /// Starts a playback session from a recorded file.
    ///
    /// The file header supplies the grab and color modes plus the recording
    /// camera's calibration constants.
    pub fn start_playback(&mut self, path: &Path, interval: Duration) -> EngineResult<()> {
        if self.running {
            return Err(EngineError::GrabStartFailed("session already running".to_string()));
        }
        let player = RawPlayer::open(path, self.config.model, interval)?;
        let header = *player.header();
        if header.max_width > self.config.width || header.max_height > self.config.height {
            return Err(EngineError::InvalidParameter(format!(
                "recording is {}x{}, engine allocated {}x{}",
                header.max_width, header.max_height, self.config.width, self.config.height
            )));
        }
        self.config.calibration = header.calibration;

        let mut capture_options = CaptureOptions::new(header.grab, header.color);
        capture_options.wait = self.config.wait;
        self.capture.start(Box::new(player), None, None, capture_options)?;
        self.mode = header.grab;
        self.running = true;
        Ok(())
    }

    /// Stops the session and releases the source.
    pub fn stop(&mut self) {
        if let Some(mut source) = self.capture.stop() {
            if let Err(e) = source.close() {
                tracing::warn!(error = %e, "source close failed");
            }
        }
        self.running = false;
    }

    /// True while a session is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Dequeues the next raw frame without processing it.
    pub fn get_data(&mut self, out: &mut Frame) -> EngineResult<()> {
        let Some((slot, _ts)) = self.ring.get_begin() else {
            return Err(EngineError::NoImage);
        };
        out.clone_from(&self.ring.slot(slot));
        self.ring.get_commit(slot);
        Ok(())
    }

    /// Processes the next frame and copies the per-pixel disparity out.
    ///
    /// Returns [`EngineError::NoImage`] when no frame is waiting; the
    /// previously produced output stays valid for the position queries.
    pub fn get_disparity(&mut self, out: &mut DisparityImage) -> EngineResult<()> {
        self.process_next()?;
        out.clone_from(&self.last_image);
        Ok(())
    }

    /// Processes the next frame and copies the block grid out.
    pub fn get_block_disparity(&mut self, out: &mut BlockGrid) -> EngineResult<()> {
        self.process_next()?;
        let geometry = self.last_geometry.ok_or(EngineError::NoImage)?;
        export_grid(&self.bufs, &geometry, out);
        Ok(())
    }

    /// Disparity and metric depth at a pixel of the last output.
    pub fn get_position_depth(&self, x: usize, y: usize) -> EngineResult<(f32, f32)> {
        let disparity = self.pixel_disparity(x, y)?;
        let calib = &self.config.calibration;
        Ok((disparity, calib.bf / (disparity + calib.d_inf)))
    }

    /// Metric 3D position at a pixel, pinhole model with the principal
    /// point at the image center.
    pub fn get_position_3d(&self, x: usize, y: usize) -> EngineResult<(f32, f32, f32)> {
        let disparity = self.pixel_disparity(x, y)?;
        let calib = &self.config.calibration;
        let denom = disparity + calib.d_inf;
        let z = calib.bf / denom;
        let cx = self.last_image.width as f32 / 2.0;
        let cy = self.last_image.height as f32 / 2.0;
        let x_m = (x as f32 - cx) * calib.base_length / denom;
        let y_m = (y as f32 - cy) * calib.base_length / denom;
        Ok((x_m, y_m, z))
    }

    /// Statistics of the per-pixel disparity over a rectangle of the last
    /// output.
    pub fn get_area_statistics(&self, rect: Rect) -> EngineResult<AreaStatistics> {
        let image = &self.last_image;
        if rect.x + rect.width > image.width || rect.y + rect.height > image.height {
            return Err(EngineError::InvalidParameter(format!(
                "rectangle {rect:?} outside {}x{}",
                image.width, image.height
            )));
        }
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut valid_count = 0usize;
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                let d = image.pixels[y * image.width + x];
                if d > 0.0 {
                    min = min.min(d);
                    max = max.max(d);
                    sum += f64::from(d);
                    sum_sq += f64::from(d) * f64::from(d);
                    valid_count += 1;
                }
            }
        }
        if valid_count == 0 {
            return Ok(AreaStatistics {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                stdev: 0.0,
                valid_count: 0,
            });
        }
        let mean = sum / valid_count as f64;
        let variance = (sum_sq / valid_count as f64 - mean * mean).max(0.0);
        Ok(AreaStatistics {
            min,
            max,
            mean: mean as f32,
            stdev: variance.sqrt() as f32,
            valid_count,
        })
    }

    /// Writes the last block grid as a CSV table for offline inspection.
    ///
    /// Columns are mirrored, matching the 3D-graph convention of the
    /// recording tools.
    pub fn dump_block_disparity(&self, directory: &Path) -> EngineResult<PathBuf> {
        let geometry = self.last_geometry.ok_or(EngineError::NoImage)?;
        std::fs::create_dir_all(directory)?;
        let name = format!("block_depth_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = directory.join(name);

        let rows = geometry.rows();
        let cols = geometry.cols();
        let mut text = String::new();
        for id in 0..cols {
            text.push_str(&format!(",{id}"));
        }
        text.push('\n');
        for jd in 0..rows {
            text.push_str(&format!("{jd}"));
            for id in 0..cols {
                let mirrored = jd * cols + (cols - 1 - id);
                let px = self.bufs.avedsp[mirrored] / SUBPIXEL_SCALE as f32;
                text.push_str(&format!(",{}", px as i32));
            }
            text.push('\n');
        }
        std::fs::write(&path, text)?;
        info!(path = %path.display(), "block disparity dumped");
        Ok(path)
    }

    fn pixel_disparity(&self, x: usize, y: usize) -> EngineResult<f32> {
        let image = &self.last_image;
        if x >= image.width || y >= image.height {
            return Err(EngineError::InvalidParameter(format!(
                "pixel ({x},{y}) outside {}x{}",
                image.width, image.height
            )));
        }
        let disparity = image.pixels[y * image.width + x];
        if disparity <= 0.0 {
            return Err(EngineError::GetDepthFailed);
        }
        Ok(disparity)
    }

    /// Applies pending parameters, dequeues one frame and runs it through
    /// the stages.
    fn process_next(&mut self) -> EngineResult<()> {
        self.apply_pending_parameters();

        let Some((slot, _ts)) = self.ring.get_begin() else {
            return Err(EngineError::NoImage);
        };
        let result = self.process_slot(slot);
        self.ring.get_commit(slot);
        result
    }

    fn process_slot(&mut self, slot: usize) -> EngineResult<()> {
        let frame = self.ring.slot(slot);
        if frame.width > self.config.width || frame.height > self.config.height {
            return Err(EngineError::InvalidParameter(format!(
                "frame is {}x{}, engine allocated {}x{}",
                frame.width, frame.height, self.config.width, self.config.height
            )));
        }

        match &frame.payload {
            FramePayload::Rectified { reference, compare } => {
                let geometry = self.matcher.geometry();
                if geometry.img_w != frame.width || geometry.img_h != frame.height {
                    return Err(EngineError::InvalidParameter(format!(
                        "matcher configured for {}x{}, frame is {}x{}",
                        geometry.img_w, geometry.img_h, frame.width, frame.height
                    )));
                }
                self.matcher.compute(reference, compare, &self.pool);
                self.matcher.write_buffers(&geometry, &mut self.bufs);
                expand_to_image(&self.bufs, &geometry, &mut self.last_image);
                self.last_geometry = Some(geometry);
            }
            FramePayload::Encoded { interleaved } | FramePayload::Raw { packed: interleaved } => {
                let width = frame.width;
                let height = frame.height;
                if self.reference.width != width || self.reference.height != height {
                    self.reference = GrayImage::new(width, height);
                    self.compare = GrayImage::new(width, height);
                }
                Decoder::split_interleaved(
                    interleaved,
                    width,
                    height,
                    &mut self.reference,
                    &mut self.compare,
                );
                drop(frame);

                if self.mode == GrabMode::Parallax {
                    self.process_encoded(width, height)?;
                } else {
                    // Corrected replay: the split pair takes the matcher
                    // path, exactly like a live rectified frame.
                    let geometry = self.matcher.geometry();
                    if geometry.img_w != width || geometry.img_h != height {
                        return Err(EngineError::InvalidParameter(format!(
                            "matcher configured for {}x{}, frame is {width}x{height}",
                            geometry.img_w, geometry.img_h
                        )));
                    }
                    self.matcher.compute(&self.reference, &self.compare, &self.pool);
                    self.matcher.write_buffers(&geometry, &mut self.bufs);
                    expand_to_image(&self.bufs, &geometry, &mut self.last_image);
                    self.last_geometry = Some(geometry);
                }
            }
            FramePayload::Empty => return Err(EngineError::NoImage),
        }
        Ok(())
    }

    /// Disparity-mode processing of the already split encoded stream.
    fn process_encoded(&mut self, width: usize, height: usize) -> EngineResult<()> {
        let geometry = StageGeometry::for_encoded(width, height);
        if self.params.averaging.enabled {
            self.decoder.extract_blocks(
                &self.compare.data,
                &self.reference,
                self.params.matching.crst_thr,
                contrast_offset(self.config.model),
                &geometry,
                &mut self.bufs,
            );
            self.averager.average(&geometry, &mut self.bufs, &self.pool);
            self.completer.complete(&geometry, &mut self.bufs);
            self.completer.fill_holes(&geometry, &mut self.bufs);
            expand_to_image(&self.bufs, &geometry, &mut self.last_image);
        } else {
            self.decoder.decode_direct(
                &self.compare.data,
                &geometry,
                &mut self.last_image,
                &mut self.bufs,
            );
        }
        self.last_geometry = Some(geometry);
        Ok(())
    }

    fn apply_pending_parameters(&mut self) {
        let Some(params) = self.store.take_pending() else {
            return;
        };
        info!("applying updated parameters at frame boundary");
        if params.system.band_count != self.params.system.band_count {
            self.pool = BandPool::new(params.system.band_count);
        }
        self.decoder.set_limit(params.limit);
        self.matcher.reconfigure(params.matching, params.back_matching);
        self.matcher.set_use_opencl(params.system.use_opencl);
        self.averager.reconfigure(params.averaging);
        self.averager.set_use_opencl(params.system.use_opencl);
        self.completer.reconfigure(
            params.completion,
            params.averaging.win_h,
            params.averaging.win_w,
        );
        self.params = params;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.running {
            self.stop();
        }
    }
}
