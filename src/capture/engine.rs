//! The capture worker: one dedicated thread pulling frames from a source
//! into the ring, with optional recording and calibration tee-offs.
//!
//! The loop is deliberately small: `read` -> merge (double shutter) ->
//! record -> publish. Stop is cooperative and observed within one read wait.
//! Transport errors are retried with a short backoff and only bubble after a
//! run of consecutive failures; `NoImage` and `Calibrating` are normal
//! transient outcomes and never terminate the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::recorder::Recorder;
use crate::capture::ring_buffer::FrameRing;
use crate::capture::source::RawSource;
use crate::error::{EngineError, EngineResult};
use crate::frame::{ColorMode, Frame, GrabMode};
use crate::process::decoder::combine_double_shutter;

/// Backoff between transport retries.
const TRANSPORT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Consumer of captured frames for camera self-calibration.
///
/// The calibration module lives outside this crate; it receives frames here
/// and talks back to the camera through
/// [`RegisterIo`](crate::capture::source::RegisterIo) handed to it
/// separately.
pub trait CalibrationFeed: Send {
    /// Offers one captured frame to the calibration estimator.
    fn feed(&mut self, frame: &Frame);
}

/// Capture loop policy.
#[derive(Clone, Copy, Debug)]
pub struct CaptureOptions {
    /// Grab mode requested from the source.
    pub mode: GrabMode,
    /// Color mode requested from the source.
    pub color: ColorMode,
    /// Per-read wait; bounds the stop latency.
    pub wait: Duration,
    /// Merge alternating long/short exposure pairs into one frame.
    pub merge_double_shutter: bool,
    /// Consecutive transport failures tolerated before the loop gives up.
    pub transport_retry_limit: u32,
}

impl CaptureOptions {
    /// Standard options for the given modes.
    pub fn new(mode: GrabMode, color: ColorMode) -> Self {
        Self {
            mode,
            color,
            wait: Duration::from_millis(100),
            merge_double_shutter: false,
            transport_retry_limit: 5,
        }
    }
}

/// Owns the capture worker thread.
pub struct CaptureEngine {
    ring: Arc<FrameRing>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<Box<dyn RawSource>>>,
}

impl CaptureEngine {
    /// Creates an engine publishing into `ring`.
    pub fn new(ring: Arc<FrameRing>) -> Self {
        Self {
            ring,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// True while the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Starts the grab on `source` and spawns the worker.
    ///
    /// The grab is started on the caller's thread so a
    /// [`EngineError::GrabStartFailed`] surfaces synchronously; from then on
    /// the source is owned by the worker until [`CaptureEngine::stop`].
    pub fn start(
        &mut self,
        mut source: Box<dyn RawSource>,
        recorder: Option<Recorder>,
        calibration: Option<Box<dyn CalibrationFeed>>,
        options: CaptureOptions,
    ) -> EngineResult<()> {
        if self.worker.is_some() {
            return Err(EngineError::GrabStartFailed(
                "capture already running".to_string(),
            ));
        }
        source.start(options.mode, options.color)?;

        self.stop_flag.store(false, Ordering::Release);
        let ring = Arc::clone(&self.ring);
        let stop = Arc::clone(&self.stop_flag);
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(source, recorder, calibration, ring, stop, options))?;
        self.worker = Some(handle);
        info!(mode = ?options.mode, color = ?options.color, "capture started");
        Ok(())
    }

    /// Requests a stop and joins the worker, handing the source back.
    ///
    /// Upper bound on latency: one read wait plus one frame of work.
    pub fn stop(&mut self) -> Option<Box<dyn RawSource>> {
        let handle = self.worker.take()?;
        self.stop_flag.store(true, Ordering::Release);
        match handle.join() {
            Ok(mut source) => {
                if let Err(e) = source.stop() {
                    warn!(error = %e, "source stop failed");
                }
                info!("capture stopped");
                Some(source)
            }
            Err(_) => {
                error!("capture worker panicked");
                None
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn capture_loop(
    mut source: Box<dyn RawSource>,
    mut recorder: Option<Recorder>,
    mut calibration: Option<Box<dyn CalibrationFeed>>,
    ring: Arc<FrameRing>,
    stop: Arc<AtomicBool>,
    options: CaptureOptions,
) -> Box<dyn RawSource> {
    let mut transport_failures = 0u32;
    let mut pending_half: Option<Frame> = None;

    while !stop.load(Ordering::Acquire) {
        let frame = match source.read(options.wait) {
            Ok(frame) => {
                transport_failures = 0;
                frame
            }
            Err(EngineError::NoImage) | Err(EngineError::Calibrating) => continue,
            Err(EngineError::Transport(msg)) => {
                transport_failures += 1;
                if transport_failures >= options.transport_retry_limit {
                    error!(failures = transport_failures, error = %msg, "transport gave up");
                    break;
                }
                warn!(attempt = transport_failures, error = %msg, "transport error, retrying");
                std::thread::sleep(TRANSPORT_RETRY_BACKOFF);
                continue;
            }
            Err(e) => {
                error!(error = %e, "capture read failed");
                break;
            }
        };

        let frame = if options.merge_double_shutter {
            match pending_half.take() {
                None => {
                    pending_half = Some(frame);
                    continue;
                }
                Some(previous) => {
                    if previous.exposure >= frame.exposure {
                        combine_double_shutter(&previous, &frame)
                    } else {
                        combine_double_shutter(&frame, &previous)
                    }
                }
            }
        } else {
            frame
        };

        if let Some(recorder) = recorder.as_mut() {
            // Recording failures must not interrupt capture; append already
            // logged the details.
            let _ = recorder.append(&frame);
        }
        if let Some(calibration) = calibration.as_mut() {
            calibration.feed(&frame);
        }

        publish(&ring, frame);
    }

    if let Some(mut recorder) = recorder.take() {
        if let Err(e) = recorder.stop() {
            warn!(error = %e, "recorder close failed");
        }
    }
    source
}

fn publish(ring: &FrameRing, frame: Frame) {
    let Some(slot) = ring.put_begin() else {
        debug!("every ring slot pinned, frame dropped");
        return;
    };
    {
        let mut target = ring.slot(slot);
        *target = frame;
    }
    ring.put_commit(slot, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ring_buffer::DEFAULT_RING_CAPACITY;
    use crate::capture::source::{RegisterIo, SyntheticSource};
    use crate::error::EngineResult;
    use crate::frame::FramePayload;
    use crate::params::ParameterValue;
    use std::sync::Mutex;

    fn drain_indices(ring: &FrameRing) -> Vec<u64> {
        let mut indices = Vec::new();
        while let Some((slot, _)) = ring.get_begin() {
            indices.push(ring.slot(slot).index);
            ring.get_commit(slot);
        }
        indices
    }

    fn wait_for_frames(ring: &FrameRing, at_least: usize) {
        for _ in 0..500 {
            if ring.len() >= at_least {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_frames_arrive_in_source_order() {
        let ring = Arc::new(FrameRing::new(DEFAULT_RING_CAPACITY));
        let mut engine = CaptureEngine::new(Arc::clone(&ring));

        let mut source = Box::new(SyntheticSource::new(16, 16, 2).with_frame_limit(5));
        source.open().unwrap();
        engine
            .start(
                source,
                None,
                None,
                CaptureOptions::new(GrabMode::Corrected, ColorMode::Mono),
            )
            .unwrap();

        wait_for_frames(&ring, 5);
        let _ = engine.stop();
        let indices = drain_indices(&ring);
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stop_is_observed_and_returns_source() {
        let ring = Arc::new(FrameRing::new(4));
        let mut engine = CaptureEngine::new(Arc::clone(&ring));

        let mut source = Box::new(SyntheticSource::new(16, 16, 2));
        source.open().unwrap();
        engine
            .start(
                source,
                None,
                None,
                CaptureOptions::new(GrabMode::Corrected, ColorMode::Mono),
            )
            .unwrap();
        wait_for_frames(&ring, 1);
        assert!(engine.is_running());
        let source = engine.stop();
        assert!(source.is_some());
        assert!(!engine.is_running());
    }

    /// Source whose transport always fails, for retry accounting.
    struct BrokenSource {
        reads: Arc<Mutex<u32>>,
    }

    impl RegisterIo for BrokenSource {
        fn read_register(&mut self, _w: &[u8], _r: &mut [u8]) -> EngineResult<()> {
            Ok(())
        }
        fn write_register(&mut self, _w: &[u8]) -> EngineResult<()> {
            Ok(())
        }
    }

    impl RawSource for BrokenSource {
        fn open(&mut self) -> EngineResult<()> {
            Ok(())
        }
        fn close(&mut self) -> EngineResult<()> {
            Ok(())
        }
        fn start(&mut self, _mode: GrabMode, _color: ColorMode) -> EngineResult<()> {
            Ok(())
        }
        fn stop(&mut self) -> EngineResult<()> {
            Ok(())
        }
        fn read(&mut self, _wait: Duration) -> EngineResult<Frame> {
            *self.reads.lock().unwrap() += 1;
            Err(EngineError::Transport("usb pipe stalled".to_string()))
        }
        fn get_option(
            &mut self,
            _option: crate::capture::source::DeviceOption,
        ) -> EngineResult<ParameterValue> {
            Err(EngineError::InvalidParameter("none".to_string()))
        }
        fn set_option(
            &mut self,
            _option: crate::capture::source::DeviceOption,
            _value: ParameterValue,
        ) -> EngineResult<()> {
            Err(EngineError::InvalidParameter("none".to_string()))
        }
    }

    #[test]
    fn test_transport_errors_bubble_after_retries() {
        let ring = Arc::new(FrameRing::new(4));
        let mut engine = CaptureEngine::new(Arc::clone(&ring));
        let reads = Arc::new(Mutex::new(0));
        let source = Box::new(BrokenSource {
            reads: Arc::clone(&reads),
        });
        let mut options = CaptureOptions::new(GrabMode::Corrected, ColorMode::Mono);
        options.transport_retry_limit = 3;
        engine.start(source, None, None, options).unwrap();

        // The loop must terminate on its own after three failed reads.
        for _ in 0..500 {
            if *reads.lock().unwrap() >= 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let _ = engine.stop();
        assert_eq!(*reads.lock().unwrap(), 3);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_double_shutter_pairs_are_merged() {
        let ring = Arc::new(FrameRing::new(DEFAULT_RING_CAPACITY));
        let mut engine = CaptureEngine::new(Arc::clone(&ring));

        let mut source = Box::new(SyntheticSource::new(16, 16, 2).with_frame_limit(6));
        source.open().unwrap();
        source
            .set_option(
                crate::capture::source::DeviceOption::ShutterMode,
                ParameterValue::Shutter(crate::frame::ShutterMode::Double),
            )
            .unwrap();
        let mut options = CaptureOptions::new(GrabMode::Corrected, ColorMode::Mono);
        options.merge_double_shutter = true;
        engine.start(source, None, None, options).unwrap();

        wait_for_frames(&ring, 3);
        let _ = engine.stop();
        let mut merged = 0;
        while let Some((slot, _)) = ring.get_begin() {
            let frame = ring.slot(slot);
            assert!(matches!(frame.payload, FramePayload::Rectified { .. }));
            drop(frame);
            ring.get_commit(slot);
            merged += 1;
        }
        // Six captures pair down to three merged frames.
        assert_eq!(merged, 3);
    }
}
