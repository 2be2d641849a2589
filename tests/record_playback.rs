//! Recording a live session and playing it back through the decoder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parallax_engine::capture::{RawPlayer, RawSource, RecorderOptions, SyntheticSource};
use parallax_engine::params::{EngineParameters, ParameterStore};
use parallax_engine::{
    CameraModel, DisparityImage, EngineError, GrabMode, Pipeline, PipelineConfig, StartOptions,
};

fn next_disparity(pipeline: &mut Pipeline, out: &mut DisparityImage) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match pipeline.get_disparity(out) {
            Ok(()) => return,
            Err(EngineError::NoImage) => {
                assert!(Instant::now() < deadline, "no frame arrived in time");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("disparity query failed: {e}"),
        }
    }
}

fn find_recording(dir: &std::path::Path) -> PathBuf {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.extension().is_some_and(|ext| ext == "dat"))
        .expect("a record file was written")
}

fn engine_params() -> EngineParameters {
    let mut params = EngineParameters::default();
    params.matching.crst_thr = 0;
    params.system.band_count = 2;
    params
}

#[test]
fn recorded_session_plays_back_identically() {
    let record_dir = tempfile::tempdir().unwrap();

    // Live session with recording enabled.
    let store = Arc::new(ParameterStore::new(engine_params()));
    let mut live =
        Pipeline::new(PipelineConfig::new(CameraModel::Unknown, 64, 64), store).unwrap();
    let mut source = Box::new(SyntheticSource::new(64, 64, 20).with_frame_limit(10));
    source.open().unwrap();

    let mut options = StartOptions::new(GrabMode::Parallax);
    options.record = Some(RecorderOptions::new(record_dir.path()).without_capacity_checks());
    live.start(source, options).unwrap();

    let mut live_out = DisparityImage::new(64, 64);
    next_disparity(&mut live, &mut live_out);
    // Give the worker time to drain the remaining frames into the file.
    std::thread::sleep(Duration::from_millis(100));
    live.stop();

    let recording = find_recording(record_dir.path());

    // The file is a well-formed session on its own.
    let player = RawPlayer::open(&recording, CameraModel::Unknown, Duration::ZERO).unwrap();
    assert!(player.status().total > 0);
    assert_eq!(player.header().grab, GrabMode::Parallax);
    assert_eq!(player.header().max_width, 64);

    // Playback session produces the same disparities.
    let store = Arc::new(ParameterStore::new(engine_params()));
    let mut replay =
        Pipeline::new(PipelineConfig::new(CameraModel::Unknown, 64, 64), store).unwrap();
    replay.start_playback(&recording, Duration::ZERO).unwrap();

    let mut replay_out = DisparityImage::new(64, 64);
    next_disparity(&mut replay, &mut replay_out);
    replay.stop();

    assert_eq!(replay_out.pixels, live_out.pixels);
    assert_eq!(replay_out.gray, live_out.gray);
    assert_eq!(replay_out.pixels[21 * 64 + 17], 20.0);
}

#[test]
fn playback_rejects_wrong_camera_model() {
    let record_dir = tempfile::tempdir().unwrap();

    let store = Arc::new(ParameterStore::new(engine_params()));
    let mut live =
        Pipeline::new(PipelineConfig::new(CameraModel::Unknown, 64, 64), store).unwrap();
    let mut source = Box::new(SyntheticSource::new(64, 64, 20).with_frame_limit(4));
    source.open().unwrap();
    let mut options = StartOptions::new(GrabMode::Parallax);
    options.record = Some(RecorderOptions::new(record_dir.path()).without_capacity_checks());
    live.start(source, options).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    live.stop();

    let recording = find_recording(record_dir.path());
    let store = Arc::new(ParameterStore::new(engine_params()));
    let mut replay =
        Pipeline::new(PipelineConfig::new(CameraModel::Vm, 64, 64), store).unwrap();
    assert!(matches!(
        replay.start_playback(&recording, Duration::ZERO),
        Err(EngineError::ModelMismatch { .. })
    ));

    let missing = record_dir.path().join("not_there.dat");
    assert!(matches!(
        replay.start_playback(&missing, Duration::ZERO),
        Err(EngineError::FileNotFound(_))
    ));
}
