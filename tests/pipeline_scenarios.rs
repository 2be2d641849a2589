//! End-to-end pipeline scenarios against the synthetic source.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parallax_engine::capture::{RawSource, SyntheticSource};
use parallax_engine::params::{EngineParameters, ParameterStore};
use parallax_engine::{
    CameraCalibration, CameraModel, DisparityImage, EngineError, Frame, GrabMode, Pipeline,
    PipelineConfig, Rect, StartOptions,
};

/// Parameters for the 64x64 matcher scenarios.
fn matcher_params() -> EngineParameters {
    let mut params = EngineParameters::default();
    params.matching.img_h = 64;
    params.matching.img_w = 64;
    params.matching.depth = 32;
    params.matching.blk_h = 4;
    params.matching.blk_w = 4;
    params.matching.mtc_h = 4;
    params.matching.mtc_w = 4;
    params.matching.blk_ofs_x = 0;
    params.matching.blk_ofs_y = 0;
    params.matching.crst_thr = 0;
    params.back_matching.enabled = false;
    params.system.band_count = 2;
    params
}

/// Retries the disparity query until a frame has flowed through.
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

fn opened_synthetic(width: usize, height: usize, shift: usize) -> Box<SyntheticSource> {
    let mut source = Box::new(SyntheticSource::new(width, height, shift));
    source.open().expect("synthetic source always opens");
    source
}

#[test]
fn block_matching_session_recovers_uniform_shift() {
    let store = Arc::new(ParameterStore::new(matcher_params()));
    let mut config = PipelineConfig::new(CameraModel::Unknown, 64, 64);
    config.calibration = CameraCalibration {
        d_inf: 0.0,
        bf: 60.0,
        base_length: 0.1,
        dz: 0.0,
    };
    let mut pipeline = Pipeline::new(config, store).unwrap();

    pipeline
        .start(
            opened_synthetic(64, 64, 7),
            StartOptions::new(GrabMode::Corrected),
        )
        .unwrap();

    let mut out = DisparityImage::new(64, 64);
    next_disparity(&mut pipeline, &mut out);
    pipeline.stop();

    // Interior tile: block (8, 4) covers pixels (16..20, 32..36).
    assert_eq!(out.pixels[33 * 64 + 17], 7.0);
    // Visualization: round(7 * 255 / 32) = 56.
    assert_eq!(out.gray[33 * 64 + 17], 56);

    // The whole interior agrees.
    let stats = pipeline
        .get_area_statistics(Rect {
            x: 8,
            y: 8,
            width: 16,
            height: 48,
        })
        .unwrap();
    assert!(stats.valid_count > 0);
    assert!((stats.mean - 7.0).abs() < 0.01);
    assert!(stats.stdev < 0.01);

    // Depth follows the calibration constants.
    let (disparity, depth) = pipeline.get_position_depth(17, 33).unwrap();
    assert_eq!(disparity, 7.0);
    assert!((depth - 60.0 / 7.0).abs() < 1e-4);
}

#[test]
fn encoded_session_decodes_averages_and_completes() {
    let mut params = EngineParameters::default();
    params.matching.crst_thr = 0;
    params.system.band_count = 3;
    let store = Arc::new(ParameterStore::new(params));
    let mut pipeline =
        Pipeline::new(PipelineConfig::new(CameraModel::Unknown, 64, 64), Arc::clone(&store))
            .unwrap();

    pipeline
        .start(
            opened_synthetic(64, 64, 20),
            StartOptions::new(GrabMode::Parallax),
        )
        .unwrap();

    let mut out = DisparityImage::new(64, 64);
    next_disparity(&mut pipeline, &mut out);

    // Interior block (5, 4): pixels (16..20, 20..24) carry the FPGA value.
    assert_eq!(out.pixels[21 * 64 + 17], 20.0);
    // round(20 * 255 / 32) = 159.
    assert_eq!(out.gray[21 * 64 + 17], 159);

    // Raising the contrast threshold through the store lands at the next
    // frame boundary and rejects every block.
    store.set(|p| p.matching.crst_thr = 1_000_000).unwrap();
    next_disparity(&mut pipeline, &mut out);
    pipeline.stop();
    assert!(out.pixels.iter().all(|&v| v == 0.0));
}

#[test]
fn get_data_hands_out_raw_frames_in_order() {
    let store = Arc::new(ParameterStore::new(matcher_params()));
    let mut pipeline =
        Pipeline::new(PipelineConfig::new(CameraModel::Unknown, 64, 64), store).unwrap();
    pipeline
        .start(
            opened_synthetic(64, 64, 3),
            StartOptions::new(GrabMode::Corrected),
        )
        .unwrap();

    let mut previous: Option<u64> = None;
    let mut received = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while received < 4 {
        let mut frame = Frame::empty();
        match pipeline.get_data(&mut frame) {
            Ok(()) => {
                if let Some(prev) = previous {
                    assert!(frame.index > prev, "frame order violated");
                }
                previous = Some(frame.index);
                received += 1;
            }
            Err(EngineError::NoImage) => {
                assert!(Instant::now() < deadline, "no frames arrived");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("get_data failed: {e}"),
        }
    }
    pipeline.stop();
}

#[test]
fn block_grid_query_matches_pixel_output() {
    let store = Arc::new(ParameterStore::new(matcher_params()));
    let mut pipeline =
        Pipeline::new(PipelineConfig::new(CameraModel::Unknown, 64, 64), store).unwrap();
    pipeline
        .start(
            opened_synthetic(64, 64, 7),
            StartOptions::new(GrabMode::Corrected),
        )
        .unwrap();

    let mut grid = parallax_engine::BlockGrid::new(0, 0);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match pipeline.get_block_disparity(&mut grid) {
            Ok(()) => break,
            Err(EngineError::NoImage) => {
                assert!(Instant::now() < deadline, "no frame arrived in time");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("block query failed: {e}"),
        }
    }
    pipeline.stop();

    assert_eq!(grid.rows, 16);
    assert_eq!(grid.cols, 16);
    let interior = grid.disp_q10[8 * 16 + 4];
    assert!((interior - 7000).abs() <= 1, "interior block was {interior}");
    assert!(grid.contrast[8 * 16 + 4] > 0);
}

#[test]
fn dump_block_disparity_writes_csv() {
    let store = Arc::new(ParameterStore::new(matcher_params()));
    let mut pipeline =
        Pipeline::new(PipelineConfig::new(CameraModel::Unknown, 64, 64), store).unwrap();
    pipeline
        .start(
            opened_synthetic(64, 64, 7),
            StartOptions::new(GrabMode::Corrected),
        )
        .unwrap();
    let mut out = DisparityImage::new(64, 64);
    next_disparity(&mut pipeline, &mut out);
    pipeline.stop();

    let dir = tempfile::tempdir().unwrap();
    let path = pipeline.dump_block_disparity(dir.path()).unwrap();
    let text = std::fs::read_to_string(path).unwrap();
    // Header row plus one line per block row.
    assert_eq!(text.lines().count(), 17);
    assert!(text.contains(",7"));
}
