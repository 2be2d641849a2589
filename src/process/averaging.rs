//! Histogram-voting majority filter over the disparity block grid.
//!
//! Every block looks at a `(2*win_h+1) x (2*win_w+1)` neighborhood of the
//! pre-filter grid. Neighbor disparities vote into a 1024-bucket moving
//! integral histogram, weighted by their position relative to the center.
//! The histogram mode (tie runs resolved to their midpoint) spans an
//! acceptance window; the output is the weighted mean of the in-window
//! neighbors, subject to three ratio gates: enough valid neighbors at all,
//! enough of them inside the window, and a replacement gate for centers
//! whose own disparity sits outside the window.
//!
//! The filter reads a snapshot (`wrk`) of the input grid and writes the
//! grid in place, so band workers can run concurrently and the band count
//! never changes the result.

use tracing::warn;

use crate::frame::SUBPIXEL_SCALE;
use crate::params::AveragingParameters;
use crate::process::bands::{split_band_chunks, BandPool, ScopedJob};
use crate::process::{DisparityBuffers, StageGeometry};

/// Largest supported averaging window, 17x17 blocks.
pub const AVERAGING_BLOCKS_MAX: usize = 289;

/// Number of histogram buckets.
pub const HISTOGRAM_BUCKETS: usize = 1024;

/// The majority filter stage.
pub struct Averager {
    params: AveragingParameters,
    /// Snapshot of the input grid for the duration of one pass.
    wrk: Vec<i32>,
    use_opencl: bool,
    #[cfg(feature = "opencl")]
    gpu: Option<crate::process::opencl::GpuAverager>,
}

impl Averager {
    /// Creates an averager with a snapshot buffer for `max_cells` cells.
    pub fn new(params: AveragingParameters, max_cells: usize) -> Self {
        Self {
            params,
            wrk: vec![0; max_cells],
            use_opencl: false,
            #[cfg(feature = "opencl")]
            gpu: None,
        }
    }

    /// Applies a new parameter record at a frame boundary.
    pub fn reconfigure(&mut self, params: AveragingParameters) {
        self.params = params;
    }

    /// Enables or disables the OpenCL fast path.
    pub fn set_use_opencl(&mut self, use_opencl: bool) {
        self.use_opencl = use_opencl;
    }

    /// Runs the filter in place over `bufs`.
    pub fn average(&mut self, geom: &StageGeometry, bufs: &mut DisparityBuffers, pool: &BandPool) {
        if !self.params.enabled {
            return;
        }
        let rows = geom.rows();
        let cols = geom.cols();
        let cells = rows * cols;
        self.wrk[..cells].copy_from_slice(&bufs.blkval[..cells]);

        #[cfg(feature = "opencl")]
        if self.use_opencl {
            if self.gpu.is_none() {
                match crate::process::opencl::GpuAverager::create(geom) {
                    Ok(gpu) => self.gpu = Some(gpu),
                    Err(e) => {
                        warn!(error = %e, "OpenCL averager unavailable, using CPU path");
                        self.use_opencl = false;
                    }
                }
            }
            if let Some(gpu) = self.gpu.as_mut() {
                let run = gpu.compute(
                    geom,
                    &self.params,
                    &self.wrk[..cells],
                    &mut bufs.blkval[..cells],
                    &mut bufs.avedsp[..cells],
                );
                match run {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(error = %e, "OpenCL averager failed, falling back to CPU");
                        self.gpu = None;
                        self.use_opencl = false;
                    }
                }
            }
        }
        #[cfg(not(feature = "opencl"))]
        if self.use_opencl {
            warn!("built without the opencl feature, using CPU path");
            self.use_opencl = false;
        }

        let ranges = BandPool::split_rows(rows, pool.band_count());
        let blk_chunks = split_band_chunks(&mut bufs.blkval[..cells], &ranges, cols);
        let ave_chunks = split_band_chunks(&mut bufs.avedsp[..cells], &ranges, cols);

        let params = self.params;
        let geom = *geom;
        let wrk = &self.wrk[..cells];

        let jobs: Vec<ScopedJob<'_>> = ranges
            .iter()
            .zip(blk_chunks)
            .zip(ave_chunks)
            .map(|((&(j_start, j_end), blkval), avedsp)| {
                let job: ScopedJob<'_> = Box::new(move || {
                    average_band(&params, &geom, wrk, blkval, avedsp, j_start, j_end);
                });
                job
            })
            .collect();
        pool.run_scoped(jobs);
    }
}

/// Filters the band `[j_start, j_end)`; `blkval`/`avedsp` are band-local.
fn average_band(
    params: &AveragingParameters,
    geom: &StageGeometry,
    wrk: &[i32],
    blkval: &mut [i32],
    avedsp: &mut [f32],
    j_start: usize,
    j_end: usize,
) {
    let rows = geom.rows();
    let cols = geom.cols();
    let valid_cols = geom.valid_cols();
    let win_h = params.win_h;
    let win_w = params.win_w;

    // Position weight table indexed by jj^2 + ii^2 for |jj|,|ii| <= 1.
    let poswgt = [params.weight_center, params.weight_near, params.weight_round];

    let dspwdt = geom.depth as i32 * SUBPIXEL_SCALE;
    let bucket = dspwdt / HISTOGRAM_BUCKETS as i32 + 1;
    let n_buckets = (dspwdt / bucket) as usize;

    let mut integ = [0i32; HISTOGRAM_BUCKETS];
    let mut dspblks = [0i32; AVERAGING_BLOCKS_MAX];
    let mut wgtblks = [0i32; AVERAGING_BLOCKS_MAX];

    for jd in j_start..j_end {
        for id in 0..cols {
            let local = (jd - j_start) * cols + id;

            // The shadow band and the window margins carry no disparity.
            let margin = id >= valid_cols
                || jd < win_h
                || jd + win_h >= rows
                || id < win_w
                || id + win_w >= valid_cols;
            if margin {
                blkval[local] = 0;
                avedsp[local] = 0.0;
                continue;
            }

            let tgval = wrk[cols * jd + id];
            integ[..n_buckets].fill(0);
            let mut dspcnt = 0usize;
            let mut wgt_total = 0i32;
            let mut wgt_disp = 0i32;

            for j in jd - win_h..=jd + win_h {
                let jj = j as i32 - jd as i32;
                for i in id - win_w..=id + win_w {
                    let ii = i as i32 - id as i32;
                    let disp = wrk[cols * j + i];
                    let pos = (jj * jj + ii * ii) as usize;
                    let wgt = if pos < poswgt.len() { poswgt[pos] } else { 1 };
                    wgt_total += wgt;

                    if disp > SUBPIXEL_SCALE {
                        dspblks[dspcnt] = disp;
                        wgtblks[dspcnt] = wgt;
                        dspcnt += 1;
                        wgt_disp += wgt;

                        let start = ((disp - params.integ_range_q10) / bucket).max(0) as usize;
                        let end =
                            (((disp + params.integ_range_q10) / bucket) as usize).min(n_buckets - 1);
                        for slot in &mut integ[start..=end] {
                            *slot += wgt;
                        }
                    }
                }
            }

            let density = wgt_disp as f32 / wgt_total as f32 * 100.0;
            if density < params.disp_ratio as f32 {
                blkval[local] = 0;
                avedsp[local] = 0.0;
                continue;
            }

            // Histogram mode; a run of equal maxima resolves to its middle.
            let mut maxcnt = 0i32;
            let mut maxdsp = 0i32;
            let mut maxwnd = 0i32;
            let mut maxin = false;
            for (i, &count) in integ[..n_buckets].iter().enumerate() {
                if count > maxcnt {
                    maxcnt = count;
                    maxdsp = i as i32;
                    maxwnd = 0;
                    maxin = true;
                }
                if maxin {
                    if count == maxcnt {
                        maxwnd += 1;
                    } else {
                        maxin = false;
                    }
                }
            }
            maxdsp += (maxwnd - 1) / 2;

            let mode = maxdsp * bucket;
            let high = (mode + params.limit_range_q10).min(dspwdt - 1);
            let low = (mode - params.limit_range_q10).max(0);

            let mut sum = 0i64;
            let mut cnt = 0i32;
            for k in 0..dspcnt {
                if dspblks[k] >= low && dspblks[k] <= high {
                    sum += i64::from(dspblks[k]) * i64::from(wgtblks[k]);
                    cnt += wgtblks[k];
                }
            }
            let ave = if cnt != 0 { sum as f32 / cnt as f32 } else { 0.0 };

            // A center outside the accepted window survives only when the
            // window holds enough weight to replace it.
            let replace = cnt as f32 / wgt_total as f32 * 100.0;
            if (tgval < low || tgval > high) && replace < params.replace_ratio as f32 {
                blkval[local] = 0;
                avedsp[local] = 0.0;
                continue;
            }

            let ratio = cnt as f32 / wgt_disp as f32 * 100.0;
            if ratio >= params.valid_ratio as f32 {
                blkval[local] = ave as i32;
                avedsp[local] = ave;
            } else {
                blkval[local] = 0;
                avedsp[local] = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_geometry() -> StageGeometry {
        StageGeometry {
            img_h: 64,
            img_w: 96,
            blk_h: 4,
            blk_w: 4,
            mtc_h: 4,
            mtc_w: 4,
            ofs_x: 0,
            ofs_y: 0,
            depth: 32,
            shadow: 32,
        }
    }

    fn uniform_buffers(geom: &StageGeometry, q10: i32) -> DisparityBuffers {
        let mut bufs = DisparityBuffers::new(geom.rows() * geom.cols());
        bufs.blkval.fill(q10);
        for v in bufs.avedsp.iter_mut() {
            *v = q10 as f32;
        }
        bufs
    }

    fn small_params() -> AveragingParameters {
        AveragingParameters {
            win_h: 1,
            win_w: 1,
            ..AveragingParameters::default()
        }
    }

    #[test]
    fn test_uniform_grid_survives_with_its_value() {
        let geom = grid_geometry();
        let mut bufs = uniform_buffers(&geom, 7000);
        let mut averager = Averager::new(small_params(), geom.rows() * geom.cols());
        averager.average(&geom, &mut bufs, &BandPool::new(1));

        let cols = geom.cols();
        // Interior blocks keep the value; margins are invalidated.
        assert_eq!(bufs.blkval[5 * cols + 5], 7000);
        assert_eq!(bufs.blkval[0], 0);
        assert_eq!(bufs.blkval[5 * cols + (geom.valid_cols() - 1)], 0);
    }

    #[test]
    fn test_averaging_is_stable_on_its_own_output() {
        let geom = grid_geometry();
        let rows = geom.rows();
        let cols = geom.cols();
        let cells = rows * cols;
        let mut bufs = DisparityBuffers::new(cells);
        // A sloped plane: the symmetric window mean reproduces the center,
        // so a second pass must not move interior blocks.
        for jd in 0..rows {
            for id in 0..cols {
                bufs.blkval[jd * cols + id] = 6000 + 100 * id as i32 + 50 * jd as i32;
            }
        }
        let mut averager = Averager::new(small_params(), cells);
        averager.average(&geom, &mut bufs, &BandPool::new(1));
        let first: Vec<i32> = bufs.blkval.clone();

        averager.average(&geom, &mut bufs, &BandPool::new(1));
        // Away from the margin ring every window sees only first-pass
        // interior values.
        for jd in 2..rows - 2 {
            for id in 2..geom.valid_cols() - 2 {
                let a = first[jd * cols + id];
                let b = bufs.blkval[jd * cols + id];
                assert!((a - b).abs() <= 1, "block ({jd},{id}) moved from {a} to {b}");
            }
        }
    }

    #[test]
    fn test_sparse_grid_is_rejected_by_density_gate() {
        let geom = grid_geometry();
        let cells = geom.rows() * geom.cols();
        let mut bufs = DisparityBuffers::new(cells);
        // One valid block surrounded by nothing: 1/9 weighted density is
        // far below the 20 percent gate.
        let cols = geom.cols();
        bufs.blkval[5 * cols + 5] = 9000;
        let mut averager = Averager::new(small_params(), cells);
        averager.average(&geom, &mut bufs, &BandPool::new(1));
        assert_eq!(bufs.blkval[5 * cols + 5], 0);
    }

    #[test]
    fn test_outlier_center_is_replaced_by_neighborhood_mode() {
        let geom = grid_geometry();
        let cells = geom.rows() * geom.cols();
        let mut bufs = uniform_buffers(&geom, 10_000);
        let cols = geom.cols();
        bufs.blkval[6 * cols + 6] = 30_000;
        let mut averager = Averager::new(small_params(), cells);
        averager.average(&geom, &mut bufs, &BandPool::new(1));
        // Eight of nine window entries vote 10 px; the outlier center is
        // replaced by their mean.
        let out = bufs.blkval[6 * cols + 6];
        assert!((out - 10_000).abs() <= 1, "center came out as {out}");
    }

    #[test]
    fn test_band_count_does_not_change_output() {
        let geom = grid_geometry();
        let cells = geom.rows() * geom.cols();
        let mut outputs = Vec::new();
        for bands in [1, 5] {
            let mut bufs = DisparityBuffers::new(cells);
            for (i, v) in bufs.blkval.iter_mut().enumerate() {
                *v = if i % 7 == 0 { 0 } else { 6000 + (i % 11) as i32 * 100 };
            }
            let mut averager = Averager::new(small_params(), cells);
            averager.average(&geom, &mut bufs, &BandPool::new(bands));
            outputs.push(bufs.blkval.clone());
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn test_disabled_averaging_is_identity() {
        let geom = grid_geometry();
        let cells = geom.rows() * geom.cols();
        let mut bufs = uniform_buffers(&geom, 4000);
        let before = bufs.blkval.clone();
        let params = AveragingParameters {
            enabled: false,
            ..small_params()
        };
        let mut averager = Averager::new(params, cells);
        averager.average(&geom, &mut bufs, &BandPool::new(2));
        assert_eq!(bufs.blkval, before);
    }
}
