//! SSD block matching with sub-pixel refinement and back-matching.
//!
//! For every reference block the matcher scans the compare image over the
//! search width, tracking the best SSD, its two neighbors for the parabolic
//! sub-pixel fit, and the runner-up outside the immediate neighborhood.
//! Blocks whose best candidate sits on a search-range edge, or whose
//! contrast falls under the threshold, carry no disparity.
//!
//! With back-matching enabled the same search runs with the image roles
//! swapped, and a per-block vote over a small window either confirms the
//! forward disparity or discards it: windows dominated by missing reverse
//! matches are dropped outright, windows with enough forward/backward
//! agreement keep the forward value, everything else is invalidated.
//!
//! The image is split into horizontal bands processed on the shared
//! [`BandPool`]; band count does not change the result, only the wall-clock
//! time.

use tracing::warn;

use crate::frame::{GrayImage, SUBPIXEL_SCALE};
use crate::params::{BackMatchingParameters, MatchingParameters};
use crate::process::bands::{split_band_chunks, BandPool, ScopedJob};
use crate::process::{block_contrast, DisparityBuffers, StageGeometry};

/// Outcome of scanning one SSD profile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SsdSearch {
    /// Candidate with the lowest SSD.
    pub d_min: usize,
    /// Lowest SSD value.
    pub ssd_min: i32,
    /// Lowest SSD outside `[d_min - 1, d_min + 1]`; `i32::MAX` when the
    /// profile is too short to have one.
    pub ssd_next: i32,
    /// Parabolic sub-pixel offset; zero when the fit degenerates.
    pub subpixel: f32,
    /// False when the minimum sits on a profile edge.
    pub interior: bool,
}

/// Scans a precomputed SSD profile for its minimum, runner-up and sub-pixel
/// refinement.
pub(crate) fn scan_ssd_profile(profile: &[i32]) -> SsdSearch {
    let mut d_min = 0usize;
    let mut ssd_min = i32::MAX;
    for (d, &ssd) in profile.iter().enumerate() {
        if ssd < ssd_min {
            ssd_min = ssd;
            d_min = d;
        }
    }
    let mut ssd_next = i32::MAX;
    for (d, &ssd) in profile.iter().enumerate() {
        if d + 1 < d_min || d > d_min + 1 {
            ssd_next = ssd_next.min(ssd);
        }
    }

    let interior = d_min > 0 && d_min + 1 < profile.len();
    let subpixel = if interior {
        let s_minus = profile[d_min - 1];
        let s_plus = profile[d_min + 1];
        let denom = 2 * (s_minus - 2 * ssd_min + s_plus);
        if denom <= 0 {
            0.0
        } else {
            (s_minus - s_plus) as f32 / denom as f32
        }
    } else {
        0.0
    };
    SsdSearch {
        d_min,
        ssd_min,
        ssd_next,
        subpixel,
        interior,
    }
}

/// SSD between a block of `a` anchored at `ax` and a block of `b` anchored
/// at `bx`, both on row `y`.
#[inline]
fn block_ssd(
    a: &[u8],
    b: &[u8],
    img_w: usize,
    ax: usize,
    bx: usize,
    y: usize,
    mtc_h: usize,
    mtc_w: usize,
) -> i32 {
    let mut acc: i32 = 0;
    for j in 0..mtc_h {
        let a_row = (y + j) * img_w + ax;
        let b_row = (y + j) * img_w + bx;
        for i in 0..mtc_w {
            let diff = i32::from(a[a_row + i]) - i32::from(b[b_row + i]);
            acc += diff * diff;
        }
    }
    acc
}

/// SSD block matcher with optional bidirectional validation.
pub struct BlockMatcher {
    matching: MatchingParameters,
    back: BackMatchingParameters,
    crst_ofs: i32,
    /// Forward block disparity in pixels, `0.0` = invalid.
    fwd: Vec<f32>,
    /// Backward block disparity in pixels.
    bwd: Vec<f32>,
    /// Snapshot of `fwd` during the blend vote.
    fwd_snapshot: Vec<f32>,
    /// Block contrast of the reference image.
    contrast: Vec<i32>,
    use_opencl: bool,
    #[cfg(feature = "opencl")]
    gpu: Option<crate::process::opencl::GpuMatcher>,
}

impl BlockMatcher {
    /// Creates a matcher with buffers sized for `max_cells` grid cells.
    pub fn new(
        matching: MatchingParameters,
        back: BackMatchingParameters,
        crst_ofs: i32,
        max_cells: usize,
    ) -> Self {
        Self {
            matching,
            back,
            crst_ofs,
            fwd: vec![0.0; max_cells],
            bwd: vec![0.0; max_cells],
            fwd_snapshot: vec![0.0; max_cells],
            contrast: vec![0; max_cells],
            use_opencl: false,
            #[cfg(feature = "opencl")]
            gpu: None,
        }
    }

    /// Applies a new parameter record at a frame boundary.
    pub fn reconfigure(&mut self, matching: MatchingParameters, back: BackMatchingParameters) {
        self.matching = matching;
        self.back = back;
    }

    /// Enables or disables the OpenCL fast path.
    pub fn set_use_opencl(&mut self, use_opencl: bool) {
        self.use_opencl = use_opencl;
    }

    /// Geometry of the current parameter record.
    pub fn geometry(&self) -> StageGeometry {
        StageGeometry::from_matching(&self.matching)
    }

    /// Runs the full match on a rectified pair.
    pub fn compute(&mut self, reference: &GrayImage, compare: &GrayImage, pool: &BandPool) {
        let geom = self.geometry();

        #[cfg(feature = "opencl")]
        if self.use_opencl {
            if self.gpu.is_none() {
                match crate::process::opencl::GpuMatcher::create(&geom) {
                    Ok(gpu) => self.gpu = Some(gpu),
                    Err(e) => {
                        warn!(error = %e, "OpenCL matcher unavailable, using CPU path");
                        self.use_opencl = false;
                    }
                }
            }
            if let Some(gpu) = self.gpu.as_mut() {
                let run = gpu.compute(
                    &geom,
                    self.matching.crst_thr,
                    self.crst_ofs,
                    self.back.enabled,
                    &reference.data,
                    &compare.data,
                    &mut self.fwd,
                    &mut self.bwd,
                    &mut self.contrast,
                );
                match run {
                    Ok(()) => {
                        if self.back.enabled {
                            self.blend(&geom);
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "OpenCL matcher failed, falling back to CPU");
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

        self.compute_cpu(&geom, reference, compare, pool);
        if self.back.enabled {
            self.blend(&geom);
        }
    }

    fn compute_cpu(
        &mut self,
        geom: &StageGeometry,
        reference: &GrayImage,
        compare: &GrayImage,
        pool: &BandPool,
    ) {
        let rows = geom.rows();
        let cols = geom.cols();
        let cells = rows * cols;
        let crst_thr = self.matching.crst_thr;
        let crst_ofs = self.crst_ofs;
        let back_enabled = self.back.enabled;

        let ranges = BandPool::split_rows(rows, pool.band_count());
        let fwd_chunks = split_band_chunks(&mut self.fwd[..cells], &ranges, cols);
        let bwd_chunks = split_band_chunks(&mut self.bwd[..cells], &ranges, cols);
        let crst_chunks = split_band_chunks(&mut self.contrast[..cells], &ranges, cols);

        let geom = *geom;
        let reference = &reference.data;
        let compare = &compare.data;

        let jobs: Vec<ScopedJob<'_>> = ranges
            .iter()
            .zip(fwd_chunks)
            .zip(bwd_chunks)
            .zip(crst_chunks)
            .map(|(((&(j_start, j_end), fwd), bwd), crst)| {
                let job: ScopedJob<'_> = Box::new(move || {
                    match_band(
                        &geom, crst_thr, crst_ofs, back_enabled, reference, compare, fwd, bwd,
                        crst, j_start, j_end,
                    );
                });
                job
            })
            .collect();
        pool.run_scoped(jobs);
    }

    /// Per-block vote confirming forward disparities against the reverse
    /// match.
    fn blend(&mut self, geom: &StageGeometry) {
        let rows = geom.rows();
        let cols = geom.cols();
        let valid_cols = geom.valid_cols();
        let cells = rows * cols;
        self.fwd_snapshot[..cells].copy_from_slice(&self.fwd[..cells]);

        let window = self.back.eval_width;
        let eval_range = self.back.eval_range as f32;

        for j in 0..rows {
            for i in 0..valid_cols {
                let idx = j * cols + i;
                if self.fwd_snapshot[idx] == 0.0 {
                    continue;
                }
                let mut n_total = 0i32;
                let mut n_valid = 0i32;
                let mut n_zero = 0i32;
                for jj in j.saturating_sub(window)..=(j + window).min(rows - 1) {
                    for ii in i.saturating_sub(window)..=(i + window).min(valid_cols - 1) {
                        let f = self.fwd_snapshot[jj * cols + ii];
                        let b = self.bwd[jj * cols + ii];
                        n_total += 1;
                        if f == 0.0 || b == 0.0 {
                            n_zero += 1;
                        } else if (f - b).abs() <= eval_range {
                            n_valid += 1;
                        }
                    }
                }
                if n_zero * 100 >= self.back.zero_ratio * n_total {
                    self.fwd[idx] = 0.0;
                } else if n_valid * 100 >= self.back.valid_ratio * n_total {
                    // Forward disparity confirmed.
                } else {
                    self.fwd[idx] = 0.0;
                }
            }
        }
    }

    /// Copies the match result into the shared stage buffers; the matcher
    /// output is final (no separate averaging pass on this path).
    pub fn write_buffers(&self, geom: &StageGeometry, bufs: &mut DisparityBuffers) {
        let cells = geom.rows() * geom.cols();
        for i in 0..cells {
            let q10 = (self.fwd[i] * SUBPIXEL_SCALE as f32).round() as i32;
            bufs.blkval[i] = q10;
            bufs.avedsp[i] = q10 as f32;
            bufs.contrast[i] = self.contrast[i];
        }
    }
}

/// Matches every block of the band `[j_start, j_end)`.
///
/// Outputs are band-local slices; `fwd`/`bwd`/`crst` start at the band's
/// first block.
#[allow(clippy::too_many_arguments)]
fn match_band(
    geom: &StageGeometry,
    crst_thr: i32,
    crst_ofs: i32,
    back_enabled: bool,
    reference: &[u8],
    compare: &[u8],
    fwd: &mut [f32],
    bwd: &mut [f32],
    crst: &mut [i32],
    j_start: usize,
    j_end: usize,
) {
    let cols = geom.cols();
    let mut profile = vec![0i32; geom.depth];

    for jblk in j_start..j_end {
        let y = jblk * geom.blk_h;
        let row = (jblk - j_start) * cols;
        if y + geom.mtc_h > geom.img_h {
            for i in 0..cols {
                fwd[row + i] = 0.0;
                bwd[row + i] = 0.0;
                crst[row + i] = 0;
            }
            continue;
        }
        for iblk in 0..cols {
            let x = iblk * geom.blk_w;
            let idx = row + iblk;
            fwd[idx] = 0.0;
            bwd[idx] = 0.0;
            crst[idx] = 0;
            if x + geom.mtc_w > geom.img_w {
                continue;
            }

            let contrast = block_contrast(
                reference,
                geom.img_w,
                x,
                y,
                geom.mtc_h,
                geom.mtc_w,
                crst_ofs,
            );
            crst[idx] = contrast;

            // The shadow band has no full search range and stays invalid.
            if x + geom.mtc_w + geom.depth > geom.img_w {
                continue;
            }
            if contrast < crst_thr {
                continue;
            }

            for (d, slot) in profile.iter_mut().enumerate() {
                *slot = block_ssd(
                    reference,
                    compare,
                    geom.img_w,
                    x,
                    x + d,
                    y,
                    geom.mtc_h,
                    geom.mtc_w,
                );
            }
            let search = scan_ssd_profile(&profile);
            if search.interior {
                fwd[idx] = search.d_min as f32 + search.subpixel;
            }

            if back_enabled {
                // Reverse roles: compare block at x, candidates walk left
                // through the reference image.
                let range = (x + 1).min(geom.depth);
                if range >= 3 {
                    for (d, slot) in profile.iter_mut().take(range).enumerate() {
                        *slot = block_ssd(
                            compare,
                            reference,
                            geom.img_w,
                            x,
                            x - d,
                            y,
                            geom.mtc_h,
                            geom.mtc_w,
                        );
                    }
                    let back = scan_ssd_profile(&profile[..range]);
                    if back.interior {
                        bwd[idx] = back.d_min as f32 + back.subpixel;
                    }
                }
            }
        }
    }
}
