//! Four-direction hole completion over the disparity block grid.
//!
//! Each direction (horizontal, vertical, diagonal-down, diagonal-up) scans
//! the grid twice. The forward walk records, at every invalid block, the
//! last valid upstream disparity and the distance to it. The backward walk
//! then closes each gap bounded by two valid disparities, gated by the
//! endpoint floor, the span-vs-disparity budget, the slope limit and the
//! contrast ceiling, writing the distance-weighted interpolation of the two
//! endpoints.
//!
//! A scan reaching the image border inside a run of invalids seeds a
//! virtual endpoint: the first valid disparity scaled by the border ratio
//! of that direction, which tapers interpolation toward the edge.
//!
//! Hole-fill mode relaxes the contrast gate and bounds the gap by an
//! absolute width instead of the disparity budget; it runs as a second pass
//! with two extra horizontal and vertical sweeps to converge on large
//! holes.

use crate::frame::SUBPIXEL_SCALE;
use crate::params::CompletionParameters;
use crate::process::{DisparityBuffers, StageGeometry};

/// The completion stage with its per-scan scratch line.
pub struct Completer {
    params: CompletionParameters,
    /// Vertical scan offset; mirrors the averaging window height.
    win_h: usize,
    /// Horizontal scan offset; mirrors the averaging window width.
    win_w: usize,
    /// Inherited disparity per scratch cell (integer sub-pixel).
    blkcmp: Vec<i32>,
    /// Inherited disparity per scratch cell (float sub-pixel).
    avecmp: Vec<f32>,
    /// Distance since the last valid block per scratch cell.
    wgtcmp: Vec<i32>,
}

impl Completer {
    /// Creates a completer for grids up to `max_dim` blocks per axis.
    ///
    /// `win_h`/`win_w` are the averaging window offsets; completion scans
    /// start inside the margins the averager invalidated.
    pub fn new(params: CompletionParameters, win_h: usize, win_w: usize, max_dim: usize) -> Self {
        Self {
            params,
            win_h,
            win_w,
            blkcmp: vec![0; max_dim + 2],
            avecmp: vec![0.0; max_dim + 2],
            wgtcmp: vec![0; max_dim + 2],
        }
    }

    /// Applies a new parameter record at a frame boundary.
    pub fn reconfigure(&mut self, params: CompletionParameters, win_h: usize, win_w: usize) {
        self.params = params;
        self.win_h = win_h;
        self.win_w = win_w;
    }

    /// Pre-fill pass: vertical, horizontal, diagonal-down, diagonal-up.
    pub fn complete(&mut self, geom: &StageGeometry, bufs: &mut DisparityBuffers) {
        if !self.params.enabled {
            return;
        }
        self.scan_vertical(geom, bufs, false);
        self.scan_horizontal(geom, bufs, false);
        self.scan_diagonal_down(geom, bufs, false);
        self.scan_diagonal_up(geom, bufs, false);
    }

    /// Hole-filling pass with the extra convergence sweeps.
    pub fn fill_holes(&mut self, geom: &StageGeometry, bufs: &mut DisparityBuffers) {
        if !self.params.enabled || !self.params.hole_fill {
            return;
        }
        self.scan_horizontal(geom, bufs, true);
        self.scan_vertical(geom, bufs, true);
        self.scan_diagonal_down(geom, bufs, true);
        self.scan_diagonal_up(geom, bufs, true);
        self.scan_horizontal(geom, bufs, true);
        self.scan_vertical(geom, bufs, true);
    }

    fn scan_horizontal(
        &mut self,
        geom: &StageGeometry,
        bufs: &mut DisparityBuffers,
        holefill: bool,
    ) {
        let je = geom.completion_rows();
        let ie = geom.completion_cols();
        let vrt = self.win_h;
        let hzt = self.win_w;
        if je <= 2 * vrt || ie <= 2 * hzt + 1 {
            return;
        }
        let cols = geom.cols();
        let span = geom.blk_w as f64;
        let (inside, round) = (self.params.ratio_inside, self.params.ratio_round);

        for jd in vrt..je - vrt {
            for id in hzt..ie - hzt {
                self.forward(cols, id, hzt, jd, id, bufs);
            }
            let stid = ie - hzt - 1;
            for id in (hzt..=stid).rev() {
                self.backward(cols, id, stid, jd, id, bufs, holefill, span, inside, round, round);
            }
        }
    }

    fn scan_vertical(
        &mut self,
        geom: &StageGeometry,
        bufs: &mut DisparityBuffers,
        holefill: bool,
    ) {
        let je = geom.completion_rows();
        let ie = geom.completion_cols();
        let vrt = self.win_h;
        let hzt = self.win_w;
        if je <= 2 * vrt + 1 || ie <= 2 * hzt {
            return;
        }
        let cols = geom.cols();
        let span = geom.blk_h as f64;
        let (inside, round, bottom) = (
            self.params.ratio_inside,
            self.params.ratio_round,
            self.params.ratio_bottom,
        );

        for id in hzt..ie - hzt {
            for jd in vrt..je - vrt {
                self.forward(cols, jd, vrt, jd, id, bufs);
            }
            let stjd = je - vrt - 1;
            for jd in (vrt..=stjd).rev() {
                self.backward(cols, jd, stjd, jd, id, bufs, holefill, span, inside, bottom, round);
            }
        }
    }

    fn scan_diagonal_down(
        &mut self,
        geom: &StageGeometry,
        bufs: &mut DisparityBuffers,
        holefill: bool,
    ) {
        let je = geom.completion_rows() as isize;
        let ie = geom.completion_cols() as isize;
        let vrt = self.win_h as isize;
        let hzt = self.win_w as isize;
        if je <= 2 * vrt + 1 || ie <= 2 * hzt + 1 {
            return;
        }
        let cols = geom.cols();
        let span = geom.block_diagonal();
        let (inside, round, bottom) = (
            self.params.ratio_inside,
            self.params.ratio_round,
            self.params.ratio_bottom,
        );

        // Scan heads walk the bottom edge first, then the right edge.
        let mut along_edge = true;
        let mut idd = hzt - 1;
        let mut jdd = vrt;
        let mut headrt = bottom;

        for _ in 0..(je + ie) {
            if along_edge {
                jdd = vrt;
                idd += 1;
                if idd > ie - (hzt + 1) {
                    along_edge = false;
                }
            } else {
                jdd += 1;
                if jdd > je - (vrt + 1) {
                    break;
                }
                idd = hzt;
                headrt = round;
            }

            let mut jd = jdd;
            let mut id = idd;
            while jd < je - vrt && id < ie - hzt {
                self.forward(cols, id as usize, idd as usize, jd as usize, id as usize, bufs);
                jd += 1;
                id += 1;
            }
            let stid = id - 1;
            jd -= 1;
            id = stid;
            while jd >= vrt && id >= hzt {
                self.backward(
                    cols,
                    id as usize,
                    stid as usize,
                    jd as usize,
                    id as usize,
                    bufs,
                    holefill,
                    span,
                    inside,
                    headrt,
                    round,
                );
                jd -= 1;
                id -= 1;
            }
        }
    }

    fn scan_diagonal_up(
        &mut self,
        geom: &StageGeometry,
        bufs: &mut DisparityBuffers,
        holefill: bool,
    ) {
        let je = geom.completion_rows() as isize;
        let ie = geom.completion_cols() as isize;
        let vrt = self.win_h as isize;
        let hzt = self.win_w as isize;
        if je <= 2 * vrt + 1 || ie <= 2 * hzt + 1 {
            return;
        }
        let cols = geom.cols();
        let span = geom.block_diagonal();
        let (inside, round, bottom) = (
            self.params.ratio_inside,
            self.params.ratio_round,
            self.params.ratio_bottom,
        );

        // Scan heads walk the bottom edge first, then the far column upward.
        let mut along_edge = true;
        let mut idd = hzt - 1;
        let mut jdd = vrt;
        let mut headrt = bottom;

        for _ in 0..(je + ie) {
            if along_edge {
                jdd = vrt;
                idd += 1;
                if idd > ie - (hzt + 1) {
                    along_edge = false;
                }
            } else {
                jdd += 1;
                if jdd > je - (vrt + 1) {
                    break;
                }
                idd = ie - (hzt + 1);
                headrt = round;
            }

            let mut jd = jdd;
            let mut id = idd;
            while jd < je - vrt && id >= hzt {
                self.forward(cols, jd as usize, jdd as usize, jd as usize, id as usize, bufs);
                jd += 1;
                id -= 1;
            }
            let stjd = jd - 1;
            jd = stjd;
            id += 1;
            while jd >= vrt && id < ie - hzt {
                self.backward(
                    cols,
                    jd as usize,
                    stjd as usize,
                    jd as usize,
                    id as usize,
                    bufs,
                    holefill,
                    span,
                    inside,
                    headrt,
                    bottom,
                );
                jd -= 1;
                id += 1;
            }
        }
    }

    /// Ascending walk: inherit the last valid disparity and count the
    /// distance since it.
    fn forward(
        &mut self,
        cols: usize,
        ii: usize,
        sti: usize,
        jd: usize,
        id: usize,
        bufs: &DisparityBuffers,
    ) {
        let idx = cols * jd + id;
        self.wgtcmp[ii] = 0;
        self.blkcmp[ii] = bufs.blkval[idx];
        self.avecmp[ii] = bufs.avedsp[idx];

        if ii != sti {
            if self.blkcmp[ii] == 0 {
                if self.blkcmp[ii - 1] > 0 {
                    // Inside or at the head of a gap: inherit and grow the
                    // distance.
                    self.wgtcmp[ii] = self.wgtcmp[ii - 1] + 1;
                    self.blkcmp[ii] = self.blkcmp[ii - 1];
                    self.avecmp[ii] = self.avecmp[ii - 1];
                } else if self.wgtcmp[ii - 1] > 0 {
                    // Leading run with no upstream valid yet.
                    self.wgtcmp[ii] = self.wgtcmp[ii - 1] + 1;
                }
            }
        } else if self.blkcmp[ii] == 0 {
            self.wgtcmp[ii] = 1;
        }
    }

    /// Descending walk: close gaps between the inherited forward value and
    /// the value walking in from behind.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &mut self,
        cols: usize,
        ii: usize,
        sti: usize,
        jd: usize,
        id: usize,
        bufs: &mut DisparityBuffers,
        holefill: bool,
        blk_span: f64,
        midrt: f64,
        toprt: f64,
        btmrt: f64,
    ) {
        let subpix = f64::from(SUBPIXEL_SCALE);

        if ii == sti && self.wgtcmp[ii] > 0 {
            // The scan ends inside a gap: seed a virtual endpoint whose
            // weight tapers the interpolation toward the border.
            self.wgtcmp[ii + 1] =
                (f64::from(self.blkcmp[ii]) / subpix / blk_span * (2.0 * midrt - btmrt)) as i32;
            self.blkcmp[ii + 1] = self.blkcmp[ii];
            self.avecmp[ii + 1] = self.avecmp[ii];
        }

        let mut wgttmp = self.wgtcmp[ii + 1];
        let blktmp = self.blkcmp[ii + 1];
        let avetmp = self.avecmp[ii + 1];

        if self.blkcmp[ii] == 0 && self.wgtcmp[ii] > 0 {
            // Leading run: adopt the backward value; its virtual weight
            // tapers toward this border too.
            self.blkcmp[ii] = blktmp;
            self.avecmp[ii] = avetmp;
            if wgttmp == 0 {
                wgttmp = (f64::from(blktmp) / subpix / blk_span * (2.0 * midrt - toprt)) as i32;
            }
        }

        if self.blkcmp[ii] > 0 && self.wgtcmp[ii] > 0 {
            wgttmp += 1;

            // Interpolate weak-texture blocks only, unless hole-filling.
            if holefill || bufs.contrast[cols * jd + id] <= self.params.contrast_limit {
                let low = self.params.low_limit_px * subpix;
                if f64::from(blktmp) >= low && f64::from(self.blkcmp[ii]) >= low {
                    let rng = f64::from(wgttmp + self.wgtcmp[ii]) * blk_span;
                    let rng_bwd = f64::from(blktmp) * midrt / subpix;
                    let rng_fwd = f64::from(self.blkcmp[ii]) * midrt / subpix;

                    let span_ok = if holefill {
                        rng < self.params.hole_size_px + blk_span
                    } else {
                        rng <= rng_bwd + rng_fwd
                    };
                    if span_ok {
                        let diff = f64::from((blktmp - self.blkcmp[ii]).abs() / SUBPIXEL_SCALE);
                        let slope = diff / rng;
                        if slope < self.params.slope_limit {
                            let dsp_bwd = avetmp;
                            let dsp_fwd = self.avecmp[ii];
                            let value = (dsp_fwd * wgttmp as f32
                                + dsp_bwd * self.wgtcmp[ii] as f32)
                                / (wgttmp + self.wgtcmp[ii]) as f32;
                            bufs.blkval[cols * jd + id] = value as i32;
                            bufs.avedsp[cols * jd + id] = value;
                        }
                    }
                }
            }
            self.wgtcmp[ii] = wgttmp;
            self.blkcmp[ii] = blktmp;
            self.avecmp[ii] = avetmp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 9x3 block grid with no scan offsets and no shadow.
    fn flat_geometry() -> StageGeometry {
        StageGeometry {
            img_h: 12,
            img_w: 40,
            blk_h: 4,
            blk_w: 4,
            mtc_h: 4,
            mtc_w: 4,
            ofs_x: 0,
            ofs_y: 0,
            depth: 64,
            shadow: 0,
        }
    }

    fn params() -> CompletionParameters {
        CompletionParameters {
            enabled: true,
            low_limit_px: 5.0,
            slope_limit: 0.1,
            ratio_inside: 1.0,
            ratio_round: 0.2,
            ratio_bottom: 0.1,
            contrast_limit: 20,
            hole_fill: false,
            hole_size_px: 8.0,
        }
    }

    fn buffers_with_row(geom: &StageGeometry, row: usize, values: &[i32]) -> DisparityBuffers {
        let mut bufs = DisparityBuffers::new(geom.rows() * geom.cols());
        for (i, &v) in values.iter().enumerate() {
            bufs.blkval[row * geom.cols() + i] = v;
            bufs.avedsp[row * geom.cols() + i] = v as f32;
        }
        bufs
    }

    #[test]
    fn test_flat_gap_is_interpolated() {
        let geom = flat_geometry();
        assert_eq!(geom.completion_cols(), 10);
        let row = 1;
        let v = 40_000;
        let mut bufs = buffers_with_row(&geom, row, &[v, v, v, 0, 0, 0, v, v, v]);
        let mut completer = Completer::new(params(), 0, 0, 16);
        completer.complete(&geom, &mut bufs);

        for i in 3..6 {
            let out = bufs.blkval[row * geom.cols() + i];
            assert_eq!(out, v, "column {i} filled with {out}");
        }
    }

    #[test]
    fn test_low_endpoints_are_not_interpolated() {
        let geom = flat_geometry();
        let row = 1;
        // 3 px endpoints sit below the 5 px floor.
        let mut bufs = buffers_with_row(&geom, row, &[3000, 3000, 3000, 0, 0, 0, 3000, 3000, 3000]);
        let mut completer = Completer::new(params(), 0, 0, 16);
        completer.complete(&geom, &mut bufs);
        for i in 3..6 {
            assert_eq!(bufs.blkval[row * geom.cols() + i], 0);
        }
    }

    #[test]
    fn test_steep_slope_is_rejected() {
        let geom = flat_geometry();
        let row = 1;
        // 40 px against 10 px over a three-block gap: slope far above 0.1.
        let mut bufs =
            buffers_with_row(&geom, row, &[40_000, 40_000, 40_000, 0, 0, 0, 10_000, 10_000, 10_000]);
        let mut completer = Completer::new(params(), 0, 0, 16);
        completer.complete(&geom, &mut bufs);
        for i in 3..6 {
            assert_eq!(bufs.blkval[row * geom.cols() + i], 0);
        }
    }

    #[test]
    fn test_strong_texture_blocks_are_left_alone() {
        let geom = flat_geometry();
        let row = 1;
        let v = 40_000;
        let mut bufs = buffers_with_row(&geom, row, &[v, v, v, 0, 0, 0, v, v, v]);
        // The gap has strong texture: the matcher had its chance there.
        for i in 3..6 {
            bufs.contrast[row * geom.cols() + i] = 500;
        }
        let mut completer = Completer::new(params(), 0, 0, 16);
        completer.complete(&geom, &mut bufs);
        for i in 3..6 {
            assert_eq!(bufs.blkval[row * geom.cols() + i], 0);
        }
    }

    #[test]
    fn test_hole_fill_closes_strong_texture_gap() {
        let geom = flat_geometry();
        let row = 1;
        let v = 40_000;
        let mut bufs = buffers_with_row(&geom, row, &[v, v, v, 0, 0, v, v, v, v]);
        for i in 3..5 {
            bufs.contrast[row * geom.cols() + i] = 500;
        }
        let mut p = params();
        p.hole_fill = true;
        p.hole_size_px = 10.0;
        let mut completer = Completer::new(p, 0, 0, 16);
        completer.fill_holes(&geom, &mut bufs);
        for i in 3..5 {
            assert_eq!(bufs.blkval[row * geom.cols() + i], v);
        }
    }

    #[test]
    fn test_completion_never_reduces_valid_count() {
        let geom = flat_geometry();
        let cells = geom.rows() * geom.cols();
        let mut bufs = DisparityBuffers::new(cells);
        // Scatter a mix of valid and invalid blocks.
        for (i, v) in bufs.blkval.iter_mut().enumerate() {
            *v = if i % 3 == 0 { 20_000 + (i as i32 % 5) * 100 } else { 0 };
        }
        for i in 0..cells {
            bufs.avedsp[i] = bufs.blkval[i] as f32;
        }
        let before = bufs.blkval.iter().filter(|&&v| v > 0).count();
        let mut completer = Completer::new(params(), 0, 0, 16);
        completer.complete(&geom, &mut bufs);
        let after = bufs.blkval.iter().filter(|&&v| v > 0).count();
        assert!(after >= before);
    }

    #[test]
    fn test_disabled_completion_is_identity() {
        let geom = flat_geometry();
        let row = 1;
        let v = 40_000;
        let mut bufs = buffers_with_row(&geom, row, &[v, v, v, 0, 0, 0, v, v, v]);
        let before = bufs.blkval.clone();
        let mut p = params();
        p.enabled = false;
        let mut completer = Completer::new(p, 0, 0, 16);
        completer.complete(&geom, &mut bufs);
        completer.fill_holes(&geom, &mut bufs);
        assert_eq!(bufs.blkval, before);
    }
}
