//! Disparity processing stages: decode, match, average, complete.
//!
//! All stages share one [`StageGeometry`] (block layout, matching window,
//! search width, shadow band) and operate in place on a set of
//! [`DisparityBuffers`] allocated once at engine start. The final
//! [`expand_to_image`] step turns the block values into the per-pixel
//! outputs consumers see.

pub mod averaging;
pub mod bands;
pub mod completion;
pub mod decoder;
pub mod matching;
#[cfg(feature = "opencl")]
pub mod opencl;

use crate::frame::{
    BlockGrid, CameraModel, DisparityImage, BRIGHTNESS_FLOOR, SUBPIXEL_SCALE,
};
use crate::params::MatchingParameters;

/// Reference image widths of the two FPGA camera heads.
const IMG_WIDTH_VM: usize = 752;
const IMG_WIDTH_XC: usize = 1280;

/// FPGA search widths matched to the image width.
const FPGA_DEPTH_VM: usize = 112;
const FPGA_DEPTH_XC: usize = 256;

/// Model-specific contrast offsets (x1000).
const CONTRAST_OFFSET_VM: i32 = 1800;
const CONTRAST_OFFSET_XC: i32 = 1200;

/// Search width of the FPGA matcher, judged from the image width.
pub fn fpga_depth_for_width(width: usize) -> usize {
    match width {
        IMG_WIDTH_VM => FPGA_DEPTH_VM,
        IMG_WIDTH_XC => FPGA_DEPTH_XC,
        _ => FPGA_DEPTH_XC,
    }
}

/// Contrast offset constant for the camera model.
pub fn contrast_offset(model: CameraModel) -> i32 {
    match model {
        CameraModel::Vm => CONTRAST_OFFSET_VM,
        _ => CONTRAST_OFFSET_XC,
    }
}

/// Block layout shared by every processing stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageGeometry {
    /// Image height in pixels.
    pub img_h: usize,
    /// Image width in pixels.
    pub img_w: usize,
    /// Disparity block height.
    pub blk_h: usize,
    /// Disparity block width.
    pub blk_w: usize,
    /// Matching window height.
    pub mtc_h: usize,
    /// Matching window width.
    pub mtc_w: usize,
    /// Horizontal pixel offset of the block origin.
    pub ofs_x: usize,
    /// Vertical pixel offset of the block origin.
    pub ofs_y: usize,
    /// Search width in pixels.
    pub depth: usize,
    /// Shadow band width in pixels; always equals the search width.
    pub shadow: usize,
}

impl StageGeometry {
    /// Geometry of the software matcher from its parameter record.
    pub fn from_matching(m: &MatchingParameters) -> Self {
        Self {
            img_h: m.img_h,
            img_w: m.img_w,
            blk_h: m.blk_h,
            blk_w: m.blk_w,
            mtc_h: m.mtc_h,
            mtc_w: m.mtc_w,
            ofs_x: m.blk_ofs_x,
            ofs_y: m.blk_ofs_y,
            depth: m.depth,
            shadow: m.depth,
        }
    }

    /// Geometry of the FPGA stream: 4x4 blocks, no offsets, search width
    /// judged from the image width. The search width never exceeds half the
    /// image so the shadow band leaves a usable grid.
    pub fn for_encoded(img_w: usize, img_h: usize) -> Self {
        let depth = fpga_depth_for_width(img_w).min(img_w / 2);
        Self {
            img_h,
            img_w,
            blk_h: crate::frame::ENCODED_BLOCK,
            blk_w: crate::frame::ENCODED_BLOCK,
            mtc_h: crate::frame::ENCODED_BLOCK,
            mtc_w: crate::frame::ENCODED_BLOCK,
            ofs_x: 0,
            ofs_y: 0,
            depth,
            shadow: depth,
        }
    }

    /// Grid rows covering the full image.
    pub fn rows(&self) -> usize {
        self.img_h / self.blk_h
    }

    /// Grid columns covering the full image.
    pub fn cols(&self) -> usize {
        self.img_w / self.blk_w
    }

    /// Grid columns left of the shadow band.
    pub fn valid_cols(&self) -> usize {
        (self.img_w - self.shadow) / self.blk_w
    }

    /// Rows of the per-pixel expansion.
    pub fn expand_rows(&self) -> usize {
        (self.img_h - self.mtc_h - self.ofs_y) / self.blk_h + 1
    }

    /// Columns of the per-pixel expansion.
    pub fn expand_cols(&self) -> usize {
        (self.img_w - self.shadow - self.mtc_w - self.ofs_x) / self.blk_w + 1
    }

    /// Rows scanned by the completer.
    pub fn completion_rows(&self) -> usize {
        ((self.img_h - self.mtc_h) / self.blk_h + 1).min(self.rows())
    }

    /// Columns scanned by the completer.
    pub fn completion_cols(&self) -> usize {
        ((self.img_w - self.shadow - self.mtc_w) / self.blk_w + 1).min(self.cols())
    }

    /// Diagonal pixel span of one block, used by the diagonal completion
    /// sweeps.
    pub fn block_diagonal(&self) -> f64 {
        ((self.blk_h * self.blk_h + self.blk_w * self.blk_w) as f64).sqrt()
    }
}

/// In-place working buffers of the disparity stages, allocated once at
/// maximum resolution.
#[derive(Clone, Debug)]
pub struct DisparityBuffers {
    /// Sub-pixel block disparity, 1/1000 px integer units.
    pub blkval: Vec<i32>,
    /// Sub-pixel block disparity, float, same units.
    pub avedsp: Vec<f32>,
    /// Block contrast, x1000.
    pub contrast: Vec<i32>,
}

impl DisparityBuffers {
    /// Allocates buffers for `max_cells` grid cells.
    pub fn new(max_cells: usize) -> Self {
        Self {
            blkval: vec![0; max_cells],
            avedsp: vec![0.0; max_cells],
            contrast: vec![0; max_cells],
        }
    }

    /// Invalidates every cell.
    pub fn clear(&mut self) {
        self.blkval.fill(0);
        self.avedsp.fill(0.0);
        self.contrast.fill(0);
    }
}

/// Weighted block contrast over a `bh x bw` window anchored at `(x, y)`.
///
/// Blocks darker than the brightness floor get contrast zero; otherwise the
/// value is `((Lmax - Lmin) * 1000 - offset) * N / sum`, which diverges from
/// classical Michelson contrast but is kept for bit-compatibility with
/// existing recordings.
pub fn block_contrast(
    image: &[u8],
    img_w: usize,
    x: usize,
    y: usize,
    bh: usize,
    bw: usize,
    offset: i32,
) -> i32 {
    let mut sum: i32 = 0;
    let mut lmin: i32 = 255;
    let mut lmax: i32 = 0;
    for row in y..y + bh {
        for col in x..x + bw {
            let l = i32::from(image[row * img_w + col]);
            sum += l;
            lmin = lmin.min(l);
            lmax = lmax.max(l);
        }
    }
    if lmax < BRIGHTNESS_FLOOR {
        return 0;
    }
    ((lmax - lmin) * 1000 - offset) * (bh * bw) as i32 / sum
}

/// Expands block disparities into the per-pixel disparity image and its
/// 256-gray visualization.
pub fn expand_to_image(bufs: &DisparityBuffers, geom: &StageGeometry, out: &mut DisparityImage) {
    out.clear();
    let cols = geom.cols();
    let gray_scale = 255.0 / geom.depth as f32;

    for jblk in 0..geom.expand_rows() {
        for iblk in 0..geom.expand_cols() {
            let ave_px = bufs.avedsp[cols * jblk + iblk] / SUBPIXEL_SCALE as f32;
            let gray = (ave_px * gray_scale).round().clamp(0.0, 255.0) as u8;

            let jpxl = jblk * geom.blk_h + geom.ofs_y;
            let ipxl = iblk * geom.blk_w + geom.ofs_x;
            for j in jpxl..jpxl + geom.blk_h {
                for i in ipxl..ipxl + geom.blk_w {
                    out.pixels[geom.img_w * j + i] = ave_px;
                    out.gray[geom.img_w * j + i] = gray;
                }
            }
        }
    }
}

/// Copies the working buffers into an exported block grid.
pub fn export_grid(bufs: &DisparityBuffers, geom: &StageGeometry, grid: &mut BlockGrid) {
    let rows = geom.rows();
    let cols = geom.cols();
    grid.reset(rows, cols);
    let n = rows * cols;
    grid.disp_q10.copy_from_slice(&bufs.blkval[..n]);
    grid.contrast.copy_from_slice(&bufs.contrast[..n]);
}
