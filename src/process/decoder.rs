//! Decoding of the FPGA frame formats.
//!
//! The camera interleaves two byte streams column by column: the odd bytes
//! carry the reference (right) image and the even bytes either the compare
//! (left) image or, in parallax mode, the encoded disparity stream.
//!
//! The encoded stream packs one record per 4x4 pixel block into the block's
//! first four bytes:
//!
//! ```text
//! [0] integer disparity, 0..=95 (larger values are invalid)
//! [1] bits 7:4 fractional disparity in 1/16 px steps
//! [2] mask bits 15:8 (block rows 3 and 4)
//! [3] mask bits  7:0 (block rows 1 and 2)
//! ```
//!
//! Mask bit `k` corresponds to pixel `k` of the block in row-major order;
//! pixels with a cleared bit carry no disparity. The decoder exposes the
//! *direct* per-pixel path (averaging disabled) and the block-grid
//! extraction feeding the averaging/completion stages. The disparity limit
//! is applied exactly once, here at decode time.

use tracing::debug;

use crate::frame::{
    BlockGrid, DisparityImage, Frame, FramePayload, GrayImage, ENCODED_BLOCK, FPGA_FRACTION_STEP,
    FPGA_MAX_DISPARITY, SUBPIXEL_SCALE,
};
use crate::params::DisparityLimit;
use crate::process::{block_contrast, DisparityBuffers, StageGeometry};

/// Pixel value treated as blown-out when merging double-shutter pairs.
const SATURATION_CEILING: u8 = 250;

/// Decoder for the interleaved wire formats.
#[derive(Clone, Copy, Debug, Default)]
pub struct Decoder {
    limit: DisparityLimit,
}

impl Decoder {
    /// Creates a decoder applying the given disparity limit.
    pub fn new(limit: DisparityLimit) -> Self {
        Self { limit }
    }

    /// Replaces the disparity limit; applied from the next decode on.
    pub fn set_limit(&mut self, limit: DisparityLimit) {
        self.limit = limit;
    }

    /// Splits an interleaved plane into its two streams.
    ///
    /// `reference` receives the odd bytes, `compare` the even bytes. In
    /// parallax mode the compare stream is the encoded disparity plane, in
    /// the corrected modes it is the left image; the caller knows which.
    pub fn split_interleaved(
        interleaved: &[u8],
        width: usize,
        height: usize,
        reference: &mut GrayImage,
        compare: &mut GrayImage,
    ) {
        debug_assert!(interleaved.len() >= 2 * width * height);
        debug_assert_eq!(reference.data.len(), width * height);
        debug_assert_eq!(compare.data.len(), width * height);
        for (i, pair) in interleaved.chunks_exact(2).enumerate().take(width * height) {
            compare.data[i] = pair[0];
            reference.data[i] = pair[1];
        }
    }

    /// Reads one encoded block record; returns the disparity in 1/1000 px
    /// units (`0` when invalid) and the 16-bit validity mask.
    fn read_block(&self, encoded: &[u8], width: usize, x: usize, y: usize) -> (i32, u16) {
        let base = y * width + x;
        let integer = encoded[base];
        let fraction = (encoded[base + 1] & 0xF0) >> 4;
        let mask = (u16::from(encoded[base + 2]) << 8) | u16::from(encoded[base + 3]);

        if integer > FPGA_MAX_DISPARITY {
            return (0, mask);
        }
        let value = f32::from(integer) + f32::from(fraction) * FPGA_FRACTION_STEP;
        let mut q10 = (value * SUBPIXEL_SCALE as f32) as i32;
        if self.limit.enabled && (q10 < self.limit.lower_q10 || q10 > self.limit.upper_q10) {
            q10 = 0;
        }
        (q10, mask)
    }

    /// Direct per-pixel decode, used when averaging is disabled.
    ///
    /// Masked-out pixels receive disparity exactly zero. The block grid
    /// receives the raw decoded value per block, mask or not.
    pub fn decode_direct(
        &self,
        encoded: &[u8],
        geom: &StageGeometry,
        out: &mut DisparityImage,
        bufs: &mut DisparityBuffers,
    ) {
        out.clear();
        let cols = geom.cols();
        let gray_scale = 255.0 / geom.depth as f32;

        for (jj, y) in (0..geom.img_h).step_by(ENCODED_BLOCK).enumerate() {
            for (ii, x) in (0..geom.img_w).step_by(ENCODED_BLOCK).enumerate() {
                let (q10, mask) = self.read_block(encoded, geom.img_w, x, y);
                let value_px = q10 as f32 / SUBPIXEL_SCALE as f32;
                let gray = (value_px * gray_scale).round().clamp(0.0, 255.0) as u8;

                bufs.blkval[jj * cols + ii] = q10;
                bufs.avedsp[jj * cols + ii] = q10 as f32;

                let mut bit: u16 = 0x01;
                for j in y..y + ENCODED_BLOCK {
                    for i in x..x + ENCODED_BLOCK {
                        let idx = j * geom.img_w + i;
                        if mask & bit != 0 {
                            out.pixels[idx] = value_px;
                            out.gray[idx] = gray;
                        } else {
                            out.pixels[idx] = 0.0;
                            out.gray[idx] = 0;
                        }
                        bit = bit.rotate_left(1);
                    }
                }
            }
        }
    }

    /// Extracts the block grid (disparity plus reference-image contrast)
    /// feeding the averaging and completion stages.
    pub fn extract_blocks(
        &self,
        encoded: &[u8],
        reference: &GrayImage,
        crst_thr: i32,
        crst_ofs: i32,
        geom: &StageGeometry,
        bufs: &mut DisparityBuffers,
    ) {
        let cols = geom.cols();
        let mut rejected = 0usize;

        for (jj, y) in (0..geom.img_h).step_by(ENCODED_BLOCK).enumerate() {
            for (ii, x) in (0..geom.img_w).step_by(ENCODED_BLOCK).enumerate() {
                let contrast = block_contrast(
                    &reference.data,
                    geom.img_w,
                    x,
                    y,
                    ENCODED_BLOCK,
                    ENCODED_BLOCK,
                    crst_ofs,
                );
                let (q10, _mask) = self.read_block(encoded, geom.img_w, x, y);

                let idx = jj * cols + ii;
                if contrast < crst_thr {
                    bufs.blkval[idx] = 0;
                    bufs.avedsp[idx] = 0.0;
                    rejected += 1;
                } else {
                    bufs.blkval[idx] = q10;
                    bufs.avedsp[idx] = q10 as f32;
                }
                bufs.contrast[idx] = contrast;
            }
        }
        if rejected > 0 {
            debug!(rejected, "blocks under contrast threshold");
        }
    }
}

/// Merges an alternating double-shutter pair into one frame.
///
/// Rectified pairs merge per pixel, preferring the long exposure wherever it
/// is not blown out. Non-rectified payloads cannot be merged pixel-wise, so
/// the long-exposure frame wins wholesale.
pub fn combine_double_shutter(long: &Frame, short: &Frame) -> Frame {
    let payload = match (&long.payload, &short.payload) {
        (
            FramePayload::Rectified {
                reference: long_ref,
                compare: long_cmp,
            },
            FramePayload::Rectified {
                reference: short_ref,
                compare: short_cmp,
            },
        ) => {
            let mut reference = long_ref.clone();
            let mut compare = long_cmp.clone();
            for i in 0..reference.data.len() {
                if long_ref.data[i] >= SATURATION_CEILING {
                    reference.data[i] = short_ref.data[i];
                    compare.data[i] = short_cmp.data[i];
                }
            }
            FramePayload::Rectified { reference, compare }
        }
        _ => long.payload.clone(),
    };
    Frame {
        width: long.width,
        height: long.height,
        index: long.index,
        timestamp: long.timestamp,
        gain: long.gain,
        exposure: long.exposure,
        error_code: long.error_code.max(short.error_code),
        payload,
    }
}

/// Merges two block grids from a double-shutter pair: wherever the
/// long-exposure block has contrast at or above `crst_thr` its disparity
/// wins, elsewhere the short-exposure block is used.
pub fn merge_block_grids(long: &BlockGrid, short: &BlockGrid, crst_thr: i32) -> BlockGrid {
    debug_assert_eq!(long.rows, short.rows);
    debug_assert_eq!(long.cols, short.cols);
    let mut merged = long.clone();
    for i in 0..merged.disp_q10.len() {
        if long.contrast[i] < crst_thr {
            merged.disp_q10[i] = short.disp_q10[i];
            merged.contrast[i] = short.contrast[i];
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Builds an encoded plane of `bw x bh` blocks, all carrying the given
    /// record bytes.
    fn encoded_plane(
        width: usize,
        height: usize,
        integer: u8,
        fraction_bits: u8,
        mask_hi: u8,
        mask_lo: u8,
    ) -> Vec<u8> {
        let mut plane = vec![0u8; width * height];
        for y in (0..height).step_by(ENCODED_BLOCK) {
            for x in (0..width).step_by(ENCODED_BLOCK) {
                let base = y * width + x;
                plane[base] = integer;
                plane[base + 1] = fraction_bits;
                plane[base + 2] = mask_hi;
                plane[base + 3] = mask_lo;
            }
        }
        plane
    }

    fn small_geometry() -> StageGeometry {
        let geom = StageGeometry::for_encoded(16, 8);
        StageGeometry {
            depth: 32,
            shadow: 0,
            ..geom
        }
    }

    #[test]
    fn test_split_interleaved_routes_streams() {
        let mut interleaved = vec![0u8; 2 * 4 * 2];
        for (i, pair) in interleaved.chunks_exact_mut(2).enumerate() {
            pair[0] = i as u8;
            pair[1] = 100 + i as u8;
        }
        let mut reference = GrayImage::new(4, 2);
        let mut compare = GrayImage::new(4, 2);
        Decoder::split_interleaved(&interleaved, 4, 2, &mut reference, &mut compare);
        assert_eq!(compare.data, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(reference.data, (100..108).collect::<Vec<u8>>());
    }

    #[test]
    fn test_disparity_mask_expansion() {
        // Integer 20, fraction 8 -> 20.5 px; only row one of each block is
        // valid.
        let geom = small_geometry();
        let encoded = encoded_plane(16, 8, 20, 0x80, 0x00, 0x0F);
        let decoder = Decoder::default();
        let mut out = DisparityImage::new(16, 8);
        let mut bufs = DisparityBuffers::new(geom.rows() * geom.cols());
        decoder.decode_direct(&encoded, &geom, &mut out, &mut bufs);

        let mut valid = 0;
        let mut zero = 0;
        for y in 0..4 {
            for x in 0..4 {
                let v = out.pixels[y * 16 + x];
                if y == 0 {
                    assert_eq!(v, 20.5);
                    valid += 1;
                } else {
                    assert_eq!(v, 0.0);
                    zero += 1;
                }
            }
        }
        assert_eq!((valid, zero), (4, 12));
        assert_eq!(bufs.blkval[0], 20500);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let geom = small_geometry();
        let encoded = encoded_plane(16, 8, 11, 0x40, 0xAB, 0xCD);
        let decoder = Decoder::default();

        let mut out_a = DisparityImage::new(16, 8);
        let mut out_b = DisparityImage::new(16, 8);
        let mut bufs_a = DisparityBuffers::new(geom.rows() * geom.cols());
        let mut bufs_b = DisparityBuffers::new(geom.rows() * geom.cols());
        decoder.decode_direct(&encoded, &geom, &mut out_a, &mut bufs_a);
        decoder.decode_direct(&encoded, &geom, &mut out_b, &mut bufs_b);
        assert_eq!(out_a, out_b);
        assert_eq!(bufs_a.blkval, bufs_b.blkval);
    }

    #[test]
    fn test_overrange_disparity_is_invalid() {
        let geom = small_geometry();
        let encoded = encoded_plane(16, 8, 96, 0x00, 0xFF, 0xFF);
        let decoder = Decoder::default();
        let mut out = DisparityImage::new(16, 8);
        let mut bufs = DisparityBuffers::new(geom.rows() * geom.cols());
        decoder.decode_direct(&encoded, &geom, &mut out, &mut bufs);
        assert!(out.pixels.iter().all(|&v| v == 0.0));
        assert!(bufs.blkval.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_limit_clamps_at_decode() {
        let geom = small_geometry();
        let encoded = encoded_plane(16, 8, 20, 0x00, 0xFF, 0xFF);
        let limited = Decoder::new(DisparityLimit {
            enabled: true,
            lower_q10: 5_000,
            upper_q10: 15_000,
        });
        let mut out = DisparityImage::new(16, 8);
        let mut bufs = DisparityBuffers::new(geom.rows() * geom.cols());
        limited.decode_direct(&encoded, &geom, &mut out, &mut bufs);
        assert!(bufs.blkval.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_contrast_gating_is_monotone() {
        let geom = small_geometry();
        let encoded = encoded_plane(16, 8, 20, 0x00, 0xFF, 0xFF);
        // Textured reference with varying contrast per block.
        let mut reference = GrayImage::new(16, 8);
        for y in 0..8 {
            for x in 0..16 {
                reference.data[y * 16 + x] = (40 + x * 13 + y * 7) as u8;
            }
        }
        let decoder = Decoder::default();
        let mut valid_counts = Vec::new();
        for crst_thr in [0, 500, 2000, 8000, 1_000_000] {
            let mut bufs = DisparityBuffers::new(geom.rows() * geom.cols());
            decoder.extract_blocks(&encoded, &reference, crst_thr, 1200, &geom, &mut bufs);
            valid_counts.push(bufs.blkval.iter().filter(|&&v| v > 0).count());
            // Contrast is populated even for rejected blocks.
            assert!(bufs.contrast.iter().any(|&c| c != 0));
        }
        assert!(valid_counts.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*valid_counts.last().unwrap(), 0);
    }

    #[test]
    fn test_double_shutter_merge_prefers_unsaturated_long() {
        let mut long_ref = GrayImage::new(4, 1);
        long_ref.data = vec![10, 255, 30, 251];
        let mut short_ref = GrayImage::new(4, 1);
        short_ref.data = vec![2, 60, 7, 62];
        let long = Frame {
            width: 4,
            height: 1,
            index: 8,
            timestamp: Utc::now(),
            gain: 0,
            exposure: 400,
            error_code: 0,
            payload: FramePayload::Rectified {
                reference: long_ref.clone(),
                compare: long_ref,
            },
        };
        let short = Frame {
            exposure: 100,
            payload: FramePayload::Rectified {
                reference: short_ref.clone(),
                compare: short_ref,
            },
            ..long.clone()
        };
        let merged = combine_double_shutter(&long, &short);
        let FramePayload::Rectified { reference, .. } = &merged.payload else {
            unreachable!("merged frames stay rectified");
        };
        assert_eq!(reference.data, vec![10, 60, 30, 62]);
        assert_eq!(merged.exposure, 400);
    }

    #[test]
    fn test_grid_merge_prefers_long_contrast() {
        let mut long = BlockGrid::new(1, 3);
        long.disp_q10 = vec![7000, 8000, 9000];
        long.contrast = vec![50, 10, 45];
        let mut short = BlockGrid::new(1, 3);
        short.disp_q10 = vec![1000, 2000, 3000];
        short.contrast = vec![90, 80, 70];

        let merged = merge_block_grids(&long, &short, 40);
        assert_eq!(merged.disp_q10, vec![7000, 2000, 9000]);
    }
}
