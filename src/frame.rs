//! Core data types shared across the capture and processing stages.
//!
//! A [`Frame`] is one acquisition instant: the identity of the grab (index,
//! timestamp, gain, exposure, sensor error code) plus a payload that is
//! either a rectified stereo pair, an FPGA-encoded disparity plane or a raw
//! interleaved plane destined for replay through the decoder.
//!
//! Disparity results travel as a [`BlockGrid`] (per-block sub-pixel disparity
//! and contrast) and are expanded into a [`DisparityImage`] (per-pixel float
//! disparity plus an 8-bit visualization) at the end of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sub-pixel scale: disparities are stored as integers in units of 1/1000 px.
pub const SUBPIXEL_SCALE: i32 = 1000;

/// Fractional step of the FPGA disparity encoding (4-bit fraction, 1/16 px).
pub const FPGA_FRACTION_STEP: f32 = 0.0625;

/// Largest integer disparity the FPGA encoding can carry; larger values are
/// treated as invalid.
pub const FPGA_MAX_DISPARITY: u8 = 95;

/// Side length of the encoded disparity block (4x4 pixels per wire block).
pub const ENCODED_BLOCK: usize = 4;

/// Intensity floor: a block whose brightest pixel is darker than this gets
/// contrast zero.
pub const BRIGHTNESS_FLOOR: i32 = 20;

/// Camera model tag as stored in recorded file headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraModel {
    /// Compact 752x480 model.
    Vm,
    /// Standard 1280x720 model.
    Xc,
    /// 4K model.
    K4k,
    /// 4K model, variant A.
    K4ka,
    /// 4K model, variant J.
    K4kj,
    /// Unknown or simulated device.
    Unknown,
}

impl CameraModel {
    /// Numeric tag used in the recorded file header.
    pub fn tag(self) -> i32 {
        match self {
            CameraModel::Vm => 0,
            CameraModel::Xc => 1,
            CameraModel::K4k => 2,
            CameraModel::K4ka => 3,
            CameraModel::K4kj => 4,
            CameraModel::Unknown => 99,
        }
    }

    /// Inverse of [`CameraModel::tag`]. Unrecognized tags map to `Unknown`.
    pub fn from_tag(tag: i32) -> Self {
        match tag {
            0 => CameraModel::Vm,
            1 => CameraModel::Xc,
            2 => CameraModel::K4k,
            3 => CameraModel::K4ka,
            4 => CameraModel::K4kj,
            _ => CameraModel::Unknown,
        }
    }
}

/// Acquisition mode of the camera head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrabMode {
    /// FPGA-computed disparity stream.
    Parallax,
    /// Rectified stereo pair.
    Corrected,
    /// Stereo pair before rectification.
    BeforeCorrected,
    /// Raw bayer output.
    Bayer,
    /// Raw bayer output, secondary sensor.
    BayerS,
}

impl GrabMode {
    /// Numeric tag used in the recorded file header.
    pub fn tag(self) -> i32 {
        match self {
            GrabMode::Parallax => 1,
            GrabMode::Corrected => 2,
            GrabMode::BeforeCorrected => 3,
            GrabMode::Bayer => 4,
            GrabMode::BayerS => 5,
        }
    }

    /// Inverse of [`GrabMode::tag`].
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(GrabMode::Parallax),
            2 => Some(GrabMode::Corrected),
            3 => Some(GrabMode::BeforeCorrected),
            4 => Some(GrabMode::Bayer),
            5 => Some(GrabMode::BayerS),
            _ => None,
        }
    }
}

/// Color mode of the acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMode {
    /// Grayscale only.
    Mono,
    /// Mono plus a color frame per acquisition.
    Color,
}

impl ColorMode {
    /// Numeric tag used in the recorded file header.
    pub fn tag(self) -> i32 {
        match self {
            ColorMode::Mono => 0,
            ColorMode::Color => 1,
        }
    }

    /// Inverse of [`ColorMode::tag`].
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(ColorMode::Mono),
            1 => Some(ColorMode::Color),
            _ => None,
        }
    }
}

/// Shutter control mode of the camera head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterMode {
    /// Fixed exposure set by the host.
    Manual,
    /// Single-exposure auto shutter.
    Single,
    /// Alternating long/short double shutter, merged output.
    Double,
    /// Alternating double shutter, both frames published.
    Double2,
}

impl ShutterMode {
    /// Numeric tag used in the recorded file header.
    pub fn tag(self) -> i32 {
        match self {
            ShutterMode::Manual => 0,
            ShutterMode::Single => 1,
            ShutterMode::Double => 2,
            ShutterMode::Double2 => 3,
        }
    }

    /// Inverse of [`ShutterMode::tag`].
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(ShutterMode::Manual),
            1 => Some(ShutterMode::Single),
            2 => Some(ShutterMode::Double),
            3 => Some(ShutterMode::Double2),
            _ => None,
        }
    }
}

/// Per-camera stereo calibration constants, as stored in file headers.
///
/// Disparity maps to metric depth as `depth_m = bf / (disp + d_inf)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    /// Disparity offset at infinity.
    pub d_inf: f32,
    /// Baseline times focal length product.
    pub bf: f32,
    /// Physical baseline in meters.
    pub base_length: f32,
    /// Depth offset.
    pub dz: f32,
}

impl Default for CameraCalibration {
    fn default() -> Self {
        Self {
            d_inf: 0.0,
            bf: 60.0,
            base_length: 0.1,
            dz: 0.0,
        }
    }
}

/// 8-bit grayscale image, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayImage {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Pixel data, `height * width` bytes.
    pub data: Vec<u8>,
}

impl GrayImage {
    /// Creates a black image of the given size.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    /// Builds an image from existing pixel data.
    ///
    /// Returns `None` when `data.len() != width * height`.
    pub fn from_data(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// Pixel accessor. Callers guarantee in-bounds coordinates.
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }
}

/// Per-pixel float disparity (`0.0` = invalid) plus an 8-bit visualization
/// linearly mapped onto `[0, 255]` over the search width.
#[derive(Clone, Debug, PartialEq)]
pub struct DisparityImage {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Sub-pixel disparity per pixel, in pixels. Zero marks no disparity.
    pub pixels: Vec<f32>,
    /// 256-gray visualization: `round(disparity * 255 / depth)`.
    pub gray: Vec<u8>,
}

impl DisparityImage {
    /// Creates an all-invalid disparity image.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0.0; width * height],
            gray: vec![0; width * height],
        }
    }

    /// Resets every pixel to the invalid state.
    pub fn clear(&mut self) {
        self.pixels.fill(0.0);
        self.gray.fill(0);
    }
}

/// Grid of disparity blocks covering the image.
///
/// Each cell carries the sub-pixel disparity in 1/1000 px units (`0` = no
/// disparity) and the weighted block contrast (x1000). A cell is valid iff
/// its disparity is positive; cells never exceed the configured search width
/// and the rightmost shadow band is always invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockGrid {
    /// Number of block rows (`image_height / block_height`).
    pub rows: usize,
    /// Number of block columns (`image_width / block_width`).
    pub cols: usize,
    /// Sub-pixel disparity per block, 1/1000 px units.
    pub disp_q10: Vec<i32>,
    /// Weighted Michelson-style contrast per block, x1000.
    pub contrast: Vec<i32>,
}

impl BlockGrid {
    /// Creates an all-invalid grid.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            disp_q10: vec![0; rows * cols],
            contrast: vec![0; rows * cols],
        }
    }

    /// True when the cell holds a usable disparity.
    #[inline]
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.disp_q10[row * self.cols + col] > 0
    }

    /// Number of valid cells.
    pub fn valid_count(&self) -> usize {
        self.disp_q10.iter().filter(|&&d| d > 0).count()
    }

    /// Resets every cell to the invalid state.
    pub fn clear(&mut self) {
        self.disp_q10.fill(0);
        self.contrast.fill(0);
    }

    /// Resizes the grid, invalidating all cells.
    pub fn reset(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        self.cols = cols;
        self.disp_q10.clear();
        self.disp_q10.resize(rows * cols, 0);
        self.contrast.clear();
        self.contrast.resize(rows * cols, 0);
    }
}

/// Variant payload of one acquisition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FramePayload {
    /// Nothing captured yet; placeholder for pre-allocated ring slots.
    Empty,
    /// Rectified stereo pair. `reference` is the right-hand image after the
    /// source-boundary flip; `compare` is the left-hand image.
    Rectified {
        /// Reference (right) image.
        reference: GrayImage,
        /// Compare (left) image.
        compare: GrayImage,
    },
    /// FPGA-computed disparity stream: `2W x H` bytes interleaving the
    /// encoded disparity plane with the reference image column-by-column.
    Encoded {
        /// Interleaved plane, `2 * width * height` bytes.
        interleaved: Vec<u8>,
    },
    /// Raw interleaved plane for replay through the decoder.
    Raw {
        /// Packed plane, `2 * width * height` bytes.
        packed: Vec<u8>,
    },
}

/// One acquisition instant.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Image width in pixels.
    pub width: usize,
    /// Image height in pixels.
    pub height: usize,
    /// Monotonic frame index assigned by the source.
    pub index: u64,
    /// Capture timestamp.
    pub timestamp: DateTime<Utc>,
    /// Sensor gain at capture time.
    pub gain: i32,
    /// Sensor exposure at capture time (device units).
    pub exposure: i32,
    /// Per-sensor error code reported with the frame (0 = clean).
    pub error_code: i32,
    /// Captured data.
    pub payload: FramePayload,
}

impl Frame {
    /// Placeholder frame used to pre-allocate ring slots.
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            index: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            gain: 0,
            exposure: 0,
            error_code: 0,
            payload: FramePayload::Empty,
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::empty()
    }
}

/// Axis-aligned pixel rectangle for area queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    /// Left edge, inclusive.
    pub x: usize,
    /// Top edge, inclusive.
    pub y: usize,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
}
