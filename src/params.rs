//! Parameter records and the double-buffered parameter store.
//!
//! Every processing stage reads a validated, typed parameter record. Writers
//! never touch a record mid-frame: [`ParameterStore::set`] publishes into a
//! shadow copy and raises a pending flag, and the consuming stage swaps the
//! new record in at its next frame boundary via
//! [`ParameterStore::take_pending`].
//!
//! Records persist as `[CATEGORY]` / `key = value` sections in a TOML file.
//! Loading a missing file writes the model defaults and continues, so a
//! fresh installation always starts from a well-formed parameter file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::frame::{CameraModel, ShutterMode, SUBPIXEL_SCALE};

/// Block edge lengths the FPGA geometry supports.
pub const VALID_BLOCK_SIZES: [usize; 6] = [2, 3, 4, 6, 7, 8];

/// Largest number of horizontal bands a stage may fan out to.
pub const MAX_BANDS: usize = 40;

/// System-wide switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemParameters {
    /// Run the matcher/averager through OpenCL when a device is available.
    pub use_opencl: bool,
    /// Number of horizontal bands for the fork-join stages (1..=40).
    pub band_count: usize,
}

impl Default for SystemParameters {
    fn default() -> Self {
        Self {
            use_opencl: false,
            band_count: 8,
        }
    }
}

/// Geometry and thresholds of the SSD block matcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingParameters {
    /// Image height in pixels.
    pub img_h: usize,
    /// Image width in pixels.
    pub img_w: usize,
    /// Search width in pixels; also the shadow band width.
    pub depth: usize,
    /// Disparity block height.
    pub blk_h: usize,
    /// Disparity block width.
    pub blk_w: usize,
    /// Matching window height.
    pub mtc_h: usize,
    /// Matching window width.
    pub mtc_w: usize,
    /// Horizontal offset of the disparity block origin.
    pub blk_ofs_x: usize,
    /// Vertical offset of the disparity block origin.
    pub blk_ofs_y: usize,
    /// Contrast threshold; blocks below it are invalid.
    pub crst_thr: i32,
}

impl Default for MatchingParameters {
    fn default() -> Self {
        // XC geometry.
        Self {
            img_h: 720,
            img_w: 1280,
            depth: 256,
            blk_h: 3,
            blk_w: 3,
            mtc_h: 7,
            mtc_w: 7,
            blk_ofs_x: 2,
            blk_ofs_y: 2,
            crst_thr: 40,
        }
    }
}

/// Bidirectional consistency check of the matcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackMatchingParameters {
    /// Run the reverse match and blend.
    pub enabled: bool,
    /// Evaluation window half-width, in blocks.
    pub eval_width: usize,
    /// Largest forward/backward difference still counted as agreement, px.
    pub eval_range: i32,
    /// Agreement percentage required to keep the forward disparity.
    pub valid_ratio: i32,
    /// Zero percentage above which the block is discarded outright.
    pub zero_ratio: i32,
}

impl Default for BackMatchingParameters {
    fn default() -> Self {
        Self {
            enabled: true,
            eval_width: 1,
            eval_range: 3,
            valid_ratio: 30,
            zero_ratio: 60,
        }
    }
}

/// Histogram-voting majority filter over the block grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AveragingParameters {
    /// Run the averaging pass.
    pub enabled: bool,
    /// Window half-height, in blocks.
    pub win_h: usize,
    /// Window half-width, in blocks.
    pub win_w: usize,
    /// Moving-integral half-width, 1/1000 px units.
    pub integ_range_q10: i32,
    /// Accepted spread around the histogram mode, 1/1000 px units.
    pub limit_range_q10: i32,
    /// Minimum weighted share of valid neighbors, percent.
    pub disp_ratio: i32,
    /// Minimum in-window share of the valid neighbors, percent.
    pub valid_ratio: i32,
    /// In-window share below which an out-of-window center is discarded.
    pub replace_ratio: i32,
    /// Weight of the center block.
    pub weight_center: i32,
    /// Weight of the four orthogonal neighbors.
    pub weight_near: i32,
    /// Weight of the four diagonal neighbors.
    pub weight_round: i32,
}

impl Default for AveragingParameters {
    fn default() -> Self {
        Self {
            enabled: true,
            win_h: 3,
            win_w: 3,
            integ_range_q10: SUBPIXEL_SCALE,
            limit_range_q10: 2 * SUBPIXEL_SCALE,
            disp_ratio: 20,
            valid_ratio: 20,
            replace_ratio: 50,
            weight_center: 1,
            weight_near: 1,
            weight_round: 1,
        }
    }
}

/// Four-direction hole interpolation over the block grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionParameters {
    /// Run the completion pass.
    pub enabled: bool,
    /// Smallest endpoint disparity eligible for interpolation, px.
    pub low_limit_px: f64,
    /// Largest disparity gradient still interpolated, px per px.
    pub slope_limit: f64,
    /// Gap-width multiplier for interior runs.
    pub ratio_inside: f64,
    /// Gap-width multiplier at lateral image borders.
    pub ratio_round: f64,
    /// Gap-width multiplier at the bottom image border.
    pub ratio_bottom: f64,
    /// Contrast ceiling: only weak-texture blocks are interpolated.
    pub contrast_limit: i32,
    /// Run the additional hole-filling sweeps.
    pub hole_fill: bool,
    /// Largest hole the filling sweeps will close, px.
    pub hole_size_px: f64,
}

impl Default for CompletionParameters {
    fn default() -> Self {
        Self {
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
}

/// Optional clamp applied once at decode time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisparityLimit {
    /// Apply the clamp.
    pub enabled: bool,
    /// Lower bound, 1/1000 px units.
    pub lower_q10: i32,
    /// Upper bound, 1/1000 px units.
    pub upper_q10: i32,
}

impl Default for DisparityLimit {
    fn default() -> Self {
        Self {
            enabled: false,
            lower_q10: 0,
            upper_q10: 255 * SUBPIXEL_SCALE,
        }
    }
}

/// The complete parameter file: one record per category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParameters {
    /// System-wide switches.
    #[serde(rename = "SYSTEM")]
    pub system: SystemParameters,
    /// Matcher geometry and thresholds.
    #[serde(rename = "MATCHING")]
    pub matching: MatchingParameters,
    /// Bidirectional consistency check.
    #[serde(rename = "BACKMATCHING")]
    pub back_matching: BackMatchingParameters,
    /// Majority filter.
    #[serde(rename = "AVERAGING")]
    pub averaging: AveragingParameters,
    /// Hole interpolation.
    #[serde(rename = "COMPLETION")]
    pub completion: CompletionParameters,
    /// Decode-time disparity clamp.
    #[serde(rename = "LIMIT")]
    pub limit: DisparityLimit,
}

impl EngineParameters {
    /// Model-specific factory defaults.
    pub fn defaults_for(model: CameraModel) -> Self {
        let mut params = Self::default();
        if model == CameraModel::Vm {
            params.matching = MatchingParameters {
                img_h: 480,
                img_w: 752,
                depth: 112,
                blk_h: 2,
                blk_w: 2,
                mtc_h: 6,
                mtc_w: 6,
                blk_ofs_x: 2,
                blk_ofs_y: 2,
                crst_thr: 45,
            };
        }
        params
    }

    /// Checks every invariant a record must satisfy before it may reach a
    /// stage.
    pub fn validate(&self) -> EngineResult<()> {
        let m = &self.matching;
        if !VALID_BLOCK_SIZES.contains(&m.blk_h) || !VALID_BLOCK_SIZES.contains(&m.blk_w) {
            return Err(EngineError::InvalidParameter(format!(
                "block size {}x{} not supported",
                m.blk_h, m.blk_w
            )));
        }
        if m.depth == 0 || m.depth + m.mtc_w > m.img_w {
            return Err(EngineError::InvalidParameter(format!(
                "search width {} does not fit image width {}",
                m.depth, m.img_w
            )));
        }
        if self.system.band_count == 0 || self.system.band_count > MAX_BANDS {
            return Err(EngineError::InvalidParameter(format!(
                "band count {} outside 1..={}",
                self.system.band_count, MAX_BANDS
            )));
        }
        if self.averaging.win_h > 8 || self.averaging.win_w > 8 {
            return Err(EngineError::InvalidParameter(format!(
                "averaging window {}x{} exceeds the 17x17 maximum",
                self.averaging.win_h, self.averaging.win_w
            )));
        }
        for (name, pct) in [
            ("back matching valid_ratio", self.back_matching.valid_ratio),
            ("back matching zero_ratio", self.back_matching.zero_ratio),
            ("averaging disp_ratio", self.averaging.disp_ratio),
            ("averaging valid_ratio", self.averaging.valid_ratio),
            ("averaging replace_ratio", self.averaging.replace_ratio),
        ] {
            if !(0..=100).contains(&pct) {
                return Err(EngineError::InvalidParameter(format!(
                    "{name} must be a percentage, got {pct}"
                )));
            }
        }
        if self.limit.enabled && self.limit.lower_q10 > self.limit.upper_q10 {
            return Err(EngineError::InvalidParameter(
                "disparity limit lower bound above upper bound".to_string(),
            ));
        }
        Ok(())
    }
}

/// Strongly-typed value for the polymorphic option surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    /// Signed integer.
    Int(i64),
    /// Single-precision float.
    Float(f32),
    /// Double-precision float.
    Double(f64),
    /// Boolean switch.
    Bool(bool),
    /// Free-form string.
    String(String),
    /// Unsigned 64-bit value (serial numbers, register words).
    U64(u64),
    /// Shutter control mode.
    Shutter(ShutterMode),
}

impl ParameterValue {
    /// Extracts an integer, widening from the numeric variants.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            ParameterValue::U64(v) => i64::try_from(*v).ok(),
            ParameterValue::Float(v) => Some(*v as i64),
            ParameterValue::Double(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Extracts a double, widening from the numeric variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::U64(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(f64::from(*v)),
            ParameterValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Extracts a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            ParameterValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Extracts a shutter mode.
    pub fn as_shutter(&self) -> Option<ShutterMode> {
        match self {
            ParameterValue::Shutter(v) => Some(*v),
            ParameterValue::Int(v) => i32::try_from(*v).ok().and_then(ShutterMode::from_tag),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Int(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::Double(v) => write!(f, "{v}"),
            ParameterValue::Bool(v) => write!(f, "{v}"),
            ParameterValue::String(v) => write!(f, "{v}"),
            ParameterValue::U64(v) => write!(f, "{v}"),
            ParameterValue::Shutter(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Int(i64::from(value))
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Double(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<u64> for ParameterValue {
    fn from(value: u64) -> Self {
        ParameterValue::U64(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<ShutterMode> for ParameterValue {
    fn from(value: ShutterMode) -> Self {
        ParameterValue::Shutter(value)
    }
}

/// Double-buffered parameter store.
///
/// Writers mutate a shadow record under the store mutex; stages pull the
/// record at frame boundaries, so a half-written update is never observed
/// mid-frame.
pub struct ParameterStore {
    shadow: Mutex<EngineParameters>,
    pending: AtomicBool,
    path: Option<PathBuf>,
    persist_on_set: bool,
}

impl ParameterStore {
    /// Creates an in-memory store seeded with the given record.
    pub fn new(params: EngineParameters) -> Self {
        Self {
            shadow: Mutex::new(params),
            pending: AtomicBool::new(false),
            path: None,
            persist_on_set: false,
        }
    }

    /// Loads the parameter file, creating it with model defaults when it
    /// does not exist yet.
    pub fn load_or_create(
        path: &Path,
        model: CameraModel,
        persist_on_set: bool,
    ) -> EngineResult<Self> {
        let params = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str::<EngineParameters>(&text)
                .map_err(|e| EngineError::ReadFailed(format!("{}: {e}", path.display())))?
        } else {
            let defaults = EngineParameters::defaults_for(model);
            write_parameter_file(path, &defaults)?;
            info!(path = %path.display(), "created parameter file with defaults");
            defaults
        };
        params.validate()?;
        Ok(Self {
            shadow: Mutex::new(params),
            pending: AtomicBool::new(false),
            path: Some(path.to_path_buf()),
            persist_on_set,
        })
    }

    /// Applies an edit to the shadow record, validates it and raises the
    /// pending flag. Rejected edits leave the record untouched.
    pub fn set(&self, edit: impl FnOnce(&mut EngineParameters)) -> EngineResult<()> {
        let mut guard = lock_shadow(&self.shadow);
        let mut candidate = *guard;
        edit(&mut candidate);
        candidate.validate()?;
        *guard = candidate;
        drop(guard);
        self.pending.store(true, Ordering::Release);
        if self.persist_on_set {
            self.save()?;
        }
        Ok(())
    }

    /// Hands the updated record to a stage, exactly once per update.
    ///
    /// Returns `None` while no update is pending, which is the per-frame
    /// fast path.
    pub fn take_pending(&self) -> Option<EngineParameters> {
        if self
            .pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(*lock_shadow(&self.shadow))
        } else {
            None
        }
    }

    /// Current shadow record, regardless of the pending flag.
    pub fn snapshot(&self) -> EngineParameters {
        *lock_shadow(&self.shadow)
    }

    /// Writes the shadow record to the parameter file.
    pub fn save(&self) -> EngineResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let params = *lock_shadow(&self.shadow);
        write_parameter_file(path, &params)
    }

    /// Re-reads the parameter file and raises the pending flag.
    pub fn reload(&self) -> EngineResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Err(EngineError::FileNotFound(path.clone()));
        }
        let text = std::fs::read_to_string(path)?;
        let params = toml::from_str::<EngineParameters>(&text)
            .map_err(|e| EngineError::ReadFailed(format!("{}: {e}", path.display())))?;
        params.validate()?;
        *lock_shadow(&self.shadow) = params;
        self.pending.store(true, Ordering::Release);
        Ok(())
    }
}

fn lock_shadow(shadow: &Mutex<EngineParameters>) -> std::sync::MutexGuard<'_, EngineParameters> {
    // A poisoned lock can only mean a panic inside one of the short critical
    // sections above; the record itself is plain data, so keep going.
    match shadow.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_parameter_file(path: &Path, params: &EngineParameters) -> EngineResult<()> {
    let text = toml::to_string_pretty(params)
        .map_err(|e| EngineError::InvalidParameter(format!("serialize parameters: {e}")))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        EngineParameters::defaults_for(CameraModel::Xc)
            .validate()
            .unwrap();
        EngineParameters::defaults_for(CameraModel::Vm)
            .validate()
            .unwrap();
    }

    #[test]
    fn test_invalid_block_size_rejected() {
        let mut params = EngineParameters::default();
        params.matching.blk_h = 5;
        assert!(matches!(
            params.validate(),
            Err(EngineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_set_rejects_and_keeps_old_record() {
        let store = ParameterStore::new(EngineParameters::default());
        let before = store.snapshot();
        let result = store.set(|p| p.system.band_count = 0);
        assert!(result.is_err());
        assert_eq!(store.snapshot(), before);
        assert!(store.take_pending().is_none());
    }

    #[test]
    fn test_pending_is_consumed_once() {
        let store = ParameterStore::new(EngineParameters::default());
        store.set(|p| p.matching.crst_thr = 55).unwrap();
        let taken = store.take_pending().unwrap();
        assert_eq!(taken.matching.crst_thr, 55);
        assert!(store.take_pending().is_none());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MatchingParameter_XC.toml");

        // First load creates the file with defaults.
        let store = ParameterStore::load_or_create(&path, CameraModel::Xc, true).unwrap();
        assert!(path.exists());
        store.set(|p| p.averaging.disp_ratio = 35).unwrap();

        // A second store sees exactly what the first one wrote.
        let reread = ParameterStore::load_or_create(&path, CameraModel::Xc, false).unwrap();
        assert_eq!(reread.snapshot(), store.snapshot());
        assert_eq!(reread.snapshot().averaging.disp_ratio, 35);
    }

    #[test]
    fn test_reload_raises_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        let store = ParameterStore::load_or_create(&path, CameraModel::Vm, false).unwrap();
        assert!(store.take_pending().is_none());
        store.reload().unwrap();
        assert!(store.take_pending().is_some());
    }

    #[test]
    fn test_parameter_value_accessors() {
        assert_eq!(ParameterValue::Int(7).as_f64(), Some(7.0));
        assert_eq!(ParameterValue::Bool(true).as_bool(), Some(true));
        assert_eq!(
            ParameterValue::Int(2).as_shutter(),
            Some(ShutterMode::Double)
        );
        assert_eq!(ParameterValue::String("x".into()).as_i64(), None);
    }
}
