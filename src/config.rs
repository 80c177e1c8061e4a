use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::quality::QualityParams;

/// Tunables for the whole pipeline. Every field has a default so a partial
/// TOML file is enough.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Consecutive stable frames required before a view can qualify
    #[serde(default = "default_min_stable_frames")]
    pub min_stable_frames: u32,
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: f32,
    /// Linear growth applied to detector boxes before cropping
    #[serde(default = "default_bbox_expansion_factor")]
    pub bbox_expansion_factor: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_drain_interval_seconds")]
    pub drain_interval_seconds: f32,
    /// Qualify every track regardless of stability and quality (testing only)
    #[serde(default)]
    pub force_qualify_override: bool,

    /// Detections below this confidence are ignored
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Accepted estimates lie strictly inside (min, max), in centimeters
    #[serde(default = "default_min_dimension_cm")]
    pub min_dimension_cm: f32,
    #[serde(default = "default_max_dimension_cm")]
    pub max_dimension_cm: f32,
    /// A submitted track without a result after this long becomes resubmittable
    #[serde(default = "default_submission_timeout_seconds")]
    pub submission_timeout_seconds: f32,
    #[serde(default = "default_track_max_age_seconds")]
    pub track_max_age_seconds: f32,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: f32,
    #[serde(default = "default_result_max_age_seconds")]
    pub result_max_age_seconds: f32,

    #[serde(default = "default_calibration_path")]
    pub calibration_path: PathBuf,

    /// Directory receiving periodic ROI snapshots of tracked boxes
    #[serde(default)]
    pub debug_roi_dir: Option<PathBuf>,
    /// Snapshot every n-th frame
    #[serde(default = "default_debug_roi_every")]
    pub debug_roi_every: u64,

    #[serde(default)]
    pub quality: QualityParams,
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub path: PathBuf,
    /// Square input side of the regression network
    #[serde(default = "default_input_size")]
    pub input_size: i32,
}

fn default_min_stable_frames() -> u32 {
    10
}

fn default_min_quality_score() -> f32 {
    0.5
}

fn default_bbox_expansion_factor() -> f32 {
    1.1
}

fn default_batch_size() -> usize {
    4
}

fn default_drain_interval_seconds() -> f32 {
    0.5
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_min_dimension_cm() -> f32 {
    0.5
}

fn default_max_dimension_cm() -> f32 {
    300.0
}

fn default_submission_timeout_seconds() -> f32 {
    30.0
}

fn default_track_max_age_seconds() -> f32 {
    60.0
}

fn default_sweep_interval_seconds() -> f32 {
    5.0
}

fn default_result_max_age_seconds() -> f32 {
    300.0
}

fn default_calibration_path() -> PathBuf {
    PathBuf::from("calibration_factors.json")
}

fn default_debug_roi_every() -> u64 {
    30
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/model_dimensions.onnx")
}

fn default_input_size() -> i32 {
    224
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_stable_frames: default_min_stable_frames(),
            min_quality_score: default_min_quality_score(),
            bbox_expansion_factor: default_bbox_expansion_factor(),
            batch_size: default_batch_size(),
            drain_interval_seconds: default_drain_interval_seconds(),
            force_qualify_override: false,
            min_confidence: default_min_confidence(),
            min_dimension_cm: default_min_dimension_cm(),
            max_dimension_cm: default_max_dimension_cm(),
            submission_timeout_seconds: default_submission_timeout_seconds(),
            track_max_age_seconds: default_track_max_age_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            result_max_age_seconds: default_result_max_age_seconds(),
            calibration_path: default_calibration_path(),
            debug_roi_dir: None,
            debug_roi_every: default_debug_roi_every(),
            quality: QualityParams::default(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            input_size: default_input_size(),
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        let durations = [
            ("drain_interval_seconds", self.drain_interval_seconds),
            ("submission_timeout_seconds", self.submission_timeout_seconds),
            ("track_max_age_seconds", self.track_max_age_seconds),
            ("sweep_interval_seconds", self.sweep_interval_seconds),
            ("result_max_age_seconds", self.result_max_age_seconds),
        ];

        for (name, secs) in durations {
            if secs.is_nan() || secs <= 0.0 || Duration::try_from_secs_f32(secs).is_err() {
                return Err(invalid(format!("{} must be a positive duration, got {}", name, secs)));
            }
        }

        if self.batch_size == 0 {
            return Err(invalid("batch_size must be at least 1".to_string()));
        }

        if !(self.min_dimension_cm.is_finite()
            && self.max_dimension_cm.is_finite()
            && self.min_dimension_cm < self.max_dimension_cm)
        {
            return Err(invalid(format!(
                "dimension range ({}, {}) is empty",
                self.min_dimension_cm, self.max_dimension_cm
            )));
        }

        if !(self.bbox_expansion_factor.is_finite() && self.bbox_expansion_factor > 0.0) {
            return Err(invalid(format!(
                "bbox_expansion_factor must be positive, got {}",
                self.bbox_expansion_factor
            )));
        }

        if !self.min_quality_score.is_finite() || !self.min_confidence.is_finite() {
            return Err(invalid("score thresholds must be finite".to_string()));
        }

        if self.debug_roi_every == 0 {
            return Err(invalid("debug_roi_every must be at least 1".to_string()));
        }

        if self.quality.line_saturation == 0 {
            return Err(invalid("quality.line_saturation must be at least 1".to_string()));
        }

        Ok(())
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("using default config, {} not loaded: {}", path.display(), err);
                Self::default()
            }
        }
    }

    #[inline]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs_f32(self.drain_interval_seconds)
    }

    #[inline]
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.submission_timeout_seconds)
    }

    #[inline]
    pub fn track_max_age(&self) -> Duration {
        Duration::from_secs_f32(self.track_max_age_seconds)
    }

    #[inline]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f32(self.sweep_interval_seconds)
    }

    #[inline]
    pub fn result_max_age(&self) -> Duration {
        Duration::from_secs_f32(self.result_max_age_seconds)
    }

    /// Whether an estimate in centimeters passes the plausibility gate.
    #[inline]
    pub fn is_plausible(&self, dimension_cm: f32) -> bool {
        dimension_cm > self.min_dimension_cm && dimension_cm < self.max_dimension_cm
    }
}

#[inline]
fn invalid(reason: String) -> Error {
    Error::InvalidConfig(reason)
}
