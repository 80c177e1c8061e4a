use thiserror::Error;

use crate::calibration::Axis;

#[derive(Debug, Error)]
pub enum Error {
    #[error("OpenCV Error: {0}")]
    OpenCvError(#[from] opencv::Error),

    #[error("OnnxRuntime Error: {0}")]
    OrtError(#[from] ort::Error),

    #[error("Shape Error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config Error: {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("degenerate calibration on {axis}: raw prediction {raw}, known {known} cm")]
    DegenerateCalibration { axis: Axis, raw: f32, known: f32 },

    #[error("calibration factor for {axis} must be positive and finite, got {value}")]
    InvalidFactor { axis: Axis, value: f32 },

    #[error("regressor returned {got} outputs for a batch of {expected}")]
    BatchSizeMismatch { expected: usize, got: usize },

    #[error("estimation worker is not running")]
    WorkerStopped,

    #[error("track source: {0}")]
    SourceError(String),
}
