pub mod annotate;
pub mod bbox;
pub mod calibration;
pub mod config;
pub mod detection;
pub mod error;
pub mod estimation;
pub mod frame;
pub mod lifecycle;
pub mod pipeline;
pub mod quality;
pub mod regressor;
pub mod report;
pub mod source;
pub mod video;

pub use calibration::{CalibrationFactors, CalibrationStore};
pub use config::PipelineConfig;
pub use detection::{Detection, TrackId};
pub use error::Error;
pub use estimation::{EstimationQueue, Worker};
pub use frame::Frame;
pub use lifecycle::{Lifecycle, TrackState};
pub use pipeline::{FrameOutput, Pipeline};
pub use quality::QualityEvaluator;
pub use regressor::{OnnxRegressor, Regressor};
pub use report::{DimensionReport, OutboundEvent};
