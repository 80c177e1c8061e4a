use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::Error;
use crate::regressor::Regressor;

/// Raw predictions closer to zero than this cannot anchor a factor.
const MIN_RAW_PREDICTION: f32 = 1e-6;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Length,
    Width,
    Height,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::Length, Axis::Width, Axis::Height];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Length => f.write_str("length"),
            Axis::Width => f.write_str("width"),
            Axis::Height => f.write_str("height"),
        }
    }
}

/// Per-axis multipliers from model units to centimeters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CalibrationFactors {
    pub length: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for CalibrationFactors {
    fn default() -> Self {
        Self {
            length: 0.45,
            width: 0.45,
            height: 1.0,
        }
    }
}

impl CalibrationFactors {
    #[inline]
    pub fn get(&self, axis: Axis) -> f32 {
        match axis {
            Axis::Length => self.length,
            Axis::Width => self.width,
            Axis::Height => self.height,
        }
    }

    #[inline]
    pub fn apply(&self, raw: [f32; 3]) -> [f32; 3] {
        [
            raw[0] * self.length,
            raw[1] * self.width,
            raw[2] * self.height,
        ]
    }

    fn invalid_axis(&self) -> Option<Axis> {
        Axis::ALL
            .into_iter()
            .find(|&axis| !(self.get(axis).is_finite() && self.get(axis) > 0.0))
    }

    /// Factors mapping `raw` exactly onto `known`.
    pub fn from_reference(raw: [f32; 3], known: [f32; 3]) -> Result<Self, Error> {
        let mut factors = [0.0f32; 3];

        for (idx, axis) in Axis::ALL.into_iter().enumerate() {
            let (raw, known) = (raw[idx], known[idx]);
            let factor = known / raw;

            if raw.abs() < MIN_RAW_PREDICTION
                || !(known.is_finite() && known > 0.0)
                || !(factor.is_finite() && factor > 0.0)
            {
                return Err(Error::DegenerateCalibration { axis, raw, known });
            }

            factors[idx] = factor;
        }

        Ok(Self {
            length: factors[0],
            width: factors[1],
            height: factors[2],
        })
    }
}

/// Partial factor change, absent axes keep their value.
#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub struct FactorsUpdate {
    pub length: Option<f32>,
    pub width: Option<f32>,
    pub height: Option<f32>,
}

/// Calibration factors backed by a JSON file, rewritten on every change.
/// Writers are serialized; readers only wait for the in-memory swap.
pub struct CalibrationStore {
    path: PathBuf,
    factors: RwLock<CalibrationFactors>,
    writer: Mutex<()>,
}

impl CalibrationStore {
    /// Loads factors from `path`; a missing or unreadable file yields the
    /// built-in defaults.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let factors = Self::load(&path).unwrap_or_else(|| {
            tracing::info!("using default calibration factors");
            CalibrationFactors::default()
        });

        Self {
            path,
            factors: RwLock::new(factors),
            writer: Mutex::new(()),
        }
    }

    fn load(path: &Path) -> Option<CalibrationFactors> {
        if !path.exists() {
            return None;
        }

        let parsed = std::fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|content| Ok(serde_json::from_str::<CalibrationFactors>(&content)?));

        match parsed {
            Ok(factors) if factors.invalid_axis().is_none() => {
                tracing::info!("calibration loaded from {}: {:?}", path.display(), factors);
                Some(factors)
            }
            Ok(factors) => {
                tracing::warn!("ignoring non-positive calibration factors {:?}", factors);
                None
            }
            Err(err) => {
                tracing::warn!("failed to load calibration from {}: {}", path.display(), err);
                None
            }
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn factors(&self) -> CalibrationFactors {
        *self.factors.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn save(&self) -> Result<(), Error> {
        let _writer = self.lock_writer();
        self.commit(self.factors())
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes `factors` to disk, then publishes them. Callers hold the
    /// writer lock.
    fn commit(&self, factors: CalibrationFactors) -> Result<(), Error> {
        let content = serde_json::to_string_pretty(&factors)?;
        std::fs::write(&self.path, content)?;

        *self.factors.write().unwrap_or_else(PoisonError::into_inner) = factors;
        tracing::info!("calibration saved to {}: {:?}", self.path.display(), factors);

        Ok(())
    }

    /// Replaces all factors; memory only changes once the file is written.
    pub fn set(&self, factors: CalibrationFactors) -> Result<(), Error> {
        let _writer = self.lock_writer();
        self.commit(factors)
    }

    pub fn update(&self, update: FactorsUpdate) -> Result<CalibrationFactors, Error> {
        let _writer = self.lock_writer();

        let mut factors = self.factors();
        factors.length = update.length.unwrap_or(factors.length);
        factors.width = update.width.unwrap_or(factors.width);
        factors.height = update.height.unwrap_or(factors.height);

        if let Some(axis) = factors.invalid_axis() {
            return Err(Error::InvalidFactor {
                axis,
                value: factors.get(axis),
            });
        }

        self.commit(factors)?;
        tracing::info!("calibration factors updated: {:?}", factors);

        Ok(factors)
    }

    /// Runs the regressor once on `reference` and derives factors from its
    /// `known` length, width and height in centimeters. The stored factors
    /// are left untouched on failure.
    pub fn calibrate<I, R: Regressor<I> + ?Sized>(
        &self,
        regressor: &mut R,
        reference: &I,
        known: [f32; 3],
    ) -> Result<CalibrationFactors, Error> {
        let outputs = regressor.infer(std::slice::from_ref(reference))?;
        let raw = match outputs.as_slice() {
            [raw] => *raw,
            _ => {
                return Err(Error::BatchSizeMismatch {
                    expected: 1,
                    got: outputs.len(),
                })
            }
        };

        let factors = CalibrationFactors::from_reference(raw, known)?;
        self.set(factors)?;
        tracing::info!("calibrated against reference, raw {:?} -> {:?}", raw, factors);

        Ok(factors)
    }
}
