//! System optimizer: CPU/memory forecaster
//!
//! One ridge regression per output on standardized features, solved from the
//! normal equations. Forecasts are clamped to [0, 100] before they leave this
//! module.

use super::linalg::solve;
use super::{holdout_split, now, ModelSlot, Standardizer, Trained, TrainingResult};
use crate::error::{Error, Result};
use crate::types::{LoadForecast, ModelKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Smallest L2 penalty used; keeps the normal equations non-singular
const MIN_PENALTY: f64 = 1e-6;

const MODEL: ModelKind = ModelKind::SystemOptimization;

/// Linear model for one output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearOutput {
    pub intercept: f64,
    pub weights: Vec<f64>,
}

impl LinearOutput {
    fn fit(rows: &[Vec<f64>], targets: &[f64], penalty: f64) -> Result<Self> {
        let width = rows.first().map_or(0, Vec::len);
        let n = targets.len().max(1) as f64;
        let intercept = targets.iter().sum::<f64>() / n;

        // Columns are centered by the standardizer, so the intercept is the target mean.
        let mut gram = vec![vec![0.0; width]; width];
        let mut rhs = vec![0.0; width];
        for (row, y) in rows.iter().zip(targets) {
            let centered = y - intercept;
            for i in 0..width {
                rhs[i] += row[i] * centered;
                for j in i..width {
                    gram[i][j] += row[i] * row[j];
                }
            }
        }
        for i in 0..width {
            for j in 0..i {
                gram[i][j] = gram[j][i];
            }
            gram[i][i] += penalty.max(MIN_PENALTY);
        }

        let weights = solve(gram, rhs)
            .filter(|w| w.iter().all(|v| v.is_finite()))
            .ok_or_else(|| Error::ModelFit {
                model: MODEL.as_str(),
                message: "normal equations have no finite solution".to_string(),
            })?;
        Ok(Self { intercept, weights })
    }

    fn predict(&self, z: &[f64]) -> f64 {
        self.intercept + self.weights.iter().zip(z).map(|(w, x)| w * x).sum::<f64>()
    }
}

/// Complete fitted state of the forecaster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerParams {
    pub scaler: Standardizer,
    pub cpu: LinearOutput,
    pub memory: LinearOutput,
    pub horizon: usize,
}

impl OptimizerParams {
    pub fn fit(
        features: &[Vec<f64>],
        targets: &[[f64; 2]],
        penalty: f64,
        horizon: usize,
    ) -> Result<Self> {
        let scaler = Standardizer::fit(features);
        let rows: Vec<Vec<f64>> = features.iter().map(|f| scaler.transform(f)).collect();
        let cpu: Vec<f64> = targets.iter().map(|t| t[0]).collect();
        let memory: Vec<f64> = targets.iter().map(|t| t[1]).collect();

        Ok(Self {
            cpu: LinearOutput::fit(&rows, &cpu, penalty)?,
            memory: LinearOutput::fit(&rows, &memory, penalty)?,
            scaler,
            horizon,
        })
    }

    /// Forecast clamped into the valid percentage range.
    pub fn predict(&self, features: &[f64]) -> Result<LoadForecast> {
        if features.len() != self.scaler.width() {
            return Err(Error::validation(
                "features",
                format!(
                    "expected {} values, got {}",
                    self.scaler.width(),
                    features.len()
                ),
            ));
        }
        let z = self.scaler.transform(features);
        Ok(LoadForecast {
            cpu_usage: self.cpu.predict(&z).clamp(0.0, 100.0),
            memory_usage: self.memory.predict(&z).clamp(0.0, 100.0),
            horizon: self.horizon,
        })
    }

    /// Root mean squared error over both outputs.
    pub fn rmse(&self, features: &[Vec<f64>], targets: &[[f64; 2]]) -> Result<f64> {
        if features.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for (x, target) in features.iter().zip(targets) {
            let forecast = self.predict(x)?;
            total += (forecast.cpu_usage - target[0]).powi(2);
            total += (forecast.memory_usage - target[1]).powi(2);
        }
        Ok((total / (2 * features.len()) as f64).sqrt())
    }
}

/// Resource forecaster with an atomically swapped parameter set
#[derive(Debug)]
pub struct SystemOptimizer {
    slot: ModelSlot<OptimizerParams>,
    min_samples: usize,
    penalty: f64,
    horizon: usize,
    holdout_fraction: f64,
}

impl SystemOptimizer {
    pub fn new(min_samples: usize, penalty: f64, horizon: usize, holdout_fraction: f64) -> Self {
        Self {
            slot: ModelSlot::default(),
            min_samples: min_samples.max(1),
            penalty,
            horizon: horizon.max(1),
            holdout_fraction,
        }
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Fit a candidate without touching the live parameters.
    pub fn fit(
        &self,
        features: &[Vec<f64>],
        targets: &[[f64; 2]],
    ) -> Result<(Trained<OptimizerParams>, TrainingResult)> {
        if features.len() != targets.len() {
            return Err(Error::validation(
                "targets",
                format!("{} targets for {} feature vectors", targets.len(), features.len()),
            ));
        }
        if features.len() < self.min_samples {
            return Err(Error::InsufficientData {
                model: MODEL.as_str(),
                required: self.min_samples,
                available: features.len(),
            });
        }

        let holdout_score = match holdout_split(features.len(), self.holdout_fraction) {
            Some(split) => {
                let partial = OptimizerParams::fit(
                    &features[..split],
                    &targets[..split],
                    self.penalty,
                    self.horizon,
                )?;
                Some(partial.rmse(&features[split..], &targets[split..])?)
            }
            None => None,
        };

        let params = OptimizerParams::fit(features, targets, self.penalty, self.horizon)?;
        let training_score = params.rmse(features, targets)?;
        let trained_at = now();

        let result = TrainingResult {
            model: MODEL,
            samples: features.len(),
            classes: None,
            training_score,
            holdout_score,
            trained_at,
        };
        let trained = Trained {
            params,
            trained_at,
            sample_count: features.len(),
        };
        Ok((trained, result))
    }

    /// Install fitted parameters.
    pub fn commit(&self, trained: Trained<OptimizerParams>) -> Arc<Trained<OptimizerParams>> {
        tracing::info!(
            model = %MODEL,
            samples = trained.sample_count,
            horizon = trained.params.horizon,
            "Installed model parameters"
        );
        self.slot.replace(trained)
    }

    /// Fit and install in one step.
    pub fn train(&self, features: &[Vec<f64>], targets: &[[f64; 2]]) -> Result<TrainingResult> {
        let (trained, result) = self.fit(features, targets)?;
        self.commit(trained);
        Ok(result)
    }

    pub fn predict(&self, features: &[f64]) -> Result<LoadForecast> {
        let trained = self.slot.snapshot().ok_or(Error::NotTrained {
            model: MODEL.as_str(),
        })?;
        trained.params.predict(features)
    }

    pub fn is_trained(&self) -> bool {
        self.slot.is_trained()
    }

    pub fn snapshot(&self) -> Option<Arc<Trained<OptimizerParams>>> {
        self.slot.snapshot()
    }
}
