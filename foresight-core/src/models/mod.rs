//! Predictive models
//!
//! Two small models share the same lifecycle: `untrained → trained`. Training
//! builds a complete parameter set off to the side; [`ModelSlot::replace`]
//! then swaps it in under a brief write lock. Predictors clone the current
//! `Arc` and never observe a partial update.

pub mod behavior;
mod linalg;
pub mod optimizer;

pub use behavior::{BehaviorParams, BehaviorPredictor};
pub use optimizer::{OptimizerParams, SystemOptimizer};

use crate::types::ModelKind;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// A fitted parameter set with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trained<P> {
    pub params: P,
    pub trained_at: DateTime<Utc>,
    /// Examples the parameters were fitted on
    pub sample_count: usize,
}

/// Current parameters of one model, swapped atomically
#[derive(Debug)]
pub struct ModelSlot<P> {
    current: RwLock<Option<Arc<Trained<P>>>>,
}

impl<P> Default for ModelSlot<P> {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }
}

impl<P> ModelSlot<P> {
    /// Immutable handle on the current parameters, if trained.
    pub fn snapshot(&self) -> Option<Arc<Trained<P>>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a new parameter set and return a handle to it.
    pub fn replace(&self, trained: Trained<P>) -> Arc<Trained<P>> {
        let trained = Arc::new(trained);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(trained.clone());
        trained
    }

    pub fn is_trained(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Outcome of one successful fit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingResult {
    pub model: ModelKind,
    pub samples: usize,
    /// Distinct labels (behavior predictor only)
    pub classes: Option<usize>,
    /// Accuracy for the behavior predictor, RMSE for the optimizer
    pub training_score: f64,
    /// Same measure on the trailing holdout, when one exists
    pub holdout_score: Option<f64>,
    pub trained_at: DateTime<Utc>,
}

/// Per-feature centering and scaling learned at fit time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl Standardizer {
    /// Learn means and standard deviations column by column.
    ///
    /// Constant columns get a scale of 1 and therefore standardize to zero.
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let width = rows.first().map_or(0, Vec::len);
        let n = rows.len().max(1) as f64;

        let means: Vec<f64> = (0..width)
            .map(|j| rows.iter().map(|r| r[j]).sum::<f64>() / n)
            .collect();
        let scales = (0..width)
            .map(|j| {
                let var = rows.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                if std > 1e-9 {
                    std
                } else {
                    1.0
                }
            })
            .collect();

        Self { means, scales }
    }

    pub fn width(&self) -> usize {
        self.means.len()
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(x, (mean, scale))| (x - mean) / scale)
            .collect()
    }
}

/// Training timestamp at the precision the database stores.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Index splitting leading training rows from the trailing holdout.
///
/// `None` when either side would be empty.
pub(crate) fn holdout_split(n: usize, fraction: f64) -> Option<usize> {
    let holdout = (n as f64 * fraction).floor() as usize;
    if holdout == 0 || holdout >= n {
        None
    } else {
        Some(n - holdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standardizer_centers_and_scales() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let scaler = Standardizer::fit(&rows);
        assert_eq!(scaler.means, vec![2.0, 5.0]);
        assert_eq!(scaler.scales, vec![1.0, 1.0]);
        assert_eq!(scaler.transform(&[3.0, 5.0]), vec![1.0, 0.0]);
        assert_eq!(scaler.transform(&[1.0, 7.0]), vec![-1.0, 2.0]);
    }

    #[test]
    fn test_holdout_split() {
        assert_eq!(holdout_split(10, 0.2), Some(8));
        assert_eq!(holdout_split(4, 0.2), None);
        assert_eq!(holdout_split(10, 0.0), None);
    }

    #[test]
    fn test_slot_swap() {
        let slot: ModelSlot<u32> = ModelSlot::default();
        assert!(!slot.is_trained());
        assert!(slot.snapshot().is_none());

        let first = slot.replace(Trained {
            params: 1,
            trained_at: Utc::now(),
            sample_count: 10,
        });
        let held = slot.snapshot().unwrap();
        slot.replace(Trained {
            params: 2,
            trained_at: Utc::now(),
            sample_count: 12,
        });

        // Earlier handles keep the parameters they were taken with
        assert_eq!(held.params, 1);
        assert_eq!(first.params, 1);
        assert_eq!(slot.snapshot().unwrap().params, 2);
    }
}
