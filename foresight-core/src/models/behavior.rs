//! Behavior predictor: next-action classifier
//!
//! Gaussian naive Bayes over standardized features. Posteriors are normalized
//! with log-sum-exp, so the reported confidence always lies in [0, 1].

use super::{holdout_split, now, ModelSlot, Standardizer, Trained, TrainingResult};
use crate::error::{Error, Result};
use crate::types::{ActionPrediction, ModelKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::Arc;

/// Floor applied to every per-class feature variance
const VARIANCE_FLOOR: f64 = 1e-3;

const MODEL: ModelKind = ModelKind::BehaviorPrediction;

/// Per-label sufficient statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassModel {
    pub label: String,
    pub log_prior: f64,
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
    /// Index of the last training example carrying this label
    pub last_seen: usize,
}

/// Complete fitted state of the classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorParams {
    pub scaler: Standardizer,
    /// Sorted by label
    pub classes: Vec<ClassModel>,
}

impl BehaviorParams {
    /// Fit on examples; `features` and `labels` must be the same non-zero length.
    pub fn fit(features: &[Vec<f64>], labels: &[String]) -> Self {
        let scaler = Standardizer::fit(features);
        let rows: Vec<Vec<f64>> = features.iter().map(|f| scaler.transform(f)).collect();
        let n = rows.len() as f64;
        let width = scaler.width();

        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, label) in labels.iter().enumerate() {
            groups.entry(label.as_str()).or_default().push(i);
        }

        let classes = groups
            .into_iter()
            .map(|(label, members)| {
                let count = members.len() as f64;
                let means: Vec<f64> = (0..width)
                    .map(|j| members.iter().map(|&i| rows[i][j]).sum::<f64>() / count)
                    .collect();
                let variances = (0..width)
                    .map(|j| {
                        let var = members
                            .iter()
                            .map(|&i| (rows[i][j] - means[j]).powi(2))
                            .sum::<f64>()
                            / count;
                        var.max(VARIANCE_FLOOR)
                    })
                    .collect();
                ClassModel {
                    label: label.to_string(),
                    log_prior: (count / n).ln(),
                    means,
                    variances,
                    last_seen: members.last().copied().unwrap_or(0),
                }
            })
            .collect();

        Self { scaler, classes }
    }

    fn log_joint(&self, class: &ClassModel, z: &[f64]) -> f64 {
        class.log_prior
            + z.iter()
                .zip(class.means.iter().zip(&class.variances))
                .map(|(x, (mean, var))| -0.5 * ((TAU * var).ln() + (x - mean).powi(2) / var))
                .sum::<f64>()
    }

    /// Posterior over every label, best first.
    ///
    /// Ties go to the label observed most recently in training.
    pub fn predict(&self, features: &[f64]) -> Result<ActionPrediction> {
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
        let mut scored: Vec<(&ClassModel, f64)> = self
            .classes
            .iter()
            .map(|class| (class, self.log_joint(class, &z)))
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });

        let max = scored.first().map_or(0.0, |(_, s)| *s);
        let log_norm = max + scored.iter().map(|(_, s)| (s - max).exp()).sum::<f64>().ln();
        let probabilities: Vec<(String, f64)> = scored
            .iter()
            .map(|(class, s)| (class.label.clone(), (s - log_norm).exp().clamp(0.0, 1.0)))
            .collect();

        let (action_type, confidence) = probabilities
            .first()
            .cloned()
            .ok_or(Error::NotTrained { model: MODEL.as_str() })?;

        Ok(ActionPrediction {
            action_type,
            confidence,
            probabilities,
        })
    }

    /// Share of examples whose predicted label matches.
    pub fn score(&self, features: &[Vec<f64>], labels: &[String]) -> Result<f64> {
        if features.is_empty() {
            return Ok(0.0);
        }
        let mut correct = 0usize;
        for (x, label) in features.iter().zip(labels) {
            if self.predict(x)?.action_type == *label {
                correct += 1;
            }
        }
        Ok(correct as f64 / features.len() as f64)
    }

    /// Examples whose best posterior falls below `threshold`.
    ///
    /// Yields `(index, anomaly score, expected label)` with a score of
    /// `1 - confidence`, most anomalous first.
    pub fn anomalies(&self, features: &[Vec<f64>], threshold: f64) -> Result<Vec<(usize, f64, String)>> {
        let mut flagged = Vec::new();
        for (i, x) in features.iter().enumerate() {
            let prediction = self.predict(x)?;
            if prediction.confidence < threshold {
                flagged.push((i, 1.0 - prediction.confidence, prediction.action_type));
            }
        }
        flagged.sort_by(|(ia, a, _), (ib, b, _)| b.total_cmp(a).then_with(|| ib.cmp(ia)));
        Ok(flagged)
    }
}

/// Next-action classifier with an atomically swapped parameter set
#[derive(Debug)]
pub struct BehaviorPredictor {
    slot: ModelSlot<BehaviorParams>,
    min_samples: usize,
    holdout_fraction: f64,
}

impl BehaviorPredictor {
    pub fn new(min_samples: usize, holdout_fraction: f64) -> Self {
        Self {
            slot: ModelSlot::default(),
            min_samples: min_samples.max(1),
            holdout_fraction,
        }
    }

    /// Fit a candidate without touching the live parameters.
    pub fn fit(
        &self,
        features: &[Vec<f64>],
        labels: &[String],
    ) -> Result<(Trained<BehaviorParams>, TrainingResult)> {
        if features.len() != labels.len() {
            return Err(Error::validation(
                "labels",
                format!("{} labels for {} feature vectors", labels.len(), features.len()),
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
                let partial = BehaviorParams::fit(&features[..split], &labels[..split]);
                Some(partial.score(&features[split..], &labels[split..])?)
            }
            None => None,
        };

        let params = BehaviorParams::fit(features, labels);
        let training_score = params.score(features, labels)?;
        let trained_at = now();

        let result = TrainingResult {
            model: MODEL,
            samples: features.len(),
            classes: Some(params.classes.len()),
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
    pub fn commit(&self, trained: Trained<BehaviorParams>) -> Arc<Trained<BehaviorParams>> {
        tracing::info!(
            model = %MODEL,
            samples = trained.sample_count,
            classes = trained.params.classes.len(),
            "Installed model parameters"
        );
        self.slot.replace(trained)
    }

    /// Fit and install in one step.
    pub fn train(&self, features: &[Vec<f64>], labels: &[String]) -> Result<TrainingResult> {
        let (trained, result) = self.fit(features, labels)?;
        self.commit(trained);
        Ok(result)
    }

    pub fn predict(&self, features: &[f64]) -> Result<ActionPrediction> {
        let trained = self.slot.snapshot().ok_or(Error::NotTrained {
            model: MODEL.as_str(),
        })?;
        trained.params.predict(features)
    }

    pub fn score(&self, features: &[Vec<f64>], labels: &[String]) -> Result<f64> {
        let trained = self.slot.snapshot().ok_or(Error::NotTrained {
            model: MODEL.as_str(),
        })?;
        trained.params.score(features, labels)
    }

    pub fn anomalies(&self, features: &[Vec<f64>], threshold: f64) -> Result<Vec<(usize, f64, String)>> {
        let trained = self.slot.snapshot().ok_or(Error::NotTrained {
            model: MODEL.as_str(),
        })?;
        trained.params.anomalies(features, threshold)
    }

    pub fn is_trained(&self) -> bool {
        self.slot.is_trained()
    }

    pub fn snapshot(&self) -> Option<Arc<Trained<BehaviorParams>>> {
        self.slot.snapshot()
    }
}
