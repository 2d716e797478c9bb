//! Feature builder
//!
//! Turns windows of raw events into fixed-width numeric vectors. Everything
//! here is a pure function of its inputs; the vector width depends only on
//! [`FeatureConfig`].
//!
//! Layout:
//!
//! | Slot | Width | Content |
//! |------|-------|---------|
//! | time | 4 | sin/cos of hour of day, sin/cos of weekday (UTC) |
//! | categories | `category_buckets` | action counts per hashed `action_type` |
//! | metrics | 7 | mean/variance of cpu, memory, disk; mean processes / 1000 |
//! | application | `application_buckets` | one-hot hashed name of the newest application |

use crate::config::FeatureConfig;
use crate::types::{SystemMetric, UserAction};
use chrono::{DateTime, Datelike, Timelike, Utc};
use sha2::{Digest, Sha256};
use std::f64::consts::TAU;

const TIME_WIDTH: usize = 4;
const METRIC_WIDTH: usize = 7;

/// Offsets of each slot inside a feature vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureLayout {
    pub category_buckets: usize,
    pub application_buckets: usize,
}

impl FeatureLayout {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            category_buckets: config.category_buckets.max(1),
            application_buckets: config.application_buckets.max(1),
        }
    }

    /// Total vector width
    pub fn len(&self) -> usize {
        TIME_WIDTH + self.category_buckets + METRIC_WIDTH + self.application_buckets
    }

    pub fn categories_offset(&self) -> usize {
        TIME_WIDTH
    }

    pub fn metrics_offset(&self) -> usize {
        TIME_WIDTH + self.category_buckets
    }

    pub fn application_offset(&self) -> usize {
        self.metrics_offset() + METRIC_WIDTH
    }
}

/// Stable bucket for an open string category.
///
/// SHA-256 of the UTF-8 label, first eight bytes little-endian, modulo `buckets`.
pub fn bucket(label: &str, buckets: usize) -> usize {
    let digest = Sha256::digest(label.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(head) % buckets.max(1) as u64) as usize
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

/// Mean and population variance; variance is 0 below two samples.
fn mean_variance(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    (mean, variance)
}

/// Build one feature vector from event windows (both oldest first).
///
/// Only the last `action_window` actions and last `metric_window` metrics are
/// read. Empty inputs yield neutral zeros, never an error.
pub fn build_features(
    config: &FeatureConfig,
    actions: &[UserAction],
    metrics: &[SystemMetric],
) -> Vec<f64> {
    let layout = FeatureLayout::new(config);
    let actions = tail(actions, config.action_window);
    let metrics = tail(metrics, config.metric_window);
    let mut features = vec![0.0; layout.len()];

    let newest: Option<DateTime<Utc>> = actions
        .last()
        .map(|a| a.timestamp)
        .max(metrics.last().map(|m| m.timestamp));
    if let Some(ts) = newest {
        let hour = TAU * ts.hour() as f64 / 24.0;
        let weekday = TAU * ts.weekday().num_days_from_monday() as f64 / 7.0;
        features[0] = hour.sin();
        features[1] = hour.cos();
        features[2] = weekday.sin();
        features[3] = weekday.cos();
    }

    let categories = layout.categories_offset();
    for action in actions {
        features[categories + bucket(&action.action_type, layout.category_buckets)] += 1.0;
    }

    let offset = layout.metrics_offset();
    let (cpu_mean, cpu_var) = mean_variance(metrics.iter().map(|m| m.cpu_usage));
    let (mem_mean, mem_var) = mean_variance(metrics.iter().map(|m| m.memory_usage));
    let (disk_mean, disk_var) = mean_variance(metrics.iter().map(|m| m.disk_usage));
    let (proc_mean, _) = mean_variance(metrics.iter().map(|m| m.active_processes as f64));
    features[offset..offset + METRIC_WIDTH].copy_from_slice(&[
        cpu_mean,
        cpu_var,
        mem_mean,
        mem_var,
        disk_mean,
        disk_var,
        proc_mean / 1000.0,
    ]);

    if let Some(last) = actions.last() {
        features[layout.application_offset() + bucket(&last.application, layout.application_buckets)] = 1.0;
    }

    features
}

/// Number of metrics whose timestamp is at or before `ts` (metrics are time ordered).
fn metrics_until(metrics: &[SystemMetric], ts: DateTime<Utc>) -> usize {
    metrics.partition_point(|m| m.timestamp <= ts)
}

fn actions_until(actions: &[UserAction], ts: DateTime<Utc>) -> usize {
    actions.partition_point(|a| a.timestamp <= ts)
}

/// Training examples for the behavior predictor.
///
/// Example `i` describes the context just before action `i` and is labelled
/// with that action's type, so `n` actions give `n` examples.
pub fn behavior_examples(
    config: &FeatureConfig,
    actions: &[UserAction],
    metrics: &[SystemMetric],
) -> (Vec<Vec<f64>>, Vec<String>) {
    actions
        .iter()
        .enumerate()
        .map(|(i, action)| {
            let visible = &metrics[..metrics_until(metrics, action.timestamp)];
            (
                build_features(config, &actions[..i], visible),
                action.action_type.clone(),
            )
        })
        .unzip()
}

/// Training examples for the system optimizer.
///
/// Example `i` describes everything up to metric `i`; its targets are the cpu
/// and memory of metric `i + horizon`.
pub fn optimizer_examples(
    config: &FeatureConfig,
    horizon: usize,
    actions: &[UserAction],
    metrics: &[SystemMetric],
) -> (Vec<Vec<f64>>, Vec<[f64; 2]>) {
    let horizon = horizon.max(1);
    (0..metrics.len().saturating_sub(horizon))
        .map(|i| {
            let visible = &actions[..actions_until(actions, metrics[i].timestamp)];
            let target = &metrics[i + horizon];
            (
                build_features(config, visible, &metrics[..=i]),
                [target.cpu_usage, target.memory_usage],
            )
        })
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> FeatureConfig {
        FeatureConfig {
            category_buckets: 4,
            application_buckets: 8,
            action_window: 3,
            metric_window: 2,
        }
    }

    fn action(minute: u32, action_type: &str, application: &str) -> UserAction {
        UserAction {
            action_type: action_type.to_string(),
            application: application.to_string(),
            // 2025-03-10 is a Monday
            timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 6, minute, 0).unwrap(),
            duration_seconds: 0.0,
            success: true,
        }
    }

    fn metric(minute: u32, cpu: f64) -> SystemMetric {
        SystemMetric {
            timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 6, minute, 30).unwrap(),
            cpu_usage: cpu,
            memory_usage: 50.0,
            disk_usage: 10.0,
            active_processes: 200,
        }
    }

    #[test]
    fn test_width_is_fixed() {
        let config = config();
        let width = FeatureLayout::new(&config).len();
        assert_eq!(width, 4 + 4 + 7 + 8);

        assert_eq!(build_features(&config, &[], &[]).len(), width);
        let actions: Vec<_> = (0..10).map(|m| action(m, "click", "editor")).collect();
        let metrics: Vec<_> = (0..10).map(|m| metric(m, 20.0)).collect();
        assert_eq!(build_features(&config, &actions, &metrics).len(), width);
        assert_eq!(build_features(&config, &actions[..1], &[]).len(), width);
    }

    #[test]
    fn test_empty_input_is_all_zero() {
        let features = build_features(&config(), &[], &[]);
        assert!(features.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_deterministic() {
        let config = config();
        let actions = vec![action(0, "click", "editor"), action(1, "scroll", "browser")];
        let metrics = vec![metric(0, 10.0), metric(1, 30.0)];
        let a = build_features(&config, &actions, &metrics);
        let b = build_features(&config, &actions.clone(), &metrics.clone());
        assert_eq!(
            a.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_time_encoding_uses_newest_event() {
        let features = build_features(&config(), &[action(0, "click", "editor")], &[]);
        // 06:00 is a quarter turn
        assert!((features[0] - 1.0).abs() < 1e-12);
        assert!(features[1].abs() < 1e-12);
        // Monday is weekday zero
        assert!(features[2].abs() < 1e-12);
        assert!((features[3] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_category_counts_respect_window() {
        let config = config();
        let layout = FeatureLayout::new(&config);
        let actions: Vec<_> = (0..5).map(|m| action(m, "click", "editor")).collect();
        let features = build_features(&config, &actions, &[]);

        let counts = &features[layout.categories_offset()..layout.metrics_offset()];
        assert_eq!(counts.iter().sum::<f64>(), 3.0);
        assert_eq!(counts[bucket("click", 4)], 3.0);
    }

    #[test]
    fn test_metric_statistics() {
        let config = config();
        let offset = FeatureLayout::new(&config).metrics_offset();

        let single = build_features(&config, &[], &[metric(0, 40.0)]);
        assert_eq!(single[offset], 40.0);
        assert_eq!(single[offset + 1], 0.0);
        assert_eq!(single[offset + 6], 0.2);

        // Window of two: mean of 20 and 40, population variance 100
        let metrics = vec![metric(0, 90.0), metric(1, 20.0), metric(2, 40.0)];
        let features = build_features(&config, &[], &metrics);
        assert_eq!(features[offset], 30.0);
        assert_eq!(features[offset + 1], 100.0);
        assert_eq!(features[offset + 3], 0.0);
    }

    #[test]
    fn test_application_one_hot() {
        let config = config();
        let layout = FeatureLayout::new(&config);
        let actions = vec![action(0, "click", "editor"), action(1, "click", "terminal")];
        let features = build_features(&config, &actions, &[]);

        let apps = &features[layout.application_offset()..];
        assert_eq!(apps.iter().sum::<f64>(), 1.0);
        assert_eq!(apps[bucket("terminal", 8)], 1.0);
    }

    #[test]
    fn test_bucket_is_stable_and_bounded() {
        assert_eq!(bucket("text_editing", 16), bucket("text_editing", 16));
        for label in ["a", "b", "click", "some-long-application-name.exe"] {
            assert!(bucket(label, 5) < 5);
        }
        assert_eq!(bucket("anything", 0), 0);
    }

    #[test]
    fn test_behavior_examples_use_only_prior_context() {
        let config = config();
        let actions = vec![
            action(0, "open", "editor"),
            action(1, "type", "editor"),
            action(2, "save", "editor"),
        ];
        let metrics = vec![metric(0, 10.0), metric(1, 20.0)];
        let (features, labels) = behavior_examples(&config, &actions, &metrics);

        assert_eq!(labels, ["open", "type", "save"]);
        assert_eq!(features.len(), 3);
        assert_eq!(features[0], build_features(&config, &[], &[]));
        assert_eq!(
            features[1],
            build_features(&config, &actions[..1], &metrics[..1])
        );
        assert_eq!(features[2], build_features(&config, &actions[..2], &metrics));
    }

    #[test]
    fn test_optimizer_examples_target_future_metric() {
        let config = config();
        let metrics: Vec<_> = (0..5).map(|m| metric(m, m as f64 * 10.0)).collect();

        let (features, targets) = optimizer_examples(&config, 2, &[], &metrics);
        assert_eq!(features.len(), 3);
        assert_eq!(targets[0], [20.0, 50.0]);
        assert_eq!(targets[2], [40.0, 50.0]);

        let (none, _) = optimizer_examples(&config, 1, &[], &metrics[..1]);
        assert!(none.is_empty());
    }
}
