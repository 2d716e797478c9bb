//! Behavior patterns and automation recommendations
//!
//! Both are aggregates over the durable action log, not the in-memory buffer.

use crate::db::Database;
use crate::error::Result;
use crate::types::EventKind;
use serde::Serialize;
use std::collections::BTreeMap;

/// Fewer recorded actions than this yield only a "collect more data" hint
pub const MIN_ACTIONS_FOR_RECOMMENDATIONS: i64 = 10;
/// Pairs used more often than this are automation candidates
pub const AUTOMATE_THRESHOLD: i64 = 5;
/// Hours with more actions than this get a schedule suggestion
pub const ACTIVE_HOUR_THRESHOLD: i64 = 3;
const MAX_AUTOMATE_SUGGESTIONS: usize = 5;

/// Aggregate view of recorded user behavior
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehaviorPatterns {
    pub total_actions: i64,
    /// `(hour 0-23 UTC, count)`
    pub by_hour: Vec<(u32, i64)>,
    /// `(weekday, 0 = Monday, count)`
    pub by_weekday: Vec<(u32, i64)>,
    /// Most used first
    pub by_application: Vec<(String, i64)>,
    /// Most frequent first
    pub by_action_type: Vec<(String, i64)>,
    pub success_rate: Option<f64>,
}

impl BehaviorPatterns {
    pub fn compute(db: &Database) -> Result<Self> {
        Ok(Self {
            total_actions: db.count(EventKind::Action)?,
            by_hour: db.action_counts_by_hour()?,
            by_weekday: db.action_counts_by_weekday()?,
            by_application: db.action_counts_by_application()?,
            by_action_type: db.action_counts_by_type()?,
            success_rate: db.action_success_rate()?,
        })
    }
}

/// One automation suggestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recommendation {
    CollectMoreData {
        recorded: i64,
    },
    Automate {
        action_type: String,
        application: String,
        frequency: i64,
    },
    Schedule {
        hour: u32,
        action_type: String,
        count: i64,
    },
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::CollectMoreData { recorded } => write!(
                f,
                "Collect more usage data for better recommendations ({} actions recorded)",
                recorded
            ),
            Recommendation::Automate {
                action_type,
                application,
                frequency,
            } => write!(
                f,
                "Consider automating {} in {} (used {} times)",
                action_type, application, frequency
            ),
            Recommendation::Schedule {
                hour, action_type, ..
            } => write!(
                f,
                "Schedule {} automation at {:02}:00 UTC (frequently used)",
                action_type, hour
            ),
        }
    }
}

/// Suggestions derived from the durable action history.
pub fn recommendations(db: &Database) -> Result<Vec<Recommendation>> {
    let recorded = db.count(EventKind::Action)?;
    if recorded < MIN_ACTIONS_FOR_RECOMMENDATIONS {
        return Ok(vec![Recommendation::CollectMoreData { recorded }]);
    }

    let mut suggestions: Vec<Recommendation> = db
        .action_pair_counts()?
        .into_iter()
        .take(MAX_AUTOMATE_SUGGESTIONS)
        .filter(|(_, _, frequency)| *frequency > AUTOMATE_THRESHOLD)
        .map(|(action_type, application, frequency)| Recommendation::Automate {
            action_type,
            application,
            frequency,
        })
        .collect();

    // Rows arrive per hour, most common action first
    let mut hours: BTreeMap<u32, (String, i64, i64)> = BTreeMap::new();
    for (hour, action_type, count) in db.hourly_action_type_counts()? {
        hours
            .entry(hour)
            .and_modify(|(_, _, total)| *total += count)
            .or_insert((action_type, count, count));
    }
    suggestions.extend(
        hours
            .into_iter()
            .filter(|(_, (_, _, total))| *total > ACTIVE_HOUR_THRESHOLD)
            .map(|(hour, (action_type, count, _))| Recommendation::Schedule {
                hour,
                action_type,
                count,
            }),
    );

    Ok(suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserAction;
    use chrono::{TimeZone, Utc};

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn record(db: &Database, hour: u32, second: u32, action_type: &str, application: &str) {
        let action = UserAction {
            action_type: action_type.to_string(),
            application: application.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 11, hour, 0, second).unwrap(),
            duration_seconds: 0.5,
            success: true,
        };
        db.append_action("s", &action).unwrap();
    }

    #[test]
    fn test_too_few_actions() {
        let db = test_db();
        for s in 0..9 {
            record(&db, 9, s, "click", "editor");
        }
        assert_eq!(
            recommendations(&db).unwrap(),
            vec![Recommendation::CollectMoreData { recorded: 9 }]
        );
    }

    #[test]
    fn test_automate_and_schedule_suggestions() {
        let db = test_db();
        for s in 0..6 {
            record(&db, 9, s, "save", "editor");
        }
        record(&db, 9, 10, "scroll", "browser");
        for s in 0..3 {
            record(&db, 14, s, "scroll", "browser");
        }

        let suggestions = recommendations(&db).unwrap();
        assert_eq!(
            suggestions,
            vec![
                Recommendation::Automate {
                    action_type: "save".to_string(),
                    application: "editor".to_string(),
                    frequency: 6,
                },
                Recommendation::Schedule {
                    hour: 9,
                    action_type: "save".to_string(),
                    count: 6,
                },
            ]
        );
        assert_eq!(
            suggestions[0].to_string(),
            "Consider automating save in editor (used 6 times)"
        );
    }

    #[test]
    fn test_patterns() {
        let db = test_db();
        record(&db, 9, 0, "save", "editor");
        record(&db, 9, 1, "save", "editor");
        record(&db, 14, 0, "scroll", "browser");

        let patterns = BehaviorPatterns::compute(&db).unwrap();
        assert_eq!(patterns.total_actions, 3);
        assert_eq!(patterns.by_hour, vec![(9, 2), (14, 1)]);
        // 2025-03-11 is a Tuesday
        assert_eq!(patterns.by_weekday, vec![(1, 3)]);
        assert_eq!(patterns.by_application[0], ("editor".to_string(), 2));
        assert_eq!(patterns.success_rate, Some(1.0));
    }
}
