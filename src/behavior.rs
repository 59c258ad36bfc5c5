//! Statistical distress detection over a student's recent game activity.
//!
//! Each sub-check compares a "recent five" window against the five-to-ten
//! records before it and is skipped outright when there is not enough data;
//! a short history is a valid no-finding outcome, not an error.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{AnomalyMetrics, AnomalyType, DistressIndicator, ProgressRecord, Severity};

const WINDOW_DAYS: i64 = 14;
const MIN_RECORDS: usize = 3;
const SCORE_DROP_FLAG_PCT: f64 = 20.0;
const SCORE_DROP_HIGH_PCT: f64 = 40.0;
const AVOIDANCE_RATE_FLAG: f64 = 0.6;
const WITHDRAWAL_RATIO: f64 = 0.2;
const EXCESSIVE_RATIO: f64 = 0.9;
const EXCESSIVE_MIN_RECORDS: usize = 15;
const HINT_COLLAPSE_OLDER_RATE: f64 = 0.6;

/// Analyze a student's history, most-recent-first, restricted to the trailing
/// 14 days. Fewer than three in-window records yields no indicators.
pub fn analyze(
    student_id: Uuid,
    history: &[ProgressRecord],
    now: DateTime<Utc>,
) -> Vec<DistressIndicator> {
    let cutoff = now - Duration::days(WINDOW_DAYS);
    let records: Vec<&ProgressRecord> = history
        .iter()
        .filter(|r| r.recorded_at >= cutoff && r.recorded_at <= now)
        .collect();

    if records.len() < MIN_RECORDS {
        return Vec::new();
    }

    let mut indicators = Vec::new();
    if let Some(found) = check_score_drop(student_id, &records) {
        indicators.push(found);
    }
    if let Some(found) = check_game_avoidance(student_id, &records) {
        indicators.push(found);
    }
    if let Some(found) = check_play_frequency(student_id, &records) {
        indicators.push(found);
    }
    if let Some(found) = check_hint_collapse(student_id, &records) {
        indicators.push(found);
    }
    if let Some(found) = check_time_spent(student_id, &records) {
        indicators.push(found);
    }
    indicators
}

fn check_score_drop(student_id: Uuid, records: &[&ProgressRecord]) -> Option<DistressIndicator> {
    if records.len() < 5 {
        return None;
    }
    let recent = &records[..5];
    let older = &records[5..records.len().min(10)];
    if older.is_empty() {
        return None;
    }

    let recent_mean = mean(recent.iter().map(|r| r.score));
    let older_mean = mean(older.iter().map(|r| r.score));
    if older_mean <= 0.0 {
        return None;
    }

    let percent_drop = (older_mean - recent_mean) / older_mean * 100.0;
    if percent_drop <= SCORE_DROP_FLAG_PCT {
        return None;
    }

    let severity = if percent_drop > SCORE_DROP_HIGH_PCT {
        Severity::High
    } else {
        Severity::Medium
    };
    Some(DistressIndicator {
        student_id,
        anomaly_type: AnomalyType::SuddenPerformanceDrop,
        severity,
        description: format!(
            "Scores dropped {percent_drop:.0}% (recent average {recent_mean:.1} vs {older_mean:.1} before)"
        ),
        metrics: AnomalyMetrics::ScoreDrop {
            recent_mean,
            older_mean,
            percent_drop,
        },
    })
}

fn check_game_avoidance(
    student_id: Uuid,
    records: &[&ProgressRecord],
) -> Option<DistressIndicator> {
    if records.len() < 10 {
        return None;
    }
    let recent_games: BTreeSet<Uuid> = records[..5].iter().map(|r| r.game_id).collect();
    let usual_games: BTreeSet<Uuid> = records[5..records.len().min(15)]
        .iter()
        .map(|r| r.game_id)
        .collect();
    if usual_games.is_empty() {
        return None;
    }

    let avoided = usual_games.difference(&recent_games).count();
    let avoidance_rate = avoided as f64 / usual_games.len() as f64;
    if avoidance_rate <= AVOIDANCE_RATE_FLAG {
        return None;
    }

    Some(DistressIndicator {
        student_id,
        anomaly_type: AnomalyType::GameAvoidance,
        severity: Severity::Medium,
        description: format!(
            "Stopped playing {avoided} of {total} usual games ({pct:.0}% avoidance)",
            total = usual_games.len(),
            pct = avoidance_rate * 100.0,
        ),
        metrics: AnomalyMetrics::GameAvoidance {
            usual_games: usual_games.len(),
            avoided_games: avoided,
            avoidance_rate,
        },
    })
}

fn check_play_frequency(
    student_id: Uuid,
    records: &[&ProgressRecord],
) -> Option<DistressIndicator> {
    let newest = records.iter().map(|r| r.recorded_at).max()?;
    let oldest = records.iter().map(|r| r.recorded_at).min()?;
    let span_days = (newest.date_naive() - oldest.date_naive()).num_days() + 1;
    let active_days: BTreeSet<_> = records.iter().map(|r| r.recorded_at.date_naive()).collect();
    let ratio = active_days.len() as f64 / span_days as f64;

    if ratio < WITHDRAWAL_RATIO {
        return Some(DistressIndicator {
            student_id,
            anomaly_type: AnomalyType::PlayFrequencyChange,
            severity: Severity::High,
            description: format!(
                "Active on only {active} of {span_days} days ({pct:.0}% of the period), possible withdrawal",
                active = active_days.len(),
                pct = ratio * 100.0,
            ),
            metrics: AnomalyMetrics::PlayFrequency {
                active_days: active_days.len(),
                span_days,
                active_day_ratio: ratio,
                total_records: records.len(),
            },
        });
    }

    if ratio > EXCESSIVE_RATIO && records.len() > EXCESSIVE_MIN_RECORDS {
        return Some(DistressIndicator {
            student_id,
            anomaly_type: AnomalyType::PlayFrequencyChange,
            severity: Severity::Medium,
            description: format!(
                "Played on {active} of {span_days} days with {count} sessions, possible excessive play",
                active = active_days.len(),
                count = records.len(),
            ),
            metrics: AnomalyMetrics::PlayFrequency {
                active_days: active_days.len(),
                span_days,
                active_day_ratio: ratio,
                total_records: records.len(),
            },
        });
    }

    None
}

fn check_hint_collapse(student_id: Uuid, records: &[&ProgressRecord]) -> Option<DistressIndicator> {
    if records.len() < 5 {
        return None;
    }
    let recent = &records[..5];
    let older = &records[5..records.len().min(10)];
    if older.is_empty() {
        return None;
    }

    let older_rate = hint_rate(older);
    let recent_rate = hint_rate(recent);
    // A student who leaned on hints and suddenly stops asking for help at all
    // reads as a confidence collapse, not an improvement.
    if older_rate > HINT_COLLAPSE_OLDER_RATE && recent_rate == 0.0 {
        return Some(DistressIndicator {
            student_id,
            anomaly_type: AnomalyType::HintUsageCollapse,
            severity: Severity::Medium,
            description: format!(
                "Hint usage fell from {pct:.0}% of sessions to none",
                pct = older_rate * 100.0,
            ),
            metrics: AnomalyMetrics::HintUsage {
                older_rate,
                recent_rate,
            },
        });
    }
    None
}

fn check_time_spent(student_id: Uuid, records: &[&ProgressRecord]) -> Option<DistressIndicator> {
    if records.len() < 5 {
        return None;
    }
    let recent = &records[..5];
    let older = &records[5..records.len().min(10)];
    if older.is_empty() {
        return None;
    }

    let recent_mean = mean(recent.iter().map(|r| r.time_spent_seconds as f64));
    let older_mean = mean(older.iter().map(|r| r.time_spent_seconds as f64));
    if older_mean <= 0.0 || recent_mean <= 2.0 * older_mean {
        return None;
    }

    Some(DistressIndicator {
        student_id,
        anomaly_type: AnomalyType::TimeSpentAnomaly,
        severity: Severity::Medium,
        description: format!(
            "Session time jumped to {recent_mean:.0}s on average from {older_mean:.0}s"
        ),
        metrics: AnomalyMetrics::TimeSpent {
            recent_mean_seconds: recent_mean,
            older_mean_seconds: older_mean,
        },
    })
}

fn hint_rate(records: &[&ProgressRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let with_hints = records.iter().filter(|r| r.hints_used > 0).count();
    with_hints as f64 / records.len() as f64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return 0.0;
    }
    collected.iter().sum::<f64>() / collected.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        student_id: Uuid,
        hours_ago: i64,
        score: f64,
        game_id: Uuid,
        hints: u32,
        seconds: u32,
    ) -> ProgressRecord {
        ProgressRecord {
            student_id,
            game_id,
            category: "math".to_string(),
            score,
            completed: true,
            hints_used: hints,
            time_spent_seconds: seconds,
            recorded_at: Utc::now() - Duration::hours(hours_ago),
        }
    }

    fn history(student_id: Uuid, scores: &[f64]) -> Vec<ProgressRecord> {
        let game = Uuid::new_v4();
        scores
            .iter()
            .enumerate()
            .map(|(i, &s)| record(student_id, (i as i64) * 6, s, game, 0, 300))
            .collect()
    }

    #[test]
    fn too_little_history_yields_nothing() {
        let student = Uuid::new_v4();
        let records = history(student, &[50.0, 60.0]);
        assert!(analyze(student, &records, Utc::now()).is_empty());
    }

    #[test]
    fn fifty_percent_drop_is_high_severity() {
        let student = Uuid::new_v4();
        let records = history(
            student,
            &[40.0, 40.0, 40.0, 40.0, 40.0, 80.0, 80.0, 80.0, 80.0, 80.0],
        );
        let indicators = analyze(student, &records, Utc::now());
        let drop = indicators
            .iter()
            .find(|i| i.anomaly_type == AnomalyType::SuddenPerformanceDrop)
            .expect("expected a score-drop indicator");
        assert_eq!(drop.severity, Severity::High);
        match drop.metrics {
            AnomalyMetrics::ScoreDrop { percent_drop, .. } => {
                assert!((percent_drop - 50.0).abs() < 1e-9)
            }
            ref other => panic!("unexpected metrics {other:?}"),
        }
    }

    #[test]
    fn thirty_percent_drop_is_medium() {
        let student = Uuid::new_v4();
        let records = history(
            student,
            &[56.0, 56.0, 56.0, 56.0, 56.0, 80.0, 80.0, 80.0, 80.0, 80.0],
        );
        let indicators = analyze(student, &records, Utc::now());
        let drop = indicators
            .iter()
            .find(|i| i.anomaly_type == AnomalyType::SuddenPerformanceDrop)
            .unwrap();
        assert_eq!(drop.severity, Severity::Medium);
    }

    #[test]
    fn ten_percent_drop_is_ignored() {
        let student = Uuid::new_v4();
        let records = history(
            student,
            &[72.0, 72.0, 72.0, 72.0, 72.0, 80.0, 80.0, 80.0, 80.0, 80.0],
        );
        let indicators = analyze(student, &records, Utc::now());
        assert!(indicators
            .iter()
            .all(|i| i.anomaly_type != AnomalyType::SuddenPerformanceDrop));
    }

    #[test]
    fn abandoning_usual_games_is_flagged() {
        let student = Uuid::new_v4();
        let new_game = Uuid::new_v4();
        let old_games: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let mut records = Vec::new();
        for i in 0..5 {
            records.push(record(student, i * 6, 70.0, new_game, 0, 300));
        }
        for (i, game) in old_games.iter().enumerate() {
            records.push(record(student, 40 + (i as i64) * 6, 70.0, *game, 0, 300));
        }
        let indicators = analyze(student, &records, Utc::now());
        let avoidance = indicators
            .iter()
            .find(|i| i.anomaly_type == AnomalyType::GameAvoidance)
            .expect("expected avoidance indicator");
        match avoidance.metrics {
            AnomalyMetrics::GameAvoidance { avoidance_rate, .. } => {
                assert!(avoidance_rate > 0.99)
            }
            ref other => panic!("unexpected metrics {other:?}"),
        }
    }

    #[test]
    fn sparse_play_reads_as_withdrawal() {
        let student = Uuid::new_v4();
        let game = Uuid::new_v4();
        // Two sessions thirteen days ago and one today: two active days over
        // a roughly two-week span.
        let mut records = Vec::new();
        for _ in 0..2 {
            records.push(record(student, 13 * 24, 70.0, game, 0, 300));
        }
        records.push(record(student, 1, 70.0, game, 0, 300));
        let indicators = analyze(student, &records, Utc::now());
        let frequency = indicators
            .iter()
            .find(|i| i.anomaly_type == AnomalyType::PlayFrequencyChange)
            .expect("expected frequency indicator");
        assert_eq!(frequency.severity, Severity::High);
    }

    #[test]
    fn daily_heavy_play_reads_as_excessive() {
        let student = Uuid::new_v4();
        let game = Uuid::new_v4();
        let mut records = Vec::new();
        // Sixteen sessions spread across eight consecutive days.
        for day in 0..8 {
            for half in 0..2 {
                records.push(record(student, day * 24 + half * 3, 70.0, game, 0, 300));
            }
        }
        let indicators = analyze(student, &records, Utc::now());
        let frequency = indicators
            .iter()
            .find(|i| i.anomaly_type == AnomalyType::PlayFrequencyChange)
            .expect("expected frequency indicator");
        assert_eq!(frequency.severity, Severity::Medium);
    }

    #[test]
    fn hint_collapse_needs_heavy_then_zero_usage() {
        let student = Uuid::new_v4();
        let game = Uuid::new_v4();
        let mut records = Vec::new();
        for i in 0..5 {
            records.push(record(student, i * 6, 70.0, game, 0, 300));
        }
        for i in 5..10 {
            records.push(record(student, i * 6, 70.0, game, 2, 300));
        }
        let indicators = analyze(student, &records, Utc::now());
        assert!(indicators
            .iter()
            .any(|i| i.anomaly_type == AnomalyType::HintUsageCollapse));

        // One recent hint breaks the "exactly zero" condition.
        records[0].hints_used = 1;
        let indicators = analyze(student, &records, Utc::now());
        assert!(indicators
            .iter()
            .all(|i| i.anomaly_type != AnomalyType::HintUsageCollapse));
    }

    #[test]
    fn doubled_session_time_is_flagged() {
        let student = Uuid::new_v4();
        let game = Uuid::new_v4();
        let mut records = Vec::new();
        for i in 0..5 {
            records.push(record(student, i * 6, 70.0, game, 0, 1300));
        }
        for i in 5..10 {
            records.push(record(student, i * 6, 70.0, game, 0, 600));
        }
        let indicators = analyze(student, &records, Utc::now());
        assert!(indicators
            .iter()
            .any(|i| i.anomaly_type == AnomalyType::TimeSpentAnomaly));
    }

    #[test]
    fn records_outside_fourteen_days_are_ignored() {
        let student = Uuid::new_v4();
        let game = Uuid::new_v4();
        let mut records = Vec::new();
        records.push(record(student, 1, 70.0, game, 0, 300));
        records.push(record(student, 2, 70.0, game, 0, 300));
        // Old cluster that would otherwise trip the score-drop check.
        for i in 0..8 {
            records.push(record(student, 15 * 24 + i * 6, 90.0, game, 0, 300));
        }
        assert!(analyze(student, &records, Utc::now()).is_empty());
    }
}
