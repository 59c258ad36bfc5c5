//! Co-presence graph analysis over a cohort's session history.
//!
//! Students who play the same game inside the same five-minute bucket get a
//! shared edge; the sum of a student's edge weights is their social score.
//! Isolation is a statistical outlier call (score below mean minus two
//! standard deviations), not a fixed threshold.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{ProgressRecord, Severity, SocialAnomaly, SocialAnomalyType, SocialMetrics};

const BUCKET_SECONDS: i64 = 300;
const ISOLATION_SIGMA: f64 = 2.0;
const MIN_COHORT_SIZE: usize = 3;
const EXCLUSION_PARTICIPATION_FLOOR: f64 = 0.3;
const GROUP_CATEGORIES: [&str; 3] = ["group", "multiplayer", "team"];
const EXCLUSION_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Default)]
pub struct SocialScore {
    pub score: f64,
    pub connection_count: usize,
}

#[derive(Debug, Clone)]
pub struct ExclusionTrend {
    /// Per-day exclusion score, oldest first. 100 means no plays that day.
    pub daily_scores: Vec<(NaiveDate, f64)>,
    pub leading_mean: f64,
    pub trailing_mean: f64,
    pub worsening: bool,
}

/// Analyze a cohort's history over the trailing window. Produces isolation
/// and group-exclusion findings; coordinated-bullying detection stays an
/// explicit empty path until a message-sentiment signal exists.
pub fn analyze(
    history: &[ProgressRecord],
    window_days: i64,
    now: DateTime<Utc>,
) -> Vec<SocialAnomaly> {
    let cutoff = now - Duration::days(window_days.max(1));
    let records: Vec<&ProgressRecord> = history
        .iter()
        .filter(|r| r.recorded_at >= cutoff && r.recorded_at <= now)
        .collect();

    let scores = co_presence_scores(&records);
    let mut anomalies = detect_isolation(&scores);
    anomalies.extend(detect_coordinated_bullying(&records));

    // Exclusion looks at a shorter window than the co-presence graph.
    let students: BTreeSet<Uuid> = records.iter().map(|r| r.student_id).collect();
    for student_id in students {
        if let Some(mut found) = detect_exclusion(student_id, history, EXCLUSION_WINDOW_DAYS, now) {
            let own: Vec<ProgressRecord> = history
                .iter()
                .filter(|r| r.student_id == student_id)
                .cloned()
                .collect();
            if exclusion_trend(&own, EXCLUSION_WINDOW_DAYS, now).worsening {
                found
                    .description
                    .push_str(", and participation has worsened over the last week");
            }
            anomalies.push(found);
        }
    }
    anomalies
}

/// Sum of co-presence edge weights per student. Every student seen in the
/// history gets an entry, including those with no co-presence at all.
pub fn co_presence_scores(records: &[&ProgressRecord]) -> BTreeMap<Uuid, SocialScore> {
    let mut buckets: HashMap<(Uuid, i64), BTreeSet<Uuid>> = HashMap::new();
    let mut scores: BTreeMap<Uuid, SocialScore> = BTreeMap::new();

    for record in records {
        scores.entry(record.student_id).or_default();
        let bucket = record.recorded_at.timestamp().div_euclid(BUCKET_SECONDS);
        buckets
            .entry((record.game_id, bucket))
            .or_default()
            .insert(record.student_id);
    }

    let mut edges: HashMap<(Uuid, Uuid), f64> = HashMap::new();
    for students in buckets.values() {
        let members: Vec<Uuid> = students.iter().copied().collect();
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                *edges.entry((*a, *b)).or_insert(0.0) += 1.0;
            }
        }
    }

    let mut neighbors: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
    for ((a, b), weight) in &edges {
        for (student, other) in [(a, b), (b, a)] {
            if let Some(entry) = scores.get_mut(student) {
                entry.score += weight;
            }
            neighbors.entry(*student).or_default().insert(*other);
        }
    }
    for (student, set) in neighbors {
        if let Some(entry) = scores.get_mut(&student) {
            entry.connection_count = set.len();
        }
    }
    scores
}

fn detect_isolation(scores: &BTreeMap<Uuid, SocialScore>) -> Vec<SocialAnomaly> {
    if scores.len() < MIN_COHORT_SIZE {
        return Vec::new();
    }

    let values: Vec<f64> = scores.values().map(|s| s.score).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return Vec::new();
    }

    let floor = mean - ISOLATION_SIGMA * std_dev;
    scores
        .iter()
        .filter(|(_, s)| s.score < floor)
        .map(|(student, s)| SocialAnomaly {
            anomaly_type: SocialAnomalyType::StudentIsolation,
            severity: Severity::High,
            targeted_student: *student,
            bullying_students: Vec::new(),
            description: format!(
                "Social score {:.1} sits far below the cohort mean {:.1} ({} peer connections)",
                s.score, mean, s.connection_count
            ),
            metrics: SocialMetrics::Isolation {
                social_score: s.score,
                population_mean: mean,
                population_std_dev: std_dev,
                connection_count: s.connection_count,
            },
        })
        .collect()
}

/// Coordinated-bullying detection needs negative-sentiment message data that
/// is not available yet. Until that signal is wired in, this reports nothing
/// rather than guessing from co-presence alone.
fn detect_coordinated_bullying(_records: &[&ProgressRecord]) -> Vec<SocialAnomaly> {
    tracing::debug!("coordinated-bullying detection skipped: sentiment signal not available");
    Vec::new()
}

/// Flag a student whose group-game participation sits under 30% of the
/// cohort average for the trailing window.
pub fn detect_exclusion(
    student_id: Uuid,
    cohort_history: &[ProgressRecord],
    window_days: i64,
    now: DateTime<Utc>,
) -> Option<SocialAnomaly> {
    let cutoff = now - Duration::days(window_days.max(1));
    let mut plays_per_student: BTreeMap<Uuid, usize> = BTreeMap::new();

    for record in cohort_history {
        if record.recorded_at < cutoff || record.recorded_at > now {
            continue;
        }
        plays_per_student.entry(record.student_id).or_insert(0);
        if is_group_category(&record.category) {
            *plays_per_student.entry(record.student_id).or_insert(0) += 1;
        }
    }

    if plays_per_student.is_empty() {
        return None;
    }
    let total_group_plays: usize = plays_per_student.values().sum();
    if total_group_plays == 0 {
        return None;
    }

    let cohort_average = total_group_plays as f64 / plays_per_student.len() as f64;
    let student_plays = plays_per_student.get(&student_id).copied().unwrap_or(0);
    let participation_ratio = student_plays as f64 / cohort_average;
    if participation_ratio >= EXCLUSION_PARTICIPATION_FLOOR {
        return None;
    }

    Some(SocialAnomaly {
        anomaly_type: SocialAnomalyType::ExclusionPattern,
        severity: Severity::Medium,
        targeted_student: student_id,
        bullying_students: Vec::new(),
        description: format!(
            "Joined {student_plays} group games against a cohort average of {cohort_average:.1}"
        ),
        metrics: SocialMetrics::Exclusion {
            student_plays,
            cohort_average,
            participation_ratio,
        },
    })
}

/// Per-day exclusion score over the trailing window: 100 for a day with no
/// plays, otherwise 100 minus 10 per play, floored at zero. Worsening when
/// the most recent three days average higher than the first three.
pub fn exclusion_trend(
    student_history: &[ProgressRecord],
    window_days: i64,
    now: DateTime<Utc>,
) -> ExclusionTrend {
    let days = window_days.max(1);
    let today = now.date_naive();
    let mut plays_by_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for record in student_history {
        plays_by_day
            .entry(record.recorded_at.date_naive())
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    let mut daily_scores = Vec::with_capacity(days as usize);
    for offset in (0..days).rev() {
        let day = today - Duration::days(offset);
        let plays = plays_by_day.get(&day).copied().unwrap_or(0);
        let score = if plays == 0 {
            100.0
        } else {
            (100.0 - 10.0 * plays as f64).max(0.0)
        };
        daily_scores.push((day, score));
    }

    let leading_mean = window_mean(daily_scores.iter().take(3));
    let trailing_mean = window_mean(daily_scores.iter().rev().take(3));
    ExclusionTrend {
        worsening: daily_scores.len() >= 6 && trailing_mean > leading_mean,
        daily_scores,
        leading_mean,
        trailing_mean,
    }
}

fn window_mean<'a>(window: impl Iterator<Item = &'a (NaiveDate, f64)>) -> f64 {
    let values: Vec<f64> = window.map(|(_, score)| *score).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn is_group_category(category: &str) -> bool {
    GROUP_CATEGORIES
        .iter()
        .any(|g| category.eq_ignore_ascii_case(g))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(student: Uuid, game: Uuid, minutes_ago: i64, category: &str) -> ProgressRecord {
        ProgressRecord {
            student_id: student,
            game_id: game,
            category: category.to_string(),
            score: 70.0,
            completed: true,
            hints_used: 0,
            time_spent_seconds: 300,
            recorded_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    /// `count` students all playing the same game in the same bucket, plus
    /// one loner playing alone hours earlier.
    fn cohort_with_loner(count: usize) -> (Vec<ProgressRecord>, Uuid) {
        let game = Uuid::new_v4();
        let mut records = Vec::new();
        let base = 10;
        for _ in 0..count {
            let student = Uuid::new_v4();
            // Several shared buckets so the cluster stays tight.
            for bucket in 0..4 {
                records.push(session(student, game, base + bucket * 10, "group"));
            }
        }
        let loner = Uuid::new_v4();
        records.push(session(loner, game, 60 * 10, "group"));
        (records, loner)
    }

    #[test]
    fn tight_cluster_flags_only_the_loner() {
        let (records, loner) = cohort_with_loner(5);
        let anomalies = analyze(&records, 14, Utc::now());
        // The loner is both a co-presence outlier and under-represented in
        // group games; nobody else is flagged.
        assert_eq!(anomalies.len(), 2);
        assert!(anomalies.iter().all(|a| a.targeted_student == loner));
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == SocialAnomalyType::ExclusionPattern));
        let anomaly = anomalies
            .iter()
            .find(|a| a.anomaly_type == SocialAnomalyType::StudentIsolation)
            .expect("expected isolation anomaly");
        assert_eq!(anomaly.severity, Severity::High);
        match anomaly.metrics {
            SocialMetrics::Isolation {
                social_score,
                connection_count,
                ..
            } => {
                assert_eq!(social_score, 0.0);
                assert_eq!(connection_count, 0);
            }
            ref other => panic!("unexpected metrics {other:?}"),
        }
    }

    #[test]
    fn spread_out_scores_flag_nobody() {
        // One very social student among modest ones: the outlier is high,
        // not low, so the two-sigma floor catches no one.
        let game = Uuid::new_v4();
        let mut records = Vec::new();
        let students: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (i, student) in students.iter().enumerate() {
            for bucket in 0..(2 + i) {
                records.push(session(*student, game, 10 + (bucket as i64) * 10, "group"));
            }
        }
        let anomalies = analyze(&records, 14, Utc::now());
        assert!(anomalies.is_empty());
    }

    #[test]
    fn tiny_cohorts_are_skipped() {
        let game = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let records = vec![session(a, game, 10, "group"), session(b, game, 500, "group")];
        assert!(analyze(&records, 14, Utc::now()).is_empty());
    }

    #[test]
    fn co_presence_counts_shared_buckets() {
        let game = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let records = vec![
            session(a, game, 10, "group"),
            session(b, game, 10, "group"),
            session(a, game, 20, "group"),
            session(b, game, 20, "group"),
        ];
        let refs: Vec<&ProgressRecord> = records.iter().collect();
        let scores = co_presence_scores(&refs);
        assert_eq!(scores[&a].score, 2.0);
        assert_eq!(scores[&b].score, 2.0);
        assert_eq!(scores[&a].connection_count, 1);
    }

    #[test]
    fn exclusion_flags_low_group_participation() {
        let game = Uuid::new_v4();
        let left_out = Uuid::new_v4();
        let mut records = Vec::new();
        for _ in 0..4 {
            let student = Uuid::new_v4();
            for i in 0..10 {
                records.push(session(student, game, 10 + i * 30, "group"));
            }
        }
        records.push(session(left_out, game, 10, "solo"));

        let anomaly = detect_exclusion(left_out, &records, 7, Utc::now())
            .expect("expected exclusion anomaly");
        assert_eq!(anomaly.anomaly_type, SocialAnomalyType::ExclusionPattern);
        match anomaly.metrics {
            SocialMetrics::Exclusion { student_plays, .. } => assert_eq!(student_plays, 0),
            ref other => panic!("unexpected metrics {other:?}"),
        }
    }

    #[test]
    fn analyze_surfaces_exclusion_findings() {
        let game = Uuid::new_v4();
        let left_out = Uuid::new_v4();
        let mut records = Vec::new();
        for _ in 0..3 {
            let student = Uuid::new_v4();
            for i in 0..10 {
                records.push(session(student, game, 10 + i * 30, "group"));
            }
        }
        // Last played a group game five days ago.
        for i in 0..2 {
            records.push(session(left_out, game, 5 * 24 * 60 + 60 + i * 30, "group"));
        }

        let anomalies = analyze(&records, 14, Utc::now());
        let exclusion = anomalies
            .iter()
            .find(|a| {
                a.anomaly_type == SocialAnomalyType::ExclusionPattern
                    && a.targeted_student == left_out
            })
            .expect("expected exclusion anomaly");
        assert_eq!(exclusion.severity, Severity::Medium);
        assert!(exclusion.description.contains("worsened"));
    }

    #[test]
    fn average_participation_is_not_exclusion() {
        let game = Uuid::new_v4();
        let student = Uuid::new_v4();
        let mut records = Vec::new();
        for i in 0..5 {
            records.push(session(student, game, 10 + i * 30, "group"));
        }
        let peer = Uuid::new_v4();
        for i in 0..5 {
            records.push(session(peer, game, 15 + i * 30, "group"));
        }
        assert!(detect_exclusion(student, &records, 7, Utc::now()).is_none());
    }

    #[test]
    fn trend_worsens_when_recent_days_go_quiet() {
        let game = Uuid::new_v4();
        let student = Uuid::new_v4();
        let mut records = Vec::new();
        // Active six to eight days ago, silent since.
        for day in 6..9 {
            for i in 0..3 {
                records.push(session(student, game, day * 24 * 60 + i * 30, "group"));
            }
        }
        let trend = exclusion_trend(&records, 9, Utc::now());
        assert!(trend.worsening);
        assert!(trend.trailing_mean > trend.leading_mean);
        assert_eq!(trend.daily_scores.len(), 9);
        // Quiet days score the full 100.
        assert_eq!(trend.daily_scores.last().unwrap().1, 100.0);
    }

    #[test]
    fn trend_improves_when_play_resumes() {
        let game = Uuid::new_v4();
        let student = Uuid::new_v4();
        let mut records = Vec::new();
        for day in 0..3 {
            for i in 0..3 {
                records.push(session(student, game, day * 24 * 60 + 60 + i * 30, "group"));
            }
        }
        let trend = exclusion_trend(&records, 9, Utc::now());
        assert!(!trend.worsening);
    }
}
