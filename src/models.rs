use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Severity is totally ordered so category matches can be folded with `max`
/// instead of an if/else ladder; a higher match never gets downgraded.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Severity> {
        match value {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    TextAnalysis,
    Behavioral,
    SocialNetwork,
    ManualReport,
}

impl IncidentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::TextAnalysis => "text_analysis",
            IncidentType::Behavioral => "behavioral",
            IncidentType::SocialNetwork => "social_network",
            IncidentType::ManualReport => "manual_report",
        }
    }

    pub fn parse(value: &str) -> Option<IncidentType> {
        match value {
            "text_analysis" => Some(IncidentType::TextAnalysis),
            "behavioral" => Some(IncidentType::Behavioral),
            "social_network" => Some(IncidentType::SocialNetwork),
            "manual_report" => Some(IncidentType::ManualReport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Pending,
    Reviewed,
    Dismissed,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Pending => "pending",
            IncidentStatus::Reviewed => "reviewed",
            IncidentStatus::Dismissed => "dismissed",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<IncidentStatus> {
        match value {
            "pending" => Some(IncidentStatus::Pending),
            "reviewed" => Some(IncidentStatus::Reviewed),
            "dismissed" => Some(IncidentStatus::Dismissed),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

/// Escalation state of a student's violation log. Always derived from the
/// violation count, never set independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    Active,
    Restricted,
    Banned,
}

impl ViolationStatus {
    pub fn from_count(count: u32) -> ViolationStatus {
        if count >= 4 {
            ViolationStatus::Banned
        } else if count >= 3 {
            ViolationStatus::Restricted
        } else {
            ViolationStatus::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationStatus::Active => "active",
            ViolationStatus::Restricted => "restricted",
            ViolationStatus::Banned => "banned",
        }
    }

    pub fn parse(value: &str) -> Option<ViolationStatus> {
        match value {
            "active" => Some(ViolationStatus::Active),
            "restricted" => Some(ViolationStatus::Restricted),
            "banned" => Some(ViolationStatus::Banned),
            _ => None,
        }
    }
}

/// A single recorded safety event tying an offender, a victim, evidence and a
/// resolution lifecycle. Incidents are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub reported_student_id: Uuid,
    pub victim_student_id: Uuid,
    pub incident_type: IncidentType,
    pub description: String,
    pub flagged_content: Option<String>,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub flag_reasons: Vec<String>,
    pub applied_consequences: Vec<String>,
    /// Snapshot of the offender's violation count right after this report
    /// incremented it. Immutable once written.
    pub violation_count_at_report: u32,
    pub victim_notified: bool,
    pub parent_notified: bool,
    pub reviewed_by: Option<Uuid>,
    pub review_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input shape for `report_incident`, validated before any write.
#[derive(Debug, Clone)]
pub struct IncidentReport {
    pub reported_student_id: Uuid,
    pub victim_student_id: Uuid,
    pub incident_type: IncidentType,
    pub description: String,
    pub flagged_content: Option<String>,
    pub severity: Severity,
    pub flag_reasons: Vec<String>,
}

/// Per-student running tally driving consequence escalation. One row per
/// student, owned exclusively by the incident ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationLog {
    pub student_id: Uuid,
    pub violation_count: u32,
    pub status: ViolationStatus,
    pub first_violation_at: DateTime<Utc>,
    pub last_violation_at: DateTime<Utc>,
    pub restriction_ends_at: Option<DateTime<Utc>>,
    pub applied_consequences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    SuddenPerformanceDrop,
    GameAvoidance,
    PlayFrequencyChange,
    HintUsageCollapse,
    TimeSpentAnomaly,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::SuddenPerformanceDrop => "sudden_performance_drop",
            AnomalyType::GameAvoidance => "game_avoidance",
            AnomalyType::PlayFrequencyChange => "play_frequency_change",
            AnomalyType::HintUsageCollapse => "hint_usage_collapse",
            AnomalyType::TimeSpentAnomaly => "time_spent_anomaly",
        }
    }
}

/// Numeric evidence behind a distress indicator. One variant per anomaly type
/// so consumers can pattern-match instead of probing a loose key/value map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyMetrics {
    ScoreDrop {
        recent_mean: f64,
        older_mean: f64,
        percent_drop: f64,
    },
    GameAvoidance {
        usual_games: usize,
        avoided_games: usize,
        avoidance_rate: f64,
    },
    PlayFrequency {
        active_days: usize,
        span_days: i64,
        active_day_ratio: f64,
        total_records: usize,
    },
    HintUsage {
        older_rate: f64,
        recent_rate: f64,
    },
    TimeSpent {
        recent_mean_seconds: f64,
        older_mean_seconds: f64,
    },
}

/// A single behavioral finding for one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistressIndicator {
    pub student_id: Uuid,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub description: String,
    pub metrics: AnomalyMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    New,
    Investigating,
    Addressed,
    Resolved,
}

impl AnomalyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyStatus::New => "new",
            AnomalyStatus::Investigating => "investigating",
            AnomalyStatus::Addressed => "addressed",
            AnomalyStatus::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<AnomalyStatus> {
        match value {
            "new" => Some(AnomalyStatus::New),
            "investigating" => Some(AnomalyStatus::Investigating),
            "addressed" => Some(AnomalyStatus::Addressed),
            "resolved" => Some(AnomalyStatus::Resolved),
            _ => None,
        }
    }
}

/// Persisted behavioral finding; its lifecycle is managed by a reviewer, not
/// by the detector that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralAnomaly {
    pub id: Uuid,
    pub student_id: Uuid,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub description: String,
    pub metrics: AnomalyMetrics,
    pub teacher_notified: bool,
    pub status: AnomalyStatus,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialAnomalyType {
    StudentIsolation,
    CoordinatedBullying,
    ExclusionPattern,
}

impl SocialAnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocialAnomalyType::StudentIsolation => "student_isolation",
            SocialAnomalyType::CoordinatedBullying => "coordinated_bullying",
            SocialAnomalyType::ExclusionPattern => "exclusion_pattern",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SocialMetrics {
    Isolation {
        social_score: f64,
        population_mean: f64,
        population_std_dev: f64,
        connection_count: usize,
    },
    /// Shape reserved for the coordinated-bullying signal; not produced until
    /// message sentiment is wired in.
    Coordination {
        negative_interaction_count: usize,
        distinct_senders: usize,
    },
    Exclusion {
        student_plays: usize,
        cohort_average: f64,
        participation_ratio: f64,
    },
}

/// Cohort-level finding from the co-presence graph. Ephemeral; persisted only
/// when escalated into an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAnomaly {
    pub anomaly_type: SocialAnomalyType,
    pub severity: Severity,
    pub targeted_student: Uuid,
    pub bullying_students: Vec<Uuid>,
    pub description: String,
    pub metrics: SocialMetrics,
}

/// One game-activity record as read back from the activity store, ordered
/// most-recent-first at the query boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub student_id: Uuid,
    pub game_id: Uuid,
    pub category: String,
    pub score: f64,
    pub completed: bool,
    pub hints_used: u32,
    pub time_spent_seconds: u32,
    pub recorded_at: DateTime<Utc>,
}

/// One chat message event, used only for the repetitive-messaging check.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub sender_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub is_flagged: bool,
    pub severity: Option<Severity>,
    pub reasons: BTreeSet<String>,
    pub flagged_phrases: BTreeSet<String>,
}

/// What the caller of `check_message` gets back.
#[derive(Debug, Clone, Serialize)]
pub struct MessageCheck {
    pub blocked: bool,
    pub flagged: bool,
    pub severity: Option<Severity>,
    pub reasons: Vec<String>,
    pub sanitized: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyProfile {
    pub student_id: Uuid,
    pub victim_risk: RiskLevel,
    pub offender_risk: RiskLevel,
    pub incident_count: usize,
    pub last_incident_at: Option<DateTime<Utc>>,
    pub action_required: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassStatistics {
    pub window_days: i64,
    pub total_incidents: usize,
    pub by_type: Vec<(String, usize)>,
    pub by_severity: Vec<(String, usize)>,
    pub distinct_students: usize,
    pub resolved_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeacherDashboard {
    pub classroom_id: Uuid,
    pub pending_incidents: Vec<Incident>,
    pub high_risk_students: Vec<SafetyProfile>,
    pub statistics: ClassStatistics,
    pub recent_incidents: Vec<Incident>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SafetyIncident,
    ParentNotice,
    AdminEscalation,
    VictimSupport,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SafetyIncident => "safety_incident",
            AlertKind::ParentNotice => "parent_notice",
            AlertKind::AdminEscalation => "admin_escalation",
            AlertKind::VictimSupport => "victim_support",
        }
    }
}

/// A request to deliver an alert. Delivery itself is someone else's job; the
/// ledger only records that it was asked for.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRequest {
    pub target_id: Uuid,
    pub kind: AlertKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
}
