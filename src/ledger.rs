//! The incident ledger: the only component with durable cross-call state.
//!
//! Owns per-student violation logs and incident records, maps violation
//! counts to fixed consequence tiers, and fans alerts out to teachers,
//! parents and safety admins. Alert dispatch is best effort: a failed alert
//! is logged and swallowed, never allowed to roll back a committed write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SafetyError;
use crate::models::{
    AlertKind, AlertRequest, ClassStatistics, Incident, IncidentReport, IncidentStatus, Severity,
    ViolationLog, ViolationStatus,
};
use crate::store::{AlertSink, Directory, SafetyStore};

/// Violation count at which admins are pulled into the alert fan-out.
const ADMIN_ESCALATION_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Valid,
    Invalid,
}

pub struct IncidentLedger {
    store: Arc<dyn SafetyStore>,
    alerts: Arc<dyn AlertSink>,
    directory: Arc<dyn Directory>,
}

impl IncidentLedger {
    pub fn new(
        store: Arc<dyn SafetyStore>,
        alerts: Arc<dyn AlertSink>,
        directory: Arc<dyn Directory>,
    ) -> IncidentLedger {
        IncidentLedger {
            store,
            alerts,
            directory,
        }
    }

    /// Record an incident: increment the offender's violation log, persist
    /// the incident with a snapshot of the post-increment count, then fan out
    /// alerts. The single mutating entry point for all three detection layers
    /// plus manual reports.
    ///
    /// The count increment happens inside the store as one serialized
    /// operation, so concurrent reports for the same student cannot
    /// under-count.
    pub async fn report_incident(&self, report: IncidentReport) -> Result<Incident, SafetyError> {
        validate_report(&report)?;

        let now = Utc::now();
        let log = self
            .store
            .upsert_violation(report.reported_student_id, now)
            .await?;

        let incident = Incident {
            id: Uuid::new_v4(),
            reported_student_id: report.reported_student_id,
            victim_student_id: report.victim_student_id,
            incident_type: report.incident_type,
            description: report.description,
            flagged_content: report.flagged_content,
            severity: report.severity,
            status: IncidentStatus::Pending,
            flag_reasons: report.flag_reasons,
            applied_consequences: Vec::new(),
            violation_count_at_report: log.violation_count,
            victim_notified: false,
            parent_notified: false,
            reviewed_by: None,
            review_notes: None,
            created_at: now,
            resolved_at: None,
        };
        self.store.insert_incident(&incident).await?;

        info!(
            incident_id = %incident.id,
            offender = %incident.reported_student_id,
            severity = %incident.severity,
            violation_count = log.violation_count,
            "incident recorded"
        );

        self.fan_out_alerts(&incident, &log).await;
        Ok(incident)
    }

    /// Teacher always; parent from the second violation on; admins when the
    /// incident is critical or the offender is at three or more violations.
    async fn fan_out_alerts(&self, incident: &Incident, log: &ViolationLog) {
        let metadata = serde_json::json!({
            "incident_id": incident.id,
            "incident_type": incident.incident_type.as_str(),
            "violation_count": log.violation_count,
        });

        match self.directory.teacher_of(incident.reported_student_id).await {
            Ok(Some(teacher_id)) => {
                self.send_alert(AlertRequest {
                    target_id: teacher_id,
                    kind: AlertKind::SafetyIncident,
                    severity: incident.severity,
                    title: "Safety incident in your class".to_string(),
                    message: incident.description.clone(),
                    metadata: metadata.clone(),
                })
                .await;
            }
            Ok(None) => warn!(
                student = %incident.reported_student_id,
                "no assigned teacher for incident alert"
            ),
            Err(err) => warn!(error = %err, "teacher lookup failed during alert fan-out"),
        }

        if log.violation_count > 1 {
            match self.directory.parent_of(incident.reported_student_id).await {
                Ok(Some(parent_id)) => {
                    self.send_alert(AlertRequest {
                        target_id: parent_id,
                        kind: AlertKind::ParentNotice,
                        severity: incident.severity,
                        title: "Repeated conduct violation".to_string(),
                        message: format!(
                            "Your child has {} recorded violations; the latest: {}",
                            log.violation_count, incident.description
                        ),
                        metadata: metadata.clone(),
                    })
                    .await;
                }
                Ok(None) => warn!(
                    student = %incident.reported_student_id,
                    "no parent on file for incident alert"
                ),
                Err(err) => warn!(error = %err, "parent lookup failed during alert fan-out"),
            }
        }

        if incident.severity == Severity::Critical
            || log.violation_count >= ADMIN_ESCALATION_COUNT
        {
            match self.directory.safety_admins().await {
                Ok(admins) => {
                    for admin_id in admins {
                        self.send_alert(AlertRequest {
                            target_id: admin_id,
                            kind: AlertKind::AdminEscalation,
                            severity: incident.severity,
                            title: "Safety escalation".to_string(),
                            message: incident.description.clone(),
                            metadata: metadata.clone(),
                        })
                        .await;
                    }
                }
                Err(err) => warn!(error = %err, "admin lookup failed during alert fan-out"),
            }
        }
    }

    async fn send_alert(&self, request: AlertRequest) {
        if let Err(err) = self.alerts.create_alert(&request).await {
            warn!(
                target = %request.target_id,
                kind = request.kind.as_str(),
                error = %err,
                "alert dispatch failed"
            );
        }
    }

    /// Move a pending incident to reviewed or dismissed. Dismissal does not
    /// roll back the violation-count increment applied at report time.
    pub async fn review_incident(
        &self,
        incident_id: Uuid,
        teacher_id: Uuid,
        notes: impl Into<String>,
        decision: ReviewDecision,
    ) -> Result<Incident, SafetyError> {
        let mut incident = self
            .store
            .incident(incident_id)
            .await?
            .ok_or_else(|| SafetyError::not_found("incident"))?;
        if incident.status != IncidentStatus::Pending {
            return Err(SafetyError::validation(format!(
                "incident is {}, only pending incidents can be reviewed",
                incident.status.as_str()
            )));
        }

        incident.status = match decision {
            ReviewDecision::Valid => IncidentStatus::Reviewed,
            ReviewDecision::Invalid => IncidentStatus::Dismissed,
        };
        incident.reviewed_by = Some(teacher_id);
        incident.review_notes = Some(notes.into());
        self.store.update_incident(&incident).await?;

        info!(
            incident_id = %incident.id,
            status = incident.status.as_str(),
            "incident reviewed"
        );
        Ok(incident)
    }

    /// Apply the consequence tier for the offender's *current* violation
    /// count. The caller-supplied list is advisory only; the tier table wins.
    pub async fn apply_consequences(
        &self,
        incident_id: Uuid,
        advisory: &[String],
        restriction_ends_at: Option<DateTime<Utc>>,
    ) -> Result<(Incident, ViolationLog), SafetyError> {
        let mut incident = self
            .store
            .incident(incident_id)
            .await?
            .ok_or_else(|| SafetyError::not_found("incident"))?;
        let mut log = self
            .store
            .violation_log(incident.reported_student_id)
            .await?
            .ok_or_else(|| SafetyError::not_found("violation log"))?;

        let consequences = consequence_tier(log.violation_count);
        if !advisory.is_empty() && advisory != consequences.as_slice() {
            info!(
                incident_id = %incident.id,
                "advisory consequences overridden by the tier table"
            );
        }

        incident.applied_consequences = consequences.clone();
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(Utc::now());
        self.store.update_incident(&incident).await?;

        log.applied_consequences.extend(consequences);
        if restriction_ends_at.is_some() {
            log.restriction_ends_at = restriction_ends_at;
        }
        log.status = ViolationStatus::from_count(log.violation_count);
        self.store.update_violation(&log).await?;

        info!(
            incident_id = %incident.id,
            offender = %incident.reported_student_id,
            violation_count = log.violation_count,
            status = log.status.as_str(),
            "consequences applied"
        );
        Ok((incident, log))
    }

    /// A message is blocked only when it is flagged *and* the sender is under
    /// an active restriction. First offenses are warn-only.
    pub async fn should_block_message(
        &self,
        sender_id: Uuid,
        is_flagged: bool,
    ) -> Result<bool, SafetyError> {
        if !is_flagged {
            return Ok(false);
        }
        let log = self.store.violation_log(sender_id).await?;
        Ok(matches!(
            log.and_then(|l| l.restriction_ends_at),
            Some(ends_at) if ends_at > Utc::now()
        ))
    }

    /// Mark victim notification as requested. Idempotent: repeat calls do not
    /// re-request delivery.
    pub async fn notify_victim(&self, incident_id: Uuid) -> Result<Incident, SafetyError> {
        let mut incident = self
            .store
            .incident(incident_id)
            .await?
            .ok_or_else(|| SafetyError::not_found("incident"))?;
        if incident.victim_notified {
            return Ok(incident);
        }
        incident.victim_notified = true;
        self.store.update_incident(&incident).await?;

        self.send_alert(AlertRequest {
            target_id: incident.victim_student_id,
            kind: AlertKind::VictimSupport,
            severity: incident.severity,
            title: "We are looking out for you".to_string(),
            message: "A teacher has been informed about a message you received.".to_string(),
            metadata: serde_json::json!({ "incident_id": incident.id }),
        })
        .await;
        Ok(incident)
    }

    /// Mark parent notification (victim's side) as requested. Idempotent.
    pub async fn notify_parent(&self, incident_id: Uuid) -> Result<Incident, SafetyError> {
        let mut incident = self
            .store
            .incident(incident_id)
            .await?
            .ok_or_else(|| SafetyError::not_found("incident"))?;
        if incident.parent_notified {
            return Ok(incident);
        }
        incident.parent_notified = true;
        self.store.update_incident(&incident).await?;

        match self.directory.parent_of(incident.victim_student_id).await {
            Ok(Some(parent_id)) => {
                self.send_alert(AlertRequest {
                    target_id: parent_id,
                    kind: AlertKind::ParentNotice,
                    severity: incident.severity,
                    title: "Safety notice about your child".to_string(),
                    message: incident.description.clone(),
                    metadata: serde_json::json!({ "incident_id": incident.id }),
                })
                .await;
            }
            Ok(None) => warn!(
                student = %incident.victim_student_id,
                "no parent on file for victim notification"
            ),
            Err(err) => warn!(error = %err, "parent lookup failed for victim notification"),
        }
        Ok(incident)
    }

    /// Incident counts by type and severity over the window, optionally
    /// scoped to a roster. Read-only.
    pub async fn class_statistics(
        &self,
        window_days: i64,
        roster: Option<&[Uuid]>,
    ) -> Result<ClassStatistics, SafetyError> {
        let cutoff = Utc::now() - Duration::days(window_days.max(1));
        let incidents: Vec<Incident> = self
            .store
            .incidents_since(cutoff)
            .await?
            .into_iter()
            .filter(|i| match roster {
                Some(students) => {
                    students.contains(&i.reported_student_id)
                        || students.contains(&i.victim_student_id)
                }
                None => true,
            })
            .collect();

        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        let mut students: BTreeSet<Uuid> = BTreeSet::new();
        let mut resolved = 0usize;
        for incident in &incidents {
            *by_type
                .entry(incident.incident_type.as_str().to_string())
                .or_insert(0) += 1;
            *by_severity
                .entry(incident.severity.as_str().to_string())
                .or_insert(0) += 1;
            students.insert(incident.reported_student_id);
            students.insert(incident.victim_student_id);
            if incident.status == IncidentStatus::Resolved {
                resolved += 1;
            }
        }

        let total = incidents.len();
        Ok(ClassStatistics {
            window_days,
            total_incidents: total,
            by_type: by_type.into_iter().collect(),
            by_severity: by_severity.into_iter().collect(),
            distinct_students: students.len(),
            resolved_rate: if total == 0 {
                0.0
            } else {
                resolved as f64 / total as f64
            },
        })
    }
}

/// The fixed escalation ladder. Advisory input never changes it.
pub fn consequence_tier(violation_count: u32) -> Vec<String> {
    let tier: &[&str] = match violation_count {
        0 | 1 => &[
            "warning",
            "1-hour message timeout",
            "parent notification",
        ],
        2 => &[
            "parent conversation required",
            "24-hour chat ban",
            "kindness training module",
            "apology letter",
        ],
        3 => &[
            "1-week group activity restriction",
            "parent and counselor meeting",
            "empathy training",
        ],
        _ => &[
            "account restricted",
            "admin review required",
            "disciplinary process",
        ],
    };
    tier.iter().map(|s| s.to_string()).collect()
}

fn validate_report(report: &IncidentReport) -> Result<(), SafetyError> {
    if report.reported_student_id.is_nil() {
        return Err(SafetyError::validation("reported student id is required"));
    }
    if report.victim_student_id.is_nil() {
        return Err(SafetyError::validation("victim student id is required"));
    }
    if report.description.trim().is_empty() {
        return Err(SafetyError::validation("description is required"));
    }
    Ok(())
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::models::IncidentType;

    pub fn sample_report(offender: Uuid, victim: Uuid, severity: Severity) -> IncidentReport {
        IncidentReport {
            reported_student_id: offender,
            victim_student_id: victim,
            incident_type: IncidentType::ManualReport,
            description: "observed name-calling during recess".to_string(),
            flagged_content: None,
            severity,
            flag_reasons: vec!["harsh insult".to_string()],
        }
    }

    pub fn sample_incident() -> Incident {
        Incident {
            id: Uuid::new_v4(),
            reported_student_id: Uuid::new_v4(),
            victim_student_id: Uuid::new_v4(),
            incident_type: IncidentType::ManualReport,
            description: "sample".to_string(),
            flagged_content: None,
            severity: Severity::Medium,
            status: IncidentStatus::Pending,
            flag_reasons: Vec::new(),
            applied_consequences: Vec::new(),
            violation_count_at_report: 1,
            victim_notified: false,
            parent_notified: false,
            reviewed_by: None,
            review_notes: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}
