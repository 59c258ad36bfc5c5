//! Coordinates the classifier, detectors and ledger behind the operations the
//! rest of the platform calls: single-message checks, scan triggers, safety
//! profiles and the teacher dashboard. Scheduling of the scans lives outside;
//! these are plain entry points.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::behavior;
use crate::classifier::Classifier;
use crate::error::SafetyError;
use crate::ledger::IncidentLedger;
use crate::models::{
    AnomalyStatus, AnomalyType, BehavioralAnomaly, Incident, IncidentReport, IncidentStatus,
    IncidentType, MessageCheck, RiskLevel, SafetyProfile, Severity, SocialAnomaly,
    TeacherDashboard,
};
use crate::social;
use crate::store::{ActivityStore, Directory, SafetyStore};

const BEHAVIOR_WINDOW_DAYS: i64 = 14;
const DASHBOARD_WINDOW_DAYS: i64 = 30;
const RECENT_INCIDENT_LIMIT: usize = 10;

pub struct SafetyOrchestrator {
    classifier: Classifier,
    ledger: IncidentLedger,
    store: Arc<dyn SafetyStore>,
    activity: Arc<dyn ActivityStore>,
    directory: Arc<dyn Directory>,
}

impl SafetyOrchestrator {
    pub fn new(
        classifier: Classifier,
        ledger: IncidentLedger,
        store: Arc<dyn SafetyStore>,
        activity: Arc<dyn ActivityStore>,
        directory: Arc<dyn Directory>,
    ) -> SafetyOrchestrator {
        SafetyOrchestrator {
            classifier,
            ledger,
            store,
            activity,
            directory,
        }
    }

    pub fn ledger(&self) -> &IncidentLedger {
        &self.ledger
    }

    /// Classify one message; flagged content becomes an incident against the
    /// sender. Blocking additionally requires an active restriction, so a
    /// first offense is recorded and warned about but not blocked.
    pub async fn check_message(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        content: &str,
    ) -> Result<MessageCheck, SafetyError> {
        let classification = self.classifier.classify(content);
        let sanitized = self.classifier.sanitize(content);

        if !classification.is_flagged {
            return Ok(MessageCheck {
                blocked: false,
                flagged: false,
                severity: None,
                reasons: classification.reasons.into_iter().collect(),
                sanitized,
            });
        }

        // Invariant: a flagged classification always carries a severity.
        debug_assert!(
            classification.severity.is_some(),
            "flagged classification without a severity"
        );
        let severity = classification.severity.unwrap_or(Severity::Medium);
        let reasons: Vec<String> = classification.reasons.iter().cloned().collect();
        self.ledger
            .report_incident(IncidentReport {
                reported_student_id: sender_id,
                victim_student_id: recipient_id,
                incident_type: IncidentType::TextAnalysis,
                description: format!("Flagged message: {}", reasons.join(", ")),
                flagged_content: Some(content.to_string()),
                severity,
                flag_reasons: reasons.clone(),
            })
            .await?;

        let blocked = self.ledger.should_block_message(sender_id, true).await?;
        Ok(MessageCheck {
            blocked,
            flagged: true,
            severity: Some(severity),
            reasons,
            sanitized,
        })
    }

    /// Run the behavioral detector for one student, persist every indicator,
    /// and escalate the serious ones into the ledger.
    pub async fn run_behavioral_scan(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<BehavioralAnomaly>, SafetyError> {
        let now = Utc::now();
        let since = now - Duration::days(BEHAVIOR_WINDOW_DAYS);
        let history = self.activity.student_history(student_id, since).await?;
        let indicators = behavior::analyze(student_id, &history, now);

        let mut anomalies = Vec::with_capacity(indicators.len());
        for indicator in indicators {
            let escalate = indicator.severity >= Severity::High
                || indicator.anomaly_type == AnomalyType::SuddenPerformanceDrop;

            let anomaly = BehavioralAnomaly {
                id: Uuid::new_v4(),
                student_id,
                anomaly_type: indicator.anomaly_type,
                severity: indicator.severity,
                description: indicator.description.clone(),
                metrics: indicator.metrics.clone(),
                teacher_notified: false,
                status: AnomalyStatus::New,
                detected_at: now,
            };
            self.store.insert_behavioral_anomaly(&anomaly).await?;

            if escalate {
                self.ledger
                    .report_incident(IncidentReport {
                        reported_student_id: student_id,
                        victim_student_id: student_id,
                        incident_type: IncidentType::Behavioral,
                        description: indicator.description,
                        flagged_content: None,
                        severity: indicator.severity,
                        flag_reasons: vec![indicator.anomaly_type.as_str().to_string()],
                    })
                    .await?;
            }
            anomalies.push(anomaly);
        }

        info!(
            student = %student_id,
            findings = anomalies.len(),
            "behavioral scan finished"
        );
        Ok(anomalies)
    }

    /// Run the social analyzer over a classroom and escalate every finding.
    pub async fn run_social_scan(
        &self,
        classroom_id: Uuid,
        window_days: i64,
    ) -> Result<Vec<SocialAnomaly>, SafetyError> {
        let now = Utc::now();
        let since = now - Duration::days(window_days.max(1));
        let history = self.activity.cohort_history(classroom_id, since).await?;
        let anomalies = social::analyze(&history, window_days, now);

        for anomaly in &anomalies {
            let reported = anomaly
                .bullying_students
                .first()
                .copied()
                .unwrap_or(anomaly.targeted_student);
            self.ledger
                .report_incident(IncidentReport {
                    reported_student_id: reported,
                    victim_student_id: anomaly.targeted_student,
                    incident_type: IncidentType::SocialNetwork,
                    description: anomaly.description.clone(),
                    flagged_content: None,
                    severity: anomaly.severity,
                    flag_reasons: vec![anomaly.anomaly_type.as_str().to_string()],
                })
                .await?;
        }

        info!(
            classroom = %classroom_id,
            findings = anomalies.len(),
            "social scan finished"
        );
        Ok(anomalies)
    }

    /// Risk summary for one student, drawn from their incident history and
    /// violation log.
    pub async fn student_safety_profile(
        &self,
        student_id: Uuid,
    ) -> Result<SafetyProfile, SafetyError> {
        let incidents = self.store.incidents_involving(student_id).await?;
        let log = self.store.violation_log(student_id).await?;

        let victim_count = incidents
            .iter()
            .filter(|i| i.victim_student_id == student_id)
            .count();
        let victim_risk = if victim_count > 3 {
            RiskLevel::High
        } else if victim_count > 1 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let violation_count = log.as_ref().map_or(0, |l| l.violation_count);
        let offender_risk = if violation_count > 2 {
            RiskLevel::High
        } else if violation_count > 0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let now = Utc::now();
        let under_restriction = log
            .as_ref()
            .and_then(|l| l.restriction_ends_at)
            .is_some_and(|ends| ends > now);
        let action_required = under_restriction
            || incidents
                .iter()
                .any(|i| i.status == IncidentStatus::Pending);

        Ok(SafetyProfile {
            student_id,
            victim_risk,
            offender_risk,
            incident_count: incidents.len(),
            last_incident_at: incidents.first().map(|i| i.created_at),
            action_required,
        })
    }

    /// Everything a teacher needs at a glance for one classroom.
    pub async fn teacher_dashboard(
        &self,
        classroom_id: Uuid,
    ) -> Result<TeacherDashboard, SafetyError> {
        let roster = self.directory.classroom_students(classroom_id).await?;
        let statistics = self
            .ledger
            .class_statistics(DASHBOARD_WINDOW_DAYS, Some(&roster))
            .await?;

        let cutoff = Utc::now() - Duration::days(DASHBOARD_WINDOW_DAYS);
        let class_incidents: Vec<Incident> = self
            .store
            .incidents_since(cutoff)
            .await?
            .into_iter()
            .filter(|i| {
                roster.contains(&i.reported_student_id) || roster.contains(&i.victim_student_id)
            })
            .collect();

        let pending_incidents: Vec<Incident> = class_incidents
            .iter()
            .filter(|i| i.status == IncidentStatus::Pending)
            .cloned()
            .collect();
        let recent_incidents: Vec<Incident> = class_incidents
            .iter()
            .take(RECENT_INCIDENT_LIMIT)
            .cloned()
            .collect();

        let mut high_risk_students = Vec::new();
        for student_id in &roster {
            let profile = self.student_safety_profile(*student_id).await?;
            if profile.victim_risk == RiskLevel::High || profile.offender_risk == RiskLevel::High {
                high_risk_students.push(profile);
            }
        }

        Ok(TeacherDashboard {
            classroom_id,
            pending_incidents,
            high_risk_students,
            statistics,
            recent_incidents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::Lexicon;
    use crate::models::ProgressRecord;
    use crate::store::{
        AlertSink, MemoryActivityStore, MemoryAlertSink, MemoryDirectory, MemorySafetyStore,
    };

    struct Harness {
        orchestrator: SafetyOrchestrator,
        store: Arc<MemorySafetyStore>,
        activity: Arc<MemoryActivityStore>,
        directory: Arc<MemoryDirectory>,
    }

    fn harness() -> Harness {
        let store = MemorySafetyStore::new();
        let activity = MemoryActivityStore::new();
        let directory = MemoryDirectory::new();
        let alerts = MemoryAlertSink::new();
        let ledger = IncidentLedger::new(
            Arc::clone(&store) as Arc<dyn SafetyStore>,
            Arc::clone(&alerts) as Arc<dyn AlertSink>,
            Arc::clone(&directory) as Arc<dyn Directory>,
        );
        let orchestrator = SafetyOrchestrator::new(
            Classifier::new(Lexicon::builtin()),
            ledger,
            Arc::clone(&store) as Arc<dyn SafetyStore>,
            Arc::clone(&activity) as Arc<dyn ActivityStore>,
            Arc::clone(&directory) as Arc<dyn Directory>,
        );
        Harness {
            orchestrator,
            store,
            activity,
            directory,
        }
    }

    fn session(student: Uuid, game: Uuid, minutes_ago: i64, score: f64) -> ProgressRecord {
        ProgressRecord {
            student_id: student,
            game_id: game,
            category: "group".to_string(),
            score,
            completed: true,
            hints_used: 0,
            time_spent_seconds: 300,
            recorded_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn clean_message_creates_nothing() {
        let h = harness();
        let result = h
            .orchestrator
            .check_message(Uuid::new_v4(), Uuid::new_v4(), "nice move, rematch?")
            .await
            .unwrap();
        assert!(!result.flagged);
        assert!(!result.blocked);
        assert!(h
            .store
            .incidents_since(Utc::now() - Duration::days(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn flagged_first_offense_records_but_does_not_block() {
        let h = harness();
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();

        let result = h
            .orchestrator
            .check_message(sender, recipient, "you are stupid and i will hurt you")
            .await
            .unwrap();

        assert!(result.flagged);
        assert!(!result.blocked);
        assert_eq!(result.severity, Some(Severity::Critical));
        assert!(result.reasons.iter().any(|r| r.contains("threat")));
        assert!(result.reasons.iter().any(|r| r.contains("insult")));

        let incidents = h
            .store
            .incidents_since(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].reported_student_id, sender);
        assert_eq!(incidents[0].victim_student_id, recipient);
        assert_eq!(incidents[0].incident_type, IncidentType::TextAnalysis);
    }

    #[tokio::test]
    async fn behavioral_scan_persists_and_escalates_score_drops() {
        let h = harness();
        let student = Uuid::new_v4();
        let game = Uuid::new_v4();
        for i in 0..5 {
            h.activity
                .push_record(session(student, game, i * 360, 40.0))
                .await;
        }
        for i in 5..10 {
            h.activity
                .push_record(session(student, game, i * 360, 80.0))
                .await;
        }

        let anomalies = h.orchestrator.run_behavioral_scan(student).await.unwrap();
        assert!(anomalies
            .iter()
            .any(|a| a.anomaly_type == AnomalyType::SuddenPerformanceDrop));
        assert_eq!(h.store.behavioral_anomalies().await.len(), anomalies.len());

        let incidents = h.store.incidents_involving(student).await.unwrap();
        assert!(incidents
            .iter()
            .any(|i| i.incident_type == IncidentType::Behavioral));
    }

    #[tokio::test]
    async fn behavioral_scan_with_thin_history_is_a_no_op() {
        let h = harness();
        let student = Uuid::new_v4();
        h.activity
            .push_record(session(student, Uuid::new_v4(), 2, 70.0))
            .await;

        let anomalies = h.orchestrator.run_behavioral_scan(student).await.unwrap();
        assert!(anomalies.is_empty());
        assert!(h.store.incidents_involving(student).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn social_scan_escalates_each_finding_into_an_incident() {
        let h = harness();
        let classroom = Uuid::new_v4();
        let game = Uuid::new_v4();
        let mut roster = Vec::new();
        for _ in 0..5 {
            let student = Uuid::new_v4();
            roster.push(student);
            // The same minute marks across students land in shared buckets.
            for minutes in [10, 20, 30, 40] {
                h.activity
                    .push_record(session(student, game, minutes, 70.0))
                    .await;
            }
        }
        let loner = Uuid::new_v4();
        roster.push(loner);
        h.activity
            .push_record(session(loner, game, 600, 70.0))
            .await;
        h.activity.set_classroom(classroom, roster).await;

        let anomalies = h.orchestrator.run_social_scan(classroom, 14).await.unwrap();
        // Isolated from the co-presence graph and excluded from group games.
        assert_eq!(anomalies.len(), 2);
        assert!(anomalies.iter().all(|a| a.targeted_student == loner));

        let incidents = h.store.incidents_involving(loner).await.unwrap();
        assert_eq!(incidents.len(), 2);
        assert!(incidents
            .iter()
            .all(|i| i.incident_type == IncidentType::SocialNetwork));
    }

    #[tokio::test]
    async fn profile_reflects_victim_and_offender_history() {
        let h = harness();
        let offender = Uuid::new_v4();
        let victim = Uuid::new_v4();
        h.directory
            .add_student(offender, Uuid::new_v4(), Uuid::new_v4())
            .await;

        for _ in 0..4 {
            h.orchestrator
                .check_message(offender, victim, "you are stupid")
                .await
                .unwrap();
        }

        let victim_profile = h.orchestrator.student_safety_profile(victim).await.unwrap();
        assert_eq!(victim_profile.victim_risk, RiskLevel::High);
        assert_eq!(victim_profile.offender_risk, RiskLevel::Low);
        assert_eq!(victim_profile.incident_count, 4);
        assert!(victim_profile.action_required);

        let offender_profile = h
            .orchestrator
            .student_safety_profile(offender)
            .await
            .unwrap();
        assert_eq!(offender_profile.offender_risk, RiskLevel::High);
        assert!(offender_profile.last_incident_at.is_some());
    }

    #[tokio::test]
    async fn unknown_student_has_a_clean_profile() {
        let h = harness();
        let profile = h
            .orchestrator
            .student_safety_profile(Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(profile.victim_risk, RiskLevel::Low);
        assert_eq!(profile.offender_risk, RiskLevel::Low);
        assert_eq!(profile.incident_count, 0);
        assert!(!profile.action_required);
    }

    #[tokio::test]
    async fn dashboard_collects_pending_and_high_risk() {
        let h = harness();
        let classroom = Uuid::new_v4();
        let offender = Uuid::new_v4();
        let victim = Uuid::new_v4();
        h.directory
            .set_classroom(classroom, vec![offender, victim])
            .await;

        for _ in 0..3 {
            h.orchestrator
                .check_message(offender, victim, "shut up idiot")
                .await
                .unwrap();
        }

        let dashboard = h.orchestrator.teacher_dashboard(classroom).await.unwrap();
        assert_eq!(dashboard.pending_incidents.len(), 3);
        assert_eq!(dashboard.statistics.total_incidents, 3);
        assert!(dashboard
            .high_risk_students
            .iter()
            .any(|p| p.student_id == offender));
        assert!(!dashboard.recent_incidents.is_empty());
    }
}
