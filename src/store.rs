//! Collaborator contracts for persistence, activity reads, directory lookups
//! and alert requests, plus in-memory implementations shared by tests and
//! local runs. The Postgres implementations live in `db`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SafetyError;
use crate::models::{
    AlertRequest, BehavioralAnomaly, Incident, ProgressRecord, ViolationLog, ViolationStatus,
};

/// Durable safety state: incidents, violation logs, behavioral anomalies.
#[async_trait]
pub trait SafetyStore: Send + Sync {
    /// Create-or-increment the student's violation log and return the
    /// post-increment row. Implementations must serialize this per student;
    /// concurrent reports may never under-count.
    async fn upsert_violation(
        &self,
        student_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ViolationLog, SafetyError>;

    async fn violation_log(&self, student_id: Uuid) -> Result<Option<ViolationLog>, SafetyError>;
    async fn update_violation(&self, log: &ViolationLog) -> Result<(), SafetyError>;

    async fn insert_incident(&self, incident: &Incident) -> Result<(), SafetyError>;
    async fn incident(&self, id: Uuid) -> Result<Option<Incident>, SafetyError>;
    async fn update_incident(&self, incident: &Incident) -> Result<(), SafetyError>;

    /// All incidents created at or after the cutoff, newest first.
    async fn incidents_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Incident>, SafetyError>;
    /// All incidents where the student is offender or victim, newest first.
    async fn incidents_involving(&self, student_id: Uuid) -> Result<Vec<Incident>, SafetyError>;

    async fn insert_behavioral_anomaly(
        &self,
        anomaly: &BehavioralAnomaly,
    ) -> Result<(), SafetyError>;
}

/// Read-only view of student game activity. Records come back newest first.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn student_history(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>, SafetyError>;

    async fn cohort_history(
        &self,
        classroom_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>, SafetyError>;
}

/// Role and guardian lookups. Assumed to exist elsewhere in the platform;
/// only what the alert fan-out needs is modelled here.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn teacher_of(&self, student_id: Uuid) -> Result<Option<Uuid>, SafetyError>;
    async fn parent_of(&self, student_id: Uuid) -> Result<Option<Uuid>, SafetyError>;
    async fn safety_admins(&self) -> Result<Vec<Uuid>, SafetyError>;
    async fn classroom_students(&self, classroom_id: Uuid) -> Result<Vec<Uuid>, SafetyError>;
}

/// Accepts alert requests; delivery is out of scope.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn create_alert(&self, request: &AlertRequest) -> Result<(), SafetyError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    incidents: HashMap<Uuid, Incident>,
    violations: HashMap<Uuid, ViolationLog>,
    anomalies: Vec<BehavioralAnomaly>,
}

/// Hash-map store behind one async mutex. The mutex also serializes the
/// violation upsert, which is exactly the guarantee the trait asks for.
#[derive(Default)]
pub struct MemorySafetyStore {
    state: Mutex<MemoryState>,
}

impl MemorySafetyStore {
    pub fn new() -> Arc<MemorySafetyStore> {
        Arc::new(MemorySafetyStore::default())
    }

    pub async fn behavioral_anomalies(&self) -> Vec<BehavioralAnomaly> {
        self.state.lock().await.anomalies.clone()
    }
}

#[async_trait]
impl SafetyStore for MemorySafetyStore {
    async fn upsert_violation(
        &self,
        student_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ViolationLog, SafetyError> {
        let mut state = self.state.lock().await;
        let log = state
            .violations
            .entry(student_id)
            .and_modify(|log| {
                log.violation_count += 1;
                log.status = ViolationStatus::from_count(log.violation_count);
                log.last_violation_at = at;
            })
            .or_insert_with(|| ViolationLog {
                student_id,
                violation_count: 1,
                status: ViolationStatus::from_count(1),
                first_violation_at: at,
                last_violation_at: at,
                restriction_ends_at: None,
                applied_consequences: Vec::new(),
            });
        Ok(log.clone())
    }

    async fn violation_log(&self, student_id: Uuid) -> Result<Option<ViolationLog>, SafetyError> {
        Ok(self.state.lock().await.violations.get(&student_id).cloned())
    }

    async fn update_violation(&self, log: &ViolationLog) -> Result<(), SafetyError> {
        let mut state = self.state.lock().await;
        if !state.violations.contains_key(&log.student_id) {
            return Err(SafetyError::not_found("violation log"));
        }
        state.violations.insert(log.student_id, log.clone());
        Ok(())
    }

    async fn insert_incident(&self, incident: &Incident) -> Result<(), SafetyError> {
        self.state
            .lock()
            .await
            .incidents
            .insert(incident.id, incident.clone());
        Ok(())
    }

    async fn incident(&self, id: Uuid) -> Result<Option<Incident>, SafetyError> {
        Ok(self.state.lock().await.incidents.get(&id).cloned())
    }

    async fn update_incident(&self, incident: &Incident) -> Result<(), SafetyError> {
        let mut state = self.state.lock().await;
        if !state.incidents.contains_key(&incident.id) {
            return Err(SafetyError::not_found("incident"));
        }
        state.incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn incidents_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Incident>, SafetyError> {
        let state = self.state.lock().await;
        let mut found: Vec<Incident> = state
            .incidents
            .values()
            .filter(|i| i.created_at >= cutoff)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn incidents_involving(&self, student_id: Uuid) -> Result<Vec<Incident>, SafetyError> {
        let state = self.state.lock().await;
        let mut found: Vec<Incident> = state
            .incidents
            .values()
            .filter(|i| {
                i.reported_student_id == student_id || i.victim_student_id == student_id
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn insert_behavioral_anomaly(
        &self,
        anomaly: &BehavioralAnomaly,
    ) -> Result<(), SafetyError> {
        self.state.lock().await.anomalies.push(anomaly.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryActivityState {
    records: Vec<ProgressRecord>,
    classrooms: HashMap<Uuid, Vec<Uuid>>,
}

#[derive(Default)]
pub struct MemoryActivityStore {
    state: Mutex<MemoryActivityState>,
}

impl MemoryActivityStore {
    pub fn new() -> Arc<MemoryActivityStore> {
        Arc::new(MemoryActivityStore::default())
    }

    pub async fn push_record(&self, record: ProgressRecord) {
        self.state.lock().await.records.push(record);
    }

    pub async fn set_classroom(&self, classroom_id: Uuid, students: Vec<Uuid>) {
        self.state
            .lock()
            .await
            .classrooms
            .insert(classroom_id, students);
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn student_history(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>, SafetyError> {
        let state = self.state.lock().await;
        let mut records: Vec<ProgressRecord> = state
            .records
            .iter()
            .filter(|r| r.student_id == student_id && r.recorded_at >= since)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(records)
    }

    async fn cohort_history(
        &self,
        classroom_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>, SafetyError> {
        let state = self.state.lock().await;
        let roster = state
            .classrooms
            .get(&classroom_id)
            .cloned()
            .unwrap_or_default();
        let mut records: Vec<ProgressRecord> = state
            .records
            .iter()
            .filter(|r| roster.contains(&r.student_id) && r.recorded_at >= since)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(records)
    }
}

#[derive(Default)]
struct MemoryDirectoryState {
    teachers: HashMap<Uuid, Uuid>,
    parents: HashMap<Uuid, Uuid>,
    admins: Vec<Uuid>,
    classrooms: HashMap<Uuid, Vec<Uuid>>,
}

#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<MemoryDirectoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Arc<MemoryDirectory> {
        Arc::new(MemoryDirectory::default())
    }

    pub async fn add_student(&self, student_id: Uuid, teacher_id: Uuid, parent_id: Uuid) {
        let mut state = self.state.lock().await;
        state.teachers.insert(student_id, teacher_id);
        state.parents.insert(student_id, parent_id);
    }

    pub async fn add_admin(&self, admin_id: Uuid) {
        self.state.lock().await.admins.push(admin_id);
    }

    pub async fn set_classroom(&self, classroom_id: Uuid, students: Vec<Uuid>) {
        self.state
            .lock()
            .await
            .classrooms
            .insert(classroom_id, students);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn teacher_of(&self, student_id: Uuid) -> Result<Option<Uuid>, SafetyError> {
        Ok(self.state.lock().await.teachers.get(&student_id).copied())
    }

    async fn parent_of(&self, student_id: Uuid) -> Result<Option<Uuid>, SafetyError> {
        Ok(self.state.lock().await.parents.get(&student_id).copied())
    }

    async fn safety_admins(&self) -> Result<Vec<Uuid>, SafetyError> {
        Ok(self.state.lock().await.admins.clone())
    }

    async fn classroom_students(&self, classroom_id: Uuid) -> Result<Vec<Uuid>, SafetyError> {
        Ok(self
            .state
            .lock()
            .await
            .classrooms
            .get(&classroom_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Collects alert requests so tests can assert the fan-out policy. Can be
/// told to fail, which the ledger must survive.
#[derive(Default)]
pub struct MemoryAlertSink {
    requests: Mutex<Vec<AlertRequest>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryAlertSink {
    pub fn new() -> Arc<MemoryAlertSink> {
        Arc::new(MemoryAlertSink::default())
    }

    pub async fn requests(&self) -> Vec<AlertRequest> {
        self.requests.lock().await.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn create_alert(&self, request: &AlertRequest) -> Result<(), SafetyError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SafetyError::Store(anyhow::anyhow!(
                "alert sink unavailable"
            )));
        }
        self.requests.lock().await.push(request.clone());
        Ok(())
    }
}
