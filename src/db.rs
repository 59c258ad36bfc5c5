//! Postgres-backed implementations of the store contracts, plus schema setup
//! and seed data for local use. Enum fields are stored as text, list fields
//! as JSON text; the derivable `ViolationLog.status` is never stored, only
//! recomputed from the count on read.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::SafetyError;
use crate::models::{
    AlertRequest, BehavioralAnomaly, Incident, IncidentStatus, IncidentType, ProgressRecord,
    Severity, ViolationLog, ViolationStatus,
};
use crate::store::{ActivityStore, AlertSink, Directory, SafetyStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    let statements = [
        "CREATE SCHEMA IF NOT EXISTS classroom_safety",
        r#"
        CREATE TABLE IF NOT EXISTS classroom_safety.students (
            id UUID PRIMARY KEY,
            full_name TEXT NOT NULL,
            classroom_id UUID NOT NULL,
            teacher_id UUID NOT NULL,
            parent_id UUID NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS classroom_safety.staff (
            id UUID PRIMARY KEY,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS classroom_safety.progress (
            id UUID PRIMARY KEY,
            student_id UUID NOT NULL,
            game_id UUID NOT NULL,
            category TEXT NOT NULL,
            score DOUBLE PRECISION NOT NULL,
            completed BOOLEAN NOT NULL,
            hints_used INT NOT NULL,
            time_spent_seconds INT NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS classroom_safety.violation_logs (
            student_id UUID PRIMARY KEY,
            violation_count INT NOT NULL,
            first_violation_at TIMESTAMPTZ NOT NULL,
            last_violation_at TIMESTAMPTZ NOT NULL,
            restriction_ends_at TIMESTAMPTZ,
            applied_consequences TEXT NOT NULL DEFAULT '[]'
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS classroom_safety.incidents (
            id UUID PRIMARY KEY,
            reported_student_id UUID NOT NULL,
            victim_student_id UUID NOT NULL,
            incident_type TEXT NOT NULL,
            description TEXT NOT NULL,
            flagged_content TEXT,
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            flag_reasons TEXT NOT NULL DEFAULT '[]',
            applied_consequences TEXT NOT NULL DEFAULT '[]',
            violation_count_at_report INT NOT NULL,
            victim_notified BOOLEAN NOT NULL DEFAULT FALSE,
            parent_notified BOOLEAN NOT NULL DEFAULT FALSE,
            reviewed_by UUID,
            review_notes TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            resolved_at TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS classroom_safety.behavioral_anomalies (
            id UUID PRIMARY KEY,
            student_id UUID NOT NULL,
            anomaly_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            metrics TEXT NOT NULL,
            teacher_notified BOOLEAN NOT NULL DEFAULT FALSE,
            status TEXT NOT NULL,
            detected_at TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS classroom_safety.alerts (
            id UUID PRIMARY KEY,
            target_id UUID NOT NULL,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS incidents_created_at_idx \
         ON classroom_safety.incidents (created_at)",
        "CREATE INDEX IF NOT EXISTS progress_student_recorded_idx \
         ON classroom_safety.progress (student_id, recorded_at)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("schema setup statement failed")?;
    }
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let classroom_id = Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?;
    let teacher_id = Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?;

    sqlx::query(
        r#"
        INSERT INTO classroom_safety.staff (id, full_name, role)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(teacher_id)
    .bind("Dana Okafor")
    .bind("teacher")
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO classroom_safety.staff (id, full_name, role)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?)
    .bind("Sam Reyes")
    .bind("safety_admin")
    .execute(pool)
    .await?;

    let students = [
        ("8f6f2c1e-51a1-4e0f-9d0f-6a4f1b2c3d4e", "Avery Lee"),
        ("1b9f3e2d-6c5a-4b7d-8e9f-0a1b2c3d4e5f", "Jules Moreno"),
        ("2c8e4d3f-7b6a-4c8e-9f0a-1b2c3d4e5f6a", "Kiara Patel"),
        ("3d9f5e4a-8c7b-4d9f-a0b1-2c3d4e5f6a7b", "Tom Becker"),
    ];

    for (id, name) in students {
        let student_id = Uuid::parse_str(id)?;
        sqlx::query(
            r#"
            INSERT INTO classroom_safety.students
            (id, full_name, classroom_id, teacher_id, parent_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(student_id)
        .bind(name)
        .bind(classroom_id)
        .bind(teacher_id)
        .bind(Uuid::new_v4())
        .execute(pool)
        .await?;

        let game_id = Uuid::new_v4();
        for day in 0..10i64 {
            sqlx::query(
                r#"
                INSERT INTO classroom_safety.progress
                (id, student_id, game_id, category, score, completed,
                 hints_used, time_spent_seconds, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(game_id)
            .bind("group")
            .bind(60.0 + (day % 4) as f64 * 10.0)
            .bind(true)
            .bind((day % 3) as i32)
            .bind(600i32)
            .bind(Utc::now() - chrono::Duration::days(day))
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

pub async fn import_progress_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_id: Uuid,
        game_id: Uuid,
        category: String,
        score: f64,
        completed: bool,
        hints_used: u32,
        time_spent_seconds: u32,
        recorded_at: DateTime<Utc>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        sqlx::query(
            r#"
            INSERT INTO classroom_safety.progress
            (id, student_id, game_id, category, score, completed,
             hints_used, time_spent_seconds, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(row.student_id)
        .bind(row.game_id)
        .bind(&row.category)
        .bind(row.score)
        .bind(row.completed)
        .bind(row.hints_used as i32)
        .bind(row.time_spent_seconds as i32)
        .bind(row.recorded_at)
        .execute(pool)
        .await?;
        inserted += 1;
    }

    Ok(inserted)
}

fn store_err(err: sqlx::Error) -> SafetyError {
    SafetyError::Store(anyhow::Error::from(err))
}

fn bad_row(what: &str) -> SafetyError {
    SafetyError::Store(anyhow::anyhow!("unreadable {what} value in row"))
}

fn to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn violation_from_row(row: &sqlx::postgres::PgRow) -> ViolationLog {
    let count = row.get::<i32, _>("violation_count").max(0) as u32;
    ViolationLog {
        student_id: row.get("student_id"),
        violation_count: count,
        status: ViolationStatus::from_count(count),
        first_violation_at: row.get("first_violation_at"),
        last_violation_at: row.get("last_violation_at"),
        restriction_ends_at: row.get("restriction_ends_at"),
        applied_consequences: from_json(row.get::<String, _>("applied_consequences").as_str()),
    }
}

fn incident_from_row(row: &sqlx::postgres::PgRow) -> Result<Incident, SafetyError> {
    let incident_type = IncidentType::parse(row.get::<String, _>("incident_type").as_str())
        .ok_or_else(|| bad_row("incident_type"))?;
    let severity = Severity::parse(row.get::<String, _>("severity").as_str())
        .ok_or_else(|| bad_row("severity"))?;
    let status = IncidentStatus::parse(row.get::<String, _>("status").as_str())
        .ok_or_else(|| bad_row("status"))?;
    Ok(Incident {
        id: row.get("id"),
        reported_student_id: row.get("reported_student_id"),
        victim_student_id: row.get("victim_student_id"),
        incident_type,
        description: row.get("description"),
        flagged_content: row.get("flagged_content"),
        severity,
        status,
        flag_reasons: from_json(row.get::<String, _>("flag_reasons").as_str()),
        applied_consequences: from_json(row.get::<String, _>("applied_consequences").as_str()),
        violation_count_at_report: row.get::<i32, _>("violation_count_at_report").max(0) as u32,
        victim_notified: row.get("victim_notified"),
        parent_notified: row.get("parent_notified"),
        reviewed_by: row.get("reviewed_by"),
        review_notes: row.get("review_notes"),
        created_at: row.get("created_at"),
        resolved_at: row.get("resolved_at"),
    })
}

pub struct PgSafetyStore {
    pool: PgPool,
}

impl PgSafetyStore {
    pub fn new(pool: PgPool) -> PgSafetyStore {
        PgSafetyStore { pool }
    }
}

#[async_trait]
impl SafetyStore for PgSafetyStore {
    async fn upsert_violation(
        &self,
        student_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ViolationLog, SafetyError> {
        // One statement: the increment happens inside the database, so
        // concurrent reports for the same student cannot under-count.
        let row = sqlx::query(
            r#"
            INSERT INTO classroom_safety.violation_logs
            (student_id, violation_count, first_violation_at, last_violation_at)
            VALUES ($1, 1, $2, $2)
            ON CONFLICT (student_id) DO UPDATE
            SET violation_count = classroom_safety.violation_logs.violation_count + 1,
                last_violation_at = EXCLUDED.last_violation_at
            RETURNING student_id, violation_count, first_violation_at,
                      last_violation_at, restriction_ends_at, applied_consequences
            "#,
        )
        .bind(student_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(violation_from_row(&row))
    }

    async fn violation_log(&self, student_id: Uuid) -> Result<Option<ViolationLog>, SafetyError> {
        let row = sqlx::query(
            "SELECT student_id, violation_count, first_violation_at, last_violation_at, \
             restriction_ends_at, applied_consequences \
             FROM classroom_safety.violation_logs WHERE student_id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.as_ref().map(violation_from_row))
    }

    async fn update_violation(&self, log: &ViolationLog) -> Result<(), SafetyError> {
        let result = sqlx::query(
            r#"
            UPDATE classroom_safety.violation_logs
            SET restriction_ends_at = $2, applied_consequences = $3
            WHERE student_id = $1
            "#,
        )
        .bind(log.student_id)
        .bind(log.restriction_ends_at)
        .bind(to_json(&log.applied_consequences))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(SafetyError::not_found("violation log"));
        }
        Ok(())
    }

    async fn insert_incident(&self, incident: &Incident) -> Result<(), SafetyError> {
        sqlx::query(
            r#"
            INSERT INTO classroom_safety.incidents
            (id, reported_student_id, victim_student_id, incident_type, description,
             flagged_content, severity, status, flag_reasons, applied_consequences,
             violation_count_at_report, victim_notified, parent_notified,
             reviewed_by, review_notes, created_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(incident.id)
        .bind(incident.reported_student_id)
        .bind(incident.victim_student_id)
        .bind(incident.incident_type.as_str())
        .bind(&incident.description)
        .bind(&incident.flagged_content)
        .bind(incident.severity.as_str())
        .bind(incident.status.as_str())
        .bind(to_json(&incident.flag_reasons))
        .bind(to_json(&incident.applied_consequences))
        .bind(incident.violation_count_at_report as i32)
        .bind(incident.victim_notified)
        .bind(incident.parent_notified)
        .bind(incident.reviewed_by)
        .bind(&incident.review_notes)
        .bind(incident.created_at)
        .bind(incident.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn incident(&self, id: Uuid) -> Result<Option<Incident>, SafetyError> {
        let row = sqlx::query("SELECT * FROM classroom_safety.incidents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(incident_from_row).transpose()
    }

    async fn update_incident(&self, incident: &Incident) -> Result<(), SafetyError> {
        let result = sqlx::query(
            r#"
            UPDATE classroom_safety.incidents
            SET status = $2, applied_consequences = $3, victim_notified = $4,
                parent_notified = $5, reviewed_by = $6, review_notes = $7,
                resolved_at = $8
            WHERE id = $1
            "#,
        )
        .bind(incident.id)
        .bind(incident.status.as_str())
        .bind(to_json(&incident.applied_consequences))
        .bind(incident.victim_notified)
        .bind(incident.parent_notified)
        .bind(incident.reviewed_by)
        .bind(&incident.review_notes)
        .bind(incident.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(SafetyError::not_found("incident"));
        }
        Ok(())
    }

    async fn incidents_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Incident>, SafetyError> {
        let rows = sqlx::query(
            "SELECT * FROM classroom_safety.incidents \
             WHERE created_at >= $1 ORDER BY created_at DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(incident_from_row).collect()
    }

    async fn incidents_involving(&self, student_id: Uuid) -> Result<Vec<Incident>, SafetyError> {
        let rows = sqlx::query(
            "SELECT * FROM classroom_safety.incidents \
             WHERE reported_student_id = $1 OR victim_student_id = $1 \
             ORDER BY created_at DESC",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(incident_from_row).collect()
    }

    async fn insert_behavioral_anomaly(
        &self,
        anomaly: &BehavioralAnomaly,
    ) -> Result<(), SafetyError> {
        let metrics = serde_json::to_string(&anomaly.metrics)
            .map_err(|e| SafetyError::Store(anyhow::Error::from(e)))?;
        sqlx::query(
            r#"
            INSERT INTO classroom_safety.behavioral_anomalies
            (id, student_id, anomaly_type, severity, description, metrics,
             teacher_notified, status, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(anomaly.id)
        .bind(anomaly.student_id)
        .bind(anomaly.anomaly_type.as_str())
        .bind(anomaly.severity.as_str())
        .bind(&anomaly.description)
        .bind(metrics)
        .bind(anomaly.teacher_notified)
        .bind(anomaly.status.as_str())
        .bind(anomaly.detected_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

pub struct PgActivityStore {
    pool: PgPool,
}

impl PgActivityStore {
    pub fn new(pool: PgPool) -> PgActivityStore {
        PgActivityStore { pool }
    }
}

fn progress_from_row(row: &sqlx::postgres::PgRow) -> ProgressRecord {
    ProgressRecord {
        student_id: row.get("student_id"),
        game_id: row.get("game_id"),
        category: row.get("category"),
        score: row.get("score"),
        completed: row.get("completed"),
        hints_used: row.get::<i32, _>("hints_used").max(0) as u32,
        time_spent_seconds: row.get::<i32, _>("time_spent_seconds").max(0) as u32,
        recorded_at: row.get("recorded_at"),
    }
}

#[async_trait]
impl ActivityStore for PgActivityStore {
    async fn student_history(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>, SafetyError> {
        let rows = sqlx::query(
            "SELECT student_id, game_id, category, score, completed, hints_used, \
             time_spent_seconds, recorded_at \
             FROM classroom_safety.progress \
             WHERE student_id = $1 AND recorded_at >= $2 \
             ORDER BY recorded_at DESC",
        )
        .bind(student_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.iter().map(progress_from_row).collect())
    }

    async fn cohort_history(
        &self,
        classroom_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>, SafetyError> {
        let rows = sqlx::query(
            "SELECT p.student_id, p.game_id, p.category, p.score, p.completed, \
             p.hints_used, p.time_spent_seconds, p.recorded_at \
             FROM classroom_safety.progress p \
             JOIN classroom_safety.students s ON s.id = p.student_id \
             WHERE s.classroom_id = $1 AND p.recorded_at >= $2 \
             ORDER BY p.recorded_at DESC",
        )
        .bind(classroom_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.iter().map(progress_from_row).collect())
    }
}

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> PgDirectory {
        PgDirectory { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn teacher_of(&self, student_id: Uuid) -> Result<Option<Uuid>, SafetyError> {
        let row = sqlx::query("SELECT teacher_id FROM classroom_safety.students WHERE id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|r| r.get("teacher_id")))
    }

    async fn parent_of(&self, student_id: Uuid) -> Result<Option<Uuid>, SafetyError> {
        let row = sqlx::query("SELECT parent_id FROM classroom_safety.students WHERE id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|r| r.get("parent_id")))
    }

    async fn safety_admins(&self) -> Result<Vec<Uuid>, SafetyError> {
        let rows =
            sqlx::query("SELECT id FROM classroom_safety.staff WHERE role = 'safety_admin'")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn classroom_students(&self, classroom_id: Uuid) -> Result<Vec<Uuid>, SafetyError> {
        let rows =
            sqlx::query("SELECT id FROM classroom_safety.students WHERE classroom_id = $1")
                .bind(classroom_id)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}

/// Persists alert requests as rows; a delivery worker elsewhere drains them.
pub struct PgAlertSink {
    pool: PgPool,
}

impl PgAlertSink {
    pub fn new(pool: PgPool) -> PgAlertSink {
        PgAlertSink { pool }
    }
}

#[async_trait]
impl AlertSink for PgAlertSink {
    async fn create_alert(&self, request: &AlertRequest) -> Result<(), SafetyError> {
        sqlx::query(
            r#"
            INSERT INTO classroom_safety.alerts
            (id, target_id, kind, severity, title, message, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.target_id)
        .bind(request.kind.as_str())
        .bind(request.severity.as_str())
        .bind(&request.title)
        .bind(&request.message)
        .bind(request.metadata.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}
