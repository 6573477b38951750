//! Persistence contract for the workflow core and its SQLite adapter.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::audit::{self, AuditEntry};
use crate::cgpa::PublishedGrade;
use crate::config::{self, ConfigError, ServiceConfig};
use crate::db;
use crate::grading::{ComponentMarks, CourseType, GradeAggregator};
use crate::otp::{OtpChallenge, OtpPurpose};
use crate::ports::{Capabilities, IdentityError, IdentityProvider};
use crate::workflow::{ResultWorkflow, WorkflowKey, WorkflowStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("workflow {workflow_id} is no longer at version {expected}")]
    VersionConflict { workflow_id: String, expected: i64 },
    #[error("an active workflow already exists for this key")]
    DuplicateActive,
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub code: String,
    pub title: String,
    pub credit: f64,
    pub course_type: CourseType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Dropped,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Dropped => "dropped",
            EnrollmentStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(EnrollmentStatus::Active),
            "dropped" => Some(EnrollmentStatus::Dropped),
            "completed" => Some(EnrollmentStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Instructor,
    Committee,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Instructor => "instructor",
            Role::Committee => "committee",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "instructor" => Some(Role::Instructor),
            "committee" => Some(Role::Committee),
            _ => None,
        }
    }
}

/// One student's marks and derived grade within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub workflow_id: String,
    pub student_id: String,
    pub marks: ComponentMarks,
    pub total_marks: f64,
    pub letter_grade: String,
    pub grade_point: f64,
    pub updated_at: DateTime<Utc>,
}

impl GradeRecord {
    pub fn graded(
        workflow_id: &str,
        student_id: &str,
        marks: ComponentMarks,
        grader: &GradeAggregator,
        at: DateTime<Utc>,
    ) -> Self {
        let outcome = grader.compute(&marks);
        Self {
            workflow_id: workflow_id.to_string(),
            student_id: student_id.to_string(),
            marks,
            total_marks: outcome.total_marks,
            letter_grade: outcome.letter_grade,
            grade_point: outcome.grade_point,
            updated_at: at,
        }
    }
}

/// Grade records as they stood when a workflow was submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSnapshot {
    pub workflow_id: String,
    pub version: i64,
    pub taken_at: DateTime<Utc>,
    pub records: Vec<GradeRecord>,
}

/// Writes that ride along with a workflow version bump.
#[derive(Debug, Clone, Copy, Default)]
pub struct Changes<'a> {
    pub audit: Option<&'a AuditEntry>,
    pub grades: &'a [GradeRecord],
    pub snapshot: bool,
}

pub trait Store: Send + Sync {
    fn load_workflow(&self, workflow_id: &str) -> Result<Option<ResultWorkflow>, StoreError>;

    /// Fails with [`StoreError::DuplicateActive`] when a non-terminal
    /// workflow already exists for the same key.
    fn create_workflow(
        &self,
        workflow: &ResultWorkflow,
        seed: &[GradeRecord],
    ) -> Result<(), StoreError>;

    /// Compare-and-swap on `expected_version`. Either the workflow row and
    /// every change are written, or nothing is.
    fn save_workflow(
        &self,
        workflow: &ResultWorkflow,
        expected_version: i64,
        changes: Changes<'_>,
    ) -> Result<(), StoreError>;

    fn load_grade_records(&self, workflow_id: &str) -> Result<Vec<GradeRecord>, StoreError>;

    fn snapshots(&self, workflow_id: &str) -> Result<Vec<GradeSnapshot>, StoreError>;

    fn audit_history(&self, workflow_id: &str) -> Result<Vec<AuditEntry>, StoreError>;

    /// Grades of `student_id` from the newest PUBLISHED workflow of each
    /// (batch, course, semester), weighted by the credit frozen at publish.
    fn published_grades(&self, student_id: &str) -> Result<Vec<PublishedGrade>, StoreError>;

    fn course(&self, course_id: &str) -> Result<Option<Course>, StoreError>;

    /// Students actively enrolled for exactly this key.
    fn active_enrollments(&self, key: &WorkflowKey) -> Result<Vec<String>, StoreError>;
}

pub trait OtpStore: Send + Sync {
    /// Stores `challenge` and marks any earlier unused challenge for the same
    /// (actor, workflow, purpose) as used.
    fn insert_challenge(&self, challenge: &OtpChallenge) -> Result<(), StoreError>;

    /// Returns the newest unused challenge for the triple, marking it used in
    /// the same transaction.
    fn take_challenge(
        &self,
        actor_id: &str,
        workflow_id: &str,
        purpose: OtpPurpose,
    ) -> Result<Option<OtpChallenge>, StoreError>;
}

/// SQLite-backed store. The connection mutex is held for one call at a
/// time, never across a load/save pair.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        Ok(Self::from_connection(db::open_db(workspace)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::from_connection(db::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn load_config(&self) -> Result<ServiceConfig, ConfigError> {
        let conn = self.lock()?;
        config::load(&conn)
    }

    pub fn save_config(&self, cfg: &ServiceConfig) -> Result<(), ConfigError> {
        let conn = self.lock()?;
        config::save(&conn, cfg)
    }

    pub fn upsert_course(&self, course: &Course) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO courses(id, code, title, credit, course_type) VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               code = excluded.code,
               title = excluded.title,
               credit = excluded.credit,
               course_type = excluded.course_type",
            (
                &course.id,
                &course.code,
                &course.title,
                course.credit,
                course.course_type.as_str(),
            ),
        )?;
        Ok(())
    }

    pub fn grant_role(&self, actor_id: &str, course_id: &str, role: Role) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO course_roles(actor_id, course_id, role) VALUES(?, ?, ?)",
            (actor_id, course_id, role.as_str()),
        )?;
        Ok(())
    }

    pub fn revoke_role(&self, actor_id: &str, course_id: &str, role: Role) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM course_roles WHERE actor_id = ? AND course_id = ? AND role = ?",
            (actor_id, course_id, role.as_str()),
        )?;
        Ok(n > 0)
    }

    pub fn set_enrollment(
        &self,
        key: &WorkflowKey,
        student_id: &str,
        status: EnrollmentStatus,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO enrollments(batch_id, course_id, semester, student_id, status)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(batch_id, course_id, semester, student_id) DO UPDATE SET
               status = excluded.status",
            (
                &key.batch_id,
                &key.course_id,
                &key.semester,
                student_id,
                status.as_str(),
            ),
        )?;
        Ok(())
    }

    pub fn list_workflows(&self, course_id: Option<&str>) -> Result<Vec<ResultWorkflow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, batch_id, course_id, semester, status, version, created_at, updated_at
             FROM workflows
             WHERE (?1 IS NULL OR course_id = ?1)
             ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([course_id], workflow_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }
}

struct WorkflowRow {
    id: String,
    batch_id: String,
    course_id: String,
    semester: String,
    status: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<ResultWorkflow, StoreError> {
        Ok(ResultWorkflow {
            status: WorkflowStatus::parse_stored(&self.status)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            batch_id: self.batch_id,
            course_id: self.course_id,
            semester: self.semester,
            version: self.version,
        })
    }
}

fn workflow_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRow> {
    Ok(WorkflowRow {
        id: r.get(0)?,
        batch_id: r.get(1)?,
        course_id: r.get(2)?,
        semester: r.get(3)?,
        status: r.get(4)?,
        version: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
    )
}

fn upsert_grade(conn: &Connection, g: &GradeRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO grade_records(workflow_id, student_id, marks_json, total_marks, letter_grade, grade_point, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(workflow_id, student_id) DO UPDATE SET
           marks_json = excluded.marks_json,
           total_marks = excluded.total_marks,
           letter_grade = excluded.letter_grade,
           grade_point = excluded.grade_point,
           updated_at = excluded.updated_at",
        (
            &g.workflow_id,
            &g.student_id,
            serde_json::to_string(&g.marks)?,
            g.total_marks,
            &g.letter_grade,
            g.grade_point,
            g.updated_at.to_rfc3339(),
        ),
    )?;
    Ok(())
}

fn grade_records(conn: &Connection, workflow_id: &str) -> Result<Vec<GradeRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, marks_json, total_marks, letter_grade, grade_point, updated_at
         FROM grade_records
         WHERE workflow_id = ?
         ORDER BY student_id",
    )?;
    let rows = stmt
        .query_map([workflow_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(student_id, marks_json, total_marks, letter_grade, grade_point, at)| {
            Ok(GradeRecord {
                workflow_id: workflow_id.to_string(),
                student_id,
                marks: serde_json::from_str(&marks_json)?,
                total_marks,
                letter_grade,
                grade_point,
                updated_at: parse_ts(&at)?,
            })
        })
        .collect()
}

impl Store for SqliteStore {
    fn load_workflow(&self, workflow_id: &str) -> Result<Option<ResultWorkflow>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, batch_id, course_id, semester, status, version, created_at, updated_at
                 FROM workflows
                 WHERE id = ?",
                [workflow_id],
                workflow_row,
            )
            .optional()?;
        row.map(WorkflowRow::into_workflow).transpose()
    }

    fn create_workflow(
        &self,
        workflow: &ResultWorkflow,
        seed: &[GradeRecord],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO workflows(id, batch_id, course_id, semester, status, version, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &workflow.id,
                &workflow.batch_id,
                &workflow.course_id,
                &workflow.semester,
                workflow.status.as_str(),
                workflow.version,
                workflow.created_at.to_rfc3339(),
                workflow.updated_at.to_rfc3339(),
            ),
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(StoreError::DuplicateActive),
            Err(e) => return Err(e.into()),
        }
        for g in seed {
            upsert_grade(&tx, g)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn save_workflow(
        &self,
        workflow: &ResultWorkflow,
        expected_version: i64,
        changes: Changes<'_>,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        // Dropping `tx` without commit rolls everything back.
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE workflows
             SET status = ?1, version = ?2, updated_at = ?3,
                 published_credit = CASE WHEN ?1 = 'PUBLISHED'
                     THEN (SELECT credit FROM courses WHERE courses.id = workflows.course_id)
                     ELSE published_credit END
             WHERE id = ?4 AND version = ?5",
            (
                workflow.status.as_str(),
                workflow.version,
                workflow.updated_at.to_rfc3339(),
                &workflow.id,
                expected_version,
            ),
        )?;
        if updated == 0 {
            return Err(StoreError::VersionConflict {
                workflow_id: workflow.id.clone(),
                expected: expected_version,
            });
        }

        if let Some(entry) = changes.audit {
            audit::append(&tx, entry)?;
        }
        for g in changes.grades {
            upsert_grade(&tx, g)?;
        }
        if changes.snapshot {
            let records = grade_records(&tx, &workflow.id)?;
            tx.execute(
                "INSERT INTO grade_snapshots(workflow_id, version, taken_at, records_json)
                 VALUES(?, ?, ?, ?)",
                (
                    &workflow.id,
                    workflow.version,
                    workflow.updated_at.to_rfc3339(),
                    serde_json::to_string(&records)?,
                ),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_grade_records(&self, workflow_id: &str) -> Result<Vec<GradeRecord>, StoreError> {
        let conn = self.lock()?;
        grade_records(&conn, workflow_id)
    }

    fn snapshots(&self, workflow_id: &str) -> Result<Vec<GradeSnapshot>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT version, taken_at, records_json
             FROM grade_snapshots
             WHERE workflow_id = ?
             ORDER BY version",
        )?;
        let rows = stmt
            .query_map([workflow_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(version, taken_at, records_json)| {
                Ok(GradeSnapshot {
                    workflow_id: workflow_id.to_string(),
                    version,
                    taken_at: parse_ts(&taken_at)?,
                    records: serde_json::from_str(&records_json)?,
                })
            })
            .collect()
    }

    fn audit_history(&self, workflow_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.lock()?;
        audit::history(&conn, workflow_id)
    }

    fn published_grades(&self, student_id: &str) -> Result<Vec<PublishedGrade>, StoreError> {
        let conn = self.lock()?;
        // Only the newest published cycle of each result key counts.
        let mut stmt = conn.prepare(
            "WITH latest AS (
                 SELECT id, course_id, semester, published_credit,
                        ROW_NUMBER() OVER (
                            PARTITION BY batch_id, course_id, semester
                            ORDER BY created_at DESC, rowid DESC
                        ) AS rn
                 FROM workflows
                 WHERE status = 'PUBLISHED'
             )
             SELECT l.course_id, l.semester, COALESCE(l.published_credit, c.credit), g.grade_point
             FROM latest l
             JOIN grade_records g ON g.workflow_id = l.id
             JOIN courses c ON c.id = l.course_id
             WHERE l.rn = 1 AND g.student_id = ?
             ORDER BY l.semester, l.course_id",
        )?;
        let rows = stmt
            .query_map([student_id], |r| {
                Ok(PublishedGrade {
                    course_id: r.get(0)?,
                    semester: r.get(1)?,
                    credit: r.get(2)?,
                    grade_point: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn course(&self, course_id: &str) -> Result<Option<Course>, StoreError> {
        let conn = self.lock()?;
        let row: Option<(String, String, String, f64, String)> = conn
            .query_row(
                "SELECT id, code, title, credit, course_type FROM courses WHERE id = ?",
                [course_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        let Some((id, code, title, credit, course_type)) = row else {
            return Ok(None);
        };
        let course_type = CourseType::parse(&course_type)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown course type {course_type}")))?;
        Ok(Some(Course {
            id,
            code,
            title,
            credit,
            course_type,
        }))
    }

    fn active_enrollments(&self, key: &WorkflowKey) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT student_id
             FROM enrollments
             WHERE batch_id = ? AND course_id = ? AND semester = ? AND status = 'active'
             ORDER BY student_id",
        )?;
        let ids = stmt
            .query_map((&key.batch_id, &key.course_id, &key.semester), |r| {
                r.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

impl OtpStore for SqliteStore {
    fn insert_challenge(&self, challenge: &OtpChallenge) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE otp_challenges SET used = 1
             WHERE actor_id = ? AND workflow_id = ? AND purpose = ? AND used = 0",
            (
                &challenge.actor_id,
                &challenge.workflow_id,
                challenge.purpose.as_str(),
            ),
        )?;
        tx.execute(
            "INSERT INTO otp_challenges(id, actor_id, workflow_id, purpose, code_digest, created_at, expires_at, used)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &challenge.id,
                &challenge.actor_id,
                &challenge.workflow_id,
                challenge.purpose.as_str(),
                &challenge.code_digest,
                challenge.created_at.to_rfc3339(),
                challenge.expires_at.to_rfc3339(),
                challenge.used,
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    fn take_challenge(
        &self,
        actor_id: &str,
        workflow_id: &str,
        purpose: OtpPurpose,
    ) -> Result<Option<OtpChallenge>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let row: Option<(String, String, String, String)> = tx
            .query_row(
                "SELECT id, code_digest, created_at, expires_at
                 FROM otp_challenges
                 WHERE actor_id = ? AND workflow_id = ? AND purpose = ? AND used = 0
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1",
                (actor_id, workflow_id, purpose.as_str()),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((id, code_digest, created_at, expires_at)) = row else {
            return Ok(None);
        };
        let n = tx.execute(
            "UPDATE otp_challenges SET used = 1 WHERE id = ? AND used = 0",
            [&id],
        )?;
        tx.commit()?;
        Ok(Some(OtpChallenge {
            id,
            actor_id: actor_id.to_string(),
            workflow_id: workflow_id.to_string(),
            purpose,
            code_digest,
            created_at: parse_ts(&created_at)?,
            expires_at: parse_ts(&expires_at)?,
            // Another caller got to it between the read and the update.
            used: n == 0,
        }))
    }
}

impl IdentityProvider for SqliteStore {
    fn capabilities_of(&self, actor_id: &str) -> Result<Capabilities, IdentityError> {
        let roles = (|| -> Result<Vec<(String, String)>, StoreError> {
            let conn = self.lock()?;
            let mut stmt =
                conn.prepare("SELECT course_id, role FROM course_roles WHERE actor_id = ?")?;
            let rows = stmt
                .query_map([actor_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })()
        .map_err(|e| IdentityError(e.to_string()))?;

        let mut caps = Capabilities {
            instructor_of: HashSet::new(),
            committee_of: HashSet::new(),
        };
        for (course_id, role) in roles {
            match Role::parse(&role) {
                Some(Role::Instructor) => {
                    caps.instructor_of.insert(course_id);
                }
                Some(Role::Committee) => {
                    caps.committee_of.insert(course_id);
                }
                None => {}
            }
        }
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WorkflowKey {
        WorkflowKey {
            batch_id: "B21".to_string(),
            course_id: "CSE101".to_string(),
            semester: "2024-spring".to_string(),
        }
    }

    fn store_with_course() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("store");
        store
            .upsert_course(&Course {
                id: "CSE101".to_string(),
                code: "CSE 101".to_string(),
                title: "Structured Programming".to_string(),
                credit: 3.0,
                course_type: CourseType::Theory,
            })
            .expect("course");
        store
    }

    fn workflow(id: &str) -> ResultWorkflow {
        let now = Utc::now();
        ResultWorkflow {
            id: id.to_string(),
            batch_id: "B21".to_string(),
            course_id: "CSE101".to_string(),
            semester: "2024-spring".to_string(),
            status: WorkflowStatus::WithInstructor,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn second_active_workflow_for_key_is_rejected() {
        let store = store_with_course();
        store.create_workflow(&workflow("w1"), &[]).expect("first");
        let err = store
            .create_workflow(&workflow("w2"), &[])
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicateActive));
    }

    #[test]
    fn published_workflow_frees_the_key() {
        let store = store_with_course();
        let mut w = workflow("w1");
        store.create_workflow(&w, &[]).expect("create");
        w.status = WorkflowStatus::Published;
        w.version = 1;
        store
            .save_workflow(&w, 0, Changes::default())
            .expect("publish");
        store
            .create_workflow(&workflow("w2"), &[])
            .expect("new cycle after publish");
    }

    #[test]
    fn stale_version_writes_nothing() {
        let store = store_with_course();
        let mut w = workflow("w1");
        store.create_workflow(&w, &[]).expect("create");
        w.status = WorkflowStatus::SubmittedToCommittee;
        w.version = 1;
        let entry = AuditEntry {
            workflow_id: "w1".to_string(),
            from_state: WorkflowStatus::WithInstructor,
            to_state: WorkflowStatus::SubmittedToCommittee,
            actor_id: "t1".to_string(),
            timestamp: Utc::now(),
            comment: None,
        };
        let changes = Changes {
            audit: Some(&entry),
            grades: &[],
            snapshot: true,
        };
        store.save_workflow(&w, 0, changes).expect("first commit");

        let err = store.save_workflow(&w, 0, changes).expect_err("stale");
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, .. }));
        assert_eq!(store.audit_history("w1").expect("history").len(), 1);
        assert_eq!(store.snapshots("w1").expect("snapshots").len(), 1);
        assert_eq!(
            store.load_workflow("w1").expect("load").expect("row").version,
            1
        );
    }

    #[test]
    fn only_active_enrollments_for_the_same_semester_count() {
        let store = store_with_course();
        let k = key();
        store
            .set_enrollment(&k, "s1", EnrollmentStatus::Active)
            .expect("s1");
        store
            .set_enrollment(&k, "s2", EnrollmentStatus::Dropped)
            .expect("s2");
        let other_semester = WorkflowKey {
            semester: "2024-fall".to_string(),
            ..k.clone()
        };
        store
            .set_enrollment(&other_semester, "s3", EnrollmentStatus::Active)
            .expect("s3");
        assert_eq!(store.active_enrollments(&k).expect("active"), vec!["s1"]);
    }

    #[test]
    fn capabilities_reflect_granted_roles() {
        let store = store_with_course();
        store
            .grant_role("t1", "CSE101", Role::Instructor)
            .expect("grant");
        store
            .grant_role("cm1", "CSE101", Role::Committee)
            .expect("grant");
        let t = store.capabilities_of("t1").expect("caps");
        assert!(t.is_instructor_of("CSE101"));
        assert!(!t.is_committee_member_of("CSE101"));
        assert!(store.revoke_role("cm1", "CSE101", Role::Committee).expect("revoke"));
        assert!(!store
            .capabilities_of("cm1")
            .expect("caps")
            .is_committee_member_of("CSE101"));
    }
}
