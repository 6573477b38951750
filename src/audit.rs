use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;

use crate::store::{parse_ts, Store, StoreError};
use crate::workflow::WorkflowStatus;

/// One committed transition. Never edited after insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub workflow_id: String,
    pub from_state: WorkflowStatus,
    pub to_state: WorkflowStatus,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    pub comment: Option<String>,
}

/// Read side of the transition log. Entries are only written by the store's
/// transition commit.
pub struct AuditTrail {
    store: Arc<dyn Store>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn history(&self, workflow_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        self.store.audit_history(workflow_id)
    }
}

pub(crate) fn append(conn: &Connection, entry: &AuditEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO audit_entries(workflow_id, from_state, to_state, actor_id, at, comment)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &entry.workflow_id,
            entry.from_state.as_str(),
            entry.to_state.as_str(),
            &entry.actor_id,
            entry.timestamp.to_rfc3339(),
            &entry.comment,
        ),
    )?;
    Ok(())
}

pub(crate) fn history(conn: &Connection, workflow_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT workflow_id, from_state, to_state, actor_id, at, comment
         FROM audit_entries
         WHERE workflow_id = ?
         ORDER BY seq",
    )?;
    let rows = stmt
        .query_map([workflow_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(workflow_id, from, to, actor_id, at, comment)| {
            Ok(AuditEntry {
                workflow_id,
                from_state: WorkflowStatus::parse_stored(&from)?,
                to_state: WorkflowStatus::parse_stored(&to)?,
                actor_id,
                timestamp: parse_ts(&at)?,
                comment,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn history_is_in_append_order() {
        let conn = db::open_in_memory().expect("open");
        conn.execute(
            "INSERT INTO courses(id, code, title, credit, course_type) VALUES('c1','CSE101','Intro',3.0,'theory')",
            [],
        )
        .expect("course");
        conn.execute(
            "INSERT INTO workflows(id, batch_id, course_id, semester, status, version, created_at, updated_at)
             VALUES('w1','b1','c1','S1','WITH_INSTRUCTOR',0,'t','t')",
            [],
        )
        .expect("workflow");

        let t = Utc::now();
        let steps = [
            (WorkflowStatus::WithInstructor, WorkflowStatus::SubmittedToCommittee, None),
            (
                WorkflowStatus::SubmittedToCommittee,
                WorkflowStatus::ReturnedToTeacher,
                Some("fix CT marks".to_string()),
            ),
            (WorkflowStatus::ReturnedToTeacher, WorkflowStatus::SubmittedToCommittee, None),
        ];
        for (from, to, comment) in steps.iter().cloned() {
            append(
                &conn,
                &AuditEntry {
                    workflow_id: "w1".to_string(),
                    from_state: from,
                    to_state: to,
                    actor_id: "a".to_string(),
                    // Identical timestamps: ordering must come from the sequence.
                    timestamp: t,
                    comment,
                },
            )
            .expect("append");
        }

        let got = history(&conn, "w1").expect("history");
        assert_eq!(got.len(), 3);
        assert_eq!(got[1].to_state, WorkflowStatus::ReturnedToTeacher);
        assert_eq!(got[1].comment.as_deref(), Some("fix CT marks"));
        assert_eq!(got[2].from_state, WorkflowStatus::ReturnedToTeacher);
        assert!(history(&conn, "other").expect("history").is_empty());
    }
}
