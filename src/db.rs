use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::store::StoreError;

pub const DB_FILE_NAME: &str = "results.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    create_schema(&conn)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            credit REAL NOT NULL,
            course_type TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_roles(
            actor_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY(actor_id, course_id, role),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            batch_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            semester TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(batch_id, course_id, semester, student_id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workflows(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            semester TEXT NOT NULL,
            status TEXT NOT NULL,
            version INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    // At most one non-terminal workflow per result key.
    ensure_workflows_published_credit(conn)?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_workflows_active_key
         ON workflows(batch_id, course_id, semester)
         WHERE status <> 'PUBLISHED'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workflows_course ON workflows(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            workflow_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            marks_json TEXT NOT NULL,
            total_marks REAL NOT NULL,
            letter_grade TEXT NOT NULL,
            grade_point REAL NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(workflow_id, student_id),
            FOREIGN KEY(workflow_id) REFERENCES workflows(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_student ON grade_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_snapshots(
            workflow_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            taken_at TEXT NOT NULL,
            records_json TEXT NOT NULL,
            PRIMARY KEY(workflow_id, version),
            FOREIGN KEY(workflow_id) REFERENCES workflows(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_entries(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            workflow_id TEXT NOT NULL,
            from_state TEXT NOT NULL,
            to_state TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            at TEXT NOT NULL,
            comment TEXT,
            FOREIGN KEY(workflow_id) REFERENCES workflows(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_entries_workflow ON audit_entries(workflow_id, seq)",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_entries_no_update
         BEFORE UPDATE ON audit_entries
         BEGIN SELECT RAISE(ABORT, 'audit entries are append-only'); END",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_entries_no_delete
         BEFORE DELETE ON audit_entries
         BEGIN SELECT RAISE(ABORT, 'audit entries are append-only'); END",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS otp_challenges(
            id TEXT PRIMARY KEY,
            actor_id TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            purpose TEXT NOT NULL,
            code_digest TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_otp_challenges_binding
         ON otp_challenges(actor_id, workflow_id, purpose, used)",
        [],
    )?;

    Ok(())
}

/// Course credit frozen when the workflow is published.
fn ensure_workflows_published_credit(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "workflows", "published_credit")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE workflows ADD COLUMN published_credit REAL", [])?;
    // Results published before the column existed keep the current credit.
    conn.execute(
        "UPDATE workflows
         SET published_credit = (SELECT credit FROM courses WHERE courses.id = workflows.course_id)
         WHERE status = 'PUBLISHED'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> Result<Option<serde_json::Value>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creation_is_idempotent() {
        let conn = open_in_memory().expect("open");
        create_schema(&conn).expect("second pass");
    }

    #[test]
    fn older_workspace_gains_published_credit() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute(
            "CREATE TABLE courses(id TEXT PRIMARY KEY, code TEXT NOT NULL, title TEXT NOT NULL,
                                  credit REAL NOT NULL, course_type TEXT NOT NULL)",
            [],
        )
        .expect("courses");
        conn.execute(
            "CREATE TABLE workflows(id TEXT PRIMARY KEY, batch_id TEXT NOT NULL, course_id TEXT NOT NULL,
                                    semester TEXT NOT NULL, status TEXT NOT NULL, version INTEGER NOT NULL,
                                    created_at TEXT NOT NULL, updated_at TEXT NOT NULL)",
            [],
        )
        .expect("workflows");
        conn.execute(
            "INSERT INTO courses(id, code, title, credit, course_type) VALUES('c1','CSE101','Intro',3.0,'theory')",
            [],
        )
        .expect("course");
        conn.execute(
            "INSERT INTO workflows(id, batch_id, course_id, semester, status, version, created_at, updated_at)
             VALUES('w1','b1','c1','S1','PUBLISHED',4,'t','t'), ('w2','b1','c1','S2','WITH_INSTRUCTOR',0,'t','t')",
            [],
        )
        .expect("workflows");

        create_schema(&conn).expect("migrate");
        assert!(table_has_column(&conn, "workflows", "published_credit").expect("columns"));
        let credits: Vec<Option<f64>> = conn
            .prepare("SELECT published_credit FROM workflows ORDER BY id")
            .expect("prepare")
            .query_map([], |r| r.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        assert_eq!(credits, vec![Some(3.0), None]);
    }

    #[test]
    fn settings_roundtrip_and_overwrite() {
        let conn = open_in_memory().expect("open");
        assert!(settings_get_json(&conn, "k").expect("get").is_none());
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 1 })).expect("set");
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 2 })).expect("overwrite");
        let v = settings_get_json(&conn, "k").expect("get").expect("present");
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn audit_rows_cannot_be_rewritten() {
        let conn = open_in_memory().expect("open");
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
        conn.execute(
            "INSERT INTO audit_entries(workflow_id, from_state, to_state, actor_id, at)
             VALUES('w1','WITH_INSTRUCTOR','SUBMITTED_TO_COMMITTEE','t1','t')",
            [],
        )
        .expect("audit");
        assert!(conn
            .execute("UPDATE audit_entries SET actor_id = 'x'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM audit_entries", []).is_err());
    }
}
