use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{FailureClass, ForgeError, Result};
use crate::state_machine::{EntryStatus, JobStatus, RemediationStatus, StageStatus};

pub(super) const SCHEMA_VERSION: i64 = 1;

// `status IN ('a', 'b', ...)` built from the closed enumeration.
fn check_in<'a>(column: &str, values: impl IntoIterator<Item = &'a str>) -> String {
    let list: Vec<String> = values.into_iter().map(|v| format!("'{v}'")).collect();
    format!("CHECK ({column} IN ({}))", list.join(", "))
}

fn migration_v1() -> String {
    let job_status = check_in("status", JobStatus::ALL.iter().map(|s| s.as_str()));
    let failure_class = check_in(
        "failure_class",
        FailureClass::ALL.iter().map(|c| c.as_str()),
    );
    let stage_status = check_in("status", StageStatus::ALL.iter().map(|s| s.as_str()));
    let entry_status = check_in("status", EntryStatus::ALL.iter().map(|s| s.as_str()));
    let remediation_status = check_in(
        "status",
        RemediationStatus::ALL.iter().map(|s| s.as_str()),
    );

    format!(
        "
        CREATE TABLE jobs (
            id                    TEXT PRIMARY KEY,
            job_type              TEXT NOT NULL,
            status                TEXT NOT NULL {job_status},
            parent_id             TEXT REFERENCES jobs(id),
            depth                 INTEGER NOT NULL CHECK (depth >= 0),
            execution_order       INTEGER NOT NULL,
            target                TEXT NOT NULL,
            description           TEXT NOT NULL,
            plan                  TEXT,
            auto_execute_children INTEGER NOT NULL,
            checkpoint            TEXT,
            paused                INTEGER NOT NULL DEFAULT 0,
            pause_reason          TEXT,
            last_error            TEXT,
            failure_class         TEXT {failure_class},
            remediation_of        TEXT REFERENCES jobs(id),
            created_at            TEXT NOT NULL,
            updated_at            TEXT NOT NULL
        );
        CREATE UNIQUE INDEX jobs_sibling_order
            ON jobs(parent_id, execution_order) WHERE parent_id IS NOT NULL;
        CREATE INDEX jobs_status ON jobs(status, updated_at);

        CREATE TABLE stage_executions (
            id          TEXT PRIMARY KEY,
            job_id      TEXT NOT NULL REFERENCES jobs(id),
            stage       TEXT NOT NULL,
            position    INTEGER NOT NULL,
            status      TEXT NOT NULL {stage_status},
            retry_count INTEGER NOT NULL DEFAULT 0,
            error       TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE UNIQUE INDEX stage_executions_one_running
            ON stage_executions(job_id) WHERE status = 'running';
        CREATE INDEX stage_executions_job ON stage_executions(job_id, position);

        CREATE TABLE sub_job_queue (
            id              TEXT PRIMARY KEY,
            parent_id       TEXT NOT NULL REFERENCES jobs(id),
            child_id        TEXT NOT NULL UNIQUE REFERENCES jobs(id),
            execution_order INTEGER NOT NULL,
            status          TEXT NOT NULL {entry_status},
            depends_on      TEXT NOT NULL DEFAULT '[]',
            error           TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE UNIQUE INDEX sub_job_queue_one_in_progress
            ON sub_job_queue(parent_id) WHERE status = 'in_progress';
        CREATE INDEX sub_job_queue_parent ON sub_job_queue(parent_id, execution_order);

        CREATE TABLE remediation_attempts (
            id         TEXT PRIMARY KEY,
            job_id     TEXT NOT NULL REFERENCES jobs(id),
            status     TEXT NOT NULL {remediation_status},
            root_cause TEXT,
            artifact   TEXT,
            new_job_id TEXT REFERENCES jobs(id),
            error      TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX remediation_attempts_job ON remediation_attempts(job_id, created_at);
        "
    )
}

pub(super) fn bootstrap(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        ",
    )?;

    let current: i64 = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    if current > SCHEMA_VERSION {
        return Err(ForgeError::Config(format!(
            "database schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    if current < 1 {
        let tx = conn.transaction()?;
        tx.execute_batch(&migration_v1())?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![1, "baseline_job_tables", Utc::now()],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        bootstrap(&mut conn).unwrap();
        bootstrap(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn free_text_status_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        bootstrap(&mut conn).unwrap();
        let err = conn
            .execute(
                "INSERT INTO jobs (id, job_type, status, depth, execution_order, target,
                    description, auto_execute_children, created_at, updated_at)
                 VALUES ('j', 'feature', 'almost_done', 0, 0, '', '', 1, 'now', 'now')",
                [],
            )
            .unwrap_err();
        assert!(matches!(
            ForgeError::from(err),
            ForgeError::ConstraintViolation(_)
        ));
    }
}
