use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use super::{JobStore, get_job, parse_column};
use crate::error::{ForgeError, Result};
use crate::state_machine::{StageExecution, StageStatus};

const STAGE_COLUMNS: &str =
    "id, job_id, stage, position, status, retry_count, error, created_at, updated_at";

impl JobStore {
    /// Insert a `queued` stage execution for `job_id`.
    pub fn create_stage(
        &self,
        job_id: &str,
        stage: &str,
        position: u32,
        at: DateTime<Utc>,
    ) -> Result<StageExecution> {
        let conn = self.conn()?;
        get_job(&conn, job_id)?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO stage_executions (id, job_id, stage, position, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?5)",
            params![id, job_id, stage, position, at],
        )?;
        get_stage(&conn, &id)
    }

    pub fn get_stage(&self, id: &str) -> Result<StageExecution> {
        get_stage(&*self.conn()?, id)
    }

    /// Stage executions of a job in sequence order.
    pub fn stages_of(&self, job_id: &str) -> Result<Vec<StageExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STAGE_COLUMNS} FROM stage_executions WHERE job_id = ?1
             ORDER BY position ASC, created_at ASC"
        ))?;
        let rows = stmt.query_map(params![job_id], stage_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn running_stage_count(&self, job_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stage_executions WHERE job_id = ?1 AND status = 'running'",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Compare-and-set a stage's status, optionally recording an error.
    ///
    /// Moving a second stage of the same job to `running` violates the
    /// one-running-per-job index and fails with `ConstraintViolation`.
    pub fn transition_stage(
        &self,
        id: &str,
        expected: StageStatus,
        next: StageStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !expected.can_transition_to(next) {
            return Err(ForgeError::InvalidTransition {
                id: id.to_string(),
                from: expected.to_string(),
                to: next.to_string(),
            });
        }
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE stage_executions SET status = ?1, error = COALESCE(?2, error), updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![next.as_str(), error, at, id, expected.as_str()],
        )?;
        if changed == 0 {
            get_stage(&conn, id)?;
        }
        Ok(changed == 1)
    }

    /// Record a failed attempt that will be retried. The error is overwritten
    /// so the row always holds the latest attempt's diagnostic.
    pub fn record_stage_retry(
        &self,
        id: &str,
        retry_count: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE stage_executions SET retry_count = ?1, error = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'running'",
            params![retry_count, error, at, id],
        )?;
        if changed == 0 {
            return Err(ForgeError::not_found("running stage execution", id));
        }
        Ok(())
    }
}

fn get_stage(conn: &rusqlite::Connection, id: &str) -> Result<StageExecution> {
    conn.query_row(
        &format!("SELECT {STAGE_COLUMNS} FROM stage_executions WHERE id = ?1"),
        params![id],
        stage_from_row,
    )
    .optional()?
    .ok_or_else(|| ForgeError::not_found("stage execution", id))
}

fn stage_from_row(row: &Row<'_>) -> rusqlite::Result<StageExecution> {
    Ok(StageExecution {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        stage: row.get("stage")?,
        position: row.get("position")?,
        status: parse_column(row, "status", StageStatus::parse)?,
        retry_count: row.get("retry_count")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::NewJob;
    use proptest::prelude::*;

    fn store_with_job() -> (JobStore, String) {
        let store = JobStore::in_memory().unwrap();
        let job = store.create_job(&NewJob::new("feature", "x"), Utc::now()).unwrap();
        (store, job.id)
    }

    #[test]
    fn stage_lifecycle() {
        let (store, job_id) = store_with_job();
        let stage = store.create_stage(&job_id, "plan", 0, Utc::now()).unwrap();
        assert_eq!(stage.status, StageStatus::Queued);
        assert!(
            store
                .transition_stage(&stage.id, StageStatus::Queued, StageStatus::Running, None, Utc::now())
                .unwrap()
        );
        store.record_stage_retry(&stage.id, 1, "first", Utc::now()).unwrap();
        store.record_stage_retry(&stage.id, 2, "second", Utc::now()).unwrap();
        assert!(
            store
                .transition_stage(&stage.id, StageStatus::Running, StageStatus::Completed, None, Utc::now())
                .unwrap()
        );
        let stage = store.get_stage(&stage.id).unwrap();
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.retry_count, 2);
        assert_eq!(stage.error.as_deref(), Some("second"));
    }

    #[test]
    fn second_running_stage_is_a_constraint_violation() {
        let (store, job_id) = store_with_job();
        let a = store.create_stage(&job_id, "plan", 0, Utc::now()).unwrap();
        let b = store.create_stage(&job_id, "code", 1, Utc::now()).unwrap();
        store
            .transition_stage(&a.id, StageStatus::Queued, StageStatus::Running, None, Utc::now())
            .unwrap();
        let err = store
            .transition_stage(&b.id, StageStatus::Queued, StageStatus::Running, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));
        assert_eq!(store.running_stage_count(&job_id).unwrap(), 1);
    }

    #[test]
    fn illegal_stage_edge_rejected_before_touching_the_row() {
        let (store, job_id) = store_with_job();
        let s = store.create_stage(&job_id, "plan", 0, Utc::now()).unwrap();
        assert!(matches!(
            store.transition_stage(&s.id, StageStatus::Completed, StageStatus::Running, None, Utc::now()),
            Err(ForgeError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn stage_for_unknown_job_is_not_found() {
        let store = JobStore::in_memory().unwrap();
        assert!(matches!(
            store.create_stage("ghost", "plan", 0, Utc::now()),
            Err(ForgeError::NotFound { .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(usize),
        Complete(usize),
        Fail(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize).prop_map(Op::Start),
            (0..4usize).prop_map(Op::Complete),
            (0..4usize).prop_map(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_running_stage_per_job(ops in proptest::collection::vec(op(), 1..40)) {
            let (store, job_id) = store_with_job();
            let stages: Vec<_> = (0..4u32)
                .map(|i| store.create_stage(&job_id, &format!("s{i}"), i, Utc::now()).unwrap())
                .collect();

            for op in ops {
                // Concurrent writers either win the CAS, lose it, or trip the index.
                let _ = match op {
                    Op::Start(i) => store.transition_stage(
                        &stages[i].id, StageStatus::Queued, StageStatus::Running, None, Utc::now()),
                    Op::Complete(i) => store.transition_stage(
                        &stages[i].id, StageStatus::Running, StageStatus::Completed, None, Utc::now()),
                    Op::Fail(i) => store.transition_stage(
                        &stages[i].id, StageStatus::Running, StageStatus::Failed, Some("x"), Utc::now()),
                };
                prop_assert!(store.running_stage_count(&job_id).unwrap() <= 1);
            }
        }
    }

    #[test]
    fn concurrent_starts_leave_one_running() {
        let (store, job_id) = store_with_job();
        let stages: Vec<_> = (0..8u32)
            .map(|i| store.create_stage(&job_id, &format!("s{i}"), i, Utc::now()).unwrap())
            .collect();

        let handles: Vec<_> = stages
            .into_iter()
            .map(|stage| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .transition_stage(&stage.id, StageStatus::Queued, StageStatus::Running, None, Utc::now())
                        .unwrap_or(false)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(store.running_stage_count(&job_id).unwrap(), 1);
    }
}
