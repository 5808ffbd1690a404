//! SQLite-backed persistence for jobs, stage executions, sub-job queue
//! entries and remediation attempts.
//!
//! Every status column is a closed enumeration. Status changes go through
//! compare-and-set updates (`... WHERE id = ? AND status = ?`) so concurrent
//! callers never overwrite a transition they did not observe.

mod queue;
mod remediation;
mod schema;
mod stages;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::error::{FailureClass, ForgeError, Result};
use crate::state_machine::{DecompositionPlan, Job, JobStatus, JobType, NewJob};

pub use remediation::RemediationGate;

// Attempts before transition_job gives up on a row that keeps moving.
const CAS_RETRIES: usize = 8;

const JOB_COLUMNS: &str = "id, job_type, status, parent_id, depth, execution_order, target, \
     description, plan, auto_execute_children, checkpoint, paused, pause_reason, last_error, \
     failure_class, remediation_of, created_at, updated_at";

#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        schema::bootstrap(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| ForgeError::LockPoisoned)
    }

    /// Insert a job. A child gets `depth = parent.depth + 1`.
    pub fn create_job(&self, new: &NewJob, at: DateTime<Utc>) -> Result<Job> {
        let conn = self.conn()?;
        insert_job(&conn, new, at)?;
        get_job(&conn, &new.id)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        get_job(&*self.conn()?, id)
    }

    pub fn find_job(&self, id: &str) -> Result<Option<Job>> {
        find_job(&*self.conn()?, id)
    }

    /// Children of `parent_id` ordered by `execution_order`.
    pub fn children_of(&self, parent_id: &str) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        get_job(&conn, parent_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id = ?1 ORDER BY execution_order ASC"
        ))?;
        let rows = stmt.query_map(params![parent_id], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recently created root jobs first.
    pub fn list_root_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id IS NULL
             ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Atomic compare-and-set of a job's status. Returns `false` when the row
    /// was not in `expected`.
    pub fn compare_and_set_job_status(
        &self,
        id: &str,
        expected: JobStatus,
        next: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![next.as_str(), at, id, expected.as_str()],
        )?;
        if changed == 0 {
            // Distinguish "moved underneath us" from "no such job".
            get_job(&conn, id)?;
        }
        Ok(changed == 1)
    }

    /// Move a job to `next` if the state machine allows it from whatever status
    /// the row holds now. Returns the status that was replaced, or `None` when
    /// the current status does not permit the transition.
    pub fn transition_job(
        &self,
        id: &str,
        next: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<JobStatus>> {
        self.transition_job_with(id, next, at, |_, _| Ok(()))
    }

    /// Move a job to `failed`, recording the error of record and its class.
    pub fn fail_job(
        &self,
        id: &str,
        error: &str,
        class: Option<FailureClass>,
        at: DateTime<Utc>,
    ) -> Result<Option<JobStatus>> {
        self.transition_job_with(id, JobStatus::Failed, at, |conn, id| {
            conn.execute(
                "UPDATE jobs SET last_error = ?1, failure_class = ?2 WHERE id = ?3",
                params![error, class.map(|c| c.as_str()), id],
            )?;
            Ok(())
        })
    }

    fn transition_job_with(
        &self,
        id: &str,
        next: JobStatus,
        at: DateTime<Utc>,
        also: impl Fn(&Connection, &str) -> Result<()>,
    ) -> Result<Option<JobStatus>> {
        let mut conn = self.conn()?;
        for _ in 0..CAS_RETRIES {
            let current = get_job(&conn, id)?.status;
            if !current.can_transition_to(next) {
                debug!(job_id = id, from = %current, to = %next, "transition not permitted");
                return Ok(None);
            }
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![next.as_str(), at, id, current.as_str()],
            )?;
            if changed == 1 {
                also(&tx, id)?;
                tx.commit()?;
                return Ok(Some(current));
            }
        }
        Ok(None)
    }

    pub fn set_pause(
        &self,
        id: &str,
        paused: bool,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_job_field(
            id,
            "UPDATE jobs SET paused = ?1, pause_reason = ?2, updated_at = ?3 WHERE id = ?4",
            params![paused, reason, at, id],
        )
    }

    pub fn set_checkpoint(&self, id: &str, marker: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_job_field(
            id,
            "UPDATE jobs SET checkpoint = ?1, updated_at = ?2 WHERE id = ?3",
            params![marker, at, id],
        )
    }

    pub fn set_plan(&self, id: &str, plan: &DecompositionPlan, at: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(plan)?;
        self.update_job_field(
            id,
            "UPDATE jobs SET plan = ?1, updated_at = ?2 WHERE id = ?3",
            params![json, at, id],
        )
    }

    pub fn set_last_error(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_job_field(
            id,
            "UPDATE jobs SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![error, at, id],
        )
    }

    /// Bumps `updated_at` so a long stage does not look stale.
    pub fn touch_job(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_job_field(
            id,
            "UPDATE jobs SET updated_at = ?1 WHERE id = ?2",
            params![at, id],
        )
    }

    fn update_job_field(&self, id: &str, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn()?;
        if conn.execute(sql, params)? == 0 {
            return Err(ForgeError::not_found("job", id));
        }
        Ok(())
    }

    /// Running jobs whose last update is older than `threshold`.
    pub fn stale_jobs(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let cutoff = now - threshold;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running' AND updated_at < ?1
             ORDER BY updated_at ASC"
        ))?;
        let rows = stmt.query_map(params![cutoff], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

pub(crate) fn insert_job(conn: &Connection, new: &NewJob, at: DateTime<Utc>) -> Result<()> {
    let depth = match &new.parent_id {
        Some(parent_id) => get_job(conn, parent_id)?.depth + 1,
        None => 0,
    };
    conn.execute(
        "INSERT INTO jobs (id, job_type, status, parent_id, depth, execution_order, target,
            description, auto_execute_children, remediation_of, created_at, updated_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            new.id,
            new.job_type.as_str(),
            new.parent_id,
            depth,
            new.execution_order,
            new.target,
            new.description,
            new.auto_execute_children,
            new.remediation_of,
            at,
        ],
    )?;
    Ok(())
}

pub(crate) fn get_job(conn: &Connection, id: &str) -> Result<Job> {
    find_job(conn, id)?.ok_or_else(|| ForgeError::not_found("job", id))
}

fn find_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    Ok(conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            job_from_row,
        )
        .optional()?)
}

/// Parse a closed-enumeration column, failing the row on unknown text.
pub(crate) fn parse_column<T>(
    row: &Row<'_>,
    column: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            format!("unknown {column} '{text}'").into(),
        )
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let plan: Option<String> = row.get("plan")?;
    let plan = plan
        .map(|text| serde_json::from_str::<DecompositionPlan>(&text))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let failure_class: Option<String> = row.get("failure_class")?;
    let failure_class = match failure_class {
        Some(text) => Some(FailureClass::parse(&text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                Type::Text,
                format!("unknown failure_class '{text}'").into(),
            )
        })?),
        None => None,
    };
    let job_type: String = row.get("job_type")?;

    Ok(Job {
        id: row.get("id")?,
        job_type: JobType::from(job_type),
        status: parse_column(row, "status", JobStatus::parse)?,
        parent_id: row.get("parent_id")?,
        depth: row.get("depth")?,
        execution_order: row.get("execution_order")?,
        target: row.get("target")?,
        description: row.get("description")?,
        plan,
        auto_execute_children: row.get("auto_execute_children")?,
        checkpoint: row.get("checkpoint")?,
        paused: row.get("paused")?,
        pause_reason: row.get("pause_reason")?,
        last_error: row.get("last_error")?,
        failure_class,
        remediation_of: row.get("remediation_of")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::in_memory().unwrap()
    }

    #[test]
    fn create_and_get_root_job() {
        let store = store();
        let new = NewJob::new("feature", "Add login page").target("web");
        let job = store.create_job(&new, Utc::now()).unwrap();
        assert_eq!(job.id, new.id);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.depth, 0);
        assert_eq!(job.target, "web");
        assert!(job.auto_execute_children);
        assert_eq!(store.get_job(&job.id).unwrap(), job);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get_job("nope"),
            Err(ForgeError::NotFound { entity: "job", .. })
        ));
        assert!(matches!(
            store.compare_and_set_job_status("nope", JobStatus::Pending, JobStatus::Running, Utc::now()),
            Err(ForgeError::NotFound { .. })
        ));
    }

    #[test]
    fn child_depth_follows_parent() {
        let store = store();
        let parent = store.create_job(&NewJob::new("feature", "p"), Utc::now()).unwrap();
        let child = store
            .create_job(&NewJob::new("feature", "c").child_of(&parent.id, 0), Utc::now())
            .unwrap();
        assert_eq!(child.depth, 1);
        let grandchild = store
            .create_job(&NewJob::new("test", "g").child_of(&child.id, 0), Utc::now())
            .unwrap();
        assert_eq!(grandchild.depth, 2);
    }

    #[test]
    fn child_of_unknown_parent_is_not_found() {
        let store = store();
        let err = store
            .create_job(&NewJob::new("feature", "orphan").child_of("ghost", 0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::NotFound { .. }));
    }

    #[test]
    fn sibling_execution_order_is_unique() {
        let store = store();
        let parent = store.create_job(&NewJob::new("feature", "p"), Utc::now()).unwrap();
        store
            .create_job(&NewJob::new("feature", "a").child_of(&parent.id, 0), Utc::now())
            .unwrap();
        let err = store
            .create_job(&NewJob::new("feature", "b").child_of(&parent.id, 0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));
    }

    #[test]
    fn children_are_ordered_by_execution_order() {
        let store = store();
        let parent = store.create_job(&NewJob::new("feature", "p"), Utc::now()).unwrap();
        for order in [2, 0, 1] {
            store
                .create_job(
                    &NewJob::new("feature", format!("c{order}")).child_of(&parent.id, order),
                    Utc::now(),
                )
                .unwrap();
        }
        let orders: Vec<i64> = store
            .children_of(&parent.id)
            .unwrap()
            .iter()
            .map(|c| c.execution_order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn compare_and_set_rejects_stale_expectation() {
        let store = store();
        let job = store.create_job(&NewJob::new("feature", "x"), Utc::now()).unwrap();
        assert!(
            store
                .compare_and_set_job_status(&job.id, JobStatus::Pending, JobStatus::Running, Utc::now())
                .unwrap()
        );
        // A second writer still believing the job is pending loses.
        assert!(
            !store
                .compare_and_set_job_status(&job.id, JobStatus::Pending, JobStatus::Cancelled, Utc::now())
                .unwrap()
        );
        assert_eq!(store.get_job(&job.id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn transition_job_respects_state_machine() {
        let store = store();
        let job = store.create_job(&NewJob::new("feature", "x"), Utc::now()).unwrap();
        assert_eq!(
            store.transition_job(&job.id, JobStatus::Completed, Utc::now()).unwrap(),
            None
        );
        assert_eq!(
            store.transition_job(&job.id, JobStatus::Running, Utc::now()).unwrap(),
            Some(JobStatus::Pending)
        );
        assert_eq!(
            store.transition_job(&job.id, JobStatus::Completed, Utc::now()).unwrap(),
            Some(JobStatus::Running)
        );
        assert_eq!(
            store.transition_job(&job.id, JobStatus::Cancelled, Utc::now()).unwrap(),
            None
        );
    }

    #[test]
    fn fail_job_records_error_and_class() {
        let store = store();
        let job = store.create_job(&NewJob::new("feature", "x"), Utc::now()).unwrap();
        store.transition_job(&job.id, JobStatus::Running, Utc::now()).unwrap();
        store
            .fail_job(&job.id, "boom", Some(FailureClass::AgentExecution), Utc::now())
            .unwrap();
        let job = store.get_job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.failure_class, Some(FailureClass::AgentExecution));
    }

    #[test]
    fn plan_and_checkpoint_persist() {
        use crate::state_machine::SubTask;
        let store = store();
        let job = store.create_job(&NewJob::new("feature", "x"), Utc::now()).unwrap();
        let plan = DecompositionPlan::new(vec![SubTask::new("a"), SubTask::new("b").depends_on([0])]);
        store.set_plan(&job.id, &plan, Utc::now()).unwrap();
        store.set_checkpoint(&job.id, "abc1234", Utc::now()).unwrap();
        let job = store.get_job(&job.id).unwrap();
        assert_eq!(job.plan, Some(plan));
        assert_eq!(job.checkpoint.as_deref(), Some("abc1234"));
    }

    #[test]
    fn stale_running_jobs_are_detectable() {
        let store = store();
        let start = Utc::now() - chrono::Duration::hours(2);
        let old = store.create_job(&NewJob::new("feature", "old"), start).unwrap();
        store.transition_job(&old.id, JobStatus::Running, start).unwrap();
        let fresh = store.create_job(&NewJob::new("feature", "fresh"), Utc::now()).unwrap();
        store.transition_job(&fresh.id, JobStatus::Running, Utc::now()).unwrap();

        let stale = store
            .stale_jobs(chrono::Duration::minutes(30), Utc::now())
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }

    #[test]
    fn reopening_a_file_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let id = {
            let store = JobStore::open(&path).unwrap();
            store.create_job(&NewJob::new("bug_fix", "x"), Utc::now()).unwrap().id
        };
        let store = JobStore::open(&path).unwrap();
        assert_eq!(store.get_job(&id).unwrap().job_type, JobType::BugFix);
    }
}
