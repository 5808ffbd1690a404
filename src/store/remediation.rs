use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use super::{JobStore, get_job, insert_job, parse_column};
use crate::error::{ForgeError, Result};
use crate::state_machine::{NewJob, RemediationAttempt, RemediationStatus};

const ATTEMPT_COLUMNS: &str =
    "id, job_id, status, root_cause, artifact, new_job_id, error, created_at, updated_at";

/// Outcome of trying to open a remediation attempt for a job.
#[derive(Debug, Clone, PartialEq)]
pub enum RemediationGate {
    Started(RemediationAttempt),
    AttemptsExhausted { attempts: u32 },
    CoolingDown { until: DateTime<Utc> },
}

impl JobStore {
    /// Check the per-job attempt cap and cooldown and, if both allow it,
    /// insert an `investigating` attempt. Check and insert share one write
    /// transaction so two concurrent triggers cannot both pass the gate.
    pub fn begin_remediation(
        &self,
        job_id: &str,
        max_attempts: u32,
        cooldown: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<RemediationGate> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        get_job(&tx, job_id)?;

        let (attempts, last): (i64, Option<DateTime<Utc>>) = tx.query_row(
            "SELECT COUNT(*), MAX(created_at) FROM remediation_attempts WHERE job_id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let attempts = attempts as u32;
        if attempts >= max_attempts {
            return Ok(RemediationGate::AttemptsExhausted { attempts });
        }
        if let Some(last) = last
            && now - last < cooldown
        {
            return Ok(RemediationGate::CoolingDown {
                until: last + cooldown,
            });
        }

        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO remediation_attempts (id, job_id, status, created_at, updated_at)
             VALUES (?1, ?2, 'investigating', ?3, ?3)",
            params![id, job_id, now],
        )?;
        let attempt = get_attempt(&tx, &id)?;
        tx.commit()?;
        Ok(RemediationGate::Started(attempt))
    }

    /// Advance an attempt to `next`, validating the edge against the row.
    pub fn transition_remediation(
        &self,
        id: &str,
        next: RemediationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let current = get_attempt(&conn, id)?.status;
        if !current.can_transition_to(next) {
            return Err(ForgeError::InvalidTransition {
                id: id.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        let changed = conn.execute(
            "UPDATE remediation_attempts SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![next.as_str(), at, id, current.as_str()],
        )?;
        Ok(changed == 1)
    }

    pub fn set_root_cause(&self, id: &str, root_cause: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_attempt(
            id,
            "UPDATE remediation_attempts SET root_cause = ?1, updated_at = ?2 WHERE id = ?3",
            params![root_cause, at, id],
        )
    }

    pub fn set_remediation_artifact(&self, id: &str, artifact: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_attempt(
            id,
            "UPDATE remediation_attempts SET artifact = ?1, updated_at = ?2 WHERE id = ?3",
            params![artifact, at, id],
        )
    }

    /// Mark an attempt failed with `error`, whatever non-terminal step it was in.
    pub fn fail_remediation(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE remediation_attempts SET status = 'failed', error = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('investigating', 'fixing', 'testing')",
            params![error, at, id],
        )?;
        if changed == 0 {
            get_attempt(&conn, id)?;
        }
        Ok(changed == 1)
    }

    /// Create the replacement job and resolve the attempt as `success` in one
    /// transaction.
    pub fn complete_remediation(
        &self,
        id: &str,
        replacement: &NewJob,
        at: DateTime<Utc>,
    ) -> Result<RemediationAttempt> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        insert_job(&tx, replacement, at)?;
        let changed = tx.execute(
            "UPDATE remediation_attempts SET status = 'success', new_job_id = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'testing'",
            params![replacement.id, at, id],
        )?;
        if changed == 0 {
            let current = get_attempt(&tx, id)?.status;
            return Err(ForgeError::InvalidTransition {
                id: id.to_string(),
                from: current.to_string(),
                to: RemediationStatus::Success.to_string(),
            });
        }
        let attempt = get_attempt(&tx, id)?;
        tx.commit()?;
        Ok(attempt)
    }

    pub fn get_remediation(&self, id: &str) -> Result<RemediationAttempt> {
        get_attempt(&*self.conn()?, id)
    }

    /// Attempts for `job_id`, oldest first.
    pub fn remediation_attempts(&self, job_id: &str) -> Result<Vec<RemediationAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM remediation_attempts WHERE job_id = ?1
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![job_id], attempt_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_attempt(&self, id: &str, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn()?;
        if conn.execute(sql, params)? == 0 {
            return Err(ForgeError::not_found("remediation attempt", id));
        }
        Ok(())
    }
}

fn get_attempt(conn: &Connection, id: &str) -> Result<RemediationAttempt> {
    conn.query_row(
        &format!("SELECT {ATTEMPT_COLUMNS} FROM remediation_attempts WHERE id = ?1"),
        params![id],
        attempt_from_row,
    )
    .optional()?
    .ok_or_else(|| ForgeError::not_found("remediation attempt", id))
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<RemediationAttempt> {
    Ok(RemediationAttempt {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        status: parse_column(row, "status", RemediationStatus::parse)?,
        root_cause: row.get("root_cause")?,
        artifact: row.get("artifact")?,
        new_job_id: row.get("new_job_id")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
