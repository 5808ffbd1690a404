use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::{JobStore, get_job, insert_job, parse_column};
use crate::error::{ForgeError, Result};
use crate::state_machine::{EntryStatus, NewJob, SubJobQueueEntry, has_cycle};

const ENTRY_COLUMNS: &str =
    "id, parent_id, child_id, execution_order, status, depends_on, error, created_at, updated_at";

impl JobStore {
    /// Create child jobs and their queue entries for `parent_id` in one
    /// transaction. `children[i].1` lists indices of siblings that child `i`
    /// depends on.
    pub fn insert_children(
        &self,
        parent_id: &str,
        children: &[(NewJob, Vec<usize>)],
        at: DateTime<Utc>,
    ) -> Result<Vec<SubJobQueueEntry>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        get_job(&tx, parent_id)?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sub_job_queue WHERE parent_id = ?1",
            params![parent_id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(ForgeError::ConstraintViolation(format!(
                "job {parent_id} already has a sub-job queue"
            )));
        }

        let entry_ids: Vec<String> = children.iter().map(|_| Uuid::new_v4().to_string()).collect();
        let mut edges: HashMap<String, Vec<String>> = HashMap::with_capacity(children.len());
        for (i, (child, deps)) in children.iter().enumerate() {
            if child.parent_id.as_deref() != Some(parent_id) {
                return Err(ForgeError::ConstraintViolation(format!(
                    "child {} does not belong to parent {parent_id}",
                    child.id
                )));
            }
            let mut dep_ids = Vec::with_capacity(deps.len());
            for &dep in deps {
                let dep_id = entry_ids.get(dep).ok_or_else(|| {
                    ForgeError::ConstraintViolation(format!(
                        "dependency {dep} of child {i} is outside the sibling set"
                    ))
                })?;
                dep_ids.push(dep_id.clone());
            }
            edges.insert(entry_ids[i].clone(), dep_ids);
        }
        if has_cycle(&edges) {
            return Err(ForgeError::ConstraintViolation(
                "cyclic depends_on among sub-jobs".into(),
            ));
        }

        for (i, (child, _)) in children.iter().enumerate() {
            insert_job(&tx, child, at)?;
            let deps: BTreeSet<&String> = edges[&entry_ids[i]].iter().collect();
            tx.execute(
                "INSERT INTO sub_job_queue (id, parent_id, child_id, execution_order, status,
                    depends_on, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                params![
                    entry_ids[i],
                    parent_id,
                    child.id,
                    child.execution_order,
                    serde_json::to_string(&deps)?,
                    at,
                ],
            )?;
        }
        tx.commit()?;
        entries_of(&conn, parent_id)
    }

    /// Add one queue slot for an existing child. Dependencies must already be
    /// entries of the same parent.
    pub fn add_queue_entry(
        &self,
        parent_id: &str,
        child_id: &str,
        depends_on: &BTreeSet<String>,
        at: DateTime<Utc>,
    ) -> Result<SubJobQueueEntry> {
        let conn = self.conn()?;
        let child = get_job(&conn, child_id)?;
        if child.parent_id.as_deref() != Some(parent_id) {
            return Err(ForgeError::ConstraintViolation(format!(
                "job {child_id} is not a child of {parent_id}"
            )));
        }
        let siblings: BTreeSet<String> = entries_of(&conn, parent_id)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        if let Some(foreign) = depends_on.iter().find(|d| !siblings.contains(*d)) {
            return Err(ForgeError::ConstraintViolation(format!(
                "dependency {foreign} is outside the sibling set of {parent_id}"
            )));
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sub_job_queue (id, parent_id, child_id, execution_order, status,
                depends_on, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
            params![
                id,
                parent_id,
                child_id,
                child.execution_order,
                serde_json::to_string(depends_on)?,
                at,
            ],
        )?;
        get_entry(&conn, &id)
    }

    /// Add the edge `entry_id -> depends_on_id`, rejecting cycles and edges
    /// that leave the sibling set.
    pub fn add_dependency(&self, entry_id: &str, depends_on_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let entry = get_entry(&conn, entry_id)?;
        let siblings = entries_of(&conn, &entry.parent_id)?;
        if !siblings.iter().any(|s| s.id == depends_on_id) {
            return Err(ForgeError::ConstraintViolation(format!(
                "dependency {depends_on_id} is outside the sibling set of {}",
                entry.parent_id
            )));
        }

        let mut edges: HashMap<String, Vec<String>> = siblings
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.iter().cloned().collect()))
            .collect();
        if let Some(deps) = edges.get_mut(entry_id) {
            deps.push(depends_on_id.to_string());
        }
        if has_cycle(&edges) {
            return Err(ForgeError::ConstraintViolation(format!(
                "edge {entry_id} -> {depends_on_id} would create a cycle"
            )));
        }

        let mut deps = entry.depends_on;
        deps.insert(depends_on_id.to_string());
        conn.execute(
            "UPDATE sub_job_queue SET depends_on = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&deps)?, at, entry_id],
        )?;
        Ok(())
    }

    /// Entries of `parent_id` ordered by `execution_order`.
    pub fn queue_entries(&self, parent_id: &str) -> Result<Vec<SubJobQueueEntry>> {
        entries_of(&*self.conn()?, parent_id)
    }

    pub fn has_queue(&self, parent_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sub_job_queue WHERE parent_id = ?1",
            params![parent_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn entry_for_child(&self, child_id: &str) -> Result<Option<SubJobQueueEntry>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM sub_job_queue WHERE child_id = ?1"),
                params![child_id],
                entry_from_row,
            )
            .optional()?)
    }

    /// Compare-and-set an entry's status. Moving a second entry of the same
    /// parent to `in_progress` fails with `ConstraintViolation`.
    pub fn transition_entry(
        &self,
        id: &str,
        expected: EntryStatus,
        next: EntryStatus,
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
            "UPDATE sub_job_queue SET status = ?1, error = COALESCE(?2, error), updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![next.as_str(), error, at, id, expected.as_str()],
        )?;
        if changed == 0 {
            get_entry(&conn, id)?;
        }
        Ok(changed == 1)
    }
}

fn entries_of(conn: &Connection, parent_id: &str) -> Result<Vec<SubJobQueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM sub_job_queue WHERE parent_id = ?1
         ORDER BY execution_order ASC"
    ))?;
    let rows = stmt.query_map(params![parent_id], entry_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn get_entry(conn: &Connection, id: &str) -> Result<SubJobQueueEntry> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM sub_job_queue WHERE id = ?1"),
        params![id],
        entry_from_row,
    )
    .optional()?
    .ok_or_else(|| ForgeError::not_found("queue entry", id))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<SubJobQueueEntry> {
    let deps: String = row.get("depends_on")?;
    let depends_on: BTreeSet<String> = serde_json::from_str(&deps).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(SubJobQueueEntry {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        child_id: row.get("child_id")?,
        execution_order: row.get("execution_order")?,
        status: parse_column(row, "status", EntryStatus::parse)?,
        depends_on,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(store: &JobStore) -> String {
        store
            .create_job(&NewJob::new("feature", "parent"), Utc::now())
            .unwrap()
            .id
    }

    fn children(parent_id: &str, deps: &[&[usize]]) -> Vec<(NewJob, Vec<usize>)> {
        deps.iter()
            .enumerate()
            .map(|(i, d)| {
                (
                    NewJob::new("feature", format!("child {i}")).child_of(parent_id, i as i64),
                    d.to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn insert_children_maps_indices_to_entry_ids() {
        let store = JobStore::in_memory().unwrap();
        let parent_id = parent(&store);
        let entries = store
            .insert_children(&parent_id, &children(&parent_id, &[&[], &[0], &[1]]), Utc::now())
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].depends_on.is_empty());
        assert_eq!(entries[1].depends_on, BTreeSet::from([entries[0].id.clone()]));
        assert_eq!(entries[2].depends_on, BTreeSet::from([entries[1].id.clone()]));
        assert!(entries.iter().all(|e| e.status == EntryStatus::Pending));
        assert_eq!(store.children_of(&parent_id).unwrap().len(), 3);
        assert_eq!(store.children_of(&parent_id).unwrap()[0].depth, 1);
    }

    #[test]
    fn cyclic_plan_rejected_and_nothing_written() {
        let store = JobStore::in_memory().unwrap();
        let parent_id = parent(&store);
        let err = store
            .insert_children(&parent_id, &children(&parent_id, &[&[2], &[0], &[1]]), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));
        assert!(store.children_of(&parent_id).unwrap().is_empty());
        assert!(!store.has_queue(&parent_id).unwrap());
    }

    #[test]
    fn cross_parent_child_rejected() {
        let store = JobStore::in_memory().unwrap();
        let a = parent(&store);
        let b = parent(&store);
        let err = store
            .insert_children(&a, &children(&b, &[&[]]), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));
    }

    #[test]
    fn second_decomposition_rejected() {
        let store = JobStore::in_memory().unwrap();
        let parent_id = parent(&store);
        store
            .insert_children(&parent_id, &children(&parent_id, &[&[]]), Utc::now())
            .unwrap();
        let again = vec![(
            NewJob::new("feature", "late").child_of(&parent_id, 5),
            vec![],
        )];
        assert!(matches!(
            store.insert_children(&parent_id, &again, Utc::now()),
            Err(ForgeError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn duplicate_queue_slot_rejected() {
        let store = JobStore::in_memory().unwrap();
        let parent_id = parent(&store);
        let entries = store
            .insert_children(&parent_id, &children(&parent_id, &[&[]]), Utc::now())
            .unwrap();
        let err = store
            .add_queue_entry(&parent_id, &entries[0].child_id, &BTreeSet::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));
    }

    #[test]
    fn dependency_edges_stay_inside_the_sibling_set() {
        let store = JobStore::in_memory().unwrap();
        let a = parent(&store);
        let b = parent(&store);
        let a_entries = store.insert_children(&a, &children(&a, &[&[]]), Utc::now()).unwrap();
        let b_entries = store.insert_children(&b, &children(&b, &[&[]]), Utc::now()).unwrap();
        let err = store
            .add_dependency(&a_entries[0].id, &b_entries[0].id, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));
    }

    #[test]
    fn add_dependency_rejects_cycles() {
        let store = JobStore::in_memory().unwrap();
        let p = parent(&store);
        let entries = store
            .insert_children(&p, &children(&p, &[&[], &[0]]), Utc::now())
            .unwrap();
        let err = store
            .add_dependency(&entries[0].id, &entries[1].id, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));

        let extra = store
            .create_job(&NewJob::new("test", "extra").child_of(&p, 2), Utc::now())
            .unwrap();
        let entry = store
            .add_queue_entry(&p, &extra.id, &BTreeSet::new(), Utc::now())
            .unwrap();
        store.add_dependency(&entry.id, &entries[1].id, Utc::now()).unwrap();
        let stored = store.entry_for_child(&extra.id).unwrap().unwrap();
        assert!(stored.depends_on.contains(&entries[1].id));
    }

    #[test]
    fn one_in_progress_entry_per_parent() {
        let store = JobStore::in_memory().unwrap();
        let p = parent(&store);
        let entries = store
            .insert_children(&p, &children(&p, &[&[], &[]]), Utc::now())
            .unwrap();
        assert!(
            store
                .transition_entry(&entries[0].id, EntryStatus::Pending, EntryStatus::InProgress, None, Utc::now())
                .unwrap()
        );
        let err = store
            .transition_entry(&entries[1].id, EntryStatus::Pending, EntryStatus::InProgress, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConstraintViolation(_)));
    }
}
