//! Structured decomposition plans carried by stage output.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};

/// One sub-task of a decomposition. `depends_on` holds indices into the
/// owning plan's `subtasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl SubTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            job_type: None,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on = deps.into_iter().collect();
        self
    }

    /// Text handed to the child job as its task description.
    pub fn task_description(&self) -> String {
        if self.description.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.description)
        }
    }
}

/// Ordered sub-tasks with declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompositionPlan {
    pub subtasks: Vec<SubTask>,
}

impl DecompositionPlan {
    pub fn new(subtasks: Vec<SubTask>) -> Self {
        Self { subtasks }
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    /// Reject out-of-range, self-referencing and cyclic dependencies.
    pub fn validate(&self) -> Result<()> {
        let n = self.subtasks.len();
        let mut edges: HashMap<usize, Vec<usize>> = HashMap::with_capacity(n);
        for (i, task) in self.subtasks.iter().enumerate() {
            if task.title.trim().is_empty() {
                return Err(ForgeError::Validation(format!("sub-task {i} has no title")));
            }
            for &dep in &task.depends_on {
                if dep >= n {
                    return Err(ForgeError::ConstraintViolation(format!(
                        "sub-task {i} depends on {dep}, outside the sibling set of {n}"
                    )));
                }
            }
            edges.insert(i, task.depends_on.clone());
        }
        if has_cycle(&edges) {
            return Err(ForgeError::ConstraintViolation(
                "decomposition plan has a dependency cycle".into(),
            ));
        }
        Ok(())
    }
}

/// Kahn's algorithm over `node -> dependencies`. Dependencies that are not
/// keys of the map are treated as already satisfied.
pub(crate) fn has_cycle<K: Eq + Hash + Clone>(edges: &HashMap<K, Vec<K>>) -> bool {
    let mut remaining: HashMap<&K, HashSet<&K>> = edges
        .iter()
        .map(|(node, deps)| {
            (
                node,
                deps.iter().filter(|d| edges.contains_key(*d)).collect(),
            )
        })
        .collect();

    loop {
        let ready: Vec<&K> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(node, _)| *node)
            .collect();
        if ready.is_empty() {
            return !remaining.is_empty();
        }
        for node in ready {
            remaining.remove(node);
            for deps in remaining.values_mut() {
                deps.remove(node);
            }
        }
    }
}
