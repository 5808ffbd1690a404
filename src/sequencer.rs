use std::collections::HashMap;

use tracing::warn;

use crate::state_machine::JobType;

/// Built-in job type -> stage sequence table.
const BUILTIN_SEQUENCES: &[(&str, &[&str])] = &[
    ("feature", &["plan", "code", "test", "review", "document"]),
    (
        "new_module",
        &["scaffold", "plan", "code", "test", "review", "document"],
    ),
    ("bug_fix", &["plan", "code", "test", "review"]),
    ("refactor", &["plan", "code", "test", "review"]),
    ("test", &["plan", "test", "review"]),
    ("documentation", &["document", "review"]),
];

/// Used for job types without a table entry.
const DEFAULT_SEQUENCE: &[&str] = &["plan", "code", "test", "review"];

/// Maps a job type to its ordered stage list.
#[derive(Debug, Clone)]
pub struct StageSequencer {
    table: HashMap<String, Vec<String>>,
    fallback: Vec<String>,
}

impl Default for StageSequencer {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

impl StageSequencer {
    /// Build the table from the built-ins, overlaid with `overrides`.
    pub fn new(overrides: &HashMap<String, Vec<String>>) -> Self {
        let mut table: HashMap<String, Vec<String>> = BUILTIN_SEQUENCES
            .iter()
            .map(|(job_type, stages)| {
                (
                    job_type.to_string(),
                    stages.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect();
        for (job_type, stages) in overrides {
            table.insert(JobType::from(job_type.as_str()).to_string(), stages.clone());
        }
        Self {
            table,
            fallback: DEFAULT_SEQUENCE.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Ordered stages for `job_type`. Unknown types get the default sequence.
    pub fn stages_for(&self, job_type: &JobType) -> &[String] {
        match self.table.get(job_type.as_str()) {
            Some(stages) => stages,
            None => {
                warn!(job_type = %job_type, "no stage sequence for job type, using default");
                &self.fallback
            }
        }
    }

    pub fn knows(&self, job_type: &JobType) -> bool {
        self.table.contains_key(job_type.as_str())
    }
}
