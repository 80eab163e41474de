//! Error Types
//!
//! Typed errors for every layer of the engine. Construction errors
//! ([`PatternError`], [`GraphError`]) abort a run before anything executes;
//! [`TaskError`] is local to one task attempt; [`RunError`] is what a run
//! as a whole reports.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the path template engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("Template '{template}' uses {{{placeholder}}} but no value is bound for it")]
    UnboundPlaceholder {
        template: String,
        placeholder: String,
    },

    #[error(
        "Template '{template}' binds {{{placeholder}}} inconsistently: '{first}' vs '{second}'"
    )]
    InconsistentBinding {
        template: String,
        placeholder: String,
        first: String,
        second: String,
    },

    #[error("Invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
}

/// Errors raised by a [`crate::store::StateStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while building or extending the task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("No rule produces '{path}' and the file does not exist")]
    NoProducer { path: String },

    #[error("Ambiguous rules for '{path}': {}", .rules.join(", "))]
    AmbiguousRule { path: String, rules: Vec<String> },

    #[error("Cyclic dependency: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("Rule '{0}' is already registered")]
    DuplicateRule(String),

    #[error("Rule '{rule}' is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Rule '{consumer}' depends on '{rule}', which is not a checkpoint")]
    NotACheckpoint { consumer: String, rule: String },

    #[error("Checkpoint '{checkpoint}' succeeded but its output directory '{directory}' is missing")]
    MissingCheckpointOutput {
        checkpoint: String,
        directory: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the manifest writer.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Refusing to write manifest '{output}': no input files were discovered")]
    EmptyInput { output: String },

    #[error("Manifest '{output}' lists '{path}', which does not exist")]
    MissingInput { output: String, path: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by one attempt of one task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {task} failed on attempt {attempt} (exit status: {})", fmt_status(.exit_status))]
    Execution {
        task: String,
        attempt: u32,
        exit_status: Option<i32>,
        log: Option<PathBuf>,
    },

    #[error("Task {task} exceeded its wall-clock budget of {budget_secs}s on attempt {attempt}")]
    Timeout {
        task: String,
        attempt: u32,
        budget_secs: u64,
    },

    #[error("Task {task} finished but did not produce: {}", .missing.join(", "))]
    MissingOutput { task: String, missing: Vec<String> },

    #[error("Task {task} gave up after {attempts} attempts (last exit status: {})", fmt_status(.exit_status))]
    FatalAfterRetries {
        task: String,
        attempts: u32,
        exit_status: Option<i32>,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Checkpoint(#[from] GraphError),

    #[error("Procedure for {task} failed: {message}")]
    Procedure { task: String, message: String },

    #[error("Could not launch {task}: {source}")]
    Launch {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    /// Whether another attempt can change the outcome.
    ///
    /// Manifest validation failures are a pure function of the inputs, so
    /// retrying them only burns attempts. The same holds for a checkpoint that
    /// reported success without its output directory.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Manifest(_)
                | Self::FatalAfterRetries { .. }
                | Self::Checkpoint(GraphError::MissingCheckpointOutput { .. })
        )
    }

    /// Exit status of the underlying process, if one ran.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::Execution { exit_status, .. } | Self::FatalAfterRetries { exit_status, .. } => {
                *exit_status
            }
            _ => None,
        }
    }
}

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Checkpoint {task} failed after {attempts} attempts; the rest of the graph cannot be determined")]
    CheckpointFailed { task: String, attempts: u32 },

    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error("{fatal} task(s) failed and {cancelled} dependent task(s) were abandoned")]
    TasksFailed { fatal: usize, cancelled: usize },

    #[error("Failed to load rules from '{path}': {reason}")]
    Load { path: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn fmt_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_error_display() {
        let err = PatternError::UnboundPlaceholder {
            template: "{sample}.bam".to_string(),
            placeholder: "sample".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Template '{sample}.bam' uses {sample} but no value is bound for it"
        );
    }

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::AmbiguousRule {
            path: "out.txt".to_string(),
            rules: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.to_string().contains("a, b"));

        let err = GraphError::Cycle {
            chain: vec!["x".to_string(), "y".to_string(), "x".to_string()],
        };
        assert!(err.to_string().contains("x -> y -> x"));
    }

    #[test]
    fn test_task_error_retryable() {
        let err = TaskError::Execution {
            task: "align[sample=s1]".to_string(),
            attempt: 1,
            exit_status: Some(1),
            log: None,
        };
        assert!(err.is_retryable());
        assert_eq!(err.exit_status(), Some(1));

        let err = TaskError::Manifest(ManifestError::EmptyInput {
            output: "parts.fofn".to_string(),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.exit_status(), None);

        let err = TaskError::from(GraphError::MissingCheckpointOutput {
            checkpoint: "scan".to_string(),
            directory: "requests".to_string(),
        });
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("'requests' is missing"));
    }

    #[test]
    fn test_task_error_status_formatting() {
        let err = TaskError::FatalAfterRetries {
            task: "t".to_string(),
            attempts: 3,
            exit_status: None,
        };
        assert!(err.to_string().contains("last exit status: none"));
    }
}
