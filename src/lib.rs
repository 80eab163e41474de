//! RuleFlow - Checkpoint-Driven Pipeline Engine
//!
//! Runs pipelines declared as rules: each rule names the files it produces
//! through path templates, and the engine works backwards from requested
//! targets to the tasks that must run. Some rules are checkpoints whose
//! output directory decides how many downstream tasks exist; the task graph
//! grows once such a checkpoint has finished.
//!
//! # Architecture
//!
//! - [`workflow`]: Rules, path templates, graph construction and planning
//! - [`execution`]: Run engine and command execution
//! - [`monitoring`]: Task events, timeline, resource usage and run summary
//! - [`store`]: Filesystem access, with an in-memory store for tests
//! - [`config`]: Engine settings and pipeline configuration
//! - [`error`]: Error types for every layer
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ruleflow::{load_rules, Engine, FsStore};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (registry, settings) = load_rules("rules.yaml")?.into_registry()?;
//!     let store = Arc::new(FsStore::new("/data/run1"));
//!
//!     let mut engine = Engine::new(registry, store, settings)?;
//!     let summary = engine.run(&["manifests/s1.fofn"])?;
//!     summary.into_result()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::{RunConfig, UserConfig};
pub use error::{GraphError, ManifestError, PatternError, RunError, StoreError, TaskError};
pub use execution::{AbortHandle, Engine, ExecutionDelegate, ShellDelegate};
pub use monitoring::{LogObserver, RunObserver, RunOutcome, RunSummary};
pub use store::{FsStore, MemoryStore, StateStore};
pub use workflow::model::{Procedure, Rule};
pub use workflow::parser::load_rules;
pub use workflow::registry::RuleRegistry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "RuleFlow";
