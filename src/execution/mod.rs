//! Run Execution Module
//!
//! Drives a task graph to completion: parallel dispatch under a resource
//! budget, graph extension after checkpoints, retries and aborts.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating a run
//! - [`step`]: Job rendering and command execution

pub mod engine;
pub mod step;

pub use engine::{AbortHandle, Engine};
pub use step::{ExecOutcome, ExecutionDelegate, Job, ShellDelegate};
