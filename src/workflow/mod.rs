//! Rule and Task Graph Module
//!
//! Provides the data structures and algorithms that turn rule declarations
//! into a task graph which keeps growing as checkpoints finish.
//!
//! # Structure
//!
//! - [`wildcards`]: Path templates, binding extraction and globbing
//! - [`model`]: Rule declarations
//! - [`parser`]: YAML rule files
//! - [`validator`]: Rule validation
//! - [`registry`]: Rule lookup by output path
//! - [`graph`]: Task graph construction and extension
//! - [`checkpoint`]: Discovery of checkpoint footprints
//! - [`manifest`]: Sorted file-of-filenames aggregation
//! - [`planner`]: Task states, budgets and retries

pub mod checkpoint;
pub mod graph;
pub mod manifest;
pub mod model;
pub mod parser;
pub mod planner;
pub mod registry;
pub mod validator;
pub mod wildcards;

pub use checkpoint::{CheckpointResolver, Discovery};
pub use graph::{GraphBuilder, TaskGraph, TaskId, TaskKey, TaskNode};
pub use manifest::{read_manifest, write_manifest};
pub use model::{InputSpec, Param, Procedure, Resources, Rule, RuleBody, RuntimeScaling};
pub use parser::{load_rules, parse_rules, RuleFile};
pub use planner::{ExecutionPlanner, TaskState};
pub use registry::RuleRegistry;
pub use wildcards::{Binding, Template};
