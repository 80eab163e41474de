//! Run Monitoring Module
//!
//! Observes a run while it executes and reports on it afterwards.
//!
//! # Components
//!
//! - [`RunObserver`]: per-task event hook, with [`LogObserver`]
//! - [`ExecutionTimeline`]: task start/end timing for Gantt charts
//! - [`ResourceMonitor`]: system CPU, memory and thread usage
//! - [`RunSummary`]: final report, printable or written as JSON

pub mod observer;
pub mod resource;
pub mod summary;
pub mod timeline;

pub use observer::{LogObserver, RunObserver, TaskEvent, TaskEventKind};
pub use resource::{ResourceMonitor, ResourcePeaks, ResourceSample};
pub use summary::{AbortedSubtree, FatalTask, RunOutcome, RunSummary};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
