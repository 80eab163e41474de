//! Execution Timeline
//!
//! Tracks task attempt start/end times for generating run
//! reports and Gantt charts.

use std::collections::HashMap;
use std::time::Instant;

use super::observer::{RunObserver, TaskEvent, TaskEventKind};

/// Width of the task label column in the chart.
const LABEL_WIDTH: usize = 24;

/// Type of timeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    /// Attempt started executing
    Started,
    /// Attempt completed successfully
    Completed,
    /// Attempt failed
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Task label
    pub task: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a run.
///
/// Records when each task attempt starts, completes, or fails. A retried
/// task shows the span from its first start to its last finish.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a task.
    pub fn add_event(&mut self, task: impl Into<String>, event_type: EventType) {
        self.record(task.into(), event_type, Instant::now());
    }

    fn record(&mut self, task: String, event_type: EventType, timestamp: Instant) {
        self.events.push(TimelineEvent {
            task,
            event_type,
            timestamp,
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// (first start, last finish) per task, in milliseconds since creation.
    fn spans(&self) -> HashMap<String, (u128, u128)> {
        let mut spans: HashMap<String, (u128, u128)> = HashMap::new();
        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    spans.entry(event.task.clone()).or_insert((elapsed, 0));
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(span) = spans.get_mut(&event.task) {
                        span.1 = elapsed;
                    }
                }
            }
        }
        spans
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each task is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = Instant::now().duration_since(self.start_time).as_millis();

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut sorted: Vec<_> = self.spans().into_iter().collect();
        sorted.sort_by(|(a, (sa, _)), (b, (sb, _))| sa.cmp(sb).then_with(|| a.cmp(b)));

        for (task, (start, end)) in sorted {
            if end > start {
                let start_pos = (start as f64 * scale) as usize;
                let duration = ((end - start) as f64 * scale).max(1.0) as usize;

                let mut bar = " ".repeat(start_pos);
                bar.push_str(&"#".repeat(duration));

                output.push_str(&format!(
                    "{} |{}| ({} ms)\n",
                    truncate(&task, LABEL_WIDTH),
                    bar,
                    end - start
                ));
            }
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns task durations in milliseconds, from first start to last
    /// finish.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter(|(_, (start, end))| end >= start && *end > 0)
            .map(|(task, (start, end))| (task, end - start))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl RunObserver for ExecutionTimeline {
    fn on_task(&mut self, event: &TaskEvent) {
        let event_type = match event.kind {
            TaskEventKind::Started => EventType::Started,
            TaskEventKind::Succeeded => EventType::Completed,
            TaskEventKind::Failed { .. } => EventType::Failed,
            TaskEventKind::Skipped | TaskEventKind::Fatal | TaskEventKind::Cancelled => return,
        };
        self.record(event.task.clone(), event_type, event.timestamp);
    }
}

/// Pads or truncates a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
