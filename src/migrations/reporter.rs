//! Structured per-step progress events.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::metrics::Timer;
use crate::version::SchemaVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    Info,
    Error,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Phase::Start => "start",
            Phase::Info => "info",
            Phase::Error => "error",
            Phase::Done => "done",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub step_version: SchemaVersion,
    pub phase: Phase,
    pub message: String,
    pub elapsed_ms: u64,
}

pub type EventSink = Arc<dyn Fn(&StepEvent) + Send + Sync>;

/// Emits step events to the log and, optionally, to an extra sink.
#[derive(Clone, Default)]
pub struct MigrationReporter {
    sink: Option<EventSink>,
}

impl MigrationReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: EventSink) -> Self {
        Self { sink: Some(sink) }
    }

    /// Starts reporting for one step and emits its `start` event.
    pub fn step(&self, version: SchemaVersion, name: &str) -> StepReporter {
        let reporter = StepReporter {
            version,
            timer: Arc::new(Timer::new(format!("step::{version}")).with_thresholds(5_000, 60_000)),
            sink: self.sink.clone(),
        };
        reporter.emit(Phase::Start, format!("Applying migration '{name}'"));
        reporter
    }
}

/// Reporter bound to a single step; cloned freely into batch tasks.
#[derive(Clone)]
pub struct StepReporter {
    version: SchemaVersion,
    timer: Arc<Timer>,
    sink: Option<EventSink>,
}

impl StepReporter {
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.timer.elapsed_ms()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Phase::Info, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Phase::Error, message.into());
    }

    pub fn done(&self, message: impl Into<String>) {
        self.emit(Phase::Done, message.into());
        self.timer.log_elapsed(None);
    }

    fn emit(&self, phase: Phase, message: String) {
        let event = StepEvent { step_version: self.version, phase, message, elapsed_ms: self.elapsed_ms() };
        match phase {
            Phase::Error => tracing::error!(
                step_version = %event.step_version,
                phase = %event.phase,
                elapsed_ms = event.elapsed_ms,
                "{}",
                event.message
            ),
            _ => tracing::info!(
                step_version = %event.step_version,
                phase = %event.phase,
                elapsed_ms = event.elapsed_ms,
                "{}",
                event.message
            ),
        }
        if let Some(sink) = &self.sink {
            sink(&event);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Reporter whose events are captured for assertions.
    pub(crate) fn capturing_reporter() -> (MigrationReporter, Arc<Mutex<Vec<StepEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let reporter = MigrationReporter::with_sink(Arc::new(move |event: &StepEvent| {
            captured.lock().unwrap().push(event.clone());
        }));
        (reporter, events)
    }

    #[test]
    fn test_step_emits_start_info_error_done() {
        let (reporter, events) = capturing_reporter();
        let step = reporter.step(SchemaVersion::new(1, 0, 3), "normalize_legacy_numbers");
        step.info("12 documents normalized");
        step.error("document I0007 failed");
        step.done("Migration completed");

        let events = events.lock().unwrap();
        let phases: Vec<Phase> = events.iter().map(|e| e.phase).collect();
        assert_eq!(phases, vec![Phase::Start, Phase::Info, Phase::Error, Phase::Done]);
        assert!(events.iter().all(|e| e.step_version == SchemaVersion::new(1, 0, 3)));
        assert_eq!(events[0].message, "Applying migration 'normalize_legacy_numbers'");
    }

    #[test]
    fn test_event_serializes_as_structured_entry() {
        let event = StepEvent {
            step_version: SchemaVersion::new(1, 1, 0),
            phase: Phase::Done,
            message: "ok".to_string(),
            elapsed_ms: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"stepVersion": "1.1.0", "phase": "done", "message": "ok", "elapsedMs": 42})
        );
    }
}
