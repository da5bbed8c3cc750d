use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info, warn, Instrument};

/// Wall-clock timer that logs at `warn` once an operation crosses its thresholds.
pub struct Timer {
    start: Instant,
    operation: String,
    threshold_warn: Duration,
    threshold_error: Duration,
}

impl Timer {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.into(),
            threshold_warn: Duration::from_millis(100),
            threshold_error: Duration::from_millis(500),
        }
    }

    pub fn with_thresholds(mut self, warn_ms: u64, error_ms: u64) -> Self {
        self.threshold_warn = Duration::from_millis(warn_ms);
        self.threshold_error = Duration::from_millis(error_ms);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn log_elapsed(&self, additional_context: Option<&str>) {
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_millis();
        let context = match additional_context {
            Some(ctx) => format!("{} ({})", self.operation, ctx),
            None => self.operation.clone(),
        };
        if elapsed > self.threshold_error {
            warn!(operation = %context, duration_ms = %elapsed_ms, "Operation exceeded error threshold");
        } else if elapsed > self.threshold_warn {
            warn!(operation = %context, duration_ms = %elapsed_ms, "Operation exceeded warning threshold");
        } else {
            info!(operation = %context, duration_ms = %elapsed_ms, "Operation completed");
        }
    }
}

/// Runs a store call inside a `database` span and logs how long it took.
pub async fn time_store_operation<F, T, E>(operation: &str, collection: &str, f: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let timer = Timer::new(format!("db::{}", operation)).with_thresholds(50, 200);
    let span = crate::telemetry::create_db_span(operation, collection);
    let result = f.instrument(span).await;
    timer.log_elapsed(Some(collection));
    result
}
