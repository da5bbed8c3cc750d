use opentelemetry::global;
use opentelemetry::sdk::propagation::TraceContextPropagator;
use opentelemetry::sdk::trace::Tracer;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

/// Builds the Jaeger export layer when `JAEGER_ENDPOINT` is set.
///
/// Returns `Ok(None)` when tracing export is not configured; the migrator then only
/// writes local logs.
pub fn init_tracer<S>() -> Result<Option<OpenTelemetryLayer<S, Tracer>>, Box<dyn std::error::Error>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let Ok(jaeger_endpoint) = std::env::var("JAEGER_ENDPOINT") else {
        return Ok(None);
    };
    global::set_text_map_propagator(TraceContextPropagator::new());
    let service_name = std::env::var("SERVICE_NAME").unwrap_or_else(|_| "schema-migrator".into());
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(service_name)
        .with_endpoint(jaeger_endpoint)
        .install_batch(opentelemetry::runtime::Tokio)?;
    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Flushes spans still buffered by the batch exporter.
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

pub fn create_db_span(operation: &str, collection: &str) -> tracing::Span {
    tracing::span!(
        tracing::Level::DEBUG,
        "database",
        operation = operation,
        collection = collection,
        db_type = "mongodb"
    )
}

pub fn create_run_span(run_id: &str, database: &str) -> tracing::Span {
    tracing::span!(tracing::Level::INFO, "migration_run", run_id = run_id, database = database)
}

pub fn create_step_span(version: &str, name: &str) -> tracing::Span {
    tracing::span!(tracing::Level::INFO, "migration_step", step_version = version, step = name)
}
