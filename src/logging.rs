use std::fs::OpenOptions;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::telemetry;

const DEFAULT_FILTER: &str = "schema_migrator=info,mongodb=warn";

/// Installs the global subscriber.
///
/// `APP_ENV=development` (the default) prints human readable output. Any other
/// value writes JSON lines, to `MIGRATION_LOG_FILE` when it is set and can be
/// opened, to stdout otherwise. Spans are also exported to Jaeger when
/// `JAEGER_ENDPOINT` is set.
pub fn try_init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let is_dev = std::env::var("APP_ENV").unwrap_or_else(|_| "development".into()) == "development";
    let registry = tracing_subscriber::registry().with(env_filter);
    let registry = registry.with(telemetry::init_tracer()?);

    if is_dev {
        let fmt_layer = fmt::layer().with_target(true).with_level(true).with_line_number(true).with_ansi(true).pretty();
        registry.with(fmt_layer).try_init()?;
    } else {
        let file = std::env::var("MIGRATION_LOG_FILE")
            .ok()
            .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok());
        if let Some(file) = file {
            let json_layer = fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_target(true)
                .with_level(true)
                .with_line_number(true)
                .json();
            registry.with(json_layer).try_init()?;
        } else {
            let json_layer =
                fmt::layer().with_target(true).with_level(true).with_line_number(true).with_ansi(false).json();
            registry.with(json_layer).try_init()?;
        }
    }
    tracing::info!("Logging initialized in {} mode", if is_dev { "development" } else { "production" });
    Ok(())
}

pub fn set_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            tracing::error!(
                message = %panic_info,
                file = %location.file(),
                line = %location.line(),
                column = %location.column(),
                backtrace = %format!("{:?}", backtrace),
                "Migrator panic"
            );
        } else {
            tracing::error!(
                message = %panic_info,
                backtrace = %format!("{:?}", backtrace),
                "Migrator panic (unknown location)"
            );
        }
        eprintln!("PANIC: {}", panic_info);
        eprintln!("{:?}", backtrace);
    }));
}

pub fn init_logging_with_fallback() {
    if let Err(e) = try_init_logging() {
        eprintln!("Failed to initialize structured logging: {}", e);
        eprintln!("Falling back to simple stderr logging");
        let stderr_layer = fmt::layer().with_ansi(false).with_writer(std::io::stderr);
        if let Err(e) =
            tracing_subscriber::registry().with(EnvFilter::new(DEFAULT_FILTER)).with(stderr_layer).try_init()
        {
            eprintln!("Failed to initialize fallback logging: {}", e);
        }
    }
}
