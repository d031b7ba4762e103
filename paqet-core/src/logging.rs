use crate::config::LogLevel;
use crate::error::{Error, Result};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber from the configured log level.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(
            format!("paqet_core={}", tracing_level)
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        )
        .add_directive(
            format!("paqet={}", tracing_level)
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        )
        .add_directive(
            "tokio=warn"
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        )
        .add_directive(
            "quinn=warn"
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        )
        .add_directive(
            "rustls=warn"
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        );

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    // try_init: a second init (tests, embedding) keeps the existing subscriber.
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();

    Ok(())
}

/// Log an error at a severity matching its category.
pub fn log_error(error: &Error, context: Option<&str>) {
    match error.code() {
        "QUEUE_FULL" | "INJECTION" | "CAPTURE" | "NETWORK" | "DEADLINE" | "IO" => {
            if let Some(ctx) = context {
                tracing::warn!("{}: {}", ctx, error);
            } else {
                tracing::warn!("{}", error);
            }
        }
        _ => {
            if let Some(ctx) = context {
                tracing::error!("{}: {}", ctx, error);
            } else {
                tracing::error!("{}", error);
            }
        }
    }
}
