use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, with timestamps. Used in production.
    Json,
    /// Human readable single line output for development.
    Compact,
}

impl LogFormat {
    /// Pick the format for an environment. `RUST_LOG_FORMAT` wins when set.
    fn resolve(production: bool) -> Self {
        match var("RUST_LOG_FORMAT").as_deref() {
            Ok("json") => Self::Json,
            Ok("compact") => Self::Compact,
            Ok(other) => {
                warn!("Unknown RUST_LOG_FORMAT {other:?}, falling back to environment default");
                Self::for_environment(production)
            }
            Err(_) => Self::for_environment(production),
        }
    }

    fn for_environment(production: bool) -> Self {
        if production { Self::Json } else { Self::Compact }
    }
}

/// Install the global subscriber.
///
/// Production emits JSON at `INFO`, development emits compact text at `DEBUG`.
/// `RUST_LOG` directives override the default level in both cases. Calling
/// this twice is harmless; the second call leaves the first subscriber in
/// place.
pub fn init(production: bool) -> LogFormat {
    let level = if production { LevelFilter::INFO } else { LevelFilter::DEBUG };
    let format = LogFormat::resolve(production);
    initialize_tracing(level, format);
    format
}

fn initialize_tracing(level: LevelFilter, format: LogFormat) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    if tracing_subscriber::registry().with(log_layer).try_init().is_err() {
        warn!("Tracing subscriber already installed, keeping the existing one");
    }
}
