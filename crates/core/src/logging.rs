//! Logging and observability
//!
//! Structured logging through `tracing`, with text or JSON formatting chosen at
//! runtime. All output goes to stderr so stdout stays free for embedders.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable selecting the log format ("json" or "text")
pub const ENV_LOG_FORMAT: &str = "STEVEDORE_LOG_FORMAT";

/// Environment variable holding the filter directive
pub const ENV_LOG: &str = "STEVEDORE_LOG";

/// Environment variable selecting span lifecycle events
pub const ENV_LOG_SPAN_EVENTS: &str = "STEVEDORE_LOG_SPAN_EVENTS";

/// Initialize the logging system
///
/// `format` overrides `STEVEDORE_LOG_FORMAT`; anything other than `"json"`
/// selects the text formatter. The filter comes from `STEVEDORE_LOG`, then
/// `RUST_LOG`, then defaults to `info`. Subsequent calls are no-ops.
///
/// ```rust
/// use stevedore_core::logging;
///
/// logging::init(None).expect("Failed to initialize logging");
/// ```
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();

        let env_format = std::env::var(ENV_LOG_FORMAT).ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");
        let span_events = span_events_for_format(effective_format);

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

fn create_env_filter() -> EnvFilter {
    if let Ok(spec) = std::env::var(ENV_LOG) {
        EnvFilter::try_new(&spec).unwrap_or_else(|_| {
            eprintln!("Invalid {} specification '{}', using 'info'", ENV_LOG, spec);
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Span lifecycle events: explicit env var first, then a per-format default
fn span_events_for_format(format: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    if let Ok(value) = std::env::var(ENV_LOG_SPAN_EVENTS) {
        return parse_span_events(&value);
    }

    match format {
        "json" => FmtSpan::NEW | FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}

fn parse_span_events(value: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    value
        .split(',')
        .map(|part| part.trim().to_ascii_lowercase())
        .fold(FmtSpan::NONE, |acc, part| {
            acc | match part.as_str() {
                "new" => FmtSpan::NEW,
                "close" => FmtSpan::CLOSE,
                "enter" => FmtSpan::ENTER,
                "exit" => FmtSpan::EXIT,
                "active" => FmtSpan::ACTIVE,
                "full" => FmtSpan::FULL,
                _ => FmtSpan::NONE,
            }
        })
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
