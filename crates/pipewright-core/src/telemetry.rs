//! Tracing setup for the `pipewright` binary.
//!
//! Logs go to stderr; stdout is reserved for build summaries and records.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Crates whose events follow the requested level. Everything else logs at warn.
const PIPEWRIGHT_TARGETS: [&str; 3] = ["pipewright", "pipewright_core", "pipewright_ci"];

/// Filter directives used when `RUST_LOG` is unset.
fn default_directives(level: Level) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        PIPEWRIGHT_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, level.as_str().to_lowercase())),
    );
    directives.join(",")
}

/// Install the global subscriber. Later calls leave the first one in place.
///
/// In JSON mode every line carries the fields of the enclosing build span
/// (`pipeline`, `build_id`), so one build can be filtered out of a shared log.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let layer = if json {
        layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        layer.compact().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .ok();
}
