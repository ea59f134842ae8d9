//! Structured logging setup on `tracing-subscriber`, filtered by `RUST_LOG`
//! or the configured level and written to stderr.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Line layout of the fmt subscriber.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        let level = if cfg!(debug_assertions) { "debug" } else { "info" };
        Self {
            level: level.to_string(),
            format: LogFormat::Full,
        }
    }
}

/// Install the global subscriber on stderr. `RUST_LOG` wins over `settings.level`.
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(settings: &LogSettings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(false);
    let installed = match settings.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.is_ok()
}
