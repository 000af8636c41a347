use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }
}

/// Build the filter: `RUST_LOG` when set, otherwise `default_level`
/// (e.g. "info", "debug", "kd_provision=debug,warn").
pub fn filter_for(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed (tests call this
/// repeatedly), in which case nothing changes.
pub fn init_with_format(service_name: &str, default_level: &str, format: LogFormat) -> bool {
    let filter = filter_for(default_level);
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Human => builder.with_thread_ids(false).try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, ?format, "logging initialised");
    }
    installed
}

/// Install the global subscriber, picking JSON output when `json` is set.
pub fn init(service_name: &str, default_level: &str, json: bool) -> bool {
    init_with_format(service_name, default_level, LogFormat::from_json_flag(json))
}
