use std::str::FromStr;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
	#[default]
	Json,
	Text,
}

impl FromStr for LogFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"json" => Ok(LogFormat::Json),
			"text" => Ok(LogFormat::Text),
			other => Err(format!("unknown log format {other:?}")),
		}
	}
}

/// Initialize the global subscriber. `RUST_LOG` wins over the debug flag.
/// Debug level logs authentication material; never enable it by default.
pub fn setup_logging(format: LogFormat, debug: bool) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
	match format {
		LogFormat::Json => tracing_subscriber::registry()
			.with(filter)
			.with(tracing_subscriber::fmt::layer().json())
			.init(),
		LogFormat::Text => tracing_subscriber::registry()
			.with(filter)
			.with(tracing_subscriber::fmt::layer())
			.init(),
	}
}
