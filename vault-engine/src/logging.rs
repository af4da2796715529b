use tracing_subscriber::EnvFilter;

/// Install the process-wide JSON subscriber. `RUST_LOG` controls the
/// filter, defaulting to `info`.
pub fn init_json_logging() {
	tracing_subscriber::fmt()
		.json()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();
}
