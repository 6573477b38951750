use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Output always goes to stderr: stdout is
/// the IPC channel.
///
/// `LOG_FORMAT=json` selects JSON lines; `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    // A subscriber may already be installed when embedded in a host process.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
