use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// Reads `RUST_LOG` (defaults to `info`) and writes to stderr so stdout stays
/// machine-readable. `LOG_FORMAT=json` selects the JSON formatter. Safe to call
/// more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
