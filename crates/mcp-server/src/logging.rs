use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Output goes to stderr: stdout belongs to
/// the stdio transport. `RUST_LOG` overrides the level chosen by `debug`.
pub fn init_tracing(debug: bool) {
    let default = if debug {
        "info,mcp_server=debug,mcp_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
