use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins; otherwise `EDSDEBUG`
/// switches the crate from info to debug.
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(rust_log.as_deref(), debug_requested());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Filter from a `RUST_LOG`-style spec, falling back to the crate default
/// when the spec is missing, blank or invalid.
pub fn build_filter(rust_log: Option<&str>, debug: bool) -> EnvFilter {
    if let Some(spec) = rust_log.filter(|s| !s.trim().is_empty()) {
        match EnvFilter::try_new(spec) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("ignoring invalid RUST_LOG {spec:?}: {e}"),
        }
    }

    if debug {
        EnvFilter::new("eds_ingest=debug")
    } else {
        EnvFilter::new("eds_ingest=info")
    }
}

fn debug_requested() -> bool {
    std::env::var("EDSDEBUG").map(|v| !v.is_empty()).unwrap_or(false)
}
