//! Tracing subscriber setup for binaries and tests embedding the pool.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_filter(level: &str) -> String {
    // Frame-level codec traces are only useful when asked for explicitly.
    format!("rpool={level},rpool::wire::codec=off")
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `RPOOL_LOG` picks the level for this
/// crate. `LOG_FORMAT=json` switches to JSON lines. Safe to call more than
/// once: later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("RPOOL_LOG").ok().as_deref());
        EnvFilter::new(default_filter(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
