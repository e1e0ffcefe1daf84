use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `mode` ("debug", "info", ...) is
/// applied to this crate's target.
pub fn init_logger(mode: &str) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        EnvFilter::new(format!("geoproxy={}", mode))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    /// One line per admission decision (accept or reject).
    #[allow(clippy::too_many_arguments)]
    pub fn admission(
        accepted: bool,
        client: &str,
        country: &str,
        region: &str,
        backend: &str,
        cached: &str,
        reason: &str,
    ) {
        if accepted {
            info!(
                client = client,
                country = country,
                region = region,
                backend = backend,
                cached = cached,
                "Accepted connection"
            );
        } else {
            info!(
                client = client,
                country = country,
                region = region,
                backend = backend,
                cached = cached,
                reason = reason,
                "Rejected connection"
            );
        }
    }

    /// One line when an accepted connection finishes.
    pub fn closed(client: &str, country: &str, region: &str, backend: &str, cached: &str) {
        info!(
            client = client,
            country = country,
            region = region,
            backend = backend,
            cached = cached,
            "Closed connection"
        );
    }
}
