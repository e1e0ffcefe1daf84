//! Geolocation-aware TCP reverse proxy.
//!
//! Architecture:
//! - `core/`: admission primitives (subnet, schedule, limiter) and the splice
//! - `geoip/`: HTTP geolocation client and the bounded LRU cache
//! - `server` / `handler`: accept loop and per-connection admission pipeline

mod config;
mod core;
mod error;
mod geoip;
mod handler;
mod logger;
mod proxy_protocol;
mod server;

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{CliArgs, ConnLimits};
use crate::geoip::{GeoResolver, HttpGeoClient};
use crate::logger::log;
use crate::server::ProxyServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(&cli.log_mode);

    let cfg = config::read_config(&cli.config)
        .map_err(|e| anyhow!("failed to read configuration file: {}", e))?;
    let endpoint = config::resolve_geoip_endpoint(&cfg.api_key, &cli.geoip_endpoint)?;

    log::info!(
        config = %cli.config.display(),
        geoip_endpoint = %endpoint,
        geoip_timeout = ?cli.geoip_timeout,
        geoip_max_bytes = cli.geoip_max_bytes,
        geoip_failure_ttl = ?cli.geoip_failure_ttl,
        backend_dial_timeout = ?cli.backend_dial_timeout,
        idle_timeout = ?cli.idle_timeout,
        max_conn_lifetime = ?cli.max_conn_lifetime,
        max_conns = cli.max_conns,
        max_conns_per_source = cli.max_conns_per_source,
        proxyproto_timeout = ?cli.proxyproto_timeout,
        cache_size = cli.cache_size,
        "Starting geoproxy"
    );

    let limits = ConnLimits::from_cli(&cli);
    let mut listeners = Vec::with_capacity(cfg.servers.len());
    for entry in &cfg.servers {
        let listener = entry.compile(limits)?;
        log::info!(
            listen = %listener.listen_addr,
            backend = %listener.backend_addr,
            allowed_countries = ?listener.allowed_countries,
            allowed_regions = ?listener.allowed_regions,
            denied_countries = ?listener.denied_countries,
            denied_regions = ?listener.denied_regions,
            always_allowed = ?listener.always_allowed,
            always_denied = ?listener.always_denied,
            recv_proxy_protocol = listener.recv_proxy_protocol,
            send_proxy_protocol = listener.send_proxy_protocol,
            proxy_protocol_version = listener.proxy_protocol_version,
            trusted_proxies = ?listener.trusted_proxies,
            "Configured server"
        );
        listeners.push(listener);
    }

    let api_key = if cfg.api_key.is_empty() {
        None
    } else {
        Some(cfg.api_key.clone())
    };
    let geo_client = HttpGeoClient::new(&endpoint, api_key, cli.geoip_timeout, cli.geoip_max_bytes)
        .map_err(|e| anyhow!("failed to initialize geolocation client: {}", e))?;
    let resolver = Arc::new(GeoResolver::new(
        Arc::new(geo_client),
        cli.cache_size,
        cli.geoip_failure_ttl,
    ));

    // Root cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        cancel_on_signal.cancel();
    });

    // One accept loop per listener; a bind failure stops that listener only.
    let mut handles = Vec::with_capacity(listeners.len());
    for listener in listeners {
        let server = ProxyServer::new(listener, Arc::clone(&resolver));
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run(cancel).await {
                log::error!(error = %e, "Server terminated");
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    log::info!("Shutdown complete");
    Ok(())
}
