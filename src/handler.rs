//! Per-connection admission pipeline.
//!
//! Ordering: PROXY-header gate, per-source slot, alwaysDenied, alwaysAllowed,
//! schedule, geolocation, country/region rules. The backend is dialed only
//! after the decision is "accept"; a PROXY header bound for the backend is
//! written before any client bytes are forwarded.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::core::{relay, subnets_contain, RelayOutcome, SourceLimiter};
use crate::geoip::GeoResolver;
use crate::logger::log;
use crate::proxy_protocol;
use crate::server::ServerMetrics;

/// Placeholder for fields that are unknown at log time.
const UNKNOWN: &str = "--";

/// Shared per-listener state handed to every connection task.
pub struct ListenerContext {
    pub config: ListenerConfig,
    pub resolver: Arc<GeoResolver>,
    pub limiter: Option<SourceLimiter>,
    pub metrics: Arc<ServerMetrics>,
}

/// Outcome of the admission pipeline, carrying everything the log line
/// needs.
#[derive(Debug, Clone)]
pub struct AdmissionOutcome {
    pub accepted: bool,
    pub reason: &'static str,
    pub country: String,
    pub region: String,
    pub cached: &'static str,
}

impl AdmissionOutcome {
    fn accept(country: String, region: String, cached: &'static str) -> Self {
        Self {
            accepted: true,
            reason: "",
            country,
            region,
            cached,
        }
    }

    fn reject(reason: &'static str) -> Self {
        Self {
            accepted: false,
            reason,
            country: UNKNOWN.to_string(),
            region: UNKNOWN.to_string(),
            cached: UNKNOWN,
        }
    }

    fn reject_with(
        reason: &'static str,
        country: String,
        region: String,
        cached: &'static str,
    ) -> Self {
        Self {
            accepted: false,
            reason,
            country,
            region,
            cached,
        }
    }
}

/// Evaluate the static, schedule and geolocation rules for `ip`.
///
/// The per-source slot is the caller's concern; everything else of the
/// admission pipeline lives here so it can be driven directly in tests.
pub async fn admit(ctx: &ListenerContext, ip: IpAddr, now: DateTime<Local>) -> AdmissionOutcome {
    let config = &ctx.config;

    if !config.always_denied.is_empty() && subnets_contain(&config.always_denied, ip) {
        return AdmissionOutcome::reject("always denied");
    }

    if !config.always_allowed.is_empty() && subnets_contain(&config.always_allowed, ip) {
        return AdmissionOutcome::accept(UNKNOWN.to_string(), UNKNOWN.to_string(), UNKNOWN);
    }

    if let Err(denial) = config.schedule.evaluate(now) {
        return AdmissionOutcome::reject(denial.reason());
    }

    let (result, marker) = ctx.resolver.resolve(ip).await;
    let info = match result {
        Ok(info) => info,
        Err(e) => {
            log::warn!(client_ip = %ip, error = %e, "Geolocation lookup failed");
            return AdmissionOutcome::reject_with(
                "geolocation error",
                UNKNOWN.to_string(),
                UNKNOWN.to_string(),
                marker.as_str(),
            );
        }
    };

    let country = info.country_code.trim().to_uppercase();
    let region = info.region.trim().to_string();
    let cached = marker.as_str();

    if config.denied_countries.contains(&country) {
        return AdmissionOutcome::reject_with("country or region denied", country, region, cached);
    }
    if config.allowed_countries.contains(&country) {
        if !config.denied_regions.is_empty() && config.denied_regions.contains(&region) {
            return AdmissionOutcome::reject_with(
                "country or region denied",
                country,
                region,
                cached,
            );
        }
        if !config.allowed_regions.is_empty() && !config.allowed_regions.contains(&region) {
            return AdmissionOutcome::reject_with(
                "country or region denied",
                country,
                region,
                cached,
            );
        }
        return AdmissionOutcome::accept(country, region, cached);
    }
    AdmissionOutcome::reject_with("country or region denied", country, region, cached)
}

/// Receive-side PROXY gate: exact-IP trusted check, then a REQUIREd header
/// under the read timeout. Returns the effective client address, or None
/// when the connection must be closed silently.
async fn receive_proxy_header(
    ctx: &ListenerContext,
    stream: &mut TcpStream,
    raw_peer: SocketAddr,
) -> Option<SocketAddr> {
    if !ctx.config.trusted_proxies.contains(&raw_peer.ip()) {
        log::debug!(peer = %raw_peer, "Closing connection from untrusted upstream");
        return None;
    }
    let timeout = ctx.config.limits.proxy_header_timeout;
    match tokio::time::timeout(timeout, proxy_protocol::read_header(stream)).await {
        Ok(Ok(header)) => Some(header.source.unwrap_or(raw_peer)),
        Ok(Err(e)) => {
            log::debug!(peer = %raw_peer, error = %e, "Invalid PROXY header");
            None
        }
        Err(_) => {
            log::debug!(peer = %raw_peer, "Timed out reading PROXY header");
            None
        }
    }
}

/// Drive one accepted connection through admission and, on accept, the
/// splice. Owns both sockets; everything is closed on return.
pub async fn handle_client(
    ctx: Arc<ListenerContext>,
    mut stream: TcpStream,
    raw_peer: SocketAddr,
    cancel: CancellationToken,
) {
    let client_addr = if ctx.config.recv_proxy_protocol {
        match receive_proxy_header(&ctx, &mut stream, raw_peer).await {
            Some(addr) => addr,
            None => return,
        }
    } else {
        raw_peer
    };
    let client_ip = client_addr.ip();

    let _slot_guard = if let Some(ref limiter) = ctx.limiter {
        if !limiter.acquire(client_ip) {
            let outcome =
                AdmissionOutcome::reject("too many concurrent connections from source IP");
            finish_rejected(&ctx, client_addr, &outcome);
            return;
        }
        let limiter = limiter.clone();
        Some(scopeguard::guard((), move |_| limiter.release(client_ip)))
    } else {
        None
    };

    let outcome = admit(&ctx, client_ip, Local::now()).await;
    if !outcome.accepted {
        finish_rejected(&ctx, client_addr, &outcome);
        return;
    }

    process_accepted(&ctx, stream, client_addr, outcome, cancel).await;
}

fn finish_rejected(ctx: &ListenerContext, client_addr: SocketAddr, outcome: &AdmissionOutcome) {
    ctx.metrics.record_rejected();
    log::admission(
        false,
        &client_addr.to_string(),
        &outcome.country,
        &outcome.region,
        &ctx.config.backend_addr.to_string(),
        outcome.cached,
        outcome.reason,
    );
}

async fn process_accepted(
    ctx: &ListenerContext,
    client_stream: TcpStream,
    client_addr: SocketAddr,
    outcome: AdmissionOutcome,
    cancel: CancellationToken,
) {
    let backend_addr = ctx.config.backend_addr;
    let client = client_addr.to_string();
    let backend = backend_addr.to_string();

    let mut backend_stream = match tokio::time::timeout(
        ctx.config.limits.dial_timeout,
        TcpStream::connect(backend_addr),
    )
    .await
    {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            stream
        }
        Ok(Err(e)) => {
            ctx.metrics.record_dial_failure();
            log::warn!(client = %client, backend = %backend, error = %e, "Failed to connect to backend");
            return;
        }
        Err(_) => {
            ctx.metrics.record_dial_failure();
            log::warn!(client = %client, backend = %backend, "Backend dial timeout");
            return;
        }
    };

    // The PROXY header must be fully written before any client bytes.
    if ctx.config.send_proxy_protocol {
        let header = match proxy_protocol::encode(
            ctx.config.proxy_protocol_version,
            client_addr,
            backend_addr,
        ) {
            Ok(header) => header,
            Err(e) => {
                log::warn!(client = %client, error = %e, "Failed to build PROXY header");
                return;
            }
        };
        if let Err(e) = backend_stream.write_all(&header).await {
            log::warn!(client = %client, backend = %backend, error = %e, "Failed to write PROXY header");
            return;
        }
    }

    ctx.metrics.record_accepted();
    log::admission(
        true,
        &client,
        &outcome.country,
        &outcome.region,
        &backend,
        outcome.cached,
        "",
    );

    let result = relay(
        client_stream,
        backend_stream,
        ctx.config.limits.idle_timeout,
        ctx.config.limits.max_lifetime,
        &cancel,
    )
    .await;

    match result {
        Ok(r) => match r.outcome {
            RelayOutcome::Completed => {}
            RelayOutcome::IdleTimeout => {
                log::warn!(client = %client, "Connection timeout due to inactivity");
            }
            RelayOutcome::LifetimeExceeded => {
                log::warn!(client = %client, "Connection exceeded maximum lifetime");
            }
            RelayOutcome::Cancelled => {
                log::info!(client = %client, "Connection closed by shutdown");
            }
        },
        Err(e) => {
            log::debug!(client = %client, error = %e, "Relay error");
        }
    }

    log::closed(&client, &outcome.country, &outcome.region, &backend, outcome.cached);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnLimits;
    use crate::core::Schedule;
    use crate::geoip::{GeoClient, GeoError, GeoInfo};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FixedClient {
        calls: AtomicUsize,
        response: Result<GeoInfo, ()>,
    }

    impl FixedClient {
        fn success(country: &str, region: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response: Ok(GeoInfo {
                    country_code: country.to_string(),
                    region: region.to_string(),
                }),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response: Err(()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeoClient for FixedClient {
        async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(info) => Ok(info.clone()),
                Err(()) => Err(GeoError::LookupFailed(ip)),
            }
        }
    }

    fn limits() -> ConnLimits {
        ConnLimits {
            idle_timeout: Duration::ZERO,
            max_lifetime: Duration::ZERO,
            dial_timeout: Duration::from_secs(5),
            proxy_header_timeout: Duration::from_secs(1),
            max_conns: 0,
            max_conns_per_source: 0,
        }
    }

    fn config(backend_addr: SocketAddr) -> ListenerConfig {
        ListenerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            backend_addr,
            allowed_countries: ["US".to_string()].into_iter().collect(),
            denied_countries: HashSet::new(),
            allowed_regions: HashSet::new(),
            denied_regions: HashSet::new(),
            always_allowed: Vec::new(),
            always_denied: Vec::new(),
            schedule: Schedule::default(),
            recv_proxy_protocol: false,
            send_proxy_protocol: false,
            proxy_protocol_version: 0,
            trusted_proxies: HashSet::new(),
            limits: limits(),
        }
    }

    fn context(config: ListenerConfig, client: Arc<dyn GeoClient>) -> ListenerContext {
        ListenerContext {
            config,
            resolver: Arc::new(GeoResolver::new(client, 64, Duration::ZERO)),
            limiter: None,
            metrics: Arc::new(ServerMetrics::default()),
        }
    }

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn backend_stub() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_always_denied_wins_without_upstream_call() {
        let client = FixedClient::success("US", "CA");
        let mut cfg = config(backend_stub());
        cfg.always_denied = vec!["10.0.0.0/24".to_string()];
        cfg.always_allowed = vec!["10.0.0.0/24".to_string()];
        let ctx = context(cfg, client.clone());

        let outcome = admit(&ctx, "10.0.0.7".parse().unwrap(), now()).await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, "always denied");
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_always_allowed_skips_geo_and_schedule() {
        let client = FixedClient::failing();
        let mut cfg = config(backend_stub());
        cfg.always_allowed = vec!["192.168.1.1".to_string()];
        // A schedule that rejects everything.
        cfg.schedule = Schedule {
            days: [chrono::Weekday::Sat].into_iter().collect(),
            ..Default::default()
        };
        let ctx = context(cfg, client.clone());

        let outcome = admit(&ctx, "192.168.1.1".parse().unwrap(), now()).await;
        assert!(outcome.accepted);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_schedule_denial_reasons() {
        let client = FixedClient::success("US", "CA");
        let mut cfg = config(backend_stub());
        cfg.schedule = Schedule {
            days: [chrono::Weekday::Sat].into_iter().collect(),
            ..Default::default()
        };
        let ctx = context(cfg, client.clone());

        // 2026-03-02 is a Monday.
        let outcome = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, "connection not allowed on this day");
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_geolocation_error_rejects() {
        let client = FixedClient::failing();
        let ctx = context(config(backend_stub()), client);

        let outcome = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, "geolocation error");
    }

    #[tokio::test]
    async fn test_allowed_country_accepts() {
        let client = FixedClient::success("us", "CA");
        let ctx = context(config(backend_stub()), client);

        let outcome = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert!(outcome.accepted);
        // Country is normalized to uppercase.
        assert_eq!(outcome.country, "US");
        assert_eq!(outcome.cached, "-");
    }

    #[tokio::test]
    async fn test_unlisted_country_rejects() {
        let client = FixedClient::success("CN", "Beijing");
        let ctx = context(config(backend_stub()), client);

        let outcome = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, "country or region denied");
    }

    #[tokio::test]
    async fn test_denied_country_wins_over_allowed() {
        let client = FixedClient::success("US", "CA");
        let mut cfg = config(backend_stub());
        cfg.denied_countries = ["US".to_string()].into_iter().collect();
        let ctx = context(cfg, client);

        let outcome = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert!(!outcome.accepted);
    }

    #[tokio::test]
    async fn test_denied_region_rejects() {
        let client = FixedClient::success("CN", "Beijing");
        let mut cfg = config(backend_stub());
        cfg.allowed_countries = ["CN".to_string()].into_iter().collect();
        cfg.denied_regions = ["Beijing".to_string()].into_iter().collect();
        let ctx = context(cfg, client);

        let outcome = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, "country or region denied");
    }

    #[tokio::test]
    async fn test_region_comparison_is_case_sensitive() {
        let client = FixedClient::success("CN", "BEIJING");
        let mut cfg = config(backend_stub());
        cfg.allowed_countries = ["CN".to_string()].into_iter().collect();
        cfg.denied_regions = ["Beijing".to_string()].into_iter().collect();
        let ctx = context(cfg, client);

        // "BEIJING" does not match the configured "Beijing".
        let outcome = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert!(outcome.accepted);
    }

    #[tokio::test]
    async fn test_allowed_regions_restrict() {
        let client = FixedClient::success("US", "TX");
        let mut cfg = config(backend_stub());
        cfg.allowed_regions = ["CA".to_string()].into_iter().collect();
        let ctx = context(cfg, client);

        let outcome = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert!(!outcome.accepted);
    }

    #[tokio::test]
    async fn test_second_lookup_is_cached() {
        let client = FixedClient::success("US", "CA");
        let ctx = context(config(backend_stub()), client.clone());

        let first = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert_eq!(first.cached, "-");
        let second = admit(&ctx, "1.2.3.4".parse().unwrap(), now()).await;
        assert_eq!(second.cached, "cached");
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_connection_never_dials_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let client = FixedClient::success("CN", "Beijing");
        let ctx = Arc::new(context(config(backend_addr), client));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let client_conn = TcpStream::connect(listen_addr).await.unwrap();
        let (server_conn, peer) = listener.accept().await.unwrap();

        handle_client(ctx, server_conn, peer, CancellationToken::new()).await;

        // The backend listener never saw a connection.
        let got_conn =
            tokio::time::timeout(Duration::from_millis(100), backend.accept()).await;
        assert!(got_conn.is_err());
        drop(client_conn);
    }

    #[tokio::test]
    async fn test_accepted_connection_splices_to_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let client = FixedClient::success("US", "CA");
        let ctx = Arc::new(context(config(backend_addr), client));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let mut client_conn = TcpStream::connect(listen_addr).await.unwrap();
        let (server_conn, peer) = listener.accept().await.unwrap();

        let handler = tokio::spawn(handle_client(
            ctx,
            server_conn,
            peer,
            CancellationToken::new(),
        ));

        let (mut backend_conn, _) = backend.accept().await.unwrap();
        client_conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend_conn.write_all(b"world").await.unwrap();
        client_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client_conn);
        drop(backend_conn);
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_header_precedes_client_bytes() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let client = FixedClient::success("US", "CA");
        let mut cfg = config(backend_addr);
        cfg.send_proxy_protocol = true;
        cfg.proxy_protocol_version = 1;
        let ctx = Arc::new(context(cfg, client));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let mut client_conn = TcpStream::connect(listen_addr).await.unwrap();
        // Client bytes are in flight before the backend dial even happens.
        client_conn.write_all(b"early-bytes").await.unwrap();
        let (server_conn, peer) = listener.accept().await.unwrap();

        let handler = tokio::spawn(handle_client(
            ctx,
            server_conn,
            peer,
            CancellationToken::new(),
        ));

        let (mut backend_conn, _) = backend.accept().await.unwrap();
        let mut buf = vec![0u8; 6];
        backend_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PROXY ");

        drop(client_conn);
        drop(backend_conn);
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_per_source_cap_rejects_excess() {
        let client = FixedClient::success("US", "CA");
        let mut ctx = context(config(backend_stub()), client);
        ctx.limiter = crate::core::SourceLimiter::new(1);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let limiter = ctx.limiter.as_ref().unwrap();

        assert!(limiter.acquire(ip));
        // The next acquire fails; handle_client turns this into the
        // source-cap rejection.
        assert!(!limiter.acquire(ip));
        limiter.release(ip);
        assert!(limiter.acquire(ip));
    }

    #[tokio::test]
    async fn test_untrusted_peer_closed_before_any_read() {
        let client = FixedClient::success("US", "CA");
        let mut cfg = config(backend_stub());
        cfg.recv_proxy_protocol = true;
        cfg.trusted_proxies = ["10.0.0.1".parse().unwrap()].into_iter().collect();
        let ctx = Arc::new(context(cfg, client.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let mut client_conn = TcpStream::connect(listen_addr).await.unwrap();
        let (server_conn, peer) = listener.accept().await.unwrap();

        // 127.0.0.1 is not in the trusted set: silent close, no geo call.
        handle_client(ctx, server_conn, peer, CancellationToken::new()).await;
        assert_eq!(client.calls(), 0);

        let mut buf = [0u8; 1];
        let n = client_conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_trusted_peer_header_replaces_client_address() {
        let client = FixedClient::success("CN", "Beijing");
        let mut cfg = config(backend_stub());
        cfg.recv_proxy_protocol = true;
        cfg.trusted_proxies = ["127.0.0.1".parse().unwrap()].into_iter().collect();
        // Deny the carried source subnet outright so the test observes that
        // the header's address (not the socket peer) feeds the pipeline.
        cfg.always_denied = vec!["203.0.113.0/24".to_string()];
        let ctx = Arc::new(context(cfg, client.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let mut client_conn = TcpStream::connect(listen_addr).await.unwrap();
        client_conn
            .write_all(b"PROXY TCP4 203.0.113.9 10.0.0.2 1234 8080\r\n")
            .await
            .unwrap();
        let (server_conn, peer) = listener.accept().await.unwrap();

        handle_client(ctx.clone(), server_conn, peer, CancellationToken::new()).await;
        // "always denied" fired for the PROXY-carried source: no geo call.
        assert_eq!(client.calls(), 0);
        assert_eq!(ctx.metrics.rejected(), 1);
    }

    #[tokio::test]
    async fn test_trusted_peer_without_header_closed() {
        let client = FixedClient::success("US", "CA");
        let mut cfg = config(backend_stub());
        cfg.recv_proxy_protocol = true;
        cfg.trusted_proxies = ["127.0.0.1".parse().unwrap()].into_iter().collect();
        cfg.limits.proxy_header_timeout = Duration::from_millis(100);
        let ctx = Arc::new(context(cfg, client.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let mut client_conn = TcpStream::connect(listen_addr).await.unwrap();
        let (server_conn, peer) = listener.accept().await.unwrap();

        // No header ever arrives: the read times out and the conn closes.
        handle_client(ctx, server_conn, peer, CancellationToken::new()).await;
        assert_eq!(client.calls(), 0);

        let mut buf = [0u8; 1];
        let n = client_conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
