//! Listener bind and accept loop.
//!
//! The loop never reads from an accepted socket and never blocks on a
//! client: a full per-server semaphore closes the connection immediately,
//! and PROXY-header work happens inside the spawned handler task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ListenerConfig;
use crate::geoip::GeoResolver;
use crate::handler::{handle_client, ListenerContext};
use crate::logger::log;

/// Per-listener counters.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    dial_failures: AtomicU64,
    capacity_rejected: AtomicU64,
}

impl ServerMetrics {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capacity_rejected(&self) {
        self.capacity_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    pub fn capacity_rejected(&self) -> u64 {
        self.capacity_rejected.load(Ordering::Relaxed)
    }
}

/// One proxy listener: configuration, shared resolver, accept loop.
pub struct ProxyServer {
    ctx: Arc<ListenerContext>,
    error_slot: Mutex<Option<String>>,
}

impl ProxyServer {
    pub fn new(config: ListenerConfig, resolver: Arc<GeoResolver>) -> Self {
        let limiter = crate::core::SourceLimiter::new(config.limits.max_conns_per_source);
        let ctx = ListenerContext {
            config,
            resolver,
            limiter,
            metrics: Arc::new(ServerMetrics::default()),
        };
        Self {
            ctx: Arc::new(ctx),
            error_slot: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.ctx.metrics)
    }

    /// Last error recorded by this listener, if any.
    pub fn last_error(&self) -> Option<String> {
        self.error_slot.lock().unwrap().clone()
    }

    fn record_error(&self, msg: String) {
        *self.error_slot.lock().unwrap() = Some(msg);
    }

    /// Bind the listen socket with SO_REUSEADDR for fast restarts.
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = self.ctx.config.listen_addr;
        let bind = || -> Result<TcpListener> {
            let socket = socket2::Socket::new(
                match addr {
                    std::net::SocketAddr::V4(_) => socket2::Domain::IPV4,
                    std::net::SocketAddr::V6(_) => socket2::Domain::IPV6,
                },
                socket2::Type::STREAM,
                Some(socket2::Protocol::TCP),
            )?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            socket.bind(&addr.into())?;
            socket.listen(1024)?;
            Ok(TcpListener::from_std(socket.into())?)
        };
        bind().map_err(|e| {
            let msg = format!("failed to start tcp server on {}: {}", addr, e);
            self.record_error(msg.clone());
            log::error!(address = %addr, error = %e, "Failed to bind listener");
            anyhow!(msg)
        })
    }

    /// Bind and run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, cancel).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let config = &self.ctx.config;

        let conn_limiter = if config.limits.max_conns > 0 {
            Some(Arc::new(Semaphore::new(config.limits.max_conns)))
        } else {
            None
        };

        log::info!(
            address = %local_addr,
            backend = %config.backend_addr,
            recv_proxy_protocol = config.recv_proxy_protocol,
            send_proxy_protocol = config.send_proxy_protocol,
            max_connections = config.limits.max_conns,
            max_conns_per_source = config.limits.max_conns_per_source,
            "Server started"
        );

        let tracker = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancel.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    // Capacity check first, and never read from the socket
                    // here: with recvProxyProtocol a read (or a wrapped
                    // remote-address lookup) would let an untrusted peer
                    // stall the accept loop.
                    let permit = if let Some(ref limiter) = conn_limiter {
                        match Arc::clone(limiter).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                self.ctx.metrics.record_capacity_rejected();
                                log::warn!(
                                    address = %local_addr,
                                    "Too many active connections; rejecting connection"
                                );
                                drop(stream);
                                continue;
                            }
                        }
                    } else {
                        None
                    };

                    let ctx = Arc::clone(&self.ctx);
                    let conn_cancel = cancel.child_token();
                    tracker.spawn(async move {
                        let _permit = permit;
                        let _ = stream.set_nodelay(true);
                        handle_client(ctx, stream, peer, conn_cancel).await;
                    });
                }
                Err(e) => {
                    self.record_error(format!("failed to accept connection: {}", e));
                    log::error!(error = %e, "Failed to accept connection");
                }
            }
        }

        log::info!(address = %local_addr, "Shutting down server");
        drop(listener);
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnLimits;
    use crate::core::Schedule;
    use crate::geoip::{GeoClient, GeoError, GeoInfo};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::net::{IpAddr, SocketAddr};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct UsClient;

    #[async_trait]
    impl GeoClient for UsClient {
        async fn lookup(&self, _ip: IpAddr) -> Result<GeoInfo, GeoError> {
            Ok(GeoInfo {
                country_code: "US".to_string(),
                region: "CA".to_string(),
            })
        }
    }

    fn resolver() -> Arc<GeoResolver> {
        Arc::new(GeoResolver::new(Arc::new(UsClient), 64, Duration::ZERO))
    }

    fn config(listen: &str, backend: SocketAddr, max_conns: usize) -> ListenerConfig {
        ListenerConfig {
            listen_addr: listen.parse().unwrap(),
            backend_addr: backend,
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
            limits: ConnLimits {
                idle_timeout: Duration::ZERO,
                max_lifetime: Duration::ZERO,
                dial_timeout: Duration::from_secs(5),
                proxy_header_timeout: Duration::from_secs(1),
                max_conns,
                max_conns_per_source: 0,
            },
        }
    }

    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_bind_failure_records_error() {
        // TEST-NET-2 address, not assigned locally.
        let server = ProxyServer::new(
            config("198.51.100.1:9", "127.0.0.1:9".parse().unwrap(), 0),
            resolver(),
        );
        assert!(server.bind().is_err());
        assert!(server.last_error().unwrap().contains("failed to start"));
    }

    #[tokio::test]
    async fn test_end_to_end_proxying() {
        let backend = echo_backend().await;
        let server = Arc::new(ProxyServer::new(config("127.0.0.1:0", backend, 0), resolver()));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server_clone = Arc::clone(&server);
        let cancel_clone = cancel.clone();
        let serve_task =
            tokio::spawn(async move { server_clone.serve(listener, cancel_clone).await });

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"roundtrip").await.unwrap();
        let mut buf = [0u8; 9];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"roundtrip");
        drop(conn);

        cancel.cancel();
        serve_task.await.unwrap().unwrap();
        assert_eq!(server.metrics().accepted(), 1);
    }

    #[tokio::test]
    async fn test_capacity_reject_closes_immediately() {
        let backend = echo_backend().await;
        let server = Arc::new(ProxyServer::new(config("127.0.0.1:0", backend, 1), resolver()));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server_clone = Arc::clone(&server);
        let cancel_clone = cancel.clone();
        let serve_task =
            tokio::spawn(async move { server_clone.serve(listener, cancel_clone).await });

        // First connection holds the only permit.
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        first.read_exact(&mut buf).await.unwrap();

        // Second connection is closed without any proxying.
        let mut second = TcpStream::connect(addr).await.unwrap();
        let n = second.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        // Wait for the metric rather than racing the accept loop.
        for _ in 0..50 {
            if server.metrics().capacity_rejected() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.metrics().capacity_rejected(), 1);

        drop(first);
        cancel.cancel();
        serve_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_proxy_peer_rejected_at_gate() {
        let backend = echo_backend().await;
        let mut cfg = config("127.0.0.1:0", backend, 0);
        cfg.recv_proxy_protocol = true;
        cfg.trusted_proxies = ["10.0.0.1".parse().unwrap()].into_iter().collect();
        let server = Arc::new(ProxyServer::new(cfg, resolver()));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server_clone = Arc::clone(&server);
        let cancel_clone = cancel.clone();
        let serve_task =
            tokio::spawn(async move { server_clone.serve(listener, cancel_clone).await });

        // Peer 127.0.0.1 is not trusted: closed with no PROXY parse and no
        // admission (neither accepted nor rejected counters move).
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(server.metrics().accepted(), 0);
        assert_eq!(server.metrics().rejected(), 0);

        cancel.cancel();
        serve_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_per_source_cap_rejects_excess_connection() {
        let backend = echo_backend().await;
        let mut cfg = config("127.0.0.1:0", backend, 0);
        cfg.limits.max_conns_per_source = 1;
        let server = Arc::new(ProxyServer::new(cfg, resolver()));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server_clone = Arc::clone(&server);
        let cancel_clone = cancel.clone();
        let serve_task =
            tokio::spawn(async move { server_clone.serve(listener, cancel_clone).await });

        // First connection from 127.0.0.1 holds the only source slot while
        // it splices.
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        first.read_exact(&mut buf).await.unwrap();

        // Second connection from the same source is rejected and closed.
        let mut second = TcpStream::connect(addr).await.unwrap();
        let n = second.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        for _ in 0..50 {
            if server.metrics().rejected() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.metrics().rejected(), 1);

        // Releasing the first slot admits the source again.
        drop(first);
        let mut admitted = false;
        for _ in 0..50 {
            let mut third = TcpStream::connect(addr).await.unwrap();
            third.write_all(b"y").await.unwrap();
            match tokio::time::timeout(Duration::from_millis(100), third.read(&mut buf)).await {
                Ok(Ok(1)) => {
                    admitted = true;
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert!(admitted);

        cancel.cancel();
        serve_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_unblocks_accept() {
        let backend = echo_backend().await;
        let server = Arc::new(ProxyServer::new(config("127.0.0.1:0", backend, 0), resolver()));
        let listener = server.bind().unwrap();
        let cancel = CancellationToken::new();

        let server_clone = Arc::clone(&server);
        let cancel_clone = cancel.clone();
        let serve_task =
            tokio::spawn(async move { server_clone.serve(listener, cancel_clone).await });

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), serve_task).await;
        assert!(result.is_ok());
    }
}
