//! Bidirectional splice with idle and hard-lifetime deadlines.
//!
//! `copy_bidirectional` propagates half-close: when one direction reaches
//! EOF it shuts down the peer's write side (TCP FIN) and keeps draining the
//! other direction before completing.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

/// How often the idle watcher samples the activity timestamp.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How a splice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both directions completed (EOF each way).
    Completed,
    /// No read/write activity for the idle timeout.
    IdleTimeout,
    /// The hard connection lifetime elapsed.
    LifetimeExceeded,
    /// The root cancellation token fired.
    Cancelled,
}

/// Result of a bidirectional splice.
#[derive(Debug, Clone, Copy)]
pub struct RelayResult {
    /// Bytes copied client -> backend.
    pub client_to_backend: u64,
    /// Bytes copied backend -> client.
    pub backend_to_client: u64,
    pub outcome: RelayOutcome,
}

pin_project! {
    /// Stream wrapper that records activity time and bytes transferred.
    struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
        write_bytes: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    fn new(
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
        write_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            read_bytes,
            write_bytes,
        }
    }
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.last_activity
                    .store(this.start_time.elapsed().as_secs(), Ordering::Release);
                this.read_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.last_activity
                    .store(this.start_time.elapsed().as_secs(), Ordering::Release);
                this.write_bytes.fetch_add(*n as u64, Ordering::Relaxed);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Splice `client` and `backend` until both directions complete or a
/// deadline fires.
///
/// - `idle_timeout`: no activity in either direction for this long ends the
///   splice (zero disables).
/// - `max_lifetime`: hard cap on the splice duration regardless of activity
///   (zero disables).
/// - `cancel`: root shutdown token; firing ends the splice.
///
/// Byte counters are tracked in real time, so the result is accurate even
/// when a deadline cuts the splice short. Both sockets close on drop.
pub async fn relay<A, B>(
    client: A,
    backend: B,
    idle_timeout: Duration,
    max_lifetime: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<RelayResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let client_to_backend = Arc::new(AtomicU64::new(0));
    let backend_to_client = Arc::new(AtomicU64::new(0));

    // Reads from the client are client->backend traffic, reads from the
    // backend are backend->client. Only read counters feed the totals; the
    // write counters exist to share the activity timestamp.
    let mut client_stream = TimedStream::new(
        client,
        start_time,
        Arc::clone(&last_activity),
        Arc::clone(&client_to_backend),
        Arc::clone(&backend_to_client),
    );
    let mut backend_stream = TimedStream::new(
        backend,
        start_time,
        Arc::clone(&last_activity),
        Arc::clone(&backend_to_client),
        Arc::clone(&client_to_backend),
    );

    let copy_task = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream);

    let idle_check = async {
        if idle_timeout.is_zero() {
            return std::future::pending::<()>().await;
        }
        let idle_secs = idle_timeout.as_secs().max(1);
        let mut interval = tokio::time::interval(IDLE_CHECK_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let last_active = last_activity.load(Ordering::Acquire);
            let elapsed = start_time.elapsed().as_secs();
            if elapsed.saturating_sub(last_active) >= idle_secs {
                return;
            }
        }
    };

    let lifetime_check = async {
        if max_lifetime.is_zero() {
            return std::future::pending::<()>().await;
        }
        tokio::time::sleep(max_lifetime).await;
    };

    let outcome = tokio::select! {
        result = copy_task => {
            let (a_to_b, b_to_a) = result?;
            return Ok(RelayResult {
                client_to_backend: a_to_b,
                backend_to_client: b_to_a,
                outcome: RelayOutcome::Completed,
            });
        }
        _ = idle_check => RelayOutcome::IdleTimeout,
        _ = lifetime_check => RelayOutcome::LifetimeExceeded,
        _ = cancel.cancelled() => RelayOutcome::Cancelled,
    };

    Ok(RelayResult {
        client_to_backend: client_to_backend.load(Ordering::Relaxed),
        backend_to_client: backend_to_client.load(Ordering::Relaxed),
        outcome,
    })
}
