//! Backend connection slots.
//!
//! A [`BackendConnection`] owns one persistent HTTP/1.1 keep-alive
//! connection to one upstream endpoint: the hyper client handle whose
//! driver task owns the socket, the busy lock that serializes dispatches
//! on it, and the reconnect protocol that re-establishes it with
//! exponential backoff. Slots are created at startup and live for the
//! whole process; pools hand them out by reference.

use std::{
    fmt, io,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    sync::Arc,
    task::{ready, Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION};
use http::{Request, Response, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::error::{Error, Result, TimedOut};
use crate::metrics;
use crate::sync::{Mutex, TryLock, TryLockGuard};

/// Largest shift applied to the backoff base; keeps `2 << attempt` well
/// away from overflow while failures accumulate.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// A backend endpoint the proxy dials.
///
/// Accepted forms are a bare `host:port` pair or an `http://` URL; either
/// way the slot stores the authority it will hand to the resolver at dial
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    authority: String,
}

impl Destination {
    /// Parses a backend specification from configuration.
    pub fn parse(spec: &str) -> Result<Destination> {
        if spec.contains("://") {
            let url = Url::parse(spec).map_err(Error::config)?;
            if url.scheme() != "http" {
                return Err(Error::config(format!(
                    "backend {spec}: only http:// backends are supported"
                )));
            }
            let host = url
                .host_str()
                .ok_or_else(|| Error::config(format!("backend {spec}: missing host")))?;
            let port = url.port_or_known_default().unwrap_or(80);
            return Ok(Destination {
                authority: format!("{host}:{port}"),
            });
        }

        match spec.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Destination {
                    authority: spec.to_owned(),
                })
            }
            _ => Err(Error::config(format!(
                "backend {spec}: expected host:port or an http:// URL"
            ))),
        }
    }

    /// The `host:port` authority this destination dials.
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.authority)
    }
}

/// Outcome of one dispatch attempt on a slot.
pub enum SendOutcome {
    /// The request went out and the response status and headers are in
    /// hand; the body streams through the contained response.
    Sent(Response<RelayBody>),
    /// Another request holds the slot. Not a failure; try another slot.
    Busy,
    /// The attempt failed. [`Error::wants_reconnect`] says whether the
    /// caller should schedule a reconnect before failing over.
    Failed(Error),
}

impl fmt::Debug for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SendOutcome::Sent(response) => f
                .debug_tuple("Sent")
                .field(&response.status())
                .finish(),
            SendOutcome::Busy => f.write_str("Busy"),
            SendOutcome::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// One persistent connection slot to one upstream endpoint.
pub struct BackendConnection {
    dest: Destination,
    /// HTTP/1.1 keep-alive client handle; `None` while disconnected or
    /// reconnecting. The socket itself lives in the handle's spawned
    /// driver task.
    client: Mutex<Option<SendRequest<Full<Bytes>>>>,
    busy: TryLock,
    ready: AtomicBool,
    reconnecting: AtomicBool,
    attempt: AtomicU32,
}

impl BackendConnection {
    /// Creates a disconnected slot for `dest`.
    ///
    /// Call [`connect`][BackendConnection::connect] to schedule the
    /// initial dial; construction itself never touches the network.
    pub fn new(dest: Destination) -> Arc<BackendConnection> {
        Arc::new(BackendConnection {
            dest,
            client: Mutex::new(None),
            busy: TryLock::new(),
            ready: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
        })
    }

    /// The endpoint this slot dials.
    pub fn destination(&self) -> &Destination {
        &self.dest
    }

    /// Observable readiness: a client handle is installed and no
    /// reconnect is tearing it down.
    ///
    /// May be stale the instant it is read; dispatch re-checks under the
    /// busy lock and reports `NotConnected` when the handle is gone.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Consecutive dial failures since the last successful connect.
    pub fn connect_failures(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    /// Schedules the initial connect for a freshly configured slot.
    pub fn connect(self: Arc<Self>) {
        self.spawn_reconnect();
    }

    /// Schedules a reconnection in response to a dispatch error.
    ///
    /// Idempotent: while one reconnection is in flight further calls
    /// return immediately. A temporary network error is a no-op as well;
    /// the connection is presumed still viable and tearing it down would
    /// only lose its keep-alive state.
    pub fn reconnect(self: Arc<Self>, cause: &Error) {
        if !cause.wants_reconnect() {
            log::debug!(
                "backend {}: not reconnecting after temporary error: {cause}",
                self.dest
            );
            return;
        }
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        // Readiness must flip before the client handle is torn down so no
        // dispatcher can observe a ready slot whose handle is being
        // replaced under it.
        self.set_ready(false);
        self.client.lock().take();

        metrics::NUM_RECONNECTS_PER_BACKEND
            .with_label_values(&[self.dest.authority()])
            .inc();

        tokio::spawn(async move {
            self.run_reconnect().await;
        });
    }

    async fn run_reconnect(self: Arc<Self>) {
        loop {
            let shift = self.attempt.load(Ordering::Relaxed).min(MAX_BACKOFF_SHIFT);
            let dial_timeout = Duration::from_secs(2u64 << shift);

            match self.dial(dial_timeout).await {
                Ok(sender) => {
                    *self.client.lock() = Some(sender);
                    self.attempt.store(0, Ordering::Relaxed);
                    self.set_ready(true);
                    self.reconnecting.store(false, Ordering::SeqCst);
                    log::debug!("backend {}: connected", self.dest);
                    return;
                }
                Err(e) => {
                    log::warn!("backend {}: connect failed: {e}", self.dest);
                    metrics::NUM_RECONNECT_FAILURES_BY_REASON
                        .with_label_values(&[dial_failure_reason(&e).as_str()])
                        .inc();

                    let next = self
                        .attempt
                        .fetch_add(1, Ordering::Relaxed)
                        .saturating_add(1)
                        .min(MAX_BACKOFF_SHIFT);
                    sleep(Duration::from_millis(100u64 << next)).await;
                }
            }
        }
    }

    async fn dial(&self, dial_timeout: Duration) -> Result<SendRequest<Full<Bytes>>> {
        let authority = self.dest.authority();

        let stream = match timeout(dial_timeout, TcpStream::connect(authority)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::permanent(authority, e)),
            Err(_) => return Err(Error::permanent(authority, TimedOut)),
        };

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::permanent(authority, e))?;

        let dest = self.dest.clone();
        tokio::spawn(async move {
            // Drives the connection until the upstream or the handle goes
            // away; a closed keep-alive surfaces at the next dispatch.
            if let Err(e) = conn.await {
                log::debug!("backend {dest}: connection ended: {e}");
            }
        });

        Ok(sender)
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        metrics::BACKENDS_READY
            .with_label_values(&[self.dest.authority()])
            .set(ready as i64);
    }

    /// Attempts to forward one request on this slot.
    ///
    /// Never waits for the slot: a held busy lock comes back as
    /// [`SendOutcome::Busy`] so the caller can move on. On success the
    /// returned response carries the upstream's status and headers with
    /// `Connection` rewritten for the client's keep-alive wishes, and its
    /// body keeps the slot busy until fully relayed.
    pub async fn try_send(&self, req: Request<Full<Bytes>>, close_after: bool) -> SendOutcome {
        let guard = match self.busy.try_acquire() {
            Some(guard) => guard,
            None => return SendOutcome::Busy,
        };

        // The handle may have been replaced or torn down between the
        // readiness check and the acquire; re-check under the lock.
        let mut sender = match self.client.lock().take() {
            Some(sender) => sender,
            None => return SendOutcome::Failed(Error::not_connected(self.dest.authority())),
        };

        let uri = req.uri().clone();
        let begin = Instant::now();

        match sender.send_request(req).await {
            Ok(response) => {
                let elapsed = begin.elapsed();

                // Keep-alive: the handle goes back for the next request
                // unless a reconnect installed a fresh one meanwhile.
                {
                    let mut slot = self.client.lock();
                    if slot.is_none() {
                        *slot = Some(sender);
                    }
                }

                log::debug!("backend {}: {} took {:?}", self.dest, uri, elapsed);
                metrics::REQUESTS_PER_BACKEND
                    .with_label_values(&[self.dest.authority()])
                    .inc();
                metrics::REQUEST_TIME_TOTAL_PER_BACKEND
                    .with_label_values(&[self.dest.authority()])
                    .inc_by(elapsed.as_secs_f64());

                SendOutcome::Sent(self.relay(response, close_after, uri, guard))
            }
            Err(e) => SendOutcome::Failed(Error::from_dispatch(self.dest.authority(), e)),
        }
    }

    fn relay(
        &self,
        response: Response<Incoming>,
        close_after: bool,
        uri: Uri,
        busy: TryLockGuard,
    ) -> Response<RelayBody> {
        let (mut parts, body) = response.into_parts();

        // Hop-by-hop: the upstream's Connection header never reaches the
        // client. The client's own close request is answered explicitly.
        parts.headers.remove(CONNECTION);
        if close_after {
            parts
                .headers
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let relay = RelayBody {
            inner: body,
            dest: self.dest.clone(),
            uri,
            _busy: busy,
        };
        Response::from_parts(parts, relay)
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("dest", &self.dest)
            .field("ready", &self.ready())
            .field("busy", &self.busy)
            .field("attempt", &self.connect_failures())
            .finish()
    }
}

fn dial_failure_reason(e: &Error) -> String {
    use std::error::Error as _;

    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return io.kind().to_string();
        }
        if err.is::<TimedOut>() {
            return "timed out".to_owned();
        }
        source = err.source();
    }
    "unknown".to_owned()
}

pin_project! {
    /// Streams an upstream response body to the client.
    ///
    /// Holds the slot's busy lock until the last byte is relayed (or the
    /// client goes away and the body is dropped), so the keep-alive
    /// connection is never handed a second request mid-response. A body
    /// failure after the headers went out is logged and counted but never
    /// retried; the client sees the truncation.
    pub struct RelayBody {
        #[pin]
        inner: Incoming,
        dest: Destination,
        uri: Uri,
        _busy: TryLockGuard,
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Error>>> {
        let this = self.project();
        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => Poll::Ready(Some(Ok(frame))),
            Some(Err(e)) => {
                log::warn!(
                    "backend {}: copying response body for {} failed: {e}",
                    this.dest,
                    this.uri
                );
                metrics::REQUEST_ERRORS_PER_BACKEND
                    .with_label_values(&[this.dest.authority()])
                    .inc();
                metrics::REQUEST_ERRORS_PER_ERROR_TYPE
                    .with_label_values(&["body_copy"])
                    .inc();
                Poll::Ready(Some(Err(Error::body_copy(e))))
            }
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl fmt::Debug for RelayBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RelayBody")
            .field("dest", &self.dest)
            .field("uri", &self.uri)
            .finish()
    }
}
