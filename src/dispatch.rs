//! Per-request orchestration: routing, filtering, body buffering, and the
//! failover loop over a pool's slots.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, REFERER,
    USER_AGENT,
};
use http::{Request, Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use crate::access::Verdict;
use crate::accesslog::{AccessLog, Record};
use crate::backend::SendOutcome;
use crate::error::{BoxError, Error};
use crate::metrics;
use crate::pool::Pool;
use crate::router::Router;

/// Body type of every response the proxy produces, synthesized or
/// relayed.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Full failover cycles over a pool before the request is given up.
const MAX_FAILOVER_CYCLES: u32 = 4;

/// Base sleep between failover cycles; doubles each cycle.
const CYCLE_SLEEP_BASE_MS: u64 = 50;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Builds a complete response body from owned bytes.
pub(crate) fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// The per-request orchestrator.
///
/// One instance serves every listener; it owns nothing but handles to
/// the immutable router and the access-log sink, so request tasks share
/// it freely.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    router: Arc<Router>,
    access_log: AccessLog,
}

impl Dispatcher {
    /// Creates a dispatcher over a router and an access-log sink.
    pub fn new(router: Arc<Router>, access_log: AccessLog) -> Dispatcher {
        Dispatcher { router, access_log }
    }

    /// Handles one inbound request end to end.
    ///
    /// Always produces a response: forwarding failures synthesize a 400
    /// or 503 rather than erroring the connection.
    pub async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<ProxyBody> {
        let begin = Utc::now();
        let host = host_of(&req);

        metrics::REQUESTS_TOTAL.inc();
        metrics::REQUESTS_PER_HOST.with_label_values(&[&host]).inc();

        let route = match self.router.route(&host) {
            Some(route) => route.clone(),
            None => {
                log::warn!("received request for unknown host {host}");
                count_error(&host, &Error::no_pool());
                return synthesized(StatusCode::SERVICE_UNAVAILABLE, "Host not configured");
            }
        };

        // Note the client's keep-alive wishes, then strip the hop-by-hop
        // header so it never reaches the upstream.
        let close_after = wants_close(req.version(), req.headers());
        let (mut parts, body) = req.into_parts();
        parts.headers.remove(CONNECTION);
        append_forwarded_for(&mut parts.headers, remote);

        match route.access().evaluate(remote.ip()) {
            Verdict::Pass => {}
            Verdict::Reject(response) => return response,
        }

        // The whole body is buffered up front; a streamed body could not
        // be replayed after a partial send to a failing backend.
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = Error::request_body(e);
                log::warn!("{host}: {err}");
                count_error(&host, &err);
                return synthesized(StatusCode::BAD_REQUEST, "Error reading request body");
            }
        };

        match self.forward(route.pool(), &parts, &body, close_after).await {
            Ok(response) => {
                self.access_log
                    .log(record_of(&host, remote, begin, &parts, &response));
                response
            }
            Err(err) => {
                log::warn!("{host}: {err}");
                count_error(&host, &err);
                synthesized(StatusCode::SERVICE_UNAVAILABLE, "Backends not available")
            }
        }
    }

    /// The failover loop.
    ///
    /// Starting from the pool's next round-robin candidate, tries slots
    /// until one accepts the request. A busy slot is skipped without
    /// counting as a failure; a failed slot gets a reconnect scheduled
    /// and is skipped. Each time the probe wraps around to the starting
    /// slot one cycle is charged, with an exponentially growing sleep in
    /// between so in-flight reconnects can finish, up to
    /// [`MAX_FAILOVER_CYCLES`].
    async fn forward(
        &self,
        pool: &Arc<Pool>,
        parts: &http::request::Parts,
        body: &Bytes,
        close_after: bool,
    ) -> Result<Response<ProxyBody>, Error> {
        let initial = match pool.next() {
            Some(slot) => slot,
            None => return Err(Error::no_backends()),
        };
        let mut current = Arc::clone(&initial);
        let mut cycles = 0u32;

        loop {
            // Each attempt gets a fresh request over the same buffered
            // bytes; the upstream leg is always HTTP/1.1 regardless of
            // what the client spoke.
            let req = rebuild_request(parts, body);

            match current.try_send(req, close_after).await {
                SendOutcome::Sent(response) => {
                    return Ok(response.map(|relay| relay.map_err(BoxError::from).boxed()));
                }
                SendOutcome::Busy => {
                    log::debug!("backend {} busy, skipping", current.destination());
                }
                SendOutcome::Failed(err) => {
                    log::warn!(
                        "sending request to {} failed: {err}",
                        current.destination()
                    );
                    metrics::REQUEST_ERRORS_PER_BACKEND
                        .with_label_values(&[current.destination().authority()])
                        .inc();
                    metrics::REQUEST_ERRORS_PER_ERROR_TYPE
                        .with_label_values(&[err.kind_label()])
                        .inc();
                    Arc::clone(&current).reconnect(&err);
                }
            }

            loop {
                let candidate = match pool.next() {
                    Some(candidate) => candidate,
                    None => return Err(Error::no_backends()),
                };
                if Arc::ptr_eq(&candidate, &initial) {
                    if cycles >= MAX_FAILOVER_CYCLES {
                        return Err(Error::backends_exhausted());
                    }
                    tokio::time::sleep(Duration::from_millis(CYCLE_SLEEP_BASE_MS << cycles)).await;
                    cycles += 1;
                    current = candidate;
                    break;
                }
                if candidate.ready() {
                    current = candidate;
                    break;
                }
            }
        }
    }
}

fn count_error(host: &str, err: &Error) {
    metrics::REQUEST_ERRORS_PER_HOST
        .with_label_values(&[host])
        .inc();
    metrics::REQUEST_ERRORS_PER_ERROR_TYPE
        .with_label_values(&[err.kind_label()])
        .inc();
}

fn synthesized(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn host_of(req: &Request<Incoming>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| req.uri().authority().map(|authority| authority.to_string()))
        .unwrap_or_default()
}

/// Whether the client asked for its connection to be closed after the
/// response.
///
/// `Connection: close` and the legacy `closed` token both count, as does
/// plain HTTP/1.0 unless the client sent `Connection: keep-alive`.
fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let mut close = version == Version::HTTP_10;
    for value in headers.get_all(CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") || token.eq_ignore_ascii_case("closed") {
                    close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    close = false;
                }
            }
        }
    }
    close
}

fn append_forwarded_for(headers: &mut HeaderMap, remote: SocketAddr) {
    let ip = remote.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).map(HeaderValue::to_str) {
        Some(Ok(existing)) => format!("{existing}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(&X_FORWARDED_FOR, value);
    }
}

fn rebuild_request(parts: &http::request::Parts, body: &Bytes) -> Request<Full<Bytes>> {
    let mut req = Request::new(Full::new(body.clone()));
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts.uri.clone();
    *req.version_mut() = Version::HTTP_11;
    *req.headers_mut() = parts.headers.clone();
    req
}

fn record_of(
    host: &str,
    remote: SocketAddr,
    begin: DateTime<Utc>,
    parts: &http::request::Parts,
    response: &Response<ProxyBody>,
) -> Record {
    let content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(-1);

    Record {
        host: host.to_owned(),
        remote: remote.to_string(),
        timestamp: begin,
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        protocol: format!("{:?}", parts.version),
        status: response.status().as_u16(),
        content_length,
        referer: header_str(&parts.headers, REFERER),
        user_agent: header_str(&parts.headers, USER_AGENT),
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_tokens_are_recognized() {
        let mut headers = HeaderMap::new();
        assert!(!wants_close(Version::HTTP_11, &headers));
        assert!(wants_close(Version::HTTP_10, &headers));

        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(wants_close(Version::HTTP_11, &headers));

        headers.insert(CONNECTION, HeaderValue::from_static("Closed"));
        assert!(wants_close(Version::HTTP_11, &headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!wants_close(Version::HTTP_10, &headers));
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let remote: SocketAddr = "203.0.113.9:51123".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, remote);
        assert_eq!(headers[&X_FORWARDED_FOR], "203.0.113.9");

        append_forwarded_for(&mut headers, remote);
        assert_eq!(headers[&X_FORWARDED_FOR], "203.0.113.9, 203.0.113.9");
    }

    #[test]
    fn rebuilt_requests_replay_the_buffered_body() {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("/submit")
            .version(Version::HTTP_10)
            .header("x-custom", "kept")
            .body(())
            .unwrap()
            .into_parts();
        let body = Bytes::from_static(b"payload");

        let first = rebuild_request(&parts, &body);
        let second = rebuild_request(&parts, &body);

        assert_eq!(first.method(), "POST");
        assert_eq!(first.uri(), "/submit");
        // The upstream leg is always keep-alive HTTP/1.1.
        assert_eq!(first.version(), Version::HTTP_11);
        assert_eq!(first.headers()["x-custom"], "kept");
        assert_eq!(second.headers()["x-custom"], "kept");
    }

    #[test]
    fn synthesized_responses_carry_plain_text() {
        let response = synthesized(StatusCode::SERVICE_UNAVAILABLE, "Backends not available");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
    }
}
