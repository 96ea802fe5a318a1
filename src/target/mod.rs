//! Wraps one backend URL: in-flight request tracking via RAII guards, the
//! Adding/Healthy/Draining state machine, drain-with-cancel, active health
//! checking, and the outbound rewrite policy (scheme/host swap, preserved
//! inbound `Host`, `X-Forwarded-*`) applied to every forwarded request.

use crate::body::BoxBody;
use crate::error::ProxyError;
use crate::health::{HealthCheck, HealthCheckConfig, HealthCheckConsumer};
use http::{HeaderMap, HeaderValue, Method, Request, Response};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// Builds the shared outbound HTTP client used both to forward requests to a
/// target and to probe its health-check endpoint.
pub fn build_http_client() -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Adding,
    Healthy,
    Draining,
}

#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub response_header_timeout: Duration,
    pub health_check: HealthCheckConfig,
    pub forward_headers: bool,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            response_header_timeout: Duration::from_secs(30),
            health_check: HealthCheckConfig::default(),
            forward_headers: true,
        }
    }
}

struct InflightRecord {
    cancel: CancellationToken,
    hijacked: Arc<AtomicBool>,
}

struct StateInner {
    state: TargetState,
    pre_drain: Option<TargetState>,
}

struct Inner {
    addr: String,
    scheme: String,
    base_url: String,
    options: TargetOptions,
    client: HttpClient,
    state: Mutex<StateInner>,
    inflight: Mutex<HashMap<u64, InflightRecord>>,
    next_id: AtomicU64,
    health_check: Mutex<Option<HealthCheck>>,
    became_healthy: Notify,
    became_healthy_fired: AtomicBool,
    on_state_change: Mutex<Option<Box<dyn Fn(TargetState) + Send + Sync>>>,
}

/// One backend instance. Cheap to clone — every clone shares the same
/// in-flight table, state, and health-check loop.
#[derive(Clone)]
pub struct Target(Arc<Inner>);

impl Target {
    pub fn new(addr: String, scheme: String, options: TargetOptions, client: HttpClient) -> Self {
        let base_url = format!("{}://{}", scheme, addr);
        Self(Arc::new(Inner {
            addr,
            scheme,
            base_url,
            options,
            client,
            state: Mutex::new(StateInner {
                state: TargetState::Adding,
                pre_drain: None,
            }),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            health_check: Mutex::new(None),
            became_healthy: Notify::new(),
            became_healthy_fired: AtomicBool::new(false),
            on_state_change: Mutex::new(None),
        }))
    }

    pub fn addr(&self) -> &str {
        &self.0.addr
    }

    pub fn state(&self) -> TargetState {
        self.0.state.lock().unwrap().state
    }

    /// Registers the callback the owning load balancer uses to rebuild its
    /// writer/reader pools whenever this target's state changes.
    pub fn set_on_state_change<F>(&self, f: F)
    where
        F: Fn(TargetState) + Send + Sync + 'static,
    {
        *self.0.on_state_change.lock().unwrap() = Some(Box::new(f));
    }

    fn notify_state_change(&self, state: TargetState) {
        if let Some(cb) = self.0.on_state_change.lock().unwrap().as_ref() {
            cb(state);
        }
    }

    /// Starts probing this target's health-check endpoint, pushing results
    /// back to this target's own `HealthCheckConsumer` implementation.
    pub fn begin_health_checks(&self) {
        let consumer: Arc<dyn HealthCheckConsumer> = Arc::new(TargetHealthConsumer(self.clone()));
        let hc = HealthCheck::start(
            self.0.base_url.clone(),
            self.0.options.health_check.clone(),
            consumer,
            self.0.client.clone(),
        );
        *self.0.health_check.lock().unwrap() = Some(hc);
    }

    /// Stops the probe loop. Called when a balancer demotes this target to
    /// its sole healthy writer — there is no value in re-routing a singleton.
    pub fn close_health_checks(&self) {
        if let Some(mut hc) = self.0.health_check.lock().unwrap().take() {
            hc.close();
        }
    }

    fn fire_became_healthy(&self) {
        if !self.0.became_healthy_fired.swap(true, Ordering::AcqRel) {
            self.0.became_healthy.notify_waiters();
        }
        metrics::gauge!("relayd_target_healthy", "target" => self.0.addr.clone()).set(1.0);
        self.notify_state_change(TargetState::Healthy);
    }

    /// The health-check consumer callback: on the first success this target
    /// flips `Adding -> Healthy`. Later results (success or failure) are
    /// no-ops — this spec models no automatic demotion back out of healthy.
    fn handle_health_check_result(&self, success: bool) {
        if !success {
            return;
        }
        let became_healthy = {
            let mut st = self.0.state.lock().unwrap();
            if st.state == TargetState::Adding {
                st.state = TargetState::Healthy;
                true
            } else {
                false
            }
        };
        if became_healthy {
            self.fire_became_healthy();
        }
    }

    /// Used by `Router::restore_from_state`: assumes the target healthy
    /// immediately at startup rather than waiting out a deploy timeout. The
    /// normal probe loop then confirms or — in a richer state model —
    /// demotes it.
    pub fn assume_healthy(&self) {
        {
            let mut st = self.0.state.lock().unwrap();
            st.state = TargetState::Healthy;
        }
        self.fire_became_healthy();
    }

    #[cfg(test)]
    pub fn force_healthy_for_test(&self) {
        self.assume_healthy();
    }

    /// Returns `true` once this target's first successful health check has
    /// landed, or `false` if `timeout` elapses first.
    pub async fn wait_until_healthy(&self, timeout: Duration) -> bool {
        if self.0.became_healthy_fired.load(Ordering::Acquire) {
            return true;
        }
        let notified = self.0.became_healthy.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.0.became_healthy_fired.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    pub fn is_health_check_request(&self, method: &Method, path: &str) -> bool {
        *method == Method::GET && path == self.0.options.health_check.path
    }

    /// Registers an in-flight entry and fails with `Draining` if this target
    /// is currently being drained.
    pub fn start_request(&self) -> Result<InflightGuard, ProxyError> {
        if self.state() == TargetState::Draining {
            return Err(ProxyError::Draining);
        }
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let hijacked = Arc::new(AtomicBool::new(false));
        self.0.inflight.lock().unwrap().insert(
            id,
            InflightRecord {
                cancel: cancel.clone(),
                hijacked: hijacked.clone(),
            },
        );
        Ok(InflightGuard {
            inner: Arc::downgrade(&self.0),
            id,
            cancel,
            hijacked,
        })
    }

    fn rewrite_uri(&self, uri: &http::Uri) -> http::Uri {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let rebuilt = format!("{}://{}{}", self.0.scheme, self.0.addr, path_and_query);
        rebuilt.parse().unwrap_or_else(|_| uri.clone())
    }

    /// Forwards `req` to this target. Applies the outbound rewrite policy,
    /// enforces `response_header_timeout`, and races the attempt against the
    /// guard's cancellation (set when a drain forcibly cancels an in-flight
    /// request). A request whose response carries an `Upgrade` header, or
    /// whose response is `text/event-stream`, is marked hijacked so a later
    /// drain cancels it immediately instead of waiting out its timeout.
    pub async fn send_request(
        &self,
        guard: &InflightGuard,
        client_ip: IpAddr,
        request_host: &str,
        mut req: Request<BoxBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        *req.uri_mut() = self.rewrite_uri(req.uri());
        apply_forwarded_headers(req.headers_mut(), client_ip, request_host, self.0.options.forward_headers);

        if has_upgrade_header(req.headers()) {
            guard.mark_hijacked();
        }

        let timeout = self.0.options.response_header_timeout;
        tokio::select! {
            biased;
            _ = guard.cancelled() => Err(ProxyError::Draining),
            result = tokio::time::timeout(timeout, self.0.client.request(req)) => {
                match result {
                    Ok(Ok(resp)) => {
                        if is_event_stream(&resp) {
                            guard.mark_hijacked();
                        }
                        Ok(resp)
                    }
                    Ok(Err(e)) => Err(ProxyError::BadGateway(e.to_string())),
                    Err(_) => Err(ProxyError::GatewayTimeout),
                }
            }
        }
    }

    /// Transitions to `Draining`, cancels every hijacked in-flight entry
    /// immediately, waits up to `timeout` for the rest to finish, cancels
    /// whatever remains, then restores the pre-drain state.
    pub async fn drain(&self, timeout: Duration) {
        let previous = {
            let mut st = self.0.state.lock().unwrap();
            let previous = st.state;
            st.pre_drain = Some(previous);
            st.state = TargetState::Draining;
            previous
        };
        metrics::counter!("relayd_target_drains_total").increment(1);
        metrics::gauge!("relayd_target_healthy", "target" => self.0.addr.clone()).set(0.0);

        {
            let inflight = self.0.inflight.lock().unwrap();
            for record in inflight.values() {
                if record.hijacked.load(Ordering::Acquire) {
                    record.cancel.cancel();
                }
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.0.inflight.lock().unwrap().is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        {
            let inflight = self.0.inflight.lock().unwrap();
            for record in inflight.values() {
                record.cancel.cancel();
            }
        }

        {
            let mut st = self.0.state.lock().unwrap();
            st.state = previous;
            st.pre_drain = None;
        }
        if previous == TargetState::Healthy {
            metrics::gauge!("relayd_target_healthy", "target" => self.0.addr.clone()).set(1.0);
        }
        self.notify_state_change(previous);
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.0.inflight.lock().unwrap().len()
    }
}

struct TargetHealthConsumer(Target);

impl HealthCheckConsumer for TargetHealthConsumer {
    fn on_health_check_result(&self, success: bool) {
        self.0.handle_health_check_result(success);
    }
}

/// RAII in-flight entry. Dropping it deregisters from the owning target's
/// in-flight table — the invariant "empty iff no request holds an un-ended
/// request on that target" holds even on early return or panic unwind.
pub struct InflightGuard {
    inner: Weak<Inner>,
    id: u64,
    cancel: CancellationToken,
    hijacked: Arc<AtomicBool>,
}

impl InflightGuard {
    pub fn mark_hijacked(&self) {
        self.hijacked.store(true, Ordering::Release);
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.inflight.lock().unwrap().remove(&self.id);
        }
    }
}

/// Wraps a response body together with the `InflightGuard` that started it,
/// so the in-flight entry stays alive for the lifetime of the body stream
/// (not just until headers are returned) — the mechanism by which a drain
/// can still find and cancel a long-lived WebSocket/SSE response.
pub struct GuardedBody<B> {
    inner: B,
    _guard: InflightGuard,
}

impl<B> GuardedBody<B> {
    pub fn new(inner: B, guard: InflightGuard) -> Self {
        Self { inner, _guard: guard }
    }
}

impl<B> http_body::Body for GuardedBody<B>
where
    B: http_body::Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        std::pin::Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

fn has_upgrade_header(headers: &HeaderMap) -> bool {
    let has_upgrade_token = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade_token && headers.contains_key(http::header::UPGRADE)
}

fn is_event_stream(resp: &Response<Incoming>) -> bool {
    resp.headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Outbound rewrite policy for forwarded headers: when `forward_headers` is
/// set, inbound `X-Forwarded-*` values are preserved and the client IP is
/// appended to `X-Forwarded-For`; otherwise inbound values are cleared and
/// fresh ones are set. The inbound `Host` header itself is left untouched by
/// this function — it is never rewritten, per the target's rewrite policy.
fn apply_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr, request_host: &str, forward_headers: bool) {
    const XFF: &str = "x-forwarded-for";
    const XFP: &str = "x-forwarded-proto";
    const XFH: &str = "x-forwarded-host";

    let ip = client_ip.to_string();

    if forward_headers {
        if let Some(existing) = headers.get(XFF).and_then(|v| v.to_str().ok()) {
            let combined = format!("{}, {}", existing, ip);
            if let Ok(v) = HeaderValue::from_str(&combined) {
                headers.insert(XFF, v);
            }
        } else if let Ok(v) = HeaderValue::from_str(&ip) {
            headers.insert(XFF, v);
        }
        if !headers.contains_key(XFP) {
            headers.insert(XFP, HeaderValue::from_static("http"));
        }
        if !headers.contains_key(XFH) {
            if let Ok(v) = HeaderValue::from_str(request_host) {
                headers.insert(XFH, v);
            }
        }
    } else {
        headers.remove(XFF);
        headers.remove(XFP);
        headers.remove(XFH);
        if let Ok(v) = HeaderValue::from_str(&ip) {
            headers.insert(XFF, v);
        }
        headers.insert(XFP, HeaderValue::from_static("http"));
        if let Ok(v) = HeaderValue::from_str(request_host) {
            headers.insert(XFH, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;

    fn test_target(addr: &str) -> Target {
        Target::new(addr.to_string(), "http".to_string(), TargetOptions::default(), build_http_client())
    }

    #[test]
    fn new_target_starts_adding() {
        let t = test_target("127.0.0.1:1");
        assert_eq!(t.state(), TargetState::Adding);
    }

    #[test]
    fn start_request_fails_while_draining() {
        let t = test_target("127.0.0.1:1");
        t.0.state.lock().unwrap().state = TargetState::Draining;
        assert!(matches!(t.start_request(), Err(ProxyError::Draining)));
    }

    #[test]
    fn rewrite_uri_preserves_path_and_query() {
        let t = test_target("backend:9000");
        let uri: http::Uri = "http://original-host/app/show?a=b;c=d".parse().unwrap();
        let rewritten = t.rewrite_uri(&uri);
        assert_eq!(rewritten.scheme_str(), Some("http"));
        assert_eq!(rewritten.authority().map(|a| a.as_str()), Some("backend:9000"));
        assert_eq!(rewritten.path_and_query().map(|pq| pq.as_str()), Some("/app/show?a=b;c=d"));
    }

    #[test]
    fn is_health_check_request_matches_configured_path() {
        let t = test_target("127.0.0.1:1");
        assert!(t.is_health_check_request(&Method::GET, "/up"));
        assert!(!t.is_health_check_request(&Method::POST, "/up"));
        assert!(!t.is_health_check_request(&Method::GET, "/other"));
    }

    #[test]
    fn forward_headers_true_appends_client_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        apply_forwarded_headers(&mut headers, "2.2.2.2".parse().unwrap(), "example.com", true);
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "1.1.1.1, 2.2.2.2");
    }

    #[test]
    fn forward_headers_false_clears_inbound_and_sets_fresh() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("spoofed"));
        apply_forwarded_headers(&mut headers, "2.2.2.2".parse().unwrap(), "example.com", false);
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "2.2.2.2");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "example.com");
    }

    #[tokio::test]
    async fn assume_healthy_flips_state_and_fires_became_healthy() {
        let t = test_target("127.0.0.1:1");
        assert_eq!(t.state(), TargetState::Adding);
        t.assume_healthy();
        assert_eq!(t.state(), TargetState::Healthy);
        assert!(t.wait_until_healthy(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn drain_with_no_inflight_completes_immediately_and_restores_state() {
        let t = test_target("127.0.0.1:1");
        t.assume_healthy();
        t.drain(Duration::from_millis(50)).await;
        assert_eq!(t.state(), TargetState::Healthy);
    }

    #[tokio::test]
    async fn start_request_guard_deregisters_on_drop() {
        let t = test_target("127.0.0.1:1");
        t.assume_healthy();
        {
            let _guard = t.start_request().unwrap();
            assert_eq!(t.in_flight_count(), 1);
        }
        assert_eq!(t.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_inflight_then_restores() {
        let t = test_target("127.0.0.1:1");
        t.assume_healthy();
        let guard = t.start_request().unwrap();
        let t2 = t.clone();
        let drain = tokio::spawn(async move { t2.drain(Duration::from_millis(200)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        drain.await.unwrap();
        assert_eq!(t.state(), TargetState::Healthy);
    }

    async fn spawn_echo_server() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let svc = service_fn(|_req: Request<Incoming>| async move {
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(200)
                                .body(crate::body::full_body("ok"))
                                .unwrap(),
                        )
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .http1()
                        .serve_connection(io, svc)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn send_request_forwards_to_rewritten_target() {
        let addr = spawn_echo_server().await;
        let t = test_target(&addr.to_string());
        t.assume_healthy();
        let guard = t.start_request().unwrap();

        let req = Request::builder()
            .method("GET")
            .uri("http://original-host/anything")
            .body(crate::body::empty_body())
            .unwrap();

        let resp = t
            .send_request(&guard, "127.0.0.1".parse().unwrap(), "original-host", req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }
}
