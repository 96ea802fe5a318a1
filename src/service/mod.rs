//! Composes one named service's active load balancer, optional rollout
//! balancer, pause controller, and the fixed request-handling pipeline:
//! pause gate -> request-id/request-start stamping -> body-size gate ->
//! target selection -> optional request buffering for reproxy -> rewrite ->
//! forward -> reproxy retry -> cookie rewriting -> response.

use crate::body::BoxBody;
use crate::buffer::{BufferConfig, Rewindable};
use crate::error::ProxyError;
use crate::helpers::{cookie_scope, reproxy, rollout};
use crate::loadbalance::{self, LoadBalancer, SelectContext};
use crate::pause::{PauseController, WaitResult};
use arc_swap::ArcSwap;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// 0 = unlimited. Enforced against `Content-Length` before a target is
    /// even selected.
    pub max_request_body_bytes: u64,
    pub request_timeout: Duration,
    pub reproxy: reproxy::ReproxyConfig,
    /// This service is mounted below the root path on at least one host —
    /// outgoing `Set-Cookie` paths get rewritten and the matched prefix is
    /// stripped from the forwarded request path.
    pub strip_path_prefix: bool,
    pub tls_enabled: bool,
    pub tls_disable_redirect: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_request_body_bytes: 0,
            request_timeout: Duration::from_secs(30),
            reproxy: reproxy::ReproxyConfig::default(),
            strip_path_prefix: false,
            tls_enabled: false,
            tls_disable_redirect: false,
        }
    }
}

pub struct Service {
    pub name: String,
    balancer: ArcSwap<LoadBalancer>,
    rollout_balancer: Mutex<Option<Arc<LoadBalancer>>>,
    rollout: Mutex<Option<rollout::RolloutConfig>>,
    pause: PauseController,
    options: Mutex<ServiceOptions>,
}

impl Service {
    pub fn new(name: String, balancer: Arc<LoadBalancer>, options: ServiceOptions) -> Arc<Self> {
        Arc::new(Self {
            name,
            balancer: ArcSwap::from(balancer),
            rollout_balancer: Mutex::new(None),
            rollout: Mutex::new(None),
            pause: PauseController::new(),
            options: Mutex::new(options),
        })
    }

    /// Atomically swaps in a new active balancer — readers mid-request keep
    /// using the `Arc` they already loaded.
    pub fn set_active_balancer(&self, balancer: Arc<LoadBalancer>) {
        self.balancer.store(balancer);
    }

    pub fn active_balancer(&self) -> Arc<LoadBalancer> {
        self.balancer.load_full()
    }

    pub fn set_rollout(&self, balancer: Option<Arc<LoadBalancer>>, config: Option<rollout::RolloutConfig>) {
        *self.rollout_balancer.lock().unwrap() = balancer;
        *self.rollout.lock().unwrap() = config;
    }

    pub fn set_options(&self, options: ServiceOptions) {
        *self.options.lock().unwrap() = options;
    }

    pub fn options(&self) -> ServiceOptions {
        self.options.lock().unwrap().clone()
    }

    pub fn pause(&self, fail_after: Duration) {
        self.pause.pause(fail_after);
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    pub fn stop(&self, message: impl Into<String>) {
        self.pause.stop(message);
    }

    /// `(paused, stopped, stop_message)` — used to persist pause state
    /// across restarts.
    pub fn pause_snapshot(&self) -> (bool, bool, String) {
        self.pause.snapshot()
    }

    /// Fans drain out to every target of the active balancer (and the
    /// rollout balancer, if one is configured) — used when this service is
    /// being removed or its targets replaced.
    pub async fn drain(&self, timeout: Duration) {
        self.active_balancer().drain_all(timeout).await;
        if let Some(rollout) = self.rollout_balancer.lock().unwrap().clone() {
            rollout.drain_all(timeout).await;
        }
    }

    /// Runs the full request pipeline and returns the response to write back
    /// to the client. `matched_path_prefix` and `request_host` come from the
    /// service-map lookup that routed to this service.
    pub async fn handle(
        self: &Arc<Self>,
        mut req: Request<Incoming>,
        client_ip: IpAddr,
        matched_path_prefix: &str,
        request_host: &str,
    ) -> Result<Response<BoxBody>, ProxyError> {
        match self.pause.wait().await {
            WaitResult::Proceed => {}
            WaitResult::TimedOut => return Err(ProxyError::PauseTimedOut),
            WaitResult::Stopped(msg) => return Err(ProxyError::ServiceStopped(msg)),
        }

        stamp_request_id(&mut req);
        stamp_request_start(&mut req);

        let options = self.options();
        if let Some(len) = content_length(&req) {
            if options.max_request_body_bytes > 0 && len > options.max_request_body_bytes {
                return Err(ProxyError::RequestEntityTooLarge);
            }
        }

        let is_websocket_upgrade = is_websocket_upgrade(&req);
        let cookies = parse_cookies(&req);
        let written_cookie_valid = cookies
            .get(loadbalance::WRITTEN_COOKIE)
            .map(|v| loadbalance::written_cookie_is_valid(v))
            .unwrap_or(false);
        let writer_cookie = cookies.get(loadbalance::WRITER_COOKIE).cloned();

        let balancer = self.select_balancer(&cookies);

        let ctx = SelectContext {
            method: req.method(),
            is_websocket_upgrade,
            reproxy_to_host: None,
            writer_cookie: writer_cookie.as_deref(),
            written_cookie_valid,
        };
        let mut selection = balancer.select(&ctx)?;

        if selection.target.is_health_check_request(req.method(), req.uri().path()) {
            let (parts, _body) = req.into_parts();
            let passthrough = Request::from_parts(parts, crate::body::empty_body());
            let resp = selection
                .target
                .send_request(&selection.guard, client_ip, request_host, passthrough)
                .await?;
            let (parts, body) = resp.into_parts();
            let guarded = crate::target::GuardedBody::new(body, selection.guard);
            return Ok(Response::from_parts(parts, guarded.boxed()));
        }

        let buffer_config = BufferConfig {
            max_bytes: options.max_request_body_bytes,
            ..BufferConfig::default()
        };
        let method = req.method().clone();
        let (parts, body) = req.into_parts();
        let mut request_buffer = Rewindable::new(buffer_config);
        capture_request_body(&mut request_buffer, body).await?;

        let path_prefix = if options.strip_path_prefix {
            matched_path_prefix
        } else {
            ""
        };
        let outbound_uri = strip_prefix_from_uri(&parts.uri, path_prefix);

        let mut retries_remaining = options.reproxy.max_retries;
        let outcome = loop {
            let body_bytes = match request_buffer.rewind_bytes().await {
                Ok(b) => b,
                Err(e) => break Err(e),
            };
            let mut outbound = Request::builder()
                .method(method.clone())
                .uri(outbound_uri.clone())
                .version(parts.version)
                .body(crate::body::full_body(body_bytes))
                .expect("well-formed outbound request");
            *outbound.headers_mut() = parts.headers.clone();
            loadbalance::set_target_header(
                outbound.headers_mut(),
                selection.target.addr(),
                balancer.forward_headers(),
            );
            reproxy::mark_request(&mut outbound);

            let resp = match selection
                .target
                .send_request(&selection.guard, client_ip, request_host, outbound)
                .await
            {
                Ok(resp) => resp,
                Err(e) => break Err(e),
            };

            if let Some(location) = reproxy::reproxy_location(&resp) {
                if retries_remaining > 0 {
                    retries_remaining -= 1;
                    let retry_ctx = SelectContext {
                        method: &method,
                        is_websocket_upgrade,
                        reproxy_to_host: Some(&location),
                        writer_cookie: writer_cookie.as_deref(),
                        written_cookie_valid,
                    };
                    match balancer.select(&retry_ctx) {
                        Ok(next) => {
                            selection = next;
                            continue;
                        }
                        Err(_) => break Err(ProxyError::NoHealthyTargets),
                    }
                }
                break Err(ProxyError::NoHealthyTargets);
            }

            let is_write = selection.is_write;
            let guard = selection.guard;
            break Ok(finish_response(resp, guard, is_write, &balancer, path_prefix, request_host));
        };

        request_buffer.dispose().await;
        outcome
    }

    fn select_balancer(&self, cookies: &HashMap<String, String>) -> Arc<LoadBalancer> {
        let rollout_config = self.rollout.lock().unwrap().clone();
        let rollout_balancer = self.rollout_balancer.lock().unwrap().clone();
        match (rollout_config, rollout_balancer) {
            (Some(config), Some(balancer)) => match cookies.get(&config.cookie_name) {
                Some(token) if rollout::should_route_to_rollout(&config, token) => balancer,
                _ => self.active_balancer(),
            },
            _ => self.active_balancer(),
        }
    }
}

/// Strips `path_prefix` from `uri`'s path (boundary-aligned, same rule as
/// service-map matching) and preserves the raw query string untouched. A
/// prefix that leaves nothing behind forwards `/`.
fn strip_prefix_from_uri(uri: &http::Uri, path_prefix: &str) -> http::Uri {
    if path_prefix.is_empty() || path_prefix == "/" {
        return uri.clone();
    }
    let path = uri.path();
    let stripped = path
        .strip_prefix(path_prefix)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(path);
    let new_path = if stripped.is_empty() { "/" } else { stripped };
    let rebuilt = match uri.query() {
        Some(q) => format!("{}?{}", new_path, q),
        None => new_path.to_string(),
    };
    rebuilt.parse().unwrap_or_else(|_| uri.clone())
}

/// Drains `body` into `buffer` so it can be replayed on a reproxy retry.
async fn capture_request_body(buffer: &mut Rewindable, body: Incoming) -> Result<(), ProxyError> {
    buffer.capture(body).await.map_err(|e| {
        if matches!(e, ProxyError::MaxExceeded) {
            ProxyError::RequestEntityTooLarge
        } else {
            e
        }
    })?;
    Ok(())
}

fn finish_response(
    resp: Response<hyper::body::Incoming>,
    guard: crate::target::InflightGuard,
    is_write: bool,
    balancer: &LoadBalancer,
    path_prefix: &str,
    request_host: &str,
) -> Response<BoxBody> {
    let (mut parts, body) = resp.into_parts();

    if is_write {
        loadbalance::maybe_set_written_cookie(&mut parts.headers, balancer.writer_affinity_timeout());
    }

    if !path_prefix.is_empty() {
        let mut set_cookies: Vec<HeaderValue> = parts
            .headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .cloned()
            .collect();
        if !set_cookies.is_empty() {
            cookie_scope::apply(&mut set_cookies, path_prefix, request_host);
            parts.headers.remove(http::header::SET_COOKIE);
            for v in set_cookies {
                parts.headers.append(http::header::SET_COOKIE, v);
            }
        }
    }

    let guarded = crate::target::GuardedBody::new(body, guard);
    Response::from_parts(parts, guarded.boxed())
}

fn stamp_request_id(req: &mut Request<Incoming>) {
    if !req.headers().contains_key("x-request-id") {
        let id = uuid::Uuid::new_v4().to_string();
        if let Ok(v) = HeaderValue::from_str(&id) {
            req.headers_mut().insert("x-request-id", v);
        }
    }
}

fn stamp_request_start(req: &mut Request<Incoming>) {
    if !req.headers().contains_key("x-request-start") {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        if let Ok(v) = HeaderValue::from_str(&format!("t={}", now_ms)) {
            req.headers_mut().insert("x-request-start", v);
        }
    }
}

fn content_length(req: &Request<Incoming>) -> Option<u64> {
    req.headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let has_upgrade_token = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let is_websocket = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    has_upgrade_token && is_websocket
}

fn parse_cookies(req: &Request<Incoming>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(raw) = req.headers().get(http::header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in raw.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                out.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    out
}

pub fn status_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(crate::body::full_body(message.to_string()))
        .expect("well-formed status response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cookies_splits_semicolon_pairs() {
        let req = Request::builder()
            .header(http::header::COOKIE, "a=1; b=2")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        let mut map = HashMap::new();
        if let Some(raw) = parts.headers.get(http::header::COOKIE).and_then(|v| v.to_str().ok()) {
            for pair in raw.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    map.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }
        assert_eq!(map.get("a"), Some(&"1".to_string()));
        assert_eq!(map.get("b"), Some(&"2".to_string()));
    }

    #[test]
    fn select_balancer_routes_absent_rollout_cookie_to_active() {
        let active = LoadBalancer::new(vec![], vec![], loadbalance::LoadBalancerOptions::default());
        let rollout_balancer = LoadBalancer::new(vec![], vec![], loadbalance::LoadBalancerOptions::default());
        let service = Service::new("svc".to_string(), active.clone(), ServiceOptions::default());
        service.set_rollout(
            Some(rollout_balancer.clone()),
            Some(rollout::RolloutConfig {
                percentage: 100,
                ..Default::default()
            }),
        );

        let balancer = service.select_balancer(&HashMap::new());
        assert!(Arc::ptr_eq(&balancer, &active));
    }

    #[test]
    fn select_balancer_routes_present_rollout_cookie_by_percentage() {
        let active = LoadBalancer::new(vec![], vec![], loadbalance::LoadBalancerOptions::default());
        let rollout_balancer = LoadBalancer::new(vec![], vec![], loadbalance::LoadBalancerOptions::default());
        let service = Service::new("svc".to_string(), active.clone(), ServiceOptions::default());
        let config = rollout::RolloutConfig {
            percentage: 100,
            ..Default::default()
        };
        service.set_rollout(Some(rollout_balancer.clone()), Some(config.clone()));

        let mut cookies = HashMap::new();
        cookies.insert(config.cookie_name.clone(), "any-token".to_string());
        let balancer = service.select_balancer(&cookies);
        assert!(Arc::ptr_eq(&balancer, &rollout_balancer));
    }

    #[test]
    fn is_websocket_upgrade_requires_both_headers() {
        let req = Request::builder()
            .header(http::header::CONNECTION, "Upgrade")
            .header(http::header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        let has_upgrade_token = parts
            .headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        assert!(has_upgrade_token);
    }
}
