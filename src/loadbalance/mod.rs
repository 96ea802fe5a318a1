//! Per-service load balancer: writer/reader target pools, writer-affinity
//! stickiness, and reproxy-aware dynamic routing.

use crate::error::ProxyError;
use crate::target::{InflightGuard, Target, TargetState};
use http::{HeaderMap, HeaderValue, Method};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

pub const WRITTEN_COOKIE: &str = "kamal-written";
pub const WRITER_COOKIE: &str = "kamal-writer";
pub const TARGET_HEADER: &str = "x-kamal-target";
pub const WRITER_AFFINITY_HEADER: &str = "x-writer-affinity";

#[derive(Debug, Clone)]
pub struct LoadBalancerOptions {
    /// 0 disables writer-affinity stickiness entirely.
    pub writer_affinity_timeout: Duration,
    pub allow_readers_websockets: bool,
    pub dynamic_reproxy: bool,
    pub forward_headers: bool,
    /// Target selected for writes when no `kamal-writer` cookie is present
    /// and dynamic routing is enabled.
    pub default_writer: Option<String>,
}

impl Default for LoadBalancerOptions {
    fn default() -> Self {
        Self {
            writer_affinity_timeout: Duration::ZERO,
            allow_readers_websockets: false,
            dynamic_reproxy: false,
            forward_headers: true,
            default_writer: None,
        }
    }
}

/// Per-request hints the load balancer needs that only the service (which
/// parses cookies/headers) can supply.
pub struct SelectContext<'a> {
    pub method: &'a Method,
    pub is_websocket_upgrade: bool,
    /// Host injected by the reproxy middleware via the request's context,
    /// when a prior attempt asked to be re-forwarded elsewhere.
    pub reproxy_to_host: Option<&'a str>,
    /// Value of an inbound `kamal-writer` cookie, if any.
    pub writer_cookie: Option<&'a str>,
    /// Whether an inbound `kamal-written` cookie is present and unexpired.
    pub written_cookie_valid: bool,
}

pub struct Selection {
    pub guard: InflightGuard,
    pub target: Target,
    pub is_write: bool,
}

/// A GET/HEAD that is not a WebSocket upgrade is a read, unless the service
/// explicitly allows readers to serve WebSockets.
pub fn classify_read(method: &Method, is_websocket_upgrade: bool, allow_readers_websockets: bool) -> bool {
    let is_get_or_head = *method == Method::GET || *method == Method::HEAD;
    is_get_or_head && (!is_websocket_upgrade || allow_readers_websockets)
}

struct Pools {
    writers: Vec<Target>,
    readers: Vec<Target>,
    writer_idx: AtomicUsize,
    reader_idx: AtomicUsize,
}

pub struct LoadBalancer {
    pools: Mutex<Pools>,
    options: LoadBalancerOptions,
    became_healthy: Notify,
    became_healthy_fired: std::sync::atomic::AtomicBool,
}

impl LoadBalancer {
    pub fn new(writers: Vec<Target>, readers: Vec<Target>, options: LoadBalancerOptions) -> Arc<Self> {
        let lb = Arc::new(Self {
            pools: Mutex::new(Pools {
                writers,
                readers,
                writer_idx: AtomicUsize::new(0),
                reader_idx: AtomicUsize::new(0),
            }),
            options,
            became_healthy: Notify::new(),
            became_healthy_fired: std::sync::atomic::AtomicBool::new(false),
        });
        lb.wire_callbacks();
        lb
    }

    fn wire_callbacks(self: &Arc<Self>) {
        let pools = self.pools.lock().unwrap();
        let weak: Weak<LoadBalancer> = Arc::downgrade(self);
        for t in pools.writers.iter().chain(pools.readers.iter()) {
            let weak = weak.clone();
            t.set_on_state_change(move |_state| {
                if let Some(lb) = weak.upgrade() {
                    lb.on_target_state_changed();
                }
            });
        }
    }

    /// Rebuilds the healthy view and, if the balancer now has exactly one
    /// healthy writer, stops its health checks — there is no value in
    /// re-routing a singleton. Signals the one-shot became-healthy
    /// condition once every target is healthy.
    fn on_target_state_changed(&self) {
        let pools = self.pools.lock().unwrap();
        let all_healthy = pools
            .writers
            .iter()
            .chain(pools.readers.iter())
            .all(|t| t.state() == TargetState::Healthy);

        if pools.writers.len() == 1 && pools.writers[0].state() == TargetState::Healthy {
            pools.writers[0].close_health_checks();
        }
        drop(pools);

        if all_healthy && !self.became_healthy_fired.swap(true, Ordering::AcqRel) {
            self.became_healthy.notify_waiters();
        }
    }

    pub async fn wait_until_healthy(&self, timeout: Duration) -> bool {
        if self.became_healthy_fired.load(Ordering::Acquire) {
            return true;
        }
        let notified = self.became_healthy.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.became_healthy_fired.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    /// Fans `Drain(timeout)` out over every target in the balancer and
    /// waits for all of them.
    pub async fn drain_all(&self, timeout: Duration) {
        let targets: Vec<Target> = {
            let pools = self.pools.lock().unwrap();
            pools.writers.iter().chain(pools.readers.iter()).cloned().collect()
        };
        let drains = targets.iter().map(|t| t.drain(timeout));
        futures_util::future::join_all(drains).await;
    }

    fn healthy(targets: &[Target]) -> Vec<&Target> {
        targets.iter().filter(|t| t.state() == TargetState::Healthy).collect()
    }

    fn round_robin<'a>(list: &[&'a Target], idx: &AtomicUsize) -> Option<&'a Target> {
        if list.is_empty() {
            return None;
        }
        let i = idx.fetch_add(1, Ordering::Relaxed) % list.len();
        Some(list[i])
    }

    pub fn select(&self, ctx: &SelectContext) -> Result<Selection, ProxyError> {
        let is_read = classify_read(ctx.method, ctx.is_websocket_upgrade, self.options.allow_readers_websockets);
        let pools = self.pools.lock().unwrap();
        let healthy_writers = Self::healthy(&pools.writers);
        let healthy_readers = Self::healthy(&pools.readers);

        // Reproxy: a prior attempt asked to be re-forwarded to a specific host.
        if self.options.dynamic_reproxy {
            if let Some(host) = ctx.reproxy_to_host {
                let target = healthy_writers
                    .iter()
                    .chain(healthy_readers.iter())
                    .find(|t| t.addr() == host)
                    .copied();
                if let Some(target) = target {
                    let guard = target.start_request()?;
                    return Ok(Selection {
                        guard,
                        target: target.clone(),
                        is_write: !is_read,
                    });
                }
            }
        }

        if !is_read {
            if self.options.dynamic_reproxy {
                if let Some(writer_host) = ctx.writer_cookie {
                    if let Some(target) = healthy_writers.iter().find(|t| t.addr() == writer_host).copied() {
                        let guard = target.start_request()?;
                        return Ok(Selection { guard, target: target.clone(), is_write: true });
                    }
                }
                if let Some(default_addr) = &self.options.default_writer {
                    if let Some(target) = healthy_writers.iter().find(|t| t.addr() == default_addr).copied() {
                        let guard = target.start_request()?;
                        return Ok(Selection { guard, target: target.clone(), is_write: true });
                    }
                }
            }

            let target = Self::round_robin(&healthy_writers, &pools.writer_idx)
                .ok_or(ProxyError::NoHealthyTargets)?;
            let guard = target.start_request()?;
            return Ok(Selection { guard, target: target.clone(), is_write: true });
        }

        // Reads: writer affinity routes to writers when a recent write was observed.
        if ctx.written_cookie_valid && !healthy_writers.is_empty() {
            let target = Self::round_robin(&healthy_writers, &pools.writer_idx)
                .ok_or(ProxyError::NoHealthyTargets)?;
            let guard = target.start_request()?;
            return Ok(Selection { guard, target: target.clone(), is_write: false });
        }

        let (pool, idx) = if !healthy_readers.is_empty() {
            (healthy_readers, &pools.reader_idx)
        } else {
            (healthy_writers, &pools.writer_idx)
        };
        let target = Self::round_robin(&pool, idx).ok_or(ProxyError::NoHealthyTargets)?;
        let guard = target.start_request()?;
        Ok(Selection { guard, target: target.clone(), is_write: false })
    }

    pub fn forward_headers(&self) -> bool {
        self.options.forward_headers
    }

    pub fn writer_affinity_timeout(&self) -> Duration {
        self.options.writer_affinity_timeout
    }

    pub fn has_readers(&self) -> bool {
        !self.pools.lock().unwrap().readers.is_empty()
    }

    /// `(addr, state)` for every writer and reader target, for admin/status
    /// reporting. Not used on the request path.
    pub fn target_statuses(&self) -> (Vec<(String, TargetState)>, Vec<(String, TargetState)>) {
        let pools = self.pools.lock().unwrap();
        let writers = pools.writers.iter().map(|t| (t.addr().to_string(), t.state())).collect();
        let readers = pools.readers.iter().map(|t| (t.addr().to_string(), t.state())).collect();
        (writers, readers)
    }
}

/// Sets `X-Kamal-Target: <host:port>`, appending to any existing value when
/// `forward_headers` is set.
pub fn set_target_header(headers: &mut HeaderMap, target_addr: &str, forward_headers: bool) {
    if forward_headers {
        if let Some(existing) = headers.get(TARGET_HEADER).and_then(|v| v.to_str().ok()) {
            let combined = format!("{}, {}", existing, target_addr);
            if let Ok(v) = HeaderValue::from_str(&combined) {
                headers.insert(TARGET_HEADER, v);
                return;
            }
        }
    }
    if let Ok(v) = HeaderValue::from_str(target_addr) {
        headers.insert(TARGET_HEADER, v);
    }
}

/// Sets the `kamal-written` stickiness cookie on a response to a write,
/// unless the backend suppressed it via `X-Writer-Affinity: false`.
pub fn maybe_set_written_cookie(headers: &mut HeaderMap, timeout: Duration) {
    if timeout.is_zero() {
        return;
    }
    if headers
        .get(WRITER_AFFINITY_HEADER)
        .and_then(|v| v.to_str().ok())
        == Some("false")
    {
        return;
    }
    let expiry_ms = (SystemTime::now() + timeout)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let cookie = format!("{}={}; Path=/; HttpOnly", WRITTEN_COOKIE, expiry_ms);
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        headers.append(http::header::SET_COOKIE, v);
    }
}

/// True iff a `kamal-written=<expiry-ms>` cookie value has not yet expired.
pub fn written_cookie_is_valid(value: &str) -> bool {
    let Ok(expiry_ms) = value.parse::<u128>() else {
        return false;
    };
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    now_ms < expiry_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{build_http_client, TargetOptions};

    fn healthy_target(addr: &str) -> Target {
        let t = Target::new(addr.to_string(), "http".to_string(), TargetOptions::default(), build_http_client());
        t.force_healthy_for_test();
        t
    }

    #[test]
    fn classify_read_get_is_read() {
        assert!(classify_read(&Method::GET, false, false));
        assert!(!classify_read(&Method::POST, false, false));
    }

    #[test]
    fn classify_read_websocket_upgrade_is_write_unless_allowed() {
        assert!(!classify_read(&Method::GET, true, false));
        assert!(classify_read(&Method::GET, true, true));
    }

    #[test]
    fn written_cookie_validity() {
        let future_ms = (SystemTime::now() + Duration::from_secs(60))
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        assert!(written_cookie_is_valid(&future_ms.to_string()));
        assert!(!written_cookie_is_valid("1"));
        assert!(!written_cookie_is_valid("not-a-number"));
    }

    #[test]
    fn writer_affinity_read_routes_to_writer() {
        let writer = healthy_target("writer:80");
        let reader = healthy_target("reader:80");
        let lb = LoadBalancer::new(vec![writer], vec![reader], LoadBalancerOptions {
            writer_affinity_timeout: Duration::from_secs(10),
            ..Default::default()
        });

        let ctx = SelectContext {
            method: &Method::GET,
            is_websocket_upgrade: false,
            reproxy_to_host: None,
            writer_cookie: None,
            written_cookie_valid: true,
        };
        let selection = lb.select(&ctx).unwrap();
        assert_eq!(selection.target.addr(), "writer:80");
    }

    #[test]
    fn read_without_affinity_routes_to_reader() {
        let writer = healthy_target("writer:80");
        let reader = healthy_target("reader:80");
        let lb = LoadBalancer::new(vec![writer], vec![reader], LoadBalancerOptions::default());

        let ctx = SelectContext {
            method: &Method::GET,
            is_websocket_upgrade: false,
            reproxy_to_host: None,
            writer_cookie: None,
            written_cookie_valid: false,
        };
        let selection = lb.select(&ctx).unwrap();
        assert_eq!(selection.target.addr(), "reader:80");
    }

    #[test]
    fn write_routes_to_writer() {
        let writer = healthy_target("writer:80");
        let lb = LoadBalancer::new(vec![writer], vec![], LoadBalancerOptions::default());
        let ctx = SelectContext {
            method: &Method::POST,
            is_websocket_upgrade: false,
            reproxy_to_host: None,
            writer_cookie: None,
            written_cookie_valid: false,
        };
        let selection = lb.select(&ctx).unwrap();
        assert_eq!(selection.target.addr(), "writer:80");
        assert!(selection.is_write);
    }

    #[test]
    fn no_healthy_targets_fails() {
        let lb = LoadBalancer::new(vec![], vec![], LoadBalancerOptions::default());
        let ctx = SelectContext {
            method: &Method::GET,
            is_websocket_upgrade: false,
            reproxy_to_host: None,
            writer_cookie: None,
            written_cookie_valid: false,
        };
        assert!(matches!(lb.select(&ctx), Err(ProxyError::NoHealthyTargets)));
    }
}
