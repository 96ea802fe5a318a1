//! Periodic probe -> boolean success stream to a consumer. Lifetime is
//! bound by `close`, which cancels the current probe and terminates the
//! probe loop promptly.

use crate::body::empty_body;
use crate::target::HttpClient;
use hyper::Request;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub trait HealthCheckConsumer: Send + Sync {
    fn on_health_check_result(&self, success: bool);
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/up".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct HealthCheck {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HealthCheck {
    /// Starts probing `base_url` + `config.path` on `config.interval`,
    /// pushing each result to `consumer`.
    pub fn start(
        base_url: String,
        config: HealthCheckConfig,
        consumer: Arc<dyn HealthCheckConsumer>,
        client: HttpClient,
    ) -> Self {
        let cancel = CancellationToken::new();
        let cancel_child = cancel.clone();

        let probe_url = format!("{}{}", base_url.trim_end_matches('/'), config.path);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_child.cancelled() => {
                        tracing::debug!(url = %probe_url, "health check: closed");
                        return;
                    }
                    _ = ticker.tick() => {
                        let success = probe_once(&client, &probe_url, config.timeout).await;
                        metrics::counter!("relayd_health_check_total").increment(1);
                        consumer.on_health_check_result(success);
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancels the current probe and terminates the probe loop.
    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.close();
    }
}

async fn probe_once(client: &HttpClient, url: &str, timeout: Duration) -> bool {
    let req = match Request::get(url).body(empty_body()) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(url, error = %e, "health check: malformed probe request");
            return false;
        }
    };

    match tokio::time::timeout(timeout, client.request(req)).await {
        Ok(Ok(resp)) => resp.status().as_u16() < 400,
        Ok(Err(e)) => {
            tracing::debug!(url, error = %e, "health check: probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(url, "health check: probe timed out");
            false
        }
    }
}
