//! Owns the service map and the service registry; the single entry point
//! HTTP requests arrive through, and the only place deployments (set/remove
//! target, pause/resume/stop, rollout) are applied.

use crate::body::BoxBody;
use crate::error::ProxyError;
use crate::helpers::rollout::RolloutConfig;
use crate::loadbalance::{LoadBalancer, LoadBalancerOptions};
use crate::service::{self, Service, ServiceOptions};
use crate::servicemap::ServiceMap;
use crate::state_store::{
    FileStateStore, PersistedPauseState, PersistedRouterState, PersistedService, PersistedTarget, StateStore,
};
use crate::target::{build_http_client, HttpClient, Target, TargetOptions};
use hyper::body::Incoming;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub addr: String,
    pub scheme: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TargetSummary {
    pub addr: String,
    pub state: crate::target::TargetState,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub hosts: Vec<String>,
    pub paths: Vec<String>,
    pub paused: bool,
    pub stopped: bool,
    pub stop_message: String,
    pub writers: Vec<TargetSummary>,
    pub readers: Vec<TargetSummary>,
}

#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub name: String,
    pub hosts: Vec<String>,
    pub paths: Vec<String>,
    pub writer_targets: Vec<TargetSpec>,
    pub reader_targets: Vec<TargetSpec>,
    pub load_balancer_options: LoadBalancerOptions,
    pub target_options: TargetOptions,
    pub service_options: ServiceOptions,
    pub deploy_timeout: Duration,
    pub drain_timeout: Duration,
}

/// Non-pause-state fields of a deployment, retained so persisted snapshots
/// can fully reconstruct a service rather than just its pause state.
#[derive(Debug, Clone)]
struct DeploymentMeta {
    hosts: Vec<String>,
    paths: Vec<String>,
    writer_targets: Vec<TargetSpec>,
    reader_targets: Vec<TargetSpec>,
    strip_path_prefix: bool,
    tls_enabled: bool,
    tls_disable_redirect: bool,
}

pub struct Router {
    service_map: ServiceMap,
    services: Mutex<HashMap<String, Arc<Service>>>,
    deployment_meta: Mutex<HashMap<String, DeploymentMeta>>,
    http_client: HttpClient,
    state_store: Arc<dyn StateStore>,
    deploy_lock: tokio::sync::Mutex<()>,
}

impl Router {
    pub fn new(state_store: Arc<dyn StateStore>) -> Self {
        Self {
            service_map: ServiceMap::new(),
            services: Mutex::new(HashMap::new()),
            deployment_meta: Mutex::new(HashMap::new()),
            http_client: build_http_client(),
            state_store,
            deploy_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_default_state_file(path: impl Into<std::path::PathBuf>) -> Self {
        Self::new(Arc::new(FileStateStore::new(path)))
    }

    /// Normalizes hosts/paths, checks availability, builds and health-waits
    /// new targets, installs (or redeploys) the named service, and persists.
    /// Replaced targets are drained asynchronously in the background.
    pub async fn set_service_target(&self, spec: DeploymentSpec) -> Result<(), ProxyError> {
        let _deploy_guard = self.deploy_lock.lock().await;

        let hosts = normalize_hosts(&spec.hosts);
        let paths = normalize_paths(&spec.paths);

        if spec.service_options.tls_enabled && hosts.iter().any(|h| h.starts_with("*.")) {
            return Err(ProxyError::AutomaticTlsDoesNotSupportWildcards);
        }

        if let Some(conflict) = self.service_map.check_availability(&spec.name, &hosts, &paths) {
            if conflict != spec.name {
                return Err(ProxyError::HostInUse(conflict));
            }
        }

        let writers: Vec<Target> = spec
            .writer_targets
            .iter()
            .map(|t| Target::new(t.addr.clone(), t.scheme.clone(), spec.target_options.clone(), self.http_client.clone()))
            .collect();
        let readers: Vec<Target> = spec
            .reader_targets
            .iter()
            .map(|t| Target::new(t.addr.clone(), t.scheme.clone(), spec.target_options.clone(), self.http_client.clone()))
            .collect();

        for t in writers.iter().chain(readers.iter()) {
            t.begin_health_checks();
        }

        let balancer = LoadBalancer::new(writers.clone(), readers.clone(), spec.load_balancer_options.clone());
        if !balancer.wait_until_healthy(spec.deploy_timeout).await {
            for t in writers.iter().chain(readers.iter()) {
                t.close_health_checks();
            }
            return Err(ProxyError::TargetFailedToBecomeHealthy(spec.name.clone()));
        }

        let mut service_options = spec.service_options.clone();
        self.sync_tls_from_root(&hosts, &mut service_options);
        let (strip_path_prefix, tls_enabled, tls_disable_redirect) = (
            service_options.strip_path_prefix,
            service_options.tls_enabled,
            service_options.tls_disable_redirect,
        );

        let previous = {
            let mut services = self.services.lock().unwrap();
            match services.get(&spec.name).cloned() {
                Some(existing) => {
                    let old_balancer = existing.active_balancer();
                    existing.set_active_balancer(balancer);
                    existing.set_options(service_options);
                    Some(old_balancer)
                }
                None => {
                    let service = Service::new(spec.name.clone(), balancer, service_options);
                    services.insert(spec.name.clone(), service);
                    None
                }
            }
        };

        self.service_map.set(&spec.name, &hosts, &paths);
        self.deployment_meta.lock().unwrap().insert(
            spec.name.clone(),
            DeploymentMeta {
                hosts,
                paths,
                writer_targets: spec.writer_targets.clone(),
                reader_targets: spec.reader_targets.clone(),
                strip_path_prefix,
                tls_enabled,
                tls_disable_redirect,
            },
        );
        self.persist();

        if let Some(old_balancer) = previous {
            let drain_timeout = spec.drain_timeout;
            tokio::spawn(async move {
                old_balancer.drain_all(drain_timeout).await;
            });
        }

        Ok(())
    }

    /// Non-root path mounts inherit `tls_enabled`/`tls_disable_redirect`
    /// from the root (`/`) service on the same host, so a host's TLS
    /// posture stays consistent across every service mounted under it.
    fn sync_tls_from_root(&self, hosts: &[String], options: &mut ServiceOptions) {
        if options.strip_path_prefix {
            let services = self.services.lock().unwrap();
            for host in hosts {
                if let Some(root_name) = self.service_map.lookup(host, "/") {
                    if let Some(root_service) = services.get(&root_name) {
                        let root_options = root_service.options();
                        options.tls_enabled = root_options.tls_enabled;
                        options.tls_disable_redirect = root_options.tls_disable_redirect;
                        return;
                    }
                }
            }
        }
    }

    pub async fn remove_service(&self, name: &str, drain_timeout: Duration) -> Result<(), ProxyError> {
        let _deploy_guard = self.deploy_lock.lock().await;
        let service = {
            let mut services = self.services.lock().unwrap();
            services.remove(name)
        };
        let Some(service) = service else {
            return Err(ProxyError::NoService);
        };
        self.service_map.remove(name);
        self.persist();
        service.drain(drain_timeout).await;
        Ok(())
    }

    pub fn pause(&self, name: &str, fail_after: Duration) -> Result<(), ProxyError> {
        let service = self.get_service(name)?;
        service.pause(fail_after);
        self.persist();
        Ok(())
    }

    pub fn resume(&self, name: &str) -> Result<(), ProxyError> {
        let service = self.get_service(name)?;
        service.resume();
        self.persist();
        Ok(())
    }

    pub fn stop(&self, name: &str, message: impl Into<String>) -> Result<(), ProxyError> {
        let service = self.get_service(name)?;
        service.stop(message);
        self.persist();
        Ok(())
    }

    pub fn set_rollout(&self, name: &str, balancer: Option<Arc<LoadBalancer>>, config: Option<RolloutConfig>) -> Result<(), ProxyError> {
        let service = self.get_service(name)?;
        service.set_rollout(balancer, config);
        Ok(())
    }

    fn get_service(&self, name: &str) -> Result<Arc<Service>, ProxyError> {
        self.services
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(ProxyError::NoService)
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    /// Snapshot of every registered service for the admin status endpoint.
    pub fn service_summaries(&self) -> Vec<ServiceSummary> {
        let services = self.services.lock().unwrap();
        let meta = self.deployment_meta.lock().unwrap();
        services
            .iter()
            .map(|(name, service)| {
                let (paused, stopped, stop_message) = service.pause_snapshot();
                let (writers, readers) = service.active_balancer().target_statuses();
                let deployment_meta = meta.get(name);
                ServiceSummary {
                    name: name.clone(),
                    hosts: deployment_meta.map(|m| m.hosts.clone()).unwrap_or_default(),
                    paths: deployment_meta.map(|m| m.paths.clone()).unwrap_or_default(),
                    paused,
                    stopped,
                    stop_message,
                    writers: writers
                        .into_iter()
                        .map(|(addr, state)| TargetSummary { addr, state })
                        .collect(),
                    readers: readers
                        .into_iter()
                        .map(|(addr, state)| TargetSummary { addr, state })
                        .collect(),
                }
            })
            .collect()
    }

    /// Top-level dispatch: 404 when the host has no entry at all, otherwise
    /// hands off to the matched service's pipeline.
    pub async fn serve(&self, req: hyper::Request<Incoming>, client_ip: IpAddr) -> hyper::Response<BoxBody> {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
            .unwrap_or_default();
        let path = req.uri().path().to_string();

        if !self.service_map.has_any_entry_for(&host) {
            return service::status_response(http::StatusCode::NOT_FOUND, "not found");
        }

        let Some((prefix, name)) = self.service_map.lookup_with_prefix(&host, &path) else {
            return service::status_response(http::StatusCode::NOT_FOUND, "not found");
        };

        let Some(svc) = self.services.lock().unwrap().get(&name).cloned() else {
            return service::status_response(http::StatusCode::NOT_FOUND, "not found");
        };

        match svc.handle(req, client_ip, &prefix, &host).await {
            Ok(resp) => resp,
            Err(e) => {
                let status = e.status_code().unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
                tracing::warn!(error = %e, service = %name, "router: request failed");
                service::status_response(status, &e.to_string())
            }
        }
    }

    fn persist(&self) {
        let state = self.snapshot();
        if let Err(e) = self.state_store.save(&state) {
            tracing::warn!(error = %e, "router: failed to persist state");
        }
    }

    fn snapshot(&self) -> PersistedRouterState {
        let services = self.services.lock().unwrap();
        let meta = self.deployment_meta.lock().unwrap();
        PersistedRouterState {
            services: services
                .iter()
                .map(|(name, svc)| {
                    let (paused, stopped, stop_message) = svc.pause_snapshot();
                    let m = meta.get(name);
                    PersistedService {
                        name: name.clone(),
                        hosts: m.map(|m| m.hosts.clone()).unwrap_or_default(),
                        paths: m.map(|m| m.paths.clone()).unwrap_or_default(),
                        writer_targets: m
                            .map(|m| m.writer_targets.iter().map(to_persisted_target).collect())
                            .unwrap_or_default(),
                        reader_targets: m
                            .map(|m| m.reader_targets.iter().map(to_persisted_target).collect())
                            .unwrap_or_default(),
                        strip_path_prefix: m.map(|m| m.strip_path_prefix).unwrap_or(false),
                        tls_enabled: m.map(|m| m.tls_enabled).unwrap_or(false),
                        tls_disable_redirect: m.map(|m| m.tls_disable_redirect).unwrap_or(false),
                        pause_state: PersistedPauseState {
                            paused,
                            stopped,
                            stop_message,
                        },
                    }
                })
                .collect(),
        }
    }

    /// Reconstructs services from persisted state at startup. Targets are
    /// assumed healthy immediately (the normal probe loop then confirms or
    /// demotes them) rather than waiting out a fresh deploy timeout.
    pub async fn restore_from_state(&self) -> std::io::Result<()> {
        let state = self.state_store.load()?;
        for persisted in state.services {
            let writers: Vec<Target> = persisted
                .writer_targets
                .iter()
                .map(|t| {
                    let target = Target::new(t.addr.clone(), t.scheme.clone(), TargetOptions::default(), self.http_client.clone());
                    target.assume_healthy();
                    target.begin_health_checks();
                    target
                })
                .collect();
            let readers: Vec<Target> = persisted
                .reader_targets
                .iter()
                .map(|t| {
                    let target = Target::new(t.addr.clone(), t.scheme.clone(), TargetOptions::default(), self.http_client.clone());
                    target.assume_healthy();
                    target.begin_health_checks();
                    target
                })
                .collect();

            let balancer = LoadBalancer::new(writers, readers, LoadBalancerOptions::default());
            let options = ServiceOptions {
                strip_path_prefix: persisted.strip_path_prefix,
                tls_enabled: persisted.tls_enabled,
                tls_disable_redirect: persisted.tls_disable_redirect,
                ..ServiceOptions::default()
            };
            let service = Service::new(persisted.name.clone(), balancer, options);
            if persisted.pause_state.stopped {
                service.stop(persisted.pause_state.stop_message.clone());
            } else if persisted.pause_state.paused {
                service.pause(Duration::from_secs(30));
            }

            self.services.lock().unwrap().insert(persisted.name.clone(), service);
            self.service_map.set(&persisted.name, &persisted.hosts, &persisted.paths);
        }
        Ok(())
    }
}

fn to_persisted_target(t: &TargetSpec) -> PersistedTarget {
    PersistedTarget {
        addr: t.addr.clone(),
        scheme: t.scheme.clone(),
    }
}

fn normalize_hosts(hosts: &[String]) -> Vec<String> {
    hosts.iter().map(|h| h.to_ascii_lowercase()).collect()
}

fn normalize_paths(paths: &[String]) -> Vec<String> {
    if paths.is_empty() {
        return vec!["/".to_string()];
    }
    paths
        .iter()
        .map(|p| {
            let mut p = p.clone();
            if !p.starts_with('/') {
                p = format!("/{}", p);
            }
            if p.len() > 1 {
                p = p.trim_end_matches('/').to_string();
            }
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::PersistedRouterState;
    use std::sync::Mutex as StdMutex;

    struct MemoryStateStore(StdMutex<PersistedRouterState>);
    impl StateStore for MemoryStateStore {
        fn load(&self) -> std::io::Result<PersistedRouterState> {
            Ok(self.0.lock().unwrap().clone())
        }
        fn save(&self, state: &PersistedRouterState) -> std::io::Result<()> {
            *self.0.lock().unwrap() = state.clone();
            Ok(())
        }
    }

    fn test_router() -> Router {
        Router::new(Arc::new(MemoryStateStore(StdMutex::new(PersistedRouterState::default()))))
    }

    #[test]
    fn normalize_paths_defaults_to_root() {
        assert_eq!(normalize_paths(&[]), vec!["/".to_string()]);
    }

    #[test]
    fn normalize_paths_strips_trailing_slash() {
        assert_eq!(normalize_paths(&["/app/".to_string()]), vec!["/app".to_string()]);
    }

    #[test]
    fn unknown_host_has_no_service_map_entry() {
        let router = test_router();
        assert!(!router.service_map.has_any_entry_for("nowhere.example"));
    }

    #[tokio::test]
    async fn pause_fails_for_unknown_service() {
        let router = test_router();
        assert!(matches!(
            router.pause("ghost", Duration::from_secs(1)),
            Err(ProxyError::NoService)
        ));
    }

    #[test]
    fn get_service_fails_for_unknown_name() {
        let router = test_router();
        assert!(matches!(router.get_service("ghost"), Err(ProxyError::NoService)));
    }
}
