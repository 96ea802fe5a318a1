pub mod types;

pub use types::*;

use crate::health::HealthCheckConfig;
use crate::helpers::rollout::RolloutConfig;
use crate::loadbalance::LoadBalancerOptions;
use crate::router::{DeploymentSpec, TargetSpec};
use crate::service::ServiceOptions;
use crate::target::TargetOptions;
use anyhow::Result;
use std::path::Path;
use std::time::Duration;

impl RelaydConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for server settings. When the file does not exist,
    /// built-in defaults are used — the proxy starts with zero routable
    /// services until one is deployed through the admin surface.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: RelaydConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, starting with no configured services",
                path.display()
            );
            RelaydConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(services = config.services.len(), "loaded configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAYD_LISTEN") {
            self.server.listen = v;
        }
        if let Ok(v) = std::env::var("RELAYD_ADMIN_LISTEN") {
            self.server.admin_listen = v;
        }
        if let Ok(v) = std::env::var("RELAYD_STATE_PATH") {
            self.server.state_path = v;
        }
        if let Ok(v) = std::env::var("RELAYD_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("RELAYD_LOG_JSON") {
            self.logging.json = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        for service in &self.services {
            if service.name.is_empty() {
                anyhow::bail!("service name cannot be empty");
            }
            if service.hosts.is_empty() {
                anyhow::bail!("service {} must declare at least one host", service.name);
            }
            if service.writer_targets.is_empty() {
                anyhow::bail!("service {} must declare at least one writer target", service.name);
            }
            if service.tls_enabled && service.hosts.iter().any(|h| h.starts_with("*.")) {
                anyhow::bail!(
                    "service {} cannot combine tls_enabled with a wildcard host",
                    service.name
                );
            }
            if !(0..=100).contains(&service.rollout.percentage) {
                anyhow::bail!("service {} rollout percentage must be 0-100", service.name);
            }
        }
        Ok(())
    }
}

impl ServiceConfig {
    /// Builds the `DeploymentSpec` the router's `set_service_target` expects,
    /// translating the flat config shape into the typed options each
    /// component (load balancer, service, target) owns.
    pub fn to_deployment_spec(&self) -> DeploymentSpec {
        DeploymentSpec {
            name: self.name.clone(),
            hosts: self.hosts.clone(),
            paths: self.paths.clone(),
            writer_targets: self.writer_targets.iter().map(to_target_spec).collect(),
            reader_targets: self.reader_targets.iter().map(to_target_spec).collect(),
            load_balancer_options: LoadBalancerOptions {
                writer_affinity_timeout: Duration::from_secs(self.writer_affinity_timeout_secs),
                allow_readers_websockets: self.allow_readers_websockets,
                dynamic_reproxy: self.dynamic_reproxy,
                forward_headers: self.forward_headers,
                default_writer: self.default_writer.clone(),
            },
            target_options: TargetOptions {
                response_header_timeout: Duration::from_secs(self.response_header_timeout_secs),
                health_check: HealthCheckConfig {
                    path: self.health_check.path.clone(),
                    interval: Duration::from_secs(self.health_check.interval_secs),
                    timeout: Duration::from_secs(self.health_check.timeout_secs),
                },
                forward_headers: self.forward_headers,
            },
            service_options: ServiceOptions {
                max_request_body_bytes: self.max_request_body_bytes,
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                reproxy: crate::helpers::reproxy::ReproxyConfig {
                    max_retries: self.reproxy_max_retries,
                },
                strip_path_prefix: self.strip_path_prefix,
                tls_enabled: self.tls_enabled,
                tls_disable_redirect: self.tls_disable_redirect,
            },
            deploy_timeout: Duration::from_secs(self.deploy_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }

    pub fn rollout_config(&self) -> RolloutConfig {
        RolloutConfig {
            cookie_name: self.rollout.cookie_name.clone(),
            percentage: self.rollout.percentage,
            allow_list: self.rollout.allow_list.clone(),
        }
    }
}

fn to_target_spec(t: &TargetConfig) -> TargetSpec {
    TargetSpec {
        addr: t.addr.clone(),
        scheme: t.scheme.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_service() -> ServiceConfig {
        ServiceConfig {
            name: "web".to_string(),
            hosts: vec!["example.com".to_string()],
            paths: vec!["/".to_string()],
            writer_targets: vec![TargetConfig {
                addr: "127.0.0.1:3000".to_string(),
                scheme: "http".to_string(),
            }],
            reader_targets: vec![],
            health_check: HealthCheckSettings::default(),
            response_header_timeout_secs: 30,
            request_timeout_secs: 30,
            max_request_body_bytes: 0,
            reproxy_max_retries: 5,
            strip_path_prefix: false,
            tls_enabled: false,
            tls_disable_redirect: false,
            writer_affinity_timeout_secs: 0,
            allow_readers_websockets: false,
            dynamic_reproxy: false,
            forward_headers: true,
            default_writer: None,
            rollout: RolloutSettings::default(),
            deploy_timeout_secs: 30,
            drain_timeout_secs: 30,
        }
    }

    #[test]
    fn validate_rejects_service_with_no_writers() {
        let mut config = RelaydConfig::default();
        let mut svc = sample_service();
        svc.writer_targets.clear();
        config.services.push(svc);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_wildcard_host_with_tls() {
        let mut config = RelaydConfig::default();
        let mut svc = sample_service();
        svc.hosts = vec!["*.example.com".to_string()];
        svc.tls_enabled = true;
        config.services.push(svc);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_service() {
        let mut config = RelaydConfig::default();
        config.services.push(sample_service());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn to_deployment_spec_preserves_target_addresses() {
        let svc = sample_service();
        let spec = svc.to_deployment_spec();
        assert_eq!(spec.writer_targets.len(), 1);
        assert_eq!(spec.writer_targets[0].addr, "127.0.0.1:3000");
        assert_eq!(spec.deploy_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_config_file_loads_defaults() {
        let config = RelaydConfig::load(Path::new("/tmp/relayd-config-does-not-exist.toml")).unwrap();
        assert!(config.services.is_empty());
    }
}
