use serde::{Deserialize, Serialize};

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_state_path() -> String {
    "relayd-state.json".to_string()
}

fn default_shutdown_drain_timeout_secs() -> u64 {
    30
}

/// Top-level process configuration: the set of services to deploy at
/// startup plus the server's own listen/log/state settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaydConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// How long the proxy listener waits for in-flight requests to finish
    /// once a shutdown signal arrives, before forcing connections closed.
    #[serde(default = "default_shutdown_drain_timeout_secs")]
    pub shutdown_drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            state_path: default_state_path(),
            shutdown_drain_timeout_secs: default_shutdown_drain_timeout_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit newline-delimited JSON instead of the compact human format.
    #[serde(default)]
    pub json: bool,

    /// Directory for the rolling log file. When unset, logs go to stdout only.
    #[serde(default)]
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: true,
            directory: None,
        }
    }
}

fn default_scheme() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub addr: String,

    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_deploy_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_response_header_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_health_check_path() -> String {
    "/up".to_string()
}

fn default_health_check_interval_secs() -> u64 {
    5
}

fn default_health_check_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_health_check_path")]
    pub path: String,

    #[serde(default = "default_health_check_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_health_check_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            path: default_health_check_path(),
            interval_secs: default_health_check_interval_secs(),
            timeout_secs: default_health_check_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_rollout_cookie_name() -> String {
    "kamal-rollout".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolloutSettings {
    #[serde(default = "default_rollout_cookie_name")]
    pub cookie_name: String,

    /// 0-100. 0 (the default) disables rollout — all traffic goes to the
    /// active deployment.
    #[serde(default)]
    pub percentage: u8,

    #[serde(default)]
    pub allow_list: Vec<String>,
}

/// One routable, independently deployable service: the hosts/paths it
/// answers for, its writer/reader targets, and the per-service policy knobs
/// that become `LoadBalancerOptions`/`ServiceOptions`/`TargetOptions` at
/// deploy time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    pub hosts: Vec<String>,

    #[serde(default = "default_root_path")]
    pub paths: Vec<String>,

    pub writer_targets: Vec<TargetConfig>,

    #[serde(default)]
    pub reader_targets: Vec<TargetConfig>,

    #[serde(default)]
    pub health_check: HealthCheckSettings,

    #[serde(default = "default_response_header_timeout_secs")]
    pub response_header_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// 0 = unlimited.
    #[serde(default)]
    pub max_request_body_bytes: u64,

    #[serde(default = "default_max_retries")]
    pub reproxy_max_retries: u32,

    #[serde(default)]
    pub strip_path_prefix: bool,

    #[serde(default)]
    pub tls_enabled: bool,

    #[serde(default)]
    pub tls_disable_redirect: bool,

    /// 0 disables writer-affinity stickiness entirely.
    #[serde(default)]
    pub writer_affinity_timeout_secs: u64,

    #[serde(default)]
    pub allow_readers_websockets: bool,

    #[serde(default)]
    pub dynamic_reproxy: bool,

    #[serde(default = "default_true")]
    pub forward_headers: bool,

    /// Target selected for writes when no writer-affinity cookie is present
    /// and `dynamic_reproxy` routing is enabled.
    #[serde(default)]
    pub default_writer: Option<String>,

    #[serde(default)]
    pub rollout: RolloutSettings,

    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_root_path() -> Vec<String> {
    vec!["/".to_string()]
}
