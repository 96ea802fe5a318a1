use std::fmt;

/// Request-path and deployment-time error taxonomy.
///
/// Request-path variants carry the HTTP status they map to (see
/// `status_code`); deployment-time variants are returned to the caller of
/// `Router::set_service_target` / `Router::remove_service` and never reach a
/// client directly.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ProxyError {
    // routing errors
    NoService,
    NoHealthyTargets,
    HostInUse(String),

    // client input errors
    RequestEntityTooLarge,
    InvalidHostPattern(String),

    // target errors
    Draining,
    GatewayTimeout,
    BadGateway(String),
    TargetFailedToBecomeHealthy(String),

    // pause-induced
    PauseTimedOut,
    ServiceStopped(String),

    // config errors
    AutomaticTlsDoesNotSupportWildcards,

    // buffer errors
    WriteAfterRead,
    MaxExceeded,

    Config(String),
    Internal(String),
}

impl ProxyError {
    /// HTTP status this error maps to when surfaced on the request path.
    /// Deployment-time-only variants return `None`.
    pub fn status_code(&self) -> Option<http::StatusCode> {
        use http::StatusCode;
        match self {
            ProxyError::NoService => Some(StatusCode::NOT_FOUND),
            ProxyError::NoHealthyTargets => Some(StatusCode::SERVICE_UNAVAILABLE),
            ProxyError::HostInUse(_) => None,
            ProxyError::RequestEntityTooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ProxyError::InvalidHostPattern(_) => None,
            ProxyError::Draining => Some(StatusCode::SERVICE_UNAVAILABLE),
            ProxyError::GatewayTimeout => Some(StatusCode::GATEWAY_TIMEOUT),
            ProxyError::BadGateway(_) => Some(StatusCode::BAD_GATEWAY),
            ProxyError::TargetFailedToBecomeHealthy(_) => None,
            ProxyError::PauseTimedOut => Some(StatusCode::GATEWAY_TIMEOUT),
            ProxyError::ServiceStopped(_) => Some(StatusCode::SERVICE_UNAVAILABLE),
            ProxyError::AutomaticTlsDoesNotSupportWildcards => None,
            ProxyError::WriteAfterRead => Some(StatusCode::INTERNAL_SERVER_ERROR),
            ProxyError::MaxExceeded => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ProxyError::Config(_) => None,
            ProxyError::Internal(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoService => write!(f, "no service matched"),
            ProxyError::NoHealthyTargets => write!(f, "no healthy targets available"),
            ProxyError::HostInUse(msg) => write!(f, "host in use: {}", msg),
            ProxyError::RequestEntityTooLarge => write!(f, "request entity too large"),
            ProxyError::InvalidHostPattern(msg) => write!(f, "invalid host pattern: {}", msg),
            ProxyError::Draining => write!(f, "target draining"),
            ProxyError::GatewayTimeout => write!(f, "gateway timeout"),
            ProxyError::BadGateway(msg) => write!(f, "bad gateway: {}", msg),
            ProxyError::TargetFailedToBecomeHealthy(msg) => {
                write!(f, "target failed to become healthy: {}", msg)
            }
            ProxyError::PauseTimedOut => write!(f, "pause timed out"),
            ProxyError::ServiceStopped(msg) => write!(f, "service stopped: {}", msg),
            ProxyError::AutomaticTlsDoesNotSupportWildcards => {
                write!(f, "automatic TLS does not support wildcard hosts")
            }
            ProxyError::WriteAfterRead => write!(f, "write after read"),
            ProxyError::MaxExceeded => write!(f, "buffer max size exceeded"),
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}
