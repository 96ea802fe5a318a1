use crate::config::RelaydConfig;
use crate::metrics::Metrics;
use crate::router::Router;
use crate::server::{self, RouterState};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. `listen`/`admin_listen` override the
/// corresponding config file values when set.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Proxy lifecycle: load config -> build router -> restore persisted state
/// -> deploy configured services -> serve -> shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let config = RelaydConfig::load(&args.config_path)?;
    init_tracing(&config.logging);

    let listen = args.listen.clone().unwrap_or_else(|| config.server.listen.clone());
    let admin_listen = args
        .admin_listen
        .clone()
        .unwrap_or_else(|| config.server.admin_listen.clone());

    let metrics = Metrics::install();
    let router = Arc::new(Router::with_default_state_file(config.server.state_path.clone()));

    // Phase 1: reconstruct services from the last persisted snapshot. Health
    // is re-established by the normal probe loop, not by this restore.
    if let Err(e) = router.restore_from_state().await {
        tracing::warn!("router: failed to restore persisted state, error={}", e);
    }

    // Phase 2: apply the declared services from the config file. A service
    // already restored from state is redeployed in place.
    for service in &config.services {
        let spec = service.to_deployment_spec();
        let name = spec.name.clone();
        match router.set_service_target(spec).await {
            Ok(()) => tracing::info!("router: deployed service, name={}", name),
            Err(e) => tracing::error!("router: failed to deploy service, name={}, error={}", name, e),
        }
    }

    let state = RouterState::new(router, metrics);
    let shutdown = Arc::new(Notify::new());

    tracing::info!(
        "server: starting proxy, listen={}, admin_listen={}",
        listen,
        admin_listen,
    );

    let admin_handle = tokio::spawn({
        let state = state.clone();
        let admin_listen = admin_listen.clone();
        async move {
            if let Err(e) = server::run_admin_server(&admin_listen, state).await {
                tracing::error!("server: admin failed, error={}", e);
            }
        }
    });

    let drain_timeout = Duration::from_secs(config.server.shutdown_drain_timeout_secs);
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown, drain_timeout).await }
    });

    // Block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }
    admin_handle.abort();

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing(logging: &crate::config::LoggingConfig) {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let registry = tracing_subscriber::registry().with(env_filter);

    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .json(),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false),
            )
            .init();
    }

    std::mem::forget(_guard);
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
