use crate::metrics::Metrics;
use crate::router::Router;
use std::sync::Arc;

/// Shared server state, cheaply cloneable: the router (service map + service
/// registry, the single entry point requests are served through) and the
/// installed metrics handle.
#[derive(Clone)]
pub struct RouterState {
    pub router: Arc<Router>,
    pub metrics: Metrics,
}

impl RouterState {
    pub fn new(router: Arc<Router>, metrics: Metrics) -> Self {
        Self { router, metrics }
    }
}
