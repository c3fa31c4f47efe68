use std::sync::Arc;

use crate::{
    config::RelayConfig, metrics::AppMetrics, relay::StreamRelay, session::SessionStore,
    upstream::Upstream,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub relay: Arc<StreamRelay>,
    pub sessions: Arc<SessionStore>,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new<U>(config: RelayConfig, upstream: Arc<U>) -> Self
    where
        U: Upstream + 'static,
    {
        let sessions = SessionStore::from_env(config.session_ttl);
        Self::assemble(config, upstream, sessions)
    }

    pub fn new_for_tests<U>(config: RelayConfig, upstream: Arc<U>) -> Self
    where
        U: Upstream + 'static,
    {
        let sessions = SessionStore::memory(config.session_ttl);
        Self::assemble(config, upstream, sessions)
    }

    fn assemble<U>(config: RelayConfig, upstream: Arc<U>, sessions: SessionStore) -> Self
    where
        U: Upstream + 'static,
    {
        let upstream: Arc<dyn Upstream> = upstream;
        let metrics = Arc::new(AppMetrics::new());
        let relay = StreamRelay::new(upstream, config.relay.clone(), metrics.clone());
        Self {
            config: Arc::new(config),
            relay: Arc::new(relay),
            sessions: Arc::new(sessions),
            metrics,
        }
    }
}
