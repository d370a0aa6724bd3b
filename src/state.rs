//! `AppState`: the handles axum hands to every route, grounded on the same
//! `Clone`-able-bundle-of-`Arc`s shape as `services/server::state::AppState`.

use crate::broadcaster::Broadcaster;
use crate::config::FabricConfig;
use crate::connection_manager::ConnectionManager;
use crate::metrics::Metrics;
use crate::replay::ReplayRegistry;
use crate::subscription::SubscriptionIndex;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: FabricConfig,
    pub connection_manager: Arc<ConnectionManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub replay_registry: Arc<ReplayRegistry>,
}

impl AppState {
    pub fn new(config: FabricConfig) -> Self {
        let metrics = Arc::new(Metrics::new());
        let subscriptions = Arc::new(SubscriptionIndex::new());
        let connection_manager =
            Arc::new(ConnectionManager::new(config.clone(), subscriptions.clone(), metrics.clone()));
        let broadcaster = Broadcaster::new(config.clone(), subscriptions, connection_manager.clone(), metrics.clone());
        AppState { config, connection_manager, broadcaster, replay_registry: Arc::new(ReplayRegistry::new(metrics)) }
    }

    pub async fn connection_stats(&self) -> fabric_protocol::ConnectionStatsBody {
        let total_sessions = self.connection_manager.session_count().await as u64;
        let queue_depth_by_lane = self.broadcaster.queue_depth_by_lane();
        self.broadcaster.metrics.snapshot(total_sessions, queue_depth_by_lane, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_stats_reflects_registered_sessions() {
        let state = AppState::new(FabricConfig::default());
        let identity = crate::auth::Identity {
            id: "u1".to_owned(),
            role: fabric_protocol::Role::User,
            allowed_event_types: vec![],
            data_access_level: fabric_protocol::DataAccessLevel::Redacted,
            rate_limit_overrides: std::collections::HashMap::new(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        };
        state.connection_manager.accept(identity).await;
        let stats = state.connection_stats().await;
        assert_eq!(stats.total_sessions, 1);
        assert!(stats.up);
    }
}
