//! Process-wide gateway state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

use voxbridge_core::config::Config;
use voxbridge_providers::ProviderSet;

/// Shared state accessible from all connections and handlers.
///
/// Config reloads swap the snapshot between sessions; in-flight sessions
/// keep the `Arc` they started with. Providers are initialized lazily on
/// first use: the first caller blocks on construction, later callers
/// queue on the cell.
pub struct GatewayState {
    config: RwLock<Arc<Config>>,
    providers: OnceCell<Arc<ProviderSet>>,
    pub connections: RwLock<HashMap<String, ConnectionEntry>>,
    /// Cancelled on shutdown; every session token is a child of this.
    pub shutdown: CancellationToken,
}

/// Registry entry for one live connection.
pub struct ConnectionEntry {
    pub device_id: String,
    pub cancel: CancellationToken,
}

impl GatewayState {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            providers: OnceCell::new(),
            connections: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Pre-seeded providers, for tests and embedders.
    pub fn with_providers(config: Config, providers: Arc<ProviderSet>) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            providers: OnceCell::new_with(Some(providers)),
            connections: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn config_snapshot(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }

    /// Swap the config snapshot; applies to sessions accepted afterwards.
    pub async fn reload_config(&self, config: Config) {
        *self.config.write().await = Arc::new(config);
    }

    pub async fn providers(&self) -> anyhow::Result<Arc<ProviderSet>> {
        let providers = self
            .providers
            .get_or_try_init(|| async {
                let config = self.config_snapshot().await;
                ProviderSet::from_config(&config.providers).map(Arc::new)
            })
            .await?;
        Ok(providers.clone())
    }

    pub async fn register(&self, session_id: &str, device_id: &str, cancel: CancellationToken) {
        self.connections.write().await.insert(
            session_id.to_string(),
            ConnectionEntry {
                device_id: device_id.to_string(),
                cancel,
            },
        );
    }

    pub async fn unregister(&self, session_id: &str) {
        self.connections.write().await.remove(session_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Propagate cancellation to every live session.
    pub async fn cancel_all_sessions(&self) {
        for entry in self.connections.read().await.values() {
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_unregister() {
        let state = GatewayState::new(Config::default());
        state.register("s1", "dev-a", CancellationToken::new()).await;
        assert_eq!(state.connection_count().await, 1);
        state.unregister("s1").await;
        assert_eq!(state.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_all_sessions() {
        let state = GatewayState::new(Config::default());
        let token = CancellationToken::new();
        state.register("s1", "dev-a", token.clone()).await;
        state.cancel_all_sessions().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_config_reload_swaps_snapshot() {
        let state = GatewayState::new(Config::default());
        let before = state.config_snapshot().await;
        assert_eq!(before.server.port, 8000);

        let mut updated = Config::default();
        updated.server.port = 9999;
        state.reload_config(updated).await;

        // the old snapshot is untouched; new readers see the new value
        assert_eq!(before.server.port, 8000);
        assert_eq!(state.config_snapshot().await.server.port, 9999);
    }
}
