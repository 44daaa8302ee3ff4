//! Pooled relay connections keyed by provider and lane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deadpool::managed::{Manager, Metrics, Object, Pool, PoolConfig, PoolError, RecycleError, RecycleResult};
use parking_lot::Mutex;
use serde::Serialize;

use super::{LaneSettings, RelayConnection, RelayConnector};
use crate::errors::{TransportError, TransportErrorKind, TransportResult};
use crate::message::Lane;
use crate::registry::{ProviderDescriptor, ProviderId};

/// Pool cache key.
pub type PoolKey = (ProviderId, Lane);

/// A connection checked out of a pool; returned on drop.
pub type PooledConnection = Object<RelayManager>;

type RelayPool = Pool<RelayManager>;

/// deadpool manager creating relay sessions for one provider and lane.
#[derive(Debug)]
pub struct RelayManager {
    connector: Arc<dyn RelayConnector>,
    provider: ProviderDescriptor,
    settings: LaneSettings,
    created: AtomicUsize,
}

#[async_trait]
impl Manager for RelayManager {
    type Type = Box<dyn RelayConnection>;
    type Error = TransportError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.created.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            provider = %self.provider.id,
            lane = %self.settings.lane,
            "Opening relay connection"
        );
        self.connector.connect(&self.provider, &self.settings).await
    }

    async fn recycle(&self, conn: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        conn.health_check().await.map_err(RecycleError::Backend)
    }
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Provider.
    pub provider_id: ProviderId,
    /// Lane.
    pub lane: Lane,
    /// Open connections.
    pub size: usize,
    /// Idle connections.
    pub available: usize,
    /// Configured maximum.
    pub max_size: usize,
    /// Connections created over the pool's life.
    pub created: usize,
}

/// Lazily created connection pools, one per provider and lane.
#[derive(Debug)]
pub struct TransportPool {
    connector: Arc<dyn RelayConnector>,
    pools: Mutex<HashMap<PoolKey, RelayPool>>,
}

impl TransportPool {
    /// Creates an empty pool set.
    pub fn new(connector: Arc<dyn RelayConnector>) -> Self {
        Self {
            connector,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Checks out a connection, opening one if none is idle.
    ///
    /// Idle connections are health-checked before they are handed out.
    pub async fn acquire(
        &self,
        provider: &ProviderDescriptor,
        settings: &LaneSettings,
    ) -> TransportResult<PooledConnection> {
        let pool = self.pool_for(provider, settings)?;
        pool.get().await.map_err(|e| match e {
            PoolError::Backend(e) => e,
            other => TransportError::new(
                TransportErrorKind::Pool,
                format!("failed to obtain connection for {}: {}", provider.id, other),
            ),
        })
    }

    fn pool_for(&self, provider: &ProviderDescriptor, settings: &LaneSettings) -> TransportResult<RelayPool> {
        let key = (provider.id.clone(), settings.lane);
        let mut pools = self.pools.lock();

        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let manager = RelayManager {
            connector: Arc::clone(&self.connector),
            provider: provider.clone(),
            settings: *settings,
            created: AtomicUsize::new(0),
        };
        let pool = Pool::builder(manager)
            .config(PoolConfig::new(settings.max_connections))
            .build()
            .map_err(|e| {
                TransportError::new(TransportErrorKind::Pool, format!("failed to create pool: {}", e))
            })?;

        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Closes and evicts the pool for `provider` on `lane`.
    ///
    /// Connections already checked out are dropped when they come back.
    pub fn discard(&self, provider: &ProviderId, lane: Lane) {
        let removed = self.pools.lock().remove(&(provider.clone(), lane));
        if let Some(pool) = removed {
            pool.close();
            tracing::debug!(provider = %provider, lane = %lane, "Discarded connection pool");
        }
    }

    /// Detaches a connection from its pool so it is dropped, not reused.
    pub fn detach(conn: PooledConnection) {
        drop(Object::take(conn));
    }

    /// Status of every live pool, sorted by provider then lane.
    pub fn status(&self) -> Vec<PoolStatus> {
        let mut status: Vec<_> = self
            .pools
            .lock()
            .iter()
            .map(|((id, lane), pool)| {
                let s = pool.status();
                PoolStatus {
                    provider_id: id.clone(),
                    lane: *lane,
                    size: s.size,
                    available: s.available.max(0) as usize,
                    max_size: s.max_size,
                    created: pool.manager().created.load(Ordering::SeqCst),
                }
            })
            .collect();
        status.sort_by(|a, b| (&a.provider_id, a.lane as u8).cmp(&(&b.provider_id, b.lane as u8)));
        status
    }

    /// Closes every pool.
    pub fn clear(&self) {
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FastLaneConfig, NormalLaneConfig, ProviderConfig};
    use crate::mocks::{MockBehavior, MockConnector};

    fn provider(id: &str) -> ProviderDescriptor {
        let config = ProviderConfig::new(id, format!("smtp.{}.example", id)).credentials("u", "p");
        ProviderDescriptor::from_config(&config, 0).unwrap()
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let connector = Arc::new(MockConnector::new());
        let pool = TransportPool::new(connector.clone());
        let alpha = provider("alpha");
        let settings = LaneSettings::normal(&NormalLaneConfig::default());

        drop(pool.acquire(&alpha, &settings).await.unwrap());
        drop(pool.acquire(&alpha, &settings).await.unwrap());

        assert_eq!(connector.connects(&alpha.id), 1);
        assert_eq!(connector.health_checks(&alpha.id), 1);

        let status = pool.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].max_size, 4);
        assert_eq!(status[0].available, 1);
    }

    #[tokio::test]
    async fn test_lanes_have_separate_pools() {
        let connector = Arc::new(MockConnector::new());
        let pool = TransportPool::new(connector.clone());
        let alpha = provider("alpha");

        let fast = pool
            .acquire(&alpha, &LaneSettings::fast(&FastLaneConfig::default()))
            .await
            .unwrap();
        let normal = pool
            .acquire(&alpha, &LaneSettings::normal(&NormalLaneConfig::default()))
            .await
            .unwrap();
        drop((fast, normal));

        let status = pool.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].lane, Lane::Fast);
        assert_eq!(status[0].max_size, 1);
        assert_eq!(connector.connects(&alpha.id), 2);
    }

    #[tokio::test]
    async fn test_discard_recreates_on_next_use() {
        let connector = Arc::new(MockConnector::new());
        let pool = TransportPool::new(connector.clone());
        let alpha = provider("alpha");
        let settings = LaneSettings::fast(&FastLaneConfig::default());

        drop(pool.acquire(&alpha, &settings).await.unwrap());
        pool.discard(&alpha.id, Lane::Fast);
        assert!(pool.status().is_empty());
        assert_eq!(connector.dropped(&alpha.id), 1);

        drop(pool.acquire(&alpha, &settings).await.unwrap());
        assert_eq!(connector.connects(&alpha.id), 2);
    }

    #[tokio::test]
    async fn test_detach_drops_connection() {
        let connector = Arc::new(MockConnector::new());
        let pool = TransportPool::new(connector.clone());
        let alpha = provider("alpha");
        let settings = LaneSettings::normal(&NormalLaneConfig::default());

        TransportPool::detach(pool.acquire(&alpha, &settings).await.unwrap());
        assert_eq!(connector.dropped(&alpha.id), 1);
        assert_eq!(pool.status()[0].size, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_transport_error() {
        let connector = Arc::new(MockConnector::new());
        connector.script(
            "alpha",
            [MockBehavior::fail_connect(TransportErrorKind::ConnectionRefused, "connection refused")],
        );
        let pool = TransportPool::new(connector.clone());
        let alpha = provider("alpha");

        let err = pool
            .acquire(&alpha, &LaneSettings::normal(&NormalLaneConfig::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_unhealthy_idle_connection_is_replaced() {
        let connector = Arc::new(MockConnector::new());
        let pool = TransportPool::new(connector.clone());
        let alpha = provider("alpha");
        let settings = LaneSettings::normal(&NormalLaneConfig::default());

        drop(pool.acquire(&alpha, &settings).await.unwrap());
        connector.set_healthy("alpha", false);
        drop(pool.acquire(&alpha, &settings).await.unwrap());

        assert_eq!(connector.connects(&alpha.id), 2);
        assert_eq!(connector.dropped(&alpha.id), 1);
    }
}
