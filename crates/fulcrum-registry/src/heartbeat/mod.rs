//! Heartbeat sweeper: a periodic task over every registered identity that
//! derives AVAILABLE/UNAVAILABLE/DEAD from elapsed time since last
//! heartbeat. Idempotent — a missed tick just widens the delta seen on the
//! next pass, and Redis failures are logged and left for the next tick
//! rather than retried inline.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fulcrum_bus::MessageBus;
use fulcrum_common::messages::{ProxyDeadNotice, ServerDeregisteredNotice};
use fulcrum_common::model::{Identity, ServerRecord, Status};
use redis::AsyncCommands;
use tokio::task::JoinHandle;

use crate::registry::RegistryStore;

pub const UNAVAILABLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Periodic liveness sweep. Holds its own Redis connection distinct from
/// [`RegistryStore`]'s, since it needs direct access to mutate the
/// proxy-unavailable document that the registry's narrower API doesn't
/// expose.
/// Configurable thresholds, defaulting to the values above. Exposed so
/// `apps/fulcrum-coordinator`'s CLI can override them per the ambient
/// configuration convention.
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub unavailable_timeout: Duration,
    pub dead_timeout: Duration,
    pub sweep_period: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            unavailable_timeout: UNAVAILABLE_TIMEOUT,
            dead_timeout: DEAD_TIMEOUT,
            sweep_period: SWEEP_PERIOD,
        }
    }
}

pub struct Sweeper {
    store: Arc<RegistryStore>,
    bus: Arc<MessageBus>,
    conn: tokio::sync::Mutex<redis::aio::ConnectionManager>,
    last_status: DashMap<String, Status>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(store: Arc<RegistryStore>, bus: Arc<MessageBus>, conn: redis::aio::ConnectionManager) -> Arc<Self> {
        Self::with_config(store, bus, conn, SweeperConfig::default())
    }

    pub fn with_config(
        store: Arc<RegistryStore>,
        bus: Arc<MessageBus>,
        conn: redis::aio::ConnectionManager,
        config: SweeperConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            conn: tokio::sync::Mutex::new(conn),
            last_status: DashMap::new(),
            config,
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.config.sweep_period);
            loop {
                interval.tick().await;
                sweeper.tick().await;
            }
        })
    }

    #[tracing::instrument(skip(self))]
    async fn tick(&self) {
        if let Err(err) = self.sweep_kind("server").await {
            tracing::error!(error = %err, "server sweep failed; will retry next tick");
        }
        if let Err(err) = self.sweep_kind("proxy").await {
            tracing::error!(error = %err, "proxy sweep failed; will retry next tick");
        }
    }

    async fn sweep_kind(&self, kind: &str) -> Result<(), crate::registry::RegistryError> {
        let scores = self.store.heartbeat_scores(kind).await?;
        let now = now_ms();
        for (id, last_heartbeat_ms) in scores {
            let delta_ms = now.saturating_sub(last_heartbeat_ms as u64);
            if delta_ms >= self.config.dead_timeout.as_millis() as u64 {
                self.mark_dead(kind, &id).await;
            } else if delta_ms >= self.config.unavailable_timeout.as_millis() as u64 {
                self.mark_unavailable(kind, &id).await;
            } else {
                self.last_status.insert(id, Status::Available);
            }
        }
        Ok(())
    }

    async fn mark_unavailable(&self, kind: &str, id: &str) {
        let first_time = self
            .last_status
            .insert(id.to_string(), Status::Unavailable)
            .map(|prev| prev != Status::Unavailable)
            .unwrap_or(true);
        if first_time {
            tracing::info!(kind, id, "identity transitioned to UNAVAILABLE");
        }
        let result = if kind == "server" {
            self.store.update_server_status(id, Status::Unavailable).await
        } else {
            self.mark_proxy_unavailable(id).await
        };
        if let Err(err) = result {
            tracing::warn!(kind, id, error = %err, "failed to persist UNAVAILABLE status");
        }
    }

    async fn mark_proxy_unavailable(&self, id: &str) -> Result<(), crate::registry::RegistryError> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = conn.get(crate::registry::proxy_active_doc(id)).await?;
        let Some(raw) = raw else {
            return Ok(());
        };
        let mut identity: Identity = serde_json::from_str(&raw)?;
        identity.status = Status::Unavailable;
        let doc = serde_json::to_string(&identity)?;
        conn.set::<_, _, ()>(crate::registry::proxy_active_doc(id), &doc).await?;
        let unavailable_doc = serde_json::json!({ "proxy": identity, "unavailableSince": now_ms() });
        conn.set::<_, _, ()>(crate::registry::proxy_unavailable_doc(id), unavailable_doc.to_string())
            .await?;
        Ok(())
    }

    async fn mark_dead(&self, kind: &str, id: &str) {
        self.last_status.insert(id.to_string(), Status::Dead);
        if let Err(err) = self.transition_to_dead(kind, id).await {
            tracing::warn!(kind, id, error = %err, "failed to persist DEAD status");
            return;
        }
        tracing::warn!(kind, id, "identity transitioned to DEAD");
        let dead_since_ms = now_ms();
        let notify = if kind == "server" {
            self.bus
                .broadcast(&ServerDeregisteredNotice {
                    server_id: id.to_string(),
                    dead_since_ms,
                })
                .await
        } else {
            self.bus
                .broadcast(&ProxyDeadNotice {
                    proxy_id: id.to_string(),
                    dead_since_ms,
                })
                .await
        };
        if let Err(err) = notify {
            tracing::warn!(kind, id, error = %err, "failed to publish dead notice");
        }
    }

    async fn transition_to_dead(&self, kind: &str, id: &str) -> Result<(), crate::registry::RegistryError> {
        if kind == "server" {
            let record: Option<ServerRecord> = {
                let mut conn = self.conn.lock().await;
                let raw: Option<String> = conn.get(crate::registry::server_doc(id)).await?;
                raw.map(|raw| serde_json::from_str(&raw)).transpose()?
            };
            let Some(mut record) = record else { return Ok(()) };
            record.identity.status = Status::Dead;
            let snapshot = serde_json::to_string(&record)?;
            self.store.store_dead_snapshot("server", id, &snapshot).await?;
            self.store.unregister_server(id).await?;
        } else {
            let identity: Option<Identity> = {
                let mut conn = self.conn.lock().await;
                let raw: Option<String> = conn.get(crate::registry::proxy_active_doc(id)).await?;
                raw.map(|raw| serde_json::from_str(&raw)).transpose()?
            };
            let Some(mut identity) = identity else { return Ok(()) };
            identity.status = Status::Dead;
            let snapshot = serde_json::to_string(&identity)?;
            self.store.store_dead_snapshot("proxy", id, &snapshot).await?;
            self.store.unregister_proxy(id).await?;
            let mut conn = self.conn.lock().await;
            conn.del::<_, ()>(crate::registry::proxy_unavailable_doc(id)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeouts_are_ordered() {
        assert!(UNAVAILABLE_TIMEOUT < DEAD_TIMEOUT);
        assert!(SWEEP_PERIOD < UNAVAILABLE_TIMEOUT);
    }
}
