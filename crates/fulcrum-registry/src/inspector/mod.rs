//! Read-only aggregate views over the registry. Tolerates partial reads: a
//! dead id with no surviving snapshot (TTL raced past under load) still
//! appears, as a placeholder, rather than silently vanishing from the view.

use std::sync::Arc;

use fulcrum_common::model::{Identity, Kind, RegistrationState, ServerRecord, Status};

use crate::registry::{RegistryError, RegistryStore};

#[derive(Debug, Clone)]
pub struct ServerView {
    pub snapshot: ServerRecord,
    pub recently_dead: bool,
    pub dead_since: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProxyView {
    pub proxy_id: String,
    pub address: String,
    pub port: u16,
    pub status: Status,
    pub registration_state: RegistrationState,
    pub last_heartbeat: u64,
    pub recently_dead: bool,
    pub dead_since: Option<u64>,
    pub unavailable_since: Option<u64>,
    pub version: Option<String>,
}

pub struct Inspector {
    store: Arc<RegistryStore>,
}

impl Inspector {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }

    /// Active servers plus any still inside the dead-snapshot TTL window.
    /// On `StorageUnavailable` this logs and returns an empty vector rather
    /// than propagating, matching the fallback policy for read paths.
    pub async fn servers(&self) -> Vec<ServerView> {
        match self.servers_inner().await {
            Ok(views) => views,
            Err(err) => {
                tracing::error!(error = %err, "registry unavailable; returning empty server view");
                Vec::new()
            }
        }
    }

    async fn servers_inner(&self) -> Result<Vec<ServerView>, RegistryError> {
        let mut views: Vec<ServerView> = self
            .store
            .load_all_servers()
            .await?
            .into_iter()
            .map(|snapshot| ServerView {
                snapshot,
                recently_dead: false,
                dead_since: None,
            })
            .collect();

        for (id, dead_since) in self.store.dead_ids("server").await? {
            let snapshot = match self.store.dead_snapshot_json("server", &id).await? {
                Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| placeholder_server(&id)),
                None => placeholder_server(&id),
            };
            views.push(ServerView {
                snapshot,
                recently_dead: true,
                dead_since: Some(dead_since as u64),
            });
        }
        Ok(views)
    }

    pub async fn proxies(&self) -> Vec<ProxyView> {
        match self.proxies_inner().await {
            Ok(views) => views,
            Err(err) => {
                tracing::error!(error = %err, "registry unavailable; returning empty proxy view");
                Vec::new()
            }
        }
    }

    async fn proxies_inner(&self) -> Result<Vec<ProxyView>, RegistryError> {
        let mut views = Vec::new();
        for identity in self.store.load_all_proxies().await? {
            let unavailable_since = if identity.status == Status::Unavailable {
                self.store.proxy_unavailable_since(&identity.id).await?
            } else {
                None
            };
            views.push(proxy_view_from(identity, false, None, unavailable_since));
        }

        for (id, dead_since) in self.store.dead_ids("proxy").await? {
            let identity = match self.store.dead_snapshot_json("proxy", &id).await? {
                Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| placeholder_proxy(&id)),
                None => placeholder_proxy(&id),
            };
            views.push(proxy_view_from(identity, true, Some(dead_since as u64), None));
        }
        Ok(views)
    }
}

fn proxy_view_from(
    identity: Identity,
    recently_dead: bool,
    dead_since: Option<u64>,
    unavailable_since: Option<u64>,
) -> ProxyView {
    ProxyView {
        proxy_id: identity.id,
        address: identity.address,
        port: identity.port,
        status: identity.status,
        registration_state: identity.registration_state,
        last_heartbeat: identity.last_heartbeat_ms,
        recently_dead,
        dead_since,
        unavailable_since,
        version: Some(identity.version),
    }
}

fn placeholder_server(id: &str) -> ServerRecord {
    ServerRecord {
        identity: placeholder_identity(id, Kind::Game),
        max_capacity: 0,
        player_count: 0,
        tps: 0.0,
        memory_usage: 0.0,
        cpu_usage: 0.0,
        slots: Default::default(),
    }
}

fn placeholder_proxy(id: &str) -> Identity {
    placeholder_identity(id, Kind::Proxy)
}

fn placeholder_identity(id: &str, kind: Kind) -> Identity {
    Identity {
        id: id.to_string(),
        temp_id: id.to_string(),
        instance_uuid: fulcrum_common::InstanceUuid::random(),
        address: String::new(),
        port: 0,
        kind,
        role: String::new(),
        registration_state: RegistrationState::Unregistered,
        status: Status::Dead,
        last_heartbeat_ms: 0,
        version: String::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn placeholder_server_is_marked_dead() {
        let record = placeholder_server("game-9");
        assert_eq!(record.identity.status, Status::Dead);
        assert_eq!(record.identity.id, "game-9");
    }
}
