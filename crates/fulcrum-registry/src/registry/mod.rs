//! Redis-backed registry store. Each identity has exactly one logical
//! writer — the node hosting that identity's state machine — other nodes
//! only read. The heartbeat sweeper and the inspector are the two readers
//! inside this crate; `fulcrum-dispatch` is a third, external one.

mod keys;

use std::time::{SystemTime, UNIX_EPOCH};

use fulcrum_common::model::{Identity, Kind, RegistrationState, ServerRecord, SlotStatus, Status};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

pub use keys::{
    dead_snapshot, proxy_active_doc, proxy_unavailable_doc, server_doc, server_index, DEAD_PROXIES, DEAD_SERVERS,
    HEARTBEAT_PROXIES, HEARTBEAT_SERVERS,
};

/// How long a DEAD identity's snapshot survives before eviction, and (per
/// the open question in `DESIGN.md`) the de-facto reclaim window.
pub const SNAPSHOT_TTL_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("redis error: {0}")]
    Storage(#[from] redis::RedisError),
    #[error("malformed registry document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no registry entry for id {0:?}")]
    NotFound(String),
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Outcome of [`RegistryStore::register`].
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub id: String,
    pub reclaimed: bool,
}

/// Metrics carried on an inbound heartbeat, applied to the stored record.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatMetrics {
    pub tps: f32,
    pub player_count: u32,
    pub max_capacity: u32,
    pub memory_usage: f64,
    pub cpu_usage: f64,
}

pub struct RegistryStore {
    conn: tokio::sync::Mutex<ConnectionManager>,
}

impl RegistryStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn: tokio::sync::Mutex::new(conn),
        }
    }

    /// Registers a fresh game server, or reclaims an existing `id` if
    /// `instance_uuid` matches an entry still within the dead set (snapshot
    /// not yet expired). Proxies use [`Self::register_proxy`] instead, since
    /// they carry no capacity/slot fields.
    #[tracing::instrument(skip(self, identity))]
    pub async fn register_server(
        &self,
        mut identity: Identity,
        max_capacity: u32,
    ) -> Result<RegistrationOutcome, RegistryError> {
        let mut conn = self.conn.lock().await;
        let reclaimed_id = find_reclaimable(&mut conn, "server", &identity.instance_uuid.to_string()).await?;

        let (id, reclaimed) = match reclaimed_id {
            Some(id) => (id, true),
            None => (fresh_id(&mut conn, "server", &identity.kind).await?, false),
        };
        identity.id = id.clone();

        let record = ServerRecord {
            identity,
            max_capacity,
            player_count: 0,
            tps: 20.0,
            memory_usage: 0.0,
            cpu_usage: 0.0,
            slots: Default::default(),
        };
        let role = record.identity.role.clone();
        let doc = serde_json::to_string(&record)?;
        conn.set::<_, _, ()>(keys::server_doc(&id), doc).await?;
        conn.sadd::<_, _, ()>("registry:servers:all", &id).await?;
        conn.sadd::<_, _, ()>(keys::server_index(&role), &id).await?;
        conn.zadd::<_, _, _, ()>(keys::HEARTBEAT_SERVERS, &id, now_ms() as f64)
            .await?;

        if reclaimed {
            conn.zrem::<_, _, ()>(keys::DEAD_SERVERS, &id).await?;
            conn.del::<_, ()>(keys::dead_snapshot("server", &id)).await?;
        }

        Ok(RegistrationOutcome { id, reclaimed })
    }

    /// Registers a fresh proxy, or reclaims an existing `id` if
    /// `instance_uuid` matches an entry in the dead set (snapshot not yet
    /// expired) or the unavailable set (heartbeat lapsed but not yet DEAD).
    #[tracing::instrument(skip(self, identity))]
    pub async fn register_proxy(&self, mut identity: Identity) -> Result<RegistrationOutcome, RegistryError> {
        let mut conn = self.conn.lock().await;
        let instance_uuid = identity.instance_uuid.to_string();
        let reclaimed_id = match find_reclaimable(&mut conn, "proxy", &instance_uuid).await? {
            Some(id) => Some(id),
            None => find_unavailable_proxy(&mut conn, &instance_uuid).await?,
        };

        let (id, reclaimed) = match reclaimed_id {
            Some(id) => (id, true),
            None => (fresh_id(&mut conn, "proxy", &Kind::Proxy).await?, false),
        };
        identity.id = id.clone();

        let doc = serde_json::to_string(&identity)?;
        conn.set::<_, _, ()>(keys::proxy_active_doc(&id), doc).await?;
        conn.sadd::<_, _, ()>("registry:proxies:all", &id).await?;
        conn.zadd::<_, _, _, ()>(keys::HEARTBEAT_PROXIES, &id, now_ms() as f64)
            .await?;

        if reclaimed {
            conn.zrem::<_, _, ()>(keys::DEAD_PROXIES, &id).await?;
            conn.del::<_, ()>(keys::dead_snapshot("proxy", &id)).await?;
            conn.del::<_, ()>(keys::proxy_unavailable_doc(&id)).await?;
        }

        Ok(RegistrationOutcome { id, reclaimed })
    }

    /// Persists `registrationState = REGISTERED` on the stored document.
    /// Called once the caller's in-memory state machine has itself
    /// confirmed the REGISTERING → REGISTERED transition — without this,
    /// the dispatcher's `registrationState.isActive()` candidate filter
    /// never sees a freshly registered identity as eligible.
    #[tracing::instrument(skip(self))]
    pub async fn mark_registered(&self, kind: Kind, id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        match kind {
            Kind::Game => {
                let key = keys::server_doc(id);
                let raw: Option<String> = conn.get(&key).await?;
                let Some(raw) = raw else {
                    return Err(RegistryError::NotFound(id.to_string()));
                };
                let mut record: ServerRecord = serde_json::from_str(&raw)?;
                record.identity.registration_state = RegistrationState::Registered;
                conn.set::<_, _, ()>(&key, serde_json::to_string(&record)?).await?;
            }
            Kind::Proxy => {
                let key = keys::proxy_active_doc(id);
                let raw: Option<String> = conn.get(&key).await?;
                let Some(raw) = raw else {
                    return Err(RegistryError::NotFound(id.to_string()));
                };
                let mut identity: Identity = serde_json::from_str(&raw)?;
                identity.registration_state = RegistrationState::Registered;
                conn.set::<_, _, ()>(&key, serde_json::to_string(&identity)?).await?;
            }
        }
        Ok(())
    }

    /// Applies an inbound heartbeat: restores status to AVAILABLE, updates
    /// metrics, and bumps the sorted-set score to the receive timestamp.
    #[tracing::instrument(skip(self, metrics))]
    pub async fn heartbeat_server(&self, id: &str, metrics: HeartbeatMetrics) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        let key = keys::server_doc(id);
        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else {
            return Err(RegistryError::NotFound(id.to_string()));
        };
        let mut record: ServerRecord = serde_json::from_str(&raw)?;
        record.identity.status = Status::Available;
        record.identity.last_heartbeat_ms = now_ms();
        record.tps = metrics.tps;
        record.player_count = metrics.player_count;
        if metrics.max_capacity > 0 {
            record.max_capacity = metrics.max_capacity;
        }
        record.memory_usage = metrics.memory_usage;
        record.cpu_usage = metrics.cpu_usage;
        conn.set::<_, _, ()>(&key, serde_json::to_string(&record)?).await?;
        conn.zadd::<_, _, _, ()>(keys::HEARTBEAT_SERVERS, id, now_ms() as f64)
            .await?;
        Ok(())
    }

    pub async fn heartbeat_proxy(&self, id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        let key = keys::proxy_active_doc(id);
        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else {
            return Err(RegistryError::NotFound(id.to_string()));
        };
        let mut identity: Identity = serde_json::from_str(&raw)?;
        identity.status = Status::Available;
        identity.last_heartbeat_ms = now_ms();
        conn.set::<_, _, ()>(&key, serde_json::to_string(&identity)?).await?;
        conn.zadd::<_, _, _, ()>(keys::HEARTBEAT_PROXIES, id, now_ms() as f64)
            .await?;
        Ok(())
    }

    pub async fn update_server_status(&self, id: &str, status: Status) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        let key = keys::server_doc(id);
        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else {
            return Err(RegistryError::NotFound(id.to_string()));
        };
        let mut record: ServerRecord = serde_json::from_str(&raw)?;
        record.identity.status = status;
        conn.set::<_, _, ()>(&key, serde_json::to_string(&record)?).await?;
        Ok(())
    }

    pub async fn unregister_server(&self, id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        let key = keys::server_doc(id);
        let raw: Option<String> = conn.get(&key).await?;
        if let Some(raw) = raw {
            if let Ok(record) = serde_json::from_str::<ServerRecord>(&raw) {
                conn.srem::<_, _, ()>(keys::server_index(&record.identity.role), id).await?;
            }
        }
        conn.del::<_, ()>(key).await?;
        conn.srem::<_, _, ()>("registry:servers:all", id).await?;
        conn.zrem::<_, _, ()>(keys::HEARTBEAT_SERVERS, id).await?;
        Ok(())
    }

    pub async fn unregister_proxy(&self, id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        conn.del::<_, ()>(keys::proxy_active_doc(id)).await?;
        conn.srem::<_, _, ()>("registry:proxies:all", id).await?;
        conn.zrem::<_, _, ()>(keys::HEARTBEAT_PROXIES, id).await?;
        Ok(())
    }

    pub async fn load_all_servers(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        let mut conn = self.conn.lock().await;
        let ids: Vec<String> = conn.smembers("registry:servers:all").await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.get(keys::server_doc(&id)).await?;
            if let Some(raw) = raw {
                out.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(out)
    }

    pub async fn load_all_proxies(&self) -> Result<Vec<Identity>, RegistryError> {
        let mut conn = self.conn.lock().await;
        let ids: Vec<String> = conn.smembers("registry:proxies:all").await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.get(keys::proxy_active_doc(&id)).await?;
            if let Some(raw) = raw {
                out.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(out)
    }

    /// Writes a TTL'd snapshot of `json` and marks `id` dead in the sorted
    /// set scored by the moment of death. Called only by the sweeper.
    pub async fn store_dead_snapshot(&self, kind: &str, id: &str, json: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        let dead_set = if kind == "server" { keys::DEAD_SERVERS } else { keys::DEAD_PROXIES };
        conn.set_ex::<_, _, ()>(keys::dead_snapshot(kind, id), json, SNAPSHOT_TTL_SECS)
            .await?;
        conn.zadd::<_, _, _, ()>(dead_set, id, now_ms() as f64).await?;
        Ok(())
    }

    pub async fn clear_dead(&self, kind: &str, id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.lock().await;
        let dead_set = if kind == "server" { keys::DEAD_SERVERS } else { keys::DEAD_PROXIES };
        conn.zrem::<_, _, ()>(dead_set, id).await?;
        conn.del::<_, ()>(keys::dead_snapshot(kind, id)).await?;
        Ok(())
    }

    pub async fn dead_snapshot_json(&self, kind: &str, id: &str) -> Result<Option<String>, RegistryError> {
        let mut conn = self.conn.lock().await;
        Ok(conn.get(keys::dead_snapshot(kind, id)).await?)
    }

    /// Ids currently in the dead set, with the wall-clock ms at which they
    /// died, for the inspector's "recently dead" view.
    pub async fn dead_ids(&self, kind: &str) -> Result<Vec<(String, f64)>, RegistryError> {
        let mut conn = self.conn.lock().await;
        let dead_set = if kind == "server" { keys::DEAD_SERVERS } else { keys::DEAD_PROXIES };
        Ok(conn.zrange_withscores(dead_set, 0, -1).await?)
    }

    pub async fn proxy_unavailable_since(&self, id: &str) -> Result<Option<u64>, RegistryError> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = conn.get(keys::proxy_unavailable_doc(id)).await?;
        Ok(raw
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|value| value.get("unavailableSince").and_then(|v| v.as_u64())))
    }

    pub async fn heartbeat_scores(&self, kind: &str) -> Result<Vec<(String, f64)>, RegistryError> {
        let mut conn = self.conn.lock().await;
        let key = if kind == "server" { keys::HEARTBEAT_SERVERS } else { keys::HEARTBEAT_PROXIES };
        Ok(conn.zrange_withscores(key, 0, -1).await?)
    }

    /// Loads `server_id` fresh, for the dispatcher's re-check between its
    /// candidate selection and its reservation write.
    pub async fn load_server(&self, server_id: &str) -> Result<Option<ServerRecord>, RegistryError> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = conn.get(keys::server_doc(server_id)).await?;
        raw.map(|raw| serde_json::from_str(&raw)).transpose().map_err(Into::into)
    }

    /// Attempts to reserve one seat in `slot_suffix` on `server_id` for
    /// `player_id`. Returns `Ok(None)` if the server or slot no longer
    /// exists, or the slot no longer has capacity (the dispatcher interprets
    /// this as a signal to retry from candidate selection).
    #[tracing::instrument(skip(self))]
    pub async fn reserve_slot(
        &self,
        server_id: &str,
        slot_suffix: &str,
        player_id: &str,
    ) -> Result<Option<fulcrum_common::model::SlotRecord>, RegistryError> {
        let mut conn = self.conn.lock().await;
        let key = keys::server_doc(server_id);
        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else { return Ok(None) };
        let mut record: ServerRecord = serde_json::from_str(&raw)?;
        let Some(slot) = record.slots.get_mut(slot_suffix) else {
            return Ok(None);
        };
        if !slot.has_capacity() {
            return Ok(None);
        }
        slot.online_players += 1;
        if slot.online_players >= slot.max_players {
            slot.status = SlotStatus::Occupied;
        }
        slot.reserve_for(&player_id.to_string(), now_ms());
        let reserved = slot.clone();
        conn.set::<_, _, ()>(&key, serde_json::to_string(&record)?).await?;
        Ok(Some(reserved))
    }
}

async fn find_reclaimable(
    conn: &mut ConnectionManager,
    kind: &str,
    instance_uuid: &str,
) -> Result<Option<String>, RegistryError> {
    let dead_set = if kind == "server" { keys::DEAD_SERVERS } else { keys::DEAD_PROXIES };
    let dead_ids: Vec<String> = conn.zrange(dead_set, 0, -1).await?;
    for id in dead_ids {
        if let Some(raw) = conn.get::<_, Option<String>>(keys::dead_snapshot(kind, &id)).await? {
            if snapshot_matches_instance(&raw, instance_uuid) {
                return Ok(Some(id));
            }
        }
    }
    Ok(None)
}

/// Scans active proxy docs for one that's UNAVAILABLE (heartbeat lapsed,
/// not yet swept to DEAD) with a matching `instanceUuid`. The active doc
/// is left in place by `mark_proxy_unavailable`, only its `status` field
/// changes, so no separate "currently unavailable" index is needed.
async fn find_unavailable_proxy(
    conn: &mut ConnectionManager,
    instance_uuid: &str,
) -> Result<Option<String>, RegistryError> {
    let ids: Vec<String> = conn.smembers("registry:proxies:all").await?;
    for id in ids {
        if let Some(raw) = conn.get::<_, Option<String>>(keys::proxy_active_doc(&id)).await? {
            if let Ok(identity) = serde_json::from_str::<Identity>(&raw) {
                if identity.status == Status::Unavailable && identity.instance_uuid.to_string() == instance_uuid {
                    return Ok(Some(id));
                }
            }
        }
    }
    Ok(None)
}

fn snapshot_matches_instance(raw: &str, instance_uuid: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("instanceUuid").and_then(|v| v.as_str()).map(str::to_string))
        .map(|found| found == instance_uuid)
        .unwrap_or(false)
}

async fn fresh_id(conn: &mut ConnectionManager, kind: &str, identity_kind: &Kind) -> Result<String, RegistryError> {
    let prefix = match identity_kind {
        Kind::Game => "game",
        Kind::Proxy => "proxy",
    };
    let counter_key = format!("registry:{kind}:counter");
    let n: u64 = conn.incr(counter_key, 1u64).await?;
    Ok(format!("{prefix}-{n}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_matches_instance_compares_field() {
        let raw = r#"{"instanceUuid":"11111111-1111-1111-1111-111111111111","other":1}"#;
        assert!(snapshot_matches_instance(raw, "11111111-1111-1111-1111-111111111111"));
        assert!(!snapshot_matches_instance(raw, "22222222-2222-2222-2222-222222222222"));
    }
}
