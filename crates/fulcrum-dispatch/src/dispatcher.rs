//! Turns a `slot.request` into a `slot.assignment` or `slot.rejection`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fulcrum_common::messages::RejectReason;
use fulcrum_common::model::ServerRecord;
use fulcrum_common::PlayerId;
use fulcrum_registry::RegistryStore;

use crate::family_cache::FamilyCache;

pub const COOLDOWN: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;

pub struct Dispatcher {
    family_cache: Arc<FamilyCache>,
    registry: Arc<RegistryStore>,
    cooldowns: DashMap<PlayerId, Instant>,
}

/// A successful dispatch.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub server_id: String,
    pub slot_id: String,
    pub metadata: std::collections::HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(family_cache: Arc<FamilyCache>, registry: Arc<RegistryStore>) -> Self {
        Self {
            family_cache,
            registry,
            cooldowns: DashMap::new(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn dispatch(
        &self,
        player_id: &str,
        family_id: &str,
        variant_id: Option<&str>,
    ) -> Result<Assignment, RejectReason> {
        if let Some(last) = self.cooldowns.get(player_id) {
            if last.elapsed() < COOLDOWN {
                return Err(RejectReason::PlayerCooldown);
            }
        }

        let mut last_error = RejectReason::TransientFailure;
        for attempt in 0..=MAX_RETRIES {
            match self.attempt(family_id, variant_id, player_id).await {
                Ok(assignment) => {
                    self.cooldowns.insert(player_id.to_string(), Instant::now());
                    return Ok(assignment);
                }
                Err(RejectReason::TransientFailure) if attempt < MAX_RETRIES => {
                    tracing::debug!(attempt, "retrying dispatch after transient failure");
                    last_error = RejectReason::TransientFailure;
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_error)
    }

    async fn attempt(
        &self,
        family_id: &str,
        variant_id: Option<&str>,
        player_id: &str,
    ) -> Result<Assignment, RejectReason> {
        let candidates = self
            .family_cache
            .candidates(family_id, variant_id)
            .ok_or(RejectReason::NoBackendForFamily)?;
        if candidates.is_empty() {
            return Err(if variant_id.is_some() && self.family_cache.has_explicit_variants(family_id) {
                RejectReason::NoBackendForVariant
            } else {
                RejectReason::NoBackendForFamily
            });
        }

        let records = self.load_candidates(&candidates).await;
        let (server_id, slot_suffix) = pick_slot(&records).ok_or(RejectReason::NoCapacity)?;

        match self
            .registry
            .reserve_slot(&server_id, &slot_suffix, player_id)
            .await
        {
            Ok(Some(slot)) => Ok(Assignment {
                server_id,
                slot_id: slot.slot_id,
                metadata: slot.metadata,
            }),
            Ok(None) => Err(RejectReason::TransientFailure),
            Err(err) => {
                tracing::warn!(error = %err, "registry error while reserving slot");
                Err(RejectReason::TransientFailure)
            }
        }
    }

    async fn load_candidates(&self, candidates: &HashSet<String>) -> Vec<ServerRecord> {
        let mut records = Vec::with_capacity(candidates.len());
        for id in candidates {
            match self.registry.load_server(id).await {
                Ok(Some(record)) if record.identity.registration_state.is_active() => {
                    if record.identity.status == fulcrum_common::model::Status::Available {
                        records.push(record);
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(server_id = %id, error = %err, "failed to load candidate server"),
            }
        }
        records
    }
}

/// Step 4-5 of the dispatch algorithm: enumerate candidate slots across
/// `records`, then pick by lowest `onlinePlayers`, then lowest effective
/// load, then lexicographic `serverId`.
fn pick_slot(records: &[ServerRecord]) -> Option<(String, String)> {
    records
        .iter()
        .flat_map(|record| {
            record
                .slots
                .iter()
                .filter(|(_, slot)| slot.has_capacity())
                .map(move |(suffix, slot)| (record, suffix, slot))
        })
        .min_by(|(record_a, _, slot_a), (record_b, _, slot_b)| {
            slot_a
                .online_players
                .cmp(&slot_b.online_players)
                .then_with(|| {
                    record_a
                        .effective_load()
                        .partial_cmp(&record_b.effective_load())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| record_a.identity.id.cmp(&record_b.identity.id))
        })
        .map(|(record, suffix, _)| (record.identity.id.clone(), suffix.clone()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use fulcrum_common::model::{Identity, Kind, RegistrationState, SlotRecord, SlotStatus, Status};

    fn server(id: &str, slots: Vec<(&str, u32, u32)>) -> ServerRecord {
        let mut slot_map = HashMap::new();
        for (suffix, online, max) in slots {
            slot_map.insert(
                suffix.to_string(),
                SlotRecord {
                    slot_id: format!("{id}-{suffix}"),
                    slot_suffix: suffix.to_string(),
                    owner_server_id: id.to_string(),
                    status: SlotStatus::Available,
                    max_players: max,
                    online_players: online,
                    metadata: HashMap::new(),
                },
            );
        }
        ServerRecord {
            identity: Identity {
                id: id.to_string(),
                temp_id: id.to_string(),
                instance_uuid: fulcrum_common::InstanceUuid::random(),
                address: "10.0.0.1".into(),
                port: 25565,
                kind: Kind::Game,
                role: "game".into(),
                registration_state: RegistrationState::Registered,
                status: Status::Available,
                last_heartbeat_ms: 0,
                version: "1.0.0".into(),
            },
            max_capacity: 16,
            player_count: 0,
            tps: 20.0,
            memory_usage: 0.0,
            cpu_usage: 0.0,
            slots: slot_map,
        }
    }

    #[test]
    fn pick_slot_prefers_fewest_online_players() {
        let records = vec![server("game-1", vec![("a", 10, 16)]), server("game-2", vec![("a", 2, 16)])];
        let (server_id, _) = pick_slot(&records).unwrap();
        assert_eq!(server_id, "game-2");
    }

    #[test]
    fn pick_slot_skips_full_slots() {
        let records = vec![server("game-1", vec![("a", 16, 16)]), server("game-2", vec![("a", 10, 16)])];
        let (server_id, _) = pick_slot(&records).unwrap();
        assert_eq!(server_id, "game-2");
    }

    #[test]
    fn pick_slot_breaks_ties_lexicographically() {
        let records = vec![server("game-b", vec![("a", 5, 16)]), server("game-a", vec![("a", 5, 16)])];
        let (server_id, _) = pick_slot(&records).unwrap();
        assert_eq!(server_id, "game-a");
    }

    #[test]
    fn pick_slot_none_when_no_capacity_anywhere() {
        let records = vec![server("game-1", vec![("a", 16, 16)])];
        assert!(pick_slot(&records).is_none());
    }
}
