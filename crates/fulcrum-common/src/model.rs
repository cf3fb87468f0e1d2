//! Data model shared by every component: the shapes that get written to Redis,
//! carried in envelopes, and read back out by the inspector.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{PlayerId, ServerId, SlotId, SlotSuffix};

/// Whether an identity is a backend game server or an edge proxy.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Kind {
    Game,
    Proxy,
}

/// Liveness/availability status of an identity or a slot. Derived from
/// heartbeats and explicit transitions, never set directly by a client.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Available,
    Unavailable,
    Dead,
    Evacuating,
    Full,
}

/// The state of the registration state machine for an identity. See
/// `fulcrum-fsm` for the transition guard table that enforces which of these
/// are reachable from which.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Disconnected,
    Deregistering,
    #[serde(rename = "RE_REGISTERING")]
    ReRegistering,
    Failed,
}

impl RegistrationState {
    /// True iff the identity is fully registered and should be visible to
    /// slot dispatch and the inspector's "active" views.
    pub fn is_active(self) -> bool {
        matches!(self, RegistrationState::Registered)
    }
}

/// A server or proxy, uniquely identified once `id` is assigned by the
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Assigned by the registry on successful REGISTER. Stable for the
    /// lifetime of the process.
    pub id: ServerId,
    /// Chosen by the joining node until `id` is assigned.
    pub temp_id: String,
    pub instance_uuid: crate::ids::InstanceUuid,
    pub address: String,
    pub port: u16,
    pub kind: Kind,
    /// Informational only (e.g. "lobby", "auth").
    pub role: String,
    pub registration_state: RegistrationState,
    pub status: Status,
    /// Wall clock in ms, as observed by the registry on receipt of the last
    /// heartbeat — not the sender's own clock.
    pub last_heartbeat_ms: u64,
    pub version: String,
}

/// [`Identity`] plus the fields specific to a backend game server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    #[serde(flatten)]
    pub identity: Identity,
    pub max_capacity: u32,
    pub player_count: u32,
    pub tps: f32,
    pub memory_usage: f64,
    pub cpu_usage: f64,
    pub slots: HashMap<SlotSuffix, SlotRecord>,
}

impl ServerRecord {
    /// Effective load across this server's currently active slots, used by
    /// the dispatcher's tie-break ordering:
    /// `sum(onlinePlayers * playerEquivalentFactor) / 10 / maxCapacity`.
    pub fn effective_load(&self) -> f64 {
        if self.max_capacity == 0 {
            return f64::INFINITY;
        }
        let weighted: f64 = self
            .slots
            .values()
            .map(|slot| {
                let factor = slot
                    .metadata
                    .get("playerEquivalentFactor")
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(10);
                (slot.online_players as f64) * (factor as f64) / 10.0
            })
            .sum();
        weighted / self.max_capacity as f64
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotStatus {
    Available,
    Occupied,
    Evacuating,
    Dead,
}

/// A reservable capacity unit on a backend, corresponding to one
/// match/instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRecord {
    pub slot_id: SlotId,
    pub slot_suffix: SlotSuffix,
    pub owner_server_id: ServerId,
    pub status: SlotStatus,
    pub max_players: u32,
    pub online_players: u32,
    /// Spawn coords, target world, family, variant, `reservedFor`,
    /// `reservedAt`, and any other string-keyed metadata.
    pub metadata: HashMap<String, String>,
}

impl SlotRecord {
    pub fn has_capacity(&self) -> bool {
        self.status == SlotStatus::Available && self.online_players < self.max_players
    }

    pub fn reserve_for(&mut self, player: &PlayerId, now_ms: u64) {
        self.metadata
            .insert("reservedFor".to_string(), player.clone());
        self.metadata
            .insert("reservedAt".to_string(), now_ms.to_string());
    }
}

/// A minigame variant advertised by a backend on startup or hot-reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotFamilyDescriptor {
    pub family_id: String,
    pub variant_id: Option<String>,
    pub min_players: u32,
    pub max_players: u32,
    /// Scaled x10 integer; 10 == 1.0x load. Values below 10 are accepted
    /// (see `DESIGN.md`).
    pub player_equivalent_factor: i32,
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn slot(online: u32, max: u32, factor: i32) -> SlotRecord {
        SlotRecord {
            slot_id: "s1".into(),
            slot_suffix: "a".into(),
            owner_server_id: "game-1".into(),
            status: SlotStatus::Available,
            max_players: max,
            online_players: online,
            metadata: HashMap::from([(
                "playerEquivalentFactor".to_string(),
                factor.to_string(),
            )]),
        }
    }

    #[test]
    fn effective_load_weights_by_factor() {
        let mut server = ServerRecord {
            identity: test_identity(),
            max_capacity: 20,
            player_count: 8,
            tps: 20.0,
            memory_usage: 0.0,
            cpu_usage: 0.0,
            slots: HashMap::new(),
        };
        server.slots.insert("a".into(), slot(8, 16, 10));
        assert_eq!(server.effective_load(), 8.0 / 20.0);

        server.slots.insert("b".into(), slot(4, 16, 5));
        // (8*10/10 + 4*5/10) / 20 = (8 + 2) / 20
        assert_eq!(server.effective_load(), 10.0 / 20.0);
    }

    #[test]
    fn has_capacity_respects_status_and_player_count() {
        let mut s = slot(16, 16, 10);
        assert!(!s.has_capacity(), "full slot has no capacity");
        s.online_players = 15;
        assert!(s.has_capacity());
        s.status = SlotStatus::Occupied;
        assert!(!s.has_capacity(), "occupied slot has no capacity");
    }

    fn test_identity() -> Identity {
        Identity {
            id: "game-1".into(),
            temp_id: "temp-1".into(),
            instance_uuid: crate::ids::InstanceUuid::random(),
            address: "10.0.0.2".into(),
            port: 25565,
            kind: Kind::Game,
            role: "lobby".into(),
            registration_state: RegistrationState::Registered,
            status: Status::Available,
            last_heartbeat_ms: 0,
            version: "1.0.0".into(),
        }
    }
}
