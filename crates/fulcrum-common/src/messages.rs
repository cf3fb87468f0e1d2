//! Payload types for every message the fleet coordination core exchanges,
//! plus the [`MessageSchema`] impls that bind them to their wire
//! `type`/`version`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::envelope::MessageSchema;
use crate::ids::{InstanceUuid, PlayerId, ServerId, SlotId};
use crate::model::{Kind, SlotFamilyDescriptor};

/// Sent by a joining node to begin registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub temp_id: String,
    pub instance_uuid: InstanceUuid,
    pub address: String,
    pub port: u16,
    pub kind: Kind,
    pub role: String,
    pub version: String,
}

impl MessageSchema for RegisterRequest {
    const TYPE: &'static str = "server.register";
    const VERSION: u32 = 1;
}

/// Response to [`RegisterRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    pub id: ServerId,
    pub reclaimed: bool,
}

impl MessageSchema for RegistrationResult {
    const TYPE: &'static str = "server.register.result";
    const VERSION: u32 = 1;
}

/// Emitted by every identity every `heartbeatPeriodMs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub server_id: ServerId,
    pub server_type: Kind,
    pub tps: f32,
    pub player_count: u32,
    pub max_capacity: u32,
    pub uptime: u64,
    pub role: String,
    pub available_pools: Vec<String>,
    pub status: crate::model::Status,
    /// Sender's wall clock, in ms. The sweeper uses receive time, not this
    /// field, for its sorted-set score.
    pub timestamp: u64,
}

impl MessageSchema for Heartbeat {
    const TYPE: &'static str = "server.heartbeat";
    const VERSION: u32 = 1;
}

/// Published by a backend on startup and on any hot-reload of its minigame
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyAdvertise {
    pub server_id: ServerId,
    pub descriptors: Vec<SlotFamilyDescriptor>,
}

impl MessageSchema for FamilyAdvertise {
    const TYPE: &'static str = "family.advertise";
    const VERSION: u32 = 1;
}

/// A proxy's request to place a player into a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRequest {
    pub player_id: PlayerId,
    pub family_id: String,
    pub variant_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MessageSchema for SlotRequest {
    const TYPE: &'static str = "slot.request";
    const VERSION: u32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotAssignment {
    pub request_id: crate::ids::CorrelationId,
    pub server_id: ServerId,
    pub slot_id: SlotId,
    pub metadata: HashMap<String, String>,
}

impl MessageSchema for SlotAssignment {
    const TYPE: &'static str = "slot.assignment";
    const VERSION: u32 = 1;
}

/// Why a [`SlotRequest`] was rejected. Corresponds 1:1 to the dispatcher's
/// error kinds.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    NoBackendForFamily,
    NoBackendForVariant,
    NoCapacity,
    PlayerCooldown,
    TransientFailure,
}

impl RejectReason {
    /// A human-readable message suitable for surfacing to a player via
    /// `/play`.
    pub fn human_message(self) -> &'static str {
        match self {
            RejectReason::NoBackendForFamily => {
                "No backend is currently hosting that game."
            }
            RejectReason::NoBackendForVariant => {
                "No backend is currently hosting that variant."
            }
            RejectReason::NoCapacity => "That game is full right now.",
            RejectReason::PlayerCooldown => {
                "You're doing that too fast, try again in a moment."
            }
            RejectReason::TransientFailure => {
                "Something went wrong placing you, please try again."
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRejection {
    pub request_id: crate::ids::CorrelationId,
    pub reason: RejectReason,
}

impl MessageSchema for SlotRejection {
    const TYPE: &'static str = "slot.rejection";
    const VERSION: u32 = 1;
}

/// Tells a backend to begin an orderly shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerShutdownCommand {
    pub target: ServerId,
    pub delay_seconds: u32,
    pub reason: String,
}

impl MessageSchema for ServerShutdownCommand {
    const TYPE: &'static str = "server.shutdown";
    const VERSION: u32 = 1;
}

/// Shutdown followed by re-registration on restart with the same
/// `instanceUuid`, enabling reclaim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRestartCommand {
    pub target: ServerId,
    pub delay_seconds: u32,
    pub reason: String,
}

impl MessageSchema for ServerRestartCommand {
    const TYPE: &'static str = "server.restart";
    const VERSION: u32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastCommand {
    pub target: Option<ServerId>,
    pub message: String,
}

impl MessageSchema for BroadcastCommand {
    const TYPE: &'static str = "broadcast";
    const VERSION: u32 = 1;
}

/// Emitted by the sweeper when a server transitions to DEAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDeregisteredNotice {
    pub server_id: ServerId,
    pub dead_since_ms: u64,
}

impl MessageSchema for ServerDeregisteredNotice {
    const TYPE: &'static str = "server.deregistered";
    const VERSION: u32 = 1;
}

/// Emitted by the sweeper when a proxy transitions to DEAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyDeadNotice {
    pub proxy_id: crate::ids::ProxyId,
    pub dead_since_ms: u64,
}

impl MessageSchema for ProxyDeadNotice {
    const TYPE: &'static str = "proxy.dead";
    const VERSION: u32 = 1;
}

/// Registers every payload type defined in this module. Must be called once
/// at process startup, before any `subscribe` call.
pub fn register_all() {
    crate::envelope::register_schema::<RegisterRequest>();
    crate::envelope::register_schema::<RegistrationResult>();
    crate::envelope::register_schema::<Heartbeat>();
    crate::envelope::register_schema::<FamilyAdvertise>();
    crate::envelope::register_schema::<SlotRequest>();
    crate::envelope::register_schema::<SlotAssignment>();
    crate::envelope::register_schema::<SlotRejection>();
    crate::envelope::register_schema::<ServerShutdownCommand>();
    crate::envelope::register_schema::<ServerRestartCommand>();
    crate::envelope::register_schema::<BroadcastCommand>();
    crate::envelope::register_schema::<ServerDeregisteredNotice>();
    crate::envelope::register_schema::<ProxyDeadNotice>();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn human_messages_are_distinct_per_reason() {
        let all = [
            RejectReason::NoBackendForFamily,
            RejectReason::NoBackendForVariant,
            RejectReason::NoCapacity,
            RejectReason::PlayerCooldown,
            RejectReason::TransientFailure,
        ];
        let messages: std::collections::HashSet<_> =
            all.iter().map(|r| r.human_message()).collect();
        assert_eq!(messages.len(), all.len());
    }
}
