//! Control surface: typed fleet commands delivered as bus messages.
//! Responses, where a target replies, ride the bus's ordinary
//! `correlationId` mechanism — this surface only covers the send side an
//! operator console or automation acts through.

use std::sync::Arc;

use fulcrum_bus::{BusError, MessageBus};
use fulcrum_common::messages::{BroadcastCommand, ServerRestartCommand, ServerShutdownCommand};

pub struct ControlSurface {
    bus: Arc<MessageBus>,
}

impl ControlSurface {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }

    /// Tells `target` to begin an orderly shutdown. The target's own state
    /// machine listener is responsible for flipping status to EVACUATING
    /// and driving REGISTERED → DEREGISTERING → UNREGISTERED.
    pub async fn shutdown_server(&self, target: &str, delay_seconds: u32, reason: &str) -> Result<(), BusError> {
        self.bus
            .send(
                target,
                &ServerShutdownCommand {
                    target: target.to_string(),
                    delay_seconds,
                    reason: reason.to_string(),
                },
                None,
            )
            .await
    }

    /// Shutdown followed by re-registration with the same `instanceUuid`,
    /// enabling reclaim once the target comes back up.
    pub async fn restart_server(&self, target: &str, delay_seconds: u32, reason: &str) -> Result<(), BusError> {
        self.bus
            .send(
                target,
                &ServerRestartCommand {
                    target: target.to_string(),
                    delay_seconds,
                    reason: reason.to_string(),
                },
                None,
            )
            .await
    }

    /// Forwards `message` to a single target's chat/messaging subsystem, or
    /// fleet-wide if `target` is `None`.
    pub async fn broadcast(&self, target: Option<&str>, message: &str) -> Result<(), BusError> {
        let command = BroadcastCommand {
            target: target.map(str::to_string),
            message: message.to_string(),
        };
        match target {
            Some(target) => self.bus.send(target, &command, None).await,
            None => self.bus.broadcast(&command).await,
        }
    }
}
