//! Bus message handlers wiring inbound traffic into the registry, the
//! dispatcher, and the family cache.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fulcrum_bus::{MessageBus, MessageContext};
use fulcrum_common::messages::{
    FamilyAdvertise, Heartbeat, RegisterRequest, RegistrationResult, SlotAssignment, SlotRejection, SlotRequest,
};
use fulcrum_common::model::{Identity, Kind, RegistrationState, Status};
use fulcrum_dispatch::{Dispatcher, FamilyCache};
use fulcrum_fsm::StateMachine;
use fulcrum_registry::{HeartbeatMetrics, RegistryStore};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

pub struct Handlers {
    pub bus: Arc<MessageBus>,
    pub registry: Arc<RegistryStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub family_cache: Arc<FamilyCache>,
    pub registering_fsms: Arc<DashMap<String, Arc<StateMachine>>>,
    pub registering_watchdog: std::time::Duration,
}

impl Handlers {
    /// Registers all subscribers on `bus`. Must run after
    /// `fulcrum_common::messages::register_all`.
    pub fn install(self: &Arc<Self>) {
        let handlers = Arc::clone(self);
        self.bus.subscribe::<RegisterRequest, _>(move |request, context| {
            let handlers = Arc::clone(&handlers);
            tokio::spawn(async move { handlers.handle_register(request, context).await });
        });

        let handlers = Arc::clone(self);
        self.bus.subscribe::<Heartbeat, _>(move |heartbeat, _context| {
            let handlers = Arc::clone(&handlers);
            tokio::spawn(async move { handlers.handle_heartbeat(heartbeat).await });
        });

        let handlers = Arc::clone(self);
        self.bus.subscribe::<FamilyAdvertise, _>(move |advertise, _context| {
            handlers.family_cache.apply_advertise(&advertise);
        });

        let handlers = Arc::clone(self);
        self.bus.subscribe::<SlotRequest, _>(move |request, context| {
            let handlers = Arc::clone(&handlers);
            tokio::spawn(async move { handlers.handle_slot_request(request, context).await });
        });
    }

    #[tracing::instrument(skip(self, request, context))]
    async fn handle_register(&self, request: RegisterRequest, context: MessageContext) {
        let fsm = self
            .registering_fsms
            .entry(request.temp_id.clone())
            .or_insert_with(|| StateMachine::with_registering_timeout(request.temp_id.clone(), self.registering_watchdog))
            .clone();

        if !fsm.transition_to(RegistrationState::Registering, "register received", None).await {
            tracing::warn!(temp_id = %request.temp_id, "register received while already registering");
        }

        let identity = Identity {
            id: String::new(),
            temp_id: request.temp_id.clone(),
            instance_uuid: request.instance_uuid,
            address: request.address.clone(),
            port: request.port,
            kind: request.kind,
            role: request.role.clone(),
            registration_state: RegistrationState::Registering,
            status: Status::Available,
            last_heartbeat_ms: now_ms(),
            version: request.version.clone(),
        };

        let outcome = match request.kind {
            Kind::Game => self.registry.register_server(identity, 0).await,
            Kind::Proxy => self.registry.register_proxy(identity).await,
        };

        match outcome {
            Ok(outcome) => {
                fsm.transition_to(RegistrationState::Registered, "registry ack", None).await;
                if let Err(err) = self.registry.mark_registered(request.kind, &outcome.id).await {
                    tracing::warn!(error = %err, id = %outcome.id, "failed to persist REGISTERED state");
                }
                let result = RegistrationResult {
                    id: outcome.id,
                    reclaimed: outcome.reclaimed,
                };
                if let Err(err) = self.bus.send(&context.sender, &result, context.correlation_id).await {
                    tracing::warn!(error = %err, "failed to publish registration result");
                }
            }
            Err(err) => {
                fsm.transition_to(RegistrationState::Failed, "registry error", Some(err.to_string()))
                    .await;
                tracing::error!(error = %err, temp_id = %request.temp_id, "registration failed");
            }
        }
    }

    #[tracing::instrument(skip(self, heartbeat))]
    async fn handle_heartbeat(&self, heartbeat: Heartbeat) {
        let metrics = HeartbeatMetrics {
            tps: heartbeat.tps,
            player_count: heartbeat.player_count,
            max_capacity: heartbeat.max_capacity,
            memory_usage: 0.0,
            cpu_usage: 0.0,
        };
        let result = match heartbeat.server_type {
            Kind::Game => self.registry.heartbeat_server(&heartbeat.server_id, metrics).await,
            Kind::Proxy => self.registry.heartbeat_proxy(&heartbeat.server_id).await,
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, server_id = %heartbeat.server_id, "heartbeat for unknown identity discarded");
        }
    }

    #[tracing::instrument(skip(self, request, context))]
    async fn handle_slot_request(&self, request: SlotRequest, context: MessageContext) {
        let Some(correlation_id) = context.correlation_id else {
            tracing::warn!("slot.request with no correlationId; dropping");
            return;
        };
        match self
            .dispatcher
            .dispatch(&request.player_id, &request.family_id, request.variant_id.as_deref())
            .await
        {
            Ok(assignment) => {
                let payload = SlotAssignment {
                    request_id: correlation_id,
                    server_id: assignment.server_id,
                    slot_id: assignment.slot_id,
                    metadata: assignment.metadata,
                };
                if let Err(err) = self.bus.send(&context.sender, &payload, Some(correlation_id)).await {
                    tracing::warn!(error = %err, "failed to publish slot assignment");
                }
            }
            Err(reason) => {
                let payload = SlotRejection {
                    request_id: correlation_id,
                    reason,
                };
                if let Err(err) = self.bus.send(&context.sender, &payload, Some(correlation_id)).await {
                    tracing::warn!(error = %err, "failed to publish slot rejection");
                }
            }
        }
    }
}
