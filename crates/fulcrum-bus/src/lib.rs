//! Single-process facade over Redis pub/sub providing `broadcast`, `send`,
//! `request`, and `subscribe`/`unsubscribe`. At-most-once delivery; the
//! system is expected to tolerate loss via periodic reconciliation
//! elsewhere (re-registration on reconnect, heartbeats, inspector re-scan).

mod channels;
mod error;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use fulcrum_common::{CorrelationId, Envelope, MessageSchema};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot};

pub use error::BusError;

const HANDLER_QUEUE_DEPTH: usize = 256;

/// Addressing metadata carried alongside a decoded payload into a
/// [`MessageBus::subscribe`] handler, sufficient to address a reply via
/// [`MessageBus::send`].
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub sender: String,
    pub correlation_id: Option<CorrelationId>,
}

/// A bus-owned façade over one Redis connection pair (one for publishing,
/// one dedicated pub/sub connection for receiving).
pub struct MessageBus {
    publish_conn: tokio::sync::Mutex<ConnectionManager>,
    identity: ArcSwap<String>,
    correlations: DashMap<CorrelationId, oneshot::Sender<serde_json::Value>>,
    subscriptions: DashMap<&'static str, mpsc::Sender<Envelope>>,
}

impl MessageBus {
    /// Connects to `redis_url`, registers the broadcast/direct/reply
    /// psubscribe patterns, and spawns the background dispatch task.
    /// `initial_identity` should be the node's `tempId` prior to REGISTER.
    pub async fn connect(
        redis_url: &str,
        initial_identity: impl Into<String>,
    ) -> Result<Arc<Self>, BusError> {
        let client = redis::Client::open(redis_url)?;
        let publish_conn = ConnectionManager::new(client.clone()).await?;
        let pubsub_conn = client.get_async_connection().await?;
        let mut pubsub = pubsub_conn.into_pubsub();
        pubsub.psubscribe(channels::BROADCAST_PATTERN).await?;
        pubsub.psubscribe(channels::DIRECT_PATTERN).await?;
        pubsub.psubscribe(channels::REPLY_PATTERN).await?;

        let bus = Arc::new(Self {
            publish_conn: tokio::sync::Mutex::new(publish_conn),
            identity: ArcSwap::from_pointee(initial_identity.into()),
            correlations: DashMap::new(),
            subscriptions: DashMap::new(),
        });

        let dispatch_target = Arc::clone(&bus);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                dispatch_target.handle_message(msg).await;
            }
            tracing::warn!("pub/sub stream ended; no further bus messages will be delivered");
        });

        Ok(bus)
    }

    /// The node's current addressable id: its `tempId` before REGISTER
    /// completes, then the registry-assigned `id` after
    /// [`Self::refresh_server_identity`].
    pub fn current_server_id(&self) -> String {
        (**self.identity.load()).clone()
    }

    /// Swaps in the registry-assigned id so that `direct`/`reply` filtering
    /// matches going forward. Called by the owning state machine on its
    /// transition to REGISTERED.
    pub fn refresh_server_identity(&self, new_id: impl Into<String>) {
        self.identity.store(Arc::new(new_id.into()));
    }

    #[tracing::instrument(skip(self, payload))]
    pub async fn broadcast<T: MessageSchema>(&self, payload: &T) -> Result<(), BusError> {
        let sender = self.current_server_id();
        let bytes = fulcrum_common::envelope::encode(&sender, None, None, payload)?;
        let channel = channels::broadcast_channel(T::TYPE);
        self.publish_conn.lock().await.publish(channel, bytes).await?;
        Ok(())
    }

    /// Sends directly to `target`. When `correlation_id` is `Some`, this is
    /// understood to be a reply to an outstanding [`Self::request`] and is
    /// published on the target's reply channel rather than its direct
    /// channel, so it does not also fan out to that identity's ordinary
    /// subscribers.
    #[tracing::instrument(skip(self, payload))]
    pub async fn send<T: MessageSchema>(
        &self,
        target: &str,
        payload: &T,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(), BusError> {
        let sender = self.current_server_id();
        let bytes = fulcrum_common::envelope::encode(&sender, Some(target), correlation_id, payload)?;
        let channel = match correlation_id {
            Some(_) => channels::reply_channel(target),
            None => channels::direct_channel(target),
        };
        self.publish_conn.lock().await.publish(channel, bytes).await?;
        Ok(())
    }

    /// Sends `payload` to `target` and waits up to `timeout` for a reply
    /// whose `correlationId` matches. The wait table entry is removed on
    /// both the success and timeout paths.
    #[tracing::instrument(skip(self, payload))]
    pub async fn request<T, R>(&self, target: &str, payload: &T, timeout: Duration) -> Result<R, BusError>
    where
        T: MessageSchema,
        R: MessageSchema,
    {
        let correlation_id = CorrelationId::random();
        let (tx, rx) = oneshot::channel();
        self.correlations.insert(correlation_id, tx);

        let sender = self.current_server_id();
        let bytes =
            fulcrum_common::envelope::encode(&sender, Some(target), Some(correlation_id), payload)?;
        let channel = channels::direct_channel(target);
        if let Err(err) = self.publish_conn.lock().await.publish::<_, _, ()>(channel, bytes).await {
            self.correlations.remove(&correlation_id);
            return Err(err.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(serde_json::from_value(value)?),
            Ok(Err(_)) | Err(_) => {
                self.correlations.remove(&correlation_id);
                Err(BusError::Timeout)
            }
        }
    }

    /// Registers `handler` for `T::TYPE`. Handlers for a given type are
    /// invoked sequentially, in publication order, by a dedicated consumer
    /// task — a handler that panics or whose decode fails is logged and does
    /// not affect sibling types or later messages of the same type.
    ///
    /// `handler` receives the decoded payload plus the [`MessageContext`]
    /// (sender and correlation id) needed to address a reply.
    pub fn subscribe<T, F>(&self, handler: F)
    where
        T: MessageSchema + Send + 'static,
        F: Fn(T, MessageContext) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Envelope>(HANDLER_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let context = MessageContext {
                    sender: envelope.sender.clone(),
                    correlation_id: envelope.correlation_id,
                };
                match envelope.decode_payload::<T>() {
                    Ok(payload) => {
                        let result =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(payload, context)));
                        if let Err(panic) = result {
                            tracing::error!(r#type = T::TYPE, panic = %panic_message(&panic), "handler panicked");
                        }
                    }
                    Err(err) => tracing::error!(r#type = T::TYPE, error = %err, "handler decode failed"),
                }
            }
        });
        self.subscriptions.insert(T::TYPE, tx);
    }

    pub fn unsubscribe<T: MessageSchema>(&self) {
        self.subscriptions.remove(T::TYPE);
    }

    async fn handle_message(&self, msg: redis::Msg) {
        let channel: String = msg.get_channel_name().to_string();
        let addressed_to_me = match channels::classify(&channel) {
            channels::ChannelKind::Broadcast => true,
            channels::ChannelKind::Direct { addressee } | channels::ChannelKind::Reply { addressee } => {
                addressee == self.current_server_id()
            }
            channels::ChannelKind::Unrecognized => {
                tracing::warn!(channel = %channel, "message on unrecognized channel");
                false
            }
        };
        if !addressed_to_me {
            return;
        }

        let payload: Vec<u8> = match msg.get_payload() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "could not read bus message payload");
                return;
            }
        };

        let envelope = match fulcrum_common::envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "could not decode bus envelope");
                return;
            }
        };

        if let Some(correlation_id) = envelope.correlation_id {
            if let Some((_, waiter)) = self.correlations.remove(&correlation_id) {
                let _ = waiter.send(envelope.payload);
                return;
            }
        }

        if let Some(sender) = self.subscriptions.get(envelope.r#type.as_str()) {
            if sender.send(envelope).await.is_err() {
                tracing::debug!("subscriber channel closed before delivery");
            }
        }
    }
}

/// Best-effort extraction of a readable message from a caught panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_swap_is_visible_immediately() {
        let identity = ArcSwap::from_pointee("temp-1".to_string());
        assert_eq!(**identity.load(), "temp-1");
        identity.store(Arc::new("game-1".to_string()));
        assert_eq!(**identity.load(), "game-1");
    }

    #[test]
    fn panic_message_extracts_str_and_string_payloads() {
        let result: std::thread::Result<()> = std::panic::catch_unwind(|| panic!("boom"));
        let Err(panic) = result else { unreachable!() };
        assert_eq!(panic_message(&panic), "boom");
    }
}
