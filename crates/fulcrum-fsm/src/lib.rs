//! Per-identity registration state machine.
//!
//! One [`StateMachine`] exists per server or proxy identity; the owning
//! `fulcrum-registry` keys instances by identity id. Transitions are
//! serialized through an async mutex (the watchdog and listener dispatch are
//! themselves async tasks), journaled into a bounded ring, and broadcast to
//! listeners outside the lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fulcrum_common::RegistrationState;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const RING_CAPACITY: usize = 10;
const DEFAULT_REGISTERING_TIMEOUT: Duration = Duration::from_secs(30);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Whether `from -> to` is a permitted transition.
fn allowed(from: RegistrationState, to: RegistrationState) -> bool {
    use RegistrationState::*;
    matches!(
        (from, to),
        (Unregistered, Registering)
            | (Registering, Registered)
            | (Registering, Failed)
            | (Registered, Disconnected)
            | (Registered, Deregistering)
            | (Registered, ReRegistering)
            | (Disconnected, ReRegistering)
            | (ReRegistering, Registered)
            | (ReRegistering, Failed)
            | (Failed, Registering)
            | (Deregistering, Unregistered)
    )
}

/// A single recorded transition, as journaled into the state machine's ring.
#[derive(Debug, Clone)]
pub struct StateTransitionEvent {
    pub from: RegistrationState,
    pub to: RegistrationState,
    pub timestamp_ms: u64,
    pub reason: String,
    pub error: Option<String>,
}

/// Invoked after a successful transition, once the mutex guard has been
/// dropped. Must not block; do expensive work via `tokio::spawn` inside the
/// listener itself if needed.
pub type Listener = Box<dyn Fn(&StateTransitionEvent) + Send + Sync>;

struct Inner {
    state: RegistrationState,
    history: VecDeque<StateTransitionEvent>,
    watchdog: Option<JoinHandle<()>>,
}

/// The registration state machine for one identity. Always held behind an
/// `Arc` since the REGISTERING watchdog needs a handle back to `self` to
/// drive the automatic FAILED transition on timeout.
pub struct StateMachine {
    /// Label used in tracing spans; usually the identity's `tempId`/`id`.
    label: String,
    inner: Mutex<Inner>,
    listeners: StdMutex<Vec<Listener>>,
    registering_timeout: Duration,
}

impl StateMachine {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Self::with_registering_timeout(label, DEFAULT_REGISTERING_TIMEOUT)
    }

    pub fn with_registering_timeout(label: impl Into<String>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            inner: Mutex::new(Inner {
                state: RegistrationState::Unregistered,
                history: VecDeque::with_capacity(RING_CAPACITY),
                watchdog: None,
            }),
            listeners: StdMutex::new(Vec::new()),
            registering_timeout: timeout,
        })
    }

    pub async fn current_state(&self) -> RegistrationState {
        self.inner.lock().await.state
    }

    pub async fn history(&self) -> Vec<StateTransitionEvent> {
        self.inner.lock().await.history.iter().cloned().collect()
    }

    pub fn add_state_change_listener(&self, listener: Listener) {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(listener);
    }

    /// Attempts `from -> to`. Returns `false` with no side effect if the
    /// transition is not permitted from the current state, or if another
    /// caller already moved the state machine elsewhere first.
    #[tracing::instrument(skip(self, error), fields(label = %self.label))]
    pub async fn transition_to(
        self: &Arc<Self>,
        to: RegistrationState,
        reason: impl Into<String> + std::fmt::Debug,
        error: Option<String>,
    ) -> bool {
        let reason = reason.into();
        let event = {
            let mut guard = self.inner.lock().await;
            if !allowed(guard.state, to) {
                tracing::debug!(from = ?guard.state, to = ?to, "rejected transition");
                return false;
            }
            let event = StateTransitionEvent {
                from: guard.state,
                to,
                timestamp_ms: now_ms(),
                reason,
                error,
            };
            guard.state = to;
            if guard.history.len() == RING_CAPACITY {
                guard.history.pop_front();
            }
            guard.history.push_back(event.clone());

            if let Some(handle) = guard.watchdog.take() {
                handle.abort();
            }
            if to == RegistrationState::Registering {
                guard.watchdog = Some(self.spawn_watchdog());
            }
            event
        };

        tracing::info!(from = ?event.from, to = ?event.to, reason = %event.reason, "state transition");
        self.notify_listeners(event);
        true
    }

    fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let machine = Arc::clone(self);
        let timeout = self.registering_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            machine
                .transition_to(
                    RegistrationState::Failed,
                    "registering watchdog expired",
                    Some(format!("no REGISTERED transition within {timeout:?}")),
                )
                .await;
        })
    }

    fn notify_listeners(&self, event: StateTransitionEvent) {
        let listeners = self.listeners.lock().expect("listener list poisoned");
        if listeners.is_empty() {
            return;
        }
        // Fired synchronously, after the mutex guard above has already been
        // dropped; a listener that wants to do expensive work should spawn
        // its own task rather than block this call.
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Forces a direct jump to UNREGISTERED, bypassing the transition table,
    /// and clears history except for the reset event itself.
    pub async fn reset(self: &Arc<Self>, reason: impl Into<String>) {
        let event = {
            let mut guard = self.inner.lock().await;
            let event = StateTransitionEvent {
                from: guard.state,
                to: RegistrationState::Unregistered,
                timestamp_ms: now_ms(),
                reason: reason.into(),
                error: None,
            };
            guard.state = RegistrationState::Unregistered;
            guard.history.clear();
            guard.history.push_back(event.clone());
            if let Some(handle) = guard.watchdog.take() {
                handle.abort();
            }
            event
        };
        tracing::warn!(from = ?event.from, "state machine reset");
        self.notify_listeners(event);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use RegistrationState::*;

    #[tokio::test]
    async fn happy_path_reaches_registered() {
        let fsm = StateMachine::new("game-1");
        assert!(fsm.transition_to(Registering, "register received", None).await);
        assert!(fsm.transition_to(Registered, "registry ack", None).await);
        assert_eq!(fsm.current_state().await, Registered);
    }

    #[tokio::test]
    async fn disallowed_transition_is_rejected_without_side_effect() {
        let fsm = StateMachine::new("game-1");
        assert!(!fsm.transition_to(Registered, "skip ahead", None).await);
        assert_eq!(fsm.current_state().await, Unregistered);
        assert!(fsm.history().await.is_empty());
    }

    #[tokio::test]
    async fn retry_after_failed_is_permitted() {
        let fsm = StateMachine::new("game-1");
        fsm.transition_to(Registering, "a", None).await;
        fsm.transition_to(Failed, "redis unreachable", Some("connection refused".into()))
            .await;
        assert!(fsm.transition_to(Registering, "retry", None).await);
        assert_eq!(fsm.current_state().await, Registering);
    }

    #[tokio::test]
    async fn ring_is_bounded_to_ten_events() {
        let fsm = StateMachine::new("game-1");
        for _ in 0..20 {
            fsm.transition_to(Registering, "a", None).await;
            fsm.transition_to(Failed, "b", None).await;
            fsm.transition_to(Registering, "c", None).await;
        }
        assert!(fsm.history().await.len() <= 10);
    }

    #[tokio::test]
    async fn listeners_fire_on_successful_transition() {
        let fsm = StateMachine::new("game-1");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        fsm.add_state_change_listener(Box::new(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        fsm.transition_to(Registering, "a", None).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // rejected transitions must not notify listeners
        fsm.transition_to(Deregistering, "bad", None).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn registering_watchdog_forces_failed_after_timeout() {
        let fsm = StateMachine::with_registering_timeout("game-1", Duration::from_secs(30));
        fsm.transition_to(Registering, "register received", None).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        // allow the spawned watchdog task to run
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(fsm.current_state().await, Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_registering_cancels_watchdog() {
        let fsm = StateMachine::with_registering_timeout("game-1", Duration::from_secs(30));
        fsm.transition_to(Registering, "register received", None).await;
        fsm.transition_to(Registered, "registry ack", None).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(fsm.current_state().await, Registered);
    }

    #[tokio::test]
    async fn reset_clears_history_except_reset_event() {
        let fsm = StateMachine::new("game-1");
        fsm.transition_to(Registering, "a", None).await;
        fsm.transition_to(Registered, "b", None).await;
        fsm.reset("operator requested reset").await;
        assert_eq!(fsm.current_state().await, Unregistered);
        let history = fsm.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to, Unregistered);
    }
}
