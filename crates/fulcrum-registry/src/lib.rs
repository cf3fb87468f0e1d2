//! Redis-backed registry store, heartbeat sweeper, inspector, and control
//! surface. The inspector is folded in here rather than split into its own
//! crate: it has no reason to exist independent of the store it reads, and
//! the teacher's own crate boundaries follow ownership, not per-operation
//! granularity (see `DESIGN.md`).

pub mod control;
pub mod heartbeat;
pub mod inspector;
pub mod registry;

pub use control::ControlSurface;
pub use heartbeat::{Sweeper, SweeperConfig};
pub use inspector::{Inspector, ProxyView, ServerView};
pub use registry::{HeartbeatMetrics, RegistrationOutcome, RegistryError, RegistryStore, SNAPSHOT_TTL_SECS};
