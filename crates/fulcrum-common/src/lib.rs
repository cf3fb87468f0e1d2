//! Wire types, identifiers, and the envelope codec shared by every crate in
//! the fleet coordination core. Nothing in this crate talks to Redis or the
//! network directly — it is the vocabulary the other crates speak.

pub mod envelope;
pub mod ids;
pub mod messages;
pub mod model;

pub use envelope::{CodecError, Envelope, MessageSchema};
pub use ids::{CorrelationId, InstanceUuid, PlayerId, ProxyId, ServerId, SlotId, SlotSuffix};
pub use model::{
    Identity, Kind, RegistrationState, ServerRecord, SlotFamilyDescriptor, SlotRecord,
    SlotStatus, Status,
};
