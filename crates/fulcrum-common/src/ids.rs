//! Strongly typed identifiers.
//!
//! `ServerId`/`ProxyId`/`SlotId` are plain [`String`]s per the wire contract: they
//! are assigned by the registry (or, for slots, derived from the owning server's
//! id), not generated locally. `CorrelationId` and `InstanceUuid` are generated
//! locally and are true UUIDs, so they get the newtype-over-`Uuid` treatment.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! make_uuid {
    {$(
        $(#[$meta:meta])*
        $vis:vis struct $ident:ident;
    )*} => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
        $vis struct $ident(Uuid);

        impl $ident {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $ident {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $ident {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    )*}
}

make_uuid! {
    /// Correlates a `request`/response pair across the message bus. Required on
    /// any envelope that is part of a request/response exchange.
    pub struct CorrelationId;

    /// Stable across reclaim after a crash, within the reclaim grace window.
    /// Chosen by the joining node itself (not the registry).
    pub struct InstanceUuid;
}

/// A server or proxy identity, as assigned by the registry. Stable for the
/// lifetime of the process once assigned.
pub type ServerId = String;

/// See [`ServerId`].
pub type ProxyId = String;

/// Globally unique id of a [`crate::model::SlotRecord`].
pub type SlotId = String;

/// The local-to-server suffix of a slot id.
pub type SlotSuffix = String;

/// Player identity as understood by the fleet coordination core: an opaque,
/// stable string supplied by whatever authenticates players upstream.
pub type PlayerId = String;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn correlation_id_roundtrips_through_json() {
        let id = CorrelationId::random();
        let json = serde_json::to_string(&id).unwrap();
        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn distinct_ids_are_distinct() {
        assert_ne!(CorrelationId::random(), CorrelationId::random());
        assert_ne!(InstanceUuid::random(), InstanceUuid::random());
    }
}
