//! The envelope codec: a bidirectional mapping between a typed payload
//! (discriminated by a registered `type` string and integer `version`) and a
//! self-describing envelope.
//!
//! Field names on the wire are exactly `type`, `sender`, `target`,
//! `correlationId`, `timestamp`, `version`, `payload`.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::CorrelationId;

/// Implemented by every payload type that can travel in an envelope.
/// Registration (`register`) is process-local and must happen before
/// `MessageBus::subscribe` is called for that type.
pub trait MessageSchema: Serialize + DeserializeOwned {
    const TYPE: &'static str;
    const VERSION: u32;

    /// Whether this handler accepts a wire-observed version. Default: exact
    /// match. Override to support multiple wire versions.
    fn accepts_version(version: u32) -> bool {
        version == Self::VERSION
    }
}

/// Process-local registry of known message types, keyed by `type`. Used by
/// `fulcrum-bus` to reject `subscribe` calls for unregistered types, and by
/// `decode` to distinguish "nobody knows this type" from "this payload
/// doesn't parse".
static SCHEMA_REGISTRY: OnceLock<RwLock<HashMap<&'static str, u32>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<&'static str, u32>> {
    SCHEMA_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers `T` so that its `type` string is known process-wide. Idempotent.
pub fn register_schema<T: MessageSchema>() {
    registry()
        .write()
        .expect("schema registry poisoned")
        .insert(T::TYPE, T::VERSION);
}

/// Whether `type_name` has been registered via [`register_schema`].
pub fn is_registered(type_name: &str) -> bool {
    registry()
        .read()
        .expect("schema registry poisoned")
        .contains_key(type_name)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("no schema registered for message type {0:?}")]
    UnknownType(String),
    #[error("malformed envelope or payload: {0}")]
    DecodeError(#[from] serde_json::Error),
    #[error("schema for {type_name:?} rejected wire version {wire_version}")]
    VersionMismatch {
        type_name: String,
        wire_version: u32,
    },
}

/// A decoded envelope whose payload has not yet been interpreted as a
/// concrete type. Unknown top-level fields on the wire are simply not read
/// here and so are implicitly preserved if this struct is ever re-serialized
/// (it is not — envelopes are terminal on decode — but payload-level unknown
/// fields are preserved explicitly, see [`crate::messages`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub r#type: String,
    pub sender: String,
    pub target: Option<String>,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: u64,
    pub version: u32,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Interprets `self.payload` as `T`, after checking that `self.type`
    /// matches `T::TYPE` and that `T` accepts `self.version`.
    pub fn decode_payload<T: MessageSchema>(&self) -> Result<T, CodecError> {
        if self.r#type != T::TYPE {
            return Err(CodecError::UnknownType(self.r#type.clone()));
        }
        if !T::accepts_version(self.version) {
            return Err(CodecError::VersionMismatch {
                type_name: self.r#type.clone(),
                wire_version: self.version,
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Encodes `payload` as a fresh envelope. `type`/`version` come from `T`'s
/// [`MessageSchema`] impl. Returns the bytes ready to publish on a bus
/// channel.
pub fn encode<T: MessageSchema>(
    sender: &str,
    target: Option<&str>,
    correlation_id: Option<CorrelationId>,
    payload: &T,
) -> Result<Vec<u8>, CodecError> {
    if !is_registered(T::TYPE) {
        return Err(CodecError::UnknownType(T::TYPE.to_string()));
    }
    let envelope = Envelope {
        r#type: T::TYPE.to_string(),
        sender: sender.to_string(),
        target: target.map(str::to_string),
        correlation_id,
        timestamp: now_ms(),
        version: T::VERSION,
        payload: serde_json::to_value(payload)?,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decodes raw bytes into an [`Envelope`] without interpreting the payload.
/// Fails with [`CodecError::DecodeError`] on malformed JSON, and with
/// [`CodecError::UnknownType`] if `type` has never been registered via
/// [`register_schema`].
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if !is_registered(&envelope.r#type) {
        return Err(CodecError::UnknownType(envelope.r#type));
    }
    Ok(envelope)
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u64,
    }

    impl MessageSchema for Ping {
        const TYPE: &'static str = "test.ping";
        const VERSION: u32 = 1;
    }

    #[test]
    fn roundtrip_preserves_payload() {
        register_schema::<Ping>();
        let bytes = encode("sender-1", Some("target-1"), None, &Ping { n: 42 }).unwrap();
        let envelope = decode(&bytes).unwrap();
        assert_eq!(envelope.r#type, "test.ping");
        assert_eq!(envelope.sender, "sender-1");
        assert_eq!(envelope.target.as_deref(), Some("target-1"));
        let payload: Ping = envelope.decode_payload().unwrap();
        assert_eq!(payload, Ping { n: 42 });
    }

    #[test]
    fn unregistered_type_is_rejected() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Unregistered;
        impl MessageSchema for Unregistered {
            const TYPE: &'static str = "test.never-registered";
            const VERSION: u32 = 1;
        }
        let err = encode("s", None, None, &Unregistered).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(_)));
    }

    #[test]
    fn decode_payload_rejects_wrong_type() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Pong {
            n: u64,
        }
        impl MessageSchema for Pong {
            const TYPE: &'static str = "test.pong";
            const VERSION: u32 = 1;
        }
        register_schema::<Ping>();
        register_schema::<Pong>();
        let bytes = encode("s", None, None, &Ping { n: 1 }).unwrap();
        let envelope = decode(&bytes).unwrap();
        let err = envelope.decode_payload::<Pong>().unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(_)));
    }

    #[test]
    fn wide_integers_survive_roundtrip() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Wide {
            big: u64,
        }
        impl MessageSchema for Wide {
            const TYPE: &'static str = "test.wide";
            const VERSION: u32 = 1;
        }
        register_schema::<Wide>();
        let value = Wide {
            big: u64::MAX - 1,
        };
        let bytes = encode("s", None, None, &value).unwrap();
        let envelope = decode(&bytes).unwrap();
        let back: Wide = envelope.decode_payload().unwrap();
        assert_eq!(back, value);
    }
}
