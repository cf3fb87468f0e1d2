//! Redis channel naming. Broadcasts fan out by message type; direct and
//! reply channels are addressed by identity id and filtered client-side
//! against [`crate::MessageBus::current_server_id`], since we psubscribe to
//! the wildcard pattern once and let identity refreshes just change what we
//! keep rather than forcing a Redis-level resubscribe.

pub const BROADCAST_PATTERN: &str = "fulcrum:bus:broadcast:*";
pub const DIRECT_PATTERN: &str = "fulcrum:bus:direct:*";
pub const REPLY_PATTERN: &str = "fulcrum:bus:reply:*";

const BROADCAST_PREFIX: &str = "fulcrum:bus:broadcast:";
const DIRECT_PREFIX: &str = "fulcrum:bus:direct:";
const REPLY_PREFIX: &str = "fulcrum:bus:reply:";

pub fn broadcast_channel(msg_type: &str) -> String {
    format!("{BROADCAST_PREFIX}{msg_type}")
}

pub fn direct_channel(target_id: &str) -> String {
    format!("{DIRECT_PREFIX}{target_id}")
}

pub fn reply_channel(target_id: &str) -> String {
    format!("{REPLY_PREFIX}{target_id}")
}

/// What a channel name means to us, once matched against a psubscribe
/// pattern. `addressee` is the suffix after the prefix for `Direct`/`Reply`.
pub enum ChannelKind<'a> {
    Broadcast,
    Direct { addressee: &'a str },
    Reply { addressee: &'a str },
    Unrecognized,
}

pub fn classify(channel: &str) -> ChannelKind<'_> {
    if channel.starts_with(BROADCAST_PREFIX) {
        ChannelKind::Broadcast
    } else if let Some(addressee) = channel.strip_prefix(DIRECT_PREFIX) {
        ChannelKind::Direct { addressee }
    } else if let Some(addressee) = channel.strip_prefix(REPLY_PREFIX) {
        ChannelKind::Reply { addressee }
    } else {
        ChannelKind::Unrecognized
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_recognizes_each_prefix() {
        assert!(matches!(classify("fulcrum:bus:broadcast:server.heartbeat"), ChannelKind::Broadcast));
        match classify("fulcrum:bus:direct:game-1") {
            ChannelKind::Direct { addressee } => assert_eq!(addressee, "game-1"),
            _ => panic!("expected Direct"),
        }
        match classify("fulcrum:bus:reply:game-1") {
            ChannelKind::Reply { addressee } => assert_eq!(addressee, "game-1"),
            _ => panic!("expected Reply"),
        }
        assert!(matches!(classify("unrelated:channel"), ChannelKind::Unrecognized));
    }
}
