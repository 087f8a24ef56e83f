//! Decoded dispatch events.
//!
//! Dispatch payloads are decoded by event name through a table built once
//! on first use. Names without an entry decode to [`GatewayEvent::Unknown`].

use crate::model::{ApplicationPartial, Channel, Message, Snowflake, User};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    #[serde(rename = "v")]
    pub version: u8,
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    /// `[index, total]`
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
    pub application: ApplicationPartial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildMemberRemove {
    pub guild_id: Snowflake,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildRoleDelete {
    pub guild_id: Snowflake,
    pub role_id: Snowflake,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDelete {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeleteBulk {
    pub ids: Vec<Snowflake>,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emoji {
    #[serde(default)]
    pub id: Option<Snowflake>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub animated: bool,
}

/// Payload of reaction add/remove
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: Snowflake,
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub emoji: Emoji,
    #[serde(default)]
    pub member: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRemoveAll {
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRemoveEmoji {
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub emoji: Emoji,
}

/// Known dispatch events, plus `Unknown` for names without a decoder.
///
/// Objects the client does not inspect (guilds, members, roles, interactions)
/// are kept as raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Ready(Box<Ready>),
    Resumed,
    GuildCreate(Value),
    GuildUpdate(Value),
    GuildDelete(UnavailableGuild),
    GuildMemberAdd(Value),
    GuildMemberRemove(GuildMemberRemove),
    GuildMemberUpdate(Value),
    GuildRoleCreate(Value),
    GuildRoleUpdate(Value),
    GuildRoleDelete(GuildRoleDelete),
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(Channel),
    ThreadCreate(Channel),
    ThreadUpdate(Channel),
    ThreadDelete(Value),
    ThreadListSync(Value),
    MessageCreate(Box<Message>),
    /// Partial message; only `id` and `channel_id` are guaranteed
    MessageUpdate(Value),
    MessageDelete(MessageDelete),
    MessageDeleteBulk(MessageDeleteBulk),
    MessageReactionAdd(Reaction),
    MessageReactionRemove(Reaction),
    MessageReactionRemoveAll(ReactionRemoveAll),
    MessageReactionRemoveEmoji(ReactionRemoveEmoji),
    InteractionCreate(Value),
    Unknown { name: String, data: Value },
}

impl GatewayEvent {
    /// The dispatch name this event was decoded from
    pub fn name(&self) -> &str {
        match self {
            Self::Ready(_) => "READY",
            Self::Resumed => "RESUMED",
            Self::GuildCreate(_) => "GUILD_CREATE",
            Self::GuildUpdate(_) => "GUILD_UPDATE",
            Self::GuildDelete(_) => "GUILD_DELETE",
            Self::GuildMemberAdd(_) => "GUILD_MEMBER_ADD",
            Self::GuildMemberRemove(_) => "GUILD_MEMBER_REMOVE",
            Self::GuildMemberUpdate(_) => "GUILD_MEMBER_UPDATE",
            Self::GuildRoleCreate(_) => "GUILD_ROLE_CREATE",
            Self::GuildRoleUpdate(_) => "GUILD_ROLE_UPDATE",
            Self::GuildRoleDelete(_) => "GUILD_ROLE_DELETE",
            Self::ChannelCreate(_) => "CHANNEL_CREATE",
            Self::ChannelUpdate(_) => "CHANNEL_UPDATE",
            Self::ChannelDelete(_) => "CHANNEL_DELETE",
            Self::ThreadCreate(_) => "THREAD_CREATE",
            Self::ThreadUpdate(_) => "THREAD_UPDATE",
            Self::ThreadDelete(_) => "THREAD_DELETE",
            Self::ThreadListSync(_) => "THREAD_LIST_SYNC",
            Self::MessageCreate(_) => "MESSAGE_CREATE",
            Self::MessageUpdate(_) => "MESSAGE_UPDATE",
            Self::MessageDelete(_) => "MESSAGE_DELETE",
            Self::MessageDeleteBulk(_) => "MESSAGE_DELETE_BULK",
            Self::MessageReactionAdd(_) => "MESSAGE_REACTION_ADD",
            Self::MessageReactionRemove(_) => "MESSAGE_REACTION_REMOVE",
            Self::MessageReactionRemoveAll(_) => "MESSAGE_REACTION_REMOVE_ALL",
            Self::MessageReactionRemoveEmoji(_) => "MESSAGE_REACTION_REMOVE_EMOJI",
            Self::InteractionCreate(_) => "INTERACTION_CREATE",
            Self::Unknown { name, .. } => name,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }
}

type DecodeFn = fn(Value) -> serde_json::Result<GatewayEvent>;

macro_rules! decoder {
    ($variant:expr) => {
        |d: Value| serde_json::from_value(d).map($variant)
    };
    ($variant:expr, boxed) => {
        |d: Value| serde_json::from_value(d).map(|v| $variant(Box::new(v)))
    };
}

static DECODERS: LazyLock<HashMap<&'static str, DecodeFn>> = LazyLock::new(|| {
    let entries: [(&'static str, DecodeFn); 27] = [
        ("READY", decoder!(GatewayEvent::Ready, boxed)),
        ("RESUMED", |_| Ok(GatewayEvent::Resumed)),
        ("GUILD_CREATE", |d| Ok(GatewayEvent::GuildCreate(d))),
        ("GUILD_UPDATE", |d| Ok(GatewayEvent::GuildUpdate(d))),
        ("GUILD_DELETE", decoder!(GatewayEvent::GuildDelete)),
        ("GUILD_MEMBER_ADD", |d| Ok(GatewayEvent::GuildMemberAdd(d))),
        ("GUILD_MEMBER_REMOVE", decoder!(GatewayEvent::GuildMemberRemove)),
        ("GUILD_MEMBER_UPDATE", |d| Ok(GatewayEvent::GuildMemberUpdate(d))),
        ("GUILD_ROLE_CREATE", |d| Ok(GatewayEvent::GuildRoleCreate(d))),
        ("GUILD_ROLE_UPDATE", |d| Ok(GatewayEvent::GuildRoleUpdate(d))),
        ("GUILD_ROLE_DELETE", decoder!(GatewayEvent::GuildRoleDelete)),
        ("CHANNEL_CREATE", decoder!(GatewayEvent::ChannelCreate)),
        ("CHANNEL_UPDATE", decoder!(GatewayEvent::ChannelUpdate)),
        ("CHANNEL_DELETE", decoder!(GatewayEvent::ChannelDelete)),
        ("THREAD_CREATE", decoder!(GatewayEvent::ThreadCreate)),
        ("THREAD_UPDATE", decoder!(GatewayEvent::ThreadUpdate)),
        ("THREAD_DELETE", |d| Ok(GatewayEvent::ThreadDelete(d))),
        ("THREAD_LIST_SYNC", |d| Ok(GatewayEvent::ThreadListSync(d))),
        ("MESSAGE_CREATE", decoder!(GatewayEvent::MessageCreate, boxed)),
        ("MESSAGE_UPDATE", |d| Ok(GatewayEvent::MessageUpdate(d))),
        ("MESSAGE_DELETE", decoder!(GatewayEvent::MessageDelete)),
        ("MESSAGE_DELETE_BULK", decoder!(GatewayEvent::MessageDeleteBulk)),
        ("MESSAGE_REACTION_ADD", decoder!(GatewayEvent::MessageReactionAdd)),
        ("MESSAGE_REACTION_REMOVE", decoder!(GatewayEvent::MessageReactionRemove)),
        ("MESSAGE_REACTION_REMOVE_ALL", decoder!(GatewayEvent::MessageReactionRemoveAll)),
        ("MESSAGE_REACTION_REMOVE_EMOJI", decoder!(GatewayEvent::MessageReactionRemoveEmoji)),
        ("INTERACTION_CREATE", |d| Ok(GatewayEvent::InteractionCreate(d))),
    ];
    entries.into_iter().collect()
});

/// Decode a dispatch payload by event name
pub fn decode(name: &str, data: Value) -> serde_json::Result<GatewayEvent> {
    match DECODERS.get(name) {
        Some(decode) => decode(data),
        None => Ok(GatewayEvent::Unknown {
            name: name.to_string(),
            data,
        }),
    }
}

/// Whether `name` has a decoder
pub fn is_known(name: &str) -> bool {
    DECODERS.contains_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ready_payload() -> Value {
        json!({
            "v": 10,
            "user": {"id": "100", "username": "bot", "bot": true},
            "guilds": [{"id": "1", "unavailable": true}],
            "session_id": "abc123",
            "resume_gateway_url": "wss://resume.example",
            "shard": [0, 2],
            "application": {"id": "100", "flags": 0}
        })
    }

    #[test]
    fn test_decode_ready() {
        let event = decode("READY", ready_payload()).unwrap();
        match event {
            GatewayEvent::Ready(ready) => {
                assert_eq!(ready.session_id, "abc123");
                assert_eq!(ready.shard, Some([0, 2]));
                assert_eq!(ready.user.id, Snowflake(100));
                assert_eq!(ready.guilds.len(), 1);
            }
            other => panic!("expected READY, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_resumed_ignores_payload() {
        assert_eq!(decode("RESUMED", Value::Null).unwrap(), GatewayEvent::Resumed);
    }

    #[test]
    fn test_decode_reaction() {
        let event = decode(
            "MESSAGE_REACTION_ADD",
            json!({
                "user_id": "1", "channel_id": "2", "message_id": "3",
                "emoji": {"id": null, "name": "\u{2753}"}
            }),
        )
        .unwrap();

        assert_eq!(event.name(), "MESSAGE_REACTION_ADD");
        match event {
            GatewayEvent::MessageReactionAdd(reaction) => {
                assert_eq!(reaction.message_id, Snowflake(3));
                assert_eq!(reaction.emoji.name.as_deref(), Some("\u{2753}"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_not_an_error() {
        let event = decode("TYPING_START", json!({"channel_id": "1"})).unwrap();
        assert!(event.is_unknown());
        assert_eq!(event.name(), "TYPING_START");
        assert!(!is_known("TYPING_START"));
    }

    #[test]
    fn test_malformed_known_event_fails() {
        assert!(decode("MESSAGE_DELETE", json!({"id": "x"})).is_err());
    }

    #[test]
    fn test_decoder_table_covers_known_events() {
        for name in DECODERS.keys() {
            assert!(is_known(name));
        }
        assert_eq!(DECODERS.len(), 27);
    }
}
