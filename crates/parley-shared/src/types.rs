use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// The addressable container (channel, issue, document) owning a timeline.
    CardId
);
string_id!(
    /// A social identity of a message author.
    SocialId
);
string_id!(
    /// An account; owner of notification contexts.
    AccountId
);
string_id!(
    /// Identifier of an object in the external blob store.
    BlobId
);
string_id!(AttachmentId);
string_id!(ThreadId);
string_id!(ContextId);
string_id!(NotificationId);
string_id!(SessionId);

impl ContextId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl NotificationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Per-card monotonic message identifier.
///
/// Encoded on the wire as a decimal string so that JavaScript consumers
/// never lose precision; integers are accepted on input for older
/// producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(MessageId)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MessageIdVisitor;

        impl<'de> Visitor<'de> for MessageIdVisitor {
            type Value = MessageId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a message id as a decimal string or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<MessageId, E> {
                Ok(MessageId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<MessageId, E> {
                u64::try_from(v)
                    .map(MessageId)
                    .map_err(|_| E::custom(format!("negative message id: {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<MessageId, E> {
                v.parse().map_err(|_| E::custom(format!("invalid message id: {v:?}")))
            }
        }

        deserializer.deserialize_any(MessageIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_is_a_string_on_the_wire() {
        let json = serde_json::to_string(&MessageId(42)).unwrap();
        assert_eq!(json, "\"42\"");
    }

    #[test]
    fn message_id_accepts_legacy_integers() {
        let from_str: MessageId = serde_json::from_str("\"7\"").unwrap();
        let from_int: MessageId = serde_json::from_str("7").unwrap();
        assert_eq!(from_str, from_int);
        assert!(serde_json::from_str::<MessageId>("\"abc\"").is_err());
    }

    #[test]
    fn card_id_is_transparent() {
        let card = CardId::from("C1");
        assert_eq!(serde_json::to_string(&card).unwrap(), "\"C1\"");
        assert_eq!(card.to_string(), "C1");
    }
}
