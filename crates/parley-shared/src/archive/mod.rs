//! Archive blob codec.
//!
//! A blob is a YAML stream of two documents: a [`FileMetadata`] header and
//! the list of messages in the archived range, each with its reactions,
//! attachments and thread folded in. Decoding accepts every shape written
//! since the format was introduced; encoding always writes the canonical
//! one.

pub mod migrations;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_yaml::Mapping;

use crate::error::{CommunicationError, Result, Violations};
use crate::model::{Attachment, Message, MessageType, Reaction, Thread};
use crate::types::{CardId, MessageId, SocialId, ThreadId};

use self::migrations::{migrate_attachments, MigrationContext, ATTACHMENT_MIGRATIONS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(alias = "card")]
    pub card_id: CardId,
    #[serde(default)]
    pub title: String,
    #[serde(deserialize_with = "flex_time::required")]
    pub from_date: DateTime<Utc>,
    #[serde(deserialize_with = "flex_time::required")]
    pub to_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReaction {
    pub reaction: String,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileThread {
    pub thread_id: ThreadId,
    pub thread_type: String,
    pub replies_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reply: Option<DateTime<Utc>>,
}

/// Canonical on-disk shape of one archived message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMessage {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub card_id: CardId,
    pub content: String,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<FileThread>,
    pub reactions: Vec<FileReaction>,
    pub attachments: Vec<Attachment>,
}

impl From<&Message> for FileMessage {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            message_type: m.message_type,
            card_id: m.card.clone(),
            content: m.content.clone(),
            creator: m.creator.clone(),
            created: m.created,
            edited: m.edited,
            removed: m.removed,
            extra: m.extra.clone(),
            thread: m.thread.as_ref().map(|t| FileThread {
                thread_id: t.thread_id.clone(),
                thread_type: t.thread_type.clone(),
                replies_count: t.replies_count,
                last_reply: t.last_reply,
            }),
            reactions: m
                .reactions
                .iter()
                .map(|r| FileReaction {
                    reaction: r.reaction.clone(),
                    creator: r.creator.clone(),
                    created: r.created,
                })
                .collect(),
            attachments: m.attachments.clone(),
        }
    }
}

/// A decoded archive: header plus messages in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveFile {
    pub metadata: FileMetadata,
    pub messages: Vec<Message>,
}

impl ArchiveFile {
    pub fn new(metadata: FileMetadata, messages: Vec<Message>) -> Self {
        Self { metadata, messages }
    }

    /// Header and messages must agree: same card, strictly ascending ids
    /// and every creation time inside the header's date range.
    pub fn validate(&self) -> Result<()> {
        let mut v = Violations::new();
        let meta = &self.metadata;

        v.check(meta.from_date <= meta.to_date, || {
            format!("fromDate {} is after toDate {}", meta.from_date, meta.to_date)
        });

        let mut previous: Option<MessageId> = None;
        for m in &self.messages {
            v.check(m.card == meta.card_id, || {
                format!("message {} belongs to card {}, not {}", m.id, m.card, meta.card_id)
            });
            v.check(previous.map_or(true, |p| p < m.id), || {
                format!("message {} is out of order", m.id)
            });
            v.check(m.created >= meta.from_date && m.created <= meta.to_date, || {
                format!("message {} created {} outside archive range", m.id, m.created)
            });
            previous = Some(m.id);
        }

        v.into_result()
    }

    pub fn encode(&self) -> Result<String> {
        encode(&self.metadata, &self.messages)
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// The archived message with the given id, if the range holds it.
    pub fn take_message(self, id: MessageId) -> Option<Message> {
        self.messages.into_iter().find(|m| m.id == id)
    }
}

/// Serialize a range of messages to the canonical two-document form.
pub fn encode(metadata: &FileMetadata, messages: &[Message]) -> Result<String> {
    let header = serde_yaml::to_string(metadata)?;
    let body: Vec<FileMessage> = messages.iter().map(FileMessage::from).collect();
    let body = serde_yaml::to_string(&body)?;
    Ok(format!("{header}---\n{body}"))
}

/// Parse an archive blob in any historical shape. The stream must hold
/// exactly two documents: metadata, then the message list.
pub fn decode(text: &str) -> Result<ArchiveFile> {
    let mut documents = serde_yaml::Deserializer::from_str(text);

    let metadata = documents
        .next()
        .ok_or_else(|| CommunicationError::Parse("archive has no metadata document".into()))?;
    let metadata = FileMetadata::deserialize(metadata)?;

    let body = documents
        .next()
        .ok_or_else(|| CommunicationError::Parse("archive has no messages document".into()))?;
    let raw = Option::<Vec<RawMessage>>::deserialize(body)?.unwrap_or_default();
    if documents.next().is_some() {
        return Err(CommunicationError::Parse(
            "archive has more than two documents".into(),
        ));
    }

    let messages = raw
        .into_iter()
        .map(|m| m.into_message(&metadata.card_id))
        .collect::<Result<Vec<_>>>()?;

    Ok(ArchiveFile { metadata, messages })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReaction {
    reaction: String,
    creator: SocialId,
    #[serde(deserialize_with = "flex_time::required")]
    created: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawThread {
    thread_id: ThreadId,
    thread_type: String,
    #[serde(default)]
    replies_count: u32,
    #[serde(default, deserialize_with = "flex_time::option")]
    last_reply: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: MessageId,
    #[serde(default, rename = "type")]
    message_type: MessageType,
    #[serde(default, alias = "card")]
    card_id: Option<CardId>,
    #[serde(default)]
    content: String,
    creator: SocialId,
    #[serde(deserialize_with = "flex_time::required")]
    created: DateTime<Utc>,
    #[serde(default, deserialize_with = "flex_time::option")]
    edited: Option<DateTime<Utc>>,
    #[serde(default)]
    removed: bool,
    #[serde(default, alias = "data")]
    extra: Option<Value>,
    #[serde(default)]
    thread: Option<RawThread>,
    #[serde(default)]
    reactions: Vec<RawReaction>,
    /// Attachment collections under any of their historical keys.
    #[serde(flatten)]
    rest: Mapping,
}

impl RawMessage {
    fn into_message(self, default_card: &CardId) -> Result<Message> {
        let card = self.card_id.unwrap_or_else(|| default_card.clone());
        let ctx = MigrationContext {
            creator: &self.creator,
            created: self.created,
        };
        let attachments = migrate_attachments(&self.rest, &ctx)
            .map_err(|e| CommunicationError::Parse(format!("message {}: {e}", self.id)))?;

        let unknown: Vec<&str> = self
            .rest
            .keys()
            .filter_map(|k| k.as_str())
            .filter(|k| !ATTACHMENT_MIGRATIONS.iter().any(|m| m.key == *k))
            .collect();
        if !unknown.is_empty() {
            tracing::debug!(message = %self.id, ?unknown, "ignoring unknown archive fields");
        }

        let reactions = self
            .reactions
            .into_iter()
            .map(|r| Reaction {
                message: self.id,
                reaction: r.reaction,
                creator: r.creator,
                created: r.created,
            })
            .collect();

        let thread = self.thread.map(|t| Thread {
            card: card.clone(),
            message: self.id,
            thread_id: t.thread_id,
            thread_type: t.thread_type,
            replies_count: t.replies_count,
            last_reply: t.last_reply,
        });

        Ok(Message {
            id: self.id,
            card,
            message_type: self.message_type,
            content: self.content,
            creator: self.creator,
            created: self.created,
            edited: self.edited,
            removed: self.removed,
            extra: self.extra,
            reactions,
            attachments,
            thread,
        })
    }
}

/// Timestamps written either as RFC 3339 strings or epoch milliseconds.
pub mod flex_time {
    use std::fmt;

    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::{self, Deserializer, Visitor};
    use serde::Deserialize;
    use serde_json::Value;

    struct FlexVisitor;

    impl<'de> Visitor<'de> for FlexVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an RFC 3339 timestamp or epoch milliseconds")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            from_millis(v).ok_or_else(|| E::custom(format!("timestamp {v} out of range")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            let v = i64::try_from(v).map_err(|_| E::custom("timestamp out of range"))?;
            self.visit_i64(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_str(v).map_err(E::custom)
        }
    }

    fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms).single()
    }

    fn parse_str(v: &str) -> Result<DateTime<Utc>, String> {
        DateTime::parse_from_rfc3339(v)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp {v:?}: {e}"))
    }

    pub fn required<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        d.deserialize_any(FlexVisitor)
    }

    pub fn option<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrap(#[serde(deserialize_with = "required")] DateTime<Utc>);
        Ok(Option::<Wrap>::deserialize(d)?.map(|Wrap(t)| t))
    }

    pub fn from_json(v: &Value) -> Result<DateTime<Utc>, String> {
        match v {
            Value::String(s) => parse_str(s),
            Value::Number(n) => n
                .as_i64()
                .and_then(from_millis)
                .ok_or_else(|| format!("timestamp {n} out of range")),
            other => Err(format!("expected a timestamp, got {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn message(id: u64, secs: i64) -> Message {
        Message {
            id: MessageId(id),
            card: CardId::from("C1"),
            message_type: MessageType::Message,
            content: format!("m{id}"),
            creator: SocialId::from("alice"),
            created: at(secs),
            edited: None,
            removed: false,
            extra: None,
            reactions: vec![],
            attachments: vec![],
            thread: None,
        }
    }

    fn metadata(from: i64, to: i64) -> FileMetadata {
        FileMetadata {
            card_id: CardId::from("C1"),
            title: "General".into(),
            from_date: at(from),
            to_date: at(to),
        }
    }

    #[test]
    fn canonical_form_survives_a_round_trip() {
        let mut first = message(1, 100);
        first.reactions.push(Reaction {
            message: MessageId(1),
            reaction: ":+1:".into(),
            creator: SocialId::from("bob"),
            created: at(110),
        });
        first.extra = Some(json!({"pinned": true}));
        let mut second = message(2, 200);
        second.edited = Some(at(250));
        second.thread = Some(Thread {
            card: CardId::from("C1"),
            message: MessageId(2),
            thread_id: ThreadId::from("T1"),
            thread_type: "chat".into(),
            replies_count: 3,
            last_reply: Some(at(260)),
        });

        let file = ArchiveFile::new(metadata(100, 200), vec![first, second]);
        file.validate().unwrap();
        let text = file.encode().unwrap();
        assert_eq!(decode(&text).unwrap(), file);
    }

    #[test]
    fn legacy_shapes_decode_to_canonical_and_reencode_stably() {
        let text = r#"
card: C1
title: Old
fromDate: 1700000000000
toDate: "2023-11-14T22:20:00Z"
---
- id: 1
  type: message
  card: C1
  content: hello
  creator: alice
  created: 1700000000000
  data: { legacy: true }
  files:
    - { blobId: f1, type: image/png, filename: a.png, size: 42 }
  blobs:
    - { blobId: b1, mimeType: text/plain, fileName: b.txt }
  linkPreviews:
    - { url: "https://example.com", title: Example }
- id: "2"
  content: world
  creator: bob
  created: "2023-11-14T22:15:00Z"
  attachments:
    - { id: a1, type: application/pdf, params: { pages: 3 }, creator: bob, created: "2023-11-14T22:15:00Z" }
"#;
        let file = decode(text).unwrap();
        file.validate().unwrap();

        let first = &file.messages[0];
        assert_eq!(first.extra, Some(json!({"legacy": true})));
        let ids: Vec<&str> = first.attachments.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "b1", "https://example.com"]);
        assert_eq!(first.attachments[0].params["fileName"], "a.png");

        let second = &file.messages[1];
        assert_eq!(second.card, CardId::from("C1"));
        assert_eq!(second.attachments[0].params, json!({"pages": 3}));

        let again = decode(&file.encode().unwrap()).unwrap();
        assert_eq!(again, file);
    }

    #[test]
    fn malformed_attachment_fails_the_whole_blob() {
        let text = r#"
cardId: C1
fromDate: 0
toDate: 0
---
- id: 1
  creator: alice
  created: 0
  blobs:
    - { fileName: missing-blob-id.txt, mimeType: text/plain }
"#;
        let err = decode(text).unwrap_err();
        assert!(matches!(err, CommunicationError::Parse(ref m) if m.contains("blobs[0]")));
    }

    #[test]
    fn missing_metadata_is_a_parse_error() {
        assert!(matches!(decode(""), Err(CommunicationError::Parse(_))));
    }

    #[test]
    fn document_count_must_be_two() {
        let file = ArchiveFile::new(metadata(100, 120), vec![message(3, 110)]);
        let text = file.encode().unwrap();
        let header = text.split("---\n").next().unwrap();

        assert!(matches!(decode(header), Err(CommunicationError::Parse(_))));

        let extra = format!("{text}---\n- id: 9\n");
        assert!(matches!(decode(&extra), Err(CommunicationError::Parse(_))));

        assert_eq!(decode(&text).unwrap(), file);
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut other_card = message(2, 150);
        other_card.card = CardId::from("C2");
        let file = ArchiveFile::new(metadata(100, 120), vec![message(3, 110), other_card]);
        match file.validate() {
            Err(CommunicationError::Validation(violations)) => assert_eq!(violations.len(), 3),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }
}
