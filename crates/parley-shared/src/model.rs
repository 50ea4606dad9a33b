//! Domain model of the communication store.
//!
//! Messages are immutable once created; every later change is an
//! append-only [`Patch`] folded over the base message on read. Every
//! struct derives `Serialize`/`Deserialize` with camelCase keys so it can
//! be handed to REST consumers as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    AccountId, AttachmentId, BlobId, CardId, ContextId, MessageId, NotificationId, SocialId,
    ThreadId,
};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Message,
    Activity,
    #[serde(other)]
    Other,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Activity => "activity",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "message" => Self::Message,
            "activity" => Self::Activity,
            _ => Self::Other,
        }
    }
}

/// Logical state of a message: the create event folded with its patches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub card: CardId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

/// Lightweight projection used by `findMessagesMeta`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    pub card: CardId,
    pub id: MessageId,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub removed: bool,
}

impl From<&Message> for MessageMeta {
    fn from(m: &Message) -> Self {
        Self {
            card: m.card.clone(),
            id: m.id,
            creator: m.creator.clone(),
            created: m.created,
            removed: m.removed,
        }
    }
}

// ---------------------------------------------------------------------------
// Reactions, attachments, threads
// ---------------------------------------------------------------------------

/// Unique by `(message, creator, reaction)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message: MessageId,
    pub reaction: String,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

impl Reaction {
    pub fn same_key(&self, creator: &SocialId, reaction: &str) -> bool {
        &self.creator == creator && self.reaction == reaction
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: AttachmentId,
    /// MIME type, or a marker such as the link preview type.
    #[serde(rename = "type")]
    pub mime: String,
    #[serde(default)]
    pub params: Value,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

/// Attachment payload carried by a patch; author and time come from the patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentData {
    pub id: AttachmentId,
    #[serde(rename = "type")]
    pub mime: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUpdate {
    pub id: AttachmentId,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    #[serde(alias = "cardId")]
    pub card: CardId,
    #[serde(alias = "messageId")]
    pub message: MessageId,
    pub thread_id: ThreadId,
    pub thread_type: String,
    #[serde(default)]
    pub replies_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reply: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Update,
    Remove,
    Reaction,
    Attachment,
    Thread,
}

impl PatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Reaction => "reaction",
            Self::Attachment => "attachment",
            Self::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReactionOpcode {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepliesCountOp {
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePatchData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPatchData {
    pub opcode: ReactionOpcode,
    pub reaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "opcode", rename_all = "camelCase")]
pub enum AttachmentOperation {
    Add { attachments: Vec<AttachmentData> },
    Remove { ids: Vec<AttachmentId> },
    Set { attachments: Vec<AttachmentData> },
    Update { attachments: Vec<AttachmentUpdate> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "opcode", rename_all = "camelCase")]
pub enum ThreadOperation {
    #[serde(rename_all = "camelCase")]
    Attach { thread_id: ThreadId, thread_type: String },
    #[serde(rename_all = "camelCase")]
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replies_count_op: Option<RepliesCountOp>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_reply: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum PatchData {
    Update(UpdatePatchData),
    Remove,
    Reaction(ReactionPatchData),
    Attachment(AttachmentOperation),
    Thread(ThreadOperation),
}

impl PatchData {
    pub fn patch_type(&self) -> PatchType {
        match self {
            Self::Update(_) => PatchType::Update,
            Self::Remove => PatchType::Remove,
            Self::Reaction(_) => PatchType::Reaction,
            Self::Attachment(_) => PatchType::Attachment,
            Self::Thread(_) => PatchType::Thread,
        }
    }
}

/// One immutable mutation of a message. Never rewritten or compacted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub card: CardId,
    pub message_id: MessageId,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
    #[serde(flatten)]
    pub data: PatchData,
}

/// Identity used to drop redelivered patches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchKey {
    pub message_id: MessageId,
    pub patch_type: PatchType,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

impl Patch {
    pub fn key(&self) -> PatchKey {
        PatchKey {
            message_id: self.message_id,
            patch_type: self.data.patch_type(),
            creator: self.creator.clone(),
            created: self.created,
        }
    }
}

// ---------------------------------------------------------------------------
// Folding
// ---------------------------------------------------------------------------

impl Message {
    /// Apply a single patch in place.
    pub fn apply_patch(&mut self, patch: &Patch) {
        if patch.message_id != self.id {
            tracing::debug!(
                message = %self.id,
                patch_message = %patch.message_id,
                "skipping patch addressed to another message"
            );
            return;
        }

        match &patch.data {
            PatchData::Update(update) => {
                if let Some(content) = &update.content {
                    self.content = content.clone();
                }
                if let Some(extra) = &update.extra {
                    self.extra = Some(extra.clone());
                }
                self.edited = Some(patch.created);
            }
            PatchData::Remove => {
                self.removed = true;
            }
            PatchData::Reaction(data) => match data.opcode {
                ReactionOpcode::Add => {
                    let exists = self
                        .reactions
                        .iter()
                        .any(|r| r.same_key(&patch.creator, &data.reaction));
                    if !exists {
                        self.reactions.push(Reaction {
                            message: self.id,
                            reaction: data.reaction.clone(),
                            creator: patch.creator.clone(),
                            created: patch.created,
                        });
                    }
                }
                ReactionOpcode::Remove => {
                    self.reactions
                        .retain(|r| !r.same_key(&patch.creator, &data.reaction));
                }
            },
            PatchData::Attachment(op) => self.apply_attachment_op(op, patch),
            PatchData::Thread(op) => self.apply_thread_op(op),
        }
    }

    fn apply_attachment_op(&mut self, op: &AttachmentOperation, patch: &Patch) {
        let to_attachment = |data: &AttachmentData| Attachment {
            id: data.id.clone(),
            mime: data.mime.clone(),
            params: data.params.clone(),
            creator: patch.creator.clone(),
            created: patch.created,
        };

        match op {
            AttachmentOperation::Add { attachments } => {
                for data in attachments {
                    if !self.attachments.iter().any(|a| a.id == data.id) {
                        self.attachments.push(to_attachment(data));
                    }
                }
            }
            AttachmentOperation::Remove { ids } => {
                self.attachments.retain(|a| !ids.contains(&a.id));
            }
            AttachmentOperation::Set { attachments } => {
                self.attachments = attachments.iter().map(to_attachment).collect();
            }
            AttachmentOperation::Update { attachments } => {
                for update in attachments {
                    if let Some(existing) = self.attachments.iter_mut().find(|a| a.id == update.id)
                    {
                        merge_params(&mut existing.params, &update.params);
                    }
                }
            }
        }
    }

    fn apply_thread_op(&mut self, op: &ThreadOperation) {
        match op {
            ThreadOperation::Attach {
                thread_id,
                thread_type,
            } => {
                let keep = self
                    .thread
                    .as_ref()
                    .is_some_and(|t| &t.thread_id == thread_id);
                if !keep {
                    self.thread = Some(Thread {
                        card: self.card.clone(),
                        message: self.id,
                        thread_id: thread_id.clone(),
                        thread_type: thread_type.clone(),
                        replies_count: 0,
                        last_reply: None,
                    });
                }
            }
            ThreadOperation::Update {
                replies_count_op,
                last_reply,
            } => {
                if let Some(thread) = self.thread.as_mut() {
                    thread.apply_update(*replies_count_op, *last_reply);
                }
            }
        }
    }
}

impl Thread {
    pub fn apply_update(&mut self, op: Option<RepliesCountOp>, last_reply: Option<DateTime<Utc>>) {
        match op {
            Some(RepliesCountOp::Increment) => self.replies_count += 1,
            Some(RepliesCountOp::Decrement) => {
                self.replies_count = self.replies_count.saturating_sub(1)
            }
            None => {}
        }
        if let Some(at) = last_reply {
            self.last_reply = Some(at);
        }
    }
}

/// Shallow merge of `patch` into `target` when both are objects; otherwise replace.
pub fn merge_params(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Fold patches over a base message, ordered by `created`.
///
/// The sort is stable, so patches sharing a timestamp keep insertion order.
pub fn fold(mut base: Message, patches: &[Patch]) -> Message {
    let mut ordered: Vec<&Patch> = patches.iter().collect();
    ordered.sort_by_key(|p| p.created);
    for patch in ordered {
        base.apply_patch(patch);
    }
    base
}

// ---------------------------------------------------------------------------
// Archive metadata
// ---------------------------------------------------------------------------

/// One archived, contiguous id range of a card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagesGroup {
    pub card: CardId,
    pub blob_id: BlobId,
    pub from_id: MessageId,
    pub to_id: MessageId,
    pub from_date: DateTime<Utc>,
    pub to_date: DateTime<Utc>,
    pub count: u32,
}

impl MessagesGroup {
    pub fn contains_id(&self, id: MessageId) -> bool {
        self.from_id <= id && id <= self.to_id
    }

    pub fn brackets(&self, created: DateTime<Utc>) -> bool {
        self.from_date <= created && created <= self.to_date
    }
}

// ---------------------------------------------------------------------------
// Notifications and collaborators
// ---------------------------------------------------------------------------

/// Per (account, card) inbox entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContext {
    pub id: ContextId,
    pub card: CardId,
    pub account: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_view: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notify: Option<DateTime<Utc>>,
    /// Filled only when the query asked for embedded notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Vec<Notification>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub context: ContextId,
    pub card: CardId,
    pub account: AccountId,
    pub message: MessageId,
    /// Creation time of the referenced message, used to locate it in archives.
    pub message_created: DateTime<Utc>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub card: CardId,
    pub account: AccountId,
    pub date: DateTime<Utc>,
}
