//! The persistence contract shared by every store implementation.
//!
//! Operations are synchronous and fail fast. Patches are pure inserts: a
//! redelivered patch is stored twice unless the caller checks
//! [`DbAdapter::patch_exists`] first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_shared::model::{
    Attachment, AttachmentUpdate, Collaborator, Message, MessageMeta, MessageType, MessagesGroup,
    Notification, NotificationContext, Patch, PatchKey, Reaction, RepliesCountOp, Thread,
};
use parley_shared::query::{
    FindCollaboratorsParams, FindMessagesGroupsParams, FindMessagesParams,
    FindNotificationContextsParams, FindNotificationsParams,
};
use parley_shared::types::{
    AccountId, AttachmentId, BlobId, CardId, ContextId, MessageId, NotificationId, SocialId,
    ThreadId,
};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::database::Database;
use crate::error::Result;

/// Input of [`DbAdapter::create_message`]; the id is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub card: CardId,
    pub message_type: MessageType,
    pub content: String,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
    pub extra: Option<Value>,
}

impl NewMessage {
    pub fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            card: self.card,
            message_type: self.message_type,
            content: self.content,
            creator: self.creator,
            created: self.created,
            edited: None,
            removed: false,
            extra: self.extra,
            reactions: Vec::new(),
            attachments: Vec::new(),
            thread: None,
        }
    }
}

/// Marks notifications of one context. `id` narrows to a single
/// notification, `until` to those created at or before the date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationUpdate {
    pub context: ContextId,
    pub account: AccountId,
    pub id: Option<NotificationId>,
    pub until: Option<DateTime<Utc>>,
    pub read: Option<bool>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextUpdate {
    pub last_view: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_notify: Option<DateTime<Utc>>,
}

pub trait DbAdapter: Send {
    // -- messages -----------------------------------------------------------

    /// Insert a message under the card's next id.
    fn create_message(&self, message: &NewMessage) -> Result<MessageId>;
    /// Hard-delete one hot message with its projections.
    fn remove_message(&self, card: &CardId, id: MessageId) -> Result<bool>;
    /// Hard-delete hot messages in `from..=to` with their projections.
    fn remove_messages(&self, card: &CardId, from: MessageId, to: MessageId) -> Result<usize>;
    fn find_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>>;
    fn find_messages_meta(&self, params: &FindMessagesParams) -> Result<Vec<MessageMeta>>;
    /// Hot messages of a card.
    fn count_messages(&self, card: &CardId) -> Result<u64>;
    /// Highest id ever allocated for the card, or `None` before its first
    /// message.
    fn last_message_id(&self, card: &CardId) -> Result<Option<MessageId>>;

    // -- patches ------------------------------------------------------------

    fn create_patch(&self, patch: &Patch) -> Result<()>;
    fn remove_patches(&self, card: &CardId, from: MessageId, to: MessageId) -> Result<usize>;
    /// All patches of one message in fold order.
    fn find_patches(&self, card: &CardId, id: MessageId) -> Result<Vec<Patch>>;
    /// Patches recorded for a group's range after it was archived.
    fn find_archived_patches(&self, group: &MessagesGroup) -> Result<Vec<Patch>>;
    fn patch_exists(&self, card: &CardId, key: &PatchKey) -> Result<bool>;

    // -- archive groups -----------------------------------------------------

    /// Record a group; patches stored so far are considered folded into it.
    fn create_messages_group(&self, group: &MessagesGroup) -> Result<()>;
    fn remove_messages_group(&self, card: &CardId, blob_id: &BlobId) -> Result<bool>;
    fn find_messages_groups(&self, params: &FindMessagesGroupsParams)
        -> Result<Vec<MessagesGroup>>;
    /// Delete hot rows covered by `group`, keeping later patches.
    fn prune_group(&self, group: &MessagesGroup) -> Result<usize>;
    /// Every blob referenced by a group row, across cards.
    fn referenced_blobs(&self) -> Result<Vec<BlobId>>;

    // -- projections of hot messages ----------------------------------------

    /// Drop every reaction, attachment and thread row of one message.
    fn clear_projections(&self, card: &CardId, message: MessageId) -> Result<()>;

    /// Returns false when the reaction already existed.
    fn create_reaction(&self, card: &CardId, reaction: &Reaction) -> Result<bool>;
    fn remove_reaction(
        &self,
        card: &CardId,
        message: MessageId,
        creator: &SocialId,
        reaction: &str,
    ) -> Result<bool>;
    fn create_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        attachments: &[Attachment],
    ) -> Result<()>;
    fn remove_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        ids: &[AttachmentId],
    ) -> Result<usize>;
    fn set_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        attachments: &[Attachment],
    ) -> Result<()>;
    fn update_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        updates: &[AttachmentUpdate],
    ) -> Result<usize>;
    fn create_thread(&self, thread: &Thread) -> Result<()>;
    fn update_thread(
        &self,
        card: &CardId,
        message: MessageId,
        op: Option<RepliesCountOp>,
        last_reply: Option<DateTime<Utc>>,
    ) -> Result<bool>;
    fn find_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>>;

    // -- notifications ------------------------------------------------------

    fn create_notification(&self, notification: &Notification) -> Result<()>;
    fn update_notifications(&self, update: &NotificationUpdate) -> Result<usize>;
    fn remove_notifications(&self, context: &ContextId, ids: &[NotificationId]) -> Result<usize>;
    fn find_notifications(&self, params: &FindNotificationsParams) -> Result<Vec<Notification>>;

    fn create_context(&self, context: &NotificationContext) -> Result<()>;
    fn update_context(
        &self,
        id: &ContextId,
        update: &ContextUpdate,
    ) -> Result<Option<NotificationContext>>;
    /// Removes the context with its notifications.
    fn remove_context(&self, id: &ContextId) -> Result<Option<NotificationContext>>;
    fn find_contexts(
        &self,
        params: &FindNotificationContextsParams,
    ) -> Result<Vec<NotificationContext>>;

    // -- collaborators ------------------------------------------------------

    /// Returns only the collaborators that were not present before.
    fn add_collaborators(
        &self,
        card: &CardId,
        accounts: &[AccountId],
        date: DateTime<Utc>,
    ) -> Result<Vec<Collaborator>>;
    /// Returns the accounts actually removed.
    fn remove_collaborators(&self, card: &CardId, accounts: &[AccountId])
        -> Result<Vec<AccountId>>;
    fn find_collaborators(&self, params: &FindCollaboratorsParams) -> Result<Vec<Collaborator>>;

    // -- lifecycle ----------------------------------------------------------

    /// Purge every row of a card. Returns the groups whose blobs the caller
    /// should delete.
    fn remove_card(&self, card: &CardId) -> Result<Vec<MessagesGroup>>;
    fn close(&mut self) -> Result<()>;
}

/// A store shared between the router, the finder and request handlers.
/// Holding the lock serializes mutations.
pub type SharedStore = Arc<Mutex<dyn DbAdapter>>;

pub type StoreGuard<'a> = MutexGuard<'a, dyn DbAdapter>;

pub fn shared(store: impl DbAdapter + 'static) -> SharedStore {
    Arc::new(Mutex::new(store))
}

impl DbAdapter for Database {
    fn create_message(&self, message: &NewMessage) -> Result<MessageId> {
        self.insert_message(message)
    }

    fn remove_message(&self, card: &CardId, id: MessageId) -> Result<bool> {
        Ok(self.delete_messages(card, id, id)? > 0)
    }

    fn remove_messages(&self, card: &CardId, from: MessageId, to: MessageId) -> Result<usize> {
        self.delete_messages(card, from, to)
    }

    fn find_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>> {
        self.get_messages(params)
    }

    fn find_messages_meta(&self, params: &FindMessagesParams) -> Result<Vec<MessageMeta>> {
        self.get_messages_meta(params)
    }

    fn count_messages(&self, card: &CardId) -> Result<u64> {
        self.count_hot_messages(card)
    }

    fn last_message_id(&self, card: &CardId) -> Result<Option<MessageId>> {
        Database::last_message_id(self, card)
    }

    fn create_patch(&self, patch: &Patch) -> Result<()> {
        self.insert_patch(patch)
    }

    fn remove_patches(&self, card: &CardId, from: MessageId, to: MessageId) -> Result<usize> {
        self.delete_patches(card, from, to, None)
    }

    fn find_patches(&self, card: &CardId, id: MessageId) -> Result<Vec<Patch>> {
        self.get_patches(card, id, id, None)
    }

    fn find_archived_patches(&self, group: &MessagesGroup) -> Result<Vec<Patch>> {
        let watermark = self.group_watermark(&group.card, &group.blob_id)?;
        self.get_patches(&group.card, group.from_id, group.to_id, Some(watermark))
    }

    fn patch_exists(&self, card: &CardId, key: &PatchKey) -> Result<bool> {
        self.has_patch(card, key)
    }

    fn create_messages_group(&self, group: &MessagesGroup) -> Result<()> {
        self.insert_group(group)
    }

    fn remove_messages_group(&self, card: &CardId, blob_id: &BlobId) -> Result<bool> {
        self.delete_group(card, blob_id)
    }

    fn find_messages_groups(
        &self,
        params: &FindMessagesGroupsParams,
    ) -> Result<Vec<MessagesGroup>> {
        self.get_groups(params)
    }

    fn prune_group(&self, group: &MessagesGroup) -> Result<usize> {
        self.prune_archived(group)
    }

    fn referenced_blobs(&self) -> Result<Vec<BlobId>> {
        self.get_referenced_blobs()
    }

    fn clear_projections(&self, card: &CardId, message: MessageId) -> Result<()> {
        self.delete_projections(card, message)
    }

    fn create_reaction(&self, card: &CardId, reaction: &Reaction) -> Result<bool> {
        self.insert_reaction(card, reaction)
    }

    fn remove_reaction(
        &self,
        card: &CardId,
        message: MessageId,
        creator: &SocialId,
        reaction: &str,
    ) -> Result<bool> {
        self.delete_reaction(card, message, creator, reaction)
    }

    fn create_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        attachments: &[Attachment],
    ) -> Result<()> {
        self.insert_attachments(card, message, attachments)
    }

    fn remove_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        ids: &[AttachmentId],
    ) -> Result<usize> {
        self.delete_attachments(card, message, ids)
    }

    fn set_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        attachments: &[Attachment],
    ) -> Result<()> {
        self.replace_attachments(card, message, attachments)
    }

    fn update_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        updates: &[AttachmentUpdate],
    ) -> Result<usize> {
        self.merge_attachment_params(card, message, updates)
    }

    fn create_thread(&self, thread: &Thread) -> Result<()> {
        self.upsert_thread(thread)
    }

    fn update_thread(
        &self,
        card: &CardId,
        message: MessageId,
        op: Option<RepliesCountOp>,
        last_reply: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.bump_thread(card, message, op, last_reply)
    }

    fn find_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>> {
        self.get_thread(thread_id)
    }

    fn create_notification(&self, notification: &Notification) -> Result<()> {
        self.insert_notification(notification)
    }

    fn update_notifications(&self, update: &NotificationUpdate) -> Result<usize> {
        self.mark_notifications(update)
    }

    fn remove_notifications(&self, context: &ContextId, ids: &[NotificationId]) -> Result<usize> {
        self.delete_notifications(context, ids)
    }

    fn find_notifications(&self, params: &FindNotificationsParams) -> Result<Vec<Notification>> {
        self.get_notifications(params)
    }

    fn create_context(&self, context: &NotificationContext) -> Result<()> {
        self.insert_context(context)
    }

    fn update_context(
        &self,
        id: &ContextId,
        update: &ContextUpdate,
    ) -> Result<Option<NotificationContext>> {
        self.patch_context(id, update)
    }

    fn remove_context(&self, id: &ContextId) -> Result<Option<NotificationContext>> {
        self.delete_context(id)
    }

    fn find_contexts(
        &self,
        params: &FindNotificationContextsParams,
    ) -> Result<Vec<NotificationContext>> {
        self.get_contexts(params)
    }

    fn add_collaborators(
        &self,
        card: &CardId,
        accounts: &[AccountId],
        date: DateTime<Utc>,
    ) -> Result<Vec<Collaborator>> {
        self.insert_collaborators(card, accounts, date)
    }

    fn remove_collaborators(
        &self,
        card: &CardId,
        accounts: &[AccountId],
    ) -> Result<Vec<AccountId>> {
        self.delete_collaborators(card, accounts)
    }

    fn find_collaborators(&self, params: &FindCollaboratorsParams) -> Result<Vec<Collaborator>> {
        self.get_collaborators(params)
    }

    fn remove_card(&self, card: &CardId) -> Result<Vec<MessagesGroup>> {
        self.purge_card(card)
    }

    fn close(&mut self) -> Result<()> {
        self.close_connection()
    }
}
