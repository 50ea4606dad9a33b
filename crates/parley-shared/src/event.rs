//! Inbound domain events and the broadcasts produced when they apply.
//!
//! The `type` tag is the wire-stable discriminant on both sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MAX_CONTENT_LENGTH;
use crate::error::{CommunicationError, Violations};
use crate::model::{
    AttachmentOperation, Collaborator, Message, MessageType, MessagesGroup, Notification,
    NotificationContext, Patch, ReactionOpcode, ThreadOperation,
};
use crate::types::{AccountId, CardId, ContextId, MessageId, NotificationId, SocialId};

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageEvent {
    pub card: CardId,
    #[serde(default)]
    pub message_type: MessageType,
    pub content: String,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePatchEvent {
    pub card: CardId,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemovePatchEvent {
    pub card: CardId,
    pub message_id: MessageId,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPatchEvent {
    pub card: CardId,
    pub message_id: MessageId,
    pub opcode: ReactionOpcode,
    pub reaction: String,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPatchEvent {
    pub card: CardId,
    pub message_id: MessageId,
    pub operation: AttachmentOperation,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPatchEvent {
    pub card: CardId,
    pub message_id: MessageId,
    pub operation: ThreadOperation,
    pub creator: SocialId,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationEvent {
    pub context: ContextId,
    pub account: AccountId,
    pub message_id: MessageId,
    pub message_created: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// Marks notifications of a context read/archived, optionally only up to a date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNotificationEvent {
    pub context: ContextId,
    pub account: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NotificationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveNotificationsEvent {
    pub context: ContextId,
    pub account: AccountId,
    pub ids: Vec<NotificationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationContextEvent {
    pub card: CardId,
    pub account: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_view: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNotificationContextEvent {
    pub context: ContextId,
    pub account: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_view: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notify: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveNotificationContextEvent {
    pub context: ContextId,
    pub account: AccountId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddCollaboratorsEvent {
    pub card: CardId,
    pub collaborators: Vec<AccountId>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveCollaboratorsEvent {
    pub card: CardId,
    pub collaborators: Vec<AccountId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveCardEvent {
    pub card: CardId,
}

/// Closed set of inbound events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    CreateMessage(CreateMessageEvent),
    UpdatePatch(UpdatePatchEvent),
    RemovePatch(RemovePatchEvent),
    ReactionPatch(ReactionPatchEvent),
    AttachmentPatch(AttachmentPatchEvent),
    ThreadPatch(ThreadPatchEvent),
    CreateNotification(CreateNotificationEvent),
    UpdateNotification(UpdateNotificationEvent),
    RemoveNotifications(RemoveNotificationsEvent),
    CreateNotificationContext(CreateNotificationContextEvent),
    UpdateNotificationContext(UpdateNotificationContextEvent),
    RemoveNotificationContext(RemoveNotificationContextEvent),
    AddCollaborators(AddCollaboratorsEvent),
    RemoveCollaborators(RemoveCollaboratorsEvent),
    RemoveCard(RemoveCardEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::CreateMessage(_) => "createMessage",
            Event::UpdatePatch(_) => "updatePatch",
            Event::RemovePatch(_) => "removePatch",
            Event::ReactionPatch(_) => "reactionPatch",
            Event::AttachmentPatch(_) => "attachmentPatch",
            Event::ThreadPatch(_) => "threadPatch",
            Event::CreateNotification(_) => "createNotification",
            Event::UpdateNotification(_) => "updateNotification",
            Event::RemoveNotifications(_) => "removeNotifications",
            Event::CreateNotificationContext(_) => "createNotificationContext",
            Event::UpdateNotificationContext(_) => "updateNotificationContext",
            Event::RemoveNotificationContext(_) => "removeNotificationContext",
            Event::AddCollaborators(_) => "addCollaborators",
            Event::RemoveCollaborators(_) => "removeCollaborators",
            Event::RemoveCard(_) => "removeCard",
        }
    }

    /// Card the event mutates, if it is card-scoped.
    pub fn card(&self) -> Option<&CardId> {
        match self {
            Event::CreateMessage(e) => Some(&e.card),
            Event::UpdatePatch(e) => Some(&e.card),
            Event::RemovePatch(e) => Some(&e.card),
            Event::ReactionPatch(e) => Some(&e.card),
            Event::AttachmentPatch(e) => Some(&e.card),
            Event::ThreadPatch(e) => Some(&e.card),
            Event::CreateNotificationContext(e) => Some(&e.card),
            Event::AddCollaborators(e) => Some(&e.card),
            Event::RemoveCollaborators(e) => Some(&e.card),
            Event::RemoveCard(e) => Some(&e.card),
            Event::CreateNotification(_)
            | Event::UpdateNotification(_)
            | Event::RemoveNotifications(_)
            | Event::UpdateNotificationContext(_)
            | Event::RemoveNotificationContext(_) => None,
        }
    }

    /// Schema checks done at the ingestion boundary. Reports every problem.
    pub fn validate(&self) -> Result<(), CommunicationError> {
        let mut v = Violations::new();
        if let Some(card) = self.card() {
            v.check(!card.as_str().is_empty(), || "card must not be empty".into());
        }

        match self {
            Event::CreateMessage(e) => {
                v.check(!e.creator.as_str().is_empty(), || {
                    "creator must not be empty".into()
                });
                v.check(e.content.len() <= MAX_CONTENT_LENGTH, || {
                    format!("content exceeds {MAX_CONTENT_LENGTH} bytes")
                });
            }
            Event::UpdatePatch(e) => {
                v.check(!e.creator.as_str().is_empty(), || {
                    "creator must not be empty".into()
                });
                v.check(e.content.is_some() || e.extra.is_some(), || {
                    "update patch needs content or extra".into()
                });
                if let Some(content) = &e.content {
                    v.check(content.len() <= MAX_CONTENT_LENGTH, || {
                        format!("content exceeds {MAX_CONTENT_LENGTH} bytes")
                    });
                }
            }
            Event::RemovePatch(e) => {
                v.check(!e.creator.as_str().is_empty(), || {
                    "creator must not be empty".into()
                });
            }
            Event::ReactionPatch(e) => {
                v.check(!e.creator.as_str().is_empty(), || {
                    "creator must not be empty".into()
                });
                v.check(!e.reaction.trim().is_empty(), || {
                    "reaction must not be empty".into()
                });
            }
            Event::AttachmentPatch(e) => {
                v.check(!e.creator.as_str().is_empty(), || {
                    "creator must not be empty".into()
                });
                match &e.operation {
                    AttachmentOperation::Add { attachments }
                    | AttachmentOperation::Set { attachments } => {
                        for (i, a) in attachments.iter().enumerate() {
                            v.check(!a.id.as_str().is_empty(), || {
                                format!("attachments[{i}].id must not be empty")
                            });
                            v.check(!a.mime.is_empty(), || {
                                format!("attachments[{i}].type must not be empty")
                            });
                        }
                    }
                    AttachmentOperation::Remove { ids } => {
                        v.check(!ids.is_empty(), || "remove needs at least one id".into());
                    }
                    AttachmentOperation::Update { attachments } => {
                        v.check(!attachments.is_empty(), || {
                            "update needs at least one attachment".into()
                        });
                    }
                }
            }
            Event::ThreadPatch(e) => {
                v.check(!e.creator.as_str().is_empty(), || {
                    "creator must not be empty".into()
                });
                if let ThreadOperation::Attach { thread_id, .. } = &e.operation {
                    v.check(!thread_id.as_str().is_empty(), || {
                        "threadId must not be empty".into()
                    });
                }
            }
            Event::CreateNotification(e) => {
                v.check(!e.account.as_str().is_empty(), || {
                    "account must not be empty".into()
                });
            }
            Event::UpdateNotification(e) => {
                v.check(e.read.is_some() || e.archived.is_some(), || {
                    "update needs read or archived".into()
                });
            }
            Event::RemoveNotifications(e) => {
                v.check(!e.ids.is_empty(), || "ids must not be empty".into());
            }
            Event::CreateNotificationContext(e) => {
                v.check(!e.account.as_str().is_empty(), || {
                    "account must not be empty".into()
                });
            }
            Event::UpdateNotificationContext(e) => {
                v.check(
                    e.last_view.is_some() || e.last_update.is_some() || e.last_notify.is_some(),
                    || "context update changes nothing".into(),
                );
            }
            Event::RemoveNotificationContext(_) | Event::RemoveCard(_) => {}
            Event::AddCollaborators(AddCollaboratorsEvent { collaborators, .. })
            | Event::RemoveCollaborators(RemoveCollaboratorsEvent { collaborators, .. }) => {
                v.check(!collaborators.is_empty(), || {
                    "collaborators must not be empty".into()
                });
                for (i, c) in collaborators.iter().enumerate() {
                    v.check(!c.as_str().is_empty(), || {
                        format!("collaborators[{i}] must not be empty")
                    });
                }
            }
        }

        v.into_result()
    }
}

/// Synchronous answer returned to the originating session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<NotificationId>,
    /// True when the event was a redelivery and nothing changed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

/// REST transaction envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxEnvelope {
    pub event: Event,
    pub modified_by: SocialId,
    pub modified_on: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Broadcasts
// ---------------------------------------------------------------------------

/// State change pushed to subscribed sessions after an event applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BroadcastEvent {
    MessageCreated {
        message: Message,
    },
    PatchCreated {
        card: CardId,
        patch: Patch,
    },
    MessagesGroupCreated {
        group: MessagesGroup,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationsUpdated {
        context: ContextId,
        account: AccountId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<NotificationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        archived: Option<bool>,
    },
    NotificationsRemoved {
        context: ContextId,
        account: AccountId,
        ids: Vec<NotificationId>,
    },
    NotificationContextCreated {
        context: NotificationContext,
    },
    NotificationContextUpdated {
        context: NotificationContext,
    },
    NotificationContextRemoved {
        context: NotificationContext,
    },
    CollaboratorsAdded {
        card: CardId,
        collaborators: Vec<Collaborator>,
    },
    CollaboratorsRemoved {
        card: CardId,
        accounts: Vec<AccountId>,
    },
    CardRemoved {
        card: CardId,
    },
}

impl BroadcastEvent {
    pub fn card(&self) -> Option<&CardId> {
        match self {
            BroadcastEvent::MessageCreated { message } => Some(&message.card),
            BroadcastEvent::PatchCreated { card, .. }
            | BroadcastEvent::CollaboratorsAdded { card, .. }
            | BroadcastEvent::CollaboratorsRemoved { card, .. }
            | BroadcastEvent::CardRemoved { card } => Some(card),
            BroadcastEvent::MessagesGroupCreated { group } => Some(&group.card),
            BroadcastEvent::NotificationCreated { notification } => Some(&notification.card),
            BroadcastEvent::NotificationContextCreated { context }
            | BroadcastEvent::NotificationContextUpdated { context }
            | BroadcastEvent::NotificationContextRemoved { context } => Some(&context.card),
            BroadcastEvent::NotificationsUpdated { .. }
            | BroadcastEvent::NotificationsRemoved { .. } => None,
        }
    }

    /// Account whose inbox this change belongs to, if any.
    pub fn account(&self) -> Option<&AccountId> {
        match self {
            BroadcastEvent::NotificationCreated { notification } => Some(&notification.account),
            BroadcastEvent::NotificationsUpdated { account, .. }
            | BroadcastEvent::NotificationsRemoved { account, .. } => Some(account),
            BroadcastEvent::NotificationContextCreated { context }
            | BroadcastEvent::NotificationContextUpdated { context }
            | BroadcastEvent::NotificationContextRemoved { context } => Some(&context.account),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::AttachmentData;
    use crate::types::AttachmentId;

    #[test]
    fn events_use_camel_case_type_tags() {
        let event: Event = serde_json::from_value(json!({
            "type": "reactionPatch",
            "card": "C1",
            "messageId": "3",
            "opcode": "add",
            "reaction": "👍",
            "creator": "alice",
            "created": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.kind(), "reactionPatch");
        assert_eq!(event.card(), Some(&CardId::from("C1")));
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "reactionPatch");
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let res = serde_json::from_value::<Event>(json!({"type": "dropTable", "card": "C1"}));
        assert!(res.is_err());
    }

    #[test]
    fn validation_reports_every_violation() {
        let event = Event::AttachmentPatch(AttachmentPatchEvent {
            card: CardId::from(""),
            message_id: MessageId(1),
            operation: AttachmentOperation::Add {
                attachments: vec![AttachmentData {
                    id: AttachmentId::from(""),
                    mime: String::new(),
                    params: Value::Null,
                }],
            },
            creator: SocialId::from("alice"),
            created: Utc::now(),
        });
        match event.validate() {
            Err(CommunicationError::Validation(list)) => assert_eq!(list.len(), 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn broadcast_scope() {
        let event = BroadcastEvent::CardRemoved {
            card: CardId::from("C9"),
        };
        assert_eq!(event.card(), Some(&CardId::from("C9")));
        assert_eq!(event.account(), None);
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "cardRemoved");
    }
}
