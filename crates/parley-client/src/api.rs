//! The gateway contract shared by the REST and local clients.

use async_trait::async_trait;
use parley_shared::event::{BroadcastEvent, Event, EventResult};
use parley_shared::model::{
    Collaborator, Message, MessageMeta, MessagesGroup, Notification, NotificationContext,
};
use parley_shared::query::{
    FindCollaboratorsParams, FindMessagesGroupsParams, FindMessagesParams,
    FindNotificationContextsParams, FindNotificationsParams,
};
use parley_shared::types::CardId;
use tokio::sync::mpsc;

use crate::error::Result;

/// What a session wants pushed to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub cards: Vec<CardId>,
    /// Inbox changes of the caller's own account.
    pub contexts: bool,
}

impl Subscription {
    pub fn cards(cards: impl IntoIterator<Item = CardId>) -> Self {
        Self {
            cards: cards.into_iter().collect(),
            contexts: false,
        }
    }

    pub fn with_contexts(mut self) -> Self {
        self.contexts = true;
        self
    }
}

pub type Broadcasts = mpsc::UnboundedReceiver<BroadcastEvent>;

#[async_trait]
pub trait CommunicationApi: Send + Sync {
    async fn event(&self, event: Event) -> Result<EventResult>;

    async fn find_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>>;
    async fn find_messages_meta(&self, params: &FindMessagesParams) -> Result<Vec<MessageMeta>>;
    async fn find_messages_groups(
        &self,
        params: &FindMessagesGroupsParams,
    ) -> Result<Vec<MessagesGroup>>;
    async fn find_notification_contexts(
        &self,
        params: &FindNotificationContextsParams,
    ) -> Result<Vec<NotificationContext>>;
    async fn find_notifications(
        &self,
        params: &FindNotificationsParams,
    ) -> Result<Vec<Notification>>;
    async fn find_collaborators(
        &self,
        params: &FindCollaboratorsParams,
    ) -> Result<Vec<Collaborator>>;

    /// Start receiving broadcasts. Events caused by this client's own
    /// calls are always delivered.
    async fn subscribe(&self, subscription: &Subscription) -> Result<Broadcasts>;
}
