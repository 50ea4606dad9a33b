//! In-process gateway over an embedded database.
//!
//! Runs the same router and finder as the server, so events and
//! broadcasts have identical shapes whether the application is online or
//! not. The gateway must be initialised before use and is unusable after
//! `close`.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_shared::event::{Event, EventResult};
use parley_shared::model::{
    Collaborator, Message, MessageMeta, MessagesGroup, Notification, NotificationContext,
};
use parley_shared::query::{
    FindCollaboratorsParams, FindMessagesGroupsParams, FindMessagesParams,
    FindNotificationContextsParams, FindNotificationsParams,
};
use parley_shared::retry::RetryOptions;
use parley_shared::types::{AccountId, CardId, MessageId};
use parley_store::{
    shared, ArchivalPolicy, Archiver, BlobStorage, Database, Finder, Router, Session,
    SessionRegistry, SharedStore,
};

use crate::api::{Broadcasts, CommunicationApi, Subscription};
use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct LocalClientConfig {
    /// Path, `:memory:` or `file:` URI.
    pub connection: String,
    pub account: AccountId,
    pub policy: ArchivalPolicy,
    pub blob_retry: Option<RetryOptions>,
}

impl LocalClientConfig {
    pub fn new(connection: impl Into<String>, account: impl Into<AccountId>) -> Self {
        Self {
            connection: connection.into(),
            account: account.into(),
            policy: ArchivalPolicy::default(),
            blob_retry: None,
        }
    }
}

struct Engine {
    store: SharedStore,
    router: Router,
    finder: Finder,
}

pub struct LocalClient {
    config: LocalClientConfig,
    session: Session,
    blobs: Arc<dyn BlobStorage>,
    engine: RwLock<Option<Arc<Engine>>>,
}

impl LocalClient {
    pub fn new(config: LocalClientConfig, blobs: Arc<dyn BlobStorage>) -> Self {
        let session = Session::new(config.account.clone());
        Self {
            config,
            session,
            blobs,
            engine: RwLock::new(None),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_initialized(&self) -> bool {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Open the database and run migrations. Calling it twice is a no-op.
    pub async fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let db = Database::open(&self.config.connection)?;
        let store = shared(db);
        let archiver = Archiver::new(self.blobs.clone(), self.config.policy);
        let router = Router::new(store.clone(), archiver, Arc::new(SessionRegistry::new()));
        let mut finder = Finder::new(store.clone(), self.blobs.clone());
        if let Some(retry) = &self.config.blob_retry {
            finder = finder.with_retry(retry.clone());
        }

        let mut slot = self.engine.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(Arc::new(Engine {
                store,
                router,
                finder,
            }));
            tracing::info!(
                connection = %self.config.connection,
                account = %self.config.account,
                "local client initialised"
            );
        }
        Ok(())
    }

    /// Close the database and drop every subscription.
    pub async fn close(&self) -> Result<()> {
        let engine = self
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(engine) = engine else {
            return Ok(());
        };

        engine.router.sessions().unregister(&self.session.id);
        engine.store.lock().await.close()?;
        tracing::info!(connection = %self.config.connection, "local client closed");
        Ok(())
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ClientError::NotInitialized)
    }

    /// One message by id, hot or archived.
    pub async fn find_message(
        &self,
        card: &CardId,
        id: MessageId,
        created: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>> {
        let engine = self.engine()?;
        Ok(engine.finder.find_message(card, id, created).await?)
    }
}

#[async_trait]
impl CommunicationApi for LocalClient {
    async fn event(&self, event: Event) -> Result<EventResult> {
        let engine = self.engine()?;
        Ok(engine.router.event(&self.session, event).await?)
    }

    async fn find_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>> {
        let engine = self.engine()?;
        Ok(engine.finder.find_messages(params).await?)
    }

    async fn find_messages_meta(&self, params: &FindMessagesParams) -> Result<Vec<MessageMeta>> {
        let engine = self.engine()?;
        let store = engine.store.lock().await;
        Ok(store.find_messages_meta(params)?)
    }

    async fn find_messages_groups(
        &self,
        params: &FindMessagesGroupsParams,
    ) -> Result<Vec<MessagesGroup>> {
        let engine = self.engine()?;
        let store = engine.store.lock().await;
        Ok(store.find_messages_groups(params)?)
    }

    async fn find_notification_contexts(
        &self,
        params: &FindNotificationContextsParams,
    ) -> Result<Vec<NotificationContext>> {
        let engine = self.engine()?;
        let store = engine.store.lock().await;
        Ok(store.find_contexts(params)?)
    }

    async fn find_notifications(
        &self,
        params: &FindNotificationsParams,
    ) -> Result<Vec<Notification>> {
        let engine = self.engine()?;
        let store = engine.store.lock().await;
        Ok(store.find_notifications(params)?)
    }

    async fn find_collaborators(
        &self,
        params: &FindCollaboratorsParams,
    ) -> Result<Vec<Collaborator>> {
        let engine = self.engine()?;
        let store = engine.store.lock().await;
        Ok(store.find_collaborators(params)?)
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<Broadcasts> {
        let engine = self.engine()?;
        let sessions = engine.router.sessions();
        let rx = sessions.register(&self.session);
        for card in &subscription.cards {
            sessions.subscribe_card(&self.session.id, card.clone());
        }
        if subscription.contexts {
            sessions.subscribe_contexts(&self.session.id);
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use parley_shared::event::{BroadcastEvent, CreateMessageEvent, ReactionPatchEvent};
    use parley_shared::model::{MessageType, ReactionOpcode};
    use parley_shared::types::SocialId;
    use parley_store::MemoryBlobStorage;

    use super::*;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    fn create(content: &str, minute: u32) -> Event {
        Event::CreateMessage(CreateMessageEvent {
            card: CardId::from("C1"),
            message_type: MessageType::Message,
            content: content.into(),
            creator: SocialId::from("alice"),
            created: at(minute),
            extra: None,
        })
    }

    fn client(connection: &str, blobs: Arc<MemoryBlobStorage>) -> LocalClient {
        let mut config = LocalClientConfig::new(connection, "alice");
        config.policy = ArchivalPolicy { threshold: 3 };
        LocalClient::new(config, blobs)
    }

    #[tokio::test]
    async fn calls_fail_until_initialised_and_after_close() {
        let client = client(":memory:", Arc::new(MemoryBlobStorage::new()));
        let err = client
            .find_messages(&FindMessagesParams::for_card("C1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized));

        client.init().await.unwrap();
        client.init().await.unwrap();
        assert!(client.is_initialized());

        client.close().await.unwrap();
        let err = client.event(create("late", 0)).await.unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized));
    }

    #[tokio::test]
    async fn own_events_are_delivered_and_readable() {
        let client = client(":memory:", Arc::new(MemoryBlobStorage::new()));
        client.init().await.unwrap();
        let mut rx = client.subscribe(&Subscription::default()).await.unwrap();

        let result = client.event(create("hello", 0)).await.unwrap();
        let id = result.message_id.unwrap();
        client
            .event(Event::ReactionPatch(ReactionPatchEvent {
                card: CardId::from("C1"),
                message_id: id,
                opcode: ReactionOpcode::Add,
                reaction: "👍".into(),
                creator: SocialId::from("bob"),
                created: at(1),
            }))
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(BroadcastEvent::MessageCreated { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(BroadcastEvent::PatchCreated { .. })
        ));

        let found = client
            .find_message(&CardId::from("C1"), id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.content, "hello");
        assert_eq!(found.reactions.len(), 1);
    }

    #[tokio::test]
    async fn data_survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.sqlite3");
        let connection = path.to_string_lossy().to_string();
        let blobs = Arc::new(MemoryBlobStorage::new());

        let first = client(&connection, blobs.clone());
        first.init().await.unwrap();
        for minute in 0..5 {
            first.event(create(&format!("m{minute}"), minute)).await.unwrap();
        }
        first.close().await.unwrap();
        assert_eq!(blobs.len(), 1);

        let second = client(&connection, blobs);
        second.init().await.unwrap();
        let groups = second
            .find_messages_groups(&FindMessagesGroupsParams::default())
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);

        let all = second
            .find_messages(&FindMessagesParams::for_card("C1"))
            .await
            .unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m0", "m1", "m2", "m3", "m4"]);
    }
}
