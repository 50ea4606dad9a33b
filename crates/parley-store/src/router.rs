//! Applies inbound events to the store and fans out the resulting
//! broadcasts.
//!
//! Every event is applied while holding the store lock, so events of one
//! card are serialized. Side effects are not rolled back: a failed
//! notification or archival pass is logged and the event still succeeds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_shared::event::{BroadcastEvent, Event, EventResult};
use parley_shared::model::{
    Attachment, AttachmentData, AttachmentOperation, Message, Notification, NotificationContext,
    Patch, PatchData, Reaction, ReactionOpcode, ReactionPatchData, Thread, ThreadOperation,
    UpdatePatchData,
};
use parley_shared::query::{
    Comparison, FindCollaboratorsParams, FindMessagesParams, FindNotificationContextsParams,
};
use parley_shared::types::{AccountId, CardId, ContextId, MessageId, NotificationId};
use parley_shared::CommunicationError;

use crate::adapter::{
    ContextUpdate, DbAdapter, NewMessage, NotificationUpdate, SharedStore, StoreGuard,
};
use crate::archival::Archiver;
use crate::error::{Result, StoreError};
use crate::sessions::{Session, SessionRegistry};

pub struct Router {
    store: SharedStore,
    archiver: Archiver,
    sessions: Arc<SessionRegistry>,
}

/// Broadcasts accumulated while one event applies.
type Outbox = Vec<BroadcastEvent>;

impl Router {
    pub fn new(store: SharedStore, archiver: Archiver, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            store,
            archiver,
            sessions,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    /// Validate, apply and broadcast one event on behalf of `session`.
    pub async fn event(&self, session: &Session, event: Event) -> Result<EventResult> {
        event.validate()?;
        let kind = event.kind();

        let mut outbox = Outbox::new();
        let mut store = self.store.lock().await;
        let result = self.apply(&mut store, session, event, &mut outbox).await?;

        tracing::debug!(
            kind,
            session = %session.id,
            broadcasts = outbox.len(),
            duplicate = result.duplicate,
            "event applied"
        );
        // Still under the lock, so subscribers see broadcasts in store order.
        self.sessions.publish(Some(&session.id), &outbox);
        drop(store);
        Ok(result)
    }

    async fn apply(
        &self,
        store: &mut StoreGuard<'_>,
        session: &Session,
        event: Event,
        outbox: &mut Outbox,
    ) -> Result<EventResult> {
        match event {
            Event::CreateMessage(e) => {
                let new = NewMessage {
                    card: e.card,
                    message_type: e.message_type,
                    content: e.content,
                    creator: e.creator,
                    created: e.created,
                    extra: e.extra,
                };
                let id = store.create_message(&new)?;
                let message = new.into_message(id);
                let card = message.card.clone();
                let created = message.created;
                outbox.push(BroadcastEvent::MessageCreated {
                    message: message.clone(),
                });

                if let Err(err) = notify_collaborators(&**store, session, &message, outbox) {
                    tracing::warn!(card = %card, message = %id, error = %err, "collaborator notification failed");
                }

                match self.archiver.maybe_archive(store, &card).await {
                    Ok(groups) => outbox.extend(
                        groups
                            .into_iter()
                            .map(|group| BroadcastEvent::MessagesGroupCreated { group }),
                    ),
                    Err(err) => tracing::warn!(card = %card, error = %err, "archival pass failed"),
                }

                Ok(EventResult {
                    message_id: Some(id),
                    created: Some(created),
                    ..Default::default()
                })
            }

            Event::UpdatePatch(e) => record_patch(
                &**store,
                Patch {
                    card: e.card,
                    message_id: e.message_id,
                    creator: e.creator,
                    created: e.created,
                    data: PatchData::Update(UpdatePatchData {
                        content: e.content,
                        extra: e.extra,
                    }),
                },
                outbox,
            ),

            Event::RemovePatch(e) => record_patch(
                &**store,
                Patch {
                    card: e.card,
                    message_id: e.message_id,
                    creator: e.creator,
                    created: e.created,
                    data: PatchData::Remove,
                },
                outbox,
            ),

            Event::ReactionPatch(e) => record_patch(
                &**store,
                Patch {
                    card: e.card,
                    message_id: e.message_id,
                    creator: e.creator,
                    created: e.created,
                    data: PatchData::Reaction(ReactionPatchData {
                        opcode: e.opcode,
                        reaction: e.reaction,
                    }),
                },
                outbox,
            ),

            Event::AttachmentPatch(e) => record_patch(
                &**store,
                Patch {
                    card: e.card,
                    message_id: e.message_id,
                    creator: e.creator,
                    created: e.created,
                    data: PatchData::Attachment(e.operation),
                },
                outbox,
            ),

            Event::ThreadPatch(e) => record_patch(
                &**store,
                Patch {
                    card: e.card,
                    message_id: e.message_id,
                    creator: e.creator,
                    created: e.created,
                    data: PatchData::Thread(e.operation),
                },
                outbox,
            ),

            Event::CreateNotification(e) => {
                let context = owned_context(&**store, &e.context, &e.account)?
                    .ok_or_else(|| StoreError::not_found(format!("context {}", e.context)))?;
                let notification = Notification {
                    id: NotificationId::generate(),
                    context: context.id,
                    card: context.card,
                    account: e.account,
                    message: e.message_id,
                    message_created: e.message_created,
                    created: e.created,
                    read: false,
                    archived: false,
                };
                store.create_notification(&notification)?;
                let id = notification.id.clone();
                outbox.push(BroadcastEvent::NotificationCreated { notification });

                Ok(EventResult {
                    notification_id: Some(id),
                    ..Default::default()
                })
            }

            Event::UpdateNotification(e) => {
                let updated = store.update_notifications(&NotificationUpdate {
                    context: e.context.clone(),
                    account: e.account.clone(),
                    id: e.id.clone(),
                    until: e.until,
                    read: e.read,
                    archived: e.archived,
                })?;
                if updated == 0 {
                    return Ok(EventResult {
                        duplicate: true,
                        ..Default::default()
                    });
                }
                outbox.push(BroadcastEvent::NotificationsUpdated {
                    context: e.context,
                    account: e.account,
                    id: e.id,
                    until: e.until,
                    read: e.read,
                    archived: e.archived,
                });
                Ok(EventResult::default())
            }

            Event::RemoveNotifications(e) => {
                if owned_context(&**store, &e.context, &e.account)?.is_none() {
                    return Ok(EventResult {
                        duplicate: true,
                        ..Default::default()
                    });
                }
                let removed = store.remove_notifications(&e.context, &e.ids)?;
                if removed == 0 {
                    return Ok(EventResult {
                        duplicate: true,
                        ..Default::default()
                    });
                }
                outbox.push(BroadcastEvent::NotificationsRemoved {
                    context: e.context,
                    account: e.account,
                    ids: e.ids,
                });
                Ok(EventResult::default())
            }

            Event::CreateNotificationContext(e) => {
                if let Some(existing) = context_for(&**store, &e.card, &e.account)? {
                    return Ok(EventResult {
                        context_id: Some(existing.id),
                        duplicate: true,
                        ..Default::default()
                    });
                }
                let context = NotificationContext {
                    id: ContextId::generate(),
                    card: e.card,
                    account: e.account,
                    last_view: e.last_view,
                    last_update: e.last_update,
                    last_notify: None,
                    notifications: None,
                };
                store.create_context(&context)?;
                let id = context.id.clone();
                outbox.push(BroadcastEvent::NotificationContextCreated { context });

                Ok(EventResult {
                    context_id: Some(id),
                    ..Default::default()
                })
            }

            Event::UpdateNotificationContext(e) => {
                if owned_context(&**store, &e.context, &e.account)?.is_none() {
                    return Err(StoreError::not_found(format!("context {}", e.context)));
                }
                let context = store
                    .update_context(
                        &e.context,
                        &ContextUpdate {
                            last_view: e.last_view,
                            last_update: e.last_update,
                            last_notify: e.last_notify,
                        },
                    )?
                    .ok_or_else(|| StoreError::not_found(format!("context {}", e.context)))?;
                let id = context.id.clone();
                outbox.push(BroadcastEvent::NotificationContextUpdated { context });

                Ok(EventResult {
                    context_id: Some(id),
                    ..Default::default()
                })
            }

            Event::RemoveNotificationContext(e) => {
                if owned_context(&**store, &e.context, &e.account)?.is_none() {
                    return Ok(EventResult {
                        duplicate: true,
                        ..Default::default()
                    });
                }
                match store.remove_context(&e.context)? {
                    Some(context) => {
                        outbox.push(BroadcastEvent::NotificationContextRemoved { context });
                        Ok(EventResult {
                            context_id: Some(e.context),
                            ..Default::default()
                        })
                    }
                    None => Ok(EventResult {
                        duplicate: true,
                        ..Default::default()
                    }),
                }
            }

            Event::AddCollaborators(e) => {
                let added = store.add_collaborators(&e.card, &e.collaborators, e.date)?;
                if added.is_empty() {
                    return Ok(EventResult {
                        duplicate: true,
                        ..Default::default()
                    });
                }
                for collaborator in &added {
                    if let Err(err) =
                        ensure_context(&**store, &e.card, &collaborator.account, e.date, outbox)
                    {
                        tracing::warn!(
                            card = %e.card,
                            account = %collaborator.account,
                            error = %err,
                            "failed to create collaborator context"
                        );
                    }
                }
                outbox.push(BroadcastEvent::CollaboratorsAdded {
                    card: e.card,
                    collaborators: added,
                });
                Ok(EventResult::default())
            }

            Event::RemoveCollaborators(e) => {
                let removed = store.remove_collaborators(&e.card, &e.collaborators)?;
                if removed.is_empty() {
                    return Ok(EventResult {
                        duplicate: true,
                        ..Default::default()
                    });
                }
                outbox.push(BroadcastEvent::CollaboratorsRemoved {
                    card: e.card,
                    accounts: removed,
                });
                Ok(EventResult::default())
            }

            Event::RemoveCard(e) => {
                let groups = store.remove_card(&e.card)?;
                self.archiver.discard(&groups).await;
                outbox.push(BroadcastEvent::CardRemoved { card: e.card });
                Ok(EventResult::default())
            }
        }
    }
}

/// Store a patch unless an identical one was already recorded, and keep
/// the projections of hot messages current.
fn record_patch(store: &dyn DbAdapter, patch: Patch, outbox: &mut Outbox) -> Result<EventResult> {
    let allocated = store
        .last_message_id(&patch.card)?
        .is_some_and(|last| patch.message_id.0 > 0 && patch.message_id <= last);
    if !allocated {
        return Err(StoreError::not_found(format!(
            "message {} of card {}",
            patch.message_id, patch.card
        )));
    }

    if store.patch_exists(&patch.card, &patch.key())? {
        tracing::debug!(
            card = %patch.card,
            message = %patch.message_id,
            kind = patch.data.patch_type().as_str(),
            "duplicate patch dropped"
        );
        return Ok(EventResult {
            duplicate: true,
            ..Default::default()
        });
    }

    store.create_patch(&patch)?;
    let projected = !matches!(patch.data, PatchData::Update(_) | PatchData::Remove);
    if projected && is_hot(store, &patch.card, patch.message_id)? {
        let patches = store.find_patches(&patch.card, patch.message_id)?;
        if patches.iter().any(|p| p.created > patch.created) {
            tracing::debug!(
                card = %patch.card,
                message = %patch.message_id,
                "late patch, rebuilding projections"
            );
            store.clear_projections(&patch.card, patch.message_id)?;
            for stored in &patches {
                project(store, stored)?;
            }
        } else {
            project(store, &patch)?;
        }
    }

    let result = EventResult {
        message_id: Some(patch.message_id),
        created: Some(patch.created),
        ..Default::default()
    };
    outbox.push(BroadcastEvent::PatchCreated {
        card: patch.card.clone(),
        patch,
    });
    Ok(result)
}

fn is_hot(store: &dyn DbAdapter, card: &CardId, id: MessageId) -> Result<bool> {
    let found = store.find_messages_meta(&FindMessagesParams {
        card: Some(card.clone()),
        id: Some(Comparison::Literal(id)),
        limit: Some(1),
        ..Default::default()
    })?;
    Ok(!found.is_empty())
}

/// Mirror a patch into the reaction, attachment and thread tables.
/// Update and remove patches are folded on read instead.
fn project(store: &dyn DbAdapter, patch: &Patch) -> Result<()> {
    let card = &patch.card;
    let message = patch.message_id;
    let to_attachments = |list: &[AttachmentData]| -> Vec<Attachment> {
        list.iter()
            .map(|a| Attachment {
                id: a.id.clone(),
                mime: a.mime.clone(),
                params: a.params.clone(),
                creator: patch.creator.clone(),
                created: patch.created,
            })
            .collect()
    };

    match &patch.data {
        PatchData::Update(_) | PatchData::Remove => {}
        PatchData::Reaction(data) => match data.opcode {
            ReactionOpcode::Add => {
                store.create_reaction(
                    card,
                    &Reaction {
                        message,
                        reaction: data.reaction.clone(),
                        creator: patch.creator.clone(),
                        created: patch.created,
                    },
                )?;
            }
            ReactionOpcode::Remove => {
                store.remove_reaction(card, message, &patch.creator, &data.reaction)?;
            }
        },
        PatchData::Attachment(op) => match op {
            AttachmentOperation::Add { attachments } => {
                store.create_attachments(card, message, &to_attachments(attachments))?
            }
            AttachmentOperation::Remove { ids } => {
                store.remove_attachments(card, message, ids)?;
            }
            AttachmentOperation::Set { attachments } => {
                store.set_attachments(card, message, &to_attachments(attachments))?
            }
            AttachmentOperation::Update { attachments } => {
                store.update_attachments(card, message, attachments)?;
            }
        },
        PatchData::Thread(op) => match op {
            ThreadOperation::Attach {
                thread_id,
                thread_type,
            } => store.create_thread(&Thread {
                card: card.clone(),
                message,
                thread_id: thread_id.clone(),
                thread_type: thread_type.clone(),
                replies_count: 0,
                last_reply: None,
            })?,
            ThreadOperation::Update {
                replies_count_op,
                last_reply,
            } => {
                store.update_thread(card, message, *replies_count_op, *last_reply)?;
            }
        },
    }
    Ok(())
}

fn context_for(
    store: &dyn DbAdapter,
    card: &CardId,
    account: &AccountId,
) -> Result<Option<NotificationContext>> {
    let found = store.find_contexts(&FindNotificationContextsParams {
        card: Some(card.clone()),
        account: Some(account.clone()),
        limit: Some(1),
        ..Default::default()
    })?;
    Ok(found.into_iter().next())
}

/// The context with `id`, provided it belongs to `account`.
fn owned_context(
    store: &dyn DbAdapter,
    id: &ContextId,
    account: &AccountId,
) -> Result<Option<NotificationContext>> {
    let found = store.find_contexts(&FindNotificationContextsParams {
        id: Some(id.clone()),
        limit: Some(1),
        ..Default::default()
    })?;
    match found.into_iter().next() {
        Some(ctx) if &ctx.account != account => Err(CommunicationError::Validation(vec![format!(
            "context {id} does not belong to account {account}"
        )])
        .into()),
        other => Ok(other),
    }
}

fn ensure_context(
    store: &dyn DbAdapter,
    card: &CardId,
    account: &AccountId,
    at: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<NotificationContext> {
    if let Some(existing) = context_for(store, card, account)? {
        return Ok(existing);
    }
    let context = NotificationContext {
        id: ContextId::generate(),
        card: card.clone(),
        account: account.clone(),
        last_view: None,
        last_update: at,
        last_notify: None,
        notifications: None,
    };
    store.create_context(&context)?;
    outbox.push(BroadcastEvent::NotificationContextCreated {
        context: context.clone(),
    });
    Ok(context)
}

/// Notify every collaborator of the card except the author's own account,
/// whose context only has its `lastUpdate` moved.
fn notify_collaborators(
    store: &dyn DbAdapter,
    session: &Session,
    message: &Message,
    outbox: &mut Outbox,
) -> Result<()> {
    let collaborators = store.find_collaborators(&FindCollaboratorsParams {
        card: Some(message.card.clone()),
        ..Default::default()
    })?;

    for collaborator in collaborators {
        if collaborator.account == session.account {
            continue;
        }

        let context = ensure_context(
            store,
            &message.card,
            &collaborator.account,
            message.created,
            outbox,
        )?;
        let notification = Notification {
            id: NotificationId::generate(),
            context: context.id.clone(),
            card: message.card.clone(),
            account: collaborator.account.clone(),
            message: message.id,
            message_created: message.created,
            created: message.created,
            read: false,
            archived: false,
        };
        store.create_notification(&notification)?;
        outbox.push(BroadcastEvent::NotificationCreated { notification });

        if let Some(context) = store.update_context(
            &context.id,
            &ContextUpdate {
                last_update: Some(message.created),
                last_notify: Some(message.created),
                ..Default::default()
            },
        )? {
            outbox.push(BroadcastEvent::NotificationContextUpdated { context });
        }
    }

    if let Some(own) = context_for(store, &message.card, &session.account)? {
        if let Some(context) = store.update_context(
            &own.id,
            &ContextUpdate {
                last_update: Some(message.created),
                ..Default::default()
            },
        )? {
            outbox.push(BroadcastEvent::NotificationContextUpdated { context });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use parley_shared::event::{
        AddCollaboratorsEvent, AttachmentPatchEvent, CreateMessageEvent, ReactionPatchEvent,
        RemoveCardEvent, RemoveNotificationContextEvent,
    };
    use parley_shared::model::{fold, MessageType};
    use parley_shared::query::{FindMessagesGroupsParams, FindNotificationsParams};
    use parley_shared::types::SocialId;

    use super::*;
    use crate::adapter::shared;
    use crate::archival::ArchivalPolicy;
    use crate::blobs::MemoryBlobStorage;
    use crate::database::Database;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn router(threshold: usize) -> (Router, Arc<MemoryBlobStorage>) {
        let blobs = Arc::new(MemoryBlobStorage::new());
        let archiver = Archiver::new(blobs.clone(), ArchivalPolicy { threshold });
        let router = Router::new(
            shared(Database::open_in_memory().unwrap()),
            archiver,
            Arc::new(SessionRegistry::new()),
        );
        (router, blobs)
    }

    fn create(card: &str, content: &str, secs: i64) -> Event {
        Event::CreateMessage(CreateMessageEvent {
            card: CardId::from(card),
            message_type: MessageType::Message,
            content: content.into(),
            creator: SocialId::from("alice"),
            created: at(secs),
            extra: None,
        })
    }

    fn react(id: MessageId, who: &str, secs: i64) -> Event {
        Event::ReactionPatch(ReactionPatchEvent {
            card: CardId::from("C1"),
            message_id: id,
            opcode: ReactionOpcode::Add,
            reaction: "👍".into(),
            creator: SocialId::from(who),
            created: at(secs),
        })
    }

    #[tokio::test]
    async fn new_message_notifies_other_collaborators() {
        let (router, _) = router(150);
        let alice = Session::new("alice");
        let bob = Session::new("bob");
        let mut bob_rx = router.sessions().register(&bob);
        router.sessions().subscribe_contexts(&bob.id);

        router
            .event(
                &alice,
                Event::AddCollaborators(AddCollaboratorsEvent {
                    card: CardId::from("C1"),
                    collaborators: vec![AccountId::from("alice"), AccountId::from("bob")],
                    date: at(0),
                }),
            )
            .await
            .unwrap();

        let result = router.event(&alice, create("C1", "hello", 10)).await.unwrap();
        assert_eq!(result.message_id, Some(MessageId(1)));

        let store = router.store().lock().await;
        let for_bob = store
            .find_notifications(&FindNotificationsParams {
                account: Some(AccountId::from("bob")),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(for_bob.len(), 1);
        assert_eq!(for_bob[0].message, MessageId(1));
        let for_alice = store
            .find_notifications(&FindNotificationsParams {
                account: Some(AccountId::from("alice")),
                ..Default::default()
            })
            .unwrap();
        assert!(for_alice.is_empty());
        drop(store);

        let mut saw_notification = false;
        while let Ok(event) = bob_rx.try_recv() {
            if matches!(event, BroadcastEvent::NotificationCreated { .. }) {
                saw_notification = true;
            }
        }
        assert!(saw_notification);
    }

    #[tokio::test]
    async fn redelivered_patch_is_a_duplicate() {
        let (router, _) = router(150);
        let alice = Session::new("alice");
        router.event(&alice, create("C1", "hi", 0)).await.unwrap();

        let first = router.event(&alice, react(MessageId(1), "bob", 5)).await.unwrap();
        let second = router.event(&alice, react(MessageId(1), "bob", 5)).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);

        let store = router.store().lock().await;
        let messages = store
            .find_messages(&FindMessagesParams::for_card("C1"))
            .unwrap();
        assert_eq!(messages[0].reactions.len(), 1);
        assert_eq!(store.find_patches(&CardId::from("C1"), MessageId(1)).unwrap().len(), 1);
    }

    fn attach(id: MessageId, operation: AttachmentOperation, secs: i64) -> Event {
        Event::AttachmentPatch(AttachmentPatchEvent {
            card: CardId::from("C1"),
            message_id: id,
            operation,
            creator: SocialId::from("bob"),
            created: at(secs),
        })
    }

    fn file(id: &str) -> AttachmentData {
        AttachmentData {
            id: id.into(),
            mime: "image/png".into(),
            params: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn late_patches_project_in_created_order() {
        let (router, _) = router(150);
        let alice = Session::new("alice");
        router.event(&alice, create("C1", "hi", 0)).await.unwrap();
        let id = MessageId(1);

        // The removal is newer than the add but arrives first.
        let mut remove = react(id, "bob", 20);
        if let Event::ReactionPatch(e) = &mut remove {
            e.opcode = ReactionOpcode::Remove;
        }
        router.event(&alice, remove).await.unwrap();
        router.event(&alice, react(id, "bob", 10)).await.unwrap();

        router
            .event(
                &alice,
                attach(id, AttachmentOperation::Set { attachments: vec![file("a")] }, 30),
            )
            .await
            .unwrap();
        router
            .event(
                &alice,
                attach(id, AttachmentOperation::Add { attachments: vec![file("b")] }, 25),
            )
            .await
            .unwrap();

        let store = router.store().lock().await;
        let found = store
            .find_messages(&FindMessagesParams::for_card("C1"))
            .unwrap()
            .remove(0);
        assert!(found.reactions.is_empty());
        let ids: Vec<&str> = found.attachments.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);

        let base = Message {
            reactions: Vec::new(),
            attachments: Vec::new(),
            thread: None,
            ..found.clone()
        };
        let folded = fold(base, &store.find_patches(&CardId::from("C1"), id).unwrap());
        assert_eq!(folded.reactions, found.reactions);
        assert_eq!(folded.attachments, found.attachments);
    }

    #[tokio::test]
    async fn patch_for_unallocated_id_is_rejected() {
        let (router, _) = router(150);
        let alice = Session::new("alice");

        let err = router.event(&alice, react(MessageId(1), "bob", 5)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        router.event(&alice, create("C1", "hi", 0)).await.unwrap();
        let err = router.event(&alice, react(MessageId(2), "bob", 5)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        router.event(&alice, react(MessageId(1), "bob", 5)).await.unwrap();

        let store = router.store().lock().await;
        let card = CardId::from("C1");
        assert!(store.find_patches(&card, MessageId(2)).unwrap().is_empty());
        assert_eq!(store.find_patches(&card, MessageId(1)).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_events_broadcast_in_store_order() {
        let (router, _) = router(1_000);
        let router = Arc::new(router);
        let watcher = Session::new("carol");
        let mut rx = router.sessions().register(&watcher);
        router.sessions().subscribe_card(&watcher.id, CardId::from("C1"));

        let tasks: Vec<_> = (0..8)
            .map(|writer| {
                let router = router.clone();
                tokio::spawn(async move {
                    let session = Session::new(format!("writer{writer}"));
                    for i in 0..25 {
                        router
                            .event(&session, create("C1", "m", writer * 100 + i))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let ids: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                BroadcastEvent::MessageCreated { message } => Some(message.id.0),
                _ => None,
            })
            .collect();
        assert_eq!(ids, (1..=200).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn crossing_the_threshold_broadcasts_a_group() {
        let (router, blobs) = router(3);
        let alice = Session::new("alice");
        let mut rx = router.sessions().register(&alice);

        for i in 0..4 {
            router
                .event(&alice, create("C1", &format!("m{i}"), i))
                .await
                .unwrap();
        }

        let groups: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, BroadcastEvent::MessagesGroupCreated { .. }))
            .collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(blobs.len(), 1);
        assert_eq!(router.store().lock().await.count_messages(&CardId::from("C1")).unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_event_touches_nothing() {
        let (router, _) = router(150);
        let alice = Session::new("alice");
        let err = router.event(&alice, create("", "x", 0)).await.unwrap_err();
        assert!(matches!(
            CommunicationError::from(err),
            CommunicationError::Validation(_)
        ));
        assert_eq!(router.store().lock().await.count_messages(&CardId::from("")).unwrap(), 0);
    }

    #[tokio::test]
    async fn removing_a_missing_context_is_a_duplicate() {
        let (router, _) = router(150);
        let result = router
            .event(
                &Session::new("alice"),
                Event::RemoveNotificationContext(RemoveNotificationContextEvent {
                    context: ContextId::from("nope"),
                    account: AccountId::from("alice"),
                }),
            )
            .await
            .unwrap();
        assert!(result.duplicate);
    }

    #[tokio::test]
    async fn removing_a_card_deletes_its_blobs() {
        let (router, blobs) = router(2);
        let alice = Session::new("alice");
        for i in 0..5 {
            router.event(&alice, create("C1", "m", i)).await.unwrap();
        }
        assert!(!blobs.is_empty());

        router
            .event(
                &alice,
                Event::RemoveCard(RemoveCardEvent {
                    card: CardId::from("C1"),
                }),
            )
            .await
            .unwrap();

        assert!(blobs.is_empty());
        let store = router.store().lock().await;
        assert_eq!(store.count_messages(&CardId::from("C1")).unwrap(), 0);
        assert!(store
            .find_messages_groups(&FindMessagesGroupsParams::default())
            .unwrap()
            .is_empty());
    }
}
