//! Moves the oldest hot messages of a card into immutable archive blobs.
//!
//! A pass is three steps: upload the encoded range, record the group row,
//! prune the hot rows it covers. A crash after the upload leaves an
//! unreferenced blob for the orphan sweep; a crash after the group row
//! leaves duplicates that readers ignore and [`Archiver::reconcile`]
//! removes.

use std::sync::Arc;

use parley_shared::archive::{self, FileMetadata};
use parley_shared::constants::DEFAULT_ARCHIVE_THRESHOLD;
use parley_shared::model::{Message, MessagesGroup};
use parley_shared::query::{FindMessagesGroupsParams, FindMessagesParams, SortOrder};
use parley_shared::types::CardId;
use parley_shared::CommunicationError;

use crate::adapter::{DbAdapter, StoreGuard};
use crate::blobs::{blob_id_for, BlobStorage};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchivalPolicy {
    /// Hot messages a card may hold before its oldest range is archived.
    /// Messages carrying a remove patch still occupy hot rows and are
    /// archived as tombstones, so they count toward the threshold.
    pub threshold: usize,
}

impl Default for ArchivalPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ARCHIVE_THRESHOLD,
        }
    }
}

#[derive(Clone)]
pub struct Archiver {
    storage: Arc<dyn BlobStorage>,
    policy: ArchivalPolicy,
}

impl Archiver {
    pub fn new(storage: Arc<dyn BlobStorage>, policy: ArchivalPolicy) -> Self {
        Self { storage, policy }
    }

    pub fn storage(&self) -> &Arc<dyn BlobStorage> {
        &self.storage
    }

    pub fn policy(&self) -> ArchivalPolicy {
        self.policy
    }

    /// Archive the card's oldest `threshold` messages until no more than
    /// `threshold` remain hot. Returns the groups created.
    pub async fn maybe_archive(
        &self,
        store: &mut StoreGuard<'_>,
        card: &CardId,
    ) -> Result<Vec<MessagesGroup>> {
        let threshold = self.policy.threshold.max(1);
        let mut created = Vec::new();

        loop {
            let hot = store.count_messages(card)?;
            if hot <= u64::try_from(threshold).unwrap_or(u64::MAX) {
                break;
            }

            let messages = store.find_messages(&FindMessagesParams {
                card: Some(card.clone()),
                order: Some(SortOrder::Ascending),
                limit: Some(u32::try_from(threshold).unwrap_or(u32::MAX)),
                ..Default::default()
            })?;
            if messages.is_empty() {
                break;
            }

            let group = self.archive_range(store, card, messages).await?;
            created.push(group);
        }

        Ok(created)
    }

    async fn archive_range(
        &self,
        store: &mut StoreGuard<'_>,
        card: &CardId,
        messages: Vec<Message>,
    ) -> Result<MessagesGroup> {
        let group = group_for(card, &messages)?;
        let metadata = FileMetadata {
            card_id: card.clone(),
            title: String::new(),
            from_date: group.from_date,
            to_date: group.to_date,
        };
        let encoded = archive::encode(&metadata, &messages)?;
        let blob_id = blob_id_for(encoded.as_bytes());

        if let Err(e) = self.storage.put(&blob_id, encoded.as_bytes()).await {
            tracing::warn!(card = %card, error = %e, "archive upload failed, hot rows kept");
            return Err(e.into());
        }

        let group = MessagesGroup { blob_id, ..group };
        store.create_messages_group(&group)?;
        let pruned = store.prune_group(&group)?;

        tracing::info!(
            card = %card,
            blob = %group.blob_id,
            from = %group.from_id,
            to = %group.to_id,
            pruned,
            "archived messages group"
        );
        Ok(group)
    }

    /// Remove hot rows still lying inside an archived range.
    pub fn reconcile(store: &dyn DbAdapter, card: &CardId) -> Result<usize> {
        let groups = store.find_messages_groups(&FindMessagesGroupsParams {
            card: Some(card.clone()),
            ..Default::default()
        })?;

        let mut pruned = 0;
        for group in &groups {
            pruned += store.prune_group(group)?;
        }
        if pruned > 0 {
            tracing::info!(card = %card, pruned, "reconciled archived duplicates");
        }
        Ok(pruned)
    }

    /// Best-effort deletion of the blobs behind removed groups.
    pub async fn discard(&self, groups: &[MessagesGroup]) {
        for group in groups {
            if let Err(e) = self.storage.delete(&group.blob_id).await {
                tracing::warn!(blob = %group.blob_id, error = %e, "failed to delete archive blob");
            }
        }
    }
}

/// Group row for a contiguous range; the blob id is filled in after upload.
fn group_for(card: &CardId, messages: &[Message]) -> Result<MessagesGroup> {
    let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
        return Err(StoreError::not_found(format!(
            "messages to archive for card {card}"
        )));
    };
    let count = u32::try_from(messages.len()).map_err(|_| {
        CommunicationError::Validation(vec![format!(
            "archive range of card {card} holds {} messages",
            messages.len()
        )])
    })?;

    let from_date = messages.iter().map(|m| m.created).min().unwrap_or(first.created);
    let to_date = messages.iter().map(|m| m.created).max().unwrap_or(last.created);

    Ok(MessagesGroup {
        card: card.clone(),
        blob_id: Default::default(),
        from_id: first.id,
        to_id: last.id,
        from_date,
        to_date,
        count,
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use parley_shared::model::{MessageType, Patch, PatchData, Reaction, UpdatePatchData};
    use parley_shared::types::{BlobId, MessageId, SocialId};
    use parley_shared::CommunicationError;

    use super::*;
    use crate::adapter::{shared, NewMessage, SharedStore};
    use crate::blobs::MemoryBlobStorage;
    use crate::database::Database;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    async fn seed(store: &SharedStore, card: &CardId, n: usize) {
        let guard = store.lock().await;
        for i in 0..n {
            guard
                .create_message(&NewMessage {
                    card: card.clone(),
                    message_type: MessageType::Message,
                    content: format!("m{}", i + 1),
                    creator: SocialId::from("alice"),
                    created: at(i as i64),
                    extra: None,
                })
                .unwrap();
        }
    }

    fn archiver(storage: Arc<dyn BlobStorage>, threshold: usize) -> Archiver {
        Archiver::new(storage, ArchivalPolicy { threshold })
    }

    #[tokio::test]
    async fn oldest_range_goes_to_one_blob() {
        let store = shared(Database::open_in_memory().unwrap());
        let blobs = Arc::new(MemoryBlobStorage::new());
        let card = CardId::from("C1");
        seed(&store, &card, 250).await;

        let mut guard = store.lock().await;
        guard
            .create_reaction(
                &card,
                &Reaction {
                    message: MessageId(5),
                    reaction: "👍".into(),
                    creator: SocialId::from("bob"),
                    created: at(300),
                },
            )
            .unwrap();
        guard
            .create_patch(&Patch {
                card: card.clone(),
                message_id: MessageId(5),
                creator: SocialId::from("alice"),
                created: at(301),
                data: PatchData::Update(UpdatePatchData {
                    content: Some("edited".into()),
                    extra: None,
                }),
            })
            .unwrap();

        let groups = archiver(blobs.clone(), 150)
            .maybe_archive(&mut guard, &card)
            .await
            .unwrap();

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!((group.from_id, group.to_id), (MessageId(1), MessageId(150)));
        assert_eq!(group.count, 150);
        assert_eq!(guard.count_messages(&card).unwrap(), 100);

        let hot = guard
            .find_messages(&FindMessagesParams::for_card(card.clone()))
            .unwrap();
        assert_eq!(hot.first().map(|m| m.id), Some(MessageId(151)));
        assert_eq!(hot.last().map(|m| m.id), Some(MessageId(250)));
        assert!(guard.find_patches(&card, MessageId(5)).unwrap().is_empty());

        let raw = blobs.get(&group.blob_id).await.unwrap();
        let file = archive::decode(std::str::from_utf8(&raw).unwrap()).unwrap();
        file.validate().unwrap();
        let fifth = file.take_message(MessageId(5)).unwrap();
        assert_eq!(fifth.content, "edited");
        assert_eq!(fifth.reactions.len(), 1);
    }

    #[tokio::test]
    async fn hot_and_archived_ranges_partition_the_timeline() {
        let store = shared(Database::open_in_memory().unwrap());
        let card = CardId::from("C1");
        seed(&store, &card, 35).await;

        let mut guard = store.lock().await;
        let groups = archiver(Arc::new(MemoryBlobStorage::new()), 10)
            .maybe_archive(&mut guard, &card)
            .await
            .unwrap();

        let ranges: Vec<(u64, u64)> = groups.iter().map(|g| (g.from_id.0, g.to_id.0)).collect();
        assert_eq!(ranges, vec![(1, 10), (11, 20), (21, 30)]);

        let hot: Vec<u64> = guard
            .find_messages(&FindMessagesParams::for_card(card.clone()))
            .unwrap()
            .iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(hot, vec![31, 32, 33, 34, 35]);
    }

    #[tokio::test]
    async fn removed_messages_count_and_archive_as_tombstones() {
        let store = shared(Database::open_in_memory().unwrap());
        let blobs = Arc::new(MemoryBlobStorage::new());
        let card = CardId::from("C1");
        seed(&store, &card, 4).await;

        let mut guard = store.lock().await;
        guard
            .create_patch(&Patch {
                card: card.clone(),
                message_id: MessageId(2),
                creator: SocialId::from("alice"),
                created: at(10),
                data: PatchData::Remove,
            })
            .unwrap();

        let groups = archiver(blobs.clone(), 3)
            .maybe_archive(&mut guard, &card)
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 3);
        assert_eq!(guard.count_messages(&card).unwrap(), 1);

        let raw = blobs.get(&groups[0].blob_id).await.unwrap();
        let file = archive::decode(std::str::from_utf8(&raw).unwrap()).unwrap();
        assert!(file.take_message(MessageId(2)).unwrap().removed);
    }

    struct RejectingStorage;

    #[async_trait]
    impl BlobStorage for RejectingStorage {
        async fn put(&self, _: &BlobId, _: &[u8]) -> std::result::Result<(), CommunicationError> {
            Err(CommunicationError::Network("connection reset".into()))
        }

        async fn get(&self, id: &BlobId) -> std::result::Result<Vec<u8>, CommunicationError> {
            Err(CommunicationError::NotFound(id.to_string()))
        }

        async fn delete(&self, _: &BlobId) -> std::result::Result<(), CommunicationError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_upload_keeps_hot_rows() {
        let store = shared(Database::open_in_memory().unwrap());
        let card = CardId::from("C1");
        seed(&store, &card, 12).await;

        let mut guard = store.lock().await;
        let res = archiver(Arc::new(RejectingStorage), 10)
            .maybe_archive(&mut guard, &card)
            .await;

        assert!(res.is_err());
        assert_eq!(guard.count_messages(&card).unwrap(), 12);
        assert!(guard
            .find_messages_groups(&FindMessagesGroupsParams::default())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reconcile_prunes_rows_left_by_interrupted_pass() {
        let store = shared(Database::open_in_memory().unwrap());
        let card = CardId::from("C1");
        seed(&store, &card, 5).await;

        let guard = store.lock().await;
        guard
            .create_messages_group(&MessagesGroup {
                card: card.clone(),
                blob_id: BlobId::from("b1"),
                from_id: MessageId(1),
                to_id: MessageId(3),
                from_date: at(0),
                to_date: at(2),
                count: 3,
            })
            .unwrap();
        assert_eq!(guard.count_messages(&card).unwrap(), 5);

        assert_eq!(Archiver::reconcile(&*guard, &card).unwrap(), 3);
        assert_eq!(guard.count_messages(&card).unwrap(), 2);
        assert_eq!(Archiver::reconcile(&*guard, &card).unwrap(), 0);
    }
}
