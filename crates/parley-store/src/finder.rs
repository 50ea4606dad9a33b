//! Reads that span hot storage and archived groups.
//!
//! Hot rows always win over an archived copy of the same id. Patches
//! recorded after a group was archived are folded on top of the archived
//! message, so a message looks the same wherever it lives.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_shared::archive::{self, ArchiveFile};
use parley_shared::constants::DEFAULT_BLOB_FETCH_ATTEMPTS;
use parley_shared::model::{fold, Message, MessagesGroup, Patch};
use parley_shared::query::{Comparison, FindMessagesGroupsParams, FindMessagesParams, SortOrder};
use parley_shared::retry::{Retry, RetryOptions};
use parley_shared::types::{CardId, MessageId};
use parley_shared::CommunicationError;

use crate::adapter::SharedStore;
use crate::blobs::BlobStorage;
use crate::error::Result;

pub struct Finder {
    store: SharedStore,
    blobs: Arc<dyn BlobStorage>,
    retry: RetryOptions,
}

impl Finder {
    pub fn new(store: SharedStore, blobs: Arc<dyn BlobStorage>) -> Self {
        Self {
            store,
            blobs,
            retry: RetryOptions::with_attempts(DEFAULT_BLOB_FETCH_ATTEMPTS),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Locate one message by id. `created` narrows the archive search to
    /// groups whose date range brackets it.
    pub async fn find_message(
        &self,
        card: &CardId,
        id: MessageId,
        created: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>> {
        let (group, patches) = {
            let store = self.store.lock().await;
            let hot = store.find_messages(&FindMessagesParams {
                card: Some(card.clone()),
                id: Some(Comparison::Literal(id)),
                ..Default::default()
            })?;
            if let Some(message) = hot.into_iter().next() {
                return Ok(Some(message));
            }

            let groups = store.find_messages_groups(&FindMessagesGroupsParams {
                card: Some(card.clone()),
                order: Some(SortOrder::Ascending),
                ..Default::default()
            })?;
            let Some(group) = groups
                .into_iter()
                .find(|g| g.contains_id(id) && created.map_or(true, |at| g.brackets(at)))
            else {
                tracing::debug!(card = %card, id = %id, "message not found in hot or archive");
                return Ok(None);
            };
            let patches = store.find_archived_patches(&group)?;
            (group, patches)
        };

        let file = self.load_group(&group).await?;
        Ok(file.take_message(id).map(|m| fold_own(m, &patches)))
    }

    /// Hot results merged with every archived group that can satisfy the
    /// id and date filters, ordered and limited.
    pub async fn find_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>> {
        let order = params.order.unwrap_or_default();
        let limit = params.limit.map(|l| l as usize);

        let (hot, groups) = {
            let store = self.store.lock().await;
            let hot = store.find_messages(&FindMessagesParams {
                limit: None,
                ..params.clone()
            })?;

            let mut groups = Vec::new();
            if let Some(card) = &params.card {
                let candidates = store.find_messages_groups(&FindMessagesGroupsParams {
                    card: Some(card.clone()),
                    order: Some(order),
                    ..Default::default()
                })?;
                for group in candidates.into_iter().filter(|g| may_contain(g, params)) {
                    let patches = store.find_archived_patches(&group)?;
                    groups.push((group, patches));
                }
            }
            (hot, groups)
        };

        let mut archived: Vec<Message> = Vec::new();
        for (group, patches) in groups {
            // Archived ranges are older than hot rows and ordered here by
            // `order`, so once the limit is met later groups cannot rank.
            let have = match order {
                SortOrder::Ascending => archived.len(),
                SortOrder::Descending => hot.len() + archived.len(),
            };
            if limit.is_some_and(|l| have >= l) {
                break;
            }

            let file = self.load_group(&group).await?;
            archived.extend(
                file.into_messages()
                    .into_iter()
                    .map(|m| fold_own(m, &patches))
                    .filter(|m| satisfies(params, m)),
            );
        }

        let mut merged: BTreeMap<MessageId, Message> =
            archived.into_iter().map(|m| (m.id, m)).collect();
        for message in hot {
            merged.insert(message.id, message);
        }

        let mut messages: Vec<Message> = merged.into_values().collect();
        if order == SortOrder::Descending {
            messages.reverse();
        }
        if let Some(limit) = limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    /// Fetch and decode a group's blob. Missing or malformed blobs fail at
    /// once; transport failures are retried.
    async fn load_group(&self, group: &MessagesGroup) -> Result<ArchiveFile> {
        let blobs = &self.blobs;
        let file = Retry::new(self.retry.clone())
            .retry_if(|e: &CommunicationError| {
                !matches!(e, CommunicationError::NotFound(_) | CommunicationError::Parse(_))
            })
            .run(|| async move {
                let raw = blobs.get(&group.blob_id).await?;
                let text = String::from_utf8(raw)
                    .map_err(|e| CommunicationError::Parse(format!("blob {}: {e}", group.blob_id)))?;
                archive::decode(&text)
            })
            .await
            .map_err(|e| {
                tracing::warn!(blob = %group.blob_id, card = %group.card, error = %e, "archive fetch failed");
                e
            })?;
        Ok(file)
    }
}

/// Whether a group's id and date ranges overlap the query's bounds.
fn may_contain(group: &MessagesGroup, params: &FindMessagesParams) -> bool {
    let ids_overlap = params.id.as_ref().map_or(true, |c| {
        let (low, high) = c.bounds();
        low.map_or(true, |l| group.to_id >= *l) && high.map_or(true, |h| group.from_id <= *h)
    });
    let dates_overlap = params.created.as_ref().map_or(true, |c| {
        let (low, high) = c.bounds();
        low.map_or(true, |l| group.to_date >= *l) && high.map_or(true, |h| group.from_date <= *h)
    });
    ids_overlap && dates_overlap
}

fn satisfies(params: &FindMessagesParams, message: &Message) -> bool {
    params.id.as_ref().map_or(true, |c| c.matches(&message.id))
        && params.created.as_ref().map_or(true, |c| c.matches(&message.created))
        && params.creator.as_ref().map_or(true, |c| c == &message.creator)
}

/// Fold only the patches addressed to `message`.
fn fold_own(message: Message, patches: &[Patch]) -> Message {
    let own: Vec<Patch> = patches
        .iter()
        .filter(|p| p.message_id == message.id)
        .cloned()
        .collect();
    fold(message, &own)
}
