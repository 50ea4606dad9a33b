use parley_shared::model::MessagesGroup;
use parley_shared::query::FindMessagesGroupsParams;
use parley_shared::types::{BlobId, CardId};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::sql::{self, id_value, limit_sql, order_sql, Filter};

const GROUP_COLUMNS: &str = "card, blob_id, from_id, to_id, from_date, to_date, count";

impl Database {
    /// Insert a group row. Every patch stored up to now for the range is
    /// recorded as folded into the blob.
    pub fn insert_group(&self, group: &MessagesGroup) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO messages_groups
                 (card, blob_id, from_id, to_id, from_date, to_date, count, patch_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, (SELECT COALESCE(MAX(seq), 0) FROM patches))",
            params![
                group.card.as_str(),
                group.blob_id.as_str(),
                id_value(group.from_id),
                id_value(group.to_id),
                sql::ts(&group.from_date),
                sql::ts(&group.to_date),
                group.count,
            ],
        )?;
        Ok(())
    }

    pub fn delete_group(&self, card: &CardId, blob_id: &BlobId) -> Result<bool> {
        let affected = self.conn()?.execute(
            "DELETE FROM messages_groups WHERE card = ?1 AND blob_id = ?2",
            params![card.as_str(), blob_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    pub fn get_groups(&self, params: &FindMessagesGroupsParams) -> Result<Vec<MessagesGroup>> {
        let mut filter = Filter::new();
        filter
            .eq_opt("card", params.card.as_ref().map(|c| c.to_string()))
            .eq_opt("blob_id", params.blob_id.as_ref().map(|b| b.to_string()))
            .compare("from_date", params.from_date.as_ref())
            .compare("to_date", params.to_date.as_ref());

        let query = format!(
            "SELECT {GROUP_COLUMNS} FROM messages_groups{}{}{}",
            filter.where_sql(),
            order_sql("from_date", params.order),
            limit_sql(params.limit),
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(filter.params(), row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Last patch sequence folded into a group's blob.
    pub(crate) fn group_watermark(&self, card: &CardId, blob_id: &BlobId) -> Result<i64> {
        self.conn()?
            .query_row(
                "SELECT patch_seq FROM messages_groups WHERE card = ?1 AND blob_id = ?2",
                params![card.as_str(), blob_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::not_found(format!("group {blob_id} of card {card}"))
                }
                other => StoreError::Sqlite(other),
            })
    }

    /// Remove hot rows duplicated by an archived group: messages and their
    /// projections in range, plus patches already folded into the blob.
    pub fn prune_archived(&self, group: &MessagesGroup) -> Result<usize> {
        let watermark = self.group_watermark(&group.card, &group.blob_id)?;
        let messages = self.delete_messages(&group.card, group.from_id, group.to_id)?;
        let patches =
            self.delete_patches(&group.card, group.from_id, group.to_id, Some(watermark))?;

        if messages > 0 || patches > 0 {
            tracing::debug!(
                card = %group.card,
                blob = %group.blob_id,
                messages,
                patches,
                "pruned archived hot rows"
            );
        }
        Ok(messages)
    }

    pub fn get_referenced_blobs(&self) -> Result<Vec<BlobId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT blob_id FROM messages_groups")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut blobs = Vec::new();
        for row in rows {
            blobs.push(BlobId::new(row?));
        }
        Ok(blobs)
    }

    /// Delete everything stored for a card; returns its former groups.
    pub fn purge_card(&self, card: &CardId) -> Result<Vec<MessagesGroup>> {
        let groups = self.get_groups(&FindMessagesGroupsParams {
            card: Some(card.clone()),
            ..Default::default()
        })?;

        let tx = self.conn()?.unchecked_transaction()?;
        for table in [
            "messages",
            "patches",
            "reactions",
            "attachments",
            "threads",
            "messages_groups",
            "sequences",
            "notifications",
            "notification_contexts",
            "collaborators",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE card = ?1"),
                params![card.as_str()],
            )?;
        }
        tx.commit()?;

        tracing::info!(card = %card, groups = groups.len(), "card purged");
        Ok(groups)
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessagesGroup> {
    let card: String = row.get(0)?;
    let blob_id: String = row.get(1)?;
    let from_id: i64 = row.get(2)?;
    let to_id: i64 = row.get(3)?;
    let from_date: String = row.get(4)?;
    let to_date: String = row.get(5)?;
    let count: u32 = row.get(6)?;

    Ok(MessagesGroup {
        card: CardId::new(card),
        blob_id: BlobId::new(blob_id),
        from_id: sql::message_id(2, from_id)?,
        to_id: sql::message_id(3, to_id)?,
        from_date: sql::parse_ts(4, &from_date)?,
        to_date: sql::parse_ts(5, &to_date)?,
        count,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use parley_shared::model::{MessageType, Patch, PatchData};
    use parley_shared::query::{Comparison, FindMessagesParams, SortOrder};
    use parley_shared::types::{MessageId, SocialId};

    use super::*;
    use crate::adapter::NewMessage;

    fn group(blob: &str, from: u64, to: u64, day: i64) -> MessagesGroup {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::days(day);
        MessagesGroup {
            card: CardId::from("C1"),
            blob_id: BlobId::from(blob),
            from_id: MessageId(from),
            to_id: MessageId(to),
            from_date: base,
            to_date: base + Duration::hours(1),
            count: (to - from + 1) as u32,
        }
    }

    #[test]
    fn groups_filter_by_date_and_order() {
        let db = Database::open_in_memory().unwrap();
        db.insert_group(&group("b1", 1, 10, 0)).unwrap();
        db.insert_group(&group("b2", 11, 20, 1)).unwrap();
        db.insert_group(&group("b3", 21, 30, 2)).unwrap();

        let found = db
            .get_groups(&FindMessagesGroupsParams {
                card: Some(CardId::from("C1")),
                from_date: Some(Comparison::greater(group("x", 0, 0, 0).from_date)),
                order: Some(SortOrder::Descending),
                ..Default::default()
            })
            .unwrap();
        let blobs: Vec<&str> = found.iter().map(|g| g.blob_id.as_str()).collect();
        assert_eq!(blobs, vec!["b3", "b2"]);
        assert_eq!(db.get_referenced_blobs().unwrap().len(), 3);
    }

    #[test]
    fn prune_keeps_patches_recorded_after_archival() {
        let db = Database::open_in_memory().unwrap();
        let card = CardId::from("C1");
        let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for _ in 0..3 {
            db.insert_message(&NewMessage {
                card: card.clone(),
                message_type: MessageType::Message,
                content: "hi".into(),
                creator: SocialId::from("alice"),
                created,
                extra: None,
            })
            .unwrap();
        }
        let remove = |secs| Patch {
            card: card.clone(),
            message_id: MessageId(2),
            creator: SocialId::from("alice"),
            created: created + Duration::seconds(secs),
            data: PatchData::Remove,
        };
        db.insert_patch(&remove(1)).unwrap();

        let g = MessagesGroup {
            from_date: created,
            to_date: created,
            ..group("b1", 1, 2, 0)
        };
        db.insert_group(&g).unwrap();
        db.insert_patch(&remove(2)).unwrap();

        assert_eq!(db.prune_archived(&g).unwrap(), 2);
        let hot = db.get_messages(&FindMessagesParams::for_card(card.clone())).unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].id, MessageId(3));

        let later = db.get_patches(&card, g.from_id, g.to_id, Some(0)).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].created, remove(2).created);
    }

    #[test]
    fn purge_returns_groups() {
        let db = Database::open_in_memory().unwrap();
        db.insert_group(&group("b1", 1, 10, 0)).unwrap();
        let removed = db.purge_card(&CardId::from("C1")).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(db.get_referenced_blobs().unwrap().is_empty());
    }
}
