use parley_shared::model::{fold, Message, MessageMeta, MessageType};
use parley_shared::query::FindMessagesParams;
use parley_shared::types::{CardId, MessageId, SocialId};
use rusqlite::{params, OptionalExtension};

use crate::adapter::NewMessage;
use crate::database::Database;
use crate::error::Result;
use crate::sql::{self, id_value, limit_sql, order_sql, Filter};

const MESSAGE_COLUMNS: &str = "card, id, type, content, creator, created, extra";

impl Database {
    /// Allocate the card's next id and insert the base message in one transaction.
    pub fn insert_message(&self, message: &NewMessage) -> Result<MessageId> {
        let tx = self.conn()?.unchecked_transaction()?;

        let next: i64 = tx.query_row(
            "INSERT INTO sequences (card, last_id) VALUES (?1, 1)
             ON CONFLICT(card) DO UPDATE SET last_id = last_id + 1
             RETURNING last_id",
            params![message.card.as_str()],
            |row| row.get(0),
        )?;
        let id = sql::message_id(0, next)?;

        let extra = message
            .extra
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            "INSERT INTO messages (card, id, type, content, creator, created, extra)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.card.as_str(),
                next,
                message.message_type.as_str(),
                message.content,
                message.creator.as_str(),
                sql::ts(&message.created),
                extra,
            ],
        )?;

        tx.commit()?;
        Ok(id)
    }

    /// Delete hot messages in `from..=to` with their reactions, attachments
    /// and threads. Patches are left to [`Database::delete_patches`].
    pub fn delete_messages(&self, card: &CardId, from: MessageId, to: MessageId) -> Result<usize> {
        let tx = self.conn()?.unchecked_transaction()?;
        let (from, to) = (id_value(from), id_value(to));

        for table in ["reactions", "attachments", "threads"] {
            tx.execute(
                &format!(
                    "DELETE FROM {table} WHERE card = ?1 AND message_id BETWEEN ?2 AND ?3"
                ),
                params![card.as_str(), from, to],
            )?;
        }
        let affected = tx.execute(
            "DELETE FROM messages WHERE card = ?1 AND id BETWEEN ?2 AND ?3",
            params![card.as_str(), from, to],
        )?;

        tx.commit()?;
        Ok(affected)
    }

    /// Highest id ever allocated for the card, hot or archived.
    pub fn last_message_id(&self, card: &CardId) -> Result<Option<MessageId>> {
        let last: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT last_id FROM sequences WHERE card = ?1",
                params![card.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last.map(|raw| sql::message_id(0, raw)).transpose()?)
    }

    /// Drop the reactions, attachments and thread of one message.
    pub fn delete_projections(&self, card: &CardId, id: MessageId) -> Result<()> {
        let tx = self.conn()?.unchecked_transaction()?;
        for table in ["reactions", "attachments", "threads"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE card = ?1 AND message_id = ?2"),
                params![card.as_str(), id_value(id)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Hot messages with their projections and update/remove patches folded.
    pub fn get_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>> {
        let mut messages = self.select_base_messages(params)?;
        for message in &mut messages {
            self.hydrate(message)?;
        }
        Ok(messages)
    }

    pub fn get_messages_meta(&self, params: &FindMessagesParams) -> Result<Vec<MessageMeta>> {
        let metas = self
            .select_base_messages(params)?
            .into_iter()
            .map(|m| {
                let removed = self.is_removed(&m.card, m.id)?;
                Ok(MessageMeta {
                    removed,
                    ..MessageMeta::from(&m)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(metas)
    }

    pub fn count_hot_messages(&self, card: &CardId) -> Result<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM messages WHERE card = ?1",
            params![card.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn select_base_messages(&self, params: &FindMessagesParams) -> Result<Vec<Message>> {
        let mut filter = Filter::new();
        filter
            .eq_opt("card", params.card.as_ref().map(|c| c.to_string()))
            .compare("id", params.id.as_ref())
            .compare("created", params.created.as_ref())
            .eq_opt("creator", params.creator.as_ref().map(|c| c.to_string()));

        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages{}{}{}",
            filter.where_sql(),
            order_sql("id", params.order),
            limit_sql(params.limit),
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(filter.params(), row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn hydrate(&self, message: &mut Message) -> Result<()> {
        message.reactions = self.get_reactions(&message.card, message.id)?;
        message.attachments = self.get_attachments(&message.card, message.id)?;
        message.thread = self.get_message_thread(&message.card, message.id)?;

        let patches = self.get_state_patches(&message.card, message.id)?;
        if !patches.is_empty() {
            *message = fold(message.clone(), &patches);
        }
        Ok(())
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let card: String = row.get(0)?;
    let id: i64 = row.get(1)?;
    let message_type: String = row.get(2)?;
    let content: String = row.get(3)?;
    let creator: String = row.get(4)?;
    let created: String = row.get(5)?;
    let extra: Option<String> = row.get(6)?;

    Ok(Message {
        id: sql::message_id(1, id)?,
        card: CardId::new(card),
        message_type: MessageType::parse(&message_type),
        content,
        creator: SocialId::new(creator),
        created: sql::parse_ts(5, &created)?,
        edited: None,
        removed: false,
        extra: extra.map(|e| sql::parse_json(6, &e)).transpose()?,
        reactions: Vec::new(),
        attachments: Vec::new(),
        thread: None,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use parley_shared::query::{Comparison, SortOrder};
    use serde_json::json;

    use super::*;

    fn new_message(card: &str, content: &str) -> NewMessage {
        NewMessage {
            card: CardId::from(card),
            message_type: MessageType::Message,
            content: content.to_string(),
            creator: SocialId::from("alice"),
            created: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            extra: None,
        }
    }

    #[test]
    fn ids_are_monotonic_per_card() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.insert_message(&new_message("C1", "a")).unwrap(), MessageId(1));
        assert_eq!(db.insert_message(&new_message("C1", "b")).unwrap(), MessageId(2));
        assert_eq!(db.insert_message(&new_message("C2", "c")).unwrap(), MessageId(1));

        // Deleting does not recycle ids.
        db.delete_messages(&CardId::from("C1"), MessageId(2), MessageId(2))
            .unwrap();
        assert_eq!(db.insert_message(&new_message("C1", "d")).unwrap(), MessageId(3));
    }

    #[test]
    fn find_filters_orders_and_limits() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..10 {
            let mut m = new_message("C1", &format!("m{i}"));
            m.created += Duration::seconds(i);
            m.extra = Some(json!({"n": i}));
            db.insert_message(&m).unwrap();
        }

        let params = FindMessagesParams {
            card: Some(CardId::from("C1")),
            id: Some(Comparison::greater(MessageId(3))),
            order: Some(SortOrder::Descending),
            limit: Some(3),
            ..Default::default()
        };
        let found = db.get_messages(&params).unwrap();
        let ids: Vec<u64> = found.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![10, 9, 8]);
        assert_eq!(found[0].extra, Some(json!({"n": 9})));

        let before = FindMessagesParams {
            card: Some(CardId::from("C1")),
            created: Some(Comparison::less(
                Utc.timestamp_opt(1_700_000_002, 0).unwrap(),
            )),
            ..Default::default()
        };
        assert_eq!(db.get_messages(&before).unwrap().len(), 2);
        assert_eq!(db.count_hot_messages(&CardId::from("C1")).unwrap(), 10);
    }

    #[test]
    fn bound_past_the_id_range_matches_nothing() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&new_message("C1", "a")).unwrap();

        let params = FindMessagesParams {
            card: Some(CardId::from("C1")),
            id: Some(Comparison::greater(MessageId(u64::MAX))),
            ..Default::default()
        };
        assert!(db.get_messages(&params).unwrap().is_empty());
    }

    #[test]
    fn last_id_survives_deletion() {
        let db = Database::open_in_memory().unwrap();
        let card = CardId::from("C1");
        assert_eq!(db.last_message_id(&card).unwrap(), None);

        db.insert_message(&new_message("C1", "a")).unwrap();
        db.insert_message(&new_message("C1", "b")).unwrap();
        db.delete_messages(&card, MessageId(1), MessageId(2)).unwrap();
        assert_eq!(db.last_message_id(&card).unwrap(), Some(MessageId(2)));
    }
}
