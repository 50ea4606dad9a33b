use parley_shared::model::{merge_params, Attachment, AttachmentUpdate};
use parley_shared::types::{AttachmentId, CardId, MessageId, SocialId};
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::database::Database;
use crate::error::Result;
use crate::sql::{self, id_value};

impl Database {
    /// Append attachments; ids already present are left untouched.
    pub fn insert_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        attachments: &[Attachment],
    ) -> Result<()> {
        let tx = self.conn()?.unchecked_transaction()?;
        append(&tx, card, message, attachments)?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        ids: &[AttachmentId],
    ) -> Result<usize> {
        let tx = self.conn()?.unchecked_transaction()?;
        let mut affected = 0;
        for id in ids {
            affected += tx.execute(
                "DELETE FROM attachments WHERE card = ?1 AND message_id = ?2 AND id = ?3",
                params![card.as_str(), id_value(message), id.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(affected)
    }

    /// Replace the whole attachment list of a message.
    pub fn replace_attachments(
        &self,
        card: &CardId,
        message: MessageId,
        attachments: &[Attachment],
    ) -> Result<()> {
        let tx = self.conn()?.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM attachments WHERE card = ?1 AND message_id = ?2",
            params![card.as_str(), id_value(message)],
        )?;
        append(&tx, card, message, attachments)?;
        tx.commit()?;
        Ok(())
    }

    /// Shallow-merge params into existing attachments by id.
    pub fn merge_attachment_params(
        &self,
        card: &CardId,
        message: MessageId,
        updates: &[AttachmentUpdate],
    ) -> Result<usize> {
        let tx = self.conn()?.unchecked_transaction()?;
        let mut affected = 0;

        for update in updates {
            let current: Option<String> = tx
                .query_row(
                    "SELECT params FROM attachments WHERE card = ?1 AND message_id = ?2 AND id = ?3",
                    params![card.as_str(), id_value(message), update.id.as_str()],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let Some(current) = current else {
                tracing::debug!(attachment = %update.id, "update for unknown attachment ignored");
                continue;
            };

            let mut merged: Value = sql::parse_json(0, &current)?;
            merge_params(&mut merged, &update.params);
            affected += tx.execute(
                "UPDATE attachments SET params = ?4 WHERE card = ?1 AND message_id = ?2 AND id = ?3",
                params![
                    card.as_str(),
                    id_value(message),
                    update.id.as_str(),
                    serde_json::to_string(&merged)?,
                ],
            )?;
        }

        tx.commit()?;
        Ok(affected)
    }

    pub fn get_attachments(&self, card: &CardId, message: MessageId) -> Result<Vec<Attachment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, params, creator, created
             FROM attachments WHERE card = ?1 AND message_id = ?2
             ORDER BY position ASC",
        )?;

        let rows = stmt.query_map(params![card.as_str(), id_value(message)], |row| {
            let id: String = row.get(0)?;
            let mime: String = row.get(1)?;
            let params: String = row.get(2)?;
            let creator: String = row.get(3)?;
            let created: String = row.get(4)?;

            Ok(Attachment {
                id: AttachmentId::new(id),
                mime,
                params: sql::parse_json(2, &params)?,
                creator: SocialId::new(creator),
                created: sql::parse_ts(4, &created)?,
            })
        })?;

        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?);
        }
        Ok(attachments)
    }
}

fn append(
    conn: &Connection,
    card: &CardId,
    message: MessageId,
    attachments: &[Attachment],
) -> Result<()> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM attachments WHERE card = ?1 AND message_id = ?2",
        params![card.as_str(), id_value(message)],
        |row| row.get(0),
    )?;

    for (offset, attachment) in attachments.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO attachments
                 (card, message_id, id, type, params, creator, created, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                card.as_str(),
                id_value(message),
                attachment.id.as_str(),
                attachment.mime,
                serde_json::to_string(&attachment.params)?,
                attachment.creator.as_str(),
                sql::ts(&attachment.created),
                next + offset as i64,
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn attachment(id: &str) -> Attachment {
        Attachment {
            id: AttachmentId::from(id),
            mime: "image/png".into(),
            params: json!({"width": 10, "name": id}),
            creator: SocialId::from("alice"),
            created: Utc::now(),
        }
    }

    #[test]
    fn set_replaces_regardless_of_prior_state() {
        let db = Database::open_in_memory().unwrap();
        let card = CardId::from("C1");
        let m = MessageId(1);

        db.insert_attachments(&card, m, &[attachment("a"), attachment("b")])
            .unwrap();
        db.replace_attachments(&card, m, &[attachment("c")]).unwrap();

        let ids: Vec<String> = db
            .get_attachments(&card, m)
            .unwrap()
            .into_iter()
            .map(|a| a.id.to_string())
            .collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn update_merges_params_and_remove_deletes() {
        let db = Database::open_in_memory().unwrap();
        let card = CardId::from("C1");
        let m = MessageId(1);
        db.insert_attachments(&card, m, &[attachment("a"), attachment("b")])
            .unwrap();

        let updated = db
            .merge_attachment_params(
                &card,
                m,
                &[
                    AttachmentUpdate {
                        id: AttachmentId::from("a"),
                        params: json!({"width": 20}),
                    },
                    AttachmentUpdate {
                        id: AttachmentId::from("zzz"),
                        params: json!({}),
                    },
                ],
            )
            .unwrap();
        assert_eq!(updated, 1);

        let removed = db
            .delete_attachments(&card, m, &[AttachmentId::from("b")])
            .unwrap();
        assert_eq!(removed, 1);

        let left = db.get_attachments(&card, m).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].params, json!({"width": 20, "name": "a"}));
    }
}
