use parley_shared::model::{Patch, PatchData, PatchKey, PatchType};
use parley_shared::types::{CardId, MessageId, SocialId};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::sql::{self, id_value};

const PATCH_COLUMNS: &str = "card, message_id, data, creator, created";

impl Database {
    pub fn insert_patch(&self, patch: &Patch) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO patches (card, message_id, type, data, creator, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                patch.card.as_str(),
                id_value(patch.message_id),
                patch.data.patch_type().as_str(),
                serde_json::to_string(&patch.data)?,
                patch.creator.as_str(),
                sql::ts(&patch.created),
            ],
        )?;
        Ok(())
    }

    /// Delete patches of messages in `from..=to`, optionally only those
    /// stored at or before sequence `up_to`.
    pub fn delete_patches(
        &self,
        card: &CardId,
        from: MessageId,
        to: MessageId,
        up_to: Option<i64>,
    ) -> Result<usize> {
        let affected = self.conn()?.execute(
            "DELETE FROM patches
             WHERE card = ?1 AND message_id BETWEEN ?2 AND ?3 AND seq <= ?4",
            params![
                card.as_str(),
                id_value(from),
                id_value(to),
                up_to.unwrap_or(i64::MAX),
            ],
        )?;
        Ok(affected)
    }

    /// Patches of messages in `from..=to` in fold order, optionally only
    /// those stored after sequence `after`.
    pub fn get_patches(
        &self,
        card: &CardId,
        from: MessageId,
        to: MessageId,
        after: Option<i64>,
    ) -> Result<Vec<Patch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PATCH_COLUMNS} FROM patches
             WHERE card = ?1 AND message_id BETWEEN ?2 AND ?3 AND seq > ?4
             ORDER BY created ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(
            params![card.as_str(), id_value(from), id_value(to), after.unwrap_or(0)],
            row_to_patch,
        )?;

        let mut patches = Vec::new();
        for row in rows {
            patches.push(row?);
        }
        Ok(patches)
    }

    /// Update and remove patches of one message; the other kinds are
    /// materialized in their own tables while the message is hot.
    pub(crate) fn get_state_patches(&self, card: &CardId, id: MessageId) -> Result<Vec<Patch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PATCH_COLUMNS} FROM patches
             WHERE card = ?1 AND message_id = ?2 AND type IN ('update', 'remove')
             ORDER BY created ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(params![card.as_str(), id_value(id)], row_to_patch)?;

        let mut patches = Vec::new();
        for row in rows {
            patches.push(row?);
        }
        Ok(patches)
    }

    pub(crate) fn is_removed(&self, card: &CardId, id: MessageId) -> Result<bool> {
        let removed: bool = self.conn()?.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM patches WHERE card = ?1 AND message_id = ?2 AND type = ?3
             )",
            params![card.as_str(), id_value(id), PatchType::Remove.as_str()],
            |row| row.get(0),
        )?;
        Ok(removed)
    }

    pub fn has_patch(&self, card: &CardId, key: &PatchKey) -> Result<bool> {
        let exists: bool = self.conn()?.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM patches
                 WHERE card = ?1 AND message_id = ?2 AND type = ?3
                   AND creator = ?4 AND created = ?5
             )",
            params![
                card.as_str(),
                id_value(key.message_id),
                key.patch_type.as_str(),
                key.creator.as_str(),
                sql::ts(&key.created),
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn row_to_patch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Patch> {
    let card: String = row.get(0)?;
    let message_id: i64 = row.get(1)?;
    let data: String = row.get(2)?;
    let creator: String = row.get(3)?;
    let created: String = row.get(4)?;

    Ok(Patch {
        card: CardId::new(card),
        message_id: sql::message_id(1, message_id)?,
        creator: SocialId::new(creator),
        created: sql::parse_ts(4, &created)?,
        data: sql::parse_json::<PatchData>(2, &data)?,
    })
}
