use parley_shared::model::Reaction;
use parley_shared::types::{CardId, MessageId, SocialId};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::sql::{self, id_value};

impl Database {
    /// Idempotent by `(message, creator, reaction)`.
    pub fn insert_reaction(&self, card: &CardId, reaction: &Reaction) -> Result<bool> {
        let affected = self.conn()?.execute(
            "INSERT OR IGNORE INTO reactions (card, message_id, reaction, creator, created)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                card.as_str(),
                id_value(reaction.message),
                reaction.reaction,
                reaction.creator.as_str(),
                sql::ts(&reaction.created),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_reaction(
        &self,
        card: &CardId,
        message: MessageId,
        creator: &SocialId,
        reaction: &str,
    ) -> Result<bool> {
        let affected = self.conn()?.execute(
            "DELETE FROM reactions
             WHERE card = ?1 AND message_id = ?2 AND creator = ?3 AND reaction = ?4",
            params![card.as_str(), id_value(message), creator.as_str(), reaction],
        )?;
        Ok(affected > 0)
    }

    pub fn get_reactions(&self, card: &CardId, message: MessageId) -> Result<Vec<Reaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, reaction, creator, created
             FROM reactions WHERE card = ?1 AND message_id = ?2
             ORDER BY created ASC",
        )?;

        let rows = stmt.query_map(params![card.as_str(), id_value(message)], |row| {
            let message_id: i64 = row.get(0)?;
            let reaction: String = row.get(1)?;
            let creator: String = row.get(2)?;
            let created: String = row.get(3)?;

            Ok(Reaction {
                message: sql::message_id(0, message_id)?,
                reaction,
                creator: SocialId::new(creator),
                created: sql::parse_ts(3, &created)?,
            })
        })?;

        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn add_twice_keeps_one() {
        let db = Database::open_in_memory().unwrap();
        let card = CardId::from("C1");
        let reaction = Reaction {
            message: MessageId(1),
            reaction: "👍".into(),
            creator: SocialId::from("bob"),
            created: Utc::now(),
        };

        assert!(db.insert_reaction(&card, &reaction).unwrap());
        assert!(!db.insert_reaction(&card, &reaction).unwrap());
        assert_eq!(db.get_reactions(&card, MessageId(1)).unwrap().len(), 1);

        assert!(db
            .delete_reaction(&card, MessageId(1), &reaction.creator, "👍")
            .unwrap());
        assert!(db.get_reactions(&card, MessageId(1)).unwrap().is_empty());
    }
}
