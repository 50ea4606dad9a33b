use chrono::{DateTime, Utc};
use parley_shared::model::{RepliesCountOp, Thread};
use parley_shared::types::{CardId, MessageId, ThreadId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::sql::{self, id_value};

const THREAD_COLUMNS: &str = "card, message_id, thread_id, thread_type, replies_count, last_reply";

impl Database {
    /// Attach a thread to a message. Re-attaching the same thread keeps its
    /// counters; attaching a different one replaces it.
    pub fn upsert_thread(&self, thread: &Thread) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO threads (card, message_id, thread_id, thread_type, replies_count, last_reply)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(card, message_id) DO UPDATE SET
                 thread_id = excluded.thread_id,
                 thread_type = excluded.thread_type,
                 replies_count = CASE WHEN threads.thread_id = excluded.thread_id
                                      THEN threads.replies_count ELSE excluded.replies_count END,
                 last_reply = CASE WHEN threads.thread_id = excluded.thread_id
                                   THEN threads.last_reply ELSE excluded.last_reply END",
            params![
                thread.card.as_str(),
                id_value(thread.message),
                thread.thread_id.as_str(),
                thread.thread_type,
                thread.replies_count,
                thread.last_reply.as_ref().map(sql::ts),
            ],
        )?;
        Ok(())
    }

    pub fn bump_thread(
        &self,
        card: &CardId,
        message: MessageId,
        op: Option<RepliesCountOp>,
        last_reply: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let Some(mut thread) = self.get_message_thread(card, message)? else {
            return Ok(false);
        };
        thread.apply_update(op, last_reply);

        let affected = self.conn()?.execute(
            "UPDATE threads SET replies_count = ?3, last_reply = ?4
             WHERE card = ?1 AND message_id = ?2",
            params![
                card.as_str(),
                id_value(message),
                thread.replies_count,
                thread.last_reply.as_ref().map(sql::ts),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>> {
        let thread = self
            .conn()?
            .query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE thread_id = ?1"),
                params![thread_id.as_str()],
                row_to_thread,
            )
            .optional()?;
        Ok(thread)
    }

    pub fn get_message_thread(&self, card: &CardId, message: MessageId) -> Result<Option<Thread>> {
        let thread = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM threads WHERE card = ?1 AND message_id = ?2"
                ),
                params![card.as_str(), id_value(message)],
                row_to_thread,
            )
            .optional()?;
        Ok(thread)
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let card: String = row.get(0)?;
    let message_id: i64 = row.get(1)?;
    let thread_id: String = row.get(2)?;
    let thread_type: String = row.get(3)?;
    let replies_count: u32 = row.get(4)?;
    let last_reply: Option<String> = row.get(5)?;

    Ok(Thread {
        card: CardId::new(card),
        message: sql::message_id(1, message_id)?,
        thread_id: ThreadId::new(thread_id),
        thread_type,
        replies_count,
        last_reply: sql::parse_opt_ts(5, last_reply)?,
    })
}
