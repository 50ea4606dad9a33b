//! v001 -- Hot message store.
//!
//! Messages, the append-only patch log, the reaction/attachment/thread
//! projections of hot messages, archive group metadata and the per-card
//! id sequence. Timestamps are RFC 3339 with nanoseconds and a `Z` suffix,
//! so text order equals time order.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Per-card message id sequence
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sequences (
    card    TEXT PRIMARY KEY NOT NULL,
    last_id INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Messages (base create event only; state changes live in patches)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    card    TEXT NOT NULL,
    id      INTEGER NOT NULL,
    type    TEXT NOT NULL,
    content TEXT NOT NULL,
    creator TEXT NOT NULL,
    created TEXT NOT NULL,
    extra   TEXT,                                -- JSON

    PRIMARY KEY (card, id)
);

CREATE INDEX IF NOT EXISTS idx_messages_card_created ON messages(card, created);

-- ----------------------------------------------------------------
-- Patches (append-only; seq preserves arrival order)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS patches (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    card       TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    type       TEXT NOT NULL,
    data       TEXT NOT NULL,                    -- JSON
    creator    TEXT NOT NULL,
    created    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_patches_message ON patches(card, message_id, created);

-- ----------------------------------------------------------------
-- Projections of hot messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    card       TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    reaction   TEXT NOT NULL,
    creator    TEXT NOT NULL,
    created    TEXT NOT NULL,

    PRIMARY KEY (card, message_id, creator, reaction)
);

CREATE TABLE IF NOT EXISTS attachments (
    card       TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    id         TEXT NOT NULL,
    type       TEXT NOT NULL,
    params     TEXT NOT NULL,                    -- JSON
    creator    TEXT NOT NULL,
    created    TEXT NOT NULL,
    position   INTEGER NOT NULL,

    PRIMARY KEY (card, message_id, id)
);

CREATE TABLE IF NOT EXISTS threads (
    card          TEXT NOT NULL,
    message_id    INTEGER NOT NULL,
    thread_id     TEXT NOT NULL,
    thread_type   TEXT NOT NULL,
    replies_count INTEGER NOT NULL DEFAULT 0,
    last_reply    TEXT,

    PRIMARY KEY (card, message_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_thread_id ON threads(thread_id);

-- ----------------------------------------------------------------
-- Archived groups. patch_seq is the last patch folded into the blob.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages_groups (
    card      TEXT NOT NULL,
    blob_id   TEXT NOT NULL,
    from_id   INTEGER NOT NULL,
    to_id     INTEGER NOT NULL,
    from_date TEXT NOT NULL,
    to_date   TEXT NOT NULL,
    count     INTEGER NOT NULL,
    patch_seq INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (card, blob_id)
);

CREATE INDEX IF NOT EXISTS idx_groups_card_from ON messages_groups(card, from_date);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
