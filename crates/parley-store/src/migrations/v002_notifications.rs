//! v002 -- Notification contexts, notifications and collaborators.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS notification_contexts (
    id          TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    card        TEXT NOT NULL,
    account     TEXT NOT NULL,
    last_view   TEXT,
    last_update TEXT NOT NULL,
    last_notify TEXT,

    UNIQUE (card, account)
);

CREATE INDEX IF NOT EXISTS idx_contexts_account_update
    ON notification_contexts(account, last_update DESC);

CREATE TABLE IF NOT EXISTS notifications (
    id              TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    context         TEXT NOT NULL,               -- FK -> notification_contexts(id)
    card            TEXT NOT NULL,
    account         TEXT NOT NULL,
    message_id      INTEGER NOT NULL,
    message_created TEXT NOT NULL,
    created         TEXT NOT NULL,
    read            INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    archived        INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1

    FOREIGN KEY (context) REFERENCES notification_contexts(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_notifications_context
    ON notifications(context, created DESC);

CREATE TABLE IF NOT EXISTS collaborators (
    card    TEXT NOT NULL,
    account TEXT NOT NULL,
    date    TEXT NOT NULL,

    PRIMARY KEY (card, account)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
