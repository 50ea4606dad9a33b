//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. It is opened from a
//! connection string: a plain path, `:memory:`, or a `file:` URI.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, StoreError};
use crate::migrations;

/// VFS names understood by native SQLite builds.
const NATIVE_VFS: &[&str] = &["unix", "unix-dotfile", "unix-excl", "unix-none", "win32", "memdb"];

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Option<Connection>,
}

impl Database {
    /// Open a database from a connection string.
    ///
    /// `file:` URIs may carry query parameters; an unknown `vfs` (for
    /// example the browser-only `opfs`) is dropped with a warning and the
    /// default VFS is used instead.
    pub fn open(connection: &str) -> Result<Self> {
        match connection.trim() {
            "" | ":memory:" => Self::open_in_memory(),
            uri if uri.starts_with("file:") => {
                let uri = normalize_uri(uri);
                tracing::info!(uri = %uri, "opening database");
                let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX;
                Self::init(Connection::open_with_flags(&uri, flags)?)
            }
            path => Self::open_at(Path::new(path)),
        }
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!(path = %path.display(), "opening database");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL is ignored by in-memory databases; the pragma still succeeds.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn: Some(conn) })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .as_ref()
            .and_then(|c| c.path())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Checkpoint the WAL and release the connection. Idempotent.
    pub fn close_connection(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if let Err(err) = conn.execute_batch("PRAGMA optimize;") {
            tracing::debug!(error = %err, "optimize before close failed");
        }
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }
}

/// Drop query parameters native SQLite cannot honour.
fn normalize_uri(uri: &str) -> String {
    let Some((base, query)) = uri.split_once('?') else {
        return uri.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| match pair.split_once('=') {
            Some(("vfs", name)) if !NATIVE_VFS.contains(&name) => {
                tracing::warn!(vfs = name, "unsupported sqlite vfs, using the default");
                false
            }
            _ => true,
        })
        .collect();

    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.sqlite3");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        assert!(path.exists());
    }

    #[test]
    fn unknown_vfs_is_dropped() {
        assert_eq!(normalize_uri("file:a.sqlite3?vfs=opfs"), "file:a.sqlite3");
        assert_eq!(
            normalize_uri("file:a.sqlite3?vfs=opfs&mode=rwc"),
            "file:a.sqlite3?mode=rwc"
        );
        assert_eq!(
            normalize_uri("file:a.sqlite3?vfs=unix-dotfile"),
            "file:a.sqlite3?vfs=unix-dotfile"
        );
    }

    #[test]
    fn opens_browser_style_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.sqlite3");
        let uri = format!("file:{}?vfs=opfs", path.display());

        let db = Database::open(&uri).expect("should open");
        assert!(!db.is_closed());
        assert!(path.exists());
    }

    #[test]
    fn close_is_idempotent() {
        let mut db = Database::open(":memory:").unwrap();
        db.close_connection().unwrap();
        db.close_connection().unwrap();
        assert!(matches!(db.conn(), Err(StoreError::Closed)));
    }
}
