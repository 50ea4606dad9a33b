/// Application name
pub const APP_NAME: &str = "Parley";

/// Hot message count above which a card's oldest range is archived.
pub const DEFAULT_ARCHIVE_THRESHOLD: usize = 150;

/// Attempts made to fetch an archive blob before giving up.
pub const DEFAULT_BLOB_FETCH_ATTEMPTS: u32 = 5;

/// Attempts made by remote find/event calls.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// First retry delay; doubles on every attempt.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

/// Maximum message body length in bytes
pub const MAX_CONTENT_LENGTH: usize = 256 * 1024;

/// Attachment type given to migrated link previews.
pub const LINK_PREVIEW_TYPE: &str = "application/link-preview";

/// Content type of archive blobs.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/yaml";

/// Request header naming the calling account.
pub const ACCOUNT_HEADER: &str = "x-account";

/// Request header carrying the broadcast session announced by the server.
pub const SESSION_HEADER: &str = "x-session-id";
