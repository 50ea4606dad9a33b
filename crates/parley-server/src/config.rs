//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the server starts with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_ARCHIVE_THRESHOLD, DEFAULT_BLOB_FETCH_ATTEMPTS};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Directory holding one SQLite file per workspace.
    /// Env: `DATA_DIR`
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Root of the archive blob store; each workspace gets a subdirectory.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Hot messages per card that trigger archival.
    /// Env: `ARCHIVE_THRESHOLD`
    pub archive_threshold: usize,

    /// Attempts when reading an archive blob.
    /// Env: `BLOB_FETCH_ATTEMPTS`
    /// Default: `5`
    pub blob_fetch_attempts: u32,

    /// Interval of the orphan-blob sweep; `None` disables it.
    /// Env: `ORPHAN_SWEEP_SECS` (`0` disables)
    /// Default: one hour
    pub orphan_sweep_interval: Option<Duration>,

    /// Minimum age of an unreferenced blob before the sweep removes it.
    /// Env: `ORPHAN_GRACE_SECS`
    /// Default: one hour
    pub orphan_grace: Duration,

    /// Maximum blob upload size in bytes (50 MiB).
    pub max_blob_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            data_dir: PathBuf::from("./data"),
            blob_storage_path: PathBuf::from("./blobs"),
            archive_threshold: DEFAULT_ARCHIVE_THRESHOLD,
            blob_fetch_attempts: DEFAULT_BLOB_FETCH_ATTEMPTS,
            orphan_sweep_interval: Some(Duration::from_secs(3600)),
            orphan_grace: Duration::from_secs(3600),
            max_blob_size: 50 * 1024 * 1024, // 50 MiB
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(path) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(path);
        }
        if let Some(path) = lookup("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }
        if let Some(threshold) = parse_var::<usize>(&lookup, "ARCHIVE_THRESHOLD") {
            if threshold == 0 {
                tracing::warn!("ARCHIVE_THRESHOLD must be positive, using default");
            } else {
                config.archive_threshold = threshold;
            }
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "BLOB_FETCH_ATTEMPTS") {
            config.blob_fetch_attempts = attempts.max(1);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ORPHAN_SWEEP_SECS") {
            config.orphan_sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ORPHAN_GRACE_SECS") {
            config.orphan_grace = Duration::from_secs(secs);
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.
        config
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Defaults with every directory placed under `root`.
    pub fn under(root: &std::path::Path) -> Self {
        Self {
            data_dir: root.join("data"),
            blob_storage_path: root.join("blobs"),
            ..Self::default()
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.archive_threshold, DEFAULT_ARCHIVE_THRESHOLD);
        assert_eq!(config.orphan_sweep_interval, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATA_DIR", "/var/lib/parley"),
            ("ARCHIVE_THRESHOLD", "40"),
            ("BLOB_FETCH_ATTEMPTS", "2"),
            ("ORPHAN_SWEEP_SECS", "0"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/parley"));
        assert_eq!(config.archive_threshold, 40);
        assert_eq!(config.blob_fetch_attempts, 2);
        assert_eq!(config.orphan_sweep_interval, None);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "nowhere"),
            ("ARCHIVE_THRESHOLD", "0"),
            ("ORPHAN_GRACE_SECS", "soon"),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(config.http_addr, defaults.http_addr);
        assert_eq!(config.archive_threshold, defaults.archive_threshold);
        assert_eq!(config.orphan_grace, defaults.orphan_grace);
    }
}
