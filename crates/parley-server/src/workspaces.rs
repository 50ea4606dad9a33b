//! Per-workspace stores, opened on first use.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parley_shared::query::FindMessagesGroupsParams;
use parley_shared::retry::RetryOptions;
use parley_shared::types::CardId;
use parley_store::{
    shared, ArchivalPolicy, Archiver, Database, Finder, FsBlobStorage, Router, SessionRegistry,
    SharedStore,
};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;

/// Everything serving one workspace: its database, blob directory, event
/// router and finder.
pub struct Workspace {
    pub name: String,
    pub store: SharedStore,
    pub blobs: Arc<FsBlobStorage>,
    pub router: Router,
    pub finder: Finder,
}

pub struct Workspaces {
    config: Arc<ServerConfig>,
    open: Mutex<HashMap<String, Arc<Workspace>>>,
}

impl Workspaces {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// The named workspace, opening `<data_dir>/<name>.sqlite3` on first use.
    pub async fn get(&self, name: &str) -> Result<Arc<Workspace>, ServerError> {
        validate_workspace(name)?;

        let mut open = self.open.lock().await;
        if let Some(ws) = open.get(name) {
            return Ok(ws.clone());
        }
        let ws = Arc::new(self.open_workspace(name).await?);
        open.insert(name.to_string(), ws.clone());
        Ok(ws)
    }

    /// Workspaces opened so far.
    pub async fn opened(&self) -> Vec<Arc<Workspace>> {
        self.open.lock().await.values().cloned().collect()
    }

    async fn open_workspace(&self, name: &str) -> Result<Workspace, ServerError> {
        let db_path = self.config.data_dir.join(format!("{name}.sqlite3"));
        let db = tokio::task::spawn_blocking({
            let db_path = db_path.clone();
            move || Database::open_at(&db_path)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("open workspace {name}: {e}")))??;
        let store = shared(db);

        let blobs =
            Arc::new(FsBlobStorage::new(self.config.blob_storage_path.join(name)).await?);
        let repaired = reconcile_all(&store).await?;

        let policy = ArchivalPolicy {
            threshold: self.config.archive_threshold,
        };
        let archiver = Archiver::new(blobs.clone(), policy);
        let router = Router::new(store.clone(), archiver, Arc::new(SessionRegistry::new()));
        let finder = Finder::new(store.clone(), blobs.clone())
            .with_retry(RetryOptions::with_attempts(self.config.blob_fetch_attempts));

        info!(
            workspace = name,
            path = %db_path.display(),
            repaired,
            "Workspace opened"
        );
        Ok(Workspace {
            name: name.to_string(),
            store,
            blobs,
            router,
            finder,
        })
    }
}

/// Drop hot rows left behind by an archival that was interrupted between
/// inserting its group and pruning the range.
async fn reconcile_all(store: &SharedStore) -> Result<usize, ServerError> {
    let guard = store.lock().await;
    let cards: BTreeSet<CardId> = guard
        .find_messages_groups(&FindMessagesGroupsParams::default())?
        .into_iter()
        .map(|g| g.card)
        .collect();

    let mut pruned = 0;
    for card in &cards {
        pruned += Archiver::reconcile(&*guard, card)?;
    }
    Ok(pruned)
}

/// Workspace names become file names: ASCII letters, digits, `-` and `_`.
pub fn validate_workspace(name: &str) -> Result<(), ServerError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(ServerError::BadRequest(format!("invalid workspace {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_names() {
        assert!(validate_workspace("team-1_dev").is_ok());
        assert!(validate_workspace("").is_err());
        assert!(validate_workspace("../etc").is_err());
        assert!(validate_workspace("a b").is_err());
    }

    #[tokio::test]
    async fn test_workspace_is_opened_once() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = Workspaces::new(Arc::new(ServerConfig::under(dir.path())));

        let first = workspaces.get("ws1").await.unwrap();
        let again = workspaces.get("ws1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(dir.path().join("data/ws1.sqlite3").exists());
        assert!(dir.path().join("blobs/ws1").is_dir());

        workspaces.get("ws2").await.unwrap();
        assert_eq!(workspaces.opened().await.len(), 2);
    }
}
