//! Removal of archive blobs that no group row points at.
//!
//! The archiver writes a blob before inserting its group and a removed
//! card leaves its blobs behind, so both crashes and deletions can leave
//! unreferenced files. Only blobs older than the grace period are
//! removed; a younger one may belong to an archival still in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parley_shared::types::BlobId;
use parley_store::BlobStorage;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::workspaces::{Workspace, Workspaces};

/// Delete the workspace's unreferenced blobs older than `grace`. Returns
/// how many were removed.
pub async fn sweep_orphans(ws: &Workspace, grace: Duration) -> Result<usize, ServerError> {
    let referenced: HashSet<BlobId> = ws
        .store
        .lock()
        .await
        .referenced_blobs()?
        .into_iter()
        .collect();

    let now = SystemTime::now();
    let mut removed = 0;
    for (id, modified) in ws.blobs.list().await? {
        if referenced.contains(&id) {
            continue;
        }
        let age = now.duration_since(modified).unwrap_or_default();
        if age < grace {
            debug!(workspace = %ws.name, blob = %id, "unreferenced blob within grace period");
            continue;
        }
        ws.blobs.delete(&id).await?;
        removed += 1;
    }
    Ok(removed)
}

/// Sweep every opened workspace each `every`.
pub fn spawn_sweeper(workspaces: Arc<Workspaces>, every: Duration, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;
        loop {
            interval.tick().await;
            for ws in workspaces.opened().await {
                match sweep_orphans(&ws, grace).await {
                    Ok(0) => {}
                    Ok(removed) => info!(workspace = %ws.name, removed, "Swept orphan blobs"),
                    Err(e) => warn!(workspace = %ws.name, error = %e, "Orphan sweep failed"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use parley_shared::event::{CreateMessageEvent, Event};
    use parley_shared::model::MessageType;
    use parley_shared::types::{CardId, SocialId};
    use parley_store::Session;

    use super::*;
    use crate::config::ServerConfig;

    #[tokio::test]
    async fn test_sweep_keeps_referenced_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            archive_threshold: 2,
            ..ServerConfig::under(dir.path())
        };
        let workspaces = Workspaces::new(Arc::new(config));
        let ws = workspaces.get("ws1").await.unwrap();

        let session = Session::new("alice");
        for minute in 0..3 {
            ws.router
                .event(
                    &session,
                    Event::CreateMessage(CreateMessageEvent {
                        card: CardId::from("C1"),
                        message_type: MessageType::Message,
                        content: format!("m{minute}"),
                        creator: SocialId::from("alice"),
                        created: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
                        extra: None,
                    }),
                )
                .await
                .unwrap();
        }
        assert_eq!(ws.blobs.list().await.unwrap().len(), 1);

        ws.blobs.put(&BlobId::from("stray"), b"card: C9\n").await.unwrap();

        // Fresh orphans survive a sweep with a grace period.
        let removed = sweep_orphans(&ws, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);

        let removed = sweep_orphans(&ws, Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        let left = ws.blobs.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_ne!(left[0].0, BlobId::from("stray"));
    }
}
