//! Local JSON cache of the knowledge view.
//!
//! The cache is informational only. Everything loaded from it is marked `stale` until the
//! next successful refresh confirms it.

use super::types::{KnowledgeView, SyncStatus};
use std::path::Path;
use tracing::{debug, warn};

/// Loads a cached view, or `None` if the file is missing or unreadable.
pub async fn load(path: &Path) -> Option<KnowledgeView> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "No knowledge cache");
            return None;
        }
    };

    match serde_json::from_str::<KnowledgeView>(&contents) {
        Ok(mut view) => {
            for collection in view.collections.values_mut() {
                collection.mark(SyncStatus::Stale, None);
            }
            Some(view)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Ignoring corrupt knowledge cache");
            None
        }
    }
}

pub async fn save(path: &Path, view: &KnowledgeView) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(view)?;
    tokio::fs::write(path, json).await
}
