use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Local confidence in a collection's cached contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Confirmed by the last successful remote listing.
    Clean,
    /// A local mutation is waiting for remote confirmation.
    Syncing,
    /// Loaded from the local cache, not yet confirmed this session.
    Stale,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Clean => "clean",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Stale => "stale",
            SyncStatus::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Indexed,
    Failed,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Indexed => "indexed",
            UploadStatus::Failed => "failed",
        })
    }
}

/// A knowledge base as the client currently believes it to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub display_name: String,
    pub member_file_ids: BTreeSet<String>,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Collection {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            member_file_ids: BTreeSet::new(),
            sync_status: SyncStatus::Syncing,
            error: None,
        }
    }

    pub(crate) fn mark(&mut self, status: SyncStatus, error: Option<String>) {
        self.sync_status = status;
        self.error = error;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    pub id: String,
    /// Name as the user chose it, never the transport encoding.
    pub original_name: String,
    pub upload_status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of every known collection and file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeView {
    pub collections: BTreeMap<String, Collection>,
    pub files: BTreeMap<String, FileReference>,
}

impl KnowledgeView {
    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.collections.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.collections.contains_key(id)
    }

    /// Member files of `collection_id`, in id order.
    pub fn members<'a>(&'a self, collection_id: &str) -> impl Iterator<Item = &'a FileReference> {
        self.collections
            .get(collection_id)
            .into_iter()
            .flat_map(|c| c.member_file_ids.iter())
            .filter_map(|id| self.files.get(id))
    }

    pub fn is_member_anywhere(&self, file_id: &str) -> bool {
        self.collections
            .values()
            .any(|c| c.member_file_ids.contains(file_id))
    }

    /// Drops file references nobody points at. Failed and pending entries are kept so the
    /// user can see what went wrong until they remove them.
    pub(crate) fn prune_orphans(&mut self) {
        let members: BTreeSet<String> = self
            .collections
            .values()
            .flat_map(|c| c.member_file_ids.iter().cloned())
            .collect();

        self.files.retain(|id, file| {
            members.contains(id)
                || matches!(
                    file.upload_status,
                    UploadStatus::Failed | UploadStatus::Pending
                )
        });
    }

    /// Finds a collection by id, or by display name when no id matches.
    pub fn resolve(&self, id_or_name: &str) -> Option<&Collection> {
        self.collections.get(id_or_name).or_else(|| {
            self.collections
                .values()
                .find(|c| c.display_name == id_or_name)
        })
    }
}

/// A file chosen for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct FileBlob {
    pub name: String,
    pub content: Vec<u8>,
}

impl FileBlob {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Reads a file from disk, naming the blob after the file's name.
    pub async fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, content })
    }
}

/// A collection as reported by the document store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCollection {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// A file as reported by the document store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub id: String,
    /// Transport-encoded name, when the store could report it.
    pub name: Option<String>,
    pub status: RemoteFileStatus,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, status: UploadStatus) -> FileReference {
        FileReference {
            id: id.into(),
            original_name: format!("{id}.pdf"),
            upload_status: status,
            error: None,
        }
    }

    #[test]
    fn test_prune_keeps_members_and_failures() {
        let mut view = KnowledgeView::default();
        let mut collection = Collection::new("vs_1", "Reports");
        collection.member_file_ids.insert("f1".into());
        view.collections.insert("vs_1".into(), collection);
        view.files.insert("f1".into(), file("f1", UploadStatus::Indexed));
        view.files.insert("f2".into(), file("f2", UploadStatus::Indexed));
        view.files.insert("f3".into(), file("f3", UploadStatus::Failed));

        view.prune_orphans();

        assert!(view.files.contains_key("f1"));
        assert!(!view.files.contains_key("f2"));
        assert!(view.files.contains_key("f3"));
        assert_eq!(view.members("vs_1").count(), 1);
    }

    #[test]
    fn test_resolve_by_name() {
        let mut view = KnowledgeView::default();
        view.collections
            .insert("vs_1".into(), Collection::new("vs_1", "2026 Analysis"));
        assert_eq!(view.resolve("2026 Analysis").map(|c| c.id.as_str()), Some("vs_1"));
        assert_eq!(view.resolve("vs_1").map(|c| c.id.as_str()), Some("vs_1"));
        assert!(view.resolve("missing").is_none());
    }
}
