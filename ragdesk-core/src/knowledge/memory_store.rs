//! In-process [`DocumentStore`].
//!
//! Behaves like a remote store without the network: files start out `in_progress` and
//! complete after a configurable number of listings, failures can be injected per
//! operation, and every call is counted.

use super::store::{DocumentStore, Result};
use super::types::{RemoteCollection, RemoteFile, RemoteFileStatus};
use crate::error::{FailureKind, RemoteError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Operations that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListCollections,
    GetCollection,
    CreateCollection,
    RenameCollection,
    DeleteCollection,
    UploadFile,
    AttachFile,
    DetachFile,
    DeleteFile,
    ListCollectionFiles,
}

#[derive(Debug)]
struct StoredFile {
    name: String,
    /// Listings left before indexing completes.
    pending_listings: u32,
    fail_indexing: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    collections: BTreeMap<String, (Option<String>, BTreeSet<String>)>,
    files: BTreeMap<String, StoredFile>,
    faults: HashMap<StoreOp, VecDeque<RemoteError>>,
    calls: HashMap<StoreOp, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    indexing_listings: u32,
    ascii_names_only: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files report `in_progress` for this many member listings before completing.
    pub fn with_indexing_delay(mut self, listings: u32) -> Self {
        self.indexing_listings = listings;
        self
    }

    /// Reject uploads whose name is not plain ASCII, like stores that cannot carry
    /// UTF-8 file names.
    pub fn ascii_names_only(mut self) -> Self {
        self.ascii_names_only = true;
        self
    }

    /// Queues `error` as the result of the next call to `op`.
    pub async fn fail_next(&self, op: StoreOp, error: RemoteError) {
        let mut inner = self.inner.write().await;
        inner.faults.entry(op).or_default().push_back(error);
    }

    /// Makes indexing of `file_id` fail with `reason` once its delay has elapsed.
    pub async fn fail_indexing(&self, file_id: &str, reason: impl Into<String>) {
        let mut inner = self.inner.write().await;
        if let Some(file) = inner.files.get_mut(file_id) {
            file.fail_indexing = Some(reason.into());
        }
    }

    pub async fn calls(&self, op: StoreOp) -> usize {
        self.inner.read().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Creates a collection directly, bypassing fault injection. Used to seed state.
    pub async fn insert_collection(&self, name: &str) -> String {
        let mut inner = self.inner.write().await;
        let id = inner.next_id("vs");
        inner
            .collections
            .insert(id.clone(), (Some(name.to_string()), BTreeSet::new()));
        id
    }

    /// Removes a collection behind the client's back.
    pub async fn remove_collection_externally(&self, id: &str) {
        self.inner.write().await.collections.remove(id);
    }

    /// Wire names of all stored file entities.
    pub async fn stored_file_names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.files.values().map(|f| f.name.clone()).collect()
    }

    async fn enter(&self, op: StoreOp) -> Result<tokio::sync::RwLockWriteGuard<'_, Inner>> {
        let mut inner = self.inner.write().await;
        *inner.calls.entry(op).or_default() += 1;
        if let Some(err) = inner.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(inner)
    }
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    fn collection(&self, id: &str) -> Result<RemoteCollection> {
        self.collections
            .get(id)
            .map(|(name, _)| RemoteCollection {
                id: id.to_string(),
                name: name.clone(),
            })
            .ok_or_else(|| not_found("vector store", id))
    }
}

fn not_found(what: &str, id: &str) -> RemoteError {
    RemoteError::new(FailureKind::NotFound, format!("No {what} found with id '{id}'"))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_collections(&self, limit: usize) -> Result<Vec<RemoteCollection>> {
        let inner = self.enter(StoreOp::ListCollections).await?;
        Ok(inner
            .collections
            .iter()
            .rev()
            .take(limit)
            .map(|(id, (name, _))| RemoteCollection {
                id: id.clone(),
                name: name.clone(),
            })
            .collect())
    }

    async fn get_collection(&self, id: &str) -> Result<RemoteCollection> {
        let inner = self.enter(StoreOp::GetCollection).await?;
        inner.collection(id)
    }

    async fn create_collection(&self, name: &str) -> Result<RemoteCollection> {
        let mut inner = self.enter(StoreOp::CreateCollection).await?;
        let id = inner.next_id("vs");
        inner
            .collections
            .insert(id.clone(), (Some(name.to_string()), BTreeSet::new()));
        inner.collection(&id)
    }

    async fn rename_collection(&self, id: &str, name: &str) -> Result<RemoteCollection> {
        let mut inner = self.enter(StoreOp::RenameCollection).await?;
        let (current, _) = inner
            .collections
            .get_mut(id)
            .ok_or_else(|| not_found("vector store", id))?;
        *current = Some(name.to_string());
        inner.collection(id)
    }

    async fn delete_collection(&self, id: &str) -> Result<()> {
        let mut inner = self.enter(StoreOp::DeleteCollection).await?;
        inner
            .collections
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("vector store", id))
    }

    async fn upload_file(&self, name: &str, _content: Vec<u8>) -> Result<RemoteFile> {
        let mut inner = self.enter(StoreOp::UploadFile).await?;
        if self.ascii_names_only && !name.is_ascii() {
            return Err(RemoteError::new(
                FailureKind::InvalidRequest,
                format!("file name '{name}' is not ASCII"),
            ));
        }

        let id = inner.next_id("file");
        inner.files.insert(
            id.clone(),
            StoredFile {
                name: name.to_string(),
                pending_listings: self.indexing_listings,
                fail_indexing: None,
            },
        );

        Ok(RemoteFile {
            id,
            name: Some(name.to_string()),
            status: RemoteFileStatus::InProgress,
            last_error: None,
        })
    }

    async fn attach_file(&self, collection_id: &str, file_id: &str) -> Result<()> {
        let mut inner = self.enter(StoreOp::AttachFile).await?;
        if !inner.files.contains_key(file_id) {
            return Err(not_found("file", file_id));
        }
        let (_, members) = inner
            .collections
            .get_mut(collection_id)
            .ok_or_else(|| not_found("vector store", collection_id))?;
        members.insert(file_id.to_string());
        Ok(())
    }

    async fn detach_file(&self, collection_id: &str, file_id: &str) -> Result<()> {
        let mut inner = self.enter(StoreOp::DetachFile).await?;
        let (_, members) = inner
            .collections
            .get_mut(collection_id)
            .ok_or_else(|| not_found("vector store", collection_id))?;
        if members.remove(file_id) {
            Ok(())
        } else {
            Err(not_found("file", file_id))
        }
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let mut inner = self.enter(StoreOp::DeleteFile).await?;
        inner
            .files
            .remove(file_id)
            .ok_or_else(|| not_found("file", file_id))?;
        for (_, members) in inner.collections.values_mut() {
            members.remove(file_id);
        }
        Ok(())
    }

    async fn list_collection_files(&self, collection_id: &str) -> Result<Vec<RemoteFile>> {
        let mut inner = self.enter(StoreOp::ListCollectionFiles).await?;
        let members = inner
            .collections
            .get(collection_id)
            .map(|(_, members)| members.clone())
            .ok_or_else(|| not_found("vector store", collection_id))?;

        let mut listed = Vec::with_capacity(members.len());
        for id in members {
            let Some(file) = inner.files.get_mut(&id) else {
                continue;
            };

            let (status, last_error) = if file.pending_listings > 0 {
                file.pending_listings -= 1;
                (RemoteFileStatus::InProgress, None)
            } else if let Some(reason) = &file.fail_indexing {
                (RemoteFileStatus::Failed, Some(reason.clone()))
            } else {
                (RemoteFileStatus::Completed, None)
            };

            listed.push(RemoteFile {
                id,
                name: Some(file.name.clone()),
                status,
                last_error,
            });
        }

        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_indexing_completes_after_delay() {
        let store = MemoryStore::new().with_indexing_delay(1);
        let collection = store.create_collection("docs").await.unwrap();
        let file = store.upload_file("a.txt", b"hello".to_vec()).await.unwrap();
        store.attach_file(&collection.id, &file.id).await.unwrap();

        let first = store.list_collection_files(&collection.id).await.unwrap();
        assert_eq!(first[0].status, RemoteFileStatus::InProgress);
        let second = store.list_collection_files(&collection.id).await.unwrap();
        assert_eq!(second[0].status, RemoteFileStatus::Completed);
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed_once() {
        let store = MemoryStore::new();
        store
            .fail_next(
                StoreOp::CreateCollection,
                RemoteError::new(FailureKind::ServerBusy, "503"),
            )
            .await;

        assert!(store.create_collection("a").await.is_err());
        assert!(store.create_collection("a").await.is_ok());
        assert_eq!(store.calls(StoreOp::CreateCollection).await, 2);
    }

    #[tokio::test]
    async fn test_ascii_only_rejects_utf8_names() {
        let store = MemoryStore::new().ascii_names_only();
        let err = store.upload_file("報告書.pdf", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_delete_file_detaches_everywhere() {
        let store = MemoryStore::new();
        let a = store.create_collection("a").await.unwrap();
        let file = store.upload_file("x", Vec::new()).await.unwrap();
        store.attach_file(&a.id, &file.id).await.unwrap();

        store.delete_file(&file.id).await.unwrap();
        assert!(store.list_collection_files(&a.id).await.unwrap().is_empty());
    }
}
