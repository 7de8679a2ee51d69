//! Knowledge-base synchronization.
//!
//! This module keeps a local view of the remote document collections used for file search
//! and reconciles it with the document store.
//!
//! # Overview
//!
//! The remote store is the source of truth. The local [`KnowledgeView`] is a cache that is
//! only trusted right after a successful listing. Every mutation follows the same shape:
//!
//! 1. **Optimistic**: the affected collection is marked `syncing` and published.
//! 2. **Remote**: the mutation runs through the retry policy.
//! 3. **Confirm**: on success the collection is re-listed, so membership comes from the
//!    store rather than from whatever the mutation echoed back.
//! 4. **Settle**: on failure the view rolls back to the snapshot taken in step 1 and the
//!    collection is marked `error` with the reason. A `NotFound` or `Conflict` answer means
//!    the local view has diverged, so a full refresh is forced instead.
//!
//! # Components
//!
//! - [`DocumentStore`]: the remote contract
//! - [`OpenAiDocumentStore`]: vector stores over HTTP
//! - [`MemoryStore`]: in-process store for offline runs and tests
//! - [`NameEncoding`]: transport encoding for upload file names
//! - [`cache`]: the local JSON cache loaded at startup
//!
//! # Concurrency
//!
//! A [`Synchronizer`] is driven by one operation at a time; the dispatcher guarantees that
//! by running all knowledge operations on a single channel. Progress leaves the
//! synchronizer only as [`SyncEvent`]s.

pub mod cache;
mod memory_store;
mod naming;
mod openai_store;
mod store;
mod types;

pub use memory_store::{MemoryStore, StoreOp};
pub use naming::NameEncoding;
pub use openai_store::OpenAiDocumentStore;
pub use store::DocumentStore;
pub use types::{
    Collection, FileBlob, FileReference, KnowledgeView, RemoteCollection, RemoteFile,
    RemoteFileStatus, SyncStatus, UploadStatus,
};

use crate::config::KnowledgeConfig;
use crate::error::{FailureKind, RemoteError};
use crate::resilience::{RetryError, RetryEvent, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { last: RemoteError, attempts: u32 },

    #[error("{0}")]
    Fatal(RemoteError),

    #[error("remote knowledge base diverged: {0}")]
    Conflict(String),

    #[error("Unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("Unknown file '{0}'")]
    UnknownFile(String),

    #[error("Collection name must not be empty")]
    EmptyName,

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<RetryError<RemoteError>> for SyncError {
    fn from(err: RetryError<RemoteError>) -> Self {
        match err {
            RetryError::Fatal { error, .. } => SyncError::Fatal(error),
            RetryError::Exhausted { last, attempts } => SyncError::Exhausted { last, attempts },
            RetryError::Cancelled { .. } => SyncError::Cancelled,
        }
    }
}

impl SyncError {
    /// The store answered in a way that means the local view is out of date.
    fn is_divergence(&self) -> bool {
        matches!(
            self,
            SyncError::Fatal(err) if matches!(err.kind, FailureKind::NotFound | FailureKind::Conflict)
        ) || matches!(self, SyncError::Conflict(_))
    }

    fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Fatal(err) if err.kind == FailureKind::NotFound)
    }
}

/// Progress reported while an operation runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Changed(KnowledgeView),
    Retrying(RetryEvent),
}

/// Cancellation and progress plumbing for one operation.
#[derive(Clone, Copy)]
pub struct SyncContext<'a> {
    pub cancel: &'a CancellationToken,
    events: &'a (dyn Fn(SyncEvent) + Send + Sync),
}

impl<'a> SyncContext<'a> {
    pub fn new(cancel: &'a CancellationToken, events: &'a (dyn Fn(SyncEvent) + Send + Sync)) -> Self {
        Self { cancel, events }
    }

    fn emit(&self, event: SyncEvent) {
        (self.events)(event)
    }
}

/// Which collections a failed operation marks as `error`.
#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    Nothing,
    One(&'a str),
    All,
}

fn tolerate_missing(result: store::Result<()>) -> store::Result<()> {
    match result {
        Err(err) if err.kind == FailureKind::NotFound => Ok(()),
        other => other,
    }
}

/// Owns the local knowledge view and keeps it consistent with a [`DocumentStore`].
pub struct Synchronizer {
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    config: KnowledgeConfig,
    view: KnowledgeView,
    next_local: u64,
    /// Set once the running operation changed remote state.
    mutated: bool,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn DocumentStore>, retry: RetryPolicy, config: KnowledgeConfig) -> Self {
        Self {
            store,
            retry,
            config,
            view: KnowledgeView::default(),
            next_local: 0,
            mutated: false,
        }
    }

    pub fn with_view(mut self, view: KnowledgeView) -> Self {
        self.view = view;
        self
    }

    pub fn view(&self) -> &KnowledgeView {
        &self.view
    }

    /// Replaces the view with the cached one, if a cache is configured and readable.
    pub async fn load_cache(&mut self) -> bool {
        let Some(path) = self.config.cache_path.clone() else {
            return false;
        };
        match cache::load(&path).await {
            Some(view) => {
                info!(
                    collections = view.collections.len(),
                    "Loaded knowledge cache"
                );
                self.view = view;
                true
            }
            None => false,
        }
    }

    pub async fn save_cache(&self) {
        if let Some(path) = &self.config.cache_path {
            if let Err(err) = cache::save(path, &self.view).await {
                warn!(path = %path.display(), error = %err, "Failed to write knowledge cache");
            }
        }
    }

    // Operations

    /// Re-lists one collection, or every collection when `target` is `None`.
    pub async fn refresh(&mut self, target: Option<&str>, ctx: SyncContext<'_>) -> Result<()> {
        info!(target = ?target, "Refreshing knowledge base");
        let snapshot = self.view.clone();
        let scope = match target {
            Some(id) => Scope::One(id),
            None => Scope::All,
        };

        self.mark_syncing(scope);
        self.publish(ctx);

        let result = self.reload(target, ctx).await;
        self.settle(result, snapshot, scope, ctx).await
    }

    pub async fn create(&mut self, name: &str, ctx: SyncContext<'_>) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::EmptyName);
        }

        info!(name, "Creating collection");
        let snapshot = self.view.clone();
        let placeholder = self.local_id();
        self.view
            .collections
            .insert(placeholder.clone(), Collection::new(&placeholder, name));
        self.publish(ctx);

        let result = self.create_remote(&placeholder, name, ctx).await;
        self.settle(result, snapshot, Scope::Nothing, ctx).await
    }

    pub async fn rename(&mut self, id: &str, new_name: &str, ctx: SyncContext<'_>) -> Result<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(SyncError::EmptyName);
        }
        self.require(id)?;

        info!(id, new_name, "Renaming collection");
        let snapshot = self.view.clone();
        if let Some(collection) = self.view.collections.get_mut(id) {
            collection.display_name = new_name.to_string();
        }
        self.mark_syncing(Scope::One(id));
        self.publish(ctx);

        let result = self.rename_remote(id, new_name, ctx).await;
        self.settle(result, snapshot, Scope::One(id), ctx).await
    }

    pub async fn delete(&mut self, id: &str, ctx: SyncContext<'_>) -> Result<()> {
        self.require(id)?;

        info!(id, cascade = self.config.cascade_file_delete, "Deleting collection");
        let snapshot = self.view.clone();
        self.mark_syncing(Scope::One(id));
        self.publish(ctx);

        let result = self.delete_remote(id, ctx).await;
        self.settle(result, snapshot, Scope::One(id), ctx).await
    }

    /// Uploads `blob`, attaches it to `collection_id`, then polls until indexing settles.
    ///
    /// Returns the remote file id. A file whose indexing fails remotely is still a
    /// completed upload; its reference carries the failure.
    pub async fn upload(
        &mut self,
        collection_id: &str,
        blob: FileBlob,
        ctx: SyncContext<'_>,
    ) -> Result<String> {
        self.require(collection_id)?;

        info!(collection_id, name = %blob.name, bytes = blob.content.len(), "Uploading file");
        let mut snapshot = self.view.clone();
        let local = self.local_id();
        self.view.files.insert(
            local.clone(),
            FileReference {
                id: local.clone(),
                original_name: blob.name.clone(),
                upload_status: UploadStatus::Pending,
                error: None,
            },
        );
        self.mark_syncing(Scope::One(collection_id));
        self.publish(ctx);

        let result = self.upload_remote(collection_id, &local, &blob, ctx).await;
        if let Err(err) = &result {
            // Once attached, the file is real even if its confirmation failed.
            if *err != SyncError::Cancelled && !self.mutated {
                snapshot.files.insert(
                    local.clone(),
                    FileReference {
                        id: local,
                        original_name: blob.name.clone(),
                        upload_status: UploadStatus::Failed,
                        error: Some(err.to_string()),
                    },
                );
            }
        }

        let file_id = self.settle(result, snapshot, Scope::One(collection_id), ctx).await?;
        self.await_indexing(collection_id, &file_id, ctx).await?;
        Ok(file_id)
    }

    /// Detaches and deletes a file. Local failure records are simply dropped.
    pub async fn remove_file(
        &mut self,
        collection_id: &str,
        file_id: &str,
        ctx: SyncContext<'_>,
    ) -> Result<()> {
        self.require(collection_id)?;
        let file = self
            .view
            .files
            .get(file_id)
            .ok_or_else(|| SyncError::UnknownFile(file_id.to_string()))?;

        let is_member = self
            .view
            .collection(collection_id)
            .is_some_and(|c| c.member_file_ids.contains(file_id));

        if !is_member {
            if matches!(file.upload_status, UploadStatus::Failed | UploadStatus::Pending) {
                self.view.files.remove(file_id);
                self.publish(ctx);
                self.save_cache().await;
                return Ok(());
            }
            return Err(SyncError::UnknownFile(file_id.to_string()));
        }

        info!(collection_id, file_id, "Removing file");
        let snapshot = self.view.clone();
        self.mark_syncing(Scope::One(collection_id));
        self.publish(ctx);

        let result = self.remove_remote(collection_id, file_id, ctx).await;
        self.settle(result, snapshot, Scope::One(collection_id), ctx).await
    }

    // Remote halves of the operations. Each one confirms its effect with a listing.

    async fn create_remote(
        &mut self,
        placeholder: &str,
        name: &str,
        ctx: SyncContext<'_>,
    ) -> Result<String> {
        let store = Arc::clone(&self.store);
        let store = &*store;

        let remote = self
            .mutate(ctx, "create_collection", move || store.create_collection(name))
            .await?;

        self.view.collections.remove(placeholder);
        self.view
            .collections
            .insert(remote.id.clone(), Collection::new(&remote.id, name));
        self.publish(ctx);

        self.reload(Some(&remote.id), ctx).await?;
        Ok(remote.id)
    }

    async fn rename_remote(&mut self, id: &str, new_name: &str, ctx: SyncContext<'_>) -> Result<()> {
        let store = Arc::clone(&self.store);
        let store = &*store;

        self.mutate(ctx, "rename_collection", move || {
            store.rename_collection(id, new_name)
        })
        .await?;
        self.reload(Some(id), ctx).await
    }

    async fn delete_remote(&mut self, id: &str, ctx: SyncContext<'_>) -> Result<()> {
        let store = Arc::clone(&self.store);
        let store = &*store;

        if self.config.cascade_file_delete {
            let members: Vec<String> = self
                .view
                .collection(id)
                .map(|c| c.member_file_ids.iter().cloned().collect())
                .unwrap_or_default();

            for file_id in &members {
                let file_id = file_id.as_str();
                if self.is_shared(id, file_id) {
                    debug!(file_id, "File is shared, keeping it");
                    continue;
                }
                self.mutate(ctx, "delete_file", move || async move {
                    tolerate_missing(store.delete_file(file_id).await)
                })
                .await?;
            }
        }

        self.mutate(ctx, "delete_collection", move || store.delete_collection(id))
            .await?;
        self.reload(None, ctx).await
    }

    async fn upload_remote(
        &mut self,
        collection_id: &str,
        local_id: &str,
        blob: &FileBlob,
        ctx: SyncContext<'_>,
    ) -> Result<String> {
        let store = Arc::clone(&self.store);
        let store = &*store;
        let wire_name = self.config.name_encoding.encode(&blob.name);
        let wire = wire_name.as_str();
        let content = &blob.content;

        let uploaded = self
            .call(ctx, "upload_file", move || {
                store.upload_file(wire, content.clone())
            })
            .await?;
        let file_id = uploaded.id;

        self.view.files.remove(local_id);
        self.view.files.insert(
            file_id.clone(),
            FileReference {
                id: file_id.clone(),
                original_name: blob.name.clone(),
                upload_status: UploadStatus::Uploaded,
                error: None,
            },
        );
        self.publish(ctx);

        let fid = file_id.as_str();
        let attached = self
            .mutate(ctx, "attach_file", move || store.attach_file(collection_id, fid))
            .await;

        if let Err(err) = attached {
            // The entity exists remotely but belongs nowhere; remove it even if the
            // operation itself was cancelled.
            let cleanup = self
                .retry
                .run(&CancellationToken::new(), move || async move {
                    tolerate_missing(store.delete_file(fid).await)
                })
                .await;
            if let Err(cleanup) = cleanup {
                warn!(file_id = fid, error = %cleanup, "Failed to delete unattached file");
            }
            return Err(err);
        }

        self.reload(Some(collection_id), ctx).await?;
        Ok(file_id)
    }

    async fn remove_remote(
        &mut self,
        collection_id: &str,
        file_id: &str,
        ctx: SyncContext<'_>,
    ) -> Result<()> {
        let store = Arc::clone(&self.store);
        let store = &*store;

        self.mutate(ctx, "detach_file", move || async move {
            tolerate_missing(store.detach_file(collection_id, file_id).await)
        })
        .await?;

        if !self.is_shared(collection_id, file_id) {
            self.mutate(ctx, "delete_file", move || async move {
                tolerate_missing(store.delete_file(file_id).await)
            })
            .await?;
        }

        if let Some(collection) = self.view.collections.get_mut(collection_id) {
            collection.member_file_ids.remove(file_id);
        }
        self.reload(Some(collection_id), ctx).await
    }

    async fn await_indexing(
        &mut self,
        collection_id: &str,
        file_id: &str,
        ctx: SyncContext<'_>,
    ) -> Result<()> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        for poll in 1..=self.config.max_polls {
            match self.view.files.get(file_id).map(|f| f.upload_status) {
                Some(UploadStatus::Uploaded) => {}
                Some(UploadStatus::Failed) => {
                    warn!(file_id, "Remote indexing failed");
                    return Ok(());
                }
                _ => return Ok(()),
            }

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }

            debug!(file_id, poll, "Polling indexing status");
            self.refresh(Some(collection_id), ctx).await?;
        }

        debug!(file_id, "Indexing still in progress after the last poll");
        Ok(())
    }

    // Reconciliation

    /// Replaces part or all of the view with a fresh remote listing.
    async fn reload(&mut self, target: Option<&str>, ctx: SyncContext<'_>) -> Result<()> {
        match target {
            None => {
                self.view = self.fetch_all(ctx).await?;
                Ok(())
            }
            Some(id) => match self.fetch_one(id, ctx).await? {
                Some((collection, files)) => {
                    self.install(collection, files);
                    Ok(())
                }
                None => {
                    self.view.collections.remove(id);
                    self.view.prune_orphans();
                    Err(SyncError::Conflict(format!(
                        "collection '{id}' no longer exists"
                    )))
                }
            },
        }
    }

    async fn fetch_all(&self, ctx: SyncContext<'_>) -> Result<KnowledgeView> {
        let store = Arc::clone(&self.store);
        let store = &*store;
        let limit = self.config.list_limit;

        let remote = self
            .call(ctx, "list_collections", move || store.list_collections(limit))
            .await?;

        let mut view = KnowledgeView {
            collections: Default::default(),
            files: self.view.files.clone(),
        };

        for collection in remote {
            let id = collection.id.clone();
            let listed = {
                let id = id.as_str();
                self.call(ctx, "list_collection_files", move || {
                    store.list_collection_files(id)
                })
                .await
            };

            let files = match listed {
                Ok(files) => files,
                Err(err) if err.is_not_found() => {
                    debug!(id, "Collection vanished while listing");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let (collection, refs) = self.reconcile(collection, files);
            for file in refs {
                view.files.insert(file.id.clone(), file);
            }
            view.collections.insert(id, collection);
        }

        view.prune_orphans();
        debug!(collections = view.collections.len(), files = view.files.len(), "Listed knowledge base");
        Ok(view)
    }

    async fn fetch_one(
        &self,
        id: &str,
        ctx: SyncContext<'_>,
    ) -> Result<Option<(Collection, Vec<FileReference>)>> {
        let store = Arc::clone(&self.store);
        let store = &*store;

        let remote = match self
            .call(ctx, "get_collection", move || store.get_collection(id))
            .await
        {
            Ok(remote) => remote,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let files = match self
            .call(ctx, "list_collection_files", move || {
                store.list_collection_files(id)
            })
            .await
        {
            Ok(files) => files,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(Some(self.reconcile(remote, files)))
    }

    /// Builds the local records for one remote listing.
    fn reconcile(
        &self,
        remote: RemoteCollection,
        files: Vec<RemoteFile>,
    ) -> (Collection, Vec<FileReference>) {
        let display_name = remote
            .name
            .filter(|name| !name.is_empty())
            .or_else(|| {
                self.view
                    .collection(&remote.id)
                    .map(|c| c.display_name.clone())
            })
            .unwrap_or_else(|| remote.id.clone());

        let mut collection = Collection::new(&remote.id, display_name);
        collection.mark(SyncStatus::Clean, None);

        let refs = files
            .into_iter()
            .map(|file| {
                let original_name = file
                    .name
                    .map(|wire| self.config.name_encoding.decode(&wire))
                    .or_else(|| self.view.files.get(&file.id).map(|f| f.original_name.clone()))
                    .unwrap_or_else(|| file.id.clone());

                let (upload_status, error) = match file.status {
                    RemoteFileStatus::InProgress => (UploadStatus::Uploaded, None),
                    RemoteFileStatus::Completed => (UploadStatus::Indexed, None),
                    RemoteFileStatus::Failed | RemoteFileStatus::Cancelled => (
                        UploadStatus::Failed,
                        Some(
                            file.last_error
                                .unwrap_or_else(|| "indexing did not complete".to_string()),
                        ),
                    ),
                };

                collection.member_file_ids.insert(file.id.clone());
                FileReference {
                    id: file.id,
                    original_name,
                    upload_status,
                    error,
                }
            })
            .collect();

        (collection, refs)
    }

    fn install(&mut self, collection: Collection, files: Vec<FileReference>) {
        for file in files {
            self.view.files.insert(file.id.clone(), file);
        }
        self.view
            .collections
            .insert(collection.id.clone(), collection);
        self.view.prune_orphans();
    }

    /// Common tail of every operation: keep the confirmed view on success, roll back or
    /// force a full refresh on failure, then publish and persist.
    ///
    /// A failure that follows a successful remote mutation never rolls back to the
    /// snapshot, since the snapshot no longer describes the store.
    async fn settle<T>(
        &mut self,
        result: Result<T>,
        snapshot: KnowledgeView,
        scope: Scope<'_>,
        ctx: SyncContext<'_>,
    ) -> Result<T> {
        let mutated = std::mem::take(&mut self.mutated);
        let result = match result {
            Ok(value) => Ok(value),
            Err(err) if err.is_divergence() => {
                let detail = match &err {
                    SyncError::Fatal(remote) => remote.message.clone(),
                    other => other.to_string(),
                };
                warn!(detail = %detail, "Remote state diverged, forcing a full refresh");

                self.view = snapshot.clone();
                if let Err(refresh_err) = self.reload(None, ctx).await {
                    warn!(error = %refresh_err, "Forced refresh failed");
                    self.restore(snapshot, scope, &refresh_err);
                    if mutated {
                        self.forget_members(scope);
                    }
                }
                Err(SyncError::Conflict(detail))
            }
            Err(err) if mutated => {
                self.reconfirm(snapshot, scope, &err, ctx).await;
                Err(err)
            }
            Err(err) => {
                self.restore(snapshot, scope, &err);
                Err(err)
            }
        };

        self.publish(ctx);
        self.save_cache().await;
        result
    }

    /// Re-lists the whole store after a partially applied operation failed.
    ///
    /// Runs even when the operation was cancelled, so it has its own token.
    async fn reconfirm(
        &mut self,
        snapshot: KnowledgeView,
        scope: Scope<'_>,
        err: &SyncError,
        ctx: SyncContext<'_>,
    ) {
        info!(error = %err, "Operation failed after changing the store, re-listing");
        let fresh = CancellationToken::new();
        match self.reload(None, SyncContext::new(&fresh, ctx.events)).await {
            Ok(()) => self.mark_error(scope, err),
            Err(relist_err) => {
                warn!(error = %relist_err, "Re-listing failed, membership left unconfirmed");
                self.restore(snapshot, scope, err);
                self.forget_members(scope);
            }
        }
    }

    fn restore(&mut self, snapshot: KnowledgeView, scope: Scope<'_>, err: &SyncError) {
        self.view = snapshot;
        self.mark_error(scope, err);
    }

    fn mark_error(&mut self, scope: Scope<'_>, err: &SyncError) {
        if *err == SyncError::Cancelled {
            return;
        }

        let reason = err.to_string();
        match scope {
            Scope::Nothing => {}
            Scope::One(id) => {
                if let Some(collection) = self.view.collections.get_mut(id) {
                    collection.mark(SyncStatus::Error, Some(reason));
                }
            }
            Scope::All => {
                for collection in self.view.collections.values_mut() {
                    collection.mark(SyncStatus::Error, Some(reason.clone()));
                }
            }
        }
    }

    /// Drops membership the store may no longer have, so nothing unconfirmed is shown.
    fn forget_members(&mut self, scope: Scope<'_>) {
        let forget = |collection: &mut Collection| {
            collection.member_file_ids.clear();
            if collection.sync_status != SyncStatus::Error {
                collection.mark(SyncStatus::Stale, None);
            }
        };
        match scope {
            Scope::Nothing => {}
            Scope::One(id) => {
                if let Some(collection) = self.view.collections.get_mut(id) {
                    forget(collection);
                }
            }
            Scope::All => self.view.collections.values_mut().for_each(forget),
        }
        self.view.prune_orphans();
    }

    // Helpers

    /// Like [`Self::call`], but records that remote state changed.
    async fn mutate<T, F, Fut>(
        &mut self,
        ctx: SyncContext<'_>,
        action: &'static str,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = store::Result<T>>,
    {
        let value = self.call(ctx, action, op).await?;
        self.mutated = true;
        Ok(value)
    }

    async fn call<T, F, Fut>(&self, ctx: SyncContext<'_>, action: &'static str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = store::Result<T>>,
    {
        debug!(action, "Document store call");
        self.retry
            .run_with(
                ctx.cancel,
                RemoteError::failure_class,
                |event| ctx.emit(SyncEvent::Retrying(event)),
                op,
            )
            .await
            .map(|done| done.value)
            .map_err(SyncError::from)
    }

    fn require(&self, id: &str) -> Result<()> {
        if self.view.contains(id) {
            Ok(())
        } else {
            Err(SyncError::UnknownCollection(id.to_string()))
        }
    }

    /// Whether a collection other than `collection_id` also holds `file_id`.
    fn is_shared(&self, collection_id: &str, file_id: &str) -> bool {
        self.view
            .collections
            .values()
            .any(|c| c.id != collection_id && c.member_file_ids.contains(file_id))
    }

    fn mark_syncing(&mut self, scope: Scope<'_>) {
        match scope {
            Scope::Nothing => {}
            Scope::One(id) => {
                if let Some(collection) = self.view.collections.get_mut(id) {
                    collection.mark(SyncStatus::Syncing, None);
                }
            }
            Scope::All => {
                for collection in self.view.collections.values_mut() {
                    collection.mark(SyncStatus::Syncing, None);
                }
            }
        }
    }

    /// Next placeholder id not already taken by a cached record.
    fn local_id(&mut self) -> String {
        loop {
            self.next_local += 1;
            let id = format!("local-{}", self.next_local);
            if !self.view.files.contains_key(&id) && !self.view.collections.contains_key(&id) {
                return id;
            }
        }
    }

    fn publish(&self, ctx: SyncContext<'_>) {
        ctx.emit(SyncEvent::Changed(self.view.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Harness {
        store: MemoryStore,
        sync: Synchronizer,
        cancel: CancellationToken,
        events: Mutex<Vec<SyncEvent>>,
    }

    impl Harness {
        fn new(store: MemoryStore) -> Self {
            let config = KnowledgeConfig {
                poll_interval_ms: 1,
                max_polls: 5,
                cache_path: None,
                ..KnowledgeConfig::default()
            };
            let sync = Synchronizer::new(Arc::new(store.clone()), RetryPolicy::immediate(3), config);
            Self {
                store,
                sync,
                cancel: CancellationToken::new(),
                events: Mutex::new(Vec::new()),
            }
        }

        fn views(&self) -> Vec<KnowledgeView> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    SyncEvent::Changed(view) => Some(view.clone()),
                    SyncEvent::Retrying(_) => None,
                })
                .collect()
        }
    }

    macro_rules! ctx {
        ($h:expr) => {{
            let events = &$h.events;
            let sink = move |event: SyncEvent| events.lock().unwrap().push(event);
            (sink, &$h.cancel)
        }};
    }

    #[tokio::test]
    async fn test_create_then_refresh_is_clean() {
        let mut h = Harness::new(MemoryStore::new());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);

        let id = h.sync.create("Reports", ctx).await.unwrap();

        let collection = h.sync.view().collection(&id).unwrap();
        assert_eq!(collection.display_name, "Reports");
        assert_eq!(collection.sync_status, SyncStatus::Clean);
        assert!(!h.sync.view().contains("local-1"));
    }

    #[tokio::test]
    async fn test_create_publishes_syncing_first() {
        let mut h = Harness::new(MemoryStore::new());
        {
            let (sink, cancel) = ctx!(h);
            h.sync
                .create("Reports", SyncContext::new(cancel, &sink))
                .await
                .unwrap();
        }

        let views = h.views();
        let first = views.first().unwrap();
        let placeholder = first.collections.values().next().unwrap();
        assert_eq!(placeholder.sync_status, SyncStatus::Syncing);
    }

    #[tokio::test]
    async fn test_rename_failure_rolls_back() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Old").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();

        store
            .fail_next(
                StoreOp::RenameCollection,
                RemoteError::new(FailureKind::InvalidRequest, "name too long"),
            )
            .await;
        let err = h.sync.rename(&id, "New", ctx).await.unwrap_err();

        assert!(matches!(err, SyncError::Fatal(_)));
        let collection = h.sync.view().collection(&id).unwrap();
        assert_eq!(collection.display_name, "Old");
        assert_eq!(collection.sync_status, SyncStatus::Error);
        assert!(collection.error.as_deref().unwrap().contains("name too long"));
    }

    #[tokio::test]
    async fn test_rename_of_vanished_collection_is_conflict() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Ghost").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();

        store.remove_collection_externally(&id).await;
        let err = h.sync.rename(&id, "Renamed", ctx).await.unwrap_err();

        assert!(matches!(err, SyncError::Conflict(_)));
        assert!(!h.sync.view().contains(&id));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = MemoryStore::new();
        let mut h = Harness::new(store.clone());
        store
            .fail_next(
                StoreOp::CreateCollection,
                RemoteError::new(FailureKind::ServerBusy, "503"),
            )
            .await;

        let (sink, cancel) = ctx!(h);
        let id = h
            .sync
            .create("Retry me", SyncContext::new(cancel, &sink))
            .await
            .unwrap();

        assert!(h.sync.view().contains(&id));
        assert_eq!(store.calls(StoreOp::CreateCollection).await, 2);
        let retries = h
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SyncEvent::Retrying(_)))
            .count();
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn test_attach_failure_marks_file_failed() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Docs").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();

        store
            .fail_next(
                StoreOp::AttachFile,
                RemoteError::new(FailureKind::InvalidRequest, "unsupported file"),
            )
            .await;
        let err = h
            .sync
            .upload(&id, FileBlob::new("a.exe", b"MZ".to_vec()), ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Fatal(_)));
        let view = h.sync.view();
        assert!(view.collection(&id).unwrap().member_file_ids.is_empty());
        let failed: Vec<_> = view
            .files
            .values()
            .filter(|f| f.upload_status == UploadStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].original_name, "a.exe");
        assert!(store.stored_file_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_files() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Docs").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();
        h.sync
            .upload(&id, FileBlob::new("a.txt", b"a".to_vec()), ctx)
            .await
            .unwrap();

        h.sync.delete(&id, ctx).await.unwrap();

        assert!(!h.sync.view().contains(&id));
        assert!(h.sync.view().files.is_empty());
        assert!(store.stored_file_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_files_shared_with_other_collections() {
        let store = MemoryStore::new();
        let a = store.insert_collection("Drafts").await;
        let b = store.insert_collection("Published").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();
        let file_id = h
            .sync
            .upload(&a, FileBlob::new("q3.pdf", b"%PDF".to_vec()), ctx)
            .await
            .unwrap();
        store.attach_file(&b, &file_id).await.unwrap();
        h.sync.refresh(None, ctx).await.unwrap();

        h.sync.delete(&a, ctx).await.unwrap();

        assert!(!h.sync.view().contains(&a));
        assert_eq!(h.sync.view().members(&b).count(), 1);
        assert_eq!(store.stored_file_names().await.len(), 1);
        assert_eq!(store.calls(StoreOp::DeleteFile).await, 0);

        h.sync.refresh(Some(&b), ctx).await.unwrap();
        assert!(h
            .sync
            .view()
            .collection(&b)
            .unwrap()
            .member_file_ids
            .contains(&file_id));
    }

    #[tokio::test]
    async fn test_failed_delete_after_cascade_shows_remote_state() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Docs").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();
        h.sync
            .upload(&id, FileBlob::new("a.txt", b"a".to_vec()), ctx)
            .await
            .unwrap();

        store
            .fail_next(
                StoreOp::DeleteCollection,
                RemoteError::new(FailureKind::InvalidRequest, "locked"),
            )
            .await;
        let err = h.sync.delete(&id, ctx).await.unwrap_err();

        assert!(matches!(err, SyncError::Fatal(_)));
        let collection = h.sync.view().collection(&id).unwrap();
        assert!(collection.member_file_ids.is_empty());
        assert_eq!(collection.sync_status, SyncStatus::Error);
        assert!(collection.error.as_deref().unwrap().contains("locked"));
        assert!(h.sync.view().files.is_empty());
        assert!(store.stored_file_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_attach_is_not_a_failed_upload() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Docs").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();

        store
            .fail_next(
                StoreOp::GetCollection,
                RemoteError::new(FailureKind::InvalidRequest, "listing unavailable"),
            )
            .await;
        let err = h
            .sync
            .upload(&id, FileBlob::new("a.txt", b"a".to_vec()), ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Fatal(_)));
        let view = h.sync.view();
        assert!(!view
            .files
            .values()
            .any(|f| f.upload_status == UploadStatus::Failed));
        let members: Vec<_> = view.members(&id).collect();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].original_name, "a.txt");
    }

    #[tokio::test]
    async fn test_cached_placeholder_ids_are_not_reused() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Docs").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();
        h.sync.view.files.insert(
            "local-1".to_string(),
            FileReference {
                id: "local-1".to_string(),
                original_name: "old.txt".to_string(),
                upload_status: UploadStatus::Failed,
                error: Some("unsupported file".to_string()),
            },
        );

        store
            .fail_next(
                StoreOp::AttachFile,
                RemoteError::new(FailureKind::InvalidRequest, "unsupported file"),
            )
            .await;
        h.sync
            .upload(&id, FileBlob::new("new.txt", b"n".to_vec()), ctx)
            .await
            .unwrap_err();

        let mut failed: Vec<_> = h
            .sync
            .view()
            .files
            .values()
            .filter(|f| f.upload_status == UploadStatus::Failed)
            .map(|f| f.original_name.as_str())
            .collect();
        failed.sort();
        assert_eq!(failed, vec!["new.txt", "old.txt"]);
    }

    #[tokio::test]
    async fn test_remove_file() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Docs").await;
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let ctx = SyncContext::new(cancel, &sink);
        h.sync.refresh(None, ctx).await.unwrap();
        let file_id = h
            .sync
            .upload(&id, FileBlob::new("a.txt", b"a".to_vec()), ctx)
            .await
            .unwrap();

        h.sync.remove_file(&id, &file_id, ctx).await.unwrap();

        assert_eq!(h.sync.view().members(&id).count(), 0);
        assert_eq!(store.calls(StoreOp::DeleteFile).await, 1);
    }

    #[tokio::test]
    async fn test_unknown_collection_makes_no_remote_call() {
        let store = MemoryStore::new();
        let mut h = Harness::new(store.clone());
        let (sink, cancel) = ctx!(h);
        let err = h
            .sync
            .delete("vs_missing", SyncContext::new(cancel, &sink))
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::UnknownCollection("vs_missing".into()));
        assert_eq!(store.calls(StoreOp::DeleteCollection).await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_refresh_restores_snapshot() {
        let store = MemoryStore::new();
        let id = store.insert_collection("Docs").await;
        let mut h = Harness::new(store.clone());
        {
            let (sink, cancel) = ctx!(h);
            h.sync
                .refresh(None, SyncContext::new(cancel, &sink))
                .await
                .unwrap();
        }

        h.cancel.cancel();
        let (sink, cancel) = ctx!(h);
        let err = h
            .sync
            .refresh(Some(&id), SyncContext::new(cancel, &sink))
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::Cancelled);
        assert_eq!(
            h.sync.view().collection(&id).unwrap().sync_status,
            SyncStatus::Clean
        );
    }
}
