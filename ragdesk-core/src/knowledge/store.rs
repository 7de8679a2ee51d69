//! Document store abstraction.
//!
//! The store is the remote source of truth for collections and their member files. The
//! synchronizer treats every answer as authoritative and never infers membership from the
//! return value of a mutation.

use super::types::{RemoteCollection, RemoteFile};
use crate::error::RemoteError;
use async_trait::async_trait;

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Remote collection and file management.
///
/// File names passed to [`upload_file`](DocumentStore::upload_file) are already
/// transport-encoded, and names in listings are returned in the same encoding.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Lists up to `limit` collections, newest first.
    async fn list_collections(&self, limit: usize) -> Result<Vec<RemoteCollection>>;

    async fn get_collection(&self, id: &str) -> Result<RemoteCollection>;

    async fn create_collection(&self, name: &str) -> Result<RemoteCollection>;

    async fn rename_collection(&self, id: &str, name: &str) -> Result<RemoteCollection>;

    async fn delete_collection(&self, id: &str) -> Result<()>;

    /// Uploads a file entity. It belongs to no collection until attached.
    async fn upload_file(&self, name: &str, content: Vec<u8>) -> Result<RemoteFile>;

    async fn attach_file(&self, collection_id: &str, file_id: &str) -> Result<()>;

    async fn detach_file(&self, collection_id: &str, file_id: &str) -> Result<()>;

    async fn delete_file(&self, file_id: &str) -> Result<()>;

    /// Member files of a collection with their indexing status.
    async fn list_collection_files(&self, collection_id: &str) -> Result<Vec<RemoteFile>>;
}
