//! OpenAI vector stores as a [`DocumentStore`].
//!
//! Collections map to vector stores and files to `assistants`-purpose file entities.
//! Member listings do not carry file names, so names are fetched per file concurrently.

use super::store::{DocumentStore, Result};
use super::types::{RemoteCollection, RemoteFile, RemoteFileStatus};
use crate::config::LlmConfig;
use crate::provider::openai::{authorized_client, check_status};
use crate::secrets::ApiKey;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct OpenAiDocumentStore {
    base_url: String,
    http_client: reqwest::Client,
}

impl OpenAiDocumentStore {
    pub fn new(config: &LlmConfig, api_key: &ApiKey) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client: authorized_client(
                api_key,
                Duration::from_secs(config.request_timeout_secs),
            )?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = check_status(request.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_empty(&self, request: reqwest::RequestBuilder) -> Result<()> {
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn file_name(&self, file_id: &str) -> Option<String> {
        let request = self.http_client.get(self.url(&format!("/files/{file_id}")));
        match self.send::<FileObject>(request).await {
            Ok(file) => Some(file.filename),
            Err(err) => {
                warn!(file_id, error = %err, "Could not fetch file details");
                None
            }
        }
    }
}

#[async_trait]
impl DocumentStore for OpenAiDocumentStore {
    async fn list_collections(&self, limit: usize) -> Result<Vec<RemoteCollection>> {
        let request = self
            .http_client
            .get(self.url("/vector_stores"))
            .query(&[("limit", limit.to_string()), ("order", "desc".to_string())]);
        let page: Page<VectorStoreObject> = self.send(request).await?;
        Ok(page.data.into_iter().map(RemoteCollection::from).collect())
    }

    async fn get_collection(&self, id: &str) -> Result<RemoteCollection> {
        let request = self.http_client.get(self.url(&format!("/vector_stores/{id}")));
        let store: VectorStoreObject = self.send(request).await?;
        Ok(store.into())
    }

    async fn create_collection(&self, name: &str) -> Result<RemoteCollection> {
        let request = self
            .http_client
            .post(self.url("/vector_stores"))
            .json(&json!({ "name": name }));
        let store: VectorStoreObject = self.send(request).await?;
        debug!(id = %store.id, "Created vector store");
        Ok(store.into())
    }

    async fn rename_collection(&self, id: &str, name: &str) -> Result<RemoteCollection> {
        let request = self
            .http_client
            .post(self.url(&format!("/vector_stores/{id}")))
            .json(&json!({ "name": name }));
        let store: VectorStoreObject = self.send(request).await?;
        Ok(store.into())
    }

    async fn delete_collection(&self, id: &str) -> Result<()> {
        let request = self
            .http_client
            .delete(self.url(&format!("/vector_stores/{id}")));
        self.send_empty(request).await
    }

    async fn upload_file(&self, name: &str, content: Vec<u8>) -> Result<RemoteFile> {
        let form = Form::new()
            .text("purpose", "assistants")
            .part("file", Part::bytes(content).file_name(name.to_string()));
        let request = self.http_client.post(self.url("/files")).multipart(form);
        let file: FileObject = self.send(request).await?;
        debug!(id = %file.id, "Uploaded file");

        Ok(RemoteFile {
            id: file.id,
            name: Some(file.filename),
            status: RemoteFileStatus::InProgress,
            last_error: None,
        })
    }

    async fn attach_file(&self, collection_id: &str, file_id: &str) -> Result<()> {
        let request = self
            .http_client
            .post(self.url(&format!("/vector_stores/{collection_id}/files")))
            .json(&json!({ "file_id": file_id }));
        self.send_empty(request).await
    }

    async fn detach_file(&self, collection_id: &str, file_id: &str) -> Result<()> {
        let request = self.http_client.delete(
            self.url(&format!("/vector_stores/{collection_id}/files/{file_id}")),
        );
        self.send_empty(request).await
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let request = self.http_client.delete(self.url(&format!("/files/{file_id}")));
        self.send_empty(request).await
    }

    async fn list_collection_files(&self, collection_id: &str) -> Result<Vec<RemoteFile>> {
        let mut entries = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut query = vec![("limit", PAGE_SIZE.to_string())];
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }
            let request = self
                .http_client
                .get(self.url(&format!("/vector_stores/{collection_id}/files")))
                .query(&query);
            let page: Page<VectorStoreFileObject> = self.send(request).await?;

            after = page.data.last().map(|f| f.id.clone());
            entries.extend(page.data);
            if !page.has_more || after.is_none() {
                break;
            }
        }

        let names = join_all(entries.iter().map(|entry| self.file_name(&entry.id))).await;

        Ok(entries
            .into_iter()
            .zip(names)
            .map(|(entry, name)| RemoteFile {
                id: entry.id,
                name,
                status: entry.status.into(),
                last_error: entry.last_error.map(|e| e.message),
            })
            .collect())
    }
}

// Wire format

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct VectorStoreObject {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl From<VectorStoreObject> for RemoteCollection {
    fn from(store: VectorStoreObject) -> Self {
        Self {
            id: store.id,
            name: store.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
    #[serde(default)]
    filename: String,
}

#[derive(Debug, Deserialize)]
struct VectorStoreFileObject {
    id: String,
    status: FileStatusWire,
    #[serde(default)]
    last_error: Option<LastError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FileStatusWire {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl From<FileStatusWire> for RemoteFileStatus {
    fn from(status: FileStatusWire) -> Self {
        match status {
            FileStatusWire::InProgress => RemoteFileStatus::InProgress,
            FileStatusWire::Completed => RemoteFileStatus::Completed,
            FileStatusWire::Failed => RemoteFileStatus::Failed,
            FileStatusWire::Cancelled => RemoteFileStatus::Cancelled,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LastError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_listing_wire_format() {
        let body = r#"{
            "object": "list",
            "data": [
                {"id": "file-1", "object": "vector_store.file", "status": "completed", "last_error": null},
                {"id": "file-2", "object": "vector_store.file", "status": "failed",
                 "last_error": {"code": "unsupported_file", "message": "Unsupported file type"}}
            ],
            "has_more": false
        }"#;
        let page: Page<VectorStoreFileObject> = serde_json::from_str(body).unwrap();
        assert_eq!(page.data.len(), 2);
        assert!(matches!(page.data[0].status, FileStatusWire::Completed));
        assert_eq!(
            page.data[1].last_error.as_ref().map(|e| e.message.as_str()),
            Some("Unsupported file type")
        );
    }

    #[test]
    fn test_unnamed_vector_store() {
        let store: VectorStoreObject =
            serde_json::from_str(r#"{"id": "vs_1", "name": null}"#).unwrap();
        let collection = RemoteCollection::from(store);
        assert_eq!(collection.name, None);
    }
}
