//! File and vector-store endpoints.
//!
//! Per-file calls (upload, delete, attach, detach) are single attempts: the
//! transfer engine owns their retries and throttling. Store and batch
//! management go through the shared retry policy.

use std::path::Path;
use std::time::Duration;

use reqwest::Method;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tokio::fs;

use super::OpenAIClient;
use crate::retry::send_with_retry;
use crate::{BatchStatus, ProviderError, check_status, decode_json};

const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct BatchInfo {
    status: BatchStatus,
}

fn created_id(created: Created, what: &str) -> Result<String, ProviderError> {
    if created.id.is_empty() {
        return Err(ProviderError::Protocol(format!("{what} response has an empty id")));
    }
    Ok(created.id)
}

impl OpenAIClient {
    /// Upload a file for retrieval. `display_name` overrides the declared filename.
    pub async fn upload_file(
        &self,
        path: &Path,
        display_name: Option<&str>,
    ) -> Result<String, ProviderError> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| ProviderError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        let filename = display_name.map_or_else(
            || {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload.txt".to_string())
            },
            str::to_string,
        );
        tracing::debug!(path = %path.display(), %filename, bytes = bytes.len(), "Uploading file");

        let form = Form::new()
            .text("purpose", "assistants")
            .part("file", Part::bytes(bytes).file_name(filename));
        let response = self
            .request(Method::POST, "files")
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response).await?;
        created_id(decode_json(response).await?, "file upload")
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<(), ProviderError> {
        let response = self
            .request(Method::DELETE, &format!("files/{file_id}"))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn attach_file(&self, store_id: &str, file_id: &str) -> Result<(), ProviderError> {
        let response = self
            .request(Method::POST, &format!("vector_stores/{store_id}/files"))
            .json(&json!({ "file_id": file_id }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn detach_file(&self, store_id: &str, file_id: &str) -> Result<(), ProviderError> {
        let response = self
            .request(
                Method::DELETE,
                &format!("vector_stores/{store_id}/files/{file_id}"),
            )
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn create_store(&self, name: &str) -> Result<String, ProviderError> {
        let body = json!({ "name": name });
        let response = send_with_retry(
            || self.request(Method::POST, "vector_stores").json(&body),
            Some(CONTROL_PLANE_TIMEOUT),
            &self.retry,
        )
        .await
        .into_result()
        .await?;
        created_id(decode_json(response).await?, "vector store")
    }

    pub async fn delete_store(&self, store_id: &str) -> Result<(), ProviderError> {
        let path = format!("vector_stores/{store_id}");
        send_with_retry(
            || self.request(Method::DELETE, &path),
            Some(CONTROL_PLANE_TIMEOUT),
            &self.retry,
        )
        .await
        .into_result()
        .await?;
        Ok(())
    }

    /// Submit one batch attaching every uploaded file to the store.
    pub async fn create_file_batch(
        &self,
        store_id: &str,
        file_ids: &[String],
    ) -> Result<String, ProviderError> {
        let path = format!("vector_stores/{store_id}/file_batches");
        let body = json!({ "file_ids": file_ids });
        let response = send_with_retry(
            || self.request(Method::POST, &path).json(&body),
            Some(CONTROL_PLANE_TIMEOUT),
            &self.retry,
        )
        .await
        .into_result()
        .await?;
        created_id(decode_json(response).await?, "file batch")
    }

    pub async fn batch_status(
        &self,
        store_id: &str,
        batch_id: &str,
    ) -> Result<BatchStatus, ProviderError> {
        let path = format!("vector_stores/{store_id}/file_batches/{batch_id}");
        let response = send_with_retry(
            || self.request(Method::GET, &path),
            Some(CONTROL_PLANE_TIMEOUT),
            &self.retry,
        )
        .await
        .into_result()
        .await?;
        let info: BatchInfo = decode_json(response).await?;
        Ok(info.status)
    }
}
