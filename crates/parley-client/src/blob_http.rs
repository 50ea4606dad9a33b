//! Archive blobs fetched from an HTTP blob service.

use async_trait::async_trait;
use parley_shared::constants::ARCHIVE_CONTENT_TYPE;
use parley_shared::types::BlobId;
use parley_shared::CommunicationError;
use parley_store::blobs::validate_blob_id;
use parley_store::BlobStorage;
use reqwest::header::CONTENT_TYPE;

use crate::error::{check_status, from_reqwest, ClientError};

type BlobResult<T> = std::result::Result<T, CommunicationError>;

/// [`BlobStorage`] addressed through a URL template such as
/// `http://files/blob/:workspace/:blobId`. `:filename` expands to the
/// blob id with a `.yaml` suffix.
pub struct HttpBlobStorage {
    http: reqwest::Client,
    template: String,
    workspace: String,
}

impl HttpBlobStorage {
    pub fn new(
        template: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let template = template.into();
        if !template.contains(":blobId") && !template.contains(":filename") {
            return Err(ClientError::InvalidConfig(format!(
                "blob url template {template:?} has no :blobId or :filename"
            )));
        }
        let http = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            http,
            template,
            workspace: workspace.into(),
        })
    }

    pub fn url(&self, id: &BlobId) -> BlobResult<String> {
        validate_blob_id(id)?;
        Ok(self
            .template
            .replace(":workspace", &self.workspace)
            .replace(":blobId", id.as_str())
            .replace(":filename", &format!("{id}.yaml")))
    }
}

#[async_trait]
impl BlobStorage for HttpBlobStorage {
    async fn put(&self, id: &BlobId, data: &[u8]) -> BlobResult<()> {
        let url = self.url(id)?;
        let response = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
            .body(data.to_vec())
            .send()
            .await
            .map_err(from_reqwest)?;
        check_status(response).await?;
        tracing::debug!(blob = %id, size = data.len(), "blob uploaded");
        Ok(())
    }

    async fn get(&self, id: &BlobId) -> BlobResult<Vec<u8>> {
        let url = self.url(id)?;
        let response = self.http.get(&url).send().await.map_err(from_reqwest)?;
        let bytes = check_status(response)
            .await?
            .bytes()
            .await
            .map_err(from_reqwest)?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, id: &BlobId) -> BlobResult<()> {
        let url = self.url(id)?;
        let response = self.http.delete(&url).send().await.map_err(from_reqwest)?;
        match check_status(response).await {
            Ok(_) | Err(CommunicationError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
