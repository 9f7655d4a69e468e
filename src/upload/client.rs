use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use crate::channel::ProgressMessage;
use super::errors::{default_status_message, Result, UploadError};

/// Per-request timeout used when none is configured
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub photo_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub photo_id: String,
    pub chunk_number: u32,
    #[serde(default)]
    pub status: String,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub missing_chunks: Option<Vec<u32>>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest<'a> {
    pub original_file_name: &'a str,
    pub mime_type: &'a str,
    pub file_size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub storage_used_bytes: u64,
    pub storage_quota_bytes: u64,
}

impl StorageUsage {
    pub fn available_bytes(&self) -> u64 {
        self.storage_quota_bytes.saturating_sub(self.storage_used_bytes)
    }
}

/// The REST surface the engine uploads through.
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// Whole file in one multipart request
    async fn upload_direct(&self, file_name: &str, mime_type: &str, data: Bytes) -> Result<UploadResponse>;

    /// Opens a chunked session and returns its `photoId`
    async fn initialize_upload(&self, file_name: &str, mime_type: &str, size: u64) -> Result<UploadResponse>;

    /// `chunk_number` is zero based
    async fn upload_chunk(
        &self,
        photo_id: &str,
        chunk_number: u32,
        total_chunks: u32,
        data: Bytes,
    ) -> Result<ChunkUploadResponse>;

    async fn get_progress(&self, photo_id: &str) -> Result<ProgressMessage>;
}

#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn storage_usage(&self) -> Result<StorageUsage>;
}

#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpUploadApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        // 保证以 / 结尾, 否则 join 会替换最后一段路径
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(UploadError::Http)?;

        Ok(Self { client, base_url, token })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn file_part(data: Bytes, file_name: &str, mime_type: &str) -> Result<Part> {
        let len = data.len() as u64;
        Part::stream_with_length(data, len)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(UploadError::Http)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(UploadError::from_transport)?;

        let response = check_response(response).await?;
        response.json::<T>().await.map_err(UploadError::from_transport)
    }
}

/// Turns a non-success response into `UploadError::Server`, keeping the
/// server's message and any `Retry-After` seconds.
async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body)
        .unwrap_or_else(|| default_status_message(status.as_u16()).to_string());

    Err(UploadError::Server {
        status_code: status.as_u16(),
        message,
        retry_after,
    })
}

fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["error", "message"]
        .iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()))
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn upload_direct(&self, file_name: &str, mime_type: &str, data: Bytes) -> Result<UploadResponse> {
        let form = Form::new().part("file", Self::file_part(data, file_name, mime_type)?);
        let request = self.client.post(self.endpoint("upload")?).multipart(form);
        self.send(request).await
    }

    async fn initialize_upload(&self, file_name: &str, mime_type: &str, size: u64) -> Result<UploadResponse> {
        let body = InitializeRequest {
            original_file_name: file_name,
            mime_type,
            file_size_bytes: size,
        };
        let request = self.client.post(self.endpoint("upload/initialize")?).json(&body);
        self.send(request).await
    }

    async fn upload_chunk(
        &self,
        photo_id: &str,
        chunk_number: u32,
        total_chunks: u32,
        data: Bytes,
    ) -> Result<ChunkUploadResponse> {
        let part = Self::file_part(data, &format!("chunk-{chunk_number}"), "application/octet-stream")?;
        let form = Form::new().part("file", part);

        let mut url = self.endpoint("upload/chunk")?;
        url.query_pairs_mut()
            .append_pair("photoId", photo_id)
            .append_pair("chunkNumber", &chunk_number.to_string())
            .append_pair("totalChunks", &total_chunks.to_string());

        let response: ChunkUploadResponse = self.send(self.client.post(url).multipart(form)).await?;
        if let Some(missing) = response.missing_chunks.as_ref().filter(|m| !m.is_empty()) {
            debug!(photo_id, chunk_number, ?missing, "server reports missing chunks");
        }
        Ok(response)
    }

    async fn get_progress(&self, photo_id: &str) -> Result<ProgressMessage> {
        let url = self.endpoint(&format!("upload/progress/{photo_id}"))?;
        self.send(self.client.get(url)).await
    }
}

#[async_trait]
impl QuotaService for HttpUploadApi {
    async fn storage_usage(&self) -> Result<StorageUsage> {
        let url = self.endpoint("photos/stats")?;
        self.send(self.client.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let api = HttpUploadApi::new("http://localhost:8080/api", None, DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(api.base_url().as_str(), "http://localhost:8080/api/");
        assert_eq!(
            api.endpoint("upload/initialize").unwrap().as_str(),
            "http://localhost:8080/api/upload/initialize"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpUploadApi::new("not a url", None, DEFAULT_REQUEST_TIMEOUT).unwrap_err();
        assert!(matches!(err, UploadError::Url(_)));
    }

    #[test]
    fn test_error_message_from_body() {
        assert_eq!(error_message(r#"{"error":"quota full"}"#).as_deref(), Some("quota full"));
        assert_eq!(error_message(r#"{"message":"bad chunk"}"#).as_deref(), Some("bad chunk"));
        assert_eq!(error_message(r#"{"message":""}"#), None);
        assert_eq!(error_message("<html>oops</html>"), None);
    }

    #[test]
    fn test_chunk_response_shape() {
        let json = r#"{
            "photoId": "p-1",
            "chunkNumber": 2,
            "status": "UPLOADING",
            "uploadedChunks": 3,
            "totalChunks": 10,
            "missingChunks": [1]
        }"#;
        let response: ChunkUploadResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.uploaded_chunks, 3);
        assert_eq!(response.missing_chunks, Some(vec![1]));
        assert!(response.message.is_none());
    }

    #[test]
    fn test_storage_usage_ignores_extra_fields() {
        let json = r#"{"totalPhotos": 4, "storageUsedBytes": 10, "storageQuotaBytes": 100}"#;
        let usage: StorageUsage = serde_json::from_str(json).unwrap();
        assert_eq!(usage.available_bytes(), 90);
    }
}
