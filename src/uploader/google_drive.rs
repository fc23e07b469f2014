use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde::Deserialize;

use super::provider::{folder_leaf_name, StorageProvider, UploadSource};
use crate::errors::{upload_error_from_response, AppError, AppResult};
use crate::models::ProviderKind;

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const ROOT_FOLDER_ID: &str = "root";

/// Drive accepts multipart uploads up to 5 MiB; larger files go resumable.
const MULTIPART_LIMIT_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct GoogleDriveEndpoints {
    pub api_base: String,
    pub upload_base: String,
}

impl Default for GoogleDriveEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
        }
    }
}

impl GoogleDriveEndpoints {
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            api_base: format!("{}/drive/v3", base),
            upload_base: format!("{}/upload/drive/v3", base),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

pub struct GoogleDriveClient {
    http: reqwest::Client,
    access_token: String,
    endpoints: GoogleDriveEndpoints,
}

impl GoogleDriveClient {
    pub fn new(http: reqwest::Client, access_token: String, endpoints: GoogleDriveEndpoints) -> Self {
        Self {
            http,
            access_token,
            endpoints,
        }
    }

    async fn find_folder(&self, name: &str) -> AppResult<Option<String>> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and '{}' in parents and trashed = false",
            escape_query_literal(name),
            FOLDER_MIME_TYPE,
            ROOT_FOLDER_ID
        );

        let response = self
            .http
            .get(format!("{}/files", self.endpoints.api_base))
            .bearer_auth(&self.access_token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("spaces", "drive"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upload_error_from_response("Drive folder lookup", response).await);
        }

        let list: DriveFileList = response.json().await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, name: &str) -> AppResult<String> {
        let response = self
            .http
            .post(format!("{}/files", self.endpoints.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("fields", "id")])
            .json(&serde_json::json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": [ROOT_FOLDER_ID],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upload_error_from_response("Drive folder creation", response).await);
        }

        let folder: DriveFile = response.json().await?;
        Ok(folder.id)
    }

    async fn upload_multipart(
        &self,
        bytes: Vec<u8>,
        metadata: &serde_json::Value,
        mime_type: &str,
    ) -> AppResult<reqwest::Response> {
        let boundary = format!("upload-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, metadata, mime_type, &bytes)?;

        Ok(self
            .http
            .post(format!("{}/files", self.endpoints.upload_base))
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?)
    }

    async fn upload_resumable(
        &self,
        bytes: Vec<u8>,
        metadata: &serde_json::Value,
        mime_type: &str,
    ) -> AppResult<reqwest::Response> {
        let session = self
            .http
            .post(format!("{}/files", self.endpoints.upload_base))
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", bytes.len().to_string())
            .json(metadata)
            .send()
            .await?;

        if !session.status().is_success() {
            return Err(upload_error_from_response("Drive upload session", session).await);
        }

        let session_url = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::upload_failed("Drive upload session returned no Location", None)
            })?;

        log::debug!("Resumable upload session opened for {} bytes", bytes.len());

        Ok(self
            .http
            .put(session_url)
            .bearer_auth(&self.access_token)
            .header(CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?)
    }
}

/// Escape a value for a single-quoted Drive query literal.
fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related_body(
    boundary: &str,
    metadata: &serde_json::Value,
    mime_type: &str,
    bytes: &[u8],
) -> AppResult<Vec<u8>> {
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{}\r\n",
            boundary,
            serde_json::to_string(metadata)?
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("--{}\r\nContent-Type: {}\r\n\r\n", boundary, mime_type).as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    Ok(body)
}

#[async_trait]
impl StorageProvider for GoogleDriveClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    fn root_folder_id(&self) -> String {
        ROOT_FOLDER_ID.to_string()
    }

    async fn resolve_or_create_folder(&self, path: &str) -> AppResult<String> {
        let Some(name) = folder_leaf_name(path) else {
            return Ok(self.root_folder_id());
        };

        if let Some(id) = self.find_folder(name).await? {
            log::info!("Found Drive folder '{}' with ID: {}", name, id);
            return Ok(id);
        }

        log::info!("Drive folder '{}' not found, creating it...", name);
        let id = self.create_folder(name).await?;
        log::info!("Created Drive folder '{}' with ID: {}", name, id);
        Ok(id)
    }

    async fn upload_file(
        &self,
        source: UploadSource,
        folder_id: &str,
        filename: &str,
        mime_type: &str,
    ) -> AppResult<String> {
        let bytes = source.into_bytes().await?;
        let metadata = serde_json::json!({
            "name": filename,
            "parents": [folder_id],
        });

        let size = bytes.len();
        let response = if size <= MULTIPART_LIMIT_BYTES {
            self.upload_multipart(bytes, &metadata, mime_type).await?
        } else {
            self.upload_resumable(bytes, &metadata, mime_type).await?
        };

        if !response.status().is_success() {
            return Err(upload_error_from_response("Drive upload", response).await);
        }

        let file: DriveFile = response.json().await?;
        log::info!(
            "Uploaded {} ({} bytes) to Google Drive. File ID: {}",
            filename,
            size,
            file.id
        );
        Ok(file.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_query_literal() {
        assert_eq!(escape_query_literal("Bob's"), "Bob\\'s");
        assert_eq!(escape_query_literal(r"a\b"), r"a\\b");
    }

    #[test]
    fn test_multipart_body_layout() {
        let metadata = serde_json::json!({"name": "a.png"});
        let body = multipart_related_body("XYZ", &metadata, "image/png", b"PNGDATA").unwrap();
        let text = String::from_utf8_lossy(&body);

        assert!(text.starts_with("--XYZ\r\nContent-Type: application/json"));
        assert!(text.contains(r#"{"name":"a.png"}"#));
        assert!(text.contains("Content-Type: image/png\r\n\r\nPNGDATA\r\n--XYZ--"));
    }

    #[tokio::test]
    async fn test_root_path_resolves_without_network() {
        let client = GoogleDriveClient::new(
            reqwest::Client::new(),
            "token".to_string(),
            GoogleDriveEndpoints::with_base("http://127.0.0.1:9"),
        );
        assert_eq!(client.resolve_or_create_folder("/").await.unwrap(), "root");
    }
}
