use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use serde::Deserialize;

use super::provider::{folder_leaf_name, StorageProvider, UploadSource};
use crate::errors::{upload_error_from_response, AppError, AppResult};
use crate::models::ProviderKind;

const ROOT_FOLDER_ID: &str = "root";

/// Graph allows simple PUT uploads up to 4 MiB.
const SIMPLE_UPLOAD_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Upload session chunk size. Must be a multiple of 320 KiB.
const SESSION_CHUNK_BYTES: usize = 32 * 320 * 1024;

/// Same-name files are overwritten, matching what a simple PUT does.
const FILE_CONFLICT_BEHAVIOR: &str = "replace";

#[derive(Debug, Clone, PartialEq)]
pub struct OneDriveEndpoints {
    pub graph_base: String,
}

impl Default for OneDriveEndpoints {
    fn default() -> Self {
        Self {
            graph_base: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

impl OneDriveEndpoints {
    pub fn with_base(base: &str) -> Self {
        Self {
            graph_base: base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    folder: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

pub struct OneDriveClient {
    http: reqwest::Client,
    access_token: String,
    endpoints: OneDriveEndpoints,
}

impl OneDriveClient {
    pub fn new(http: reqwest::Client, access_token: String, endpoints: OneDriveEndpoints) -> Self {
        Self {
            http,
            access_token,
            endpoints,
        }
    }

    fn item_url(&self, item_id: &str) -> String {
        if item_id == ROOT_FOLDER_ID {
            format!("{}/me/drive/root", self.endpoints.graph_base)
        } else {
            format!("{}/me/drive/items/{}", self.endpoints.graph_base, item_id)
        }
    }

    /// Walk every page of the root's children looking for a folder by name.
    async fn find_folder(&self, name: &str) -> AppResult<Option<String>> {
        let mut url = format!("{}/children", self.item_url(ROOT_FOLDER_ID));

        loop {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.access_token)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(upload_error_from_response("OneDrive folder lookup", response).await);
            }

            let page: ChildrenPage = response.json().await?;
            if let Some(item) = page
                .value
                .into_iter()
                .find(|item| item.folder.is_some() && item.name == name)
            {
                return Ok(Some(item.id));
            }

            match page.next_link {
                Some(next) => url = next,
                None => return Ok(None),
            }
        }
    }

    async fn create_folder(&self, name: &str) -> AppResult<String> {
        let response = self
            .http
            .post(format!("{}/children", self.item_url(ROOT_FOLDER_ID)))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "name": name,
                "folder": {},
                "@microsoft.graph.conflictBehavior": "fail",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upload_error_from_response("OneDrive folder creation", response).await);
        }

        let item: DriveItem = response.json().await?;
        Ok(item.id)
    }

    fn content_path(&self, folder_id: &str, filename: &str) -> String {
        format!(
            "{}:/{}:",
            self.item_url(folder_id),
            urlencoding::encode(filename)
        )
    }

    async fn upload_simple(
        &self,
        bytes: Vec<u8>,
        folder_id: &str,
        filename: &str,
        mime_type: &str,
    ) -> AppResult<DriveItem> {
        let response = self
            .http
            .put(format!("{}/content", self.content_path(folder_id, filename)))
            .bearer_auth(&self.access_token)
            .header(CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upload_error_from_response("OneDrive upload", response).await);
        }

        Ok(response.json().await?)
    }

    async fn upload_in_session(
        &self,
        bytes: Vec<u8>,
        folder_id: &str,
        filename: &str,
    ) -> AppResult<DriveItem> {
        let response = self
            .http
            .post(format!(
                "{}/createUploadSession",
                self.content_path(folder_id, filename)
            ))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "item": { "@microsoft.graph.conflictBehavior": FILE_CONFLICT_BEHAVIOR }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upload_error_from_response("OneDrive upload session", response).await);
        }

        let session: UploadSession = response.json().await?;
        let total = bytes.len();
        log::debug!(
            "OneDrive upload session opened for {} ({} bytes)",
            filename,
            total
        );

        let mut start = 0;
        for chunk in bytes.chunks(SESSION_CHUNK_BYTES) {
            let end = start + chunk.len() - 1;

            // The upload URL is pre-authorized; Graph rejects a bearer header here
            let response = self
                .http
                .put(&session.upload_url)
                .header(CONTENT_LENGTH, chunk.len())
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))
                .body(chunk.to_vec())
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(upload_error_from_response("OneDrive chunk upload", response).await);
            }

            if end + 1 == total {
                return Ok(response.json().await?);
            }
            start = end + 1;
        }

        Err(AppError::upload_failed(
            "OneDrive upload session ended without a completed item",
            None,
        ))
    }
}

#[async_trait]
impl StorageProvider for OneDriveClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OneDrive
    }

    fn root_folder_id(&self) -> String {
        ROOT_FOLDER_ID.to_string()
    }

    async fn resolve_or_create_folder(&self, path: &str) -> AppResult<String> {
        let Some(name) = folder_leaf_name(path) else {
            return Ok(self.root_folder_id());
        };

        if let Some(id) = self.find_folder(name).await? {
            log::info!("Found OneDrive folder '{}' with ID: {}", name, id);
            return Ok(id);
        }

        log::info!("OneDrive folder '{}' not found, creating it...", name);
        let id = self.create_folder(name).await?;
        log::info!("Created OneDrive folder '{}' with ID: {}", name, id);
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
        let size = bytes.len();

        let item = if size <= SIMPLE_UPLOAD_LIMIT_BYTES {
            self.upload_simple(bytes, folder_id, filename, mime_type)
                .await?
        } else {
            self.upload_in_session(bytes, folder_id, filename).await?
        };

        log::info!(
            "Uploaded {} ({} bytes) to OneDrive. File ID: {}",
            filename,
            size,
            item.id
        );
        Ok(item.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> OneDriveClient {
        OneDriveClient::new(
            reqwest::Client::new(),
            "token".to_string(),
            OneDriveEndpoints::with_base(base),
        )
    }

    #[test]
    fn test_item_urls() {
        let client = client("https://graph.example/v1.0/");
        assert_eq!(
            client.item_url("root"),
            "https://graph.example/v1.0/me/drive/root"
        );
        assert_eq!(
            client.content_path("F1", "my image #1.png"),
            "https://graph.example/v1.0/me/drive/items/F1:/my%20image%20%231.png:"
        );
    }

    #[test]
    fn test_chunk_size_is_graph_aligned() {
        assert_eq!(SESSION_CHUNK_BYTES % (320 * 1024), 0);
        assert!(SESSION_CHUNK_BYTES > SIMPLE_UPLOAD_LIMIT_BYTES);
    }

    #[test]
    fn test_children_page_parses_next_link() {
        let page: ChildrenPage = serde_json::from_str(
            r#"{"value":[{"id":"1","name":"x","folder":{"childCount":0}},{"id":"2","name":"y.png","file":{}}],
                "@odata.nextLink":"https://graph/next"}"#,
        )
        .unwrap();
        assert_eq!(page.value.len(), 2);
        assert!(page.value[0].folder.is_some());
        assert!(page.value[1].folder.is_none());
        assert_eq!(page.next_link.as_deref(), Some("https://graph/next"));
    }

    #[tokio::test]
    async fn test_upload_session_replaces_existing_file() {
        let mut server = mockito::Server::new_async().await;
        let upload_url = format!("{}/session/abc", server.url());

        let create = server
            .mock("POST", "/me/drive/items/F1:/big.png:/createUploadSession")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "item": {"@microsoft.graph.conflictBehavior": "replace"}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::json!({ "uploadUrl": upload_url }).to_string())
            .create_async()
            .await;
        let chunk = server
            .mock("PUT", "/session/abc")
            .match_header("content-range", "bytes 0-9/10")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"I9","name":"big.png"}"#)
            .create_async()
            .await;

        let item = client(&server.url())
            .upload_in_session(vec![7u8; 10], "F1", "big.png")
            .await
            .unwrap();
        assert_eq!(item.id, "I9");
        create.assert_async().await;
        chunk.assert_async().await;
    }

    #[tokio::test]
    async fn test_folder_found_on_second_page() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("{}/page2", server.url());

        let first = server
            .mock("GET", "/me/drive/root/children")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "value": [{"id": "a", "name": "Other", "folder": {}}],
                    "@odata.nextLink": next,
                })
                .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/page2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value":[{"id":"F42","name":"ComfyUI Uploads","folder":{}}]}"#)
            .create_async()
            .await;

        let id = client(&server.url())
            .resolve_or_create_folder("/ComfyUI Uploads")
            .await
            .unwrap();
        assert_eq!(id, "F42");
        first.assert_async().await;
        second.assert_async().await;
    }
}
