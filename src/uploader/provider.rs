use async_trait::async_trait;
use std::path::PathBuf;
use tokio::time::Duration;

use super::google_drive::{GoogleDriveClient, GoogleDriveEndpoints};
use super::onedrive::{OneDriveClient, OneDriveEndpoints};
use crate::auth::Credential;
use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::models::ProviderKind;

/// Bytes to upload, either already in memory or in a local file.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

impl UploadSource {
    pub async fn into_bytes(self) -> AppResult<Vec<u8>> {
        match self {
            UploadSource::Bytes(bytes) => Ok(bytes),
            UploadSource::Path(path) => tokio::fs::read(&path).await.map_err(|e| {
                AppError::upload_failed(
                    format!("Failed to read {}: {}", path.display(), e),
                    None,
                )
            }),
        }
    }
}

/// The operations every storage backend offers. Implementations never retry.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// ID that addresses the drive root in upload calls.
    fn root_folder_id(&self) -> String;

    /// Reuse the folder named after the path's leaf directly under the root,
    /// or create it once.
    async fn resolve_or_create_folder(&self, path: &str) -> AppResult<String>;

    /// Upload one file and return the provider-assigned file ID.
    async fn upload_file(
        &self,
        source: UploadSource,
        folder_id: &str,
        filename: &str,
        mime_type: &str,
    ) -> AppResult<String>;
}

/// Last non-empty segment of a folder path; `None` means the root.
pub fn folder_leaf_name(path: &str) -> Option<&str> {
    path.trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|leaf| !leaf.is_empty())
}

/// Builds a provider client for a credential.
pub trait ProviderConnector: Send + Sync {
    fn connect(&self, credential: &Credential) -> AppResult<Box<dyn StorageProvider>>;
}

/// Shared HTTP client honoring the proxy and timeout settings.
pub fn build_http_client(config: &Config) -> AppResult<reqwest::Client> {
    let mut builder =
        reqwest::Client::builder().timeout(Duration::from_secs(config.request_timeout_secs));

    if let Some(proxy_url) = config.proxy_url.as_deref().filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| AppError::config(format!("Invalid proxy URL '{}': {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
        log::info!("Routing provider traffic through proxy {}", proxy_url);
    }

    builder
        .build()
        .map_err(|e| AppError::config(format!("Failed to build HTTP client: {}", e)))
}

/// Connects to the real Google Drive and Microsoft Graph APIs.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    google: GoogleDriveEndpoints,
    onedrive: OneDriveEndpoints,
}

impl HttpConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            google: GoogleDriveEndpoints::default(),
            onedrive: OneDriveEndpoints::default(),
        }
    }

    pub fn with_google_endpoints(mut self, endpoints: GoogleDriveEndpoints) -> Self {
        self.google = endpoints;
        self
    }

    pub fn with_onedrive_endpoints(mut self, endpoints: OneDriveEndpoints) -> Self {
        self.onedrive = endpoints;
        self
    }
}

impl ProviderConnector for HttpConnector {
    fn connect(&self, credential: &Credential) -> AppResult<Box<dyn StorageProvider>> {
        let token = credential.bearer()?.to_string();
        Ok(match credential.provider {
            ProviderKind::GoogleDrive => Box::new(GoogleDriveClient::new(
                self.http.clone(),
                token,
                self.google.clone(),
            )),
            ProviderKind::OneDrive => Box::new(OneDriveClient::new(
                self.http.clone(),
                token,
                self.onedrive.clone(),
            )),
        })
    }
}
