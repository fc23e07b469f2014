use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::AppError;

/// Suffix appended to the filename of every item that failed to upload.
pub const FAILED_SUFFIX: &str = "_FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GoogleDrive,
    #[serde(rename = "onedrive", alias = "one_drive")]
    OneDrive,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "google_drive",
            ProviderKind::OneDrive => "onedrive",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "Google Drive",
            ProviderKind::OneDrive => "OneDrive",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "google_drive" | "gdrive" | "google" => Ok(ProviderKind::GoogleDrive),
            "onedrive" | "one_drive" => Ok(ProviderKind::OneDrive),
            other => Err(AppError::validation(
                "provider",
                &format!("Unknown provider '{}'", other),
            )),
        }
    }
}

/// Where uploaded files land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderRef {
    Root,
    /// Provider-assigned folder ID, used as-is.
    Id(String),
    /// Folder path; its leaf name is resolved (or created) under the root.
    Path(String),
}

impl FolderRef {
    pub fn from_path(path: &str) -> Self {
        let trimmed = path.trim();
        if trimmed.is_empty() || trimmed.trim_matches('/').is_empty() {
            FolderRef::Root
        } else {
            FolderRef::Path(trimmed.to_string())
        }
    }

    pub fn from_id(id: &str) -> Self {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            FolderRef::Root
        } else {
            FolderRef::Id(trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub provider: ProviderKind,
    pub folder: FolderRef,
    pub filename_template: String,
}

impl UploadTarget {
    pub fn new(provider: ProviderKind, folder: FolderRef, filename_template: &str) -> Self {
        Self {
            provider,
            folder,
            filename_template: filename_template.to_string(),
        }
    }
}

/// Ordered key/value pairs embedded into encoded images as text chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextMetadata {
    entries: Vec<(String, String)>,
}

impl TextMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a text entry, keeping first-insertion order.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    /// Serialize a JSON value as the entry text.
    pub fn insert_json(&mut self, key: &str, value: &serde_json::Value) {
        self.insert(key, value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of one batch item. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadResult {
    pub index: usize,
    pub filename: String,
    pub success: bool,
    pub file_id: Option<String>,
    pub error: Option<String>,
    pub http_status: Option<u16>,
    pub local_path: Option<PathBuf>,
}

impl UploadResult {
    pub fn success(
        index: usize,
        filename: String,
        file_id: String,
        local_path: Option<PathBuf>,
    ) -> Self {
        Self {
            index,
            filename,
            success: true,
            file_id: Some(file_id),
            error: None,
            http_status: None,
            local_path,
        }
    }

    pub fn failure(
        index: usize,
        filename: &str,
        error: &AppError,
        local_path: Option<PathBuf>,
    ) -> Self {
        Self {
            index,
            filename: format!("{}{}", filename, FAILED_SUFFIX),
            success: false,
            file_id: None,
            error: Some(error.to_string()),
            http_status: error.http_status(),
            local_path,
        }
    }
}

/// One entry of the host preview panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewEntry {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Per-item outcomes in input order. A batch-level abort leaves `results`
/// empty and records why in `aborted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub results: Vec<UploadResult>,
    pub aborted: Option<String>,
}

impl BatchReport {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            aborted: Some(reason.into()),
        }
    }

    pub fn push(&mut self, result: UploadResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn preview_entries(&self) -> Vec<PreviewEntry> {
        self.results
            .iter()
            .map(|r| PreviewEntry {
                filename: r.filename.clone(),
                subfolder: String::new(),
                kind: "output".to_string(),
            })
            .collect()
    }

    /// Payload in the shape the host expects from an output node.
    pub fn to_preview(&self) -> serde_json::Value {
        serde_json::json!({ "ui": { "images": self.preview_entries() } })
    }
}
