// Uploader module - sends batches of encoded images to a cloud drive
//
// The orchestrator in `batch` talks to providers only through the
// `StorageProvider` trait; Google Drive and OneDrive each implement it.

pub mod batch;
pub mod filename;
pub mod google_drive;
pub mod onedrive;
pub mod provider;

pub use batch::{BatchOptions, BatchUploader};
pub use google_drive::{GoogleDriveClient, GoogleDriveEndpoints};
pub use onedrive::{OneDriveClient, OneDriveEndpoints};
pub use provider::{
    build_http_client, HttpConnector, ProviderConnector, StorageProvider, UploadSource,
};
