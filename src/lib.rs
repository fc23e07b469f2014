pub mod auth;
pub mod commands;
pub mod config;
pub mod errors;
pub mod image_processor;
pub mod models;
pub mod security;
pub mod uploader;

pub use errors::{AppError, AppResult};
pub use models::{BatchReport, FolderRef, ProviderKind, TextMetadata, UploadResult, UploadTarget};
