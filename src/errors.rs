use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Upload failed: {reason}")]
    UploadFailed {
        reason: String,
        http_status: Option<u16>,
    },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn upload_failed(reason: impl Into<String>, http_status: Option<u16>) -> Self {
        Self::UploadFailed {
            reason: reason.into(),
            http_status,
        }
    }

    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::FileNotFound {
            path: path.to_string(),
        }
    }

    /// Errors that abort a whole batch before any item is attempted.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::Auth(_))
    }

    /// HTTP status attached to the failure, when the provider answered at all.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            AppError::UploadFailed { http_status, .. } => *http_status,
            AppError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Turn a non-success provider response into an `UploadFailed` error,
/// keeping the body around for the log.
pub async fn upload_error_from_response(context: &str, response: reqwest::Response) -> AppError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    log::debug!(
        "{} failed with {} (first 300 chars): {}",
        context,
        status,
        &body[..floor_char_boundary(&body, 300)]
    );

    AppError::upload_failed(
        format!("{} returned {}: {}", context, status, body.trim()),
        Some(status.as_u16()),
    )
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_fatal_classification() {
        assert!(AppError::config("missing credentials.json").is_batch_fatal());
        assert!(AppError::auth("token expired").is_batch_fatal());
        assert!(!AppError::upload_failed("boom", Some(500)).is_batch_fatal());
        assert!(!AppError::validation("filename", "empty").is_batch_fatal());
    }

    #[test]
    fn test_http_status_is_carried() {
        assert_eq!(
            AppError::upload_failed("quota", Some(403)).http_status(),
            Some(403)
        );
        assert_eq!(AppError::upload_failed("io", None).http_status(), None);
        assert_eq!(AppError::auth("nope").http_status(), None);
    }

    #[test]
    fn test_floor_char_boundary_handles_multibyte() {
        let s = "ééé";
        assert_eq!(floor_char_boundary(s, 3), 2);
        assert_eq!(floor_char_boundary(s, 100), s.len());
    }
}
