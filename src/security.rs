use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::{AppError, AppResult};

/// Longest filename any provider accepts without complaint.
const MAX_FILENAME_LEN: usize = 255;

fn unsafe_filename_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("static filename regex"))
}

pub struct InputValidator;

impl InputValidator {
    pub fn sanitize_filename(filename: &str) -> String {
        // Remove or replace unsafe characters in filenames
        let sanitized = unsafe_filename_chars().replace_all(filename.trim(), "_");

        if sanitized.len() > MAX_FILENAME_LEN {
            let mut end = MAX_FILENAME_LEN - 3;
            while !sanitized.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &sanitized[..end])
        } else {
            sanitized.to_string()
        }
    }

    pub fn validate_filename_template(template: &str) -> AppResult<()> {
        let trimmed = template.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation(
                "filename_template",
                "Filename template cannot be empty",
            ));
        }

        if trimmed.len() > 200 {
            return Err(AppError::validation(
                "filename_template",
                "Filename template too long (max 200 characters)",
            ));
        }

        Ok(())
    }

    pub fn validate_folder_path(path: &str) -> AppResult<()> {
        if path.len() > 400 {
            return Err(AppError::validation("folder", "Folder path too long"));
        }

        if path.split('/').any(|segment| segment == "..") {
            return Err(AppError::validation("folder", "Invalid folder path detected"));
        }

        Ok(())
    }

    /// PNG text keywords: 1-79 Latin-1 printable bytes, no leading, trailing
    /// or doubled spaces.
    pub fn validate_text_keyword(keyword: &str) -> AppResult<()> {
        if keyword.is_empty() || keyword.len() > 79 {
            return Err(AppError::validation("keyword", "Keyword must be 1-79 bytes"));
        }

        let printable = keyword
            .chars()
            .all(|c| matches!(c as u32, 32..=126 | 161..=255));
        if !printable
            || keyword.starts_with(' ')
            || keyword.ends_with(' ')
            || keyword.contains("  ")
        {
            return Err(AppError::validation(
                "keyword",
                "Keyword must be printable Latin-1 without stray spaces",
            ));
        }

        Ok(())
    }

    pub fn validate_upload_file(path: &Path) -> AppResult<u64> {
        let display = path.to_string_lossy();
        if !path.exists() {
            return Err(AppError::file_not_found(&display));
        }
        if !path.is_file() {
            return Err(AppError::validation("file_path", "Path is not a file"));
        }
        Ok(std::fs::metadata(path)?.len())
    }
}

// File system security utilities
pub struct FileSystemGuard;

impl FileSystemGuard {
    pub fn create_secure_temp_file(temp_dir: &Path, extension: &str) -> AppResult<PathBuf> {
        std::fs::create_dir_all(temp_dir)?;

        // Generate secure random filename
        let random_name = uuid::Uuid::new_v4().to_string();
        let extension = if extension.is_empty() { "tmp" } else { extension };

        Ok(temp_dir.join(format!("{}.{}", random_name, extension)))
    }

    pub fn cleanup_temp_files(temp_dir: &Path) -> AppResult<()> {
        if temp_dir.exists() {
            std::fs::remove_dir_all(temp_dir)?;
        }
        Ok(())
    }
}

/// A file that lives for one item's encode-then-upload window. Removed on
/// drop unless `retain` was requested.
#[derive(Debug)]
pub struct ScopedTempFile {
    path: PathBuf,
    retain: bool,
}

impl ScopedTempFile {
    pub fn write(temp_dir: &Path, extension: &str, data: &[u8]) -> AppResult<Self> {
        let path = FileSystemGuard::create_secure_temp_file(temp_dir, extension)?;
        std::fs::write(&path, data)?;
        Ok(Self {
            path,
            retain: false,
        })
    }

    /// Write to a caller-chosen location that is kept after the upload.
    pub fn write_retained(dir: &Path, filename: &str, data: &[u8]) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(filename);
        std::fs::write(&path, data)?;
        Ok(Self { path, retain: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_retained(&self) -> bool {
        self.retain
    }
}

impl Drop for ScopedTempFile {
    fn drop(&mut self) {
        if self.retain {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove temporary file {}: {}",
                    self.path.display(),
                    e
                );
            }
        } else {
            log::debug!("Removed temporary file: {}", self.path.display());
        }
    }
}
