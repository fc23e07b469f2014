use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, AppResult};
use crate::image_processor::OutputFormat;
use crate::models::ProviderKind;

const APP_DIR_NAME: &str = "Cloud Drive Uploader";

/// Values shipped in the sample credentials file; treated as "not configured".
const PLACEHOLDER_MARKER: &str = "PLACEHOLDER";

/// Where settings, app registrations, tokens and scratch files live.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl AppPaths {
    /// Platform directories, e.g. `~/.config/Cloud Drive Uploader`.
    pub fn discover() -> AppResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::config("Could not find config directory"))?
            .join(APP_DIR_NAME);
        let data_dir = dirs::data_dir()
            .ok_or_else(|| AppError::config("Could not find data directory"))?
            .join(APP_DIR_NAME);

        Ok(Self {
            config_dir,
            data_dir,
            temp_dir: std::env::temp_dir().join("cloud_drive_uploader"),
        })
    }

    /// Everything under one root; used by `--config-dir` and tests.
    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.to_path_buf(),
            data_dir: root.join("data"),
            temp_dir: root.join("tmp"),
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.config_dir.join("credentials.json")
    }

    pub fn token_file(&self, provider: ProviderKind) -> PathBuf {
        self.data_dir.join(format!("{}_token.json", provider.as_str()))
    }

    pub fn ensure_dirs(&self) -> AppResult<()> {
        fs::create_dir_all(&self.config_dir)?;
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub filename_template: String,
    pub google_drive_folder_id: String,
    pub onedrive_folder_path: String,
    pub output_format: String,
    pub jpeg_quality: u8,
    pub unique_suffix: bool,
    pub output_directory: Option<PathBuf>,
    pub proxy_url: Option<String>,
    pub request_timeout_secs: u64,
    pub temp_cleanup_days: u32,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filename_template: "CloudUpload".to_string(),
            google_drive_folder_id: String::new(),
            onedrive_folder_path: "/ComfyUI Uploads".to_string(),
            output_format: "png".to_string(),
            jpeg_quality: 90,
            unique_suffix: true,
            output_directory: None,
            proxy_url: None,
            request_timeout_secs: 120,
            temp_cleanup_days: 7,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn output_format(&self) -> AppResult<OutputFormat> {
        OutputFormat::parse(&self.output_format, self.jpeg_quality)
    }

    /// Verbosity from the settings file; unknown names fall back to info.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

pub fn load_config(paths: &AppPaths) -> AppResult<Config> {
    let config_path = paths.settings_file();

    if config_path.exists() {
        let config_str = fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            Config::default()
        });

        validate_config(&config)?;
        Ok(config)
    } else {
        let default_config = Config::default();
        save_config_internal(paths, &default_config)?;
        Ok(default_config)
    }
}

pub fn save_config(paths: &AppPaths, config: &Config) -> AppResult<()> {
    validate_config(config)?;
    save_config_internal(paths, config)
}

fn save_config_internal(paths: &AppPaths, config: &Config) -> AppResult<()> {
    fs::create_dir_all(&paths.config_dir)?;
    let config_path = paths.settings_file();

    // Create backup of existing config
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(&config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(&config_path, config_str)?;

    log::info!("Configuration saved to {}", config_path.display());
    Ok(())
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    if config.filename_template.trim().is_empty() {
        return Err(AppError::validation(
            "filename_template",
            "Must not be empty",
        ));
    }

    if config.jpeg_quality == 0 || config.jpeg_quality > 100 {
        return Err(AppError::validation("jpeg_quality", "Must be between 1 and 100"));
    }

    if config.request_timeout_secs == 0 || config.request_timeout_secs > 3600 {
        return Err(AppError::validation(
            "request_timeout_secs",
            "Must be between 1 and 3600",
        ));
    }

    if config.temp_cleanup_days == 0 {
        return Err(AppError::validation("temp_cleanup_days", "Must be greater than 0"));
    }

    let valid_formats = ["png", "jpeg", "jpg", "webp"];
    if !valid_formats.contains(&config.output_format.to_ascii_lowercase().as_str()) {
        return Err(AppError::validation(
            "output_format",
            "Must be 'png', 'jpeg' or 'webp'",
        ));
    }

    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation("log_level", "Must be a valid log level"));
    }

    if let Some(proxy) = &config.proxy_url {
        if !(proxy.starts_with("http://") || proxy.starts_with("https://")) {
            return Err(AppError::validation(
                "proxy_url",
                "Must start with http:// or https://",
            ));
        }
    }

    Ok(())
}

/// Static OAuth app registration for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderApp {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Google only: authenticate as a service account instead of a user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_key_file: Option<PathBuf>,
}

impl ProviderApp {
    pub fn uses_service_account(&self) -> bool {
        self.service_account_key_file.is_some()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    google_drive: Option<ProviderApp>,
    #[serde(default)]
    onedrive: Option<ProviderApp>,
}

fn is_unset(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.to_ascii_uppercase().contains(PLACEHOLDER_MARKER)
}

/// Load the app registration for `provider`. Any problem here is fatal for
/// the run and surfaces before the first network call.
pub fn load_provider_app(paths: &AppPaths, provider: ProviderKind) -> AppResult<ProviderApp> {
    let path = paths.credentials_file();
    if !path.exists() {
        return Err(AppError::config(format!(
            "Credentials file not found at {}",
            path.display()
        )));
    }

    let contents = fs::read_to_string(&path)?;
    let file: CredentialsFile = serde_json::from_str(&contents).map_err(|e| {
        AppError::config(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    let app = match provider {
        ProviderKind::GoogleDrive => file.google_drive,
        ProviderKind::OneDrive => file.onedrive,
    }
    .ok_or_else(|| {
        AppError::config(format!(
            "No '{}' section in {}",
            provider.as_str(),
            path.display()
        ))
    })?;

    if let Some(key_file) = &app.service_account_key_file {
        if provider != ProviderKind::GoogleDrive {
            return Err(AppError::config(
                "service_account_key_file is only supported for google_drive",
            ));
        }
        let resolved = if key_file.is_relative() {
            paths.config_dir.join(key_file)
        } else {
            key_file.clone()
        };
        if !resolved.exists() {
            return Err(AppError::config(format!(
                "Service account key file not found at {}",
                resolved.display()
            )));
        }
        return Ok(ProviderApp {
            service_account_key_file: Some(resolved),
            ..app
        });
    }

    if is_unset(&app.client_id) {
        return Err(AppError::config(format!(
            "{} client_id in {} is missing or still a placeholder",
            provider.display_name(),
            path.display()
        )));
    }

    // Google always needs the secret; Microsoft public clients may omit it.
    if provider == ProviderKind::GoogleDrive && is_unset(&app.client_secret) {
        return Err(AppError::config(format!(
            "Google Drive client_secret in {} is missing or still a placeholder",
            path.display()
        )));
    }

    Ok(app)
}

/// Remove files older than `days` from `directory`, non-recursively.
pub fn cleanup_old_files(directory: &Path, days: u32) -> AppResult<usize> {
    if !directory.exists() {
        return Ok(0);
    }

    let cutoff_time =
        std::time::SystemTime::now() - std::time::Duration::from_secs((days as u64) * 24 * 60 * 60);
    let mut removed = 0;

    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if modified < cutoff_time {
                    if let Err(e) = fs::remove_file(&path) {
                        log::warn!("Failed to remove old file {}: {}", path.display(), e);
                    } else {
                        log::debug!("Removed old file: {}", path.display());
                        removed += 1;
                    }
                }
            }
        }
    }

    Ok(removed)
}
