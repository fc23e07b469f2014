use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::auth::{
    AccessTokenSource, Credential, CredentialStore, OAuthClient, ServiceAccountAuth,
    ServiceAccountKey, TokenManager,
};
use crate::config::{self, AppPaths, Config};
use crate::errors::{AppError, AppResult};
use crate::image_processor::{self, ImageItem, OutputFormat};
use crate::models::{BatchReport, FolderRef, ProviderKind, TextMetadata, UploadTarget};
use crate::security::{FileSystemGuard, InputValidator};
use crate::uploader::{build_http_client, BatchOptions, BatchUploader, HttpConnector};

/// Loaded settings plus the shared HTTP client for one invocation.
pub struct AppContext {
    pub paths: AppPaths,
    pub config: Config,
    pub http: reqwest::Client,
}

impl AppContext {
    pub fn load(paths: AppPaths) -> AppResult<Self> {
        paths.ensure_dirs()?;
        let config = config::load_config(&paths)?;
        let http = build_http_client(&config)?;
        Ok(Self {
            paths,
            config,
            http,
        })
    }

    pub fn credential_store(&self, provider: ProviderKind) -> CredentialStore {
        CredentialStore::new(provider, self.paths.token_file(provider))
    }

    fn oauth_client(&self, provider: ProviderKind) -> AppResult<OAuthClient> {
        let app = config::load_provider_app(&self.paths, provider)?;
        Ok(OAuthClient::new(self.http.clone(), provider, app))
    }

    /// Service account when one is configured for Google, stored user tokens
    /// otherwise.
    pub fn token_source(&self, provider: ProviderKind) -> AppResult<TokenSource> {
        let app = config::load_provider_app(&self.paths, provider)?;

        if let Some(key_file) = &app.service_account_key_file {
            let key = ServiceAccountKey::from_file(key_file)?;
            let auth = ServiceAccountAuth::new(self.http.clone(), key);
            log::info!("Using service account {}", auth.client_email());
            return Ok(TokenSource::ServiceAccount(auth));
        }

        let oauth = OAuthClient::new(self.http.clone(), provider, app);
        Ok(TokenSource::User(TokenManager::new(
            self.credential_store(provider),
            oauth,
        )))
    }
}

pub enum TokenSource {
    User(TokenManager),
    ServiceAccount(ServiceAccountAuth),
}

#[async_trait]
impl AccessTokenSource for TokenSource {
    async fn credential(&self, now: DateTime<Utc>) -> AppResult<Credential> {
        match self {
            TokenSource::User(manager) => manager.credential(now).await,
            TokenSource::ServiceAccount(auth) => auth.credential(now).await,
        }
    }
}

/// Run the device-code flow and store the resulting token.
pub async fn authenticate(ctx: &AppContext, provider: ProviderKind) -> AppResult<Credential> {
    let app = config::load_provider_app(&ctx.paths, provider)?;
    if app.uses_service_account() {
        return Err(AppError::config(
            "Google Drive is configured for a service account; no interactive login is needed",
        ));
    }

    let oauth = ctx.oauth_client(provider)?;
    let device_code = oauth.request_device_code().await?;
    println!("{}", device_code.instructions(provider.display_name()));

    let credential = oauth.poll_for_token(&device_code, Utc::now).await?;
    ctx.credential_store(provider).save(&credential)?;
    log::info!("{} authentication successful", provider.display_name());
    Ok(credential)
}

/// Everything the upload commands take from the command line.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub inputs: Vec<PathBuf>,
    pub folder: Option<FolderRef>,
    pub template: Option<String>,
    pub metadata: Vec<String>,
    pub format: Option<String>,
    pub output_dir: Option<PathBuf>,
}

impl UploadRequest {
    fn target(&self, ctx: &AppContext, provider: ProviderKind) -> AppResult<UploadTarget> {
        let folder = match &self.folder {
            Some(folder) => folder.clone(),
            None => default_folder(&ctx.config, provider),
        };
        if let FolderRef::Path(path) = &folder {
            InputValidator::validate_folder_path(path)?;
        }

        let template = self
            .template
            .as_deref()
            .unwrap_or(&ctx.config.filename_template);
        InputValidator::validate_filename_template(template)?;

        Ok(UploadTarget::new(provider, folder, template))
    }

    fn batch_options(&self, ctx: &AppContext) -> AppResult<BatchOptions> {
        let mut options = BatchOptions::from_config(&ctx.config, &ctx.paths)?;
        if let Some(format) = &self.format {
            options.output_format = OutputFormat::parse(format, ctx.config.jpeg_quality)?;
        }
        if let Some(dir) = &self.output_dir {
            options.output_directory = Some(dir.clone());
        }
        Ok(options)
    }
}

fn default_folder(config: &Config, provider: ProviderKind) -> FolderRef {
    match provider {
        ProviderKind::GoogleDrive if !config.google_drive_folder_id.trim().is_empty() => {
            FolderRef::from_id(config.google_drive_folder_id.trim())
        }
        ProviderKind::GoogleDrive => FolderRef::Root,
        ProviderKind::OneDrive => FolderRef::from_path(&config.onedrive_folder_path),
    }
}

/// Parse `key=value` pairs into ordered text metadata.
pub fn parse_metadata(pairs: &[String]) -> AppResult<TextMetadata> {
    let mut metadata = TextMetadata::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| AppError::validation("meta", "Expected key=value"))?;
        InputValidator::validate_text_keyword(key)?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// Load and upload image files. Setup problems that the batch itself would
/// treat as fatal come back as an aborted report.
pub async fn upload_images(
    ctx: &AppContext,
    provider: ProviderKind,
    request: &UploadRequest,
) -> AppResult<BatchReport> {
    if request.inputs.is_empty() {
        return Err(AppError::validation("images", "No files provided"));
    }

    let target = request.target(ctx, provider)?;
    let metadata = parse_metadata(&request.metadata)?;
    let uploader = BatchUploader::new(request.batch_options(ctx)?);

    let mut items = Vec::with_capacity(request.inputs.len());
    for (index, path) in request.inputs.iter().enumerate() {
        InputValidator::validate_upload_file(path)?;
        items.push(ImageItem::new(index, image_processor::load_image(path)?));
    }

    let auth = match ctx.token_source(provider) {
        Ok(auth) => auth,
        Err(e) => return Ok(setup_aborted(e)),
    };
    let connector = HttpConnector::new(ctx.http.clone());

    Ok(uploader
        .run(items, &target, &metadata, &auth, &connector, Utc::now())
        .await)
}

/// Upload files as they are, without decoding or re-encoding.
pub async fn upload_files(
    ctx: &AppContext,
    provider: ProviderKind,
    request: &UploadRequest,
) -> AppResult<BatchReport> {
    if request.inputs.is_empty() {
        return Err(AppError::validation("files", "No files provided"));
    }

    let target = request.target(ctx, provider)?;
    let uploader = BatchUploader::new(request.batch_options(ctx)?);

    let auth = match ctx.token_source(provider) {
        Ok(auth) => auth,
        Err(e) => return Ok(setup_aborted(e)),
    };
    let connector = HttpConnector::new(ctx.http.clone());

    Ok(uploader
        .run_files(
            request.inputs.clone(),
            &target,
            &auth,
            &connector,
            Utc::now(),
        )
        .await)
}

fn setup_aborted(error: AppError) -> BatchReport {
    log::error!("Upload aborted: {}", error);
    BatchReport::aborted(error.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenStatus {
    pub provider: ProviderKind,
    pub token_file: PathBuf,
    pub present: bool,
    pub valid: bool,
    pub refreshable: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

pub fn status(ctx: &AppContext, provider: ProviderKind) -> AppResult<TokenStatus> {
    let store = ctx.credential_store(provider);
    let credential = store.load()?;
    let now = Utc::now();

    Ok(TokenStatus {
        provider,
        token_file: store.path().to_path_buf(),
        present: credential.is_some(),
        valid: credential.as_ref().map(|c| c.is_valid(now)).unwrap_or(false),
        refreshable: credential.as_ref().map(|c| c.can_refresh()).unwrap_or(false),
        expires_at: credential.map(|c| c.expires_at),
    })
}

pub fn logout(ctx: &AppContext, provider: ProviderKind) -> AppResult<bool> {
    let removed = ctx.credential_store(provider).clear()?;
    if removed {
        log::info!("{} token removed", provider.display_name());
    } else {
        log::info!("No {} token to remove", provider.display_name());
    }
    Ok(removed)
}

/// Prune stale scratch files. `days == 0` wipes the temp directory.
pub fn cleanup(ctx: &AppContext, days: Option<u32>) -> AppResult<usize> {
    let temp_dir = &ctx.paths.temp_dir;
    match days.unwrap_or(ctx.config.temp_cleanup_days) {
        0 => {
            let count = std::fs::read_dir(temp_dir).map(|d| d.count()).unwrap_or(0);
            FileSystemGuard::cleanup_temp_files(temp_dir)?;
            Ok(count)
        }
        days => config::cleanup_old_files(temp_dir, days),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn context(root: &std::path::Path) -> AppContext {
        AppContext::load(AppPaths::under(root)).unwrap()
    }

    #[test]
    fn test_parse_metadata() {
        let metadata =
            parse_metadata(&["prompt=a cat=on a mat".to_string(), "seed=42".to_string()]).unwrap();
        assert_eq!(metadata.get("prompt"), Some("a cat=on a mat"));
        assert_eq!(metadata.get("seed"), Some("42"));

        assert!(parse_metadata(&["novalue".to_string()]).is_err());
        assert!(parse_metadata(&[" bad=x".to_string()]).is_err());
    }

    #[test]
    fn test_default_folders() {
        let mut config = Config::default();
        assert_eq!(
            default_folder(&config, ProviderKind::OneDrive),
            FolderRef::from_path("/ComfyUI Uploads")
        );
        assert_eq!(default_folder(&config, ProviderKind::GoogleDrive), FolderRef::Root);

        config.google_drive_folder_id = "abc".to_string();
        assert_eq!(
            default_folder(&config, ProviderKind::GoogleDrive),
            FolderRef::from_id("abc")
        );
    }

    #[test]
    fn test_status_and_logout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let status_before = status(&ctx, ProviderKind::OneDrive).unwrap();
        assert!(!status_before.present);
        assert!(!logout(&ctx, ProviderKind::OneDrive).unwrap());

        let credential = Credential::new(
            ProviderKind::OneDrive,
            "a",
            Some("r".to_string()),
            Utc::now() + Duration::hours(1),
        );
        ctx.credential_store(ProviderKind::OneDrive)
            .save(&credential)
            .unwrap();

        let status_after = status(&ctx, ProviderKind::OneDrive).unwrap();
        assert!(status_after.present && status_after.valid && status_after.refreshable);
        assert!(logout(&ctx, ProviderKind::OneDrive).unwrap());
        assert!(!status(&ctx, ProviderKind::OneDrive).unwrap().present);
    }

    #[tokio::test]
    async fn test_missing_credentials_file_aborts_upload() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let image_path = dir.path().join("in.png");
        image::RgbImage::new(2, 2).save(&image_path).unwrap();

        let request = UploadRequest {
            inputs: vec![image_path],
            ..UploadRequest::default()
        };
        let report = upload_images(&ctx, ProviderKind::OneDrive, &request)
            .await
            .unwrap();
        assert!(report.is_aborted());
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_image_is_rejected_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let request = UploadRequest {
            inputs: vec![dir.path().join("missing.png")],
            ..UploadRequest::default()
        };
        let err = upload_images(&ctx, ProviderKind::OneDrive, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::FileNotFound { .. }));
    }

    #[test]
    fn test_cleanup_wipes_temp_dir_with_zero_days() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        std::fs::create_dir_all(&ctx.paths.temp_dir).unwrap();
        std::fs::write(ctx.paths.temp_dir.join("a.png"), b"x").unwrap();

        assert_eq!(cleanup(&ctx, Some(0)).unwrap(), 1);
        assert!(!ctx.paths.temp_dir.exists());
        assert_eq!(cleanup(&ctx, None).unwrap(), 0);
    }
}
