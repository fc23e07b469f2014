use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use super::filename::{render_file_upload_name, render_filename, unique_suffix};
use super::provider::{ProviderConnector, StorageProvider, UploadSource};
use crate::auth::AccessTokenSource;
use crate::config::{AppPaths, Config};
use crate::errors::{AppError, AppResult};
use crate::image_processor::{encode_image, mime_type_for_path, ImageItem, OutputFormat};
use crate::models::{BatchReport, FolderRef, TextMetadata, UploadResult, UploadTarget};
use crate::security::{InputValidator, ScopedTempFile};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub output_format: OutputFormat,
    pub unique_suffix: bool,
    /// Keep every encoded file here; otherwise a temp file is used and removed.
    pub output_directory: Option<PathBuf>,
    pub temp_dir: PathBuf,
}

impl BatchOptions {
    pub fn from_config(config: &Config, paths: &AppPaths) -> AppResult<Self> {
        Ok(Self {
            output_format: config.output_format()?,
            unique_suffix: config.unique_suffix,
            output_directory: config.output_directory.clone(),
            temp_dir: paths.temp_dir.clone(),
        })
    }
}

/// A connected provider plus the folder every item of this run goes to.
struct Destination {
    provider: Box<dyn StorageProvider>,
    folder_id: String,
}

/// Uploads a batch sequentially, one result per item, in input order.
pub struct BatchUploader {
    options: BatchOptions,
}

impl BatchUploader {
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Encode and upload every image. Configuration and auth problems abort
    /// the run with an empty report; anything else fails only its own item.
    pub async fn run(
        &self,
        items: Vec<ImageItem>,
        target: &UploadTarget,
        metadata: &TextMetadata,
        auth: &dyn AccessTokenSource,
        connector: &dyn ProviderConnector,
        now: DateTime<Utc>,
    ) -> BatchReport {
        if items.is_empty() {
            log::info!("No images to upload");
            return BatchReport::empty();
        }

        if let Err(e) = InputValidator::validate_filename_template(&target.filename_template) {
            return abort(e);
        }

        let destination = match self.connect(target, auth, connector, now).await {
            Ok(destination) => destination,
            Err(e) => return abort(e),
        };

        let total = items.len();
        log::info!(
            "Uploading {} image(s) to {}",
            total,
            target.provider.display_name()
        );

        let mut report = BatchReport::empty();
        for item in items {
            let result = self
                .upload_image(&destination, item, &target.filename_template, metadata)
                .await;
            report.push(result);
        }

        log_summary(&report);
        report
    }

    /// Upload files that are already encoded, such as rendered videos.
    pub async fn run_files(
        &self,
        paths: Vec<PathBuf>,
        target: &UploadTarget,
        auth: &dyn AccessTokenSource,
        connector: &dyn ProviderConnector,
        now: DateTime<Utc>,
    ) -> BatchReport {
        if paths.is_empty() {
            log::info!("No files to upload");
            return BatchReport::empty();
        }

        let destination = match self.connect(target, auth, connector, now).await {
            Ok(destination) => destination,
            Err(e) => return abort(e),
        };

        let mut report = BatchReport::empty();
        for (index, path) in paths.into_iter().enumerate() {
            let result = self.upload_existing_file(&destination, index, &path).await;
            report.push(result);
        }

        log_summary(&report);
        report
    }

    async fn connect(
        &self,
        target: &UploadTarget,
        auth: &dyn AccessTokenSource,
        connector: &dyn ProviderConnector,
        now: DateTime<Utc>,
    ) -> AppResult<Destination> {
        let credential = auth.credential(now).await?;
        if credential.provider != target.provider {
            return Err(AppError::config(format!(
                "Credential is for {} but the target is {}",
                credential.provider.display_name(),
                target.provider.display_name()
            )));
        }

        let provider = connector.connect(&credential)?;
        let folder_id = resolve_folder(provider.as_ref(), &target.folder).await;
        Ok(Destination {
            provider,
            folder_id,
        })
    }

    fn suffix(&self) -> Option<String> {
        self.options.unique_suffix.then(unique_suffix)
    }

    async fn upload_image(
        &self,
        destination: &Destination,
        item: ImageItem,
        template: &str,
        metadata: &TextMetadata,
    ) -> UploadResult {
        let format = self.options.output_format;
        let index = item.index;
        let filename = render_filename(
            template,
            index,
            self.suffix().as_deref(),
            format.extension(),
        );

        let encoded = match encode_image(&item.image, format, metadata) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode image {}: {}", index, e);
                return UploadResult::failure(index, &filename, &e, None);
            }
        };
        drop(item);

        // A temp copy is removed when `staged` drops after the attempt
        let staged = self.stage_local_copy(&filename, format.extension(), &encoded);
        let local_path = staged
            .as_ref()
            .filter(|file| file.is_retained())
            .map(|file| file.path().to_path_buf());
        let source = match &staged {
            Some(file) => UploadSource::Path(file.path().to_path_buf()),
            None => UploadSource::Bytes(encoded),
        };

        let outcome = destination
            .provider
            .upload_file(source, &destination.folder_id, &filename, format.mime_type())
            .await;
        finish_item(index, filename, outcome, local_path)
    }

    fn stage_local_copy(&self, filename: &str, extension: &str, data: &[u8]) -> Option<ScopedTempFile> {
        let staged = match &self.options.output_directory {
            Some(dir) => ScopedTempFile::write_retained(dir, filename, data),
            None => ScopedTempFile::write(&self.options.temp_dir, extension, data),
        };

        match staged {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!(
                    "Could not write local copy of {}: {}. Uploading from memory.",
                    filename,
                    e
                );
                None
            }
        }
    }

    async fn upload_existing_file(
        &self,
        destination: &Destination,
        index: usize,
        path: &Path,
    ) -> UploadResult {
        let filename = render_file_upload_name(path, self.suffix().as_deref());

        if let Err(e) = InputValidator::validate_upload_file(path) {
            log::error!("Skipping {}: {}", path.display(), e);
            return UploadResult::failure(index, &filename, &e, None);
        }

        let outcome = destination
            .provider
            .upload_file(
                UploadSource::Path(path.to_path_buf()),
                &destination.folder_id,
                &filename,
                mime_type_for_path(path),
            )
            .await;
        finish_item(index, filename, outcome, Some(path.to_path_buf()))
    }
}

fn finish_item(
    index: usize,
    filename: String,
    outcome: AppResult<String>,
    local_path: Option<PathBuf>,
) -> UploadResult {
    match outcome {
        Ok(file_id) => UploadResult::success(index, filename, file_id, local_path),
        Err(e) => {
            log::error!("Failed to upload {}: {}", filename, e);
            UploadResult::failure(index, &filename, &e, local_path)
        }
    }
}

/// Folder IDs are used as given; a path that cannot be resolved falls back to
/// the drive root so the batch still lands somewhere.
async fn resolve_folder(provider: &dyn StorageProvider, folder: &FolderRef) -> String {
    match folder {
        FolderRef::Root => provider.root_folder_id(),
        FolderRef::Id(id) => id.clone(),
        FolderRef::Path(path) => match provider.resolve_or_create_folder(path).await {
            Ok(id) => id,
            Err(e) => {
                log::warn!(
                    "Could not resolve folder '{}': {}. Uploading to the {} root instead.",
                    path,
                    e,
                    provider.kind().display_name()
                );
                provider.root_folder_id()
            }
        },
    }
}

fn abort(error: AppError) -> BatchReport {
    log::error!("Upload aborted: {}", error);
    BatchReport::aborted(error.to_string())
}

fn log_summary(report: &BatchReport) {
    log::info!(
        "Upload finished: {} succeeded, {} failed",
        report.succeeded(),
        report.failed()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::models::ProviderKind;
    use async_trait::async_trait;
    use chrono::Duration;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        connects: AtomicUsize,
        folder_lookups: AtomicUsize,
        uploads: Mutex<Vec<(String, String)>>,
    }

    struct MockProvider {
        calls: Arc<Calls>,
        fail_on: Option<usize>,
        folder_fails: bool,
    }

    #[async_trait]
    impl StorageProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OneDrive
        }

        fn root_folder_id(&self) -> String {
            "root".to_string()
        }

        async fn resolve_or_create_folder(&self, _path: &str) -> AppResult<String> {
            self.calls.folder_lookups.fetch_add(1, Ordering::SeqCst);
            if self.folder_fails {
                Err(AppError::upload_failed("folder listing denied", Some(403)))
            } else {
                Ok("F1".to_string())
            }
        }

        async fn upload_file(
            &self,
            source: UploadSource,
            folder_id: &str,
            filename: &str,
            _mime_type: &str,
        ) -> AppResult<String> {
            let bytes = source.into_bytes().await?;
            assert!(!bytes.is_empty());
            self.calls
                .uploads
                .lock()
                .unwrap()
                .push((folder_id.to_string(), filename.to_string()));

            if let Some(fail_on) = self.fail_on {
                if filename.contains(&format!("_{:05}", fail_on)) {
                    return Err(AppError::upload_failed("quota exceeded", Some(507)));
                }
            }
            Ok(format!("id-{}", filename))
        }
    }

    struct MockConnector {
        calls: Arc<Calls>,
        fail_on: Option<usize>,
        folder_fails: bool,
    }

    impl MockConnector {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                calls: Arc::new(Calls::default()),
                fail_on,
                folder_fails: false,
            }
        }
    }

    impl ProviderConnector for MockConnector {
        fn connect(&self, _credential: &Credential) -> AppResult<Box<dyn StorageProvider>> {
            self.calls.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockProvider {
                calls: self.calls.clone(),
                fail_on: self.fail_on,
                folder_fails: self.folder_fails,
            }))
        }
    }

    fn uploader(temp_dir: &Path, output_directory: Option<PathBuf>) -> BatchUploader {
        BatchUploader::new(BatchOptions {
            output_format: OutputFormat::Png,
            unique_suffix: true,
            output_directory,
            temp_dir: temp_dir.to_path_buf(),
        })
    }

    fn images(count: usize) -> Vec<ImageItem> {
        ImageItem::batch(
            (0..count)
                .map(|i| DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, image::Rgb([i as u8, 0, 0]))))
                .collect(),
        )
    }

    fn valid_credential(now: DateTime<Utc>) -> Option<Credential> {
        Some(Credential::new(
            ProviderKind::OneDrive,
            "access",
            Some("refresh".to_string()),
            now + Duration::hours(1),
        ))
    }

    fn target(folder: FolderRef) -> UploadTarget {
        UploadTarget::new(ProviderKind::OneDrive, folder, "out_%batch_num%")
    }

    #[tokio::test]
    async fn test_failed_item_is_isolated_and_order_kept() {
        let temp = tempfile::tempdir().unwrap();
        let connector = MockConnector::new(Some(1));
        let now = Utc::now();

        let report = uploader(temp.path(), None)
            .run(
                images(3),
                &target(FolderRef::from_path("/ComfyUI Uploads")),
                &TextMetadata::new(),
                &valid_credential(now),
                &connector,
                now,
            )
            .await;

        assert_eq!(report.len(), 3);
        assert!(!report.is_aborted());

        let results = &report.results;
        assert!(results[0].success);
        assert!(results[0].filename.starts_with("out_0_00000"));
        assert!(results[0].filename.ends_with(".png"));
        assert!(!results[1].success);
        assert!(results[1].filename.starts_with("out_1_00001"));
        assert!(results[1].filename.ends_with("_FAILED"));
        assert_eq!(results[1].http_status, Some(507));
        assert!(results[2].success);
        assert!(results[2].filename.starts_with("out_2_00002"));
        assert_eq!(
            results.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        assert_eq!(connector.calls.folder_lookups.load(Ordering::SeqCst), 1);
        let uploads = connector.calls.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 3);
        assert!(uploads.iter().all(|(folder, _)| folder == "F1"));
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_calls() {
        let temp = tempfile::tempdir().unwrap();
        let connector = MockConnector::new(None);
        let now = Utc::now();

        let report = uploader(temp.path(), None)
            .run(
                Vec::new(),
                &target(FolderRef::Root),
                &TextMetadata::new(),
                &valid_credential(now),
                &connector,
                now,
            )
            .await;

        assert!(report.is_empty());
        assert!(!report.is_aborted());
        assert_eq!(connector.calls.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_or_expired_credential_aborts_before_uploading() {
        let temp = tempfile::tempdir().unwrap();
        let connector = MockConnector::new(None);
        let now = Utc::now();
        let expired = Some(Credential::new(
            ProviderKind::OneDrive,
            "access",
            None,
            now - Duration::minutes(1),
        ));

        for auth in [None, expired] {
            let report = uploader(temp.path(), None)
                .run(
                    images(2),
                    &target(FolderRef::Root),
                    &TextMetadata::new(),
                    &auth,
                    &connector,
                    now,
                )
                .await;
            assert!(report.is_empty());
            assert!(report.is_aborted());
        }

        assert_eq!(connector.calls.connects.load(Ordering::SeqCst), 0);
        assert!(connector.calls.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_mismatch_aborts() {
        let temp = tempfile::tempdir().unwrap();
        let connector = MockConnector::new(None);
        let now = Utc::now();
        let google = UploadTarget::new(ProviderKind::GoogleDrive, FolderRef::Root, "x");

        let report = uploader(temp.path(), None)
            .run(
                images(1),
                &google,
                &TextMetadata::new(),
                &valid_credential(now),
                &connector,
                now,
            )
            .await;
        assert!(report.is_aborted());
        assert_eq!(connector.calls.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_folder_falls_back_to_root() {
        let temp = tempfile::tempdir().unwrap();
        let mut connector = MockConnector::new(None);
        connector.folder_fails = true;
        let now = Utc::now();

        let report = uploader(temp.path(), None)
            .run(
                images(1),
                &target(FolderRef::from_path("Renders")),
                &TextMetadata::new(),
                &valid_credential(now),
                &connector,
                now,
            )
            .await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(connector.calls.uploads.lock().unwrap()[0].0, "root");
    }

    #[tokio::test]
    async fn test_temp_copies_removed_and_output_copies_kept() {
        let temp = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let connector = MockConnector::new(Some(0));
        let now = Utc::now();

        let report = uploader(temp.path(), None)
            .run(
                images(2),
                &target(FolderRef::Root),
                &TextMetadata::new(),
                &valid_credential(now),
                &connector,
                now,
            )
            .await;
        assert_eq!(report.len(), 2);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);

        let report = uploader(temp.path(), Some(output.path().to_path_buf()))
            .run(
                images(2),
                &target(FolderRef::Root),
                &TextMetadata::new(),
                &valid_credential(now),
                &connector,
                now,
            )
            .await;
        for result in &report.results {
            let kept = result.local_path.as_ref().unwrap();
            assert!(kept.exists());
        }
        assert_eq!(std::fs::read_dir(output.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_run_files_reports_missing_file_per_item() {
        let temp = tempfile::tempdir().unwrap();
        let video = temp.path().join("clip.mp4");
        std::fs::write(&video, b"fake mp4").unwrap();
        let connector = MockConnector::new(None);
        let now = Utc::now();

        let report = uploader(temp.path(), None)
            .run_files(
                vec![video, temp.path().join("gone.webm")],
                &target(FolderRef::from_id("F9")),
                &valid_credential(now),
                &connector,
                now,
            )
            .await;

        assert_eq!(report.len(), 2);
        assert!(report.results[0].success);
        assert!(report.results[0].filename.starts_with("clip_"));
        assert!(report.results[0].filename.ends_with(".mp4"));
        assert!(!report.results[1].success);
        assert!(report.results[1].filename.ends_with("_FAILED"));
        assert_eq!(connector.calls.uploads.lock().unwrap()[0].0, "F9");
    }
}
