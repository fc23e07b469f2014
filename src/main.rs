use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use cloud_drive_uploader::commands::{self, AppContext, UploadRequest};
use cloud_drive_uploader::config::AppPaths;
use cloud_drive_uploader::{BatchReport, FolderRef, ProviderKind};

#[derive(Parser)]
#[command(name = "cloud-drive-uploader", version, about)]
struct Cli {
    /// Keep settings, credentials and tokens under this directory
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with the device-code flow and store the token
    Auth { provider: ProviderKind },
    /// Encode images and upload them
    Upload {
        provider: ProviderKind,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[command(flatten)]
        options: UploadArgs,
        /// png, jpeg or webp
        #[arg(long)]
        format: Option<String>,
        /// Text metadata to embed, as key=value
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Upload files as they are (videos, pre-encoded images)
    UploadFiles {
        provider: ProviderKind,
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        options: UploadArgs,
    },
    /// Show the stored token state
    Status { provider: ProviderKind },
    /// Delete the stored token
    Logout { provider: ProviderKind },
    /// Remove stale temporary files
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Args)]
struct UploadArgs {
    /// Folder path; its last segment is found or created under the root
    #[arg(long, conflicts_with = "folder_id")]
    folder: Option<String>,
    /// Provider folder ID, used as-is
    #[arg(long)]
    folder_id: Option<String>,
    /// Filename template; %batch_num% is replaced with the item index
    #[arg(long)]
    template: Option<String>,
    /// Also keep every encoded file in this directory
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl UploadArgs {
    fn into_request(self, inputs: Vec<PathBuf>) -> UploadRequest {
        let folder = match (self.folder, self.folder_id) {
            (Some(path), _) => Some(FolderRef::from_path(&path)),
            (None, Some(id)) => Some(FolderRef::from_id(&id)),
            (None, None) => None,
        };
        UploadRequest {
            inputs,
            folder,
            template: self.template,
            output_dir: self.output_dir,
            ..UploadRequest::default()
        }
    }
}

/// Start logging at info so messages from loading the settings are kept.
/// Returns whether RUST_LOG is in charge of the filter.
fn init_logging() -> bool {
    let from_env = std::env::var_os("RUST_LOG").is_some();
    if from_env {
        env_logger::Builder::from_default_env().init();
    } else {
        // Let every record through env_logger; the global max level decides
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Trace)
            .init();
        log::set_max_level(log::LevelFilter::Info);
    }
    from_env
}

fn print_report(report: &BatchReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&report.to_preview())?);
    if let Some(reason) = &report.aborted {
        anyhow::bail!("Upload aborted: {}", reason);
    }
    println!(
        "{} uploaded, {} failed",
        report.succeeded(),
        report.failed()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env_filter = init_logging();

    let paths = match &cli.config_dir {
        Some(dir) => AppPaths::under(dir),
        None => AppPaths::discover()?,
    };
    let ctx = AppContext::load(paths).context("Failed to load settings")?;
    if !env_filter {
        // RUST_LOG wins over the settings file
        log::set_max_level(ctx.config.log_level_filter());
    }

    log::info!("Starting Cloud Drive Uploader");

    match cli.command {
        Command::Auth { provider } => {
            commands::authenticate(&ctx, provider).await?;
            println!("{} authentication successful", provider.display_name());
        }
        Command::Upload {
            provider,
            images,
            options,
            format,
            meta,
        } => {
            let mut request = options.into_request(images);
            request.format = format;
            request.metadata = meta;
            let report = commands::upload_images(&ctx, provider, &request).await?;
            print_report(&report)?;
        }
        Command::UploadFiles {
            provider,
            files,
            options,
        } => {
            let request = options.into_request(files);
            let report = commands::upload_files(&ctx, provider, &request).await?;
            print_report(&report)?;
        }
        Command::Status { provider } => {
            let status = commands::status(&ctx, provider)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Logout { provider } => {
            if commands::logout(&ctx, provider)? {
                println!("Signed out of {}", provider.display_name());
            } else {
                println!("No {} token stored", provider.display_name());
            }
        }
        Command::Cleanup { days } => {
            let removed = commands::cleanup(&ctx, days)?;
            println!("Removed {} temporary file(s)", removed);
        }
    }

    Ok(())
}
