use std::{
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::metadata::LevelFilter;

use model_depot::{
    core::{DepotContext, ModelStatus},
    models::{format_bytes, DownloadProgress, DownloadRequest, FinishOutcome},
};

#[derive(Parser)]
#[command(name = "model-depot")]
#[command(about = "Download and keep local model files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Keep settings and models below this directory instead of the platform dirs
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known models and whether they are installed
    List,
    /// Show the status of one model
    Status { model: String },
    /// Download a model into the models directory
    Fetch {
        model: String,
        /// Download from this URL instead of the catalog one
        #[arg(long)]
        url: Option<String>,
    },
    /// Check an installed model against its recorded checksum
    Verify { model: String },
    /// Delete abandoned .temp files
    Sweep,
}

fn setup_logging() {
    let filter = std::env::var("MODEL_DEPOT_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let mut context = match &cli.root {
        Some(root) => DepotContext::with_root(root)?,
        None => DepotContext::new()?,
    };

    match cli.command {
        Commands::List => {
            for entry in context.list_models() {
                println!(
                    "{:<40} {:<14} {}",
                    entry.model.name,
                    describe(&entry.status),
                    entry.model.size_label.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Status { model } => {
            let status = context.model_status(&model)?;
            println!("{}: {}", model, describe(&status));
            println!("{}", context.model_path(&model)?.display());
        }
        Commands::Fetch { model, url } => fetch(&mut context, model, url)?,
        Commands::Verify { model } => {
            if context.verify_model(&model)? {
                println!("{model}: ok");
            } else {
                bail!("{model}: checksum mismatch");
            }
        }
        Commands::Sweep => {
            let (expired, swept) = context.housekeeping();
            println!("removed {swept} temp files, dropped {expired} cache entries");
        }
    }

    context.shutdown();
    Ok(())
}

fn fetch(context: &mut DepotContext, model: String, url: Option<String>) -> Result<()> {
    let mut request = DownloadRequest::model(model).on_progress(print_progress);
    if let Some(url) = url {
        request = request.with_url(url);
    }

    let downloads = context.downloads_mut();
    let id = downloads.start(request)?;
    loop {
        let finished = downloads.wait_for_events(Duration::from_millis(500));
        let Some(done) = finished.into_iter().find(|done| done.id == id) else {
            continue;
        };
        println!();
        return match done.outcome {
            FinishOutcome::Completed { path, size } => {
                println!("saved {} ({})", path.display(), format_bytes(size));
                Ok(())
            }
            FinishOutcome::Failed { error } => Err(error.into()),
            FinishOutcome::Cancelled => bail!("{} was cancelled", done.file_name),
        };
    }
}

fn print_progress(progress: &DownloadProgress) {
    let mut stdout = io::stdout().lock();
    let _ = match progress.total_bytes {
        Some(total) => write!(
            stdout,
            "\r{:>6.2}%  {} / {}  {}   ",
            progress.percentage(),
            format_bytes(progress.bytes_downloaded),
            format_bytes(total),
            progress.speed
        ),
        None => write!(
            stdout,
            "\r{}  {}   ",
            format_bytes(progress.bytes_downloaded),
            progress.speed
        ),
    };
    let _ = stdout.flush();
}

fn describe(status: &ModelStatus) -> String {
    match status {
        ModelStatus::NotInstalled => "not installed".into(),
        ModelStatus::Downloading { progress } => format!("{progress:.1}%"),
        ModelStatus::Installed { size } => format!("installed {}", format_bytes(*size)),
    }
}
