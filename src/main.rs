use anyhow::Context;
use clap::{Parser, Subcommand};
use mcpatch::{Config, Layout, LogProgress, PatchFormat, UpdateEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Config file looked up in the update directory when `--config` is absent.
const DEFAULT_CONFIG: &str = "mcpatch.toml";

#[derive(Parser)]
#[command(name = "mcpatch", about = "Incremental update client and version publisher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and apply every version the directory is missing
    Update {
        /// Working directory that holds the version marker
        #[arg(long)]
        dir: PathBuf,
        /// Configuration file (defaults to <dir>/mcpatch.toml)
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Also write the log to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Publish the difference between two directories as a new version
    Publish {
        /// Directory as of the previous version
        #[arg(long)]
        old: PathBuf,
        /// Directory as of the new version
        #[arg(long)]
        new: PathBuf,
        /// Directory served to clients
        #[arg(long, short)]
        output: PathBuf,
        /// Version id to publish
        #[arg(long)]
        version: String,
        /// Change log shown to clients
        #[arg(long, default_value = "")]
        changelog: String,
        /// Container layout: blob or archive
        #[arg(long, default_value = "blob")]
        format: PatchFormat,
    },
}

/// Install the stderr subscriber and, when asked, a non-blocking file writer.
fn init_logging(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };

    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

async fn update(dir: PathBuf, config: Option<PathBuf>, log_file: Option<PathBuf>) -> anyhow::Result<()> {
    let _guard = init_logging(log_file.as_deref())?;

    let config_path = config.unwrap_or_else(|| dir.join(DEFAULT_CONFIG));
    let config = Config::load(&config_path)?;
    let mut layout = Layout::new(&dir, &config);
    if let Ok(exe) = std::env::current_exe().and_then(|p| p.canonicalize()) {
        layout = layout.with_executable(exe);
    }
    if let Some(log) = log_file {
        layout = layout.with_log_file(log);
    }

    println!("Updating...");
    println!("  Directory: {}", layout.update_dir.display());
    println!("  Config: {}", config_path.display());

    let start = Instant::now();
    let engine = UpdateEngine::new(config, layout, Some(Arc::new(LogProgress)))?;
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping");
            cancel.cancel();
        }
    });

    let applied = engine.run().await;
    let elapsed = start.elapsed();

    match applied {
        Ok(count) => {
            println!("\nUpdate finished!");
            println!("  Versions applied: {}", count);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e.error)
            .context(format!("update failed after {} version(s)", e.applied))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Update {
            dir,
            config,
            log_file,
        } => update(dir, config, log_file).await?,
        Commands::Publish {
            old,
            new,
            output,
            version,
            changelog,
            format,
        } => {
            init_logging(None)?;
            println!("Publishing version {}...", version);
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let summary =
                mcpatch::publish_version(&old, &new, &output, &version, &changelog, format).await?;
            let elapsed = start.elapsed();

            println!("\nVersion published successfully!");
            println!("  Directories created: {}", summary.folders_created);
            println!("  Files filled: {}", summary.files_filled);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Files emptied: {}", summary.files_emptied);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Directories deleted: {}", summary.folders_deleted);
            println!("  Payload: {}", mcpatch::progress::format_bytes(summary.payload_bytes));
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}
