//! cdnpatch - incremental patcher for CDN-hosted client releases

use anyhow::{Context, Result};
use cdnpatch::archive::{ArchiveContainer, ContainerFiles};
use cdnpatch::downloaders::{resolve_release, HttpFetcher};
use cdnpatch::patcher::{
    run_task, ArchiveCompactor, PatchConfig, PatchTask, ReleasePatcher, Task,
};
use cdnpatch::paths::InstallLayout;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cdnpatch")]
#[command(version)]
#[command(about = "Incremental patcher for CDN-hosted client releases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Clone)]
struct Install {
    /// Project to work on
    project: String,

    /// Installation root (defaults to the local data directory)
    #[arg(long, env = "CDNPATCH_ROOT")]
    root: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct Origin {
    /// Origin base URL, e.g. http://cdn.example.com
    #[arg(long, env = "CDNPATCH_ORIGIN")]
    origin: String,

    /// Release branch
    #[arg(long, default_value = "live")]
    branch: String,
}

#[derive(Args, Clone)]
struct Filters {
    /// Only patch paths matching this regex
    #[arg(long)]
    include: Option<String>,

    /// Skip paths matching this regex
    #[arg(long)]
    exclude: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Update a project to a release
    Patch {
        #[command(flatten)]
        install: Install,

        #[command(flatten)]
        origin: Origin,

        #[command(flatten)]
        filters: Filters,

        /// Target release (defaults to the newest in the release listing)
        #[arg(long)]
        release: Option<String>,

        /// Workers per download pool
        #[arg(short, long, default_value_t = cdnpatch::patcher::config::DEFAULT_WORKERS)]
        workers: usize,

        /// Verify every file instead of trusting the previous manifest
        #[arg(long)]
        force: bool,

        /// Patch even if the release is marked complete
        #[arg(long)]
        ignore_marker: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rewrite the archives of an installed release without dead space
    Compact {
        #[command(flatten)]
        install: Install,

        /// Installed release whose manifest lists the live members
        release: String,
    },

    /// Show which files a patch would fetch
    Diff {
        #[command(flatten)]
        install: Install,

        #[command(flatten)]
        origin: Origin,

        #[command(flatten)]
        filters: Filters,

        /// Target release (defaults to the newest in the release listing)
        #[arg(long)]
        release: Option<String>,
    },

    /// List the members of one archive generation
    ListArchive {
        #[command(flatten)]
        install: Install,

        /// Release id of the archive generation
        release: String,
    },

    /// Print the current release of a project
    Resolve {
        /// Project name
        project: String,

        #[command(flatten)]
        origin: Origin,
    },
}

fn patch_config(install: &Install, origin: &Origin, filters: &Filters) -> PatchConfig {
    let root = install.root.clone().unwrap_or_else(PatchConfig::default_root);
    let mut config = PatchConfig::new(root, origin.origin.clone(), install.project.clone());
    config.branch = origin.branch.clone();
    config.include = filters.include.clone();
    config.exclude = filters.exclude.clone();
    config
}

fn layout(install: &Install) -> InstallLayout {
    let root = install.root.clone().unwrap_or_else(PatchConfig::default_root);
    InstallLayout::new(root, install.project.clone())
}

/// Run a task on the blocking pool while a progress bar follows it. Ctrl-C
/// cancels the task cooperatively.
async fn run_with_progress(task: Arc<Task>) -> Result<()> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}")?
            .progress_chars("=>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut worker = {
        let task = Arc::clone(&task);
        tokio::task::spawn_blocking(move || run_task(task.as_task()))
    };
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut cancelling = false;

    let result = loop {
        tokio::select! {
            joined = &mut worker => break joined.context("Task thread panicked")?,
            _ = ticker.tick() => {
                let current: &dyn PatchTask = task.as_task();
                pb.set_position(current.percentage() as u64);
                let status = current.state().status();
                match current.throughput_kib() {
                    Some(kib) if kib > 0.0 => pb.set_message(format!("{} | {:.0} KiB/s", status, kib)),
                    _ => pb.set_message(status),
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                pb.println("Cancelling...");
                task.as_task().state().cancel();
            }
        }
    };

    pb.set_position(task.as_task().percentage() as u64);
    pb.finish_and_clear();
    result
}

/// The blocking HTTP client must not be dropped on a runtime thread.
async fn drop_blocking<T: Send + 'static>(value: T) -> Result<()> {
    tokio::task::spawn_blocking(move || drop(value)).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if cli.verbose { "cdnpatch=debug".parse()? } else { "cdnpatch=warn".parse()? }),
            )
            .init();
    }

    match cli.command {
        Commands::Patch {
            install,
            origin,
            filters,
            release,
            workers,
            force,
            ignore_marker,
            json,
        } => {
            let mut config = patch_config(&install, &origin, &filters);
            config.version = release;
            config.workers = workers;
            config.force = force;
            config.ignore_marker = ignore_marker;

            if !json {
                println!("cdnpatch - {} from {}", config.project, config.origin);
                println!("Install root: {}", config.root.display());
                println!("Workers:      {}", config.workers);
                println!();
            }

            let patcher = tokio::task::spawn_blocking(move || ReleasePatcher::with_http(config)).await??;
            let task = Arc::new(Task::Patch(patcher));
            let result = run_with_progress(Arc::clone(&task)).await;

            let summary = match task.as_ref() {
                Task::Patch(patcher) => Some(patcher.summary()),
                Task::Compact(_) => None,
            };
            drop_blocking(task).await?;

            if let Some(summary) = summary {
                if json {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                } else if summary.up_to_date {
                    println!("Release {} is already installed.", summary.version);
                } else {
                    println!("=== Patch Summary ===");
                    println!("Release:    {}", summary.version);
                    println!("Candidates: {} ({} from packages)", summary.candidates, summary.packaged);
                    println!("Files:      {} downloaded, {} reused, {} refetched",
                        summary.downloaded, summary.reused, summary.refetched);
                    println!("Archives:   {} members in {} archives",
                        summary.archive_members, summary.archive_groups);
                    println!("Transfer:   {:.1} MiB in {:.1}s",
                        summary.bytes_transferred as f64 / 1024.0 / 1024.0,
                        summary.elapsed_ms as f64 / 1000.0);
                    if summary.managed_dirs_removed > 0 {
                        println!("Cleanup:    {} managed directories, {} bytes freed",
                            summary.managed_dirs_removed, summary.bytes_freed);
                    }
                    if summary.cancelled {
                        println!("\nCancelled. Run again to finish.");
                    }
                }
            }
            result?;
        }

        Commands::Compact { install, release } => {
            let compactor = ArchiveCompactor::new(
                layout(&install),
                release,
                cdnpatch::patcher::config::DEFAULT_CHUNK_SIZE,
            );
            run_with_progress(Arc::new(Task::Compact(compactor))).await?;
            println!("Compaction complete");
        }

        Commands::Diff {
            install,
            origin,
            filters,
            release,
        } => {
            let mut config = patch_config(&install, &origin, &filters);
            config.version = release;
            let candidates = tokio::task::spawn_blocking(move || {
                ReleasePatcher::with_http(config)?.preview()
            })
            .await??;

            for entry in &candidates {
                println!("{}\t{}\t{}\t{}", entry.release, entry.kind, entry.wire_size(), entry.path);
            }
            let bytes: u64 = candidates.iter().map(|e| e.wire_size()).sum();
            eprintln!("\nTotal: {} files, {} bytes", candidates.len(), bytes);
        }

        Commands::ListArchive { install, release } => {
            let dir = layout(&install).archive_dir(&release);
            let container = ArchiveContainer::open(ContainerFiles::locate(&dir)?)?;
            for (path, entry) in container.entries() {
                println!("{:>12} {:>10} {} {}", entry.offset, entry.size, entry.checksum, path);
            }
            eprintln!("\nTotal: {} members, {} data bytes", container.len(), container.data_len()?);
        }

        Commands::Resolve { project, origin } => {
            let release = tokio::task::spawn_blocking(move || {
                let fetcher = HttpFetcher::new(&origin.origin, &origin.branch)?;
                resolve_release(&fetcher, &project)
            })
            .await??;
            println!("{}", release);
        }
    }

    Ok(())
}
