mod cache;
mod config;
mod error;
mod logging;
mod order;
mod prober;
mod ranker;
mod scheduler;
mod sources;
mod traits;
mod types;
mod utils;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use config::{Overrides, Policy, Settings};
use indicatif::{ProgressBar, ProgressStyle};
use ranker::MirrorRanker;
use serde::Serialize;
use sources::get_source;
use std::io::ErrorKind;
use std::path::PathBuf;
use traits::MirrorSource;
use types::{format_latency, RankedList, Repository};

#[derive(Parser)]
#[command(name = "fastmirror")]
#[command(about = "Rank package repository mirrors by connect latency", long_about = None)]
struct Cli {
    #[command(flatten)]
    options: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalOptions {
    /// Log per-host timings
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/fastmirror/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Probing deadline in seconds
    #[arg(long, global = true, value_name = "SECONDS", allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Maximum number of probes in flight
    #[arg(long, global = true, value_name = "N", allow_negative_numbers = true)]
    maxthreads: Option<i64>,

    /// Host latency cache file
    #[arg(long, global = true, value_name = "PATH")]
    hostfile: Option<PathBuf>,

    /// Days before the host cache is considered stale
    #[arg(long, global = true, value_name = "DAYS", allow_negative_numbers = true)]
    maxage: Option<i64>,

    /// Drop mirrors whose host matches any of these patterns (comma/space separated)
    #[arg(long, global = true, value_name = "PATTERNS")]
    exclude: Option<String>,

    /// Keep only mirrors whose host matches one of these patterns; disables --exclude
    #[arg(long, global = true, value_name = "PATTERNS")]
    include_only: Option<String>,

    /// Host that always ranks first
    #[arg(long, global = true, value_name = "HOST")]
    prefer: Option<String>,

    /// Rank FTP mirrors by latency like any other
    #[arg(long, global = true)]
    no_downgrade_ftp: bool,
}

impl GlobalOptions {
    fn overrides(&self) -> Overrides {
        Overrides {
            verbose: self.verbose,
            socket_timeout: self.timeout,
            maxthreads: self.maxthreads,
            hostfilepath: self.hostfile.clone(),
            maxhostfileage: self.maxage,
            exclude: self.exclude.clone(),
            include_only: self.include_only.clone(),
            prefer: self.prefer.clone(),
            no_downgrade_ftp: self.no_downgrade_ftp,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the host cache (e.g., fastmirror status)
    Status,
    /// Rank mirrors without touching any file, host cache included (e.g., fastmirror test /etc/pacman.d/mirrorlist --format pacman)
    Test {
        /// Mirrorlist files; hosts shared between them are probed once
        #[arg(required = true)]
        mirrorlists: Vec<PathBuf>,

        /// Mirrorlist format (plain, pacman)
        #[arg(long, short, default_value = "plain")]
        format: String,

        /// Print the ranking as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rank mirrors and rewrite each mirrorlist fastest first
    Use {
        #[arg(required = true)]
        mirrorlists: Vec<PathBuf>,

        #[arg(long, short, default_value = "plain")]
        format: String,
    },
    /// Restore a mirrorlist to its previous backup
    Restore {
        mirrorlist: PathBuf,

        #[arg(long, short, default_value = "plain")]
        format: String,
    },
    /// Delete the host cache
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Bad configuration is the only thing that stops a run before probing
    let mut settings = Settings::load(cli.options.config.as_deref())?;
    settings.apply(cli.options.overrides());
    let policy = settings.validate()?;

    logging::init(policy.verbose);

    match cli.command {
        Commands::Status => handle_status(&policy).await?,
        Commands::Test {
            mirrorlists,
            format,
            json,
        } => handle_test(policy, mirrorlists, &format, json).await?,
        Commands::Use {
            mirrorlists,
            format,
        } => handle_use(policy, mirrorlists, &format).await?,
        Commands::Restore { mirrorlist, format } => handle_restore(mirrorlist, &format).await?,
        Commands::Clear => handle_clear(&policy).await?,
    }

    Ok(())
}

// --- Handlers ---

async fn handle_status(policy: &Policy) -> Result<()> {
    let path = &policy.hostfilepath;
    println!("Host cache: {}", path.display());

    let (entries, age) = match cache::HostCache::peek(path).await {
        Ok(found) => found,
        Err(error::MirrorError::Io(e)) if e.kind() == ErrorKind::NotFound => {
            println!("Status:     [Missing]");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let status = match age {
        Some(age) if age < policy.maxhostfileage => "[Fresh]",
        _ => "[Stale]",
    };
    let age_display = age
        .map(|a| format!("{:.1} days", a.as_secs_f64() / 86_400.0))
        .unwrap_or_else(|| "unknown".to_string());
    println!("Status:     {} (age {}, max {} days)", status, age_display, policy.maxhostfileage.as_secs() / 86_400);

    let mut hosts: Vec<_> = entries.into_iter().collect();
    hosts.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    println!("{}", "-".repeat(60));
    println!("{:<45} LATENCY", "HOST");
    println!("{}", "-".repeat(60));
    for (host, latency) in hosts {
        println!("{:<45} {}", host, format_latency(latency));
    }
    println!("{}", "-".repeat(60));

    Ok(())
}

#[derive(Serialize)]
struct RepoReport<'a> {
    repo: &'a str,
    ranked: &'a RankedList,
}

async fn handle_test(policy: Policy, paths: Vec<PathBuf>, format: &str, json: bool) -> Result<()> {
    let (_, mut repos) = load_sources(paths, format).await?;
    // Rank a copy: the originals are only displayed
    let originals = repos.clone();

    let ranker = MirrorRanker::new(policy)
        .with_progress(probe_progress())
        .read_only();
    let outcome = ranker.rank_repositories(&mut repos).await;

    if json {
        let reports: Vec<_> = originals
            .iter()
            .zip(&outcome.lists)
            .map(|(repo, ranked)| RepoReport {
                repo: &repo.id,
                ranked,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    for (repo, ranked) in originals.iter().zip(&outcome.lists) {
        println!();
        println!("Repository: {} ({} mirrors)", repo.id, repo.mirrors.len());
        println!("{:<4} {:<10} {:<30} URL", "RANK", "LATENCY", "HOST");
        println!("{}", "-".repeat(70));

        for (i, entry) in ranked.entries.iter().enumerate() {
            let mut host = entry.endpoint.host.clone();
            if host.len() > 28 {
                host = format!("{}...", &host[..25]);
            }
            println!(
                "{:<4} {:<10} {:<30} {}",
                i + 1,
                format_latency(entry.latency),
                host,
                entry.endpoint.url
            );
        }

        for excluded in &ranked.excluded {
            println!("{:<4} {:<10} {:<30} {}", "-", "excluded", excluded.host, excluded.url);
        }
    }

    let probed = outcome
        .measurements
        .values()
        .filter(|m| m.origin == types::Origin::Probe)
        .count();
    println!();
    println!(
        "Measured {} hosts ({} probed, {} from cache or policy).",
        outcome.measurements.len(),
        probed,
        outcome.measurements.len() - probed
    );

    if let Some(best) = outcome.lists.iter().filter_map(|l| l.best()).min_by(|a, b| a.latency.total_cmp(&b.latency)) {
        if !types::is_dead(best.latency) {
            println!("{}", "-".repeat(70));
            println!("Fastest host: {} ({})", best.endpoint.host, format_latency(best.latency));
        } else {
            println!("{}", "-".repeat(70));
            println!("No mirror answered. Please check your network connection.");
        }
    }

    Ok(())
}

async fn handle_use(policy: Policy, paths: Vec<PathBuf>, format: &str) -> Result<()> {
    let (sources, mut repos) = load_sources(paths, format).await?;

    let ranker = MirrorRanker::new(policy).with_progress(probe_progress());
    println!("Determining fastest mirrors...");
    let outcome = ranker.rank_repositories(&mut repos).await;

    let mut written = 0;
    for ((source, repo), ranked) in sources.iter().zip(&repos).zip(&outcome.lists) {
        if repo.mirrors.is_empty() {
            eprintln!(
                "Skipping {:?}: no mirrors left after filtering.",
                source.path()
            );
            continue;
        }

        source.store(repo).await?;
        written += 1;

        let best = ranked
            .best()
            .map(|b| format!("{} ({})", b.endpoint.host, format_latency(b.latency)))
            .unwrap_or_default();
        println!("Success! {} now starts with {}.", repo.id, best);
    }

    if written == 0 {
        bail!("No mirrorlist was rewritten.");
    }

    Ok(())
}

async fn handle_restore(path: PathBuf, format: &str) -> Result<()> {
    let source = get_source(format, path)?;

    println!("Restoring {} mirrorlist {:?}...", source.name(), source.path());
    source.restore().await?;
    println!("Success! {:?} restored.", source.path());

    Ok(())
}

async fn handle_clear(policy: &Policy) -> Result<()> {
    let path = &policy.hostfilepath;
    match tokio::fs::remove_file(path).await {
        Ok(()) => println!("Removed host cache {:?}.", path),
        Err(e) if e.kind() == ErrorKind::NotFound => println!("No host cache at {:?}.", path),
        Err(e) => bail!("Could not remove {:?}: {}", path, e),
    }
    Ok(())
}

// --- Helpers ---

async fn load_sources(
    paths: Vec<PathBuf>,
    format: &str,
) -> Result<(Vec<Box<dyn MirrorSource>>, Vec<Repository>)> {
    let sources = paths
        .into_iter()
        .map(|p| get_source(format, p))
        .collect::<error::Result<Vec<_>>>()?;

    let repos = futures::future::try_join_all(sources.iter().map(|s| s.load())).await?;

    if repos.iter().all(|r| r.mirrors.is_empty()) {
        bail!("No mirrors found in the given mirrorlists.");
    }

    Ok((sources, repos))
}

fn probe_progress() -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("|| "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message("Probing...");
    pb
}
