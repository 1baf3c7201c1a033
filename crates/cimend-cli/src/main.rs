//! cimend - automated CI failure remediation
//!
//! ## Commands
//!
//! - `run`: remediate failed workflow runs and wait for their outcomes
//! - `watch`: poll repositories and remediate failed runs as they appear
//! - `classify`: print the failure signals found in a local log file
//! - `show`: print a stored outcome artifact

mod config;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cimend_core::{
    init_tracing, read_outcome_artifact, Collaborators, FailureClassifier, PatternTable, Provider,
    RepoRef, RunCoordinator, RunKey, RunOutcome, SourceControl, SubmitStatus, TerminalState,
    METRICS,
};
use cimend_http::{ChatCompletionsProvider, GitHubClient};
use cimend_local::LocalSandbox;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{info, warn, Level};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "cimend")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Automated CI failure remediation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON results
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ./cimend.toml when present)
    #[arg(short, long, global = true, env = "CIMEND_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for outcome artifacts, overriding the configuration
    #[arg(long, global = true)]
    artifacts_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remediate failed runs of one repository and wait for the outcomes
    Run {
        /// Repository as owner/name
        repo: RepoRef,

        /// Workflow run identifiers
        #[arg(required = true)]
        run_ids: Vec<u64>,
    },

    /// Poll repositories for failed runs and remediate them
    Watch {
        /// Repositories as owner/name
        #[arg(required = true)]
        repos: Vec<RepoRef>,

        /// Seconds between polls, overriding watch.interval_secs
        #[arg(long)]
        interval: Option<u64>,

        /// Poll once, wait for the submitted runs, then exit
        #[arg(long)]
        once: bool,
    },

    /// Print the failure signals extracted from a log file as JSON
    Classify {
        /// Path to a CI job log
        log: PathBuf,
    },

    /// Print the stored outcome of a finished run
    Show {
        /// Repository as owner/name
        repo: RepoRef,

        run_id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.artifacts_dir {
        config.coordinator.artifacts_dir = Some(dir);
    }

    match cli.command {
        Commands::Run { repo, run_ids } => cmd_run(&config, &repo, &run_ids, cli.json).await,
        Commands::Watch {
            repos,
            interval,
            once,
        } => cmd_watch(&config, &repos, interval, once, cli.json).await,
        Commands::Classify { log } => cmd_classify(&config, &log),
        Commands::Show { repo, run_id } => cmd_show(&config, repo, run_id, cli.json),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Build the coordinator over GitHub, the configured providers and local checkouts.
fn build_coordinator(config: &CliConfig) -> Result<(RunCoordinator, Arc<GitHubClient>)> {
    config.validate()?;

    if std::env::var(&config.github.token_env).is_err() {
        warn!(
            env = %config.github.token_env,
            "GitHub token not set; publishing will be denied"
        );
    }
    let github = Arc::new(
        GitHubClient::from_env(&config.github).context("Failed to build GitHub client")?,
    );

    let providers = config
        .providers
        .iter()
        .map(|p| {
            ChatCompletionsProvider::from_env(p.clone())
                .map(|provider| Arc::new(provider) as Arc<dyn Provider>)
                .with_context(|| format!("Failed to configure provider '{}'", p.name))
        })
        .collect::<Result<Vec<_>>>()?;

    let sandbox =
        LocalSandbox::new(config.sandbox.clone()).context("Failed to configure local sandbox")?;

    let coordinator = RunCoordinator::start(
        config.coordinator.clone(),
        Collaborators {
            scm: github.clone(),
            providers,
            sandbox: Arc::new(sandbox),
        },
    )?;
    Ok((coordinator, github))
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        println!("{}", outcome.summary);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(config: &CliConfig, repo: &RepoRef, run_ids: &[u64], json: bool) -> Result<ExitCode> {
    let (coordinator, _) = build_coordinator(config)?;

    let results = join_all(
        run_ids
            .iter()
            .map(|run_id| coordinator.run_to_completion(repo, *run_id)),
    )
    .await;

    let mut all_published = true;
    for (run_id, result) in run_ids.iter().zip(results) {
        match result {
            Ok(outcome) => {
                all_published &= matches!(outcome.state, TerminalState::Published);
                print_outcome(&outcome, json)?;
            }
            Err(e) => {
                all_published = false;
                warn!(repo = %repo, run_id, error = %e, "run was not remediated");
            }
        }
    }

    coordinator.shutdown().await;
    METRICS.flush();
    Ok(if all_published {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn cmd_watch(
    config: &CliConfig,
    repos: &[RepoRef],
    interval: Option<u64>,
    once: bool,
    json: bool,
) -> Result<ExitCode> {
    let (coordinator, github) = build_coordinator(config)?;
    let period = Duration::from_secs(interval.unwrap_or(config.watch.interval_secs).max(1));
    let mut outcomes = coordinator.subscribe();
    let mut submitted: HashSet<RunKey> = HashSet::new();
    let mut ticker = tokio::time::interval(period);

    info!(repos = repos.len(), interval_secs = period.as_secs(), "watching for failed runs");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, draining queued runs");
                break;
            }
            _ = ticker.tick() => {
                for repo in repos {
                    poll_repo(&coordinator, github.as_ref(), repo, config.watch.lookback, &mut submitted).await;
                }
                METRICS.flush();
                if once {
                    break;
                }
            }
            received = outcomes.recv() => match received {
                Ok(outcome) => print_outcome(&outcome, json)?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "outcome stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    coordinator.shutdown().await;
    loop {
        match outcomes.try_recv() {
            Ok(outcome) => print_outcome(&outcome, json)?,
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "outcome stream lagged"),
            Err(_) => break,
        }
    }
    METRICS.flush();
    Ok(ExitCode::SUCCESS)
}

/// Submit every failed run of `repo` not yet submitted by this process.
async fn poll_repo(
    coordinator: &RunCoordinator,
    scm: &dyn SourceControl,
    repo: &RepoRef,
    lookback: usize,
    submitted: &mut HashSet<RunKey>,
) {
    let run_ids = match scm.list_failed_runs(repo, lookback).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(repo = %repo, error = %e, "listing failed runs failed");
            return;
        }
    };

    for run_id in run_ids {
        let key = RunKey::new(repo.clone(), run_id);
        if submitted.contains(&key) {
            continue;
        }
        match coordinator.submit(repo, run_id) {
            SubmitStatus::Accepted { attempt_id } => {
                info!(run = %key, %attempt_id, "submitted failed run");
                submitted.insert(key);
            }
            SubmitStatus::Duplicate => {
                submitted.insert(key);
            }
            // Left out of `submitted` so the next poll retries it.
            SubmitStatus::Rejected { reason } => {
                warn!(run = %key, %reason, "submission rejected");
            }
        }
    }
}

fn cmd_classify(config: &CliConfig, log: &Path) -> Result<ExitCode> {
    let text = std::fs::read_to_string(log)
        .with_context(|| format!("Failed to read log file {}", log.display()))?;
    let table = PatternTable::default()
        .with_rules(&config.coordinator.extra_patterns)
        .context("Invalid coordinator.extra_patterns")?;
    let classifier = FailureClassifier::new(table, config.coordinator.classifier.clone());
    let signals = classifier.classify_log(&text);

    println!("{}", serde_json::to_string_pretty(&signals)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_show(config: &CliConfig, repo: RepoRef, run_id: u64, json: bool) -> Result<ExitCode> {
    let dir = config
        .coordinator
        .artifacts_dir
        .as_deref()
        .context("No artifacts directory configured; pass --artifacts-dir")?;
    let key = RunKey::new(repo, run_id);
    let outcome = read_outcome_artifact(&key, dir)
        .with_context(|| format!("Failed to read outcome artifact for {key}"))?;
    print_outcome(&outcome, json)?;
    Ok(ExitCode::SUCCESS)
}
