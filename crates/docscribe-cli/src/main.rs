use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use docscribe::logging::{self, LogFormat};
use docscribe::{
    load_config, resolve_config_path, App, ArtifactKind, JobStatus, RunOutcome, Stage,
};

#[derive(Parser, Debug)]
#[command(name = "docscribe")]
#[command(about = "Transcribe, proofread and convert audio into documents")]
struct Cli {
    /// Config file. Falls back to $DOCSCRIBE_CONFIG, then ~/.docscribe/config.json.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (pretty or json).
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resume interrupted jobs and keep running until Ctrl-C.
    Run {
        /// Rescan for jobs recorded by `submit --detach` this often.
        #[arg(long, default_value_t = 30)]
        poll_secs: u64,
    },
    /// Submit an audio file and run its pipeline.
    Submit {
        #[arg(long, env = "DOCSCRIBE_OWNER")]
        owner: String,
        /// Path or URL of the source audio.
        source: String,
        /// Only record the job; a `run` process picks it up.
        #[arg(long)]
        detach: bool,
    },
    /// Show one job.
    Status {
        #[arg(long, env = "DOCSCRIBE_OWNER")]
        owner: String,
        job_id: String,
    },
    /// List an owner's jobs, newest first.
    List {
        #[arg(long, env = "DOCSCRIBE_OWNER")]
        owner: String,
        /// Only jobs in this status (e.g. error, completed).
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 20)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Show recent failures.
    Errors {
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Copy a job's artifact to a file, or print it.
    Artifact {
        #[arg(long, env = "DOCSCRIBE_OWNER")]
        owner: String,
        job_id: String,
        /// transcript, proofread or document
        kind: ArtifactKind,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Manage stage prompts.
    Prompt {
        #[command(subcommand)]
        action: PromptAction,
    },
}

#[derive(Subcommand, Debug)]
enum PromptAction {
    /// Store a new prompt version read from a file.
    Add {
        stage: Stage,
        file: PathBuf,
        /// Make it the active prompt right away.
        #[arg(long)]
        activate: bool,
    },
    /// Make a stored prompt the active one for its stage.
    Activate { stage: Stage, prompt_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let app = App::from_config(&config).context("failed to initialise docscribe")?;

    match cli.command {
        Command::Run { poll_secs } => run(&app, Duration::from_secs(poll_secs.max(1))).await,
        Command::Submit {
            owner,
            source,
            detach,
        } => submit(&app, &owner, &source, detach).await,
        Command::Status { owner, job_id } => {
            let job = app.service.status(&owner, &job_id)?;
            print_json(&job)
        }
        Command::List {
            owner,
            status,
            limit,
            offset,
        } => {
            let page = app.service.list(&owner, status, Some(limit), Some(offset))?;
            print_json(&page)
        }
        Command::Errors { limit } => {
            let logs = app.service.error_logs(limit)?;
            print_json(&logs)
        }
        Command::Artifact {
            owner,
            job_id,
            kind,
            output,
        } => {
            let artifact = app.service.artifact(&owner, &job_id, kind)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &artifact.content)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("{}", path.display());
                }
                None => println!("{}", String::from_utf8_lossy(&artifact.content)),
            }
            Ok(())
        }
        Command::Prompt { action } => prompt(&app, action),
    }
}

async fn run(app: &App, poll: Duration) -> Result<()> {
    let resumed = app.recover()?;
    info!(resumed = resumed.len(), "docscribe running; press Ctrl-C to stop");

    let mut events = app.progress.subscribe();
    let mut rescan = tokio::time::interval(poll);
    rescan.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = rescan.tick() => {
                if let Err(e) = app.runner.recover() {
                    warn!(error = %e, "Rescan for pending jobs failed");
                }
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Progress output lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if !app.shutdown().await {
        warn!("Some jobs did not stop in time; they resume on the next run");
    }
    Ok(())
}

async fn submit(app: &App, owner: &str, source: &str, detach: bool) -> Result<()> {
    if detach {
        let job = app.store.create_job(owner, source)?;
        println!("{}", job.id);
        return Ok(());
    }

    let (job, handle) = app.service.submit_tracked(owner, source)?;
    info!(job_id = %job.id, "Job submitted");

    let outcome = tokio::select! {
        outcome = handle => outcome.context("pipeline task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            app.shutdown().await;
            bail!("interrupted; job {} resumes on the next run", job.id);
        }
    };
    // Let a pending resource release finish before the process exits.
    app.runner.wait().await;

    match outcome {
        RunOutcome::Completed(job) => print_json(&job),
        RunOutcome::AlreadyTerminal(job) => print_json(&job),
        RunOutcome::Failed { job_id, message } => bail!("job {} failed: {}", job_id, message),
        RunOutcome::Interrupted { job_id, .. } => bail!("job {} was interrupted", job_id),
    }
}

fn prompt(app: &App, action: PromptAction) -> Result<()> {
    match action {
        PromptAction::Add {
            stage,
            file,
            activate,
        } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let prompt = app.store.add_prompt(stage, &body)?;
            if activate {
                app.store.activate_prompt(stage, prompt.id)?;
            }
            print_json(&prompt)
        }
        PromptAction::Activate { stage, prompt_id } => {
            app.store.activate_prompt(stage, prompt_id)?;
            let prompt = app.store.active_prompt(stage)?;
            print_json(&prompt)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
