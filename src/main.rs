// remote-trainer - Remote training orchestrator
// Main entry point

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;

use remote_trainer::config::{config_path, load_config, write_default_config};
use remote_trainer::errors::suggestion_for;
use remote_trainer::job::JobRecord;
use remote_trainer::strategy::default_setup_commands;
use remote_trainer::{
    JobHandle, JobId, JobSpec, LogCursor, LogEvent, Orchestrator, OrchestratorError, StrategyKind,
    TrainingParams,
};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "remote-trainer")]
#[command(about = "Launch and supervise training jobs locally or on a remote GPU host", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Start a training job
    Start {
        /// Shell command to run
        command: String,

        /// Override TRAINING_MODE for this job
        #[arg(long)]
        mode: Option<StrategyKind>,

        /// Model to fine-tune; enables the training parameters below
        #[arg(long)]
        model: Option<String>,

        /// Role definition file handed to the trainer
        #[arg(long = "role-file", requires = "model")]
        role_file: Option<String>,

        #[arg(long, requires = "model")]
        epochs: Option<u32>,

        #[arg(long = "batch-size", requires = "model")]
        batch_size: Option<u32>,

        #[arg(long = "lr", requires = "model")]
        learning_rate: Option<f64>,

        /// Full fine-tuning instead of LoRA
        #[arg(long = "no-lora", requires = "model")]
        no_lora: bool,

        /// Working directory, relative to the workspace
        #[arg(long)]
        workdir: Option<String>,

        /// Extra environment variable (KEY=VALUE), repeatable
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Stream the log until the job finishes
        #[arg(long)]
        follow: bool,
    },
    /// Show a job's status
    Status {
        job_id: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Stream a job's log
    Logs {
        job_id: String,

        /// Byte offset to resume from
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Print only the last N lines and exit
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Cancel a running job
    Cancel { job_id: String },
    /// Forget a finished job
    Release { job_id: String },
    /// List recorded jobs
    Jobs,
    /// Check connectivity to the configured SSH host
    Check,
    /// Push the local workspace to the remote host
    Sync,
    /// Run environment setup commands on the remote host
    Setup {
        /// Commands to run instead of the default dependency install
        commands: Vec<String>,
    },
    /// Download a remote job's models/ directory
    Download {
        job_id: String,

        /// Local destination directory
        #[arg(long, default_value = "models")]
        dest: PathBuf,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    if let Err(err) = run(args.command).await {
        if let Some(hint) = err.downcast_ref::<OrchestratorError>().and_then(suggestion_for) {
            eprintln!("\x1b[1;31mError:\x1b[0m {}", hint);
            std::process::exit(1);
        }
        return Err(err);
    }
    Ok(())
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::InitConfig { force } => run_init_config(force),
        Command::Start {
            command,
            mode,
            model,
            role_file,
            epochs,
            batch_size,
            learning_rate,
            no_lora,
            workdir,
            env,
            follow,
        } => {
            let mut spec = match model {
                Some(model) => {
                    let mut params = TrainingParams::new(model);
                    params.role_file = role_file;
                    params.epochs = epochs.unwrap_or(params.epochs);
                    params.batch_size = batch_size.unwrap_or(params.batch_size);
                    params.learning_rate = learning_rate.unwrap_or(params.learning_rate);
                    params.use_lora = !no_lora;
                    params.into_job_spec(command)?
                }
                None => JobSpec::new(command),
            };
            if let Some(dir) = workdir {
                spec = spec.with_working_directory(dir);
            }
            for (key, value) in env {
                spec = spec.with_env(key, value);
            }
            run_start(&open()?, mode, spec, follow).await
        }
        Command::Status { job_id, json } => run_status(&open()?, &job_id, json).await,
        Command::Logs { job_id, offset, tail } => run_logs(&open()?, &job_id, offset, tail).await,
        Command::Cancel { job_id } => {
            let orchestrator = open()?;
            let handle = attach(&orchestrator, &job_id)?;
            orchestrator.cancel(&handle).await?;
            println!("{}  {}", handle.job_id(), orchestrator.status(&handle).await);
            Ok(())
        }
        Command::Release { job_id } => {
            let orchestrator = open()?;
            let handle = attach(&orchestrator, &job_id)?;
            orchestrator.release(handle).await?;
            println!("✓ Released {}", job_id);
            Ok(())
        }
        Command::Jobs => run_jobs(&open()?),
        Command::Check => run_check(&open()?).await,
        Command::Sync => {
            let result = open()?.remote().sync_workspace().await?;
            println!(
                "✓ Synced {} of {} files ({} bytes)",
                result.files_changed, result.files_scanned, result.bytes_transferred
            );
            Ok(())
        }
        Command::Setup { commands } => run_setup(&open()?, commands).await,
        Command::Download { job_id, dest } => {
            let orchestrator = open()?;
            let handle = attach(&orchestrator, &job_id)?;
            if handle.kind() != StrategyKind::Remote {
                bail!("Job {} ran locally; its artifacts are already on this machine", job_id);
            }
            let result = orchestrator.remote().download_artifacts(&handle, &dest).await?;
            println!(
                "✓ Downloaded {} files ({} bytes) to {}",
                result.files_changed,
                result.bytes_transferred,
                dest.display()
            );
            Ok(())
        }
    }
}

/// Load configuration and build the orchestrator
fn open() -> Result<Orchestrator> {
    let config = load_config().context("Failed to load configuration")?;
    Ok(Orchestrator::new(config)?)
}

fn attach(orchestrator: &Orchestrator, job_id: &str) -> Result<JobHandle> {
    let job_id: JobId = job_id.parse()?;
    Ok(orchestrator.attach(job_id)?)
}

async fn run_start(orchestrator: &Orchestrator, mode: Option<StrategyKind>, spec: JobSpec, follow: bool) -> Result<()> {
    let kind = mode.unwrap_or_else(|| orchestrator.mode());
    let handle = orchestrator.start_with(kind, spec).await?;
    println!("{}", handle.job_id());
    eprintln!("Started {} job (pid {})", kind, handle.pid());

    if follow {
        stream_logs(orchestrator, &handle, LogCursor::start(handle.job_id())).await?;
        println!("{}  {}", handle.job_id(), orchestrator.status(&handle).await);
    }
    Ok(())
}

async fn run_status(orchestrator: &Orchestrator, job_id: &str, json: bool) -> Result<()> {
    let handle = attach(orchestrator, job_id)?;
    let status = orchestrator.status(&handle).await;

    if json {
        let record = JobRecord::from_handle(&handle);
        let value = serde_json::json!({ "job": record, "status": status });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Job:      {}", handle.job_id());
    println!("Strategy: {}", handle.kind());
    println!("Status:   {}", status);
    println!("PID:      {}", handle.pid());
    println!("Started:  {}", handle.started_at().format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(target) = handle.target() {
        println!("Host:     {}", target);
    }
    println!("Run dir:  {}", handle.run_dir());
    Ok(())
}

async fn run_logs(orchestrator: &Orchestrator, job_id: &str, offset: u64, tail: Option<usize>) -> Result<()> {
    let handle = attach(orchestrator, job_id)?;
    if let Some(lines) = tail {
        for line in orchestrator.tail(&handle, lines).await? {
            println!("{}", line);
        }
        return Ok(());
    }
    stream_logs(orchestrator, &handle, LogCursor::at(handle.job_id(), offset)).await
}

async fn stream_logs(orchestrator: &Orchestrator, handle: &JobHandle, cursor: LogCursor) -> Result<()> {
    let mut stream = orchestrator.logs(handle, cursor);
    while let Some(event) = stream.next().await {
        match event? {
            LogEvent::Line(line) => println!("{}", line.text),
            LogEvent::Gap(cursor) => {
                eprintln!(
                    "\x1b[1;33m⚠ Lost connection while streaming.\x1b[0m Resume with:\n  \x1b[36mremote-trainer logs {} --offset {}\x1b[0m",
                    cursor.job_id, cursor.offset
                );
                break;
            }
        }
    }
    Ok(())
}

fn run_jobs(orchestrator: &Orchestrator) -> Result<()> {
    let records = orchestrator.jobs()?;
    if records.is_empty() {
        println!("No recorded jobs");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<6}  {:<20}  {}",
            record.job_id,
            record.kind,
            record.state.to_string(),
            record.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn run_check(orchestrator: &Orchestrator) -> Result<()> {
    let report = orchestrator.remote().check_connection().await;
    if report.connected {
        let latency = report.latency.map(|d| d.as_millis()).unwrap_or_default();
        println!("✓ Connected to {} ({} ms)", report.host, latency);
        return Ok(());
    }
    println!("\x1b[1;33m⚠ Not connected to {}\x1b[0m", report.host);
    if let Some(error) = report.error {
        println!("  {}", error);
    }
    std::process::exit(1);
}

async fn run_setup(orchestrator: &Orchestrator, commands: Vec<String>) -> Result<()> {
    let commands = if commands.is_empty() {
        default_setup_commands(&orchestrator.remote().target()?)
    } else {
        commands
    };

    let outcomes = orchestrator.remote().prepare_environment(&commands).await?;
    let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
    for outcome in &outcomes {
        if outcome.succeeded() {
            println!("✓ {}", outcome.command);
        } else {
            println!("✗ {} (exit {})", outcome.command, outcome.exit_code);
            if !outcome.stderr.is_empty() {
                println!("  {}", outcome.stderr);
            }
        }
    }
    if failed > 0 {
        eprintln!("{} of {} setup commands failed", failed, outcomes.len());
    }
    Ok(())
}

fn run_init_config(force: bool) -> Result<()> {
    let path = config_path().context("Could not determine home directory")?;
    write_default_config(&path, force)?;
    println!("✓ Wrote {}", path.display());
    Ok(())
}

fn init_tracing() {
    // Default: INFO level, can be overridden with RUST_LOG env var
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Logs go to stderr so job output on stdout stays pipeable
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
