use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;
use wheelflow_runner::{
    batch::{BatchStatus, Sweep},
    config::RunnerConfig,
    job::{BatchId, JobConfig, JobId, JobStatus, Quality},
    Orchestrator, OrchestratorError,
};

/// Run wheel aerodynamics cases through an external CFD engine
#[derive(Parser)]
#[command(name = "wheelflow-runner", version, long_about = None)]
struct Cli {
    /// Runner configuration
    #[arg(short, long, default_value = "wheelflow.yaml")]
    config: PathBuf,

    /// More output per occurrence, RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration and the engine executables
    Check,
    /// Run a single job and print it once it finished
    Run(JobArgs),
    /// Run one job per sweep value, all of them sharing the mesh of the first
    Sweep {
        #[command(flatten)]
        job: JobArgs,
        /// Incidence angles in degrees
        #[arg(
            long,
            value_delimiter = ',',
            num_args = 1..,
            required_unless_present = "speeds",
            conflicts_with = "speeds"
        )]
        incidences: Vec<f64>,
        /// Flow speeds in m/s
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        speeds: Vec<f64>,
    },
    /// List the known jobs
    List,
    /// Print a job or the results of a batch
    Show { id: String },
    /// Delete a finished job and its case directory
    Delete { id: JobId },
}

#[derive(Args)]
struct JobArgs {
    /// Wheel geometry (STL)
    geometry: PathBuf,
    #[arg(long)]
    name: Option<String>,
    /// Flow speed in m/s
    #[arg(long)]
    speed: Option<f64>,
    /// Incidence (yaw) angle in degrees
    #[arg(long)]
    incidence: Option<f64>,
    /// Reference area in m²
    #[arg(long)]
    reference_area: Option<f64>,
    #[arg(long)]
    iterations: Option<u64>,
    #[arg(long, value_parser = ["basic", "standard", "pro"])]
    quality: Option<String>,
    /// Ask the solve stage for the GPU linear solver
    #[arg(long)]
    gpu: bool,
}

impl JobArgs {
    fn config(self) -> JobConfig {
        let name = self.name.unwrap_or_else(|| {
            self.geometry
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "wheel".to_owned())
        });
        let mut config = JobConfig::new(name, self.geometry).with_gpu(self.gpu);

        if let Some(speed) = self.speed {
            config = config.with_speed(speed);
        }
        if let Some(incidence) = self.incidence {
            config = config.with_incidence(incidence);
        }
        if let Some(area) = self.reference_area {
            config = config.with_reference_area(area);
        }
        if let Some(iterations) = self.iterations {
            config = config.with_target_iterations(iterations);
        }
        match self.quality.as_deref() {
            Some("basic") => config.with_quality(Quality::Basic),
            Some("pro") => config.with_quality(Quality::Pro),
            _ => config,
        }
    }
}

/// One line of `list`
#[derive(Serialize)]
struct JobRow {
    id: JobId,
    name: String,
    status: JobStatus,
    progress: u8,
    batch: Option<BatchId>,
    created_at: DateTime<Utc>,
}

fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_log());
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn execute(command: Commands, config: &RunnerConfig) -> Result<ExitCode, OrchestratorError> {
    if matches!(command, Commands::List | Commands::Show { .. } | Commands::Delete { .. })
        && config.database.is_none()
    {
        warn!("No database configured, only jobs of this process are known");
    }

    if matches!(command, Commands::Check) {
        info!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    // only the commands that run jobs may touch unfinished jobs in the store
    let orchestrator = match command {
        Commands::Run(_) | Commands::Sweep { .. } => Orchestrator::load(config)?,
        _ => Orchestrator::inspect(config)?,
    };

    let code = match command {
        Commands::Check => ExitCode::SUCCESS,
        Commands::Run(job) => {
            let id = orchestrator.submit_job(job.config())?;
            let job = orchestrator.wait_job(id, None)?;
            print_json(&job);

            if job.status == JobStatus::Complete {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Sweep {
            job,
            incidences,
            speeds,
        } => {
            let sweep = if incidences.is_empty() {
                Sweep::speed(speeds)
            } else {
                Sweep::incidence(incidences)
            };

            let batch = orchestrator.submit_batch(job.config(), sweep)?;
            let snapshot = orchestrator.wait_batch(batch, None)?;
            print_json(&orchestrator.get_batch_results(batch)?);

            if snapshot.status == BatchStatus::Complete {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::List => {
            let rows = orchestrator
                .list_jobs()
                .into_iter()
                .map(|job| JobRow {
                    id: job.id,
                    batch: job.config.batch,
                    name: job.name,
                    status: job.status,
                    progress: job.progress,
                    created_at: job.created_at,
                })
                .collect::<Vec<_>>();
            print_json(&rows);

            ExitCode::SUCCESS
        }
        Commands::Show { id } => {
            let job = id
                .parse::<JobId>()
                .ok()
                .and_then(|id| orchestrator.get_job(id).ok());
            let batch = id
                .parse::<BatchId>()
                .ok()
                .and_then(|id| orchestrator.get_batch_results(id).ok());

            match (job, batch) {
                (Some(job), _) => print_json(&job),
                (None, Some(batch)) => print_json(&batch),
                (None, None) => {
                    error!("No job or batch {id}");
                    return Ok(ExitCode::FAILURE);
                }
            }

            ExitCode::SUCCESS
        }
        Commands::Delete { id } => {
            orchestrator.delete_job(id)?;
            info!(job = %id, "Deleted");

            ExitCode::SUCCESS
        }
    };

    Ok(code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match RunnerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if matches!(
        cli.command,
        Commands::Check | Commands::Run(_) | Commands::Sweep { .. }
    ) && config.preflight_checks()
    {
        error!("Configuration has errors, see above");
        return ExitCode::FAILURE;
    }

    match execute(cli.command, &config) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
