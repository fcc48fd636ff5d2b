use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use pwhg_runner::{
    check::{check_slot, summary::CampaignSummary, CheckError},
    cluster::Cluster,
    collector::{slot_dir, Collector},
    config::{ConfigErrors, RunnerConfig},
    executors::{BatchConfig, Executors},
    resubmit::{resubmit_failed, CampaignParams, Overrides, ReweightRequest, ResubmitError},
    runner::{RunOptions, RunnerError, SlotRunner},
    simulation::{Process, Reweight, SimConfig, ENVIRONMENT_MARKER, VERSION_MARKER},
    submit::{Pipeline, SubmitError},
};
use rayon::prelude::*;
use std::{
    error::Error as StdError,
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run and repair POWHEG campaigns on SLURM clusters")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    debug: bool,

    /// YAML runner configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cluster to submit to, detected from the hostname if not given
    #[arg(long, global = true)]
    cluster: Option<Cluster>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new campaign as job array
    Submit(SubmitArgs),
    /// Run POWHEG for one slot, executed inside a batch job
    Run(RunArgs),
    /// Check the event files of a campaign and write the per-slot check records
    Check {
        workdir: PathBuf,
        /// Only check this slot
        #[arg(long)]
        slot: Option<u32>,
    },
    /// Aggregate the check records into the campaign report
    Summary {
        workdir: PathBuf,
        /// Number of slots the campaign should have
        #[arg(long)]
        slots: Option<u32>,
        /// First slot of the campaign
        #[arg(long, default_value_t = 0)]
        minslot: u32,
    },
    /// Resubmit every failed slot of a campaign
    Resubmit(ResubmitArgs),
}

/// Resources of the compute jobs
#[derive(Args, Debug)]
struct BatchArgs {
    /// Partition, `default` selects the default of the cluster
    #[arg(short, long, default_value = "default")]
    partition: String,
    /// Memory per job in GB
    #[arg(long, default_value_t = 4)]
    mem: u32,
    /// Time limit per job in hours
    #[arg(long, default_value_t = 10)]
    hours: u32,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    workdir: PathBuf,
    #[arg(short, long)]
    input: Option<PathBuf>,
    #[arg(short = 't', long)]
    process: Process,
    /// Number of events per slot, 0 keeps the value of the input
    #[arg(short, long, default_value_t = 0)]
    events: u64,
    #[arg(short, long)]
    grids: Option<PathBuf>,
    #[arg(short, long, default_value = "")]
    version: String,
    /// Number of slots
    #[arg(short = 'n', long, default_value_t = 1)]
    slots: u32,
    #[arg(long, default_value_t = 0)]
    minslot: u32,
    #[arg(short, long = "scalereweight", conflicts_with_all = ["minpdf", "maxpdf"])]
    scale_reweight: bool,
    #[arg(long, requires_all = ["maxpdf", "minid"])]
    minpdf: Option<u32>,
    #[arg(long, requires = "minpdf")]
    maxpdf: Option<u32>,
    #[arg(long)]
    minid: Option<u32>,
    /// Chain resubmission of failed slots after the campaign
    #[arg(long)]
    resubmit: bool,
    #[arg(long, requires = "resubmit")]
    max_iterations: Option<u32>,
    /// Dry run, log the jobs instead of submitting them
    #[arg(long = "test")]
    dry_run: bool,
    #[command(flatten)]
    batch: BatchArgs,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    workdir: PathBuf,
    #[arg(short, long)]
    input: Option<PathBuf>,
    #[arg(short = 't', long)]
    process: Process,
    #[arg(short, long, default_value_t = 0)]
    events: u64,
    #[arg(short, long)]
    grids: Option<PathBuf>,
    #[arg(long, env = "SLURM_ARRAY_TASK_ID")]
    slot: Option<u32>,
    #[arg(long = "slotoffset", default_value_t = 0)]
    slot_offset: u32,
    #[arg(short, long = "scalereweight")]
    scale_reweight: bool,
    #[arg(long)]
    minpdf: Option<u32>,
    #[arg(long)]
    maxpdf: Option<u32>,
    #[arg(long)]
    minid: Option<u32>,
    #[arg(short, long, default_value = "")]
    version: String,
}

#[derive(Args, Debug)]
struct ResubmitArgs {
    workdir: PathBuf,
    #[arg(short, long)]
    version: Option<String>,
    #[arg(long)]
    process: Option<Process>,
    /// Weight id of the first PDF member
    #[arg(long = "minID", requires = "minpdf")]
    min_id: Option<u32>,
    /// PDF member belonging to the first PDF weight id
    #[arg(long, requires = "min_id")]
    minpdf: Option<u32>,
    #[arg(long = "scalereweight", conflicts_with = "minpdf")]
    scale_reweight: bool,
    #[arg(short, long)]
    input: Option<PathBuf>,
    #[arg(short, long)]
    grids: Option<PathBuf>,
    #[arg(short, long)]
    events: Option<u64>,
    /// Dry run, log what would be resubmitted
    #[arg(short = 't', long = "test")]
    dry_run: bool,
    #[arg(long, default_value_t = 1)]
    iteration: u32,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[command(flatten)]
    batch: BatchArgs,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigErrors),
    #[error("Submission failed")]
    Submit(#[from] SubmitError),
    #[error("Resubmission failed")]
    Resubmit(#[from] ResubmitError),
    #[error("Check failed")]
    Check(#[from] CheckError),
    #[error("Failed to set up the slot")]
    RunnerInit(#[source] RunnerError),
    #[error("Failed to run POWHEG")]
    RunnerRun(#[source] RunnerError),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Submit(error) if error.is_configuration() => 1,
            Self::Resubmit(ResubmitError::MissingReport(_)) => 1,
            Self::Resubmit(ResubmitError::Submit(error)) if error.is_configuration() => 1,
            Self::Submit(_) | Self::Resubmit(_) | Self::Check(_) => 2,
            Self::RunnerInit(_) => 3,
            Self::RunnerRun(_) => 4,
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Everything submitting commands need from the runner configuration
struct Submission {
    executor: Executors,
    cluster: Cluster,
    program: PathBuf,
    global_args: Vec<String>,
}

impl Submission {
    fn load(cli: &Cli, dry_run: bool) -> Result<Self, ConfigErrors> {
        let config = match &cli.config {
            Some(path) => RunnerConfig::load(path)?,
            None => RunnerConfig::default(),
        };
        if config.preflight_checks() {
            return Err(ConfigErrors::Preflight);
        }

        let cluster = config.resolve_cluster(cli.cluster)?;
        let program = config.program()?;
        let executor = Executors::load(&config, cluster, dry_run)?;

        // jobs must not depend on the hostname of the compute node
        let mut global_args = vec!["--cluster".to_owned(), cluster.name().to_owned()];
        if let Some(path) = &cli.config {
            let path = fs::canonicalize(path).map_err(|_| ConfigErrors::FileNotFound(path.clone()))?;
            global_args.extend(["--config".to_owned(), path.to_string_lossy().into_owned()]);
        }
        if cli.debug {
            global_args.push("--debug".to_owned());
        }

        Ok(Self {
            executor,
            cluster,
            program,
            global_args,
        })
    }

    fn pipeline(&mut self, batch: &BatchArgs) -> Pipeline<'_> {
        let batch = BatchConfig::new(self.cluster)
            .with_partition(batch.partition.clone())
            .with_memory(batch.mem)
            .with_hours(batch.hours);
        Pipeline::new(&mut self.executor, self.program.clone(), self.global_args.clone(), batch)
    }
}

/// absolute path of an existing file or directory, jobs run in a different directory
fn absolute(path: &Path) -> Result<PathBuf, ConfigErrors> {
    fs::canonicalize(path).map_err(|_| ConfigErrors::FileNotFound(path.to_owned()))
}

fn submit(cli: &Cli, args: &SubmitArgs) -> Result<(), CliError> {
    fs::create_dir_all(&args.workdir).map_err(ConfigErrors::MetadataNotFound)?;
    let workdir = absolute(&args.workdir)?;

    let (reweight, request) = match (args.scale_reweight, args.minpdf, args.maxpdf, args.minid) {
        (true, _, _, min_id) => (
            Reweight::Scale {
                min_id: min_id.unwrap_or(0),
            },
            ReweightRequest::Scale,
        ),
        (false, Some(min_pdf), Some(max_pdf), Some(min_id)) => (
            Reweight::Pdf {
                min_pdf,
                max_pdf,
                min_id,
            },
            ReweightRequest::Pdf { min_id, min_pdf },
        ),
        _ => (Reweight::None, ReweightRequest::None),
    };

    let mut config = SimConfig::new(&workdir, args.process)
        .with_version(args.version.clone())
        .with_events(args.events)
        .with_min_slot(args.minslot)
        .with_reweight(reweight);
    match &args.input {
        Some(input) => config = config.with_input(absolute(input)?),
        None if reweight == Reweight::None => {
            error!("A base campaign requires a POWHEG input (-i)");
            return Err(ConfigErrors::FileNotFound(PathBuf::from("powheg.input")).into());
        }
        None => {}
    }
    if let Some(grids) = &args.grids {
        config = config.with_grids(absolute(grids)?);
    }

    let params = CampaignParams {
        partition: args.batch.partition.clone(),
        memory_gb: args.batch.mem,
        hours: args.batch.hours,
        overrides: Overrides {
            version: (!args.version.is_empty()).then(|| args.version.clone()),
            process: Some(args.process),
            ..Default::default()
        },
        reweight: request,
        dry_run: false,
        iteration: 1,
        max_iterations: args.max_iterations,
    };
    let resubmit_args = args.resubmit.then(|| params.arguments(&workdir, 1));

    let mut submission = Submission::load(cli, args.dry_run)?;
    let jobs = submission
        .pipeline(&args.batch)
        .submit_campaign(&config, args.slots, resubmit_args)?;

    info!(
        compute = %jobs.compute,
        check = %jobs.check,
        summary = %jobs.summary,
        "Campaign submitted to {}",
        submission.cluster
    );
    if let Some(resubmit) = jobs.resubmit {
        info!(job_id = %resubmit, "Resubmission of failed slots chained");
    }

    Ok(())
}

fn run(args: RunArgs) -> Result<(), CliError> {
    info!("{VERSION_MARKER} {}", args.version);
    info!("{ENVIRONMENT_MARKER} {}", std::env::args().join(" "));

    let options = RunOptions {
        workdir: args.workdir,
        input: args.input,
        process: args.process,
        events: args.events,
        grids: args.grids,
        slot: args.slot,
        slot_offset: args.slot_offset,
        scale_reweight: args.scale_reweight,
        min_pdf: args.minpdf,
        max_pdf: args.maxpdf,
        min_id: args.minid,
        version: args.version,
    };

    let runner = SlotRunner::init(options).map_err(CliError::RunnerInit)?;
    let runs = runner.run().map_err(CliError::RunnerRun)?;
    debug!(runs = runs, "Slot runner done");

    Ok(())
}

fn check(workdir: &Path, slot: Option<u32>) -> Result<(), CliError> {
    if let Some(slot) = slot {
        check_slot(&slot_dir(workdir, slot))?;
        return Ok(());
    }

    let slots = Collector::slots(workdir).map_err(CheckError::from)?.collect_vec();
    info!("Checking {} slots in {}", slots.len(), workdir.display());

    let failed = slots
        .par_iter()
        .filter(|dir| match check_slot(dir) {
            Ok(_) => false,
            Err(error) => {
                error!(slot_dir = %dir.display(), "Failed to check slot: {error}");
                true
            }
        })
        .count();
    if failed > 0 {
        warn!("{failed} slots could not be checked");
    }

    Ok(())
}

fn summary(workdir: &Path, slots: Option<u32>, min_slot: u32) -> Result<(), CliError> {
    let expected = slots.map(|slots| min_slot..min_slot.saturating_add(slots));
    let summary = CampaignSummary::from_workdir(workdir, expected)?;
    let path = summary.store(workdir)?;
    info!(failing = summary.failing(), "Report written to {}", path.display());

    Ok(())
}

fn resubmit(cli: &Cli, args: &ResubmitArgs) -> Result<(), CliError> {
    let workdir = absolute(&args.workdir)?;

    let reweight = match (args.scale_reweight, args.min_id, args.minpdf) {
        (true, _, _) => ReweightRequest::Scale,
        (false, Some(min_id), Some(min_pdf)) => ReweightRequest::Pdf { min_id, min_pdf },
        _ => ReweightRequest::None,
    };
    let overrides = Overrides {
        input: args.input.as_deref().map(absolute).transpose()?,
        grids: args.grids.as_deref().map(absolute).transpose()?,
        events: args.events,
        version: args.version.clone(),
        process: args.process,
    };
    let params = CampaignParams {
        partition: args.batch.partition.clone(),
        memory_gb: args.batch.mem,
        hours: args.batch.hours,
        overrides,
        reweight,
        dry_run: args.dry_run,
        iteration: args.iteration,
        max_iterations: args.max_iterations,
    };

    let mut submission = Submission::load(cli, args.dry_run)?;
    let outcome = resubmit_failed(&workdir, &params, &mut submission.pipeline(&args.batch))?;

    if outcome.is_done() {
        info!("All slots are fine, campaign is complete");
    } else {
        info!(
            resubmitted = outcome.check_jobs.len(),
            skipped = outcome.skipped.len(),
            final_check = ?outcome.final_check.map(|id| id.0),
            next_iteration = ?outcome.next_iteration.map(|id| id.0),
            "Iteration {} done",
            params.iteration
        );
    }

    Ok(())
}

fn log_error(error: &CliError) {
    error!("{error}");
    let mut source = error.source();
    while let Some(cause) = source {
        error!("  caused by: {cause}");
        source = cause.source();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let result = match &cli.command {
        Commands::Submit(args) => submit(&cli, args),
        Commands::Run(args) => run(args.clone()),
        Commands::Check { workdir, slot } => check(workdir, *slot),
        Commands::Summary {
            workdir,
            slots,
            minslot,
        } => summary(workdir, *slots, *minslot),
        Commands::Resubmit(args) => resubmit(&cli, args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log_error(&error);
            ExitCode::from(error.exit_code())
        }
    }
}
