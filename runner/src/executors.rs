pub mod record;
pub mod slurm;

use crate::{
    cluster::Cluster,
    config::{ConfigErrors, RunnerConfig},
};
use itertools::Itertools;
use std::{
    fmt::Display,
    io::Error,
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn {0}")]
    Spawn(String, #[source] Error),
    #[error("Failed waiting on {0}")]
    Wait(String, #[source] Error),
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} failed with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("No job id in scheduler output: {0}")]
    MissingJobId(String),
}

/// Scheduler job id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resources and placement of a submission, maps 1:1 to the scheduler flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub cluster: Cluster,
    /// `default` selects the default partition of the cluster
    pub partition: String,
    pub job_array_size: u32,
    pub cpus: u32,
    pub memory_gb: u32,
    pub hours: u32,
    pub dependency: Vec<JobId>,
}

impl BatchConfig {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            partition: "default".to_owned(),
            job_array_size: 1,
            cpus: 1,
            memory_gb: 4,
            hours: 10,
            dependency: Vec::new(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn with_array_size(mut self, size: u32) -> Self {
        self.job_array_size = size;
        self
    }

    pub fn with_memory(mut self, memory_gb: u32) -> Self {
        self.memory_gb = memory_gb;
        self
    }

    pub fn with_hours(mut self, hours: u32) -> Self {
        self.hours = hours;
        self
    }

    pub fn depends_on(mut self, jobs: impl IntoIterator<Item = JobId>) -> Self {
        self.dependency = jobs.into_iter().collect();
        self
    }
}

/// What a batch job executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    /// command line, wrapped into a script by the scheduler
    Wrap(Vec<String>),
    /// executable script submitted as is
    Script(PathBuf),
}

impl JobCommand {
    /// command line as a single shell string
    pub fn to_shell(&self) -> String {
        match self {
            Self::Wrap(args) => args.iter().map(|arg| shell_quote(arg)).join(" "),
            Self::Script(path) => shell_quote(&path.to_string_lossy()),
        }
    }
}

/// Quote `arg` for a POSIX shell if it contains anything but safe characters
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));

    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// A single submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub command: JobCommand,
    pub job_name: String,
    pub log_file: PathBuf,
    /// inclusive array index range
    pub array: Option<(u32, u32)>,
    /// overrides the hours of the batch config
    pub time_limit_minutes: Option<u32>,
    pub batch: BatchConfig,
}

impl JobRequest {
    pub fn new(
        command: JobCommand,
        job_name: impl Into<String>,
        log_file: impl Into<PathBuf>,
        batch: BatchConfig,
    ) -> Self {
        Self {
            command,
            job_name: job_name.into(),
            log_file: log_file.into(),
            array: None,
            time_limit_minutes: None,
            batch,
        }
    }

    pub fn with_array(mut self, first: u32, last: u32) -> Self {
        self.array = Some((first, last));
        self
    }

    pub fn with_time_limit_minutes(mut self, minutes: u32) -> Self {
        self.time_limit_minutes = Some(minutes);
        self
    }

    /// `HH:MM:SS` time limit passed to the scheduler
    pub fn time_limit(&self) -> String {
        let minutes = self
            .time_limit_minutes
            .unwrap_or(self.batch.hours.saturating_mul(60));
        format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
    }
}

#[derive(Debug)]
pub enum Executors {
    Slurm(slurm::SlurmGateway),
    Record(record::RecordingGateway),
}

impl Executors {
    /// Select the gateway, `dry_run` never talks to the scheduler
    pub fn load(config: &RunnerConfig, cluster: Cluster, dry_run: bool) -> Result<Self, ConfigErrors> {
        if dry_run {
            return Ok(Self::Record(record::RecordingGateway::new()));
        }

        Ok(Self::Slurm(slurm::SlurmGateway::new(
            config.submit.program.clone(),
            Duration::from_millis(config.submit.timeout_ms),
            config.profile(cluster),
        )))
    }

    pub fn submit(&mut self, request: &JobRequest) -> Result<JobId, ExecutorError> {
        match self {
            Self::Slurm(gateway) => gateway.submit(request),
            Self::Record(gateway) => Ok(gateway.submit(request)),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::Record(_))
    }
}
