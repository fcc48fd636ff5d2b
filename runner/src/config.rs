use crate::cluster::{Cluster, ClusterError, ClusterProfile};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_owned()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to read configuration {0}")]
    ReadConfig(PathBuf, #[source] Error),
    #[error("Configuration is not valid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Cluster could not be determined")]
    Cluster(#[from] ClusterError),
    #[error("Configuration failed preflight checks")]
    Preflight,
}

fn default_submit_program() -> PathBuf {
    PathBuf::from("sbatch")
}

fn default_submit_timeout() -> u64 {
    30_000
}

/// How jobs are handed to the scheduler
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SubmitConfig {
    #[serde(default = "default_submit_program")]
    pub program: PathBuf,
    // bounded wait for a single sbatch call
    #[serde(default = "default_submit_timeout")]
    pub timeout_ms: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            program: default_submit_program(),
            timeout_ms: default_submit_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // cluster to submit to, detected from the hostname if not set here or on the command line
    #[serde(default)]
    pub cluster: Option<Cluster>,
    // runner binary invoked by the batch jobs, defaults to the running executable
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub submit: SubmitConfig,
    // overrides of the builtin cluster profiles
    #[serde(default)]
    pub clusters: BTreeMap<Cluster, ClusterProfile>,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content =
            fs::read_to_string(path).map_err(|error| ConfigErrors::ReadConfig(path.to_owned(), error))?;
        let config: Self = serde_yaml::from_str(&content)?;
        debug!("Loaded configuration from {}", path.display());

        Ok(config)
    }

    /// Command line selection wins over the file, the hostname is the last resort
    pub fn resolve_cluster(&self, requested: Option<Cluster>) -> Result<Cluster, ConfigErrors> {
        let cluster = match requested.or(self.cluster) {
            Some(cluster) => cluster,
            None => Cluster::detect()?,
        };
        info!("Submitting for cluster {cluster}");

        Ok(cluster)
    }

    pub fn profile(&self, cluster: Cluster) -> ClusterProfile {
        self.clusters
            .get(&cluster)
            .cloned()
            .unwrap_or_else(|| ClusterProfile::builtin(cluster))
    }

    /// the runner binary batch jobs should execute
    pub fn program(&self) -> Result<PathBuf, ConfigErrors> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    /// Returns true if any problem was found, all problems are logged
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if let Some(program) = &self.program {
            match check_executable(program) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "program {} is not executable, batch jobs will fail",
                        program.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if program ({}) is an executable: {e}",
                        program.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if self.submit.program.as_os_str().is_empty() {
            error!("submit.program cannot be empty");
            contains_error = true;
        }

        if self.submit.timeout_ms == 0 {
            error!("submit.timeout_ms cannot be 0, every submission would time out");
            contains_error = true;
        }

        for (cluster, profile) in self.clusters.iter() {
            if profile.default_partition.is_empty() {
                error!("clusters.{cluster}.default_partition cannot be empty");
                contains_error = true;
            }

            if profile.image.is_some() && profile.licenses.is_none() {
                warn!("clusters.{cluster} sets an image without licenses, this might cause problems");
            }
        }

        contains_error
    }
}
