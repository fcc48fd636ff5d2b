use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Cluster {0} is not supported")]
    Unsupported(String),
    #[error("Cannot detect cluster from hostname {0}")]
    UnknownHost(String),
    #[error("Failed to retrieve hostname")]
    Hostname,
}

/// Batch systems campaigns are run on
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Cluster {
    #[serde(rename = "CADES")]
    Cades,
    #[serde(rename = "PERLMUTTER")]
    Perlmutter,
    #[serde(rename = "B587")]
    B587,
}

impl Cluster {
    /// Detect the cluster from the name of the current host
    pub fn detect() -> Result<Self, ClusterError> {
        match nix::unistd::gethostname() {
            Ok(hostname) => Self::from_hostname(&hostname.to_string_lossy()),
            Err(error) => {
                error!(error = ?error, "Failed to retrieve hostname for cluster detection: {error}");
                Err(ClusterError::Hostname)
            }
        }
    }

    pub fn from_hostname(hostname: &str) -> Result<Self, ClusterError> {
        debug!(hostname = hostname, "Detecting cluster");

        // checked in this order, "or" is a substring match on CADES login nodes
        if hostname.contains("PERLMUTTER") {
            Ok(Self::Perlmutter)
        } else if hostname.contains("or") {
            Ok(Self::Cades)
        } else if hostname.contains("pc") {
            Ok(Self::B587)
        } else {
            Err(ClusterError::UnknownHost(hostname.to_owned()))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cades => "CADES",
            Self::Perlmutter => "PERLMUTTER",
            Self::B587 => "B587",
        }
    }
}

impl Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cluster {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CADES" => Ok(Self::Cades),
            "PERLMUTTER" => Ok(Self::Perlmutter),
            "B587" => Ok(Self::B587),
            _ => Err(ClusterError::Unsupported(s.to_owned())),
        }
    }
}

/// Site specific sbatch settings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClusterProfile {
    /// `-A <account>`
    #[serde(default)]
    pub account: Option<String>,
    /// used when a submission asks for the `default` partition
    pub default_partition: String,
    /// the partition is passed as `--qos=` instead of `--partition`
    #[serde(default)]
    pub use_qos: bool,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub licenses: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// time limit and memory are only forwarded to the scheduler if set
    #[serde(default)]
    pub request_resources: bool,
    /// command prefix for jobs, e.g. an environment setup script
    #[serde(default)]
    pub wrapper: Option<String>,
}

impl ClusterProfile {
    pub fn builtin(cluster: Cluster) -> Self {
        match cluster {
            Cluster::Cades => Self {
                account: Some("birthright".to_owned()),
                default_partition: "high_mem_cd".to_owned(),
                use_qos: false,
                constraint: None,
                licenses: None,
                image: None,
                request_resources: true,
                wrapper: None,
            },
            Cluster::Perlmutter => Self {
                account: None,
                default_partition: "shared".to_owned(),
                use_qos: true,
                constraint: Some("cpu".to_owned()),
                licenses: Some("cvmfs,cfs".to_owned()),
                image: Some("docker:mfasel/cc8-alice:latest".to_owned()),
                request_resources: true,
                wrapper: None,
            },
            Cluster::B587 => Self {
                account: None,
                default_partition: "long".to_owned(),
                use_qos: false,
                constraint: None,
                licenses: None,
                image: None,
                request_resources: false,
                wrapper: None,
            },
        }
    }

    /// Resolve the partition name of a request
    pub fn partition<'a>(&'a self, requested: &'a str) -> &'a str {
        if requested.is_empty() || requested == "default" {
            &self.default_partition
        } else {
            requested
        }
    }
}
