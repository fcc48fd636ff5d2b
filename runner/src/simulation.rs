use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    fs,
    io::Error,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const LOG_DIR: &str = "logs";
pub const STAGE_DIR: &str = "stage";
pub const STAGE_CONFIG: &str = "simconfig.yaml";

/// Marker lines the slot runner writes into its job log
pub const VERSION_MARKER: &str = "Request POWHEG version:";
pub const ENVIRONMENT_MARKER: &str = "Running in environment:";

#[derive(Error, Debug)]
pub enum SimConfigError {
    #[error("Failed to access {0}")]
    Io(PathBuf, #[source] Error),
    #[error("Invalid simulation record {0}")]
    Yaml(PathBuf, #[source] serde_yaml::Error),
    #[error("Process {0} is not supported, valid are dijet, directphoton, hvq, W, Z")]
    InvalidProcess(String),
    #[error("No simulation record or job log found for slot {0}")]
    NoRecord(u32),
    #[error("Job log {path} does not provide {field}")]
    IncompleteLog { path: PathBuf, field: &'static str },
    #[error("Job log {path} has invalid value '{value}' for {flag}")]
    InvalidLogValue {
        path: PathBuf,
        flag: &'static str,
        value: String,
    },
}

/// POWHEG processes a campaign can run
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Process {
    #[serde(rename = "dijet")]
    Dijet,
    #[serde(rename = "directphoton")]
    DirectPhoton,
    #[serde(rename = "hvq")]
    Hvq,
    W,
    Z,
}

impl Process {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dijet => "dijet",
            Self::DirectPhoton => "directphoton",
            Self::Hvq => "hvq",
            Self::W => "W",
            Self::Z => "Z",
        }
    }

    /// name of the POWHEG binary for the process
    pub fn executable(&self) -> String {
        format!("pwhg_main_{}", self.name())
    }
}

impl Display for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Process {
    type Err = SimConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dijet" => Ok(Self::Dijet),
            "directphoton" => Ok(Self::DirectPhoton),
            "hvq" => Ok(Self::Hvq),
            "W" => Ok(Self::W),
            "Z" => Ok(Self::Z),
            other => Err(SimConfigError::InvalidProcess(other.to_owned())),
        }
    }
}

/// Which weights a run produces
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Reweight {
    /// base run producing the nominal events
    #[default]
    None,
    /// 3x3 scale variations, weight ids starting at `min_id`
    Scale { min_id: u32 },
    /// PDF members `min_pdf..=max_pdf`, weight ids starting at `min_id`
    Pdf {
        min_pdf: u32,
        max_pdf: u32,
        min_id: u32,
    },
}

/// Everything needed to (re)run a slot
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    pub workdir: PathBuf,
    pub powheg_version: String,
    #[serde(default)]
    pub powheg_input: Option<PathBuf>,
    /// 0 keeps the number of events of the input file
    #[serde(default)]
    pub events: u64,
    pub process: Process,
    #[serde(default)]
    pub grid_repository: Option<PathBuf>,
    #[serde(default)]
    pub min_slot: u32,
    #[serde(default)]
    pub reweight: Reweight,
}

impl SimConfig {
    pub fn new(workdir: impl Into<PathBuf>, process: Process) -> Self {
        Self {
            workdir: workdir.into(),
            powheg_version: String::new(),
            powheg_input: None,
            events: 0,
            process,
            grid_repository: None,
            min_slot: 0,
            reweight: Reweight::None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.powheg_version = version.into();
        self
    }

    pub fn with_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.powheg_input = Some(input.into());
        self
    }

    pub fn with_events(mut self, events: u64) -> Self {
        self.events = events;
        self
    }

    pub fn with_grids(mut self, grids: impl Into<PathBuf>) -> Self {
        self.grid_repository = Some(grids.into());
        self
    }

    pub fn with_min_slot(mut self, slot: u32) -> Self {
        self.min_slot = slot;
        self
    }

    pub fn with_reweight(mut self, reweight: Reweight) -> Self {
        self.reweight = reweight;
        self
    }

    pub fn is_scale_reweight(&self) -> bool {
        matches!(self.reweight, Reweight::Scale { .. })
    }

    pub fn is_pdf_reweight(&self) -> bool {
        matches!(self.reweight, Reweight::Pdf { .. })
    }

    pub fn is_reweight(&self) -> bool {
        self.reweight != Reweight::None
    }

    pub fn pdf_range(&self) -> Option<(u32, u32)> {
        match self.reweight {
            Reweight::Pdf {
                min_pdf, max_pdf, ..
            } => Some((min_pdf, max_pdf)),
            _ => None,
        }
    }

    pub fn min_weight_id(&self) -> Option<u32> {
        match self.reweight {
            Reweight::None => None,
            Reweight::Scale { min_id } | Reweight::Pdf { min_id, .. } => Some(min_id),
        }
    }

    /// Arguments of the `run` subcommand executing this configuration.
    ///
    /// With `slot` the run is pinned to that slot, otherwise the slot is taken
    /// from the array index of the job.
    pub fn run_arguments(&self, slot: Option<u32>) -> Vec<String> {
        let mut args = vec![
            "run".to_owned(),
            self.workdir.to_string_lossy().into_owned(),
            "-t".to_owned(),
            self.process.to_string(),
        ];

        if !self.powheg_version.is_empty() {
            args.extend(["-v".to_owned(), self.powheg_version.clone()]);
        }

        if !self.is_reweight() {
            if let Some(input) = &self.powheg_input {
                args.extend(["-i".to_owned(), input.to_string_lossy().into_owned()]);
            }
            if self.events > 0 {
                args.extend(["-e".to_owned(), self.events.to_string()]);
            }
            // reweighting runs on the existing events, grids only matter for base runs
            if let Some(grids) = &self.grid_repository {
                args.extend(["-g".to_owned(), grids.to_string_lossy().into_owned()]);
            }
        }

        if let Some(slot) = slot {
            args.extend(["--slot".to_owned(), slot.to_string()]);
        }

        match self.reweight {
            Reweight::None => {}
            Reweight::Scale { min_id } => {
                args.extend(["-s".to_owned(), "--minid".to_owned(), min_id.to_string()]);
            }
            Reweight::Pdf {
                min_pdf,
                max_pdf,
                min_id,
            } => args.extend([
                "--minpdf".to_owned(),
                min_pdf.to_string(),
                "--maxpdf".to_owned(),
                max_pdf.to_string(),
                "--minid".to_owned(),
                min_id.to_string(),
            ]),
        }

        args
    }

    pub fn load(path: &Path) -> Result<Self, SimConfigError> {
        let content =
            fs::read_to_string(path).map_err(|error| SimConfigError::Io(path.to_owned(), error))?;
        serde_yaml::from_str(&content).map_err(|error| SimConfigError::Yaml(path.to_owned(), error))
    }

    pub fn store(&self, path: &Path) -> Result<(), SimConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| SimConfigError::Io(parent.to_owned(), error))?;
        }

        let content = serde_yaml::to_string(self)
            .map_err(|error| SimConfigError::Yaml(path.to_owned(), error))?;
        fs::write(path, content).map_err(|error| SimConfigError::Io(path.to_owned(), error))
    }

    /// Persist as record of a single-slot submission
    pub fn store_for_slot(&self, slot: u32) -> Result<PathBuf, SimConfigError> {
        let path = slot_record_path(&self.workdir, slot);
        self.store(&path)?;
        debug!(slot = slot, "Stored simulation record {}", path.display());
        Ok(path)
    }

    /// Persist as record of an array submission
    pub fn store_for_stage(&self) -> Result<PathBuf, SimConfigError> {
        let path = stage_record_path(&self.workdir);
        self.store(&path)?;
        debug!("Stored simulation record {}", path.display());
        Ok(path)
    }

    /// Recover the configuration a slot was originally submitted with.
    ///
    /// Structured records are preferred, the job log is only consulted for campaigns
    /// that predate them.
    #[instrument(level = "debug")]
    pub fn reconstruct(workdir: &Path, slot: u32) -> Result<Self, SimConfigError> {
        let record = slot_record_path(workdir, slot);
        if record.is_file() {
            debug!(slot = slot, "Using slot record {}", record.display());
            return Self::load(&record);
        }

        let stage = stage_record_path(workdir);
        if stage.is_file() {
            debug!(slot = slot, "Using campaign record {}", stage.display());
            let mut config = Self::load(&stage)?;
            config.min_slot = slot;
            return Ok(config);
        }

        let log = job_log_path(workdir, slot);
        if log.is_file() {
            warn!(
                slot = slot,
                "No simulation record, falling back to job log {}",
                log.display()
            );
            let content =
                fs::read_to_string(&log).map_err(|error| SimConfigError::Io(log.clone(), error))?;
            return Self::from_job_log(workdir, slot, &log, &content);
        }

        Err(SimConfigError::NoRecord(slot))
    }

    /// Keyword parse of the job log written by the slot runner
    pub fn from_job_log(
        workdir: &Path,
        slot: u32,
        log: &Path,
        content: &str,
    ) -> Result<Self, SimConfigError> {
        let mut version = None;
        let mut process = None;
        let mut input = None;
        let mut grids = None;
        let mut events = 0;

        for line in content.lines() {
            if let Some(position) = line.find(VERSION_MARKER) {
                version = Some(line[position + VERSION_MARKER.len()..].trim().to_owned());
            } else if let Some(position) = line.find(ENVIRONMENT_MARKER) {
                let mut tokens = line[position + ENVIRONMENT_MARKER.len()..].split_whitespace();

                while let Some(token) = tokens.next() {
                    let value = match token {
                        "-i" | "-g" | "-e" | "-t" | "-v" => match tokens.next() {
                            Some(value) => value,
                            None => break,
                        },
                        _ => continue,
                    };

                    match token {
                        "-i" => input = Some(PathBuf::from(value)),
                        "-g" => grids = Some(PathBuf::from(value)),
                        "-e" => {
                            events = value.parse().map_err(|_| SimConfigError::InvalidLogValue {
                                path: log.to_owned(),
                                flag: "-e",
                                value: value.to_owned(),
                            })?
                        }
                        "-t" => process = Some(Process::from_str(value)?),
                        _ => {
                            // an explicit version on the command line wins over the marker
                            version = Some(value.to_owned());
                        }
                    }
                }
            }
        }

        let process = process.ok_or_else(|| SimConfigError::IncompleteLog {
            path: log.to_owned(),
            field: "the process (-t)",
        })?;
        let version = version.ok_or_else(|| SimConfigError::IncompleteLog {
            path: log.to_owned(),
            field: "the POWHEG version",
        })?;

        let mut config = Self::new(workdir, process)
            .with_version(version)
            .with_events(events)
            .with_min_slot(slot);
        config.powheg_input = input;
        config.grid_repository = grids;

        info!(slot = slot, "Reconstructed configuration from {}", log.display());
        Ok(config)
    }
}

pub fn slot_record_path(workdir: &Path, slot: u32) -> PathBuf {
    workdir.join(LOG_DIR).join(format!("simconfig{slot}.yaml"))
}

pub fn stage_record_path(workdir: &Path) -> PathBuf {
    workdir.join(STAGE_DIR).join(STAGE_CONFIG)
}

pub fn job_log_path(workdir: &Path, slot: u32) -> PathBuf {
    workdir.join(LOG_DIR).join(format!("joboutput{slot}.log"))
}
