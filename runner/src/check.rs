pub mod report;
pub mod summary;

use crate::{
    collector::CollectorError,
    events::{self, EventFileInfo, EVENT_FILE},
};
use itertools::Itertools;
use std::{
    collections::BTreeSet,
    fs,
    io::Error,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Name of the per-slot check record written next to the event file
pub const CHECK_FILE: &str = "check_pwgevents.txt";
/// Name of the campaign report written into the working directory
pub const SUMMARY_FILE: &str = "checksummary_pwgevents.log";

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Failed to access {0}")]
    Io(PathBuf, #[source] Error),
    #[error("Missing key '{0}' in check record")]
    MissingKey(&'static str),
    #[error("Invalid value '{value}' for key '{key}' in check record")]
    InvalidValue { key: &'static str, value: String },
    #[error("Malformed line in check record: {0}")]
    MalformedLine(String),
    #[error("Failed to collect check records")]
    Collect(#[from] CollectorError),
}

/// Flat, re-parseable per-slot record of an event file check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummaryEntry {
    pub filename: PathBuf,
    pub exists: bool,
    pub nonempty: bool,
    pub complete: bool,
    pub events: u64,
    pub weight_ids: BTreeSet<String>,
}

impl CheckSummaryEntry {
    pub fn from_info(filename: impl Into<PathBuf>, info: &EventFileInfo) -> Self {
        Self {
            filename: filename.into(),
            exists: info.exists,
            nonempty: info.nonempty,
            complete: info.complete,
            events: info.event_count,
            weight_ids: info.all_weight_ids(),
        }
    }

    /// entry for an event file no check record exists for
    pub fn missing(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            exists: false,
            nonempty: false,
            complete: false,
            events: 0,
            weight_ids: BTreeSet::new(),
        }
    }

    pub fn has_all_weights(&self, expected: &BTreeSet<String>) -> bool {
        self.weight_ids.is_superset(expected)
    }

    /// expected weights not present in this entry, sorted
    pub fn missing_weights<'a>(&'a self, expected: &'a BTreeSet<String>) -> Vec<&'a str> {
        expected
            .difference(&self.weight_ids)
            .map(String::as_str)
            .collect()
    }

    /// Serialise into the check record format, keys in fixed order
    pub fn to_record(&self) -> String {
        let weights = if self.weight_ids.is_empty() {
            String::new()
        } else {
            format!(" {}", self.weight_ids.iter().join(", "))
        };

        format!(
            "exists: {}\nnonempty: {}\nevents: {}\ncomplete: {}\nweights:{}\n",
            yes_no(self.exists),
            yes_no(self.nonempty),
            self.events,
            yes_no(self.complete),
            weights
        )
    }

    /// Parse a check record, `filename` is the event file the record describes
    pub fn from_record(filename: impl Into<PathBuf>, record: &str) -> Result<Self, CheckError> {
        let mut exists = None;
        let mut nonempty = None;
        let mut complete = None;
        let mut events = None;
        let mut weights = None;

        for line in record.lines().filter(|line| !line.trim().is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| CheckError::MalformedLine(line.to_owned()))?;
            let value = value.trim();

            match key.trim() {
                "exists" => exists = Some(parse_yes_no("exists", value)?),
                "nonempty" => nonempty = Some(parse_yes_no("nonempty", value)?),
                "complete" => complete = Some(parse_yes_no("complete", value)?),
                "events" => {
                    events = Some(u64::from_str(value).map_err(|_| CheckError::InvalidValue {
                        key: "events",
                        value: value.to_owned(),
                    })?)
                }
                "weights" => {
                    weights = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|weight| !weight.is_empty())
                            .map(str::to_owned)
                            .collect(),
                    )
                }
                other => debug!(key = other, "Ignoring unknown key in check record"),
            }
        }

        Ok(Self {
            filename: filename.into(),
            exists: exists.ok_or(CheckError::MissingKey("exists"))?,
            nonempty: nonempty.ok_or(CheckError::MissingKey("nonempty"))?,
            events: events.ok_or(CheckError::MissingKey("events"))?,
            complete: complete.ok_or(CheckError::MissingKey("complete"))?,
            weight_ids: weights.ok_or(CheckError::MissingKey("weights"))?,
        })
    }

    /// Load the check record at `path`, the described event file is its sibling
    pub fn load(path: &Path) -> Result<Self, CheckError> {
        let record =
            fs::read_to_string(path).map_err(|error| CheckError::Io(path.to_owned(), error))?;
        Self::from_record(path.with_file_name(EVENT_FILE), &record)
    }

    pub fn store(&self, path: &Path) -> Result<(), CheckError> {
        fs::write(path, self.to_record()).map_err(|error| CheckError::Io(path.to_owned(), error))
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn parse_yes_no(key: &'static str, value: &str) -> Result<bool, CheckError> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(CheckError::InvalidValue {
            key,
            value: value.to_owned(),
        }),
    }
}

/// Check a single slot directory: decode its event file and write the check record.
///
/// The directory is created if a failed job did not leave one behind, so that the
/// absence of the event file is recorded.
#[instrument(level = "info")]
pub fn check_slot(slot_dir: &Path) -> Result<CheckSummaryEntry, CheckError> {
    let event_file = slot_dir.join(EVENT_FILE);
    let info = events::parse(&event_file);
    let entry = CheckSummaryEntry::from_info(&event_file, &info);

    fs::create_dir_all(slot_dir).map_err(|error| CheckError::Io(slot_dir.to_owned(), error))?;
    entry.store(&slot_dir.join(CHECK_FILE))?;

    info!(
        exists = entry.exists,
        nonempty = entry.nonempty,
        complete = entry.complete,
        events = entry.events,
        weights = entry.weight_ids.len(),
        "Checked {}",
        event_file.display()
    );

    Ok(entry)
}
