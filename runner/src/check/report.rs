//! Re-parser for the campaign report. The marker strings below are shared with
//! [`super::summary`] and are the only contract between the aggregation job and the
//! resubmission controller, so they must not be reformatted.

use super::CheckError;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const MARKER_WEIGHT_IDS: &str = "Found weight IDs:";
pub const MARKER_NON_EXISTING: &str = "Non-existing pwgevents.lhe files:";
pub const MARKER_EMPTY: &str = "Empty pwgevents.lhe files:";
pub const MARKER_INCOMPLETE: &str = "Incomplete pwgevents.lhe files:";
pub const MARKER_MISSING_WEIGHTS: &str = "pwgevents.lhe files with missing weights:";
pub const SEPARATOR: &str = "----------------------------------------";
pub const MISSING_OPEN: &str = " (missing:";

/// Prefix left in front of every line by reports that were captured from a logger
const LEGACY_LOG_PREFIX: &str = "[INFO]: ";

/// Weight ids up to this value are scale variations, everything above is a PDF member
pub const MAX_SCALE_WEIGHT_ID: u32 = 7;
pub const MIN_SCALE_WEIGHT_ID: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot determine slot index from {slot_name}")]
pub struct SlotIndexError {
    pub slot_name: String,
}

/// Event file listed with missing weights in the campaign report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptedFile {
    pub path: PathBuf,
    pub missing_weight_ids: BTreeSet<String>,
}

impl CorruptedFile {
    pub fn new(path: impl Into<PathBuf>, missing: impl IntoIterator<Item = String>) -> Self {
        Self {
            path: path.into(),
            missing_weight_ids: missing.into_iter().collect(),
        }
    }

    /// The slot index, taken from the name of the directory containing the file
    pub fn slot_id(&self) -> Result<u32, SlotIndexError> {
        slot_id_from_path(&self.path)
    }

    fn numeric_missing(&self) -> impl Iterator<Item = u32> + '_ {
        self.missing_weight_ids
            .iter()
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .filter_map(|id| id.parse().ok())
    }

    /// missing scale variation ids, sorted
    pub fn missing_scale_weights(&self) -> Vec<u32> {
        let mut ids: Vec<_> = self
            .numeric_missing()
            .filter(|id| (MIN_SCALE_WEIGHT_ID..=MAX_SCALE_WEIGHT_ID).contains(id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// missing PDF member ids, sorted
    pub fn missing_pdf_weights(&self) -> Vec<u32> {
        let mut ids: Vec<_> = self
            .numeric_missing()
            .filter(|id| *id > MAX_SCALE_WEIGHT_ID)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Slot index of an event file path `<workdir>/<slot>/pwgevents.lhe`
pub fn slot_id_from_path(path: &Path) -> Result<u32, SlotIndexError> {
    let slot_name = path
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !slot_name.is_empty() && slot_name.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(slot) = slot_name.parse() {
            debug!(slot = slot, "Found slot");
            return Ok(slot);
        }
    }

    Err(SlotIndexError { slot_name })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    NonExisting,
    Empty,
    Incomplete,
    MissingWeights,
}

/// Everything the controller needs from a campaign report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub expected_weights: Vec<String>,
    pub non_existing: Vec<PathBuf>,
    pub empty: Vec<PathBuf>,
    pub incomplete: Vec<PathBuf>,
    pub missing_weights: Vec<CorruptedFile>,
}

impl CheckReport {
    pub fn load(path: &Path) -> Result<Self, CheckError> {
        let content =
            fs::read_to_string(path).map_err(|error| CheckError::Io(path.to_owned(), error))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut report = Self::default();
        let mut section = None;

        for line in content.lines() {
            let line = line.trim_end();
            let line = line.strip_prefix(LEGACY_LOG_PREFIX).unwrap_or(line);

            if let Some(current) = section {
                if line.contains(SEPARATOR) {
                    section = None;
                } else if !line.trim().is_empty() {
                    report.add_entry(current, line.trim());
                }
                continue;
            }

            if let Some(position) = line.find(MARKER_WEIGHT_IDS) {
                report.expected_weights = line[position + MARKER_WEIGHT_IDS.len()..]
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_owned)
                    .collect();
            } else if line.contains(MARKER_NON_EXISTING) {
                section = Some(Section::NonExisting);
            } else if line.contains(MARKER_EMPTY) {
                section = Some(Section::Empty);
            } else if line.contains(MARKER_INCOMPLETE) {
                section = Some(Section::Incomplete);
            } else if line.contains(MARKER_MISSING_WEIGHTS) {
                section = Some(Section::MissingWeights);
            }
        }

        report
    }

    fn add_entry(&mut self, section: Section, line: &str) {
        match section {
            Section::NonExisting => self.non_existing.push(PathBuf::from(line)),
            Section::Empty => self.empty.push(PathBuf::from(line)),
            Section::Incomplete => self.incomplete.push(PathBuf::from(line)),
            Section::MissingWeights => match line.rsplit_once(MISSING_OPEN) {
                Some((path, missing)) => {
                    let missing = missing.trim().trim_end_matches(')');
                    self.missing_weights.push(CorruptedFile::new(
                        path.trim(),
                        missing
                            .split(',')
                            .map(str::trim)
                            .filter(|id| !id.is_empty())
                            .map(str::to_owned),
                    ));
                }
                None => warn!(line = line, "Entry without missing weights in report, ignoring"),
            },
        }
    }

    /// event files that need a full resubmission of their slot
    pub fn failed_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.non_existing
            .iter()
            .chain(self.empty.iter())
            .chain(self.incomplete.iter())
    }

    pub fn is_clean(&self) -> bool {
        self.failed_files().next().is_none() && self.missing_weights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "Number of checkinfos: 4
Found weight IDs: 1, 12, 3, 9, main
Non-existing pwgevents.lhe files:
/campaign/0007/pwgevents.lhe
----------------------------------------
Incomplete pwgevents.lhe files:
/campaign/0002/pwgevents.lhe
/campaign/0003/pwgevents.lhe
----------------------------------------
pwgevents.lhe files with missing weights:
/campaign/0012/pwgevents.lhe (missing: 1, 12, 3, 9)
----------------------------------------
";

    #[test]
    fn parses_sections() {
        let report = CheckReport::parse(REPORT);
        assert_eq!(report.expected_weights, vec!["1", "12", "3", "9", "main"]);
        assert_eq!(report.non_existing, vec![PathBuf::from("/campaign/0007/pwgevents.lhe")]);
        assert!(report.empty.is_empty());
        assert_eq!(report.incomplete.len(), 2);
        assert_eq!(report.failed_files().count(), 3);

        let corrupted = &report.missing_weights[0];
        assert_eq!(corrupted.path, PathBuf::from("/campaign/0012/pwgevents.lhe"));
        assert_eq!(corrupted.slot_id(), Ok(12));
        assert_eq!(corrupted.missing_scale_weights(), vec![1, 3]);
        assert_eq!(corrupted.missing_pdf_weights(), vec![9, 12]);
    }

    #[test]
    fn legacy_log_prefix() {
        let legacy = "[INFO]: Found weight IDs:                   main, 1
[INFO]: Incomplete pwgevents.lhe files:
[INFO]: /campaign/0001/pwgevents.lhe
[INFO]: ----------------------------------------
";
        let report = CheckReport::parse(legacy);
        assert_eq!(report.expected_weights, vec!["main", "1"]);
        assert_eq!(report.incomplete, vec![PathBuf::from("/campaign/0001/pwgevents.lhe")]);
        assert!(!report.is_clean());
    }

    #[test]
    fn paths_with_spaces() {
        let report = CheckReport::parse(
            "pwgevents.lhe files with missing weights:\n/my campaign/0004/pwgevents.lhe (missing: 8)\n----------------------------------------\n",
        );
        assert_eq!(
            report.missing_weights[0].path,
            PathBuf::from("/my campaign/0004/pwgevents.lhe")
        );
    }

    #[test]
    fn non_numeric_slot_is_an_error() {
        let corrupted = CorruptedFile::new("/campaign/stage/pwgevents.lhe", ["8".to_owned()]);
        assert_eq!(
            corrupted.slot_id(),
            Err(SlotIndexError {
                slot_name: "stage".to_owned()
            })
        );
    }

    #[test]
    fn main_and_named_weights_are_neither_scale_nor_pdf() {
        let corrupted = CorruptedFile::new(
            "/c/0001/pwgevents.lhe",
            ["main", "0", "7", "8", "mur2"].map(str::to_owned),
        );
        assert_eq!(corrupted.missing_scale_weights(), vec![7]);
        assert_eq!(corrupted.missing_pdf_weights(), vec![8]);
    }
}
