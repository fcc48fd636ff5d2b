use super::{
    report::{
        MARKER_EMPTY, MARKER_INCOMPLETE, MARKER_MISSING_WEIGHTS, MARKER_NON_EXISTING,
        MARKER_WEIGHT_IDS, MISSING_OPEN, SEPARATOR,
    },
    CheckError, CheckSummaryEntry, CHECK_FILE, SUMMARY_FILE,
};
use crate::{
    collector::{slot_dir, Collector},
    events::EVENT_FILE,
};
use itertools::Itertools;
use rayon::prelude::*;
use std::{
    collections::{BTreeSet, HashSet},
    fs,
    ops::Range,
    path::Path,
};
use tracing::{error, info, instrument, warn};

/// Failure class of a slot, in rendering priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    NonExisting,
    Empty,
    Incomplete,
    MissingWeights,
}

/// Aggregated check results of all slots of a campaign
#[derive(Debug, Clone, Default)]
pub struct CampaignSummary {
    entries: Vec<CheckSummaryEntry>,
    expected_weights: BTreeSet<String>,
}

impl CampaignSummary {
    /// Aggregate per-slot records. The expected weight set is the union of all
    /// weights seen in any slot.
    pub fn aggregate(entries: impl IntoIterator<Item = CheckSummaryEntry>) -> Self {
        let mut entries = entries.into_iter().collect_vec();
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));

        let expected_weights = entries
            .iter()
            .flat_map(|entry| entry.weight_ids.iter().cloned())
            .collect();

        Self {
            entries,
            expected_weights,
        }
    }

    /// Load and aggregate every check record below `workdir`.
    ///
    /// With `expected_slots`, every slot of the range without a record is added as a
    /// non-existing entry. Unreadable records are logged and skipped.
    #[instrument(level = "info")]
    pub fn from_workdir(
        workdir: &Path,
        expected_slots: Option<Range<u32>>,
    ) -> Result<Self, CheckError> {
        let records = Collector::glob(workdir, CHECK_FILE)?.collect_vec();
        info!("Found {} check records in {}", records.len(), workdir.display());

        let mut entries: Vec<_> = records
            .par_iter()
            .filter_map(|record| match CheckSummaryEntry::load(record) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    error!(record = %record.display(), "Skipping unreadable check record: {e}");
                    None
                }
            })
            .collect();

        if let Some(slots) = expected_slots {
            let known: HashSet<_> = entries.iter().map(|entry| entry.filename.clone()).collect();
            for slot in slots {
                let event_file = slot_dir(workdir, slot).join(EVENT_FILE);
                if !known.contains(&event_file) {
                    warn!(slot = slot, "No check record for slot, reporting it as non-existing");
                    entries.push(CheckSummaryEntry::missing(event_file));
                }
            }
        }

        Ok(Self::aggregate(entries))
    }

    pub fn entries(&self) -> &[CheckSummaryEntry] {
        &self.entries
    }

    pub fn expected_weights(&self) -> &BTreeSet<String> {
        &self.expected_weights
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn existing(&self) -> usize {
        self.entries.iter().filter(|entry| entry.exists).count()
    }

    pub fn nonempty(&self) -> usize {
        self.entries.iter().filter(|entry| entry.nonempty).count()
    }

    pub fn complete(&self) -> usize {
        self.entries.iter().filter(|entry| entry.complete).count()
    }

    pub fn with_all_weights(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.nonempty && entry.has_all_weights(&self.expected_weights))
            .count()
    }

    pub fn events(&self) -> u64 {
        self.entries.iter().map(|entry| entry.events).sum()
    }

    /// true if the entry has content but lacks weights some other slot produced
    pub fn is_missing_weights(&self, entry: &CheckSummaryEntry) -> bool {
        entry.nonempty && !entry.has_all_weights(&self.expected_weights)
    }

    /// first failure category matching the entry, `None` for a good slot
    pub fn category(&self, entry: &CheckSummaryEntry) -> Option<Category> {
        if !entry.exists {
            Some(Category::NonExisting)
        } else if !entry.nonempty {
            Some(Category::Empty)
        } else if !entry.complete {
            Some(Category::Incomplete)
        } else if self.is_missing_weights(entry) {
            Some(Category::MissingWeights)
        } else {
            None
        }
    }

    pub fn filter(&self, category: Category) -> impl Iterator<Item = &CheckSummaryEntry> {
        self.entries
            .iter()
            .filter(move |entry| self.category(entry) == Some(category))
    }

    pub fn failing(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| self.category(entry).is_some())
            .count()
    }

    /// Render the campaign report, see [`super::report`] for the markers
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Number of checkinfos: {}", self.total()),
            format!("Number of existing files: {}", self.existing()),
            format!("Number of nonempty files: {}", self.nonempty()),
            format!("Number of complete files: {}", self.complete()),
            format!("Number of files with all weights: {}", self.with_all_weights()),
            format!("Number of events: {}", self.events()),
            join_prefixed(MARKER_WEIGHT_IDS, self.expected_weights.iter()),
        ];

        for (category, marker) in [
            (Category::NonExisting, MARKER_NON_EXISTING),
            (Category::Empty, MARKER_EMPTY),
            (Category::Incomplete, MARKER_INCOMPLETE),
        ] {
            let files = self.filter(category).collect_vec();
            if files.is_empty() {
                continue;
            }

            lines.push(marker.to_owned());
            lines.extend(files.iter().map(|entry| entry.filename.display().to_string()));
            lines.push(SEPARATOR.to_owned());
        }

        let corrupted = self.filter(Category::MissingWeights).collect_vec();
        if !corrupted.is_empty() {
            lines.push(MARKER_MISSING_WEIGHTS.to_owned());
            lines.extend(corrupted.iter().map(|entry| {
                format!(
                    "{}{})",
                    entry.filename.display(),
                    join_prefixed(MISSING_OPEN, entry.missing_weights(&self.expected_weights).into_iter())
                )
            }));
            lines.push(SEPARATOR.to_owned());
        }

        let mut report = lines.join("\n");
        report.push('\n');
        report
    }

    /// Render the report into `workdir`, returns the written path
    pub fn store(&self, workdir: &Path) -> Result<std::path::PathBuf, CheckError> {
        let path = workdir.join(SUMMARY_FILE);
        let report = self.render();
        fs::write(&path, &report).map_err(|error| CheckError::Io(path.clone(), error))?;

        for line in report.lines() {
            info!("{line}");
        }

        Ok(path)
    }
}

/// `prefix id, id, ...` without trailing whitespace for an empty list
fn join_prefixed<T: std::fmt::Display>(prefix: &str, items: impl Iterator<Item = T>) -> String {
    let joined = items.map(|item| item.to_string()).join(", ");
    if joined.is_empty() {
        prefix.to_owned()
    } else {
        format!("{prefix} {joined}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::report::CheckReport;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn entry(slot: &str, exists: bool, nonempty: bool, complete: bool, weights: &[&str]) -> CheckSummaryEntry {
        CheckSummaryEntry {
            filename: PathBuf::from(format!("/campaign/{slot}/pwgevents.lhe")),
            exists,
            nonempty,
            complete,
            events: if nonempty { 100 } else { 0 },
            weight_ids: weights.iter().map(|id| id.to_string()).collect(),
        }
    }

    fn full_weights() -> Vec<String> {
        std::iter::once("main".to_owned())
            .chain((1..=15).map(|id| id.to_string()))
            .collect()
    }

    #[test]
    fn empty_campaign_renders() {
        let summary = CampaignSummary::aggregate(Vec::new());
        assert_eq!(
            summary.render(),
            "Number of checkinfos: 0\nNumber of existing files: 0\nNumber of nonempty files: 0\n\
             Number of complete files: 0\nNumber of files with all weights: 0\nNumber of events: 0\n\
             Found weight IDs:\n"
        );
    }

    #[test]
    fn classification_priority() {
        let summary = CampaignSummary::aggregate(vec![
            entry("0000", true, true, true, &["main", "1", "2"]),
            entry("0001", false, false, false, &[]),
            entry("0002", true, false, false, &[]),
            entry("0003", true, true, false, &["main"]),
            entry("0004", true, true, true, &["main", "1"]),
        ]);

        assert_eq!(summary.total(), 5);
        assert_eq!(summary.existing(), 4);
        assert_eq!(summary.nonempty(), 3);
        assert_eq!(summary.complete(), 2);
        assert_eq!(summary.with_all_weights(), 1);
        assert_eq!(summary.events(), 300);

        // the incomplete slot also misses weights, it is only listed once
        assert!(summary.is_missing_weights(&summary.entries()[3]));
        assert_eq!(summary.filter(Category::Incomplete).count(), 1);
        assert_eq!(summary.filter(Category::MissingWeights).count(), 1);
        assert_eq!(summary.failing(), 4);

        let report = CheckReport::parse(&summary.render());
        assert_eq!(report.non_existing, vec![PathBuf::from("/campaign/0001/pwgevents.lhe")]);
        assert_eq!(report.empty, vec![PathBuf::from("/campaign/0002/pwgevents.lhe")]);
        assert_eq!(report.incomplete, vec![PathBuf::from("/campaign/0003/pwgevents.lhe")]);
        assert_eq!(report.missing_weights.len(), 1);
        assert_eq!(
            report.missing_weights[0].missing_weight_ids,
            ["2".to_owned()].into_iter().collect()
        );
    }

    #[test]
    fn full_weight_set_is_never_flagged() {
        let weights = full_weights();
        let weights: Vec<_> = weights.iter().map(String::as_str).collect();
        let summary = CampaignSummary::aggregate(vec![
            entry("0000", true, true, true, &weights),
            entry("0001", true, true, true, &weights),
        ]);
        assert_eq!(summary.failing(), 0);
        assert_eq!(summary.with_all_weights(), 2);

        // a weight no slot produced is never expected
        let summary = CampaignSummary::aggregate(vec![entry("0000", true, true, true, &["main"])]);
        assert_eq!(summary.failing(), 0);
    }

    #[test]
    fn missing_pdf_weights_of_slot_0012() {
        let weights = full_weights();
        let weights: Vec<_> = weights.iter().map(String::as_str).collect();
        let summary = CampaignSummary::aggregate(vec![
            entry("0011", true, true, true, &weights),
            entry("0012", true, true, true, &["main", "1", "2", "3", "4", "5", "6", "7"]),
        ]);

        let report = CheckReport::parse(&summary.render());
        let corrupted = &report.missing_weights[0];
        assert_eq!(corrupted.slot_id(), Ok(12));
        assert_eq!(corrupted.missing_pdf_weights(), (8..=15).collect::<Vec<_>>());
        assert!(corrupted.missing_scale_weights().is_empty());
        assert_eq!(report.expected_weights.len(), 16);
    }

    #[test]
    fn report_is_idempotent() {
        let entries = vec![
            entry("0003", true, true, false, &["main"]),
            entry("0001", false, false, false, &[]),
            entry("0002", true, true, true, &["main", "1"]),
        ];
        let mut reversed = entries.clone();
        reversed.reverse();

        let first = CampaignSummary::aggregate(entries).render();
        assert_eq!(first, CampaignSummary::aggregate(reversed).render());
        assert!(!first.contains("(missing:"));
        assert!(first.contains("Found weight IDs: 1, main"));
    }

    #[test]
    fn from_workdir_patches_missing_slots() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        let good = CheckSummaryEntry {
            filename: PathBuf::new(),
            exists: true,
            nonempty: true,
            complete: true,
            events: 10,
            weight_ids: ["main".to_owned()].into_iter().collect(),
        };
        fs::create_dir_all(dir.path().join("0000")).unwrap();
        good.store(&dir.path().join("0000").join(CHECK_FILE)).unwrap();
        fs::create_dir_all(dir.path().join("0001")).unwrap();
        fs::write(dir.path().join("0001").join(CHECK_FILE), "garbage").unwrap();

        let summary = CampaignSummary::from_workdir(dir.path(), Some(0..3)).unwrap();
        // slot 1 has a broken record and slot 2 none at all
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.filter(Category::NonExisting).count(), 2);
        assert_eq!(summary.events(), 10);

        let path = summary.store(dir.path()).unwrap();
        let report = CheckReport::load(&path).unwrap();
        assert_eq!(
            report.non_existing,
            vec![
                dir.path().join("0001").join(EVENT_FILE),
                dir.path().join("0002").join(EVENT_FILE)
            ]
        );
    }

    #[test]
    fn from_workdir_only_patches_requested_slots() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        for slot in [10, 11, 13] {
            let slot_dir = slot_dir(dir.path(), slot);
            fs::create_dir_all(&slot_dir).unwrap();
            CheckSummaryEntry::missing(slot_dir.join(EVENT_FILE))
                .store(&slot_dir.join(CHECK_FILE))
                .unwrap();
        }

        let summary = CampaignSummary::from_workdir(dir.path(), Some(10..15)).unwrap();
        assert_eq!(summary.total(), 5);
        let patched: Vec<_> = summary
            .entries()
            .iter()
            .map(|entry| entry.filename.clone())
            .collect();
        assert_eq!(
            patched,
            [10, 11, 12, 13, 14]
                .into_iter()
                .map(|slot| slot_dir(dir.path(), slot).join(EVENT_FILE))
                .collect::<Vec<_>>()
        );
    }
}
