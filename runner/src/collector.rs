use globset::{Glob, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    fs,
    io::Error,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("Failed to list working directory {0}")]
    ListDirectory(PathBuf, #[source] Error),
}

/// Directory of a slot inside the campaign working directory, e.g. `workdir/0007`
pub fn slot_dir(workdir: &Path, slot: u32) -> PathBuf {
    workdir.join(format!("{slot:04}"))
}

#[derive(Debug)]
/// Sources of campaign files, initialized from `Collector::glob` / `Collector::slots`
pub enum Collector {
    /// files anywhere below a directory whose name matches a glob
    Glob { paths: Vec<PathBuf> },
    /// numbered slot directories directly below the working directory
    Slots { slots: Vec<(u32, PathBuf)> },
}

impl Collector {
    /// Collect all files below `workdir` with a file name matching `pattern`, sorted
    pub fn glob(workdir: &Path, pattern: &str) -> Result<Self, CollectorError> {
        let matcher: GlobMatcher = Glob::new(pattern)?.compile_matcher();
        debug!("Filtering with glob: {matcher:?}");

        let mut builder = WalkBuilder::new(workdir);
        // campaign directories are not source trees, nothing should be skipped
        builder.standard_filters(false);

        let paths = builder
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Failed to search {}: {e}", workdir.display());
                    None
                }
            })
            .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
            .filter(|entry| matcher.is_match(entry.file_name()))
            .map(DirEntry::into_path)
            // reverse order, `next` pops from the back
            .sorted_by(|a, b| b.cmp(a))
            .collect_vec();

        Ok(Self::Glob { paths })
    }

    /// Collect all directories of `workdir` with a purely numeric name, sorted by index
    pub fn slots(workdir: &Path) -> Result<Self, CollectorError> {
        let slots = fs::read_dir(workdir)
            .map_err(|error| CollectorError::ListDirectory(workdir.to_owned(), error))?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                name.parse::<u32>().ok().map(|slot| (slot, entry.path()))
            })
            .sorted_by(|a, b| b.cmp(a))
            .collect_vec();

        Ok(Self::Slots { slots })
    }

    /// first and last slot index found, if any
    pub fn slot_range(workdir: &Path) -> Result<Option<(u32, u32)>, CollectorError> {
        match Self::slots(workdir)? {
            Self::Slots { slots } => Ok(slots
                .last()
                .zip(slots.first())
                .map(|((first, _), (last, _))| (*first, *last))),
            Self::Glob { .. } => Ok(None),
        }
    }
}

impl Iterator for Collector {
    type Item = PathBuf;

    /// return accurate size for underlying iterator
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = match self {
            Self::Glob { paths } => paths.len(),
            Self::Slots { slots } => slots.len(),
        };

        (len, Some(len))
    }

    /// yields in sorted order
    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Glob { paths } => paths.pop(),
            Self::Slots { slots } => slots.pop().map(|(_, path)| path),
        }
    }
}

impl ExactSizeIterator for Collector {}
