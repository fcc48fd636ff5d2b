pub mod header;
pub mod parser;

pub use parser::{parse, EventFileParser};

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

/// Name of the event file produced by a POWHEG slot
pub const EVENT_FILE: &str = "pwgevents.lhe";
/// Name of the event file written by a reweighting pass before it is promoted
pub const REWEIGHT_EVENT_FILE: &str = "pwgevents-rwgt.lhe";

/// A single weight variation declared in the event file header
#[derive(Debug, Clone)]
pub struct WeightEntry {
    pub id: String,
    pub description: String,
}

impl WeightEntry {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

// identity and ordering only consider the id, descriptions are informative
impl PartialEq for WeightEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WeightEntry {}

impl PartialOrd for WeightEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WeightEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// Named collection of weights sharing a combination rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightGroup {
    pub name: String,
    pub combine: String,
    weights: BTreeMap<String, WeightEntry>,
}

impl WeightGroup {
    pub fn new(name: impl Into<String>, combine: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            combine: combine.into(),
            weights: BTreeMap::new(),
        }
    }

    pub fn add_weight(&mut self, weight: WeightEntry) {
        self.weights.insert(weight.id.clone(), weight);
    }

    pub fn find_weight(&self, id: &str) -> Option<&WeightEntry> {
        self.weights.get(id)
    }

    pub fn has_weight(&self, id: &str) -> bool {
        self.weights.contains_key(id)
    }

    pub fn weights(&self) -> impl Iterator<Item = &WeightEntry> {
        self.weights.values()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Header metadata and structural state of one event file, as seen by a single parse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFileInfo {
    pub exists: bool,
    pub nonempty: bool,
    pub event_count: u64,
    pub complete: bool,
    ungrouped: BTreeSet<WeightEntry>,
    groups: BTreeMap<String, WeightGroup>,
}

impl EventFileInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_event(&mut self) {
        self.event_count += 1;
    }

    /// add a weight outside of any group, the first declaration of an id wins
    pub fn add_weight_non_grouped(&mut self, weight: WeightEntry) {
        if !self.ungrouped.contains(&weight) {
            self.ungrouped.insert(weight);
        }
    }

    /// add a weight to the named group, creating the group on first use
    pub fn add_weight_in_group(&mut self, group: &str, combine: &str, weight: WeightEntry) {
        self.groups
            .entry(group.to_owned())
            .or_insert_with(|| WeightGroup::new(group, combine))
            .add_weight(weight);
    }

    pub fn weights_non_grouped(&self) -> impl Iterator<Item = &WeightEntry> {
        self.ungrouped.iter()
    }

    pub fn weight_groups(&self) -> impl Iterator<Item = &WeightGroup> {
        self.groups.values()
    }

    pub fn find_weight_group(&self, name: &str) -> Option<&WeightGroup> {
        self.groups.get(name)
    }

    pub fn find_weight(&self, id: &str) -> Option<&WeightEntry> {
        self.ungrouped
            .iter()
            .find(|weight| weight.id == id)
            .or_else(|| self.groups.values().find_map(|group| group.find_weight(id)))
    }

    pub fn has_weight(&self, id: &str) -> bool {
        self.find_weight(id).is_some()
    }

    /// Sorted union of grouped and ungrouped weight ids
    pub fn all_weight_ids(&self) -> BTreeSet<String> {
        self.ungrouped
            .iter()
            .chain(self.groups.values().flat_map(WeightGroup::weights))
            .map(|weight| weight.id.clone())
            .collect()
    }
}
