//! Rewriting of POWHEG input files.
//!
//! Input files are line based `key value` pairs, comments start at `!` or `#`.
//! Everything not touched by a rewrite is copied verbatim.

use itertools::Itertools;
use std::fmt::Display;

const SCALE_FACTORS: [f64; 3] = [0.5, 1.0, 2.0];

/// true for lines that are entirely a comment
fn is_comment(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with('!') || line.starts_with('#')
}

/// the part of a line before any comment
fn command(line: &str) -> &str {
    match line.find(['!', '#']) {
        Some(position) => &line[..position],
        None => line,
    }
}

/// first token of a non-comment line
pub fn key(line: &str) -> Option<&str> {
    if is_comment(line) {
        return None;
    }
    command(line).split_whitespace().next()
}

/// Replace the value following the key of `line`, keeping layout and comment
pub fn replace_value(line: &str, value: &str) -> String {
    let command = command(line);
    let rest = &line[command.len()..];

    let key_start = command.len() - command.trim_start().len();
    let key_end = command[key_start..]
        .find(char::is_whitespace)
        .map(|position| key_start + position)
        .unwrap_or(command.len());

    let after_key = &command[key_end..];
    let value_offset = after_key.len() - after_key.trim_start().len();
    let value_start = key_end + value_offset;

    if value_start >= command.len() {
        // key without a value
        let spacer = if rest.is_empty() { "" } else { " " };
        return format!("{} {value}{spacer}{rest}", command.trim_end());
    }

    let value_end = command[value_start..]
        .find(char::is_whitespace)
        .map(|position| value_start + position)
        .unwrap_or(command.len());

    format!("{}{value}{}", &line[..value_start], &line[value_end..])
}

/// Input with the number of events replaced, `numevts` is appended if missing
pub fn events_input(base: &str, events: u64) -> String {
    let mut found = false;
    let mut lines = base
        .lines()
        .map(|line| {
            if key(line) == Some("numevts") {
                found = true;
                replace_value(line, &events.to_string())
            } else {
                line.to_owned()
            }
        })
        .collect_vec();

    if !found {
        lines.push(format!("numevts {events}"));
    }

    join_lines(lines)
}

/// Input with a fresh random seed, existing `iseed` entries are dropped
pub fn with_seed(input: &str, seed: u32) -> String {
    let mut lines = input
        .lines()
        .filter(|line| key(line) != Some("iseed"))
        .map(str::to_owned)
        .collect_vec();
    lines.push(format!("iseed {seed}"));

    join_lines(lines)
}

/// A single reweighting run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variation {
    Scale { muf: f64, mur: f64 },
    Pdf { member: u32 },
}

impl Variation {
    /// tag used for log and staged input file names
    pub fn tag(&self) -> String {
        match self {
            Self::Scale { muf, mur } => {
                format!("mur{}_muf{}", (mur * 10.0) as u32, (muf * 10.0) as u32)
            }
            Self::Pdf { member } => format!("PDF{member}"),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Scale { muf, mur } => format!("muf={muf:.1}, mur={mur:.1}"),
            Self::Pdf { member } => format!("pdf {member}"),
        }
    }

    pub fn group_name(&self) -> &'static str {
        match self {
            Self::Scale { .. } => "scale uncertainties",
            Self::Pdf { .. } => "pdf uncertainties",
        }
    }
}

impl Display for Variation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

/// The 3x3 scale grid without the nominal point, with consecutive weight ids
pub fn scale_variations(min_id: u32) -> Vec<(u32, Variation)> {
    SCALE_FACTORS
        .iter()
        .cartesian_product(SCALE_FACTORS.iter())
        .filter(|(mur, muf)| !(**mur == 1.0 && **muf == 1.0))
        .zip(min_id..)
        .map(|((mur, muf), id)| (id, Variation::Scale { muf: *muf, mur: *mur }))
        .collect()
}

/// PDF members `min_pdf..=max_pdf` with consecutive weight ids
pub fn pdf_variations(min_pdf: u32, max_pdf: u32, min_id: u32) -> Vec<(u32, Variation)> {
    (min_pdf..=max_pdf)
        .zip(min_id..)
        .map(|(member, id)| (id, Variation::Pdf { member }))
        .collect()
}

/// Input computing `variation` as weight `weight_id` on top of existing events
pub fn reweight_input(base: &str, variation: &Variation, weight_id: u32) -> String {
    let mut has_id = false;
    let mut has_description = false;
    let mut has_group = false;
    let mut lines = Vec::new();

    for line in base.lines() {
        let Some(key) = key(line) else {
            lines.push(line.to_owned());
            continue;
        };

        match (key, variation) {
            ("storeinfo_rwgt" | "compute_rwgt" | "lhrwgt_group_combine", _) => {}
            (key, Variation::Pdf { member }) if key.starts_with("lhans") => {
                lines.push(replace_value(line, &member.to_string()))
            }
            ("renscfact", Variation::Scale { mur, .. }) => {
                lines.push(replace_value(line, &format!("{mur:.1}")))
            }
            ("facscfact", Variation::Scale { muf, .. }) => {
                lines.push(replace_value(line, &format!("{muf:.1}")))
            }
            ("lhrwgt_id", _) => {
                has_id = true;
                lines.push(replace_value(line, &format!("'{weight_id}'")));
            }
            ("lhrwgt_descr", _) => {
                has_description = true;
                lines.push(replace_value_quoted(line, &variation.description()));
            }
            ("lhrwgt_group_name", _) => {
                has_group = true;
                lines.push(replace_value_quoted(line, variation.group_name()));
            }
            _ => lines.push(line.to_owned()),
        }
    }

    lines.push("compute_rwgt 1".to_owned());
    if !has_id {
        lines.push(format!("lhrwgt_id '{weight_id}'"));
    }
    if !has_description {
        lines.push(format!("lhrwgt_descr '{}'", variation.description()));
    }
    if !has_group {
        lines.push(format!("lhrwgt_group_name '{}'", variation.group_name()));
    }
    lines.push("lhrwgt_group_combine 'foo'".to_owned());

    join_lines(lines)
}

pub fn pdf_reweight_input(base: &str, member: u32, weight_id: u32) -> String {
    reweight_input(base, &Variation::Pdf { member }, weight_id)
}

pub fn scale_reweight_input(base: &str, muf: f64, mur: f64, weight_id: u32) -> String {
    reweight_input(base, &Variation::Scale { muf, mur }, weight_id)
}

/// quoted values may contain spaces, the whole command part after the key is replaced
fn replace_value_quoted(line: &str, value: &str) -> String {
    let command = command(line);
    let rest = &line[command.len()..];
    let key = command.split_whitespace().next().unwrap_or_default();
    let spacer = if rest.is_empty() { "" } else { " " };

    format!("{key} '{value}'{spacer}{rest}")
}

fn join_lines(lines: Vec<String>) -> String {
    let mut content = lines.join("\n");
    content.push('\n');
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "! dijet production
numevts 50000     ! number of events
ih1   1           ! hadron 1
lhans1 10800      ! pdf set for hadron 1
lhans2 10800      ! pdf set for hadron 2
renscfact 1d0
facscfact 1d0
storeinfo_rwgt 1
# lhrwgt_id 'commented'
";

    #[test]
    fn replace_keeps_layout() {
        assert_eq!(
            replace_value("numevts 50000     ! number of events", "10"),
            "numevts 10     ! number of events"
        );
        assert_eq!(replace_value("  iseed  12#seed", "7"), "  iseed  7#seed");
        assert_eq!(replace_value("numevts", "10"), "numevts 10");
        assert_eq!(
            replace_value("lhans1 10800 10800", "303400"),
            "lhans1 303400 10800"
        );
    }

    #[test]
    fn events_are_replaced_or_appended() {
        let input = events_input(BASE, 2000);
        assert!(input.contains("numevts 2000     ! number of events\n"));
        assert_eq!(input.matches("numevts").count(), 1);

        assert_eq!(events_input("ih1 1\n", 5), "ih1 1\nnumevts 5\n");
    }

    #[test]
    fn seed_replaces_old_one() {
        let input = with_seed("ih1 1\niseed 4\n", 99);
        assert_eq!(input, "ih1 1\niseed 99\n");
    }

    #[test]
    fn pdf_reweight() {
        let input = pdf_reweight_input(BASE, 303400, 9);
        assert!(input.starts_with("! dijet production\n"));
        assert!(input.contains("lhans1 303400      ! pdf set for hadron 1\n"));
        assert!(input.contains("lhans2 303400      ! pdf set for hadron 2\n"));
        assert!(input.contains("renscfact 1d0\n"));
        assert!(!input.contains("storeinfo_rwgt"));
        assert!(input.contains("# lhrwgt_id 'commented'\n"));
        assert!(input.ends_with(
            "compute_rwgt 1\nlhrwgt_id '9'\nlhrwgt_descr 'pdf 303400'\n\
             lhrwgt_group_name 'pdf uncertainties'\nlhrwgt_group_combine 'foo'\n"
        ));
    }

    #[test]
    fn scale_reweight_replaces_existing_keys() {
        let base = format!("{BASE}lhrwgt_id 'main'\nlhrwgt_descr 'nominal value'\n");
        let input = scale_reweight_input(&base, 2.0, 0.5, 3);
        assert!(input.contains("renscfact 0.5\n"));
        assert!(input.contains("facscfact 2.0\n"));
        assert!(input.contains("lhrwgt_id '3'\n"));
        assert!(input.contains("lhrwgt_descr 'muf=2.0, mur=0.5'\n"));
        assert!(input.contains("lhans1 10800"));
        assert_eq!(input.matches("lhrwgt_id").count(), 2);
        assert!(input.ends_with("lhrwgt_group_name 'scale uncertainties'\nlhrwgt_group_combine 'foo'\n"));
    }

    #[test]
    fn variation_grids() {
        let scales = scale_variations(0);
        assert_eq!(scales.len(), 8);
        assert_eq!(scales[0], (0, Variation::Scale { muf: 0.5, mur: 0.5 }));
        assert_eq!(scales[4], (4, Variation::Scale { muf: 2.0, mur: 1.0 }));
        assert_eq!(scales[7].0, 7);
        assert_eq!(scales[0].1.tag(), "mur5_muf5");

        let pdfs = pdf_variations(108, 111, 9);
        assert_eq!(
            pdfs.iter().map(|(id, _)| *id).collect_vec(),
            vec![9, 10, 11, 12]
        );
        assert_eq!(pdfs[3].1, Variation::Pdf { member: 111 });
        assert_eq!(pdfs[0].1.tag(), "PDF108");
        assert!(pdf_variations(5, 4, 0).is_empty());
    }
}
