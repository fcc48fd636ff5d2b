use super::{EventFileInfo, WeightEntry};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const WEIGHTGROUP_OPEN: &str = "<weightgroup";
const WEIGHTGROUP_CLOSE: &str = "</weightgroup>";
const WEIGHT_OPEN: &str = "<weight";
const WEIGHT_CLOSE: &str = "</weight>";

/// Collects the raw lines between `<header>` and `</header>` and decodes the
/// weight declarations once the header is closed.
///
/// Only a single level of `<weightgroup>` is understood. Opening a second group
/// while one is still open replaces the current group.
#[derive(Debug, Default)]
pub struct HeaderDecoder {
    lines: Vec<String>,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_line(&mut self, line: &str) {
        self.lines.push(line.to_owned());
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn decode(&self, info: &mut EventFileInfo) {
        debug!("Start decoding header ({} lines)", self.lines.len());
        let mut current_group: Option<(String, String)> = None;

        for line in self.lines.iter().map(|line| line.trim()) {
            if is_open_tag(line, WEIGHTGROUP_OPEN) {
                let attributes = parse_attributes(open_tag(line));
                let name = attributes.get("name").cloned().unwrap_or_default();
                let combine = attributes.get("combine").cloned().unwrap_or_default();

                if let Some((open, _)) = &current_group {
                    warn!(open = %open, next = %name, "Nested weight group, replacing open group");
                }
                debug!(group = %name, "New weight group found");
                current_group = Some((name, combine));
            } else if line.starts_with(WEIGHTGROUP_CLOSE) {
                current_group = None;
            } else if is_open_tag(line, WEIGHT_OPEN) {
                let Some(weight) = decode_weight(line) else {
                    debug!(line = line, "Skipping weight tag without id");
                    continue;
                };

                match &current_group {
                    Some((group, combine)) => info.add_weight_in_group(group, combine, weight),
                    None => info.add_weight_non_grouped(weight),
                }
            }
        }
    }
}

/// true if `line` opens the tag `tag` (e.g. `<weight`), not a longer tag name
fn is_open_tag(line: &str, tag: &str) -> bool {
    line.strip_prefix(tag)
        .and_then(|rest| rest.chars().next())
        .map(|next| next == '>' || next == '/' || next.is_whitespace())
        .unwrap_or(false)
}

/// the text of the opening tag without the surrounding `<` and `>`
fn open_tag(line: &str) -> &str {
    let end = line.find('>').unwrap_or(line.len());
    line[..end].trim_start_matches('<').trim_end_matches('/')
}

fn decode_weight(line: &str) -> Option<WeightEntry> {
    let attributes = parse_attributes(open_tag(line));
    let id = attributes.get("id").filter(|id| !id.is_empty())?;

    let content = line.find('>').map(|end| &line[end + 1..]).unwrap_or("");
    let description = match content.find(WEIGHT_CLOSE) {
        Some(end) => &content[..end],
        None => content,
    };

    Some(WeightEntry::new(id.clone(), description.trim()))
}

/// Parse `key='value'` / `key="value"` pairs of a tag in arbitrary order.
/// Quoted values may contain whitespace, tokens without `=` are ignored.
pub fn parse_attributes(tag: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    let mut chars = tag.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        // read a token up to whitespace or `=`
        let mut end = start;
        while let Some(&(index, c)) = chars.peek() {
            if c.is_whitespace() || c == '=' {
                break;
            }
            end = index + c.len_utf8();
            chars.next();
        }
        let key = &tag[start..end];

        match chars.peek() {
            Some(&(_, '=')) => {
                chars.next();
            }
            _ => continue,
        }

        let value = match chars.peek() {
            Some(&(index, quote @ ('\'' | '"'))) => {
                chars.next();
                let value_start = index + 1;
                let mut value_end = tag.len();
                for (index, c) in chars.by_ref() {
                    if c == quote {
                        value_end = index;
                        break;
                    }
                }
                &tag[value_start..value_end.max(value_start)]
            }
            Some(&(index, _)) => {
                let mut value_end = tag.len();
                while let Some(&(next, c)) = chars.peek() {
                    if c.is_whitespace() {
                        value_end = next;
                        break;
                    }
                    chars.next();
                }
                &tag[index..value_end]
            }
            None => "",
        };

        if !key.is_empty() {
            attributes.insert(key.to_owned(), value.to_owned());
        }
    }

    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(lines: &[&str]) -> EventFileInfo {
        let mut decoder = HeaderDecoder::new();
        lines.iter().for_each(|line| decoder.add_line(line));
        let mut info = EventFileInfo::new();
        decoder.decode(&mut info);
        info
    }

    #[test]
    fn attributes_in_any_order() {
        let attributes = parse_attributes("weightgroup combine='foo'  name='scale uncertainties' stray");
        assert_eq!(attributes["name"], "scale uncertainties");
        assert_eq!(attributes["combine"], "foo");
        assert!(!attributes.contains_key("stray"));

        let attributes = parse_attributes("weight id=\"7\"");
        assert_eq!(attributes["id"], "7");
    }

    #[test]
    fn grouped_and_ungrouped_weights() {
        let info = decode(&[
            "<initrwgt>",
            "<weight id='main'> default </weight>",
            "<weightgroup name='scale uncertainties' combine='foo'>",
            "<weight id='1'>  muf=0.5, mur=0.5 </weight>",
            "<weight id='2'>muf=1.0, mur=0.5</weight>",
            "</weightgroup>",
            "<weightgroup combine='foo' name='pdf uncertainties'>",
            "<weight id='8'>pdf 100</weight>",
            "</weightgroup>",
            "</initrwgt>",
        ]);

        assert_eq!(info.weights_non_grouped().count(), 1);
        let scale = info.find_weight_group("scale uncertainties").unwrap();
        assert_eq!(scale.len(), 2);
        assert_eq!(scale.combine, "foo");
        assert_eq!(scale.find_weight("1").unwrap().description, "muf=0.5, mur=0.5");
        assert!(info.find_weight_group("pdf uncertainties").unwrap().has_weight("8"));
    }

    #[test]
    fn malformed_weights_are_omitted() {
        let info = decode(&[
            "<weight>no id</weight>",
            "<weight id=''>empty id</weight>",
            "<weights id='x'>other tag</weights>",
            "<weight id='3'>unterminated",
        ]);

        assert_eq!(info.all_weight_ids().into_iter().collect::<Vec<_>>(), vec!["3"]);
        assert_eq!(info.find_weight("3").unwrap().description, "unterminated");
    }

    #[test]
    fn nested_group_replaces_open_group() {
        let info = decode(&[
            "<weightgroup name='outer' combine='foo'>",
            "<weightgroup name='inner' combine='bar'>",
            "<weight id='1'>a</weight>",
            "</weightgroup>",
            "<weight id='2'>b</weight>",
            "</weightgroup>",
        ]);

        assert!(info.find_weight_group("outer").is_none());
        assert!(info.find_weight_group("inner").unwrap().has_weight("1"));
        assert_eq!(info.weights_non_grouped().next().unwrap().id, "2");
    }
}
