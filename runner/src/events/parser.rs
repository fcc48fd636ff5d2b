use super::{header::HeaderDecoder, EventFileInfo};
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

const HEADER_OPEN: &str = "<header";
const HEADER_CLOSE: &str = "</header>";
const EVENT_OPEN: &str = "<event";
const EVENT_CLOSE: &str = "</event>";
const FILE_CLOSE: &str = "</LesHouchesEvents>";

/// Streaming decoder for POWHEG event files.
///
/// Event payloads are never interpreted, only the block markers are counted. The
/// parser is tolerant by construction: a missing, truncated or partially garbled
/// file yields whatever could be extracted instead of an error.
#[derive(Debug)]
pub struct EventFileParser {
    path: PathBuf,
    info: EventFileInfo,
    header: HeaderDecoder,
    inside_header: bool,
    inside_event: bool,
    lines: u64,
}

impl EventFileParser {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            info: EventFileInfo::new(),
            header: HeaderDecoder::new(),
            inside_header: false,
            inside_event: false,
            lines: 0,
        }
    }

    #[instrument(skip(self), fields(path = %self.path.display()), level = "debug")]
    pub fn parse(mut self) -> EventFileInfo {
        match File::open(&self.path) {
            Ok(file) => {
                self.info.exists = true;
                self.scan(BufReader::new(file));
            }
            Err(error) => {
                debug!(error = ?error, "Event file not readable, treating as non-existing");
            }
        }

        self.info
    }

    /// decode from an arbitrary reader, the result is marked as existing
    pub fn parse_reader<R: Read>(mut self, reader: R) -> EventFileInfo {
        self.info.exists = true;
        self.scan(BufReader::new(reader));
        self.info
    }

    fn scan<R: BufRead>(&mut self, mut reader: R) {
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    self.lines += 1;
                    let line = String::from_utf8_lossy(&buffer);
                    self.process_line(line.trim());
                }
                Err(error) => {
                    warn!(
                        path = %self.path.display(),
                        error = ?error,
                        "Failed reading event file, stopping after {} lines",
                        self.lines
                    );
                    break;
                }
            }
        }

        self.info.nonempty = self.lines > 0;
    }

    fn process_line(&mut self, line: &str) {
        if opens(line, HEADER_OPEN) {
            debug!("Start header marker found");
            self.inside_header = true;
            self.header.clear();
        } else if line.starts_with(HEADER_CLOSE) {
            if self.inside_header {
                self.header.decode(&mut self.info);
            }
            self.inside_header = false;
        } else if opens(line, EVENT_OPEN) {
            self.inside_event = true;
        } else if line.starts_with(EVENT_CLOSE) {
            if self.inside_event {
                self.info.add_event();
            }
            self.inside_event = false;
        } else if line.starts_with(FILE_CLOSE) {
            self.info.complete = true;
        } else if self.inside_header {
            self.header.add_line(line);
        }
    }
}

/// true for `<tag>` and `<tag attr=...>`, but not for longer tag names
fn opens(line: &str, tag: &str) -> bool {
    line.strip_prefix(tag)
        .and_then(|rest| rest.chars().next())
        .map(|next| next == '>' || next.is_whitespace())
        .unwrap_or(false)
}

/// Decode the event file at `path`
pub fn parse(path: impl AsRef<Path>) -> EventFileInfo {
    EventFileParser::new(path.as_ref()).parse()
}
