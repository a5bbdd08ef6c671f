//! Inbound command grammar.
//!
//! Classifies radio text into a [`Command`]. The report hashtag accepts three
//! spellings (`#osmnote`, `#osm-note`, `#osm_note`), case-insensitive and
//! word-bounded, so `#osmnotetest` is plain chatter and not a report.
//! Informational tags (`#osmhelp`, `#osmstatus`, ...) map to their read-only
//! variants; everything else is ignored so the gateway stays silent on
//! ordinary mesh traffic.

pub mod templates;

use regex::Regex;

/// Default and maximum item counts for `#osmlist [n]`.
const LIST_DEFAULT: usize = 5;
const LIST_MAX: usize = 20;

/// Classification of one inbound text payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `#osmnote <text>`; carries the remaining text after tag strip
    /// (possibly empty, which the policy engine rejects with its own
    /// message).
    Report(String),
    Help,
    Status,
    Count,
    List(usize),
    Queue,
    Nodes,
    /// No recognized tag; the gateway replies with nothing.
    Ignore,
}

pub struct CommandParser {
    report_re: Regex,
}

impl CommandParser {
    pub fn new() -> Self {
        // \b after "note" rejects embedded matches like #osmnotetest.
        let report_re =
            Regex::new(r"(?i)#osm[-_]?note\b").expect("report hashtag pattern is valid");
        Self { report_re }
    }

    pub fn parse(&self, text: &str) -> Command {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Command::Ignore;
        }
        let lower = trimmed.to_lowercase();

        if lower == "#osmhelp" {
            return Command::Help;
        }
        if lower == "#osmstatus" {
            return Command::Status;
        }
        if lower.starts_with("#osmcount") {
            return Command::Count;
        }
        if lower.starts_with("#osmlist") {
            return Command::List(parse_list_limit(trimmed));
        }
        if lower == "#osmqueue" {
            return Command::Queue;
        }
        if lower == "#osmnodes" {
            return Command::Nodes;
        }

        if self.report_re.is_match(trimmed) {
            let remaining = self.report_re.replace_all(trimmed, "");
            return Command::Report(remaining.trim().to_string());
        }

        Command::Ignore
    }
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional decimal argument of `#osmlist`, clamped to [1, 20];
/// missing or invalid arguments use the default of 5.
fn parse_list_limit(text: &str) -> usize {
    let mut parts = text.split_whitespace();
    let _tag = parts.next();
    match parts.next().and_then(|arg| arg.parse::<i64>().ok()) {
        Some(n) => (n.clamp(1, LIST_MAX as i64)) as usize,
        None => LIST_DEFAULT,
    }
}

/// Normalize report text for storage and deduplication: trim and collapse
/// every whitespace run to a single space. Case and diacritics are kept
/// (two reports differing only in accents are different reports).
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
