//! ServerQuery wire format.
//!
//! A command is `name key=value ... -flag` on one line. A reply is zero or more data lines
//! (records separated by `|`, fields by spaces) followed by `error id=<n> msg=<text>`.
//! Lines starting with `notify` are events. Values are escaped per the table below.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

/// Raw character ↔ escape sequence.
const ESCAPES: [(char, &str); 11] = [
    ('\\', "\\\\"),
    ('/', "\\/"),
    (' ', "\\s"),
    ('|', "\\p"),
    ('\u{07}', "\\a"),
    ('\u{08}', "\\b"),
    ('\u{0C}', "\\f"),
    ('\n', "\\n"),
    ('\r', "\\r"),
    ('\t', "\\t"),
    ('\u{0B}', "\\v"),
];

/// Error id 0: success.
pub const ERROR_OK: u32 = 0;
/// "database empty result set"
pub const ERROR_EMPTY_RESULT: u32 = 1281;
/// "database duplicate entry"
pub const ERROR_DUPLICATE_ENTRY: u32 = 2561;

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match ESCAPES.iter().find(|(r, _)| *r == c) {
            Some((_, esc)) => out.push_str(esc),
            None => out.push(c),
        }
    }
    out
}

pub fn unescape(wire: &str) -> String {
    let mut out = String::with_capacity(wire.len());
    let mut chars = wire.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        let raw = ESCAPES
            .iter()
            .find(|(_, esc)| esc.chars().nth(1) == Some(next))
            .map(|(r, _)| *r);
        match raw {
            Some(r) => out.push(r),
            None => {
                out.push('\\');
                out.push(next);
            }
        }
    }
    out
}

/// One `key=value` group of a reply or event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    pub fn parse(text: &str) -> Self {
        let fields = text
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(|token| match token.split_once('=') {
                Some((k, v)) => (k.to_string(), unescape(v)),
                None => (token.to_string(), String::new()),
            })
            .collect();
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn parse_field<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }
}

/// Split a data line into records.
pub fn parse_records(line: &str) -> Vec<Record> {
    line.split('|')
        .filter(|r| !r.trim().is_empty())
        .map(Record::parse)
        .collect()
}

/// Status line closing every reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatus {
    pub id: u32,
    pub msg: String,
}

impl QueryStatus {
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("error ")?;
        let record = Record::parse(rest);
        Some(Self {
            id: record.parse_field("id")?,
            msg: record.get("msg").unwrap_or_default().to_string(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.id == ERROR_OK
    }
}

impl Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error id={} msg={}", self.id, self.msg)
    }
}

/// Server event: `notify<name> key=value ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: String,
    pub record: Record,
}

impl Notification {
    pub fn parse(line: &str) -> Option<Self> {
        if !line.starts_with("notify") {
            return None;
        }
        let (event, rest) = line.split_once(' ').unwrap_or((line, ""));
        Some(Self {
            event: event.to_string(),
            record: Record::parse(rest),
        })
    }
}

/// Command line builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    line: String,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            line: name.to_string(),
        }
    }

    pub fn arg(mut self, key: &str, value: impl Display) -> Self {
        self.line.push(' ');
        self.line.push_str(key);
        self.line.push('=');
        self.line.push_str(&escape(&value.to_string()));
        self
    }

    pub fn flag(mut self, flag: &str) -> Self {
        self.line.push_str(" -");
        self.line.push_str(flag);
        self
    }

    pub fn name(&self) -> &str {
        self.line.split(' ').next().unwrap_or_default()
    }

    pub fn as_line(&self) -> &str {
        &self.line
    }
}
