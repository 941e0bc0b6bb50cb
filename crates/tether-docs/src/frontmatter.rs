//! `---` delimited `key: value` header blocks.
//!
//! Only flat string values are supported. A block that never closes, or a
//! document without one, parses as an empty header with the whole text as
//! body; lines without a colon are skipped.

use serde::ser::{Serialize, SerializeMap, Serializer};

const DELIMITER: &str = "---";

/// Ordered key/value header of a document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frontmatter {
    entries: Vec<(String, String)>,
}

impl Frontmatter {
    /// Value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty value for `key`.
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Insert or replace `key`, keeping its original position.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_owned(), value));
        }
    }

    /// Remove `key`.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as a delimited block, trailing newline included.
    pub fn render(&self) -> String {
        let mut out = String::from(DELIMITER);
        out.push('\n');
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&quote_if_needed(value));
            out.push('\n');
        }
        out.push_str(DELIMITER);
        out.push('\n');
        out
    }
}

impl Serialize for Frontmatter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A document split into header and body.
#[derive(Debug)]
pub struct Split<'a> {
    /// Parsed header.
    pub frontmatter: Frontmatter,
    /// Text after the closing delimiter, untouched.
    pub body: &'a str,
    /// Number of lines the header block occupies.
    pub header_lines: usize,
}

/// Split `content` into frontmatter and body.
pub fn split(content: &str) -> Split<'_> {
    let empty = Split {
        frontmatter: Frontmatter::default(),
        body: content,
        header_lines: 0,
    };

    let mut lines = content.split_inclusive('\n');
    let mut offset = match lines.next() {
        Some(first) if trim_eol(first) == DELIMITER => first.len(),
        _ => return empty,
    };
    let mut header_lines = 1;
    let mut frontmatter = Frontmatter::default();

    for line in lines {
        offset += line.len();
        header_lines += 1;
        let trimmed = trim_eol(line);
        if trimmed == DELIMITER {
            return Split {
                frontmatter,
                body: &content[offset..],
                header_lines,
            };
        }
        if trimmed.trim().is_empty() || trimmed.trim_start().starts_with('#') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                frontmatter.set(key, unquote(value.trim()));
            }
        }
    }

    // never closed
    empty
}

/// Reassemble a document from a header and an untouched body.
pub fn join(frontmatter: &Frontmatter, body: &str) -> String {
    if frontmatter.is_empty() {
        return body.to_owned();
    }
    let mut out = frontmatter.render();
    out.push_str(body);
    out
}

/// Apply `edit` to the header of `content`, leaving the body byte-identical.
pub fn edit(content: &str, edit: impl FnOnce(&mut Frontmatter)) -> String {
    let parts = split(content);
    let mut frontmatter = parts.frontmatter;
    edit(&mut frontmatter);
    join(&frontmatter, parts.body)
}

fn trim_eol(line: &str) -> &str {
    line.trim_end_matches('\n').trim_end_matches('\r')
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() < 2 {
        return value.to_owned();
    }
    let inner = &value[1..value.len() - 1];
    match (bytes[0], bytes[bytes.len() - 1]) {
        (b'"', b'"') => unescape(inner),
        (b'\'', b'\'') => inner.to_owned(),
        _ => value.to_owned(),
    }
}

fn unescape(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other @ ('"' | '\\')) => out.push(other),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn quote_if_needed(value: &str) -> String {
    let needs = value.contains(": ")
        || value.starts_with(' ')
        || value.ends_with(' ')
        || value.starts_with('"')
        || value.starts_with('\'')
        || value.contains(" #")
        || value.chars().any(char::is_control);
    if !needs {
        return value.to_owned();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
