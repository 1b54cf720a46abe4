//! `key = value value ...` configs (build config, CDN config).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::key::HashKey;
use crate::writer::CdnLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// Blank or `#` comment, kept verbatim.
    Text(String),
    Pair { key: String, values: Vec<String> },
}

/// Line-oriented config. Comments, blank lines and key order survive a
/// parse/serialize cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueConfig {
    lines: Vec<Line>,
}

impl KeyValueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = Vec::new();
        for (no, raw) in text.split('\n').enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                lines.push(Line::Text(line.to_string()));
                continue;
            }
            let (key, rest) = line.split_once('=')
                .ok_or_else(|| Error::Config(format!("line {}: expected `key = value`", no + 1)))?;
            lines.push(Line::Pair {
                key:    key.trim().to_string(),
                values: rest.split_whitespace().map(str::to_string).collect(),
            });
        }
        // A trailing newline leaves one empty line behind.
        if matches!(lines.last(), Some(Line::Text(t)) if t.is_empty()) && text.ends_with('\n') {
            lines.pop();
        }
        Ok(Self { lines })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.lines.iter().find_map(|l| match l {
            Line::Pair { key: k, values } if k == key => Some(values.as_slice()),
            _ => None,
        })
    }

    pub fn value(&self, key: &str, index: usize) -> Option<&str> {
        self.get(key).and_then(|v| v.get(index)).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            Line::Pair { key, .. } => Some(key.as_str()),
            Line::Text(_) => None,
        })
    }

    /// Parse `values[index]` of `key` as a hash key.
    pub fn key(&self, key: &str, index: usize) -> Option<HashKey> {
        self.value(key, index).and_then(HashKey::from_hex)
    }

    /// Set one value of `key`, appending the key if it is new and padding
    /// the value list with empty strings.
    pub fn set(&mut self, key: &str, index: usize, value: impl Into<String>) {
        let value = value.into();
        if !self.contains(key) {
            self.lines.push(Line::Pair { key: key.to_string(), values: Vec::new() });
        }
        let Some(values) = self.values_mut(key) else {
            return;
        };
        if values.len() <= index {
            values.resize(index + 1, String::new());
        }
        values[index] = value;
    }

    /// Replace every value of `key`.
    pub fn set_all(&mut self, key: &str, new: Vec<String>) {
        match self.values_mut(key) {
            Some(values) => *values = new,
            None => self.lines.push(Line::Pair { key: key.to_string(), values: new }),
        }
    }

    fn values_mut(&mut self, key: &str) -> Option<&mut Vec<String>> {
        self.lines.iter_mut().find_map(|l| match l {
            Line::Pair { key: k, values } if k == key => Some(values),
            _ => None,
        })
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.lines.len();
        self.lines.retain(|l| !matches!(l, Line::Pair { key: k, .. } if k == key));
        self.lines.len() != before
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            match line {
                Line::Text(t) => out.push_str(t),
                Line::Pair { key, values } => {
                    out.push_str(key);
                    out.push_str(" = ");
                    out.push_str(&values.join(" "));
                }
            }
        }
        out.push('\n');
        out
    }

    /// md5 of the serialized bytes; the name the file is stored under.
    pub fn content_key(&self) -> HashKey {
        HashKey::of(self.serialize().as_bytes())
    }

    /// Write under `dir` named by its own hash.
    pub fn write_to(&self, dir: &Path, layout: CdnLayout) -> Result<(HashKey, PathBuf)> {
        let text = self.serialize();
        let key = HashKey::of(text.as_bytes());
        let path = dir.join(layout.relative_path(&key.to_hex()));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, text)?;
        debug!(key = %key, "wrote config {}", path.display());
        Ok((key, path))
    }
}
