//! Pipe-separated tables (`.build.info`, `versions`, `cdns`).

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// `STRING:0`, `HEX:16`, `DEC:4`.
    pub kind: String,
}

/// A header row of `Name!TYPE:len` cells and one or more data rows. Reads
/// and writes go to the active row: the first with `Active` = `1`, or the
/// first row when no column is called `Active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    comments: Vec<String>,
    columns:  Vec<Column>,
    rows:     Vec<Vec<String>>,
    newline:  &'static str,
}

impl TableConfig {
    pub fn new(columns: Vec<Column>) -> Self {
        let row = vec![String::new(); columns.len()];
        Self { comments: Vec::new(), columns, rows: vec![row], newline: "\n" }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let mut comments = Vec::new();
        let mut columns: Vec<Column> = Vec::new();
        let mut rows = Vec::new();

        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with('#') {
                comments.push(line.to_string());
                continue;
            }
            let cells: Vec<String> = line.split('|').map(str::to_string).collect();
            if columns.is_empty() {
                columns = cells.into_iter()
                    .map(|c| match c.split_once('!') {
                        Some((name, kind)) => Column { name: name.to_string(), kind: kind.to_string() },
                        None => Column { name: c, kind: "STRING:0".to_string() },
                    })
                    .collect();
            } else {
                if cells.len() != columns.len() {
                    return Err(Error::Config(format!(
                        "row has {} cells, header has {}", cells.len(), columns.len()
                    )));
                }
                rows.push(cells);
            }
        }

        if columns.is_empty() || rows.is_empty() {
            return Err(Error::Config("table config has no data rows".into()));
        }
        Ok(Self { comments, columns, rows, newline })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn active(&self) -> usize {
        self.column("Active")
            .and_then(|col| self.rows.iter().position(|r| r[col] == "1"))
            .unwrap_or(0)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let col = self.column(name)?;
        Some(self.rows[self.active()][col].as_str())
    }

    /// Set a cell of the active row. Unknown columns are an error.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let col = self.column(name)
            .ok_or_else(|| Error::Config(format!("no column {name:?}")))?;
        let row = self.active();
        self.rows[row][col] = value.into();
        Ok(())
    }

    pub fn serialize(&self) -> String {
        let mut lines: Vec<String> = self.comments.clone();
        lines.push(self.columns.iter()
            .map(|c| format!("{}!{}", c.name, c.kind))
            .collect::<Vec<_>>()
            .join("|"));
        lines.extend(self.rows.iter().map(|r| r.join("|")));
        let mut out = lines.join(self.newline);
        out.push_str(self.newline);
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())?;
        Ok(())
    }
}

/// Columns of a `.build.info` written from scratch.
pub fn build_info_columns() -> Vec<Column> {
    [
        ("Branch", "STRING:0"),
        ("Active", "DEC:1"),
        ("Build Key", "HEX:16"),
        ("CDN Key", "HEX:16"),
        ("Install Key", "HEX:16"),
        ("IM Size", "DEC:4"),
        ("CDN Path", "STRING:0"),
        ("CDN Hosts", "STRING:0"),
        ("Tags", "STRING:0"),
        ("Armadillo", "STRING:0"),
        ("Last Activated", "STRING:0"),
        ("Version", "STRING:0"),
    ]
    .into_iter()
    .map(|(name, kind)| Column { name: name.to_string(), kind: kind.to_string() })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Branch!STRING:0|Active!DEC:1|Build Key!HEX:16|Version!STRING:0\n\
                          eu|0|aaaa|1.0\n\
                          us|1|bbbb|1.1\n";

    #[test]
    fn reads_the_active_row() {
        let mut info = TableConfig::parse(SAMPLE).unwrap();
        assert_eq!(info.get("Branch"), Some("us"));
        assert_eq!(info.get("Missing"), None);
        info.set("Build Key", "cccc").unwrap();
        assert!(info.set("Nope", "x").is_err());
        assert_eq!(info.serialize(), SAMPLE.replace("bbbb", "cccc"));
    }

    #[test]
    fn row_width_is_checked() {
        assert!(TableConfig::parse("A!DEC:1|B!DEC:1\n1\n").is_err());
    }
}
