//! Human-readable summary files.
//!
//! ```text
//! Date: Mon, 19 Oct 2026 10:00:00 +0000
//! Username: operator
//! Number Of RingBuffers: 3
//! Oldest FileSet: 1
//! Newest FileSet: 3
//! Cache Sets: 10
//! Cache Elements/Set: 10
//! Archive Sets: 10
//! Archive Elements/Set: 5
//! ```
//!
//! `Number Of RingBuffers` is the partition count in the root summary and the
//! chunk-group count in a partition summary. Unknown lines are rejected.

use std::path::Path;

use chrono::Utc;

use crate::error::{DenError, Result};
use crate::registration::file::write_atomic;
use crate::storage::layout::SUMMARY_FILE;

/// Contents of a summary file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Summary {
    /// Human-readable write time.
    pub date: Option<String>,
    /// Owner recorded at write time.
    pub username: Option<String>,
    /// Partition count (root) or chunk-group count (partition).
    pub ring_buffers: usize,
    /// Oldest chunk-group id (partition summaries only).
    pub oldest_group: Option<u64>,
    /// Newest chunk-group id (partition summaries only).
    pub newest_group: Option<u64>,
    /// Configured cache chunk count.
    pub cache_sets: usize,
    /// Configured frames per cache chunk.
    pub cache_elements: usize,
    /// Configured archive chunk-group count.
    pub archive_sets: usize,
    /// Configured cache chunks per archive chunk-group.
    pub archive_elements: usize,
}

impl Summary {
    /// Stamps the summary with the current time.
    pub fn dated_now(mut self) -> Self {
        self.date = Some(Utc::now().to_rfc2822());
        self
    }

    /// Renders the summary as text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(date) = &self.date {
            out.push_str(&format!("Date: {date}\n"));
        }
        if let Some(user) = &self.username {
            out.push_str(&format!("Username: {user}\n"));
        }
        out.push_str(&format!("Number Of RingBuffers: {}\n", self.ring_buffers));
        if let Some(oldest) = self.oldest_group {
            out.push_str(&format!("Oldest FileSet: {oldest}\n"));
        }
        if let Some(newest) = self.newest_group {
            out.push_str(&format!("Newest FileSet: {newest}\n"));
        }
        out.push_str(&format!("Cache Sets: {}\n", self.cache_sets));
        out.push_str(&format!("Cache Elements/Set: {}\n", self.cache_elements));
        out.push_str(&format!("Archive Sets: {}\n", self.archive_sets));
        out.push_str(&format!("Archive Elements/Set: {}\n", self.archive_elements));
        out
    }

    /// Parses summary text.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::MalformedSummary`] for an unknown key, a line
    /// without `:`, or a number that does not parse.
    pub fn parse(text: &str) -> Result<Self> {
        let mut summary = Summary::default();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| DenError::MalformedSummary(line.to_string()))?;
            let value = value.trim();
            match key.trim() {
                "Date" => summary.date = Some(value.to_string()),
                "Username" => summary.username = Some(value.to_string()),
                "Number Of RingBuffers" => summary.ring_buffers = parse_number(line, value)?,
                "Oldest FileSet" => summary.oldest_group = Some(parse_number(line, value)?),
                "Newest FileSet" => summary.newest_group = Some(parse_number(line, value)?),
                "Cache Sets" => summary.cache_sets = parse_number(line, value)?,
                "Cache Elements/Set" => summary.cache_elements = parse_number(line, value)?,
                "Archive Sets" => summary.archive_sets = parse_number(line, value)?,
                "Archive Elements/Set" => summary.archive_elements = parse_number(line, value)?,
                _ => return Err(DenError::MalformedSummary(line.to_string())),
            }
        }
        Ok(summary)
    }

    /// Writes `summary.den` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        write_atomic(&dir.join(SUMMARY_FILE), self.render().as_bytes())
    }

    /// Reads `summary.den` from `dir`. A missing file is `Ok(None)`.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(dir.join(SUMMARY_FILE)) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_number<N: std::str::FromStr>(line: &str, value: &str) -> Result<N> {
    value
        .parse()
        .map_err(|_| DenError::MalformedSummary(line.to_string()))
}
