// 📄 Raw Documents - materialised source artifacts, one reporting period each
// Text pages (form-feed separated), CSV sheets, and open-data JSON dumps

use crate::error::IntakeError;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;

// ============================================================================
// PERIOD
// ============================================================================

/// Reporting period (monthly granularity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1900..=2999).contains(&year) {
            Some(Period { year, month })
        } else {
            None
        }
    }

    /// Parse `YYYY-MM` (a trailing `-DD` is accepted and ignored)
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let mut parts = trimmed.split('-');
        let year = parts.next().and_then(|y| y.parse::<i32>().ok());
        let month = parts.next().and_then(|m| m.parse::<u32>().ok());
        match (year, month) {
            (Some(y), Some(m)) => {
                Period::new(y, m).ok_or_else(|| IntakeError::UnrecognizedPeriod(text.to_string()).into())
            }
            _ => Err(IntakeError::UnrecognizedPeriod(text.to_string()).into()),
        }
    }

    /// Decode from a file name: `MM_YYYY` first, then `YYYY-MM`
    pub fn from_filename(name: &str) -> Result<Self> {
        let month_year = Regex::new(r"(?:^|[^\d])(\d{2})_(\d{4})(?:[^\d]|$)")?;
        if let Some(caps) = month_year.captures(name) {
            let month = caps[1].parse::<u32>().ok();
            let year = caps[2].parse::<i32>().ok();
            if let Some(period) = year.zip(month).and_then(|(y, m)| Period::new(y, m)) {
                return Ok(period);
            }
        }

        let year_month = Regex::new(r"(\d{4})-(\d{1,2})")?;
        if let Some(caps) = year_month.captures(name) {
            let year = caps[1].parse::<i32>().ok();
            let month = caps[2].parse::<u32>().ok();
            if let Some(period) = year.zip(month).and_then(|(y, m)| Period::new(y, m)) {
                return Ok(period);
            }
        }

        Err(IntakeError::UnrecognizedPeriod(name.to_string()).into())
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Period {
            year: date.year(),
            month: date.month(),
        }
    }

    /// First day of the period, `YYYY-MM-01`
    pub fn date_string(&self) -> String {
        format!("{:04}-{:02}-01", self.year, self.month)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

// ============================================================================
// PAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PageContent {
    Text(String),
    Grid(Vec<Vec<String>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// 1-based page (or sheet) number
    pub number: usize,
    pub content: PageContent,
}

impl Page {
    pub fn text(number: usize, text: impl Into<String>) -> Self {
        Page {
            number,
            content: PageContent::Text(text.into()),
        }
    }

    pub fn grid(number: usize, rows: Vec<Vec<String>>) -> Self {
        Page {
            number,
            content: PageContent::Grid(rows),
        }
    }

    /// First non-blank line (text) or first non-empty row joined (grid)
    pub fn first_line(&self) -> String {
        match &self.content {
            PageContent::Text(text) => text
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("")
                .to_string(),
            PageContent::Grid(rows) => rows
                .iter()
                .find(|r| r.iter().any(|c| !c.trim().is_empty()))
                .map(|r| r.join("|"))
                .unwrap_or_default(),
        }
    }
}

// ============================================================================
// RAW DOCUMENT
// ============================================================================

/// Immutable once loaded
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub source: String,
    pub period: Period,
    /// File name the pages came from
    pub origin: String,
    pub pages: Vec<Page>,
}

impl RawDocument {
    pub fn from_pages(source: &str, period: Period, origin: &str, pages: Vec<Page>) -> Self {
        RawDocument {
            source: source.to_string(),
            period,
            origin: origin.to_string(),
            pages,
        }
    }

    /// Load a document from disk. The period comes from `period` or the file name.
    pub fn load(path: &Path, source: &str, period: Option<Period>) -> Result<Self> {
        let origin = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let period = match period {
            Some(p) => p,
            None => Period::from_filename(&origin)?,
        };

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let pages = match extension.as_str() {
            "txt" => load_text_pages(path)?,
            "csv" => vec![Page::grid(1, load_csv_grid(path)?)],
            "json" => vec![Page::grid(1, load_json_grid(path)?)],
            other => return Err(IntakeError::UnsupportedFormat(format!(".{} ({})", other, origin)).into()),
        };

        Ok(RawDocument::from_pages(source, period, &origin, pages))
    }

    pub fn page(&self, number: usize) -> Option<&Page> {
        self.pages.iter().find(|p| p.number == number)
    }

    /// Period-independent layout fingerprint used by PatternMemory
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update(self.pages.len().to_le_bytes());
        for page in &self.pages {
            let stripped: String = page
                .first_line()
                .chars()
                .filter(|c| !c.is_ascii_digit())
                .collect();
            hasher.update(stripped.trim().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

fn load_text_pages(path: &Path) -> Result<Vec<Page>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read text document {}", path.display()))?;

    Ok(content
        .split('\x0c')
        .enumerate()
        .map(|(i, text)| Page::text(i + 1, text))
        .collect())
}

fn load_csv_grid(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV sheet {}", path.display()))?;

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record.with_context(|| format!("Malformed CSV row in {}", path.display()))?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }
    Ok(rows)
}

/// Open-data dumps: a bare array of objects, or one nested under
/// `data`, `records` or `result.records`
fn load_json_grid(path: &Path) -> Result<Vec<Vec<String>>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSON document {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON document {}", path.display()))?;

    let records = value
        .as_array()
        .or_else(|| value.get("data").and_then(|v| v.as_array()))
        .or_else(|| value.get("records").and_then(|v| v.as_array()))
        .or_else(|| {
            value
                .get("result")
                .and_then(|r| r.get("records"))
                .and_then(|v| v.as_array())
        })
        .ok_or_else(|| {
            IntakeError::UnsupportedFormat(format!("no record array in {}", path.display()))
        })?;

    Ok(json_records_to_grid(records))
}

pub(crate) fn json_records_to_grid(records: &[serde_json::Value]) -> Vec<Vec<String>> {
    let mut header: Vec<String> = Vec::new();
    for record in records {
        if let Some(obj) = record.as_object() {
            for key in obj.keys() {
                if !header.contains(key) {
                    header.push(key.clone());
                }
            }
        }
    }

    let mut rows = vec![header.clone()];
    for record in records {
        let row = header
            .iter()
            .map(|key| match record.get(key) {
                Some(serde_json::Value::String(s)) => s.trim().to_string(),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect();
        rows.push(row);
    }
    rows
}
