// 📜 Audit Log - append-only JSONL, one file per day
// Entries are never rewritten; every gate transition adds one line

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub actor: String,
    pub confidence: f64,
}

impl AuditEntry {
    pub fn new(action: &str, batch_id: &str, reason: &str, actor: &str, confidence: f64) -> Self {
        AuditEntry {
            action: action.to_string(),
            batch_id: batch_id.to_string(),
            timestamp: Utc::now(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            confidence,
        }
    }
}

pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: &Path) -> Self {
        AuditLog {
            dir: dir.to_path_buf(),
        }
    }

    /// `validation_YYYYMMDD.jsonl` for the entry's UTC day
    pub fn file_for(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("validation_{}.jsonl", timestamp.format("%Y%m%d")))
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create audit dir {}", self.dir.display()))?;
        let path = self.file_for(entry.timestamp);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append to audit log {}", path.display()))?;
        Ok(())
    }

    /// Every entry across all days, oldest file first
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list audit dir {}", self.dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "jsonl"))
            .collect();
        files.sort();

        let mut entries = Vec::new();
        for path in files {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read audit log {}", path.display()))?;
            for (i, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                let entry: AuditEntry = serde_json::from_str(line).with_context(|| {
                    format!("Malformed audit entry at {}:{}", path.display(), i + 1)
                })?;
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn entries_for(&self, batch_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.batch_id == batch_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());

        let first = AuditEntry::new("submitted", "b1", "extracted", "pipeline", 0.8);
        let second = AuditEntry::new("approved", "b1", "checked against source", "analyst", 0.8);
        log.append(&first).unwrap();
        log.append(&second).unwrap();
        log.append(&AuditEntry::new("submitted", "b2", "extracted", "pipeline", 0.6)).unwrap();

        let path = log.file_for(first.timestamp);
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("validation_"));
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);

        let b1 = log.entries_for("b1").unwrap();
        assert_eq!(b1.len(), 2);
        assert_eq!(b1[1].action, "approved");
        assert_eq!(b1[1].actor, "analyst");
    }

    #[test]
    fn test_missing_dir_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(&dir.path().join("nope"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
