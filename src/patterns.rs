// 🧠 Pattern Memory - bounded log of which agent worked on which layout
// Advisory only: the crew order never changes because of it

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub agent: String,
    pub signature: String,
    pub source: String,
    pub success: bool,
    pub confidence: f64,
    pub records: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_attempts: u64,
    pub success_count: u64,
    pub success_rate: f64,
}

impl AgentStats {
    fn record(&mut self, success: bool) {
        self.total_attempts += 1;
        if success {
            self.success_count += 1;
        }
        self.success_rate = self.success_count as f64 / self.total_attempts as f64;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryFile {
    #[serde(default)]
    entries: VecDeque<PatternEntry>,
    #[serde(default)]
    agent_stats: BTreeMap<String, AgentStats>,
}

pub struct PatternMemory {
    path: Option<PathBuf>,
    capacity: usize,
    data: MemoryFile,
}

impl PatternMemory {
    /// Memory that is never written to disk
    pub fn in_memory(capacity: usize) -> Self {
        PatternMemory {
            path: None,
            capacity,
            data: MemoryFile::default(),
        }
    }

    /// Read the JSON file at `path`; a missing file starts empty and an
    /// unreadable one is logged and replaced on the next save
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let data = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read pattern memory {}", path.display()))?;
            match serde_json::from_str::<MemoryFile>(&content) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "pattern memory unreadable, starting fresh");
                    MemoryFile::default()
                }
            }
        } else {
            MemoryFile::default()
        };

        let mut memory = PatternMemory {
            path: Some(path.to_path_buf()),
            capacity,
            data,
        };
        memory.trim();
        Ok(memory)
    }

    /// Append an outcome, evicting the oldest entries past capacity
    pub fn record(&mut self, entry: PatternEntry) {
        self.data
            .agent_stats
            .entry(entry.agent.clone())
            .or_default()
            .record(entry.success);
        self.data.entries.push_back(entry);
        self.trim();
    }

    fn trim(&mut self) {
        while self.data.entries.len() > self.capacity {
            self.data.entries.pop_front();
        }
    }

    /// Agent with most successes on this signature, else best overall success
    /// rate, else None
    pub fn recommend(&self, signature: &str) -> Option<String> {
        let mut by_signature: BTreeMap<&str, u64> = BTreeMap::new();
        for entry in self.data.entries.iter().filter(|e| e.signature == signature && e.success) {
            *by_signature.entry(entry.agent.as_str()).or_default() += 1;
        }
        if let Some((agent, _)) = by_signature.iter().max_by_key(|(_, count)| **count) {
            return Some(agent.to_string());
        }

        self.data
            .agent_stats
            .iter()
            .filter(|(_, stats)| stats.success_count > 0)
            .max_by(|a, b| {
                a.1.success_rate
                    .partial_cmp(&b.1.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(agent, _)| agent.clone())
    }

    pub fn entries(&self) -> impl Iterator<Item = &PatternEntry> {
        self.data.entries.iter()
    }

    pub fn stats(&self) -> &BTreeMap<String, AgentStats> {
        &self.data.agent_stats
    }

    /// Write through a temp file so a crash never leaves half a file
    pub fn save(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.data)?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace pattern memory {}", path.display()))?;
        Ok(())
    }
}
