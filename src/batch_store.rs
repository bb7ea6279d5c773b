// 🗄️ Batch Store - file-system areas for pending, approved and rejected batches
// Each batch is `<id>.csv` (payload) + `<id>.json` (report). Files move, never vanish.

use crate::config::IntakePaths;
use crate::gate::{BatchStatus, ValidationBatch};
use crate::records::records_to_rows;
use crate::report::ValidationReport;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct BatchStore {
    pending: PathBuf,
    approved: PathBuf,
    rejected: PathBuf,
}

impl BatchStore {
    pub fn new(paths: &IntakePaths) -> Self {
        BatchStore {
            pending: paths.pending.clone(),
            approved: paths.approved.clone(),
            rejected: paths.rejected.clone(),
        }
    }

    pub fn dir(&self, status: BatchStatus) -> &Path {
        match status {
            BatchStatus::Pending => &self.pending,
            BatchStatus::Approved => &self.approved,
            BatchStatus::Rejected => &self.rejected,
        }
    }

    pub fn payload_path(&self, status: BatchStatus, id: &str) -> PathBuf {
        self.dir(status).join(format!("{}.csv", id))
    }

    pub fn report_path(&self, status: BatchStatus, id: &str) -> PathBuf {
        self.dir(status).join(format!("{}.json", id))
    }

    /// Area currently holding the batch
    pub fn locate(&self, id: &str) -> Option<BatchStatus> {
        [BatchStatus::Pending, BatchStatus::Approved, BatchStatus::Rejected]
            .into_iter()
            .find(|status| self.report_path(*status, id).exists())
    }

    pub fn write_pending(&self, batch: &ValidationBatch) -> Result<()> {
        let dir = self.dir(BatchStatus::Pending);
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create pending dir {}", dir.display()))?;

        let payload = self.payload_path(BatchStatus::Pending, &batch.id);
        let (header, rows) = records_to_rows(&batch.records);
        let mut wtr = csv::Writer::from_path(&payload)
            .with_context(|| format!("Failed to create payload {}", payload.display()))?;
        wtr.write_record(&header)?;
        for row in &rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;

        self.write_report(BatchStatus::Pending, &batch.report)
    }

    pub fn read_report(&self, status: BatchStatus, id: &str) -> Result<ValidationReport> {
        let path = self.report_path(status, id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read report {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse report {}", path.display()))
    }

    pub fn write_report(&self, status: BatchStatus, report: &ValidationReport) -> Result<()> {
        let path = self.report_path(status, &report.batch_id);
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&path, json).with_context(|| format!("Failed to write report {}", path.display()))
    }

    /// Move payload and report between areas
    pub fn transfer(&self, id: &str, from: BatchStatus, to: BatchStatus) -> Result<()> {
        let target = self.dir(to);
        fs::create_dir_all(target)
            .with_context(|| format!("Failed to create {}", target.display()))?;

        for (src, dst) in [
            (self.payload_path(from, id), self.payload_path(to, id)),
            (self.report_path(from, id), self.report_path(to, id)),
        ] {
            if src.exists() {
                fs::rename(&src, &dst).with_context(|| {
                    format!("Failed to move {} to {}", src.display(), dst.display())
                })?;
            }
        }
        Ok(())
    }

    /// Reports in one area, oldest first
    pub fn list(&self, status: BatchStatus) -> Result<Vec<ValidationReport>> {
        let dir = self.dir(status);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "json") {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read report {}", path.display()))?;
                let report: ValidationReport = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse report {}", path.display()))?;
                reports.push(report);
            }
        }
        reports.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.batch_id.cmp(&b.batch_id)));
        Ok(reports)
    }
}
