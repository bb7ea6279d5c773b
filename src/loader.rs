// 📥 Merge Loader - approved batches → canonical store → archive
// A batch that fails to route or merge stays in the approved area for remediation

use crate::batch_store::BatchStore;
use crate::config::IntakePaths;
use crate::db::{merge_rows, MergeContext, MergeStats};
use crate::gate::BatchStatus;
use crate::report::ValidationReport;
use crate::router::SchemaRouter;
use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
pub struct BatchLoad {
    pub batch_id: String,
    pub family: String,
    pub stats: MergeStats,
    pub archived_payload: PathBuf,
    pub archived_report: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub batch_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub loaded: Vec<BatchLoad>,
    pub failed: Vec<BatchFailure>,
    pub totals: MergeStats,
}

impl LoadSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} batches loaded, {} failed | {} inserted, {} unchanged, {} superseded, {} conflicts, {} skipped",
            self.loaded.len(),
            self.failed.len(),
            self.totals.inserted,
            self.totals.unchanged,
            self.totals.superseded,
            self.totals.conflicts,
            self.totals.skipped
        )
    }
}

pub struct MergeLoader<'a> {
    paths: &'a IntakePaths,
    router: &'a SchemaRouter,
    store: BatchStore,
}

impl<'a> MergeLoader<'a> {
    pub fn new(paths: &'a IntakePaths, router: &'a SchemaRouter) -> Self {
        MergeLoader {
            paths,
            router,
            store: BatchStore::new(paths),
        }
    }

    /// Route, merge and archive one approved batch
    pub fn load_batch(&self, conn: &mut Connection, report: &ValidationReport) -> Result<BatchLoad> {
        let payload = self.store.payload_path(BatchStatus::Approved, &report.batch_id);
        let mut rdr = csv::Reader::from_path(&payload)
            .with_context(|| format!("Failed to open payload {}", payload.display()))?;
        let header: Vec<String> = rdr.headers()?.iter().map(String::from).collect();

        let decision = self.router.route(&report.batch_id, &report.source, &header)?;

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record
                .with_context(|| format!("Malformed row in payload {}", payload.display()))?;
            let cells: Vec<String> = record.iter().map(String::from).collect();
            rows.push(decision.project(&cells));
        }

        let ctx = MergeContext {
            batch_id: report.batch_id.clone(),
            ingested_at: report.created_at,
            confidence: report.aggregate_confidence,
        };
        let stats = merge_rows(conn, &decision.family, &rows, &ctx)?;

        let (archived_payload, archived_report) = self.archive(&report.batch_id)?;

        info!(
            batch_id = %report.batch_id,
            family = %decision.family.name,
            inserted = stats.inserted,
            unchanged = stats.unchanged,
            superseded = stats.superseded,
            "batch merged"
        );

        Ok(BatchLoad {
            batch_id: report.batch_id.clone(),
            family: decision.family.name.clone(),
            stats,
            archived_payload,
            archived_report,
        })
    }

    /// Every approved batch, oldest first. One failure does not stop the rest.
    pub fn load_all_approved(&self, conn: &mut Connection) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();

        for report in self.store.list(BatchStatus::Approved)? {
            match self.load_batch(conn, &report) {
                Ok(load) => {
                    summary.totals.add(&load.stats);
                    summary.loaded.push(load);
                }
                Err(e) => {
                    error!(batch_id = %report.batch_id, error = %e, "batch not loaded, left in approved area");
                    summary.failed.push(BatchFailure {
                        batch_id: report.batch_id.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        info!("{}", summary.summary_line());
        Ok(summary)
    }

    /// `processed/<id>_<ts>.csv` and `reports/YYYY/MM/<id>_<ts>.json`
    fn archive(&self, batch_id: &str) -> Result<(PathBuf, PathBuf)> {
        let now = Utc::now();
        let mut stamp = now.format("%Y%m%d_%H%M%S").to_string();

        fs::create_dir_all(&self.paths.processed)
            .with_context(|| format!("Failed to create {}", self.paths.processed.display()))?;
        let report_dir = self
            .paths
            .reports
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()));
        fs::create_dir_all(&report_dir)
            .with_context(|| format!("Failed to create {}", report_dir.display()))?;

        let payload_src = self.store.payload_path(BatchStatus::Approved, batch_id);
        let report_src = self.store.report_path(BatchStatus::Approved, batch_id);
        // Archived artifacts are never overwritten
        if self.paths.processed.join(format!("{}_{}.csv", batch_id, stamp)).exists()
            || report_dir.join(format!("{}_{}.json", batch_id, stamp)).exists()
        {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            stamp = format!("{}_{}", stamp, &suffix[..8]);
        }
        let payload_dst = self.paths.processed.join(format!("{}_{}.csv", batch_id, stamp));
        let report_dst = report_dir.join(format!("{}_{}.json", batch_id, stamp));

        fs::rename(&payload_src, &payload_dst)
            .with_context(|| format!("Failed to archive {}", payload_src.display()))?;
        fs::rename(&report_src, &report_dst)
            .with_context(|| format!("Failed to archive {}", report_src.display()))?;

        Ok((payload_dst, report_dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatePolicy, RouterConfig};
    use crate::db::{count_records, setup_database};
    use crate::document::Period;
    use crate::gate::{ValidationBatch, ValidationGate};
    use crate::records::{CandidateRecord, Measure, ValueType};
    use crate::report::Provenance;
    use crate::router::builtin_families;

    fn city_batch(confidence: f64) -> ValidationBatch {
        let period = Period::new(2025, 1).unwrap();
        let mut record = CandidateRecord::new(period, "Total", "01_2025_city.txt#p11");
        record.push_measure(
            Measure::new("sales", 150.0, "count", ValueType::Absolute).with_confidence(confidence),
        );
        record.push_measure(Measure::new("benchmark_price", 650000.0, "dollars", ValueType::Absolute));
        ValidationBatch::new("creb_city", period, vec![record], Provenance::default())
    }

    fn setup() -> (tempfile::TempDir, IntakePaths, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let paths = IntakePaths::under(dir.path(), None);
        paths.ensure_dirs().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn, &builtin_families()).unwrap();
        (dir, paths, conn)
    }

    #[test]
    fn test_load_approved_and_archive() {
        let (_dir, paths, mut conn) = setup();
        let gate = ValidationGate::new(&GatePolicy::default(), &paths);
        let mut batch = city_batch(1.0);
        assert_eq!(gate.submit(&mut batch).unwrap(), BatchStatus::Approved);

        let router = SchemaRouter::new(&RouterConfig::default());
        let loader = MergeLoader::new(&paths, &router);
        let summary = loader.load_all_approved(&mut conn).unwrap();

        println!("Load: {}", summary.summary_line());

        assert_eq!(summary.loaded.len(), 1);
        assert_eq!(summary.loaded[0].family, "city");
        assert_eq!(summary.totals.inserted, 1);
        assert_eq!(count_records(&conn, "housing_city_monthly").unwrap(), 1);

        let load = &summary.loaded[0];
        assert!(load.archived_payload.exists());
        assert!(load.archived_report.exists());
        assert!(load.archived_report.starts_with(&paths.reports));
        assert!(gate.approved().unwrap().is_empty());

        // Nothing left to load
        let again = loader.load_all_approved(&mut conn).unwrap();
        assert!(again.loaded.is_empty());
    }

    #[test]
    fn test_pending_batches_are_not_loaded() {
        let (_dir, paths, mut conn) = setup();
        let gate = ValidationGate::new(&GatePolicy::default(), &paths);
        let mut batch = city_batch(0.75);
        assert_eq!(gate.submit(&mut batch).unwrap(), BatchStatus::Pending);

        let router = SchemaRouter::new(&RouterConfig::default());
        let summary = MergeLoader::new(&paths, &router).load_all_approved(&mut conn).unwrap();
        assert!(summary.loaded.is_empty());
        assert_eq!(count_records(&conn, "housing_city_monthly").unwrap(), 0);
    }

    #[test]
    fn test_unroutable_batch_stays_approved() {
        let (_dir, paths, mut conn) = setup();
        let gate = ValidationGate::new(&GatePolicy::default(), &paths);
        let period = Period::new(2025, 1).unwrap();
        let mut record = CandidateRecord::new(period, "Total", "x");
        record.push_measure(Measure::new("mystery_metric", 1.0, "count", ValueType::Absolute));
        let mut batch = ValidationBatch::new("odd_source", period, vec![record], Provenance::default());
        gate.submit(&mut batch).unwrap();

        let router = SchemaRouter::new(&RouterConfig::default());
        let summary = MergeLoader::new(&paths, &router).load_all_approved(&mut conn).unwrap();

        assert!(summary.has_failures());
        assert!(summary.failed[0].error.contains("could not determine target schema"));
        assert_eq!(gate.approved().unwrap().len(), 1);
    }
}
