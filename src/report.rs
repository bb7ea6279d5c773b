// ✅ Validation Report - what a reviewer sees for a candidate batch
// Aggregate confidence, counts, quality issues, samples from the latest period

use crate::document::Period;
use crate::gate::BatchStatus;
use crate::normalizer::ValueFlag;
use crate::parser::PageFailure;
use crate::records::{aggregate_confidence, CandidateRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Records below this count as low confidence in the report
pub const LOW_CONFIDENCE: f64 = 0.9;

const SAMPLE_SIZE: usize = 5;

// ============================================================================
// QUALITY ISSUES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Batch cannot be used as-is
    Warning,  // Values need a second look
    Info,     // Repairs were applied
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub field: String,
    pub issue: String,
    pub recommendation: String,
}

impl QualityIssue {
    fn new(severity: Severity, field: &str, issue: String, recommendation: &str) -> Self {
        QualityIssue {
            severity,
            field: field.to_string(),
            issue,
            recommendation: recommendation.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceMetrics {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub low_confidence_count: usize,
}

/// Who produced the batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub agent: String,
    pub strategy: String,
    #[serde(default)]
    pub page_failures: Vec<PageFailure>,
}

/// Last gate decision, mirrored from the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: String,
    pub reason: String,
    pub actor: String,
    pub decided_at: DateTime<Utc>,
}

// ============================================================================
// VALIDATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub batch_id: String,
    pub source: String,
    pub period: Period,
    pub created_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub provenance: Provenance,

    /// Mean of record confidences, 0.0 for an empty batch
    pub aggregate_confidence: f64,
    pub record_count: usize,
    pub flagged_count: usize,
    pub confidence_metrics: ConfidenceMetrics,
    pub category_counts: BTreeMap<String, usize>,
    pub value_type_counts: BTreeMap<String, usize>,
    pub date_range: Option<(String, String)>,
    pub samples: Vec<serde_json::Value>,
    pub issues: Vec<QualityIssue>,

    #[serde(default)]
    pub decision: Option<Decision>,
}

impl ValidationReport {
    pub fn build(
        batch_id: &str,
        source: &str,
        period: Period,
        created_at: DateTime<Utc>,
        records: &[CandidateRecord],
        provenance: Provenance,
    ) -> Self {
        let aggregate = aggregate_confidence(records);

        let confidence_metrics = if records.is_empty() {
            ConfidenceMetrics::default()
        } else {
            ConfidenceMetrics {
                mean: aggregate,
                min: records.iter().map(|r| r.confidence).fold(f64::INFINITY, f64::min),
                max: records.iter().map(|r| r.confidence).fold(0.0, f64::max),
                low_confidence_count: records.iter().filter(|r| r.confidence < LOW_CONFIDENCE).count(),
            }
        };

        let mut category_counts = BTreeMap::new();
        let mut value_type_counts = BTreeMap::new();
        for record in records {
            *category_counts.entry(record.category.clone()).or_insert(0) += 1;
            for measure in &record.measures {
                *value_type_counts
                    .entry(measure.value_type.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        let date_range = match (
            records.iter().map(|r| r.period).min(),
            records.iter().map(|r| r.period).max(),
        ) {
            (Some(first), Some(last)) => Some((first.date_string(), last.date_string())),
            _ => None,
        };

        let flagged_count = records.iter().filter(|r| r.is_flagged()).count();
        let issues = collect_issues(records, &confidence_metrics, &provenance.page_failures);

        ValidationReport {
            batch_id: batch_id.to_string(),
            source: source.to_string(),
            period,
            created_at,
            status: BatchStatus::Pending,
            provenance,
            aggregate_confidence: aggregate,
            record_count: records.len(),
            flagged_count,
            confidence_metrics,
            category_counts,
            value_type_counts,
            date_range,
            samples: latest_samples(records),
            issues,
            decision: None,
        }
    }

    pub fn summary(&self) -> String {
        let range = self
            .date_range
            .as_ref()
            .map(|(a, b)| format!("{} → {}", a, b))
            .unwrap_or_else(|| "no dates".to_string());
        format!(
            "{} | {} | {} records, {:.1}% confidence, {} flagged | {} | {} issues",
            self.batch_id,
            self.status.as_str(),
            self.record_count,
            self.aggregate_confidence * 100.0,
            self.flagged_count,
            range,
            self.issues.len()
        )
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

fn collect_issues(
    records: &[CandidateRecord],
    metrics: &ConfidenceMetrics,
    page_failures: &[PageFailure],
) -> Vec<QualityIssue> {
    let mut issues = Vec::new();

    if records.is_empty() {
        issues.push(QualityIssue::new(
            Severity::Critical,
            "records",
            "No records were extracted".to_string(),
            "Reject the batch or re-extract with another profile",
        ));
        return issues;
    }

    if metrics.low_confidence_count > 0 {
        issues.push(QualityIssue::new(
            Severity::Warning,
            "confidence",
            format!(
                "{} of {} records below {:.0}% confidence",
                metrics.low_confidence_count,
                records.len(),
                LOW_CONFIDENCE * 100.0
            ),
            "Review the flagged values before approving",
        ));
    }

    let mut out_of_range = 0;
    let mut repaired = 0;
    for measure in records.iter().flat_map(|r| r.measures.iter()) {
        for flag in &measure.flags {
            match flag {
                ValueFlag::OutOfRange => out_of_range += 1,
                ValueFlag::Rescaled(_) | ValueFlag::SplitThousands => repaired += 1,
                ValueFlag::PercentScaled => {}
            }
        }
    }
    if out_of_range > 0 {
        issues.push(QualityIssue::new(
            Severity::Warning,
            "values",
            format!("{} values outside their plausible range", out_of_range),
            "Check against the source document",
        ));
    }
    if repaired > 0 {
        issues.push(QualityIssue::new(
            Severity::Info,
            "values",
            format!("{} values reconstructed by a repair heuristic", repaired),
            "Spot-check repaired values",
        ));
    }

    for failure in page_failures {
        issues.push(QualityIssue::new(
            Severity::Warning,
            "pages",
            format!("page {}: {}", failure.page, failure.reason),
            "Confirm the page is expected to be empty",
        ));
    }

    issues
}

/// Up to five records from the latest period, flattened for display
fn latest_samples(records: &[CandidateRecord]) -> Vec<serde_json::Value> {
    let latest = match records.iter().map(|r| r.period).max() {
        Some(p) => p,
        None => return Vec::new(),
    };

    records
        .iter()
        .filter(|r| r.period == latest)
        .take(SAMPLE_SIZE)
        .map(|r| {
            let measures: serde_json::Map<String, serde_json::Value> = r
                .measures
                .iter()
                .map(|m| (m.name.clone(), serde_json::json!(m.value)))
                .collect();
            serde_json::json!({
                "date": r.period.date_string(),
                "category": r.category,
                "entity": r.entity.as_ref().map(|e| e.name.clone()),
                "measures": measures,
                "confidence": r.confidence,
            })
        })
        .collect()
}
