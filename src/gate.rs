// 🚦 Validation Gate - human-in-the-loop checkpoint before the database
// pending → approved | rejected. Terminal states never move again.

use crate::audit::{AuditEntry, AuditLog};
use crate::batch_store::BatchStore;
use crate::config::{GatePolicy, IntakePaths, ReviewBand};
use crate::document::Period;
use crate::error::IntakeError;
use crate::records::CandidateRecord;
use crate::report::{Decision, Provenance, ValidationReport};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const GATE_ACTOR: &str = "gate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Approved,
    Rejected,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Approved => "approved",
            BatchStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Pending)
    }
}

// ============================================================================
// BATCH
// ============================================================================

/// Candidate records plus their report, as submitted to the gate
#[derive(Debug, Clone)]
pub struct ValidationBatch {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub records: Vec<CandidateRecord>,
    pub report: ValidationReport,
}

impl ValidationBatch {
    pub fn new(
        source: &str,
        period: Period,
        records: Vec<CandidateRecord>,
        provenance: Provenance,
    ) -> Self {
        let created_at = Utc::now();
        let id = format!("{}_{}_{}", source, period, created_at.format("%Y%m%d_%H%M%S"));
        let report = ValidationReport::build(&id, source, period, created_at, &records, provenance);
        ValidationBatch {
            id,
            created_at,
            records,
            report,
        }
    }

    /// Give the batch a new id, keeping the report in step
    fn rename(&mut self, id: String) {
        self.report.batch_id = id.clone();
        self.id = id;
    }

    pub fn aggregate_confidence(&self) -> f64 {
        self.report.aggregate_confidence
    }
}

/// Listing row for `pending`
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub report: ValidationReport,
    pub band: ReviewBand,
}

// ============================================================================
// GATE
// ============================================================================

pub struct ValidationGate {
    policy: GatePolicy,
    store: BatchStore,
    audit: AuditLog,
}

impl ValidationGate {
    pub fn new(policy: &GatePolicy, paths: &IntakePaths) -> Self {
        ValidationGate {
            policy: policy.clone(),
            store: BatchStore::new(paths),
            audit: AuditLog::new(&paths.audit),
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Persist a batch as pending, then apply the automatic policy.
    /// Returns the status the batch ends up in.
    pub fn submit(&self, batch: &mut ValidationBatch) -> Result<BatchStatus> {
        // Two runs inside the same second would otherwise share an id
        if self.store.locate(&batch.id).is_some() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            let id = format!("{}_{}", batch.id, &suffix[..8]);
            batch.rename(id);
        }

        self.store.write_pending(batch)?;
        let confidence = batch.aggregate_confidence();
        self.audit.append(&AuditEntry::new(
            "submitted",
            &batch.id,
            &batch.report.summary(),
            "pipeline",
            confidence,
        ))?;
        debug!(batch_id = %batch.id, confidence, "batch written to pending");

        if confidence >= self.policy.auto_approve {
            self.transition(&batch.id, BatchStatus::Approved, "auto-approved", GATE_ACTOR)?;
            batch.report.status = BatchStatus::Approved;
            return Ok(BatchStatus::Approved);
        }

        if self.policy.auto_reject && confidence <= self.policy.reject {
            self.transition(&batch.id, BatchStatus::Rejected, "auto-rejected", GATE_ACTOR)?;
            batch.report.status = BatchStatus::Rejected;
            return Ok(BatchStatus::Rejected);
        }

        info!(
            batch_id = %batch.id,
            confidence,
            band = ?self.policy.band(confidence),
            "batch awaiting review"
        );
        Ok(BatchStatus::Pending)
    }

    pub fn approve(&self, batch_id: &str, reason: &str, actor: &str) -> Result<ValidationReport> {
        self.decide(batch_id, BatchStatus::Approved, reason, actor)
    }

    pub fn reject(&self, batch_id: &str, reason: &str, actor: &str) -> Result<ValidationReport> {
        self.decide(batch_id, BatchStatus::Rejected, reason, actor)
    }

    fn decide(
        &self,
        batch_id: &str,
        to: BatchStatus,
        reason: &str,
        actor: &str,
    ) -> Result<ValidationReport> {
        if reason.trim().is_empty() {
            let action = if to == BatchStatus::Approved { "approve" } else { "reject" };
            return Err(IntakeError::MissingReason(action.to_string()).into());
        }

        match self.store.locate(batch_id) {
            None => Err(IntakeError::BatchNotFound(batch_id.to_string()).into()),
            Some(status) if status.is_terminal() => Err(IntakeError::InvalidTransition {
                batch_id: batch_id.to_string(),
                status: status.as_str().to_string(),
            }
            .into()),
            Some(_) => self.transition(batch_id, to, reason.trim(), actor),
        }
    }

    /// Move a pending batch, stamp the decision into its report, audit it
    fn transition(
        &self,
        batch_id: &str,
        to: BatchStatus,
        reason: &str,
        actor: &str,
    ) -> Result<ValidationReport> {
        let mut report = self.store.read_report(BatchStatus::Pending, batch_id)?;
        self.store.transfer(batch_id, BatchStatus::Pending, to)?;

        let entry = AuditEntry::new(to.as_str(), batch_id, reason, actor, report.aggregate_confidence);
        report.status = to;
        report.decision = Some(Decision {
            action: entry.action.clone(),
            reason: entry.reason.clone(),
            actor: entry.actor.clone(),
            decided_at: entry.timestamp,
        });
        self.store.write_report(to, &report)?;
        self.audit.append(&entry)?;

        info!(batch_id, status = to.as_str(), actor, reason, "batch decided");
        Ok(report)
    }

    /// Every pending batch with its review band, oldest first
    pub fn pending(&self) -> Result<Vec<PendingBatch>> {
        Ok(self
            .store
            .list(BatchStatus::Pending)?
            .into_iter()
            .map(|report| PendingBatch {
                band: self.policy.band(report.aggregate_confidence),
                report,
            })
            .collect())
    }

    /// Pending batches strictly between the reject and auto-approve thresholds
    pub fn needs_review(&self) -> Result<Vec<PendingBatch>> {
        Ok(self
            .pending()?
            .into_iter()
            .filter(|p| self.policy.needs_review(p.report.aggregate_confidence))
            .collect())
    }

    pub fn approved(&self) -> Result<Vec<ValidationReport>> {
        self.store.list(BatchStatus::Approved)
    }

    pub fn rejected(&self) -> Result<Vec<ValidationReport>> {
        self.store.list(BatchStatus::Rejected)
    }
}
