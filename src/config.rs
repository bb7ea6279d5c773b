// ⚙️ Intake Configuration - one value built at startup, passed by reference
// Every field has a default so an empty TOML file is a valid config

use crate::error::IntakeError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub paths: PathsConfig,
    pub gate: GatePolicy,
    pub arbiter: ArbiterConfig,
    pub router: RouterConfig,

    /// Optional TOML file with source profiles that replace the built-ins by name
    pub profiles_file: Option<PathBuf>,
}

impl IntakeConfig {
    /// Load from a TOML file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str::<IntakeConfig>(&content)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => IntakeConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Builder pattern: override the base directory
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.paths.base_dir = base_dir.into();
        self
    }

    /// Thresholds must be ordered: reject <= manual_review <= auto_approve, all in [0,1]
    pub fn validate(&self) -> Result<()> {
        let g = &self.gate;
        let ordered = 0.0 <= g.reject
            && g.reject <= g.manual_review
            && g.manual_review <= g.auto_approve
            && g.auto_approve <= 1.0;
        if !ordered {
            return Err(IntakeError::Config(format!(
                "gate thresholds must satisfy 0 <= reject ({}) <= manual_review ({}) <= auto_approve ({}) <= 1",
                g.reject, g.manual_review, g.auto_approve
            ))
            .into());
        }

        let a = &self.arbiter;
        if !(0.0..=1.0).contains(&a.early_exit) || !(0.0..=1.0).contains(&a.success) {
            return Err(IntakeError::Config(
                "arbiter thresholds must be within [0, 1]".to_string(),
            )
            .into());
        }
        if a.memory_capacity == 0 {
            return Err(IntakeError::Config("arbiter.memory_capacity must be > 0".to_string()).into());
        }

        if !(0.0..=1.0).contains(&self.router.min_score) {
            return Err(IntakeError::Config("router.min_score must be within [0, 1]".to_string()).into());
        }

        Ok(())
    }

    /// Resolve every concrete path once
    pub fn resolve_paths(&self) -> IntakePaths {
        IntakePaths::under(&self.paths.base_dir, self.paths.database.as_deref())
    }
}

// ============================================================================
// PATHS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub base_dir: PathBuf,

    /// Store location; defaults to `<base_dir>/intake.db`
    pub database: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            base_dir: PathBuf::from("data"),
            database: None,
        }
    }
}

/// Concrete locations derived from the base directory
#[derive(Debug, Clone)]
pub struct IntakePaths {
    pub base_dir: PathBuf,
    pub database: PathBuf,
    pub pending: PathBuf,
    pub approved: PathBuf,
    pub rejected: PathBuf,
    pub audit: PathBuf,
    pub processed: PathBuf,
    pub reports: PathBuf,
    pub patterns: PathBuf,
}

impl IntakePaths {
    pub fn under(base_dir: &Path, database: Option<&Path>) -> Self {
        let validation = base_dir.join("validation");
        IntakePaths {
            base_dir: base_dir.to_path_buf(),
            database: database
                .map(Path::to_path_buf)
                .unwrap_or_else(|| base_dir.join("intake.db")),
            pending: validation.join("pending"),
            approved: validation.join("approved"),
            rejected: validation.join("rejected"),
            audit: validation.join("logs"),
            processed: base_dir.join("processed"),
            reports: base_dir.join("reports"),
            patterns: base_dir.join("extraction_patterns.json"),
        }
    }

    /// Create every directory the pipeline writes into
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.base_dir,
            &self.pending,
            &self.approved,
            &self.rejected,
            &self.audit,
            &self.processed,
            &self.reports,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

// ============================================================================
// GATE POLICY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatePolicy {
    /// Aggregate confidence at or above this is approved without manual input
    pub auto_approve: f64,

    /// Pending batches at or above this are listed as high confidence
    pub manual_review: f64,

    /// At or below this a batch is a rejection candidate
    pub reject: f64,

    /// When true, batches at or below `reject` are rejected on submit
    pub auto_reject: bool,
}

impl Default for GatePolicy {
    fn default() -> Self {
        GatePolicy {
            auto_approve: 0.90,
            manual_review: 0.70,
            reject: 0.50,
            auto_reject: false,
        }
    }
}

/// Where a confidence value falls relative to the gate thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewBand {
    AutoApprove,
    HighConfidence,
    NeedsReview,
    RejectCandidate,
}

impl GatePolicy {
    pub fn band(&self, confidence: f64) -> ReviewBand {
        if confidence >= self.auto_approve {
            ReviewBand::AutoApprove
        } else if confidence <= self.reject {
            ReviewBand::RejectCandidate
        } else if confidence >= self.manual_review {
            ReviewBand::HighConfidence
        } else {
            ReviewBand::NeedsReview
        }
    }

    /// Strictly between the reject and auto-approve thresholds
    pub fn needs_review(&self, confidence: f64) -> bool {
        confidence > self.reject && confidence < self.auto_approve
    }
}

// ============================================================================
// ARBITER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Stop invoking agents once a successful attempt reaches this
    pub early_exit: f64,

    /// Attempt confidence needed to count as a success
    pub success: f64,

    /// Added when the profile's plausibility check passes
    pub plausibility_boost: f64,

    /// PatternMemory entries kept on disk
    pub memory_capacity: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        ArbiterConfig {
            early_exit: 0.9,
            success: 0.7,
            plausibility_boost: 0.1,
            memory_capacity: 50,
        }
    }
}

// ============================================================================
// ROUTER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Families scoring below this are discarded
    pub min_score: f64,

    /// Lower-cased column name -> canonical field name
    pub rename: BTreeMap<String, String>,

    /// Per-source rename maps; entries win over `rename`
    pub source_overrides: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let rename = [
            ("propertytype", "category"),
            ("property_type", "category"),
            ("indicator_type", "category"),
            ("month", "date"),
            ("period", "date"),
            ("newsales", "new_sales"),
            ("newlistings", "new_listings"),
            ("daysonmarket", "days_on_market"),
            ("benchmarkprice", "benchmark_price"),
            ("medianprice", "median_price"),
            ("averageprice", "average_price"),
            ("monthssupply", "months_supply"),
            ("confidence_score", "confidence"),
            ("extracted_date", "ingested_at"),
            ("source_pdf", "origin"),
        ]
        .into_iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect();

        RouterConfig {
            min_score: 0.6,
            rename,
            source_overrides: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IntakeConfig::default();
        assert_eq!(config.gate.auto_approve, 0.90);
        assert_eq!(config.gate.manual_review, 0.70);
        assert_eq!(config.gate.reject, 0.50);
        assert!(!config.gate.auto_reject);
        assert_eq!(config.arbiter.memory_capacity, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: IntakeConfig = toml::from_str(
            r#"
            [gate]
            auto_reject = true

            [router.source_overrides.open_data]
            category = "sector"
            "#,
        )
        .unwrap();

        assert!(config.gate.auto_reject);
        assert_eq!(config.gate.auto_approve, 0.90);
        assert_eq!(
            config.router.source_overrides["open_data"]["category"],
            "sector"
        );
        assert_eq!(config.router.rename["benchmarkprice"], "benchmark_price");
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut config = IntakeConfig::default();
        config.gate.reject = 0.95;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IntakeError>(),
            Some(IntakeError::Config(_))
        ));
    }

    #[test]
    fn test_review_bands() {
        let policy = GatePolicy::default();
        assert_eq!(policy.band(0.92), ReviewBand::AutoApprove);
        assert_eq!(policy.band(0.80), ReviewBand::HighConfidence);
        assert_eq!(policy.band(0.65), ReviewBand::NeedsReview);
        assert_eq!(policy.band(0.50), ReviewBand::RejectCandidate);
        assert!(policy.needs_review(0.65));
        assert!(!policy.needs_review(0.50));
        assert!(!policy.needs_review(0.90));
    }

    #[test]
    fn test_paths_layout() {
        let paths = IntakePaths::under(Path::new("/tmp/intake"), None);
        assert_eq!(paths.pending, PathBuf::from("/tmp/intake/validation/pending"));
        assert_eq!(paths.database, PathBuf::from("/tmp/intake/intake.db"));
        assert_eq!(paths.reports, PathBuf::from("/tmp/intake/reports"));
    }
}
