// 🔄 Pipeline - one document in, one gated batch out
// extract → arbitrate → report → gate; load and status sit on top of the same config

use crate::arbiter::AgentCrew;
use crate::config::{IntakeConfig, IntakePaths};
use crate::db::{family_summary, open_database, FamilySummary};
use crate::document::{Period, RawDocument};
use crate::error::IntakeError;
use crate::gate::{BatchStatus, ValidationBatch, ValidationGate};
use crate::loader::{LoadSummary, MergeLoader};
use crate::parser::PageFailure;
use crate::patterns::PatternMemory;
use crate::profiles::ProfileSet;
use crate::report::Provenance;
use crate::router::SchemaRouter;
use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Outcome of one extraction run
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRun {
    pub batch_id: String,
    pub status: BatchStatus,
    pub agent: String,
    pub strategy: String,
    pub agents_invoked: Vec<String>,
    pub recommended: Option<String>,
    pub aggregate_confidence: f64,
    /// Records handed to the gate
    pub produced: usize,
    /// Expected records the winning attempt could not recover
    pub skipped: usize,
    /// Records carrying at least one repaired or out-of-range value
    pub flagged: usize,
    pub page_failures: Vec<PageFailure>,
}

impl ExtractionRun {
    pub fn summary(&self) -> String {
        format!(
            "{} → {} | agent {} ({}) | {} produced, {} skipped, {} flagged | {:.1}% confidence",
            self.batch_id,
            self.status.as_str(),
            self.agent,
            self.strategy,
            self.produced,
            self.skipped,
            self.flagged,
            self.aggregate_confidence * 100.0
        )
    }
}

pub struct Pipeline {
    config: IntakeConfig,
    paths: IntakePaths,
    profiles: ProfileSet,
    router: SchemaRouter,
}

impl Pipeline {
    /// Validate config, create the directory layout, load profiles
    pub fn new(config: IntakeConfig) -> Result<Self> {
        config.validate()?;
        let paths = config.resolve_paths();
        paths.ensure_dirs()?;
        let profiles = ProfileSet::load(config.profiles_file.as_deref())?;
        let router = SchemaRouter::new(&config.router);

        info!(base_dir = %paths.base_dir.display(), "pipeline ready");
        Ok(Pipeline {
            config,
            paths,
            profiles,
            router,
        })
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    pub fn paths(&self) -> &IntakePaths {
        &self.paths
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    pub fn gate(&self) -> ValidationGate {
        ValidationGate::new(&self.config.gate, &self.paths)
    }

    pub fn pattern_memory(&self) -> Result<PatternMemory> {
        PatternMemory::open(&self.paths.patterns, self.config.arbiter.memory_capacity)
    }

    /// Run the agent crew over one document and submit the winner to the gate
    pub fn extract(&self, path: &Path, source: &str, period: Option<Period>) -> Result<ExtractionRun> {
        let profile = self.profiles.get(source)?;
        let doc = RawDocument::load(path, source, period)?;
        info!(
            source,
            origin = %doc.origin,
            period = %doc.period,
            pages = doc.pages.len(),
            "extracting document"
        );

        let crew = AgentCrew::standard(profile, &self.config.arbiter, &self.config.gate);
        let mut memory = self.pattern_memory()?;
        let result = crew.run(&doc, &mut memory);
        memory.save()?;

        let agents_invoked: Vec<String> = result.invoked().into_iter().map(String::from).collect();
        let recommended = result.recommended.clone();
        let diagnostic = result.diagnostic();
        let winner = match result.into_winner() {
            Some(w) => w,
            None => {
                return Err(IntakeError::AllStrategiesFailed {
                    source_name: source.to_string(),
                    diagnostic,
                }
                .into())
            }
        };

        let produced = winner.records.len();
        let skipped = winner.expected.saturating_sub(produced);
        let flagged = winner.records.iter().filter(|r| r.is_flagged()).count();
        let provenance = Provenance {
            agent: winner.agent.clone(),
            strategy: winner.strategy.clone(),
            page_failures: winner.page_failures.clone(),
        };

        let mut batch = ValidationBatch::new(source, doc.period, winner.records, provenance);
        let status = self.gate().submit(&mut batch)?;

        let run = ExtractionRun {
            batch_id: batch.id.clone(),
            status,
            agent: winner.agent,
            strategy: winner.strategy,
            agents_invoked,
            recommended,
            aggregate_confidence: batch.aggregate_confidence(),
            produced,
            skipped,
            flagged,
            page_failures: winner.page_failures,
        };
        info!("{}", run.summary());
        Ok(run)
    }

    /// Merge every approved batch into the store
    pub fn load(&self) -> Result<LoadSummary> {
        let mut conn = open_database(&self.paths.database, self.router.families())?;
        MergeLoader::new(&self.paths, &self.router).load_all_approved(&mut conn)
    }

    /// Record count and date range per family
    pub fn status(&self) -> Result<Vec<FamilySummary>> {
        let conn = open_database(&self.paths.database, self.router.families())?;
        self.router
            .families()
            .iter()
            .map(|family| family_summary(&conn, family))
            .collect()
    }
}
