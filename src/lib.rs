// Metric Intake - Core Library
// Exposes the intake pipeline for the CLI and integration tests

pub mod error;
pub mod logging;
pub mod config;
pub mod document;
pub mod normalizer;     // Raw token → typed value
pub mod profiles;       // Per-source label patterns and page bindings
pub mod records;
pub mod parser;         // Layout-tolerant page parsing
pub mod patterns;       // Advisory memory of agent outcomes
pub mod arbiter;        // Agent crew and attempt scoring
pub mod report;
pub mod audit;
pub mod batch_store;
pub mod gate;           // Human-in-the-loop checkpoint
pub mod router;         // Record family inference
pub mod db;
pub mod loader;
pub mod pipeline;

// Re-export commonly used types
pub use error::IntakeError;
pub use config::{
    IntakeConfig, IntakePaths, GatePolicy, ReviewBand, ArbiterConfig, RouterConfig,
};
pub use document::{Period, Page, PageContent, RawDocument};
pub use normalizer::{
    normalize, parse_number, repair_split_thousands,
    MetricSpec, NormalizedValue, PercentScaling, RescaleRule, ValueFlag,
};
pub use profiles::{LayoutKind, ProfileSet, SourceProfile};
pub use records::{CandidateRecord, Measure, ValueType, records_to_rows};
pub use parser::{
    RecordParser, StrategyChain, TokenStrategy, PageLayout, PageFailure, ParseOutcome,
};
pub use patterns::{PatternMemory, PatternEntry, AgentStats};
pub use arbiter::{
    AgentCrew, CrewResult, ExtractionAgent, ExtractionAttempt,
    LayoutAgent, TabularAgent, UnavailableAgent,
};
pub use report::{ValidationReport, Provenance, QualityIssue, Severity};
pub use audit::{AuditEntry, AuditLog};
pub use batch_store::BatchStore;
pub use gate::{BatchStatus, PendingBatch, ValidationBatch, ValidationGate};
pub use router::{RecordFamily, RouteDecision, SchemaRouter, builtin_families};
pub use db::{
    Event, FamilySummary, MergeContext, MergeStats,
    open_database, setup_database, merge_rows, family_summary, insert_event, get_events_by_type,
};
pub use loader::{LoadSummary, MergeLoader};
pub use pipeline::{ExtractionRun, Pipeline};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
