// 🤝 Extraction Agent Crew - competing strategies, one winner per document
// Fixed priority order, early exit on a confident success, PatternMemory is advisory

use crate::config::{ArbiterConfig, GatePolicy};
use crate::document::{PageContent, Period, RawDocument};
use crate::parser::{PageFailure, RecordParser};
use crate::patterns::{PatternEntry, PatternMemory};
use crate::profiles::{LayoutKind, PlausibilityCheck, SourceProfile};
use crate::records::{aggregate_confidence, clamp_confidence, CandidateRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Boosted confidence stays this far below the auto-approve threshold
const BOOST_CEILING_MARGIN: f64 = 0.001;

// ============================================================================
// ATTEMPT
// ============================================================================

/// One agent's run over one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub agent: String,
    pub strategy: String,
    pub records: Vec<CandidateRecord>,
    pub expected: usize,
    pub confidence: f64,
    pub success: bool,
    pub diagnostic: String,
    #[serde(default)]
    pub page_failures: Vec<PageFailure>,
}

impl ExtractionAttempt {
    pub fn failed(agent: &str, diagnostic: &str) -> Self {
        ExtractionAttempt {
            agent: agent.to_string(),
            strategy: "none".to_string(),
            records: Vec::new(),
            expected: 0,
            confidence: 0.0,
            success: false,
            diagnostic: diagnostic.to_string(),
            page_failures: Vec::new(),
        }
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// coverage × mean record confidence, plus a capped plausibility boost
#[derive(Debug, Clone)]
pub struct AttemptScorer {
    boost: f64,
    auto_approve: f64,
    success: f64,
}

impl AttemptScorer {
    pub fn new(arbiter: &ArbiterConfig, gate: &GatePolicy) -> Self {
        AttemptScorer {
            boost: arbiter.plausibility_boost,
            auto_approve: gate.auto_approve,
            success: arbiter.success,
        }
    }

    /// Built-in agents count an attempt as a success at this confidence
    pub fn is_success(&self, confidence: f64) -> bool {
        confidence >= self.success
    }

    pub fn score(
        &self,
        records: &[CandidateRecord],
        expected: usize,
        plausibility: Option<&PlausibilityCheck>,
    ) -> f64 {
        if records.is_empty() || expected == 0 {
            return 0.0;
        }

        let coverage = (records.len() as f64 / expected as f64).min(1.0);
        let base = clamp_confidence(coverage * aggregate_confidence(records));

        let passes = plausibility.map_or(false, |check| is_plausible(records, check));
        if !passes || self.boost <= 0.0 {
            return base;
        }

        let boosted = clamp_confidence(base + self.boost);
        if base >= self.auto_approve {
            boosted
        } else {
            // A boost alone never carries a batch over the auto-approve line
            boosted.min(self.auto_approve - BOOST_CEILING_MARGIN).max(base)
        }
    }
}

/// Mean of the checked metric across records lies inside the range
pub fn is_plausible(records: &[CandidateRecord], check: &PlausibilityCheck) -> bool {
    let values: Vec<f64> = records
        .iter()
        .filter_map(|r| r.measure(&check.metric))
        .map(|m| m.value)
        .collect();
    if values.is_empty() {
        return false;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    mean >= check.min && mean <= check.max
}

// ============================================================================
// AGENTS
// ============================================================================

pub trait ExtractionAgent: Send + Sync {
    fn name(&self) -> &str;
    fn extract(&self, doc: &RawDocument, period: Period) -> ExtractionAttempt;
}

/// Profile-driven page layout parser
pub struct LayoutAgent {
    profile: SourceProfile,
    scorer: AttemptScorer,
}

impl LayoutAgent {
    pub fn new(profile: SourceProfile, scorer: AttemptScorer) -> Self {
        LayoutAgent { profile, scorer }
    }
}

impl ExtractionAgent for LayoutAgent {
    fn name(&self) -> &str {
        "layout"
    }

    fn extract(&self, doc: &RawDocument, period: Period) -> ExtractionAttempt {
        let parser = match RecordParser::new(&self.profile) {
            Ok(p) => p,
            Err(e) => return ExtractionAttempt::failed(self.name(), &format!("profile error: {:#}", e)),
        };
        let outcome = parser.parse_document_as(doc, period);
        let confidence = self.scorer.score(
            &outcome.records,
            outcome.expected,
            self.profile.plausibility.as_ref(),
        );

        ExtractionAttempt {
            agent: self.name().to_string(),
            strategy: outcome.strategy,
            diagnostic: format!(
                "{} records of {} expected, {} page failures",
                outcome.records.len(),
                outcome.expected,
                outcome.page_failures.len()
            ),
            records: outcome.records,
            expected: outcome.expected,
            confidence,
            success: self.scorer.is_success(confidence),
            page_failures: outcome.page_failures,
        }
    }
}

/// Header-driven sheet reader; only looks at grid pages
pub struct TabularAgent {
    profile: SourceProfile,
    scorer: AttemptScorer,
}

impl TabularAgent {
    pub fn new(profile: SourceProfile, scorer: AttemptScorer) -> Self {
        // Sheets carry their own categories, page bindings don't apply
        let mut profile = profile;
        profile.pages.clear();
        TabularAgent { profile, scorer }
    }
}

impl ExtractionAgent for TabularAgent {
    fn name(&self) -> &str {
        "tabular"
    }

    fn extract(&self, doc: &RawDocument, period: Period) -> ExtractionAttempt {
        let sheets: Vec<_> = doc
            .pages
            .iter()
            .filter(|p| matches!(p.content, PageContent::Grid(_)))
            .cloned()
            .collect();
        if sheets.is_empty() {
            return ExtractionAttempt::failed(self.name(), "no tabular sheets in document");
        }

        let parser = match RecordParser::with_layout(&self.profile, LayoutKind::Tabular) {
            Ok(p) => p,
            Err(e) => return ExtractionAttempt::failed(self.name(), &format!("profile error: {:#}", e)),
        };
        let sheet_doc = RawDocument::from_pages(&doc.source, period, &doc.origin, sheets);
        let outcome = parser.parse_document_as(&sheet_doc, period);
        let confidence = self.scorer.score(
            &outcome.records,
            outcome.expected,
            self.profile.plausibility.as_ref(),
        );

        ExtractionAttempt {
            agent: self.name().to_string(),
            strategy: outcome.strategy,
            diagnostic: format!(
                "{} records from {} data rows",
                outcome.records.len(),
                outcome.expected
            ),
            records: outcome.records,
            expected: outcome.expected,
            confidence,
            success: self.scorer.is_success(confidence),
            page_failures: outcome.page_failures,
        }
    }
}

/// Stand-in for an external extractor that is not wired up; always fails
pub struct UnavailableAgent {
    name: String,
    reason: String,
}

impl UnavailableAgent {
    pub fn new(name: &str, reason: &str) -> Self {
        UnavailableAgent {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ExtractionAgent for UnavailableAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self, _doc: &RawDocument, _period: Period) -> ExtractionAttempt {
        ExtractionAttempt::failed(&self.name, &self.reason)
    }
}

// ============================================================================
// CREW
// ============================================================================

#[derive(Debug, Clone)]
pub struct CrewResult {
    pub signature: String,
    /// Attempts in invocation order
    pub attempts: Vec<ExtractionAttempt>,
    /// Index into `attempts`
    pub winner: Option<usize>,
    pub recommended: Option<String>,
}

impl CrewResult {
    pub fn winner(&self) -> Option<&ExtractionAttempt> {
        self.winner.and_then(|i| self.attempts.get(i))
    }

    pub fn into_winner(self) -> Option<ExtractionAttempt> {
        let winner = self.winner?;
        self.attempts.into_iter().nth(winner)
    }

    pub fn is_all_failed(&self) -> bool {
        self.winner.is_none()
    }

    pub fn invoked(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.agent.as_str()).collect()
    }

    /// One line per attempt, for error messages
    pub fn diagnostic(&self) -> String {
        self.attempts
            .iter()
            .map(|a| format!("{} ({:.2}): {}", a.agent, a.confidence, a.diagnostic))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct AgentCrew {
    agents: Vec<Box<dyn ExtractionAgent>>,
    config: ArbiterConfig,
}

impl AgentCrew {
    pub fn new(agents: Vec<Box<dyn ExtractionAgent>>, config: ArbiterConfig) -> Self {
        AgentCrew { agents, config }
    }

    /// layout → tabular → ocr placeholder
    pub fn standard(profile: &SourceProfile, arbiter: &ArbiterConfig, gate: &GatePolicy) -> Self {
        let scorer = AttemptScorer::new(arbiter, gate);
        AgentCrew::new(
            vec![
                Box::new(LayoutAgent::new(profile.clone(), scorer.clone())),
                Box::new(TabularAgent::new(profile.clone(), scorer)),
                Box::new(UnavailableAgent::new(
                    "ocr",
                    "OCR extraction is not configured for this installation",
                )),
            ],
            arbiter.clone(),
        )
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    /// Run agents in order and pick a winner. Every attempt lands in `memory`.
    pub fn run(&self, doc: &RawDocument, memory: &mut PatternMemory) -> CrewResult {
        let signature = doc.signature();
        let recommended = memory.recommend(&signature);
        if let Some(agent) = &recommended {
            debug!(agent = agent.as_str(), "pattern memory recommendation");
        }

        let mut attempts: Vec<ExtractionAttempt> = Vec::new();
        for agent in &self.agents {
            // The agent's own success flag stands; only the confidence is clamped
            let mut attempt = agent.extract(doc, doc.period);
            attempt.confidence = clamp_confidence(attempt.confidence);

            info!(
                agent = agent.name(),
                confidence = attempt.confidence,
                success = attempt.success,
                records = attempt.records.len(),
                "extraction attempt"
            );

            memory.record(PatternEntry {
                agent: attempt.agent.clone(),
                signature: signature.clone(),
                source: doc.source.clone(),
                success: attempt.success,
                confidence: attempt.confidence,
                records: attempt.records.len(),
                timestamp: Utc::now(),
            });

            let early_exit = attempt.success && attempt.confidence >= self.config.early_exit;
            attempts.push(attempt);
            if early_exit {
                debug!(agent = agent.name(), "early exit");
                break;
            }
        }

        let winner = attempts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.success)
            .max_by(|(_, a), (_, b)| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i);

        if winner.is_none() {
            warn!(source = doc.source.as_str(), origin = doc.origin.as_str(), "all extraction agents failed");
        }

        CrewResult {
            signature,
            attempts,
            winner,
            recommended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Page;
    use crate::profiles::creb_city;
    use crate::records::{Measure, ValueType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedAgent {
        name: String,
        confidence: f64,
        success: bool,
        calls: Arc<AtomicUsize>,
    }

    impl ExtractionAgent for FixedAgent {
        fn name(&self) -> &str {
            &self.name
        }

        fn extract(&self, doc: &RawDocument, period: Period) -> ExtractionAttempt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut record = CandidateRecord::new(period, "Total", &doc.origin);
            record.push_measure(Measure::new("sales", 1.0, "count", ValueType::Absolute));
            ExtractionAttempt {
                agent: self.name.clone(),
                strategy: "fixed".to_string(),
                records: vec![record],
                expected: 1,
                confidence: self.confidence,
                success: self.success,
                diagnostic: String::new(),
                page_failures: Vec::new(),
            }
        }
    }

    fn fixed(name: &str, confidence: f64, success: bool) -> (Box<dyn ExtractionAgent>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let agent = FixedAgent {
            name: name.to_string(),
            confidence,
            success,
            calls: calls.clone(),
        };
        (Box::new(agent), calls)
    }

    fn doc() -> RawDocument {
        RawDocument::from_pages(
            "creb_city",
            Period::new(2025, 5).unwrap(),
            "05_2025_Calgary.txt",
            vec![Page::text(1, "nothing useful")],
        )
    }

    fn record_with_price(price: f64, confidence: f64) -> CandidateRecord {
        let mut r = CandidateRecord::new(Period::new(2025, 1).unwrap(), "Total", "x");
        r.push_measure(
            Measure::new("benchmark_price", price, "dollars", ValueType::Absolute)
                .with_confidence(confidence),
        );
        r
    }

    #[test]
    fn test_early_exit_skips_remaining_agents() {
        let (a, a_calls) = fixed("first", 0.3, false);
        let (b, b_calls) = fixed("second", 0.95, true);
        let (c, c_calls) = fixed("third", 0.6, true);
        let crew = AgentCrew::new(vec![a, b, c], ArbiterConfig::default());
        let mut memory = PatternMemory::in_memory(50);

        let result = crew.run(&doc(), &mut memory);

        assert_eq!(result.winner().unwrap().agent, "second");
        assert_eq!(result.invoked(), vec!["first", "second"]);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert!(!result.attempts[0].success);
        assert_eq!(memory.entries().count(), 2);
    }

    #[test]
    fn test_best_success_without_early_exit() {
        let (a, _) = fixed("a", 0.75, true);
        let (b, _) = fixed("b", 0.85, true);
        let (c, _) = fixed("c", 0.72, true);
        let crew = AgentCrew::new(vec![a, b, c], ArbiterConfig::default());
        let result = crew.run(&doc(), &mut PatternMemory::in_memory(50));

        assert_eq!(result.invoked().len(), 3);
        assert_eq!(result.winner().unwrap().agent, "b");
    }

    #[test]
    fn test_low_confidence_success_still_wins() {
        let (a, _) = fixed("first", 0.3, false);
        let (b, _) = fixed("second", 0.6, true);
        let crew = AgentCrew::new(vec![a, b], ArbiterConfig::default());
        let result = crew.run(&doc(), &mut PatternMemory::in_memory(50));

        assert!(!result.is_all_failed());
        assert_eq!(result.winner().unwrap().agent, "second");
        assert_eq!(result.winner().unwrap().confidence, 0.6);
        assert_eq!(result.invoked(), vec!["first", "second"]);
    }

    #[test]
    fn test_reported_failure_never_wins() {
        let (a, a_calls) = fixed("says_fail", 0.95, false);
        let (b, b_calls) = fixed("says_ok", 0.8, true);
        let crew = AgentCrew::new(vec![a, b], ArbiterConfig::default());
        let mut memory = PatternMemory::in_memory(50);
        let result = crew.run(&doc(), &mut memory);

        // A failed attempt at high confidence doesn't trigger early exit
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.winner().unwrap().agent, "says_ok");
        assert!(!result.attempts[0].success);
    }

    #[test]
    fn test_all_failed() {
        let (a, _) = fixed("a", 0.2, false);
        let crew = AgentCrew::new(
            vec![a, Box::new(UnavailableAgent::new("ocr", "not configured"))],
            ArbiterConfig::default(),
        );
        let result = crew.run(&doc(), &mut PatternMemory::in_memory(50));
        assert!(result.is_all_failed());
        assert!(result.diagnostic().contains("not configured"));
        assert!(result.into_winner().is_none());
    }

    #[test]
    fn test_standard_crew_order() {
        let crew = AgentCrew::standard(&creb_city(), &ArbiterConfig::default(), &GatePolicy::default());
        assert_eq!(crew.agent_names(), vec!["layout", "tabular", "ocr"]);
    }

    #[test]
    fn test_score_is_coverage_times_mean() {
        let scorer = AttemptScorer::new(&ArbiterConfig::default(), &GatePolicy::default());
        let records = vec![record_with_price(50_000.0, 1.0), record_with_price(50_000.0, 0.8)];
        let score = scorer.score(&records, 4, None);
        assert!((score - 0.45).abs() < 1e-9);
        assert_eq!(scorer.score(&[], 4, None), 0.0);
        assert_eq!(scorer.score(&records, 0, None), 0.0);
    }

    #[test]
    fn test_boost_cannot_cross_auto_approve() {
        let scorer = AttemptScorer::new(&ArbiterConfig::default(), &GatePolicy::default());
        let check = PlausibilityCheck {
            metric: "benchmark_price".to_string(),
            min: 200_000.0,
            max: 1_500_000.0,
        };

        // base 0.85 + 0.1 would reach 0.95
        let records = vec![record_with_price(580_000.0, 0.85)];
        let boosted = scorer.score(&records, 1, Some(&check));
        assert!(boosted < 0.90);
        assert!(boosted > 0.85);

        // base 0.70 + 0.1 is well below the line
        let records = vec![record_with_price(580_000.0, 0.70)];
        assert!((scorer.score(&records, 1, Some(&check)) - 0.80).abs() < 1e-9);

        // already above: boost allowed, capped at 1.0
        let records = vec![record_with_price(580_000.0, 0.95)];
        assert_eq!(scorer.score(&records, 1, Some(&check)), 1.0);

        // implausible mean: no boost
        let records = vec![record_with_price(90_000.0, 0.70)];
        assert!((scorer.score(&records, 1, Some(&check)) - 0.70).abs() < 1e-9);
    }

    #[test]
    fn test_tabular_agent_without_sheets_fails() {
        let scorer = AttemptScorer::new(&ArbiterConfig::default(), &GatePolicy::default());
        let agent = TabularAgent::new(creb_city(), scorer);
        let attempt = agent.extract(&doc(), doc().period);
        assert_eq!(attempt.confidence, 0.0);
        assert!(!attempt.success);
        assert!(attempt.diagnostic.contains("no tabular sheets"));
    }

    #[test]
    fn test_scorer_success_threshold() {
        let scorer = AttemptScorer::new(&ArbiterConfig::default(), &GatePolicy::default());
        assert!(scorer.is_success(0.7));
        assert!(scorer.is_success(0.85));
        assert!(!scorer.is_success(0.69));
    }
}
