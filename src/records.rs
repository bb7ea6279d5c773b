// 📦 Candidate Records - typed observations before they reach the store
// Ephemeral: produced by parsers, carried through the gate, merged by the loader

use crate::document::Period;
use crate::normalizer::ValueFlag;
use serde::{Deserialize, Serialize};

// ============================================================================
// VALUE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Absolute,
    Rate,
    YoyChange,
    MomChange,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Absolute => "absolute",
            ValueType::Rate => "rate",
            ValueType::YoyChange => "yoy_change",
            ValueType::MomChange => "mom_change",
        }
    }

    /// Rates and changes are the only value types that carry percentages
    pub fn is_relative(&self) -> bool {
        !matches!(self, ValueType::Absolute)
    }
}

// ============================================================================
// MEASURE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub value_type: ValueType,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<ValueFlag>,
}

impl Measure {
    pub fn new(name: &str, value: f64, unit: &str, value_type: ValueType) -> Self {
        Measure {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            value_type,
            confidence: 1.0,
            flags: Vec::new(),
        }
    }

    /// Builder pattern: set confidence (clamped to [0,1])
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    /// Builder pattern: attach normalizer flags
    pub fn with_flags(mut self, flags: Vec<ValueFlag>) -> Self {
        self.flags = flags;
        self
    }
}

// ============================================================================
// CANDIDATE RECORD
// ============================================================================

/// Sub-entity of a record (e.g. a district), stored under column `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub period: Period,
    pub category: String,
    pub entity: Option<EntityRef>,
    pub measures: Vec<Measure>,

    /// Source file and page the record came from
    pub origin: String,

    /// Optional grouping label (e.g. labour, prices)
    pub sector: Option<String>,

    /// Minimum of the measures' confidences; 0.0 without measures
    pub confidence: f64,
}

impl CandidateRecord {
    pub fn new(period: Period, category: &str, origin: &str) -> Self {
        CandidateRecord {
            period,
            category: category.to_string(),
            entity: None,
            measures: Vec::new(),
            origin: origin.to_string(),
            sector: None,
            confidence: 0.0,
        }
    }

    /// Builder pattern: add a sub-entity
    pub fn with_entity(mut self, kind: &str, name: &str) -> Self {
        self.entity = Some(EntityRef {
            kind: kind.to_string(),
            name: name.to_string(),
        });
        self
    }

    /// Builder pattern: add a sector label
    pub fn with_sector(mut self, sector: Option<&str>) -> Self {
        self.sector = sector.map(str::to_string);
        self
    }

    /// Add or replace a measure and recompute record confidence
    pub fn push_measure(&mut self, measure: Measure) {
        match self.measures.iter_mut().find(|m| m.name == measure.name) {
            Some(existing) => *existing = measure,
            None => self.measures.push(measure),
        }
        self.confidence = self
            .measures
            .iter()
            .map(|m| m.confidence)
            .fold(f64::INFINITY, f64::min);
        self.confidence = clamp_confidence(self.confidence);
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.name == name)
    }

    /// True when every required metric is present
    pub fn is_complete(&self, required: &[String]) -> bool {
        required.iter().all(|name| self.measure(name).is_some())
    }

    pub fn is_flagged(&self) -> bool {
        self.measures.iter().any(|m| !m.flags.is_empty())
    }

    /// Natural identity inside one batch: period, category, entity
    pub fn identity(&self) -> (Period, String, Option<String>) {
        (
            self.period,
            self.category.clone(),
            self.entity.as_ref().map(|e| e.name.clone()),
        )
    }
}

/// Confidence is always in [0,1]; NaN collapses to 0
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Mean of record confidences; 0.0 for an empty slice
pub fn aggregate_confidence(records: &[CandidateRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let total: f64 = records.iter().map(|r| r.confidence).sum();
    clamp_confidence(total / records.len() as f64)
}

// ============================================================================
// FLAT ROWS (batch payload)
// ============================================================================

/// Flatten records into a header + rows table.
/// Column order: date, category, entity kinds, measures (first appearance),
/// unit/value_type of a `value` measure, sector, confidence, origin.
pub fn records_to_rows(records: &[CandidateRecord]) -> (Vec<String>, Vec<Vec<String>>) {
    let mut entity_kinds: Vec<String> = Vec::new();
    let mut measure_names: Vec<String> = Vec::new();
    let mut has_value_measure = false;
    let mut has_sector = false;

    for record in records {
        if let Some(entity) = &record.entity {
            if !entity_kinds.contains(&entity.kind) {
                entity_kinds.push(entity.kind.clone());
            }
        }
        for measure in &record.measures {
            if !measure_names.contains(&measure.name) {
                measure_names.push(measure.name.clone());
            }
            has_value_measure |= measure.name == "value";
        }
        has_sector |= record.sector.is_some();
    }

    let mut header = vec!["date".to_string(), "category".to_string()];
    header.extend(entity_kinds.iter().cloned());
    header.extend(measure_names.iter().cloned());
    if has_value_measure {
        header.push("unit".to_string());
        header.push("value_type".to_string());
    }
    if has_sector {
        header.push("sector".to_string());
    }
    header.push("confidence".to_string());
    header.push("origin".to_string());

    let rows = records
        .iter()
        .map(|record| {
            let mut row = vec![record.period.date_string(), record.category.clone()];
            for kind in &entity_kinds {
                row.push(match &record.entity {
                    Some(e) if &e.kind == kind => e.name.clone(),
                    _ => String::new(),
                });
            }
            for name in &measure_names {
                row.push(
                    record
                        .measure(name)
                        .map(|m| format_value(m.value))
                        .unwrap_or_default(),
                );
            }
            if has_value_measure {
                let value = record.measure("value");
                row.push(value.map(|m| m.unit.clone()).unwrap_or_default());
                row.push(
                    value
                        .map(|m| m.value_type.as_str().to_string())
                        .unwrap_or_default(),
                );
            }
            if has_sector {
                row.push(record.sector.clone().unwrap_or_default());
            }
            row.push(format!("{:.4}", record.confidence));
            row.push(record.origin.clone());
            row
        })
        .collect();

    (header, rows)
}

/// Integers print without a fractional part
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
