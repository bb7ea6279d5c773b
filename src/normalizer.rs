// 🔢 Field-Value Normalizer - raw token → typed value with unit and value type
// Never errors: malformed input simply yields None

use crate::records::{clamp_confidence, ValueType};
use serde::{Deserialize, Serialize};

/// Confidence assigned when a value falls outside its plausible range
pub const OUT_OF_RANGE_CONFIDENCE: f64 = 0.6;

/// Confidence ceiling for values produced by a named repair heuristic
pub const REPAIRED_CONFIDENCE: f64 = 0.85;

// ============================================================================
// METRIC SPEC
// ============================================================================

/// How percentages written as fractions are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentScaling {
    /// Values are taken as written
    #[default]
    AsWritten,
    /// Values strictly inside (-1, 1) are fractions and get multiplied by 100
    FractionToPercent,
}

/// Named magnitude repair: values inside [min, max] are multiplied by factor.
/// Prices printed in thousands (567 → 567000) are the usual case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescaleRule {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub factor: f64,
}

impl RescaleRule {
    /// Prices between 400 and 700 are read as thousands of dollars
    pub fn thousands_price() -> Self {
        RescaleRule {
            name: "thousands_price".to_string(),
            min: 400.0,
            max: 700.0,
            factor: 1000.0,
        }
    }

    pub fn applies(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Canonical field name (e.g. benchmark_price)
    pub name: String,

    /// Regex matched against the line or row label
    pub label: String,

    pub unit: String,

    pub value_type: ValueType,

    /// Plausible (min, max); values outside keep reduced confidence
    #[serde(default)]
    pub expected_range: Option<(f64, f64)>,

    #[serde(default)]
    pub scaling: PercentScaling,

    #[serde(default)]
    pub rescale: Option<RescaleRule>,

    /// Digit count of a value split around a thousands separator ("5 67,300")
    #[serde(default)]
    pub split_width: Option<usize>,

    /// Grouping label carried onto records as their sector
    #[serde(default)]
    pub group: Option<String>,
}

impl MetricSpec {
    pub fn new(name: &str, label: &str, unit: &str, value_type: ValueType) -> Self {
        MetricSpec {
            name: name.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
            value_type,
            expected_range: None,
            scaling: PercentScaling::AsWritten,
            rescale: None,
            split_width: None,
            group: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.expected_range = Some((min, max));
        self
    }

    pub fn with_scaling(mut self, scaling: PercentScaling) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_rescale(mut self, rule: RescaleRule) -> Self {
        self.rescale = Some(rule);
        self
    }

    pub fn with_split_width(mut self, width: usize) -> Self {
        self.split_width = Some(width);
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }
}

// ============================================================================
// NORMALIZED VALUE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", content = "detail", rename_all = "snake_case")]
pub enum ValueFlag {
    OutOfRange,
    Rescaled(String),
    SplitThousands,
    PercentScaled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedValue {
    pub value: f64,
    pub confidence: f64,
    pub flags: Vec<ValueFlag>,
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Parse a raw numeric token: strips `$`, `,`, `%`, whitespace;
/// accepts a leading minus or parentheses for negatives.
/// `#N/A`, `-`, empty and non-numeric text give None.
pub fn parse_number(token: &str) -> Option<f64> {
    let trimmed = token.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed.eq_ignore_ascii_case("#n/a") {
        return None;
    }

    let (negative, body) = if trimmed.starts_with('(') && trimmed.ends_with(')') && trimmed.len() > 2 {
        (true, &trimmed[1..trimmed.len() - 1])
    } else {
        (false, trimmed)
    };

    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(*c, '$' | ',' | '%') && !c.is_whitespace())
        .collect();

    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    if !cleaned
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == '-' || c == '+')
    {
        return None;
    }

    let value = cleaned.parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Normalize one token against its metric spec
pub fn normalize(token: &str, spec: &MetricSpec) -> Option<NormalizedValue> {
    let mut value = parse_number(token)?;
    let mut confidence: f64 = 1.0;
    let mut flags = Vec::new();

    if spec.scaling == PercentScaling::FractionToPercent
        && spec.value_type.is_relative()
        && spec.unit == "percentage"
        && value > -1.0
        && value < 1.0
        && value != 0.0
    {
        value *= 100.0;
        flags.push(ValueFlag::PercentScaled);
    }

    if let Some(rule) = &spec.rescale {
        if rule.applies(value) {
            value *= rule.factor;
            confidence = confidence.min(REPAIRED_CONFIDENCE);
            flags.push(ValueFlag::Rescaled(rule.name.clone()));
        }
    }

    if let Some((min, max)) = spec.expected_range {
        if value < min || value > max {
            confidence = confidence.min(OUT_OF_RANGE_CONFIDENCE);
            flags.push(ValueFlag::OutOfRange);
        }
    }

    Some(NormalizedValue {
        value,
        confidence: clamp_confidence(confidence),
        flags,
    })
}

/// Re-join a value split around its thousands separator, e.g. ("5", "67,300") with
/// width 6 → "567300". Returns None unless the joined digits are exactly `width` long.
pub fn repair_split_thousands(head: &str, tail: &str, width: usize) -> Option<String> {
    let head = head.trim();
    let tail = tail.trim();

    if head.is_empty() || head.len() > 3 || !head.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let (lead, thousands) = tail.split_once(',')?;
    let well_formed = !lead.is_empty()
        && lead.len() <= 3
        && lead.chars().all(|c| c.is_ascii_digit())
        && thousands.len() == 3
        && thousands.chars().all(|c| c.is_ascii_digit());
    if !well_formed {
        return None;
    }

    let joined = format!("{}{}{}", head, lead, thousands);
    if joined.len() == width {
        Some(joined)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_spec() -> MetricSpec {
        MetricSpec::new("benchmark_price", "(?i)^benchmark price", "dollars", ValueType::Absolute)
            .with_range(100_000.0, 2_000_000.0)
            .with_rescale(RescaleRule::thousands_price())
            .with_split_width(6)
    }

    #[test]
    fn test_parse_number_variants() {
        assert_eq!(parse_number("$567,300"), Some(567300.0));
        assert_eq!(parse_number("4.5%"), Some(4.5));
        assert_eq!(parse_number("-2.1%"), Some(-2.1));
        assert_eq!(parse_number("(1,200)"), Some(-1200.0));
        assert_eq!(parse_number("#N/A"), None);
        assert_eq!(parse_number("-"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("Detached"), None);
        assert_eq!(parse_number("12abc"), None);
    }

    #[test]
    fn test_normalize_plain_value() {
        let v = normalize("567,300", &price_spec()).unwrap();
        assert_eq!(v.value, 567300.0);
        assert_eq!(v.confidence, 1.0);
        assert!(v.flags.is_empty());
    }

    #[test]
    fn test_rescale_rule_is_flagged() {
        let v = normalize("567", &price_spec()).unwrap();
        assert_eq!(v.value, 567000.0);
        assert_eq!(v.confidence, REPAIRED_CONFIDENCE);
        assert_eq!(v.flags, vec![ValueFlag::Rescaled("thousands_price".to_string())]);
    }

    #[test]
    fn test_out_of_range_kept_with_low_confidence() {
        let v = normalize("95,000", &price_spec()).unwrap();
        assert_eq!(v.value, 95000.0);
        assert_eq!(v.confidence, OUT_OF_RANGE_CONFIDENCE);
        assert!(v.flags.contains(&ValueFlag::OutOfRange));
    }

    #[test]
    fn test_fraction_to_percent() {
        let spec = MetricSpec::new("value", "(?i)unemployment rate", "percentage", ValueType::Rate)
            .with_scaling(PercentScaling::FractionToPercent);
        let v = normalize("0.071", &spec).unwrap();
        assert!((v.value - 7.1).abs() < 1e-9);
        assert!(v.flags.contains(&ValueFlag::PercentScaled));

        let as_written = normalize("7.1", &spec).unwrap();
        assert_eq!(as_written.value, 7.1);
    }

    #[test]
    fn test_absolute_never_percent_scaled() {
        let spec = MetricSpec::new("months_supply", "x", "months", ValueType::Absolute)
            .with_scaling(PercentScaling::FractionToPercent);
        assert_eq!(normalize("0.8", &spec).unwrap().value, 0.8);
    }

    #[test]
    fn test_malformed_tokens_are_none() {
        let spec = price_spec();
        for token in ["#N/A", "-", "", "n/a", "$", "--"] {
            assert!(normalize(token, &spec).is_none(), "token {:?}", token);
        }
    }

    #[test]
    fn test_repair_split_thousands() {
        assert_eq!(repair_split_thousands("5", "67,300", 6), Some("567300".to_string()));
        assert_eq!(repair_split_thousands("1", "250,000", 7), Some("1250000".to_string()));
        // Wrong width leaves the tokens alone
        assert_eq!(repair_split_thousands("5", "67,300", 7), None);
        assert_eq!(repair_split_thousands("5.1", "67,300", 6), None);
        assert_eq!(repair_split_thousands("5", "67300", 6), None);
    }
}
