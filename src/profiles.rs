// 🗂️ Source Profiles - extraction dictionaries as data
// Label patterns, units, plausible ranges, required metrics, page bindings.
// Built-in defaults ship with the crate; a TOML file can replace them by name.

use crate::error::IntakeError;
use crate::normalizer::{MetricSpec, PercentScaling, RescaleRule};
use crate::records::ValueType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// PROFILE TYPES
// ============================================================================

/// Known document layouts, one parser variant each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Year header lines followed by one line per metric, one column per month
    MonthlySeries,
    /// Category marker lines followed by rows of `<entity> <positional values>`
    EntityTable,
    /// Spreadsheet with period columns and one row per indicator
    IndicatorGrid,
    /// Header row naming date, category and metric columns
    Tabular,
}

/// Page number → category of the records found on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageBinding {
    pub page: usize,
    pub category: String,
}

/// A digit-free line matching `pattern` switches the current category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMarker {
    pub pattern: String,
    pub category: String,
}

/// Mean of `metric` across records must sit inside [min, max]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlausibilityCheck {
    pub metric: String,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub name: String,
    pub layout: LayoutKind,
    pub metrics: Vec<MetricSpec>,

    /// A record missing any of these is dropped
    pub required_metrics: Vec<String>,

    /// Used when a page gives no header to count from
    #[serde(default = "default_expected_per_page")]
    pub expected_per_page: usize,

    /// Empty means every page, with categories taken from markers
    #[serde(default)]
    pub pages: Vec<PageBinding>,

    #[serde(default)]
    pub category_markers: Vec<CategoryMarker>,

    #[serde(default = "default_category")]
    pub default_category: String,

    /// Column name for sub-entities (e.g. district)
    #[serde(default)]
    pub entity_column: Option<String>,

    #[serde(default)]
    pub entities: Vec<String>,

    #[serde(default = "default_date_column")]
    pub date_column: String,

    #[serde(default = "default_category_column")]
    pub category_column: String,

    /// Row label that attaches a yoy_change measure to the indicator above it
    #[serde(default = "default_yoy_label")]
    pub yoy_label: String,

    #[serde(default)]
    pub plausibility: Option<PlausibilityCheck>,
}

fn default_expected_per_page() -> usize {
    12
}

fn default_category() -> String {
    "Total".to_string()
}

fn default_date_column() -> String {
    "date".to_string()
}

fn default_category_column() -> String {
    "category".to_string()
}

fn default_yoy_label() -> String {
    r"(?i)(year-over-year|y/y|yoy).*change".to_string()
}

impl SourceProfile {
    pub fn new(name: &str, layout: LayoutKind, metrics: Vec<MetricSpec>, required: &[&str]) -> Self {
        SourceProfile {
            name: name.to_string(),
            layout,
            metrics,
            required_metrics: required.iter().map(|s| s.to_string()).collect(),
            expected_per_page: default_expected_per_page(),
            pages: Vec::new(),
            category_markers: Vec::new(),
            default_category: default_category(),
            entity_column: None,
            entities: Vec::new(),
            date_column: default_date_column(),
            category_column: default_category_column(),
            yoy_label: default_yoy_label(),
            plausibility: None,
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSpec> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Category bound to a page, if the profile binds pages
    pub fn category_for_page(&self, page: usize) -> Option<&str> {
        self.pages
            .iter()
            .find(|b| b.page == page)
            .map(|b| b.category.as_str())
    }

    fn with_pages(mut self, bindings: &[(usize, &str)]) -> Self {
        self.pages = bindings
            .iter()
            .map(|(page, category)| PageBinding {
                page: *page,
                category: category.to_string(),
            })
            .collect();
        self
    }

    fn with_markers(mut self, markers: &[(&str, &str)]) -> Self {
        self.category_markers = markers
            .iter()
            .map(|(pattern, category)| CategoryMarker {
                pattern: pattern.to_string(),
                category: category.to_string(),
            })
            .collect();
        self
    }
}

// ============================================================================
// BUILT-IN PROFILES
// ============================================================================

fn price(name: &str, label: &str) -> MetricSpec {
    MetricSpec::new(name, label, "dollars", ValueType::Absolute)
        .with_range(100_000.0, 3_000_000.0)
        .with_rescale(RescaleRule::thousands_price())
        .with_split_width(6)
}

fn count(name: &str, label: &str) -> MetricSpec {
    MetricSpec::new(name, label, "count", ValueType::Absolute).with_range(0.0, 50_000.0)
}

/// Monthly city statistics: one page per property type
pub fn creb_city() -> SourceProfile {
    let metrics = vec![
        count("sales", r"(?i)^\s*sales\b"),
        count("new_listings", r"(?i)^\s*new listings\b"),
        count("inventory", r"(?i)^\s*inventory\b"),
        MetricSpec::new("days_on_market", r"(?i)^\s*days on market\b", "days", ValueType::Absolute)
            .with_range(0.0, 365.0),
        price("benchmark_price", r"(?i)^\s*benchmark price\b"),
        price("median_price", r"(?i)^\s*median price\b"),
        price("average_price", r"(?i)^\s*average price\b"),
    ];

    let mut profile = SourceProfile::new(
        "creb_city",
        LayoutKind::MonthlySeries,
        metrics,
        &["sales", "new_listings", "benchmark_price"],
    )
    .with_pages(&[
        (11, "Total"),
        (13, "Detached"),
        (15, "Semi_Detached"),
        (17, "Apartment"),
        (19, "Row"),
    ]);
    profile.plausibility = Some(PlausibilityCheck {
        metric: "benchmark_price".to_string(),
        min: 200_000.0,
        max: 1_500_000.0,
    });
    profile
}

/// District table: property-type sections, one row per district
pub fn creb_district() -> SourceProfile {
    let metrics = vec![
        count("new_sales", r"(?i)new sales"),
        count("new_listings", r"(?i)new listings"),
        MetricSpec::new("sales_to_listings_ratio", r"(?i)sales to new listings", "percentage", ValueType::Rate)
            .with_range(0.0, 400.0),
        count("inventory", r"(?i)inventory"),
        MetricSpec::new("months_supply", r"(?i)months of supply", "months", ValueType::Absolute)
            .with_range(0.0, 36.0),
        MetricSpec::new("benchmark_price", r"(?i)benchmark price", "dollars", ValueType::Absolute)
            .with_range(100_000.0, 3_000_000.0)
            .with_rescale(RescaleRule::thousands_price()),
        MetricSpec::new("yoy_price_change", r"(?i)year-over-year", "percentage", ValueType::YoyChange)
            .with_range(-50.0, 50.0),
        MetricSpec::new("mom_price_change", r"(?i)month-over-month", "percentage", ValueType::MomChange)
            .with_range(-25.0, 25.0),
    ];

    let mut profile = SourceProfile::new(
        "creb_district",
        LayoutKind::EntityTable,
        metrics,
        &["new_sales", "benchmark_price"],
    )
    .with_pages(&[(7, "Total")])
    .with_markers(&[
        (r"(?i)^\s*total\b", "Total"),
        (r"(?i)^\s*semi[- _]?detached\b", "Semi_Detached"),
        (r"(?i)^\s*detached\b", "Detached"),
        (r"(?i)^\s*apartment\b", "Apartment"),
        (r"(?i)^\s*row\b", "Row"),
    ]);
    profile.entity_column = Some("district".to_string());
    profile.entities = [
        "City Centre",
        "North East",
        "North West",
        "South East",
        "South West",
        "North",
        "South",
        "West",
        "East",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    profile.expected_per_page = profile.entities.len();
    profile
}

/// Economic indicator spreadsheets (labour force, prices, population)
pub fn economic() -> SourceProfile {
    let rate = |name: &str, label: &str, group: &str, max: f64| {
        MetricSpec::new(name, label, "percentage", ValueType::Rate)
            .with_range(0.0, max)
            .with_scaling(PercentScaling::FractionToPercent)
            .with_group(group)
    };
    let absolute = |name: &str, label: &str, unit: &str, group: &str| {
        MetricSpec::new(name, label, unit, ValueType::Absolute).with_group(group)
    };

    let metrics = vec![
        rate("unemployment_rate", r"(?i)unemployment rate", "labour", 30.0),
        rate("participation_rate", r"(?i)participation rate", "labour", 100.0),
        rate("employment_rate", r"(?i)employment rate", "labour", 100.0),
        absolute("employment", r"(?i)^\s*employment\b", "persons_thousands", "labour"),
        absolute("average_weekly_earnings", r"(?i)average weekly earnings", "dollars", "labour"),
        absolute("cpi", r"(?i)(consumer price index|\bcpi\b)", "index", "prices").with_range(50.0, 300.0),
        rate("inflation_rate", r"(?i)inflation", "prices", 25.0),
        absolute("population", r"(?i)population", "persons", "demographics"),
        absolute("housing_starts", r"(?i)housing starts", "units", "housing"),
    ];

    SourceProfile::new("economic", LayoutKind::IndicatorGrid, metrics, &["value"])
}

// ============================================================================
// PROFILE SET
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<SourceProfile>,
}

#[derive(Debug, Clone)]
pub struct ProfileSet {
    profiles: BTreeMap<String, SourceProfile>,
}

impl ProfileSet {
    pub fn builtin() -> Self {
        let mut profiles = BTreeMap::new();
        for profile in [creb_city(), creb_district(), economic()] {
            profiles.insert(profile.name.clone(), profile);
        }
        ProfileSet { profiles }
    }

    /// Built-ins, then profiles from `path` replace or extend them by name
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut set = ProfileSet::builtin();
        if let Some(path) = path {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read profiles file {}", path.display()))?;
            let file: ProfileFile = toml::from_str(&content)
                .with_context(|| format!("Failed to parse profiles file {}", path.display()))?;
            for profile in file.profiles {
                set.insert(profile);
            }
        }
        Ok(set)
    }

    pub fn insert(&mut self, profile: SourceProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Result<&SourceProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| IntakeError::UnknownSource(name.to_string()).into())
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles() {
        let set = ProfileSet::builtin();
        assert_eq!(set.names(), vec!["creb_city", "creb_district", "economic"]);

        let city = set.get("creb_city").unwrap();
        assert_eq!(city.layout, LayoutKind::MonthlySeries);
        assert_eq!(city.category_for_page(13), Some("Detached"));
        assert_eq!(city.category_for_page(12), None);
        assert!(city.metric("benchmark_price").unwrap().rescale.is_some());
    }

    #[test]
    fn test_unknown_source() {
        let set = ProfileSet::builtin();
        let err = set.get("nowhere").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IntakeError>(),
            Some(IntakeError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_profile_file_overrides_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.toml");
        fs::write(
            &path,
            r#"
            [[profiles]]
            name = "economic"
            layout = "tabular"
            required_metrics = ["value"]

            [[profiles.metrics]]
            name = "value"
            label = "(?i)^value$"
            unit = "index"
            value_type = "absolute"
            expected_range = [0.0, 500.0]
            "#,
        )
        .unwrap();

        let set = ProfileSet::load(Some(&path)).unwrap();
        let economic = set.get("economic").unwrap();
        assert_eq!(economic.layout, LayoutKind::Tabular);
        assert_eq!(economic.metrics[0].expected_range, Some((0.0, 500.0)));
        assert_eq!(economic.default_category, "Total");
        // Other built-ins survive
        assert!(set.get("creb_city").is_ok());
    }
}
