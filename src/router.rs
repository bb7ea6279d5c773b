// 🧭 Schema Router - which canonical table does a batch belong to?
// Column names are normalized, then every record family is scored on coverage

use crate::config::RouterConfig;
use crate::error::IntakeError;
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::debug;

const REQUIRED_WEIGHT: f64 = 0.7;
const OPTIONAL_WEIGHT: f64 = 0.3;

/// Columns the loader manages itself; they never count toward a family
pub const BOOKKEEPING_COLUMNS: &[&str] = &[
    "confidence",
    "origin",
    "source_ref",
    "ingested_at",
    "validation_status",
    "version",
];

// ============================================================================
// RECORD FAMILIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Real,
    Integer,
}

impl FieldType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Real => "REAL",
            FieldType::Integer => "INTEGER",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

fn field(name: &str, field_type: FieldType) -> FieldDef {
    FieldDef {
        name: name.to_string(),
        field_type,
    }
}

/// A canonical table and the fields that identify a batch as belonging to it
#[derive(Debug, Clone)]
pub struct RecordFamily {
    pub name: String,
    pub table: String,
    pub required: Vec<FieldDef>,
    pub optional: Vec<FieldDef>,
    pub natural_key: Vec<String>,
}

impl RecordFamily {
    /// Required then optional fields, in declaration order
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.required.iter().chain(self.optional.iter())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields().find(|f| f.name == name)
    }
}

/// Housing (city-wide and per-district) and economic indicator families
pub fn builtin_families() -> Vec<RecordFamily> {
    use FieldType::*;

    vec![
        RecordFamily {
            name: "city".to_string(),
            table: "housing_city_monthly".to_string(),
            required: vec![
                field("date", Text),
                field("category", Text),
                field("sales", Integer),
                field("benchmark_price", Real),
            ],
            optional: vec![
                field("new_listings", Integer),
                field("inventory", Integer),
                field("days_on_market", Real),
                field("median_price", Real),
                field("average_price", Real),
            ],
            natural_key: vec!["date".to_string(), "category".to_string()],
        },
        RecordFamily {
            name: "district".to_string(),
            table: "housing_district_monthly".to_string(),
            required: vec![
                field("date", Text),
                field("category", Text),
                field("district", Text),
                field("benchmark_price", Real),
            ],
            optional: vec![
                field("new_sales", Integer),
                field("new_listings", Integer),
                field("sales_to_listings_ratio", Real),
                field("inventory", Integer),
                field("months_supply", Real),
                field("yoy_price_change", Real),
                field("mom_price_change", Real),
            ],
            natural_key: vec![
                "date".to_string(),
                "category".to_string(),
                "district".to_string(),
            ],
        },
        RecordFamily {
            name: "economic".to_string(),
            table: "economic_indicators_monthly".to_string(),
            required: vec![
                field("date", Text),
                field("category", Text),
                field("value", Real),
            ],
            optional: vec![
                field("indicator_name", Text),
                field("unit", Text),
                field("value_type", Text),
                field("yoy_change", Real),
                field("mom_change", Real),
                field("sector", Text),
            ],
            natural_key: vec!["date".to_string(), "category".to_string()],
        },
    ]
}

// ============================================================================
// SCORING
// ============================================================================

#[derive(Debug, Clone)]
pub struct FamilyScore {
    pub family: String,
    pub score: f64,
    pub required_complete: bool,
    pub missing_required: Vec<String>,
    pub unrecognized: Vec<String>,
}

/// Chosen family plus everything needed to project payload rows onto it
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub family: RecordFamily,
    /// Canonical column name for each payload column, same order as the header
    pub columns: Vec<String>,
    pub score: FamilyScore,
}

/// One payload row split into core fields, bookkeeping and leftovers.
/// Empty cells are treated as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectedRow {
    pub fields: BTreeMap<String, String>,
    pub bookkeeping: BTreeMap<String, String>,
    pub extra: BTreeMap<String, String>,
}

impl RouteDecision {
    pub fn project(&self, row: &[String]) -> ProjectedRow {
        let mut projected = ProjectedRow::default();
        for (column, cell) in self.columns.iter().zip(row.iter()) {
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            let target = if self.family.field(column).is_some() {
                &mut projected.fields
            } else if BOOKKEEPING_COLUMNS.contains(&column.as_str()) {
                &mut projected.bookkeeping
            } else {
                &mut projected.extra
            };
            target.insert(column.clone(), cell.to_string());
        }
        projected
    }
}

pub struct SchemaRouter {
    families: Vec<RecordFamily>,
    config: RouterConfig,
}

impl SchemaRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self::with_families(builtin_families(), config)
    }

    pub fn with_families(families: Vec<RecordFamily>, config: &RouterConfig) -> Self {
        SchemaRouter {
            families,
            config: config.clone(),
        }
    }

    pub fn families(&self) -> &[RecordFamily] {
        &self.families
    }

    pub fn family(&self, name: &str) -> Option<&RecordFamily> {
        self.families.iter().find(|f| f.name == name)
    }

    /// Lower-case, then rename. Each column is looked up once against its
    /// original name, so renames never chain.
    pub fn canonical_columns(&self, source: &str, header: &[String]) -> Vec<String> {
        let overrides = self.config.source_overrides.get(source);
        header
            .iter()
            .map(|column| {
                let lower = column.trim().to_lowercase();
                overrides
                    .and_then(|o| o.get(&lower))
                    .or_else(|| self.config.rename.get(&lower))
                    .cloned()
                    .unwrap_or(lower)
            })
            .collect()
    }

    pub fn score(&self, family: &RecordFamily, columns: &[String]) -> FamilyScore {
        let has = |name: &str| columns.iter().any(|c| c == name);

        let missing_required: Vec<String> = family
            .required
            .iter()
            .filter(|f| !has(f.name.as_str()))
            .map(|f| f.name.clone())
            .collect();
        let required_fraction = if family.required.is_empty() {
            1.0
        } else {
            (family.required.len() - missing_required.len()) as f64 / family.required.len() as f64
        };
        let optional_fraction = if family.optional.is_empty() {
            0.0
        } else {
            family.optional.iter().filter(|f| has(f.name.as_str())).count() as f64
                / family.optional.len() as f64
        };

        let unrecognized = columns
            .iter()
            .filter(|c| family.field(c).is_none() && !BOOKKEEPING_COLUMNS.contains(&c.as_str()))
            .cloned()
            .collect();

        FamilyScore {
            family: family.name.clone(),
            score: REQUIRED_WEIGHT * required_fraction + OPTIONAL_WEIGHT * optional_fraction,
            required_complete: missing_required.is_empty(),
            missing_required,
            unrecognized,
        }
    }

    /// Pick the family for a payload header. Complete required coverage
    /// beats score; ties go to the fewest unrecognized columns.
    pub fn route(&self, batch_id: &str, source: &str, header: &[String]) -> Result<RouteDecision> {
        let columns = self.canonical_columns(source, header);

        let mut candidates: Vec<(usize, FamilyScore)> = self
            .families
            .iter()
            .enumerate()
            .map(|(i, family)| (i, self.score(family, &columns)))
            .inspect(|(_, s)| debug!(family = %s.family, score = s.score, "family score"))
            .filter(|(_, s)| s.score >= self.config.min_score)
            .collect();

        candidates.sort_by(|(_, a), (_, b)| {
            b.required_complete
                .cmp(&a.required_complete)
                .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.unrecognized.len().cmp(&b.unrecognized.len()))
        });

        match candidates.into_iter().next() {
            Some((index, score)) => Ok(RouteDecision {
                family: self.families[index].clone(),
                columns,
                score,
            }),
            None => Err(IntakeError::SchemaInference {
                batch_id: batch_id.to_string(),
                detail: format!(
                    "no family reached score {:.2} for columns [{}]",
                    self.config.min_score,
                    columns.join(", ")
                ),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_city_row_routes_to_city() {
        let router = SchemaRouter::new(&RouterConfig::default());
        let decision = router
            .route(
                "b1",
                "creb_city",
                &header(&["date", "category", "sales", "benchmark_price", "confidence", "origin"]),
            )
            .unwrap();
        assert_eq!(decision.family.name, "city");
        assert!(decision.score.required_complete);
        assert!(decision.score.unrecognized.is_empty());
    }

    #[test]
    fn test_district_beats_partial_city() {
        let router = SchemaRouter::new(&RouterConfig::default());
        let decision = router
            .route(
                "b2",
                "creb_district",
                &header(&[
                    "date",
                    "category",
                    "district",
                    "new_sales",
                    "new_listings",
                    "inventory",
                    "benchmark_price",
                ]),
            )
            .unwrap();
        assert_eq!(decision.family.name, "district");
    }

    #[test]
    fn test_rename_map_and_case() {
        let router = SchemaRouter::new(&RouterConfig::default());
        let columns = router.canonical_columns(
            "any",
            &header(&["Month", "PropertyType", "Sales", "BenchmarkPrice", "Confidence_Score"]),
        );
        assert_eq!(
            columns,
            header(&["date", "category", "sales", "benchmark_price", "confidence"])
        );
    }

    #[test]
    fn test_source_override_wins() {
        let mut config = RouterConfig::default();
        config.source_overrides.insert(
            "open_data".to_string(),
            [("period".to_string(), "reference_period".to_string())]
                .into_iter()
                .collect(),
        );
        let router = SchemaRouter::new(&config);

        assert_eq!(router.canonical_columns("open_data", &header(&["Period"])), header(&["reference_period"]));
        // Other sources keep the default rename
        assert_eq!(router.canonical_columns("creb_city", &header(&["Period"])), header(&["date"]));
    }

    #[test]
    fn test_renames_do_not_chain() {
        let mut config = RouterConfig::default();
        config.rename.insert("a".to_string(), "b".to_string());
        config.rename.insert("b".to_string(), "c".to_string());
        let router = SchemaRouter::new(&config);
        assert_eq!(router.canonical_columns("x", &header(&["a", "b"])), header(&["b", "c"]));
    }

    #[test]
    fn test_unknown_columns_fail_inference() {
        let router = SchemaRouter::new(&RouterConfig::default());
        let err = router
            .route("b3", "mystery", &header(&["foo", "bar", "date"]))
            .unwrap_err();
        let typed = err.downcast_ref::<IntakeError>();
        assert!(matches!(typed, Some(IntakeError::SchemaInference { batch_id, .. }) if batch_id == "b3"));
        assert!(err.to_string().contains("could not determine target schema"));
    }

    #[test]
    fn test_projection_keeps_extra_columns() {
        let router = SchemaRouter::new(&RouterConfig::default());
        let decision = router
            .route(
                "b4",
                "open_data",
                &header(&["date", "category", "value", "unit", "region_code", "confidence"]),
            )
            .unwrap();
        assert_eq!(decision.family.name, "economic");
        assert_eq!(decision.score.unrecognized, vec!["region_code".to_string()]);

        let row = decision.project(&header(&["2025-01-01", "cpi", "158.2", "index", "AB", "0.95"]));
        assert_eq!(row.fields["value"], "158.2");
        assert_eq!(row.bookkeeping["confidence"], "0.95");
        assert_eq!(row.extra["region_code"], "AB");
        assert!(!row.fields.contains_key("region_code"));
    }
}
