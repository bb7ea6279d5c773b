// 🏗️ Layout-Tolerant Record Parser
// One page/sheet → candidate records, via an ordered token strategy chain
// and one PageLayout variant per known document layout

use crate::document::{Page, PageContent, Period, RawDocument};
use crate::normalizer::{
    normalize, parse_number, repair_split_thousands, MetricSpec, PercentScaling, ValueFlag,
    REPAIRED_CONFIDENCE,
};
use crate::profiles::{LayoutKind, SourceProfile};
use crate::records::{CandidateRecord, Measure, ValueType};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

// ============================================================================
// TOKEN STRATEGIES
// ============================================================================

/// Numeric token recovered from a line, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    /// Produced by re-joining a split thousands group
    pub repaired: bool,
}

impl Token {
    pub fn clean(text: &str) -> Self {
        Token {
            text: text.to_string(),
            repaired: false,
        }
    }

    pub fn repaired(text: String) -> Self {
        Token {
            text,
            repaired: true,
        }
    }
}

/// One way of cutting a line of values into positional tokens.
/// `None` marks a position that was present but unreadable.
pub trait TokenStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn tokens(&self, text: &str, split_width: Option<usize>) -> Vec<Option<Token>>;
}

/// Columns separated by two or more spaces (or tabs); every column must be a
/// well-formed number to count
pub struct CleanDelimiter;

impl TokenStrategy for CleanDelimiter {
    fn name(&self) -> &str {
        "clean_delimiter"
    }

    fn tokens(&self, text: &str, _split_width: Option<usize>) -> Vec<Option<Token>> {
        split_columns(text)
            .into_iter()
            .map(|column| {
                if is_well_formed_number(column) {
                    Some(Token::clean(column))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Whitespace tokens with split-thousands repair, falling back to digit runs
/// inside mangled tokens
pub struct CorruptionAware;

impl TokenStrategy for CorruptionAware {
    fn name(&self) -> &str {
        "corruption_aware"
    }

    fn tokens(&self, text: &str, split_width: Option<usize>) -> Vec<Option<Token>> {
        let raw: Vec<&str> = text.split_whitespace().collect();
        let mut out = Vec::new();
        let mut i = 0;

        while i < raw.len() {
            if let (Some(width), Some(next)) = (split_width, raw.get(i + 1)) {
                if let Some(joined) = repair_split_thousands(raw[i], next, width) {
                    out.push(Some(Token::repaired(joined)));
                    i += 2;
                    continue;
                }
            }

            let token = raw[i];
            if parse_number(token).is_some() {
                out.push(Some(Token::clean(token)));
            } else {
                for run in numeric_runs(token) {
                    out.push(Some(Token::clean(run)));
                }
            }
            i += 1;
        }

        out
    }
}

/// Result of running the chain over one line
#[derive(Debug, Clone)]
pub struct ChainResult {
    /// Exactly `expected` positions
    pub values: Vec<Option<Token>>,
    pub strategy: String,
    pub recovered: usize,
}

impl ChainResult {
    fn empty(expected: usize) -> Self {
        ChainResult {
            values: (0..expected).map(|_| None).collect(),
            strategy: "none".to_string(),
            recovered: 0,
        }
    }
}

/// Ordered strategies; the first one recovering at least half of the expected
/// values wins and later strategies are not invoked
pub struct StrategyChain {
    strategies: Vec<Box<dyn TokenStrategy>>,
}

impl StrategyChain {
    pub fn standard() -> Self {
        StrategyChain {
            strategies: vec![Box::new(CleanDelimiter), Box::new(CorruptionAware)],
        }
    }

    pub fn with_strategies(strategies: Vec<Box<dyn TokenStrategy>>) -> Self {
        StrategyChain { strategies }
    }

    pub fn extract(&self, text: &str, expected: usize, split_width: Option<usize>) -> ChainResult {
        if expected == 0 {
            return ChainResult::empty(0);
        }

        let mut best: Option<ChainResult> = None;

        for strategy in &self.strategies {
            let mut values = strategy.tokens(text, split_width);
            values.truncate(expected);
            values.resize_with(expected, || None);
            let recovered = values.iter().filter(|v| v.is_some()).count();

            let result = ChainResult {
                values,
                strategy: strategy.name().to_string(),
                recovered,
            };

            if recovered > 0 && recovered * 2 >= expected {
                return result;
            }

            debug!(
                strategy = strategy.name(),
                recovered, expected, "token strategy below threshold, falling back"
            );
            if best.as_ref().map_or(true, |b| recovered > b.recovered) {
                best = Some(result);
            }
        }

        best.unwrap_or_else(|| ChainResult::empty(expected))
    }
}

impl Default for StrategyChain {
    fn default() -> Self {
        Self::standard()
    }
}

fn split_columns(text: &str) -> Vec<&str> {
    text.split('\t')
        .flat_map(|part| part.split("  "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// `567,300`, `$1,210`, `-2.1%`, `(45)`, `12.5`
fn is_well_formed_number(token: &str) -> bool {
    let mut s = token.trim();
    if let Some(inner) = s.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        s = inner;
    }
    s = s.strip_prefix('-').unwrap_or(s);
    s = s.strip_prefix('$').unwrap_or(s);
    s = s.strip_suffix('%').unwrap_or(s);

    let (int_part, frac) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    if let Some(f) = frac {
        if f.is_empty() || !f.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    if int_part.is_empty() {
        return false;
    }

    let groups: Vec<&str> = int_part.split(',').collect();
    if groups.len() == 1 {
        return groups[0].chars().all(|c| c.is_ascii_digit());
    }
    let first = groups[0];
    !first.is_empty()
        && first.len() <= 3
        && first.chars().all(|c| c.is_ascii_digit())
        && groups[1..]
            .iter()
            .all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

/// Numeric fragments inside a token that is not a number as a whole
fn numeric_runs(token: &str) -> Vec<&str> {
    token
        .split(|c: char| !(c.is_ascii_digit() || c == ',' || c == '.'))
        .map(|run| run.trim_matches(|c: char| c == ',' || c == '.'))
        .filter(|run| run.chars().any(|c| c.is_ascii_digit()))
        .collect()
}

// ============================================================================
// LABEL MATCHING
// ============================================================================

/// Compiled patterns for one profile
pub struct LabelMatcher {
    labels: Vec<Regex>,
    markers: Vec<(Regex, String)>,
    yoy: Regex,
    year_header: Regex,
    month_cell: Regex,
}

impl LabelMatcher {
    pub fn compile(profile: &SourceProfile) -> Result<Self> {
        let labels = profile
            .metrics
            .iter()
            .map(|m| {
                Regex::new(&m.label)
                    .with_context(|| format!("Invalid label pattern for metric {}", m.name))
            })
            .collect::<Result<Vec<_>>>()?;

        let markers = profile
            .category_markers
            .iter()
            .map(|m| {
                Regex::new(&m.pattern)
                    .map(|re| (re, m.category.clone()))
                    .with_context(|| format!("Invalid category marker for {}", m.category))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LabelMatcher {
            labels,
            markers,
            yoy: Regex::new(&profile.yoy_label)
                .with_context(|| format!("Invalid yoy label in profile {}", profile.name))?,
            year_header: Regex::new(r"^\s*(20\d{2})\s+(.+)$")?,
            month_cell: Regex::new(r"\b(\d{2})/\d{2}/\d{2,4}\b")?,
        })
    }

    /// Metric whose label starts the line and is followed by values
    pub fn match_line<'a>(&self, line: &'a str) -> Option<(usize, &'a str)> {
        for (idx, re) in self.labels.iter().enumerate() {
            if let Some(m) = re.find(line) {
                let rest = &line[m.end()..];
                let starts_with_value = rest
                    .trim_start()
                    .chars()
                    .next()
                    .map_or(false, |c| c.is_ascii_digit() || matches!(c, '$' | '-' | '('));
                if starts_with_value {
                    return Some((idx, rest));
                }
            }
        }
        None
    }

    /// Metric whose label appears anywhere in a row label
    pub fn match_label(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|re| re.is_match(label))
    }

    /// Category switch on a digit-free line
    pub fn category_marker(&self, line: &str) -> Option<&str> {
        if line.chars().any(|c| c.is_ascii_digit()) {
            return None;
        }
        self.markers
            .iter()
            .find(|(re, _)| re.is_match(line))
            .map(|(_, category)| category.as_str())
    }

    pub fn is_yoy_row(&self, label: &str) -> bool {
        self.yoy.is_match(label)
    }

    /// `2025 01/01/25 02/01/25 ...` or `2025 Jan Feb Mar ...` → month columns
    pub fn year_header(&self, line: &str) -> Option<Vec<Period>> {
        let caps = self.year_header.captures(line)?;
        let year = caps[1].parse::<i32>().ok()?;
        let rest = &caps[2];

        let mut months: Vec<u32> = self
            .month_cell
            .captures_iter(rest)
            .filter_map(|c| c[1].parse::<u32>().ok())
            .collect();
        if months.is_empty() {
            months = rest.split_whitespace().filter_map(month_from_abbrev).collect();
        }

        let periods: Vec<Period> = months
            .into_iter()
            .filter_map(|m| Period::new(year, m))
            .collect();
        if periods.is_empty() {
            None
        } else {
            Some(periods)
        }
    }
}

/// `Jan`, `Sept.`, `March` → month number; `Market` is not a month
fn month_from_abbrev(text: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "january", "february", "march", "april", "may", "june", "july", "august", "september",
        "october", "november", "december",
    ];
    let lower = text.trim().trim_end_matches('.').to_ascii_lowercase();
    if lower.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.starts_with(lower.as_str()))
        .map(|i| i as u32 + 1)
}

/// Spreadsheet column headers: `2024`, `Jan-24`, `Jan 2024`, `2024-01`, `2024-01-15`.
/// Returns the period and whether the column is annual.
pub fn parse_period_header(cell: &str) -> Option<(Period, bool)> {
    let cell = cell.trim();
    let cell = cell.strip_suffix(".0").unwrap_or(cell);

    if cell.len() == 4 && cell.chars().all(|c| c.is_ascii_digit()) {
        let year = cell.parse::<i32>().ok()?;
        return Period::new(year, 1).map(|p| (p, true));
    }

    let parts: Vec<&str> = cell
        .split(|c: char| c == '-' || c == '/' || c == ' ')
        .filter(|s| !s.is_empty())
        .collect();
    match parts.as_slice() {
        [first, second, ..] if first.len() == 4 && first.chars().all(|c| c.is_ascii_digit()) => {
            let year = first.parse::<i32>().ok()?;
            let month = second.parse::<u32>().ok()?;
            Period::new(year, month).map(|p| (p, false))
        }
        [name, year] if name.chars().all(|c| c.is_ascii_alphabetic()) => {
            let month = month_from_abbrev(name)?;
            let year = match year.len() {
                2 => 2000 + year.parse::<i32>().ok()?,
                4 => year.parse::<i32>().ok()?,
                _ => return None,
            };
            Period::new(year, month).map(|p| (p, false))
        }
        _ => None,
    }
}

/// Date cells in tabular data; adds `MM/DD/YY` and `MM/DD/YYYY`
pub fn parse_period_cell(cell: &str) -> Option<Period> {
    if let Some((period, _)) = parse_period_header(cell) {
        return Some(period);
    }
    let parts: Vec<&str> = cell.trim().split('/').collect();
    if let [month, _day, year] = parts.as_slice() {
        let month = month.parse::<u32>().ok()?;
        let year = match year.len() {
            2 => 2000 + year.parse::<i32>().ok()?,
            4 => year.parse::<i32>().ok()?,
            _ => return None,
        };
        return Period::new(year, month);
    }
    None
}

// ============================================================================
// PAGE LAYOUTS
// ============================================================================

/// Everything a layout needs besides the page itself
pub struct ParseHint<'a> {
    pub profile: &'a SourceProfile,
    pub matcher: &'a LabelMatcher,
    pub chain: &'a StrategyChain,
    /// Category for records before any marker line
    pub category: &'a str,
    /// Document period, used when the page carries no dates
    pub period: Period,
    pub origin: String,
}

#[derive(Debug, Clone, Default)]
pub struct PageParse {
    pub records: Vec<CandidateRecord>,
    /// Record slots the page announced (header columns × rows)
    pub expected: usize,
    /// Token strategy name → lines it won
    pub strategy_hits: BTreeMap<String, usize>,
}

pub trait PageLayout: Send + Sync {
    fn kind(&self) -> LayoutKind;
    fn parse(&self, page: &Page, hint: &ParseHint) -> PageParse;
}

/// Factory: one layout per kind
pub fn layout_for(kind: LayoutKind) -> Box<dyn PageLayout> {
    match kind {
        LayoutKind::MonthlySeries => Box::new(MonthlySeriesLayout),
        LayoutKind::EntityTable => Box::new(EntityTableLayout),
        LayoutKind::IndicatorGrid => Box::new(IndicatorGridLayout),
        LayoutKind::Tabular => Box::new(TabularLayout),
    }
}

impl LayoutKind {
    pub fn name(&self) -> &str {
        match self {
            LayoutKind::MonthlySeries => "monthly_series",
            LayoutKind::EntityTable => "entity_table",
            LayoutKind::IndicatorGrid => "indicator_grid",
            LayoutKind::Tabular => "tabular",
        }
    }
}

/// Text lines of a page; grid rows are joined with a column gap
fn page_lines(page: &Page) -> Vec<String> {
    match &page.content {
        PageContent::Text(text) => text.lines().map(str::to_string).collect(),
        PageContent::Grid(rows) => rows.iter().map(|r| r.join("  ")).collect(),
    }
}

/// Cell rows of a page; text lines are cut on column gaps
fn page_rows(page: &Page) -> Vec<Vec<String>> {
    match &page.content {
        PageContent::Grid(rows) => rows.clone(),
        PageContent::Text(text) => text
            .lines()
            .map(|l| split_columns(l).into_iter().map(str::to_string).collect())
            .collect(),
    }
}

fn to_measure(spec: &MetricSpec, name: &str, token: &str, repaired: bool) -> Option<Measure> {
    let normalized = normalize(token, spec)?;
    let mut confidence = normalized.confidence;
    let mut flags = normalized.flags;
    if repaired {
        confidence = confidence.min(REPAIRED_CONFIDENCE);
        flags.push(ValueFlag::SplitThousands);
    }
    Some(
        Measure::new(name, normalized.value, &spec.unit, spec.value_type)
            .with_confidence(confidence)
            .with_flags(flags),
    )
}

/// Year header lines followed by metric lines
pub struct MonthlySeriesLayout;

impl PageLayout for MonthlySeriesLayout {
    fn kind(&self) -> LayoutKind {
        LayoutKind::MonthlySeries
    }

    fn parse(&self, page: &Page, hint: &ParseHint) -> PageParse {
        let mut out = PageParse::default();
        let mut category = hint.category.to_string();
        let mut columns: Vec<Period> = Vec::new();
        let mut series: BTreeMap<(String, Period), CandidateRecord> = BTreeMap::new();

        for line in page_lines(page) {
            if let Some(marker) = hint.matcher.category_marker(&line) {
                category = marker.to_string();
                continue;
            }
            if let Some(header) = hint.matcher.year_header(&line) {
                out.expected += header.len();
                columns = header;
                continue;
            }
            if columns.is_empty() {
                continue;
            }

            let (idx, rest) = match hint.matcher.match_line(&line) {
                Some(found) => found,
                None => continue,
            };
            let spec = &hint.profile.metrics[idx];
            let chain = hint.chain.extract(rest, columns.len(), spec.split_width);
            *out.strategy_hits.entry(chain.strategy.clone()).or_default() += 1;

            for (period, token) in columns.iter().zip(chain.values) {
                let token = match token {
                    Some(t) => t,
                    None => continue,
                };
                if let Some(measure) = to_measure(spec, &spec.name, &token.text, token.repaired) {
                    series
                        .entry((category.clone(), *period))
                        .or_insert_with(|| CandidateRecord::new(*period, &category, &hint.origin))
                        .push_measure(measure);
                }
            }
        }

        out.records = series
            .into_values()
            .filter(|r| r.is_complete(&hint.profile.required_metrics))
            .collect();
        out
    }
}

/// Category sections of `<entity> <positional values>` rows
pub struct EntityTableLayout;

impl PageLayout for EntityTableLayout {
    fn kind(&self) -> LayoutKind {
        LayoutKind::EntityTable
    }

    fn parse(&self, page: &Page, hint: &ParseHint) -> PageParse {
        let mut out = PageParse::default();
        let profile = hint.profile;
        let entity_column = profile.entity_column.as_deref().unwrap_or("entity");

        // Longest names first so "North East" wins over "North"
        let mut entities: Vec<&str> = profile.entities.iter().map(String::as_str).collect();
        entities.sort_by_key(|e| std::cmp::Reverse(e.len()));

        let mut category = hint.category.to_string();
        let mut sections = 0usize;
        let mut rows: BTreeMap<(String, String), CandidateRecord> = BTreeMap::new();

        for line in page_lines(page) {
            if let Some(marker) = hint.matcher.category_marker(&line) {
                category = marker.to_string();
                sections += 1;
                continue;
            }

            let trimmed = line.trim_start();
            let entity = entities.iter().find(|e| {
                trimmed
                    .get(..e.len())
                    .map_or(false, |prefix| prefix.eq_ignore_ascii_case(e))
                    && trimmed[e.len()..].starts_with(char::is_whitespace)
            });
            let entity = match entity {
                Some(e) => *e,
                None => continue,
            };

            let rest = &trimmed[entity.len()..];
            let chain = hint.chain.extract(rest, profile.metrics.len(), None);
            *out.strategy_hits.entry(chain.strategy.clone()).or_default() += 1;

            let mut record = CandidateRecord::new(hint.period, &category, &hint.origin)
                .with_entity(entity_column, entity);
            for (spec, token) in profile.metrics.iter().zip(chain.values) {
                if let Some(token) = token {
                    if let Some(measure) = to_measure(spec, &spec.name, &token.text, token.repaired) {
                        record.push_measure(measure);
                    }
                }
            }

            if record.is_complete(&profile.required_metrics) {
                rows.insert((category.clone(), entity.to_string()), record);
            } else {
                debug!(entity, category = category.as_str(), "incomplete entity row dropped");
            }
        }

        out.expected = profile.entities.len() * sections.max(1);
        out.records = rows.into_values().collect();
        out
    }
}

/// Spreadsheet: period header row, indicator rows, optional yoy rows beneath
pub struct IndicatorGridLayout;

impl PageLayout for IndicatorGridLayout {
    fn kind(&self) -> LayoutKind {
        LayoutKind::IndicatorGrid
    }

    fn parse(&self, page: &Page, hint: &ParseHint) -> PageParse {
        let mut out = PageParse::default();
        let rows = page_rows(page);

        let header_idx = rows.iter().position(|row| {
            row.iter()
                .filter(|c| parse_period_header(c).is_some())
                .count()
                >= 1
        });
        let header_idx = match header_idx {
            Some(i) => i,
            None => return out,
        };

        let mut columns: Vec<(usize, Period, bool)> = rows[header_idx]
            .iter()
            .enumerate()
            .filter_map(|(i, c)| parse_period_header(c).map(|(p, annual)| (i, p, annual)))
            .collect();
        // Annual columns only stand in when the sheet has no monthly ones
        if columns.iter().any(|(_, _, annual)| !annual) {
            columns.retain(|(_, _, annual)| !annual);
        }

        let yoy_spec = MetricSpec::new("yoy_change", "", "percentage", ValueType::YoyChange)
            .with_scaling(PercentScaling::FractionToPercent);
        let mut records: BTreeMap<(String, Period), CandidateRecord> = BTreeMap::new();

        for i in (header_idx + 1)..rows.len() {
            let row = &rows[i];
            let label = row_label(row, &columns);
            let idx = match hint.matcher.match_label(label) {
                Some(idx) if !hint.matcher.is_yoy_row(label) => idx,
                _ => continue,
            };
            let spec = &hint.profile.metrics[idx];
            out.expected += columns.len();

            let yoy_row = rows
                .get(i + 1)
                .filter(|next| hint.matcher.is_yoy_row(row_label(next, &columns)));

            for (col, period, _) in &columns {
                let cell = row.get(*col).map(String::as_str).unwrap_or("");
                let measure = match to_measure(spec, "value", cell, false) {
                    Some(m) => m,
                    None => continue,
                };

                let mut record = CandidateRecord::new(*period, &spec.name, &hint.origin)
                    .with_sector(spec.group.as_deref());
                record.push_measure(measure);

                if let Some(yoy_row) = yoy_row {
                    let yoy_cell = yoy_row.get(*col).map(String::as_str).unwrap_or("");
                    if let Some(yoy) = to_measure(&yoy_spec, "yoy_change", yoy_cell, false) {
                        record.push_measure(yoy);
                    }
                }

                if record.is_complete(&hint.profile.required_metrics) {
                    records.insert((spec.name.clone(), *period), record);
                }
            }
        }

        *out.strategy_hits.entry("cells".to_string()).or_default() += 1;
        out.records = records.into_values().collect();
        out
    }
}

/// First non-empty cell that is not a period column
fn row_label<'a>(row: &'a [String], columns: &[(usize, Period, bool)]) -> &'a str {
    row.iter()
        .enumerate()
        .filter(|(i, _)| !columns.iter().any(|(c, _, _)| c == i))
        .map(|(_, c)| c.trim())
        .find(|c| !c.is_empty())
        .unwrap_or("")
}

/// Header row naming date, category, entity and metric columns
pub struct TabularLayout;

impl PageLayout for TabularLayout {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Tabular
    }

    fn parse(&self, page: &Page, hint: &ParseHint) -> PageParse {
        let mut out = PageParse::default();
        let profile = hint.profile;
        let rows = page_rows(page);

        let header_idx = match rows.iter().position(|r| r.iter().any(|c| !c.trim().is_empty())) {
            Some(i) => i,
            None => return out,
        };
        let header: Vec<String> = rows[header_idx]
            .iter()
            .map(|c| c.trim().to_lowercase())
            .collect();
        let data_rows = &rows[header_idx + 1..];
        out.expected = data_rows.len();

        let find = |name: &str| header.iter().position(|h| h == &name.to_lowercase());
        let date_idx = match find(profile.date_column.as_str())
            .or_else(|| find("period"))
            .or_else(|| find("ref_date"))
        {
            Some(i) => i,
            None => return out,
        };
        let category_idx = find(profile.category_column.as_str());
        let entity_idx = profile.entity_column.as_deref().and_then(find);

        let metric_columns: Vec<(usize, &MetricSpec)> = header
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != category_idx && Some(*i) != entity_idx && *i != date_idx)
            .filter_map(|(i, h)| {
                profile
                    .metrics
                    .iter()
                    .find(|m| &m.name == h)
                    .or_else(|| hint.matcher.match_label(h).map(|idx| &profile.metrics[idx]))
                    .map(|spec| (i, spec))
            })
            .collect();

        let mut records: BTreeMap<(Period, String, Option<String>), CandidateRecord> = BTreeMap::new();
        for row in data_rows {
            let cell = |i: usize| row.get(i).map(|c| c.trim()).unwrap_or("");
            let period = match parse_period_cell(cell(date_idx)) {
                Some(p) => p,
                None => continue,
            };
            let category = category_idx
                .map(|i| cell(i))
                .filter(|c| !c.is_empty())
                .unwrap_or(hint.category);

            let mut record = CandidateRecord::new(period, category, &hint.origin);
            if let (Some(i), Some(kind)) = (entity_idx, profile.entity_column.as_deref()) {
                if !cell(i).is_empty() {
                    record = record.with_entity(kind, cell(i));
                }
            }
            for (i, spec) in &metric_columns {
                if let Some(measure) = to_measure(spec, &spec.name, cell(*i), false) {
                    if record.sector.is_none() {
                        record.sector = spec.group.clone();
                    }
                    record.push_measure(measure);
                }
            }

            if record.is_complete(&profile.required_metrics) {
                records.insert(record.identity(), record);
            }
        }

        *out.strategy_hits.entry("cells".to_string()).or_default() += 1;
        out.records = records.into_values().collect();
        out
    }
}

// ============================================================================
// RECORD PARSER
// ============================================================================

/// A page that produced nothing; extraction carries on with its siblings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFailure {
    pub page: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: Vec<CandidateRecord>,
    pub expected: usize,
    pub page_failures: Vec<PageFailure>,
    /// `<layout>/<dominant token strategy>`
    pub strategy: String,
}

pub struct RecordParser<'a> {
    profile: &'a SourceProfile,
    matcher: LabelMatcher,
    chain: StrategyChain,
    layout: Box<dyn PageLayout>,
}

impl<'a> RecordParser<'a> {
    /// Parser using the profile's own layout
    pub fn new(profile: &'a SourceProfile) -> Result<Self> {
        Self::with_layout(profile, profile.layout)
    }

    pub fn with_layout(profile: &'a SourceProfile, kind: LayoutKind) -> Result<Self> {
        Ok(RecordParser {
            profile,
            matcher: LabelMatcher::compile(profile)?,
            chain: StrategyChain::standard(),
            layout: layout_for(kind),
        })
    }

    /// Builder pattern: replace the token strategy chain
    pub fn with_chain(mut self, chain: StrategyChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn layout_kind(&self) -> LayoutKind {
        self.layout.kind()
    }

    /// Parse pages in order. Bound pages get their category; without bindings
    /// every page is parsed under the profile's default category.
    pub fn parse_document(&self, doc: &RawDocument) -> ParseOutcome {
        self.parse_document_as(doc, doc.period)
    }

    /// Same as `parse_document`, dating undated records with `period`
    pub fn parse_document_as(&self, doc: &RawDocument, period: Period) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();
        let mut hits: BTreeMap<String, usize> = BTreeMap::new();
        let mut merged: BTreeMap<(Period, String, Option<String>), CandidateRecord> = BTreeMap::new();

        let targets: Vec<(usize, String)> = if self.profile.pages.is_empty() {
            doc.pages
                .iter()
                .map(|p| (p.number, self.profile.default_category.clone()))
                .collect()
        } else {
            self.profile
                .pages
                .iter()
                .map(|b| (b.page, b.category.clone()))
                .collect()
        };

        for (number, category) in targets {
            let page = match doc.page(number) {
                Some(p) => p,
                None => {
                    warn!(page = number, source = doc.source.as_str(), "bound page not present in document");
                    outcome.expected += self.profile.expected_per_page;
                    outcome.page_failures.push(PageFailure {
                        page: number,
                        reason: "page not present in document".to_string(),
                    });
                    continue;
                }
            };

            let hint = ParseHint {
                profile: self.profile,
                matcher: &self.matcher,
                chain: &self.chain,
                category: &category,
                period,
                origin: format!("{}#p{}", doc.origin, number),
            };
            let parsed = self.layout.parse(page, &hint);

            if parsed.records.is_empty() {
                warn!(
                    page = number,
                    layout = self.layout.kind().name(),
                    "page yielded no records"
                );
                outcome.expected += parsed.expected.max(self.profile.expected_per_page);
                outcome.page_failures.push(PageFailure {
                    page: number,
                    reason: format!("{} layout found no complete records", self.layout.kind().name()),
                });
                continue;
            }

            debug!(page = number, records = parsed.records.len(), expected = parsed.expected, "page parsed");
            outcome.expected += parsed.expected.max(parsed.records.len());
            for (name, count) in parsed.strategy_hits {
                *hits.entry(name).or_default() += count;
            }
            for record in parsed.records {
                merged.insert(record.identity(), record);
            }
        }

        let dominant = hits
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(name, _)| name.as_str())
            .unwrap_or("none");
        outcome.strategy = format!("{}/{}", self.layout.kind().name(), dominant);
        outcome.records = merged.into_values().collect();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{creb_city, creb_district, economic};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const CITY_PAGE: &str = "\
CITY OF CALGARY TOTAL RESIDENTIAL
2025 01/01/25 02/01/25 03/01/25
Sales 1,210 1,585 2,124
New Listings 2,187 2,734 3,411
Inventory 3,112 3,651 4,386
Days on Market 37 31 27
Benchmark Price 579,700 5 84,000 589,900
Median Price 545,000 555,000 560,000
Average Price 610,235 620,404 625,112
";

    fn city_doc() -> RawDocument {
        RawDocument::from_pages(
            "creb_city",
            Period::new(2025, 3).unwrap(),
            "03_2025_Calgary.txt",
            vec![Page::text(11, CITY_PAGE), Page::text(13, CITY_PAGE)],
        )
    }

    struct Counting {
        inner: Box<dyn TokenStrategy>,
        calls: Arc<AtomicUsize>,
    }

    impl TokenStrategy for Counting {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn tokens(&self, text: &str, split_width: Option<usize>) -> Vec<Option<Token>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.tokens(text, split_width)
        }
    }

    #[test]
    fn test_well_formed_numbers() {
        assert!(is_well_formed_number("567,300"));
        assert!(is_well_formed_number("$1,210"));
        assert!(is_well_formed_number("-2.1%"));
        assert!(is_well_formed_number("(45)"));
        assert!(!is_well_formed_number("5 67,300"));
        assert!(!is_well_formed_number("56,73,00"));
        assert!(!is_well_formed_number("-"));
    }

    #[test]
    fn test_clean_input_never_invokes_fallback() {
        let fallback_calls = Arc::new(AtomicUsize::new(0));
        let chain = StrategyChain::with_strategies(vec![
            Box::new(CleanDelimiter),
            Box::new(Counting {
                inner: Box::new(CorruptionAware),
                calls: fallback_calls.clone(),
            }),
        ]);

        let result = chain.extract("1,210  1,585  2,124", 3, None);
        assert_eq!(result.strategy, "clean_delimiter");
        assert_eq!(result.recovered, 3);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_split_thousands_recovered_by_fallback() {
        let chain = StrategyChain::standard();
        let result = chain.extract("5 67,300", 1, Some(6));
        assert_eq!(result.strategy, "corruption_aware");
        let token = result.values[0].as_ref().unwrap();
        assert_eq!(token.text, "567300");
        assert!(token.repaired);
    }

    #[test]
    fn test_chain_truncates_and_pads_to_cardinality() {
        let chain = StrategyChain::standard();
        let long = chain.extract("1 2 3 4 5", 3, None);
        assert_eq!(long.values.len(), 3);

        let short = chain.extract("10 20", 3, None);
        assert_eq!(short.values.len(), 3);
        assert!(short.values[2].is_none());
    }

    #[test]
    fn test_year_header() {
        let matcher = LabelMatcher::compile(&creb_city()).unwrap();
        let header = matcher.year_header("2024 10/01/24 11/01/24 12/01/24").unwrap();
        assert_eq!(header.len(), 3);
        assert_eq!(header[0], Period::new(2024, 10).unwrap());
        assert!(matcher.year_header("2024 was a good year").is_none());
        assert_eq!(matcher.year_header("2025 Jan Feb").unwrap().len(), 2);
        assert!(matcher.year_header("2025 Market Summary").is_none());
    }

    #[test]
    fn test_label_requires_values() {
        let matcher = LabelMatcher::compile(&creb_city()).unwrap();
        assert!(matcher.match_line("Sales to new listings ratio 65%").is_none());
        let (idx, rest) = matcher.match_line("Sales 1,210 1,585").unwrap();
        assert_eq!(creb_city().metrics[idx].name, "sales");
        assert_eq!(rest.trim(), "1,210 1,585");
    }

    #[test]
    fn test_monthly_series_document() {
        let profile = creb_city();
        let parser = RecordParser::new(&profile).unwrap();
        let outcome = parser.parse_document(&city_doc());

        // Pages 11 and 13 parse, 15/17/19 are missing
        assert_eq!(outcome.records.len(), 6);
        assert_eq!(outcome.page_failures.len(), 3);
        assert!(outcome.strategy.starts_with("monthly_series/"));

        let feb_total = outcome
            .records
            .iter()
            .find(|r| r.category == "Total" && r.period.month == 2)
            .unwrap();
        let price = feb_total.measure("benchmark_price").unwrap();
        assert_eq!(price.value, 584000.0);
        assert!(price.flags.contains(&ValueFlag::SplitThousands));
        assert_eq!(feb_total.confidence, REPAIRED_CONFIDENCE);

        let jan_detached = outcome
            .records
            .iter()
            .find(|r| r.category == "Detached" && r.period.month == 1)
            .unwrap();
        assert_eq!(jan_detached.measure("sales").unwrap().value, 1210.0);
        assert_eq!(jan_detached.confidence, 1.0);
    }

    #[test]
    fn test_incomplete_records_dropped() {
        let profile = creb_city();
        let parser = RecordParser::new(&profile).unwrap();
        let page = "2025 01/01/25 02/01/25\nSales 100 200\nNew Listings 300 400\n";
        let doc = RawDocument::from_pages(
            "creb_city",
            Period::new(2025, 2).unwrap(),
            "x.txt",
            vec![Page::text(11, page)],
        );
        let outcome = parser.parse_document(&doc);
        assert!(outcome.records.is_empty());
        assert!(outcome.page_failures.iter().any(|f| f.page == 11));
    }

    #[test]
    fn test_entity_table_layout() {
        let profile = creb_district();
        let parser = RecordParser::new(&profile).unwrap();
        let page = "\
District New Sales New Listings Ratio Inventory Months Benchmark YoY MoM
Detached
City Centre 42 60 70.00% 88 2.10 $781,200 4.10% -0.50%
North East 55 70 78.57% 90 1.64 $531,600 2.20% 0.30%
North 61 75 81.33% 102 1.67 $612,000 1.90% 0.10%
Apartment
City Centre 120 190 63.16% 410 3.42 $327,100 5.00% 0.80%
";
        let doc = RawDocument::from_pages(
            "creb_district",
            Period::new(2025, 5).unwrap(),
            "05_2025_Calgary.txt",
            vec![Page::text(7, page)],
        );
        let outcome = parser.parse_document(&doc);
        assert_eq!(outcome.records.len(), 4);

        let north_east = outcome
            .records
            .iter()
            .find(|r| r.entity.as_ref().map(|e| e.name.as_str()) == Some("North East"))
            .unwrap();
        assert_eq!(north_east.category, "Detached");
        assert_eq!(north_east.measure("benchmark_price").unwrap().value, 531600.0);
        assert_eq!(north_east.measure("mom_price_change").unwrap().value, 0.3);

        let north = outcome
            .records
            .iter()
            .find(|r| r.entity.as_ref().map(|e| e.name.as_str()) == Some("North"))
            .unwrap();
        assert_eq!(north.measure("new_sales").unwrap().value, 61.0);

        let apartment = outcome.records.iter().find(|r| r.category == "Apartment").unwrap();
        assert_eq!(apartment.entity.as_ref().unwrap().kind, "district");
        assert_eq!(outcome.expected, 18);
    }

    #[test]
    fn test_indicator_grid_with_yoy_row() {
        let profile = economic();
        let parser = RecordParser::new(&profile).unwrap();
        let grid = vec![
            vec!["Indicator", "Jan-25", "Feb-25", "Mar-25"],
            vec!["Unemployment rate", "0.071", "0.072", "#N/A"],
            vec!["Year-over-year % change", "0.05", "-0.02", ""],
            vec!["Population", "1,688,000", "1,691,500", "1,694,000"],
        ]
        .into_iter()
        .map(|r| r.into_iter().map(str::to_string).collect())
        .collect();
        let doc = RawDocument::from_pages(
            "economic",
            Period::new(2025, 3).unwrap(),
            "economic_2025-03.csv",
            vec![Page::grid(1, grid)],
        );

        let outcome = parser.parse_document(&doc);
        assert_eq!(outcome.records.len(), 5);
        assert_eq!(outcome.expected, 6);

        let jan = outcome
            .records
            .iter()
            .find(|r| r.category == "unemployment_rate" && r.period.month == 1)
            .unwrap();
        assert!((jan.measure("value").unwrap().value - 7.1).abs() < 1e-9);
        assert!((jan.measure("yoy_change").unwrap().value - 5.0).abs() < 1e-9);
        assert_eq!(jan.sector.as_deref(), Some("labour"));

        assert!(outcome
            .records
            .iter()
            .all(|r| !(r.category == "unemployment_rate" && r.period.month == 3)));
    }

    #[test]
    fn test_period_headers() {
        assert_eq!(parse_period_header("Jan-24"), Some((Period::new(2024, 1).unwrap(), false)));
        assert_eq!(parse_period_header("2024-11"), Some((Period::new(2024, 11).unwrap(), false)));
        assert_eq!(parse_period_header("2023"), Some((Period::new(2023, 1).unwrap(), true)));
        assert_eq!(parse_period_header("Sep 2024"), Some((Period::new(2024, 9).unwrap(), false)));
        assert_eq!(parse_period_header("Indicator"), None);
        assert_eq!(parse_period_cell("03/01/25"), Period::new(2025, 3));
    }

    #[test]
    fn test_tabular_layout() {
        let profile = creb_city();
        let parser = RecordParser::with_layout(&profile, LayoutKind::Tabular).unwrap();
        let grid = vec![
            vec!["Date", "Category", "Sales", "New_Listings", "Benchmark_Price", "Notes"],
            vec!["2025-04-01", "Row", "310", "420", "452,100", "ok"],
            vec!["not a date", "Row", "1", "1", "1", ""],
        ]
        .into_iter()
        .map(|r| r.into_iter().map(str::to_string).collect())
        .collect();
        let mut profile_all_pages = profile.clone();
        profile_all_pages.pages.clear();
        let parser_all = RecordParser::with_layout(&profile_all_pages, LayoutKind::Tabular).unwrap();
        let doc = RawDocument::from_pages(
            "creb_city",
            Period::new(2025, 4).unwrap(),
            "open.csv",
            vec![Page::grid(1, grid)],
        );

        // Bound pages (11..19) are absent from a one-sheet document
        assert!(parser.parse_document(&doc).records.is_empty());

        let outcome = parser_all.parse_document(&doc);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].category, "Row");
        assert_eq!(outcome.records[0].measure("benchmark_price").unwrap().value, 452100.0);
        assert_eq!(outcome.expected, 2);
    }
}
