//! Schema drift detection and fuzzy field mapping.
//!
//! Each source's last observed schema (field set + scalar type tags) is kept
//! as a snapshot. When a structural change shows up, the source's schema
//! version is bumped and every removed field is matched against the newly
//! appeared ones. Matches land in one of three confidence tiers:
//!
//! * `>= 0.8`  applied: the mapper renames the field on every row
//! * `[0.5, 0.8)` quarantined: logged, never used, unified field stays absent
//! * `< 0.5`  skipped: dropped
//!
//! Static aliases always apply during row mapping, drift or not.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::{FieldMapping, RawRecord, SourceId};

/// Target fields of the unified record shape.
pub const UNIFIED_FIELDS: [&str; 8] = [
    "symbol",
    "name",
    "price_usd",
    "volume_24h",
    "market_cap",
    "percent_change_24h",
    "timestamp",
    "source",
];

/// Canonical alias table. Confidence 1.0 in either direction.
const STATIC_ALIASES: [(&str, &str); 6] = [
    ("time", "timestamp"),
    ("ticker", "symbol"),
    ("usd_price", "price_usd"),
    ("tx_volume", "volume_24h"),
    ("created_at", "timestamp"),
    ("price_timestamp", "timestamp"),
];

const APPLY_THRESHOLD: f64 = 0.8;
const QUARANTINE_THRESHOLD: f64 = 0.5;

/// Scalar type tag used for structural schema comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl TypeTag {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Number(_) => TypeTag::Number,
            Value::String(_) => TypeTag::String,
            Value::Array(_) => TypeTag::Array,
            Value::Object(_) => TypeTag::Object,
        }
    }
}

/// Sorted field set + per-field type, so equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct SchemaSnapshot {
    fields: BTreeMap<String, TypeTag>,
}

impl SchemaSnapshot {
    fn of(record: &RawRecord) -> Self {
        let fields = record
            .iter()
            .map(|(k, v)| (k.clone(), TypeTag::of(v)))
            .collect();
        Self { fields }
    }
}

/// Outcome of drift detection for one source.
#[derive(Debug, Clone, Default)]
pub struct DriftResult {
    pub schema_version: u32,
    pub applied_mappings: Vec<FieldMapping>,
    pub quarantined_mappings: Vec<FieldMapping>,
    pub skipped_mappings: Vec<FieldMapping>,
}

/// True when the pair sits in the alias table, either direction.
fn is_static_alias(a: &str, b: &str) -> bool {
    STATIC_ALIASES
        .iter()
        .any(|(x, y)| (*x == a && *y == b) || (*x == b && *y == a))
}

/// Unified target a field aliases to, if any.
fn static_alias_target(field: &str) -> Option<&'static str> {
    STATIC_ALIASES
        .iter()
        .find(|(from, _)| *from == field)
        .map(|(_, to)| *to)
}

fn tokens(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(['_', '-'])
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Single-token score: exact 1.0, prefix abbreviation 0.9 (`vol`/`volume`),
/// else Levenshtein ratio.
fn token_score(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.starts_with(b) || b.starts_with(a) {
        return 0.9;
    }
    let distance = strsim::levenshtein(a, b) as f64;
    let max_len = a.len().max(b.len()) as f64;
    (1.0 - distance / max_len).max(0.0)
}

/// Field-name similarity in [0, 1]. Alias hit wins; otherwise tokens (split
/// on `_`/`-`) are pair-matched greedily by score and combined dice-style,
/// so an abbreviated token keeps a high score (`vol_24h` vs `volume_24h`)
/// while an extra token drags it down (`timestamp_unix` vs `timestamp`).
/// Symmetric, and `s(x, x) == 1.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    if is_static_alias(a, b) {
        return 1.0;
    }

    let tokens_a = tokens(a);
    let tokens_b = tokens(b);
    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    if tokens_a == tokens_b {
        return 1.0;
    }

    // All cross-token scores, best pairs first. Ties break on the token text
    // so the matching is deterministic and order-independent.
    let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
    for (i, ta) in tokens_a.iter().enumerate() {
        for (j, tb) in tokens_b.iter().enumerate() {
            pairs.push((token_score(ta, tb), i, j));
        }
    }
    pairs.sort_by(|x, y| {
        y.0.partial_cmp(&x.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| tokens_a[x.1].cmp(&tokens_a[y.1]))
            .then_with(|| tokens_b[x.2].cmp(&tokens_b[y.2]))
    });

    let mut used_a = vec![false; tokens_a.len()];
    let mut used_b = vec![false; tokens_b.len()];
    let mut total = 0.0;
    for (score, i, j) in pairs {
        if score <= 0.0 {
            break;
        }
        if used_a[i] || used_b[j] {
            continue;
        }
        used_a[i] = true;
        used_b[j] = true;
        total += score;
    }

    2.0 * total / (tokens_a.len() + tokens_b.len()) as f64
}

/// Per-source schema snapshots, versions, and the active rename table.
pub struct SchemaMapper {
    state: Mutex<HashMap<SourceId, SourceMapperState>>,
}

#[derive(Debug, Default)]
struct SourceMapperState {
    snapshot: Option<SchemaSnapshot>,
    version: u32,
    /// source field -> unified field, only confidence >= 0.8 entries.
    active: HashMap<String, String>,
}

impl Default for SchemaMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaMapper {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Compare the representative record's shape against the stored snapshot
    /// and refresh the active mappings. Always returns the current version.
    pub fn detect_drift(&self, source: SourceId, first_record: &RawRecord) -> DriftResult {
        let current = SchemaSnapshot::of(first_record);
        let mut state = self.state.lock();
        let entry = state.entry(source).or_default();

        let prior = match entry.snapshot.take() {
            None => {
                // First observation: baseline, nothing to map.
                entry.version = 1;
                entry.snapshot = Some(current);
                return DriftResult {
                    schema_version: 1,
                    ..Default::default()
                };
            }
            Some(prior) => prior,
        };

        if prior == current {
            entry.snapshot = Some(current);
            return DriftResult {
                schema_version: entry.version,
                ..Default::default()
            };
        }

        entry.version += 1;
        info!(
            source = %source,
            schema_version = entry.version,
            "schema drift detected"
        );

        let removed: Vec<&String> = prior
            .fields
            .keys()
            .filter(|k| !current.fields.contains_key(*k))
            .collect();
        let added: Vec<&String> = current
            .fields
            .keys()
            .filter(|k| !prior.fields.contains_key(*k))
            .collect();

        let mut result = DriftResult {
            schema_version: entry.version,
            ..Default::default()
        };

        // Renames whose source field vanished are retired with the snapshot
        // swap; renames of still-present fields stay active.
        entry
            .active
            .retain(|source_field, _| current.fields.contains_key(source_field));

        for removed_field in removed {
            let best = added
                .iter()
                .map(|candidate| (candidate.as_str(), similarity(removed_field, candidate)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            let Some((candidate, confidence)) = best else {
                continue;
            };
            if confidence <= 0.0 {
                continue;
            }

            let mapping = FieldMapping {
                from: removed_field.clone(),
                to: candidate.to_string(),
                confidence,
            };

            if confidence >= APPLY_THRESHOLD {
                debug!(
                    source = %source,
                    from = %mapping.from,
                    to = %mapping.to,
                    confidence,
                    "field mapping applied"
                );
                entry
                    .active
                    .insert(candidate.to_string(), removed_field.clone());
                result.applied_mappings.push(mapping);
            } else if confidence >= QUARANTINE_THRESHOLD {
                warn!(
                    source = %source,
                    from = %mapping.from,
                    to = %mapping.to,
                    confidence,
                    "field mapping quarantined, value treated as absent"
                );
                result.quarantined_mappings.push(mapping);
            } else {
                result.skipped_mappings.push(mapping);
            }
        }

        entry.snapshot = Some(current);
        result
    }

    /// Rename row keys through active mappings and static aliases, then
    /// coerce numeric unified fields. Returns the mapped row plus a log of
    /// the renames that fired.
    pub fn map_row(&self, source: SourceId, row: &RawRecord) -> (RawRecord, Vec<(String, String)>) {
        let state = self.state.lock();
        let active = state.get(&source).map(|s| &s.active);

        let mut mapped = RawRecord::new();
        let mut log = Vec::new();

        for (key, value) in row {
            let target = active
                .and_then(|a| a.get(key).cloned())
                .or_else(|| static_alias_target(key).map(str::to_string));

            match target {
                // First writer wins if a rename collides with a literal field.
                Some(unified) if !mapped.contains_key(&unified) => {
                    log.push((key.clone(), unified.clone()));
                    mapped.insert(unified, value.clone());
                }
                Some(_) => {}
                None => {
                    mapped.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        for field in ["price_usd", "volume_24h", "market_cap", "percent_change_24h"] {
            if let Some(value) = mapped.get(field) {
                match coerce_numeric(value) {
                    Some(parsed) => {
                        mapped.insert(field.to_string(), Value::from(parsed));
                    }
                    None => {
                        // Unparsable numeric is absent, not zero.
                        mapped.remove(field);
                    }
                }
            }
        }

        (mapped, log)
    }

    pub fn schema_version(&self, source: SourceId) -> u32 {
        self.state
            .lock()
            .get(&source)
            .map(|s| s.version)
            .unwrap_or(0)
    }
}

/// Parse a numeric unified field, stripping currency formatting from
/// strings. None when unparsable.
pub fn coerce_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse().ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(fields: &[(&str, Value)]) -> RawRecord {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_similarity_is_symmetric_and_reflexive() {
        let pairs = [
            ("price_usd", "usd_price"),
            ("volume_24h", "vol_24h"),
            ("timestamp", "timestamp_unix"),
            ("percent_change_24h", "pct_chg_24h"),
            ("symbol", "market_cap"),
        ];
        for (a, b) in pairs {
            assert_eq!(similarity(a, b), similarity(b, a), "s({a},{b}) not symmetric");
        }
        assert_eq!(similarity("price_usd", "price_usd"), 1.0);
        assert_eq!(similarity("volume_24h", "volume_24h"), 1.0);
    }

    #[test]
    fn test_static_alias_scores_one() {
        assert_eq!(similarity("usd_price", "price_usd"), 1.0);
        assert_eq!(similarity("ticker", "symbol"), 1.0);
        assert_eq!(similarity("price_timestamp", "timestamp"), 1.0);
    }

    #[test]
    fn test_abbreviated_token_stays_above_apply_threshold() {
        // vol/volume is a prefix abbreviation, 24h matches exactly.
        let score = similarity("volume_24h", "vol_24h");
        assert!(score >= 0.8, "score was {score}");
    }

    #[test]
    fn test_extra_token_lands_in_quarantine_band() {
        // The unmatched `unix` token drags the pair below the apply tier.
        let score = similarity("timestamp", "timestamp_unix");
        assert!((0.5..0.8).contains(&score), "score was {score}");
    }

    #[test]
    fn test_unrelated_names_score_low() {
        assert!(similarity("market_cap", "rank") < 0.5);
        assert_eq!(similarity("symbol", "zz"), 0.0);
    }

    #[test]
    fn test_static_alias_applies_without_drift() {
        let mapper = SchemaMapper::new();
        let row = record(&[("ticker", json!("BTC"))]);
        let (mapped, log) = mapper.map_row(SourceId::CoinGecko, &row);
        assert_eq!(mapped.get("symbol").unwrap(), &json!("BTC"));
        assert!(!mapped.contains_key("ticker"));
        assert_eq!(log, vec![("ticker".to_string(), "symbol".to_string())]);
    }

    #[test]
    fn test_first_observation_is_version_one() {
        let mapper = SchemaMapper::new();
        let drift = mapper.detect_drift(
            SourceId::CoinGecko,
            &record(&[("symbol", json!("BTC")), ("price_usd", json!(1.0))]),
        );
        assert_eq!(drift.schema_version, 1);
        assert!(drift.applied_mappings.is_empty());
    }

    #[test]
    fn test_unchanged_schema_keeps_version() {
        let mapper = SchemaMapper::new();
        let row = record(&[("symbol", json!("BTC")), ("price_usd", json!(1.0))]);
        mapper.detect_drift(SourceId::CoinGecko, &row);
        let drift = mapper.detect_drift(SourceId::CoinGecko, &row);
        assert_eq!(drift.schema_version, 1);
    }

    #[test]
    fn test_drift_auto_maps_alias_and_abbreviation() {
        let mapper = SchemaMapper::new();
        let prior = record(&[
            ("symbol", json!("BTC")),
            ("name", json!("Bitcoin")),
            ("price_usd", json!(48000.0)),
            ("volume_24h", json!(1.0e9)),
            ("timestamp", json!("2024-01-01T00:00:00Z")),
        ]);
        mapper.detect_drift(SourceId::CsvArchive, &prior);

        let drifted = record(&[
            ("symbol", json!("BTC")),
            ("name", json!("Bitcoin")),
            ("usd_price", json!("$50,000")),
            ("vol_24h", json!(1000000)),
            ("timestamp", json!("2024-01-02T00:00:00Z")),
        ]);
        let drift = mapper.detect_drift(SourceId::CsvArchive, &drifted);

        assert_eq!(drift.schema_version, 2);
        let price = drift
            .applied_mappings
            .iter()
            .find(|m| m.from == "price_usd")
            .expect("price_usd mapping missing");
        assert_eq!(price.to, "usd_price");
        assert_eq!(price.confidence, 1.0);

        let volume = drift
            .applied_mappings
            .iter()
            .find(|m| m.from == "volume_24h")
            .expect("volume_24h mapping missing");
        assert_eq!(volume.to, "vol_24h");
        assert!(volume.confidence >= 0.8);

        // Rows now map through the applied renames, with coercion.
        let (mapped, _) = mapper.map_row(SourceId::CsvArchive, &drifted);
        assert_eq!(mapped.get("price_usd").unwrap(), &json!(50000.0));
        assert_eq!(mapped.get("volume_24h").unwrap(), &json!(1000000.0));
    }

    #[test]
    fn test_quarantined_mapping_is_not_used() {
        let mapper = SchemaMapper::new();
        mapper.detect_drift(
            SourceId::CoinPaprika,
            &record(&[
                ("symbol", json!("BTC")),
                ("timestamp", json!("2024-01-01T00:00:00Z")),
            ]),
        );
        let drifted = record(&[
            ("symbol", json!("BTC")),
            ("timestamp_unix", json!(1704067200)),
        ]);
        let drift = mapper.detect_drift(SourceId::CoinPaprika, &drifted);

        let quarantined = drift
            .quarantined_mappings
            .iter()
            .find(|m| m.from == "timestamp")
            .unwrap_or_else(|| panic!("expected quarantine, got {:?}", drift));
        assert_eq!(quarantined.to, "timestamp_unix");

        // Quarantined mapping must not rename rows: the unified field stays
        // absent and downstream validation fails the record.
        let (mapped, _) = mapper.map_row(SourceId::CoinPaprika, &drifted);
        assert!(!mapped.contains_key("timestamp"));
        assert!(mapped.contains_key("timestamp_unix"));
    }

    #[test]
    fn test_unrelated_field_is_skipped() {
        let mapper = SchemaMapper::new();
        mapper.detect_drift(
            SourceId::CoinGecko,
            &record(&[("symbol", json!("BTC")), ("market_cap", json!(1.0))]),
        );
        let drift = mapper.detect_drift(
            SourceId::CoinGecko,
            &record(&[("symbol", json!("BTC")), ("rank", json!(1.0))]),
        );
        let skipped = drift
            .skipped_mappings
            .iter()
            .find(|m| m.from == "market_cap");
        assert!(skipped.is_some(), "expected skip, got {:?}", drift);
        assert!(drift.applied_mappings.is_empty());
    }

    #[test]
    fn test_no_mapping_recorded_for_zero_score() {
        let mapper = SchemaMapper::new();
        mapper.detect_drift(
            SourceId::CoinGecko,
            &record(&[("symbol", json!("BTC")), ("name", json!("Bitcoin"))]),
        );
        let drift = mapper.detect_drift(
            SourceId::CoinGecko,
            &record(&[("symbol", json!("BTC")), ("zz", json!(0))]),
        );
        assert!(drift.applied_mappings.is_empty());
        assert!(drift.quarantined_mappings.is_empty());
        // lev("name", "zz") spans the whole string: score 0, nothing logged.
        assert!(drift.skipped_mappings.is_empty());
    }

    #[test]
    fn test_coerce_numeric_strips_currency_formatting() {
        assert_eq!(coerce_numeric(&json!("$50,000")), Some(50000.0));
        assert_eq!(coerce_numeric(&json!(" 1 234.5 ")), Some(1234.5));
        assert_eq!(coerce_numeric(&json!(42.5)), Some(42.5));
        assert_eq!(coerce_numeric(&json!("n/a")), None);
        assert_eq!(coerce_numeric(&json!(true)), None);
    }

    #[test]
    fn test_type_change_alone_bumps_version() {
        let mapper = SchemaMapper::new();
        mapper.detect_drift(
            SourceId::CoinGecko,
            &record(&[("symbol", json!("BTC")), ("price_usd", json!(1.0))]),
        );
        let drift = mapper.detect_drift(
            SourceId::CoinGecko,
            &record(&[("symbol", json!("BTC")), ("price_usd", json!("1.0"))]),
        );
        assert_eq!(drift.schema_version, 2);
        // Field set unchanged, so nothing to remap.
        assert!(drift.applied_mappings.is_empty());
    }
}
