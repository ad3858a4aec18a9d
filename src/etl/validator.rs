//! Strict validation of mapped rows against the unified schema.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::ValidationError;
use crate::etl::schema_mapper::coerce_numeric;
use crate::models::{RawRecord, SourceId, UnifiedRecord};

const MAX_SYMBOL_LEN: usize = 20;
const MAX_NAME_LEN: usize = 100;

/// Validate one mapped row into a `UnifiedRecord`.
///
/// Rules: `price_usd` strictly positive, `volume_24h` non-negative, optional
/// numerics non-negative when present (`market_cap`), timestamp ISO-8601 or
/// epoch seconds (fractional tolerated). Symbols are uppercased on the way
/// through.
pub fn validate(row: &RawRecord, source: SourceId) -> Result<UnifiedRecord, ValidationError> {
    let symbol = require_str(row, "symbol")?;
    if symbol.chars().count() > MAX_SYMBOL_LEN {
        return Err(ValidationError::SymbolTooLong(symbol.to_string()));
    }
    let symbol = symbol.to_uppercase();

    let name = require_str(row, "name")?;
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong);
    }

    let price_usd = require_number(row, "price_usd")?;
    if price_usd <= 0.0 {
        return Err(ValidationError::NotPositive {
            field: "price_usd",
            value: price_usd,
        });
    }

    let volume_24h = require_number(row, "volume_24h")?;
    if volume_24h < 0.0 {
        return Err(ValidationError::Negative {
            field: "volume_24h",
            value: volume_24h,
        });
    }

    let market_cap = optional_number(row, "market_cap")?;
    if let Some(cap) = market_cap {
        if cap < 0.0 {
            return Err(ValidationError::Negative {
                field: "market_cap",
                value: cap,
            });
        }
    }

    let percent_change_24h = optional_number(row, "percent_change_24h")?;

    let timestamp = match row.get("timestamp") {
        Some(value) => parse_timestamp(value)?,
        None => return Err(ValidationError::MissingField("timestamp")),
    };

    Ok(UnifiedRecord {
        symbol,
        name: name.to_string(),
        price_usd,
        volume_24h,
        market_cap,
        percent_change_24h,
        timestamp,
        source,
    })
}

fn require_str<'a>(row: &'a RawRecord, field: &'static str) -> Result<&'a str, ValidationError> {
    match row.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(Value::Null) | None => Err(ValidationError::MissingField(field)),
        Some(_) => Err(ValidationError::MissingField(field)),
    }
}

fn require_number(row: &RawRecord, field: &'static str) -> Result<f64, ValidationError> {
    match row.get(field) {
        Some(Value::Null) | None => Err(ValidationError::MissingField(field)),
        Some(value) => {
            let parsed =
                coerce_numeric(value).ok_or(ValidationError::NotNumeric { field })?;
            if parsed.is_finite() {
                Ok(parsed)
            } else {
                Err(ValidationError::NotNumeric { field })
            }
        }
    }
}

fn optional_number(row: &RawRecord, field: &'static str) -> Result<Option<f64>, ValidationError> {
    match row.get(field) {
        Some(Value::Null) | None => Ok(None),
        Some(value) => match coerce_numeric(value) {
            Some(parsed) if parsed.is_finite() => Ok(Some(parsed)),
            _ => Err(ValidationError::NotNumeric { field }),
        },
    }
}

/// ISO-8601 strings or epoch seconds, fractional milliseconds tolerated.
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ValidationError> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Ok(parsed.with_timezone(&Utc));
            }
            // Bare "YYYY-MM-DDTHH:MM:SS" without an offset is treated as UTC.
            if let Ok(naive) = s.parse::<chrono::NaiveDateTime>() {
                return Ok(Utc.from_utc_datetime(&naive));
            }
            if let Ok(epoch) = s.parse::<f64>() {
                return epoch_to_datetime(epoch)
                    .ok_or_else(|| ValidationError::BadTimestamp(s.to_string()));
            }
            Err(ValidationError::BadTimestamp(s.to_string()))
        }
        Value::Number(n) => {
            let epoch = n
                .as_f64()
                .ok_or_else(|| ValidationError::BadTimestamp(n.to_string()))?;
            epoch_to_datetime(epoch).ok_or_else(|| ValidationError::BadTimestamp(n.to_string()))
        }
        other => Err(ValidationError::BadTimestamp(other.to_string())),
    }
}

fn epoch_to_datetime(epoch_secs: f64) -> Option<DateTime<Utc>> {
    if !epoch_secs.is_finite() || epoch_secs < 0.0 {
        return None;
    }
    let secs = epoch_secs.trunc() as i64;
    let nanos = (epoch_secs.fract() * 1e9).round() as u32;
    Utc.timestamp_opt(secs, nanos.min(999_999_999)).single()
}
