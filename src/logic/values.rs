use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use itertools::Itertools;
use serde_json::Value;

use crate::error::DataError;
use crate::model::{SqlType, SqlValue, StorageType};

/// Canonical text of a JSON value: compact, object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => format!(
            "{{{}}}",
            map.iter()
                .sorted_by(|a, b| a.0.cmp(b.0))
                .map(|(key, value)| {
                    format!("{}:{}", Value::String(key.clone()), canonical_json(value))
                })
                .join(",")
        ),
        Value::Array(items) => format!("[{}]", items.iter().map(canonical_json).join(",")),
        other => other.to_string(),
    }
}

fn invalid(property: &str, reason: impl Into<String>) -> DataError {
    DataError::InvalidValue {
        property: property.to_string(),
        reason: reason.into(),
    }
}

/// Normalize a document value into its storage representation
pub fn to_storage(
    value: &Value,
    storage: &StorageType,
    property: &str,
) -> Result<SqlValue, DataError> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    if storage.sql_type.is_spatial() {
        return geometry(value, storage.sql_type, property);
    }
    if value.is_array() || value.is_object() {
        return Err(DataError::ScalarExpected {
            property: property.to_string(),
        });
    }

    match storage.sql_type {
        SqlType::Nvarchar | SqlType::Nclob => {
            let text = value.as_str().ok_or_else(|| invalid(property, "expected a string"))?;
            if let Some(length) = storage.length {
                if text.chars().count() > length as usize {
                    return Err(invalid(property, format!("longer than {} characters", length)));
                }
            }
            Ok(SqlValue::Text(text.to_string()))
        }
        SqlType::Boolean => value
            .as_bool()
            .map(SqlValue::Bool)
            .ok_or_else(|| invalid(property, "expected a boolean")),
        SqlType::Tinyint | SqlType::Smallint | SqlType::Integer | SqlType::Bigint => {
            let number = value.as_i64().ok_or_else(|| invalid(property, "expected an integer"))?;
            let (min, max) = match storage.sql_type {
                SqlType::Tinyint => (0, u8::MAX as i64),
                SqlType::Smallint => (i16::MIN as i64, i16::MAX as i64),
                SqlType::Integer => (i32::MIN as i64, i32::MAX as i64),
                _ => (i64::MIN, i64::MAX),
            };
            if number < min || number > max {
                return Err(invalid(property, format!("{} out of range", number)));
            }
            Ok(SqlValue::Int(number))
        }
        SqlType::Decimal => match value {
            Value::Number(number) => decimal(&number.to_string(), storage, property),
            Value::String(text) => decimal(text.trim(), storage, property),
            _ => Err(invalid(property, "expected a decimal number")),
        },
        SqlType::Double => value
            .as_f64()
            .map(SqlValue::Double)
            .ok_or_else(|| invalid(property, "expected a number")),
        SqlType::Date => {
            let text = value.as_str().unwrap_or_default();
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|date| SqlValue::Text(date.format("%Y-%m-%d").to_string()))
                .map_err(|e| invalid(property, format!("expected a date: {}", e)))
        }
        SqlType::Time => {
            let text = value.as_str().unwrap_or_default();
            NaiveTime::parse_from_str(text, "%H:%M:%S")
                .map(|time| SqlValue::Text(time.format("%H:%M:%S").to_string()))
                .map_err(|e| invalid(property, format!("expected a time: {}", e)))
        }
        SqlType::Seconddate => timestamp(value, property, SecondsFormat::Secs),
        SqlType::Timestamp => timestamp(value, property, SecondsFormat::AutoSi),
        SqlType::Varbinary | SqlType::Blob => {
            let text = value.as_str().ok_or_else(|| invalid(property, "expected base64 text"))?;
            let bytes = STANDARD
                .decode(text)
                .map_err(|e| invalid(property, format!("invalid base64: {}", e)))?;
            if let Some(length) = storage.length {
                if bytes.len() > length as usize {
                    return Err(invalid(property, format!("longer than {} bytes", length)));
                }
            }
            Ok(SqlValue::Bytes(bytes))
        }
        SqlType::StPoint | SqlType::StGeometry => geometry(value, storage.sql_type, property),
    }
}

/// Plain or exponent notation, checked against precision and scale when declared
fn decimal(text: &str, storage: &StorageType, property: &str) -> Result<SqlValue, DataError> {
    let malformed = || invalid(property, format!("expected a decimal number, got '{}'", text));
    let (mantissa, exponent) = match text.split_once(['e', 'E']) {
        Some((mantissa, exponent)) => (mantissa, exponent.parse::<i64>().map_err(|_| malformed())?),
        None => (text, 0),
    };
    let unsigned = mantissa.strip_prefix(['-', '+']).unwrap_or(mantissa);
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let digits = format!("{}{}", whole, fraction);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }

    if let (Some(precision), Some(scale)) = (storage.precision, storage.scale) {
        let significant = digits.trim_start_matches('0');
        let trimmed = significant.trim_end_matches('0');
        if !trimmed.is_empty() {
            let trailing_zeros = (significant.len() - trimmed.len()) as i64;
            let fraction_digits = fraction.len() as i64 - exponent - trailing_zeros;
            let integer_digits = trimmed.len() as i64 - fraction_digits;
            if fraction_digits > i64::from(scale) {
                return Err(invalid(
                    property,
                    format!("{} has more than {} decimal places", text, scale),
                ));
            }
            if integer_digits > i64::from(precision) - i64::from(scale) {
                return Err(invalid(
                    property,
                    format!("{} does not fit DECIMAL({}, {})", text, precision, scale),
                ));
            }
        }
    }
    Ok(SqlValue::Decimal(text.to_string()))
}

/// RFC 3339 in any offset, or a naive timestamp taken as UTC
fn timestamp(value: &Value, property: &str, format: SecondsFormat) -> Result<SqlValue, DataError> {
    let text = value.as_str().ok_or_else(|| invalid(property, "expected a timestamp"))?;
    let parsed = DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc())
        })
        .map_err(|e| invalid(property, format!("expected a timestamp: {}", e)))?;
    Ok(SqlValue::Text(parsed.to_rfc3339_opts(format, true)))
}

/// GeoJSON geometry objects are stored as compact GeoJSON text
fn geometry(value: &Value, sql_type: SqlType, property: &str) -> Result<SqlValue, DataError> {
    let parsed;
    let geometry = match value {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text)
                .map_err(|e| invalid(property, format!("invalid GeoJSON: {}", e)))?;
            &parsed
        }
        other => other,
    };
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(property, "expected a GeoJSON geometry"))?;
    if sql_type == SqlType::StPoint && kind != "Point" {
        return Err(invalid(property, format!("expected a Point, got {}", kind)));
    }
    if geometry.get("coordinates").is_none() && geometry.get("geometries").is_none() {
        return Err(invalid(property, "geometry without coordinates"));
    }
    Ok(SqlValue::Geometry(canonical_json(geometry)))
}

/// Turn a stored value back into its document representation
pub fn from_storage(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(flag) => Value::Bool(*flag),
        SqlValue::Int(number) => Value::from(*number),
        SqlValue::Double(number) => serde_json::Number::from_f64(*number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Decimal(text) => text
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(text.clone())),
        SqlValue::Text(text) => Value::String(text.clone()),
        SqlValue::Bytes(bytes) => Value::String(STANDARD.encode(bytes)),
        SqlValue::Geometry(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
    }
}
