use serde::{Deserialize, Serialize};
use std::fmt;

/// A positional row as handed to and received from the statement executor
pub type Row = Vec<SqlValue>;

/// Storage representation of a single column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    /// Exact decimal kept as text
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    /// GeoJSON geometry text
    Geometry(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Stable textual form used to index rows by key, tagged by variant
    pub fn index_key(&self) -> String {
        let tag = match self {
            SqlValue::Null => return "n:".to_string(),
            SqlValue::Bool(_) => 'b',
            SqlValue::Int(_) => 'i',
            SqlValue::Double(_) => 'f',
            SqlValue::Decimal(_) => 'd',
            SqlValue::Text(_) => 't',
            SqlValue::Bytes(_) => 'x',
            SqlValue::Geometry(_) => 'g',
        };
        format!("{}:{}", tag, self)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(value) => write!(f, "{}", value),
            SqlValue::Int(value) => write!(f, "{}", value),
            SqlValue::Double(value) => write!(f, "{}", value),
            SqlValue::Decimal(value) | SqlValue::Text(value) | SqlValue::Geometry(value) => {
                write!(f, "{}", value)
            }
            SqlValue::Bytes(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_keys_tell_types_apart() {
        assert_ne!(SqlValue::from("1").index_key(), SqlValue::Int(1).index_key());
        assert_ne!(SqlValue::Null.index_key(), SqlValue::from("NULL").index_key());
        assert_eq!(SqlValue::from("p1").index_key(), SqlValue::from("p1".to_string()).index_key());
    }
}
