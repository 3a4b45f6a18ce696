use crate::model::{SqlType, SqlValue, Table};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Mints primary key values for new rows
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self, table: &Table) -> SqlValue;
}

/// Random UUIDs for text keys, used by default.
/// Integer keys take random non-negative values within the column's range.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeys;

impl KeyGenerator for UuidKeys {
    fn next_key(&self, table: &Table) -> SqlValue {
        let Some(storage) = table.columns.get(&table.key).and_then(|column| column.storage) else {
            return SqlValue::Text(generate_id());
        };
        let bits = Uuid::new_v4().as_u128();
        match storage.sql_type {
            SqlType::Tinyint => SqlValue::Int(i64::from(bits as u8)),
            SqlType::Smallint => SqlValue::Int(i64::from(bits as u16 & i16::MAX as u16)),
            SqlType::Integer => SqlValue::Int(i64::from(bits as u32 & i32::MAX as u32)),
            SqlType::Bigint => SqlValue::Int((bits as u64 & i64::MAX as u64) as i64),
            _ => match storage.length {
                Some(length) if (length as usize) < 36 => {
                    let mut id = Uuid::new_v4().simple().to_string();
                    id.truncate(length as usize);
                    SqlValue::Text(id)
                }
                _ => SqlValue::Text(generate_id()),
            },
        }
    }
}

/// Deterministic `<prefix>-<n>` keys, shared across all tables
#[derive(Debug, Default)]
pub struct SequentialKeys {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl KeyGenerator for SequentialKeys {
    fn next_key(&self, _table: &Table) -> SqlValue {
        let next = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if self.prefix.is_empty() {
            SqlValue::Text(next.to_string())
        } else {
            SqlValue::Text(format!("{}-{}", self.prefix, next))
        }
    }
}
