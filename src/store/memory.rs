use crate::logic::{BacklinkQuery, SourceRecord, TableRows, TableStatement};
use crate::model::{Row, SqlValue, StorageModel, Table};
use crate::store::RowStore;
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// In-memory row store. Rows are kept in stored column order and filtered
/// by following the parent key chain up to the root table.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    /// Root table -> canonical source key -> id
    sources: RwLock<HashMap<String, HashMap<String, SqlValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(Vec::len).unwrap_or(0)
    }
}

fn position(table: &Table, column: &str) -> Option<usize> {
    table.stored_columns().position(|stored| stored.name == column)
}

/// Indices of the rows of `table` owned by `root_ids`
fn owned_rows(
    data: &HashMap<String, Vec<Row>>,
    model: &StorageModel,
    table: &Table,
    root_ids: &[SqlValue],
) -> Result<Vec<usize>> {
    let mut chain = model.ancestors(table);
    chain.reverse();
    chain.push(table);

    let mut allowed: HashSet<String> = root_ids.iter().map(SqlValue::index_key).collect();
    let mut owned = Vec::new();
    for (depth, current) in chain.iter().enumerate() {
        let rows = data.get(&current.name).map(Vec::as_slice).unwrap_or_default();
        let key = position(current, &current.key)
            .ok_or_else(|| anyhow!("Table {} has no key column {}", current.name, current.key))?;
        let filter = match &current.parent_key {
            Some(parent_key) => position(current, parent_key)
                .ok_or_else(|| {
                    anyhow!("Table {} has no parent key column {}", current.name, parent_key)
                })?,
            None => key,
        };

        owned = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.get(filter)
                    .is_some_and(|value| allowed.contains(&value.index_key()))
            })
            .map(|(index, _)| index)
            .collect();
        if depth + 1 < chain.len() {
            allowed = owned
                .iter()
                .filter_map(|index| rows[*index].get(key))
                .map(SqlValue::index_key)
                .collect();
        }
    }
    Ok(owned)
}

#[async_trait::async_trait]
impl RowStore for MemoryStore {
    async fn find_sources(
        &self,
        table: &str,
        canonical: &[String],
    ) -> Result<Vec<(String, SqlValue)>> {
        let sources = self.sources.read();
        let Some(known) = sources.get(table) else {
            return Ok(Vec::new());
        };
        Ok(canonical
            .iter()
            .filter_map(|key| known.get(key).map(|id| (key.clone(), id.clone())))
            .collect())
    }

    async fn record_sources(&self, records: &[SourceRecord]) -> Result<()> {
        let mut sources = self.sources.write();
        for record in records {
            sources
                .entry(record.table.clone())
                .or_default()
                .insert(record.canonical.clone(), record.id.clone());
        }
        Ok(())
    }

    async fn insert(&self, table: &Table, rows: &TableRows) -> Result<usize> {
        let layout: Vec<Option<usize>> = table
            .stored_columns()
            .map(|column| rows.columns.get(&column.name).copied())
            .collect();

        let mut tables = self.tables.write();
        let stored = tables.entry(table.name.clone()).or_default();
        for row in &rows.rows {
            stored.push(
                layout
                    .iter()
                    .map(|position| {
                        position
                            .and_then(|position| row.get(position))
                            .cloned()
                            .unwrap_or(SqlValue::Null)
                    })
                    .collect(),
            );
        }
        Ok(rows.rows.len())
    }

    async fn select(
        &self,
        model: &StorageModel,
        statement: &TableStatement,
        root_ids: &[SqlValue],
    ) -> Result<Vec<Row>> {
        let table = model
            .table(&statement.table)
            .ok_or_else(|| anyhow!("Unknown table {}", statement.table))?;
        let tables = self.tables.read();
        let owned = owned_rows(&tables, model, table, root_ids)?;
        let rows = tables.get(&table.name).map(Vec::as_slice).unwrap_or_default();
        Ok(owned.into_iter().map(|index| rows[index].clone()).collect())
    }

    async fn select_backlinks(
        &self,
        model: &StorageModel,
        query: &BacklinkQuery,
        root_ids: &[SqlValue],
    ) -> Result<Vec<(SqlValue, SqlValue)>> {
        let target = model
            .table(&query.target_table)
            .ok_or_else(|| anyhow!("Unknown table {}", query.target_table))?;
        let mirror = position(target, &query.mirror)
            .ok_or_else(|| anyhow!("Table {} has no column {}", target.name, query.mirror))?;
        let key = position(target, &query.target_key)
            .ok_or_else(|| anyhow!("Table {} has no column {}", target.name, query.target_key))?;

        let wanted: HashSet<String> = root_ids.iter().map(SqlValue::index_key).collect();
        let tables = self.tables.read();
        let rows = tables.get(&target.name).map(Vec::as_slice).unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| Some((row.get(mirror)?, row.get(key)?)))
            .filter(|(owner, _)| !owner.is_null() && wanted.contains(&owner.index_key()))
            .map(|(owner, target)| (owner.clone(), target.clone()))
            .collect())
    }

    async fn delete(
        &self,
        model: &StorageModel,
        statement: &TableStatement,
        root_ids: &[SqlValue],
    ) -> Result<usize> {
        let table = model
            .table(&statement.table)
            .ok_or_else(|| anyhow!("Unknown table {}", statement.table))?;
        let mut tables = self.tables.write();
        let owned: HashSet<usize> = owned_rows(&tables, model, table, root_ids)?
            .into_iter()
            .collect();
        if let Some(rows) = tables.get_mut(&table.name) {
            let mut index = 0;
            rows.retain(|_| {
                let keep = !owned.contains(&index);
                index += 1;
                keep
            });
        }
        drop(tables);

        if table.level == 0 {
            let deleted: HashSet<String> = root_ids.iter().map(SqlValue::index_key).collect();
            if let Some(known) = self.sources.write().get_mut(&table.name) {
                known.retain(|_, id| !deleted.contains(&id.index_key()));
            }
        }
        Ok(owned.len())
    }
}
