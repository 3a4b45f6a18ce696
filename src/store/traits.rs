use crate::logic::{BacklinkQuery, SourceRecord, TableRows, TableStatement};
use crate::model::{Row, SqlValue, StorageModel, Table};
use anyhow::Result;

/// Executes planned statements against physical storage
#[async_trait::async_trait]
pub trait RowStore: Send + Sync {
    /// Persisted ids for canonical source keys of a root table; unknown keys are left out
    async fn find_sources(
        &self,
        table: &str,
        canonical: &[String],
    ) -> Result<Vec<(String, SqlValue)>>;
    async fn record_sources(&self, records: &[SourceRecord]) -> Result<()>;
    async fn insert(&self, table: &Table, rows: &TableRows) -> Result<usize>;
    /// Rows of the statement's table owned by `root_ids`, in stored column order
    async fn select(
        &self,
        model: &StorageModel,
        statement: &TableStatement,
        root_ids: &[SqlValue],
    ) -> Result<Vec<Row>>;
    /// (root id, target id) pairs of objects pointing at `root_ids`
    async fn select_backlinks(
        &self,
        model: &StorageModel,
        query: &BacklinkQuery,
        root_ids: &[SqlValue],
    ) -> Result<Vec<(SqlValue, SqlValue)>>;
    async fn delete(
        &self,
        model: &StorageModel,
        statement: &TableStatement,
        root_ids: &[SqlValue],
    ) -> Result<usize>;
}
