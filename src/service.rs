use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::error::DataError;
use crate::logic::{
    assemble, delete_plan, plan_writes, requested_sources, to_storage, FetchedRows, KnownSources,
    ReadPlan,
};
use crate::model::{CompiledModel, KeyGenerator, SqlValue, UuidKeys};
use crate::store::RowStore;

/// Writes, reads and deletes nested documents of one compiled schema
pub struct DocumentService<S: RowStore> {
    model: Arc<CompiledModel>,
    store: Arc<S>,
    keys: Arc<dyn KeyGenerator>,
}

impl<S: RowStore> DocumentService<S> {
    pub fn new(model: Arc<CompiledModel>, store: Arc<S>) -> Self {
        Self {
            model,
            store,
            keys: Arc::new(UuidKeys),
        }
    }

    pub fn with_keys(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    pub fn model(&self) -> &CompiledModel {
        &self.model
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Store a batch of documents and return them with their assigned ids.
    /// Objects whose source key is already persisted are replaced in place.
    pub async fn write(
        &self,
        documents: &IndexMap<String, Vec<Value>>,
    ) -> Result<IndexMap<String, Vec<Value>>> {
        let model = self.model.as_ref();

        let mut known = KnownSources::default();
        for (table, canonical) in requested_sources(model, documents) {
            for (key, id) in self.store.find_sources(&table, &canonical).await? {
                known.insert(&table, &key, id);
            }
        }
        debug!("Resolved {} persisted source keys", known.len());

        let plan = plan_writes(model, documents, self.keys.as_ref(), &known)?;

        for (table, ids) in &plan.replaced {
            let entity = model
                .storage
                .table(table)
                .map(|table| table.entity.clone())
                .ok_or_else(|| DataError::UnknownEntity(table.clone()))?;
            warn!("Replacing {} existing {} objects", ids.len(), entity);
            for statement in delete_plan(model, &entity)? {
                self.store
                    .delete(&model.storage, &statement, ids)
                    .await
                    .with_context(|| {
                        format!("Failed to delete replaced rows of {}", statement.table)
                    })?;
            }
        }

        for (name, rows) in &plan.tables {
            let table = model
                .storage
                .table(name)
                .ok_or_else(|| DataError::UnknownEntity(name.clone()))?;
            self.store
                .insert(table, rows)
                .await
                .with_context(|| format!("Failed to insert rows into {}", name))?;
        }
        self.store
            .record_sources(&plan.sources)
            .await
            .context("Failed to record source keys")?;

        info!(
            "Wrote {} documents as {} rows",
            plan.documents.values().map(Vec::len).sum::<usize>(),
            plan.row_count()
        );
        Ok(plan.documents)
    }

    /// Fetch documents by `{key field: id}` requests, in request order
    pub async fn read(
        &self,
        requests: &IndexMap<String, Vec<Value>>,
    ) -> Result<IndexMap<String, Vec<Value>>> {
        let model = self.model.as_ref();
        let mut result = IndexMap::new();
        for (entity, entity_requests) in requests {
            let ids = self.request_ids(entity, entity_requests)?;
            let plan = ReadPlan::new(model, entity)?;

            let mut fetched = FetchedRows::default();
            for statement in plan.selects(model) {
                let rows = self
                    .store
                    .select(&model.storage, &statement, &ids)
                    .await
                    .with_context(|| format!("Failed to select rows of {}", statement.table))?;
                fetched.tables.insert(statement.table, rows);
            }
            for query in &plan.backlinks {
                let pairs = self
                    .store
                    .select_backlinks(&model.storage, query, &ids)
                    .await
                    .with_context(|| format!("Failed to resolve {}", query.column))?;
                fetched.backlinks.insert(query.column.clone(), pairs);
            }

            let documents = assemble(model, entity, &ids, &fetched)?;
            info!("Read {} of {} requested {} objects", documents.len(), ids.len(), entity);
            result.insert(entity.clone(), documents);
        }
        Ok(result)
    }

    /// Delete objects and everything they contain; returns the number of deleted rows
    pub async fn delete(&self, requests: &IndexMap<String, Vec<Value>>) -> Result<usize> {
        let model = self.model.as_ref();
        let mut deleted = 0;
        for (entity, entity_requests) in requests {
            let ids = self.request_ids(entity, entity_requests)?;
            for statement in delete_plan(model, entity)? {
                deleted += self
                    .store
                    .delete(&model.storage, &statement, &ids)
                    .await
                    .with_context(|| format!("Failed to delete rows of {}", statement.table))?;
            }
            info!("Deleted {} {} objects", ids.len(), entity);
        }
        Ok(deleted)
    }

    fn request_ids(&self, entity: &str, requests: &[Value]) -> Result<Vec<SqlValue>, DataError> {
        let view = self
            .model
            .view(entity)
            .ok_or_else(|| DataError::UnknownEntity(entity.to_string()))?;
        let key_storage = self
            .model
            .storage
            .table(&view.table)
            .and_then(|table| table.columns.get(&table.key))
            .and_then(|column| column.storage)
            .ok_or_else(|| DataError::UnknownEntity(entity.to_string()))?;

        requests
            .iter()
            .map(|request| {
                let object = request.as_object().ok_or_else(|| DataError::ObjectExpected {
                    property: entity.to_string(),
                })?;
                let key = object.get(&view.key_field).ok_or_else(|| DataError::InvalidValue {
                    property: view.key_field.clone(),
                    reason: "missing".to_string(),
                })?;
                to_storage(key, &key_storage, &view.key_field)
            })
            .collect()
    }
}
