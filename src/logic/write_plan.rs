use indexmap::IndexMap;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::DataError;
use crate::logic::values::{canonical_json, from_storage, to_storage};
use crate::model::{AssociationView, CompiledModel, KeyGenerator, Row, SqlValue, Table, ViewNode};

/// Document field carrying the external identity of an object
pub const SOURCE_FIELD: &str = "source";

/// Rows of one table, laid out by a shared column position map
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableRows {
    /// Column name -> position inside each row
    pub columns: IndexMap<String, usize>,
    pub rows: Vec<Row>,
}

impl TableRows {
    /// Position of `column`, assigned on first use
    pub fn position(&mut self, column: &str) -> usize {
        let next = self.columns.len();
        *self.columns.entry(column.to_string()).or_insert(next)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let position = *self.columns.get(column)?;
        self.rows.get(row).and_then(|row| row.get(position))
    }
}

/// A source key that was resolved to a root object of this batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub table: String,
    pub canonical: String,
    pub id: SqlValue,
}

/// Everything the statement executor needs to apply one write batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WritePlan {
    /// Parents before children
    pub tables: IndexMap<String, TableRows>,
    /// Input documents with their assigned ids
    pub documents: IndexMap<String, Vec<Value>>,
    /// Root table -> ids of persisted objects that this batch replaces
    pub replaced: IndexMap<String, Vec<SqlValue>>,
    pub sources: Vec<SourceRecord>,
}

impl WritePlan {
    pub fn row_count(&self) -> usize {
        self.tables.values().map(|table| table.rows.len()).sum()
    }
}

/// Source keys already persisted by earlier batches, per root table
#[derive(Debug, Clone, Default)]
pub struct KnownSources {
    ids: HashMap<String, HashMap<String, SqlValue>>,
}

impl KnownSources {
    pub fn insert(&mut self, table: &str, canonical: &str, id: SqlValue) {
        self.ids
            .entry(table.to_string())
            .or_default()
            .insert(canonical.to_string(), id);
    }

    pub fn get(&self, table: &str, canonical: &str) -> Option<&SqlValue> {
        self.ids.get(table).and_then(|ids| ids.get(canonical))
    }

    pub fn len(&self) -> usize {
        self.ids.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    /// Referenced by an association, not yet seen as a root object
    Pending,
    /// Known from storage, not part of this batch
    Persisted,
    /// Root object of this batch
    Present,
}

#[derive(Debug, Clone)]
struct IdentityEntry {
    id: SqlValue,
    state: IdentityState,
}

/// Batch scoped map from (root table, canonical source key) to assigned ids
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: IndexMap<(String, String), IdentityEntry>,
}

impl IdentityMap {
    fn unresolved(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == IdentityState::Pending)
            .map(|((table, canonical), _)| format!("{}: {}", table, canonical))
            .collect()
    }
}

/// Canonical key of a `source` value, which must be a list holding one object
pub fn source_key(value: &Value, property: &str) -> Result<String, DataError> {
    match value.as_array().map(Vec::as_slice) {
        Some([item @ Value::Object(_)]) => Ok(canonical_json(item)),
        Some([_, _, ..]) => Err(DataError::MultipleSources {
            property: property.to_string(),
        }),
        _ => Err(DataError::MalformedSource {
            property: property.to_string(),
        }),
    }
}

/// All well formed source keys a batch mentions, per root table.
/// Used to prefetch `KnownSources` before planning.
pub fn requested_sources(
    model: &CompiledModel,
    documents: &IndexMap<String, Vec<Value>>,
) -> IndexMap<String, Vec<String>> {
    fn visit(
        fields: &IndexMap<String, ViewNode>,
        object: &Map<String, Value>,
        out: &mut IndexMap<String, Vec<String>>,
    ) {
        for (name, value) in object {
            if let Some(node) = fields.get(name) {
                visit_node(node, value, out);
            }
        }
    }

    fn visit_node(node: &ViewNode, value: &Value, out: &mut IndexMap<String, Vec<String>>) {
        match (node, value) {
            (ViewNode::Structure { fields }, Value::Object(object)) => visit(fields, object, out),
            (ViewNode::Collection { item, .. }, Value::Array(items)) => {
                for value in items {
                    visit_node(item, value, out);
                }
            }
            (ViewNode::Association(assoc), Value::Object(object)) if !assoc.is_virtual => {
                if let Some(Ok(canonical)) = object.get(SOURCE_FIELD).map(|s| source_key(s, "")) {
                    push(out, &assoc.target_table, canonical);
                }
            }
            _ => {}
        }
    }

    fn push(out: &mut IndexMap<String, Vec<String>>, table: &str, canonical: String) {
        let keys = out.entry(table.to_string()).or_default();
        if !keys.contains(&canonical) {
            keys.push(canonical);
        }
    }

    let mut out = IndexMap::new();
    for (entity, docs) in documents {
        let Some(view) = model.view(entity) else { continue };
        for object in docs.iter().filter_map(Value::as_object) {
            if let Some(Ok(canonical)) = object.get(SOURCE_FIELD).map(|s| source_key(s, "")) {
                push(&mut out, &view.table, canonical);
            }
            visit(&view.fields, object, &mut out);
        }
    }
    out
}

/// Turn a batch of nested documents into per-table rows.
/// Either the whole batch is planned or an error is returned.
pub fn plan_writes(
    model: &CompiledModel,
    documents: &IndexMap<String, Vec<Value>>,
    keys: &dyn KeyGenerator,
    known: &KnownSources,
) -> Result<WritePlan, DataError> {
    let mut planner = WritePlanner {
        model,
        keys,
        known,
        identities: IdentityMap::default(),
        plan: WritePlan::default(),
    };

    for (entity, docs) in documents {
        let mut planned = Vec::with_capacity(docs.len());
        for document in docs {
            planned.push(planner.plan_document(entity, document)?);
        }
        planner.plan.documents.insert(entity.clone(), planned);
    }

    let unresolved = planner.identities.unresolved();
    if !unresolved.is_empty() {
        return Err(DataError::UnresolvedReferences(unresolved));
    }

    let mut plan = planner.plan;
    for (name, rows) in plan.tables.iter_mut() {
        if let Some(table) = model.storage.table(name) {
            for column in table.stored_column_names() {
                rows.position(column);
            }
        }
        let width = rows.columns.len();
        for row in rows.rows.iter_mut() {
            row.resize(width, SqlValue::Null);
        }
    }

    debug!(
        "Planned {} rows in {} tables, {} replaced objects",
        plan.row_count(),
        plan.tables.len(),
        plan.replaced.values().map(Vec::len).sum::<usize>()
    );
    Ok(plan)
}

struct WritePlanner<'a> {
    model: &'a CompiledModel,
    keys: &'a dyn KeyGenerator,
    known: &'a KnownSources,
    identities: IdentityMap,
    plan: WritePlan,
}

impl<'a> WritePlanner<'a> {
    fn plan_document(&mut self, entity: &str, document: &Value) -> Result<Value, DataError> {
        let model = self.model;
        let (view, table) = model
            .view(entity)
            .and_then(|view| model.storage.table(&view.table).map(|table| (view, table)))
            .ok_or_else(|| DataError::UnknownEntity(entity.to_string()))?;
        let object = document.as_object().ok_or_else(|| DataError::ObjectExpected {
            property: entity.to_string(),
        })?;
        if object.contains_key(&view.key_field) {
            return Err(DataError::ReservedField {
                entity: entity.to_string(),
                property: view.key_field.clone(),
            });
        }

        let id = match object.get(SOURCE_FIELD) {
            Some(source) => self.resolve_root(table, source, entity)?,
            None => self.mint(table)?,
        };

        let mut row = Row::new();
        self.set(&mut row, table, &table.key, id.clone());
        self.write_fields(table, &view.fields, object, &mut row, &id, entity, true)?;
        self.push_row(table, row);

        let mut response = object.clone();
        response.insert(view.key_field.clone(), from_storage(&id));
        Ok(Value::Object(response))
    }

    fn resolve_root(
        &mut self,
        table: &Table,
        source: &Value,
        entity: &str,
    ) -> Result<SqlValue, DataError> {
        let property = format!("{}.{}", entity, SOURCE_FIELD);
        let canonical = source_key(source, &property)?;
        let key = (table.name.clone(), canonical.clone());

        let existing = self.identities.entries.get_mut(&key).map(|entry| {
            let previous = entry.state;
            entry.state = IdentityState::Present;
            (entry.id.clone(), previous)
        });

        let id = match existing {
            Some((_, IdentityState::Present)) => {
                return Err(DataError::DuplicateSource {
                    entity: entity.to_string(),
                    source_key: canonical,
                })
            }
            Some((id, IdentityState::Persisted)) => {
                self.replace(table, id.clone());
                id
            }
            Some((id, IdentityState::Pending)) => id,
            None => {
                let known = self.known;
                let id = match known.get(&table.name, &canonical) {
                    Some(id) => {
                        self.replace(table, id.clone());
                        id.clone()
                    }
                    None => self.mint(table)?,
                };
                self.identities.entries.insert(
                    key,
                    IdentityEntry {
                        id: id.clone(),
                        state: IdentityState::Present,
                    },
                );
                id
            }
        };

        self.plan.sources.push(SourceRecord {
            table: table.name.clone(),
            canonical,
            id: id.clone(),
        });
        Ok(id)
    }

    /// Id of the object an association `source` points at; unseen keys stay pending
    fn resolve_reference(
        &mut self,
        target: &Table,
        source: &Value,
        property: &str,
    ) -> Result<SqlValue, DataError> {
        let canonical = source_key(source, property)?;
        let key = (target.name.clone(), canonical);
        if let Some(entry) = self.identities.entries.get(&key) {
            return Ok(entry.id.clone());
        }

        let known = self.known;
        let entry = match known.get(&target.name, &key.1) {
            Some(id) => IdentityEntry {
                id: id.clone(),
                state: IdentityState::Persisted,
            },
            None => IdentityEntry {
                id: self.mint(target)?,
                state: IdentityState::Pending,
            },
        };
        let id = entry.id.clone();
        self.identities.entries.insert(key, entry);
        Ok(id)
    }

    /// A new key for `table`, held to the key column's range and length
    fn mint(&self, table: &Table) -> Result<SqlValue, DataError> {
        let id = self.keys.next_key(table);
        match table.columns.get(&table.key).and_then(|column| column.storage) {
            Some(storage) => {
                let property = format!("{}.{}", table.name, table.key);
                to_storage(&from_storage(&id), &storage, &property)
            }
            None => Ok(id),
        }
    }

    fn replace(&mut self, table: &Table, id: SqlValue) {
        self.plan.replaced.entry(table.name.clone()).or_default().push(id);
    }

    #[allow(clippy::too_many_arguments)]
    fn write_fields(
        &mut self,
        table: &Table,
        fields: &IndexMap<String, ViewNode>,
        object: &Map<String, Value>,
        row: &mut Row,
        owner: &SqlValue,
        path: &str,
        root: bool,
    ) -> Result<(), DataError> {
        for (name, value) in object {
            // Undeclared root `source` only identifies the object
            if root && name == SOURCE_FIELD && !fields.contains_key(name) {
                continue;
            }
            let property = format!("{}.{}", path, name);
            let node = fields.get(name).ok_or_else(|| DataError::UnknownProperty {
                entity: table.entity.clone(),
                property: property.clone(),
            })?;
            self.write_node(table, node, value, row, owner, &property)?;
        }
        Ok(())
    }

    fn write_node(
        &mut self,
        table: &Table,
        node: &ViewNode,
        value: &Value,
        row: &mut Row,
        owner: &SqlValue,
        property: &str,
    ) -> Result<(), DataError> {
        match node {
            ViewNode::Column { column } => {
                let storage = table
                    .columns
                    .get(column)
                    .and_then(|column| column.storage)
                    .ok_or_else(|| DataError::ReadOnlyProperty {
                        property: property.to_string(),
                    })?;
                let value = to_storage(value, &storage, property)?;
                self.set(row, table, column, value);
            }
            ViewNode::Structure { fields } => match value {
                Value::Null => {}
                Value::Object(object) => {
                    self.write_fields(table, fields, object, row, owner, property, false)?
                }
                _ => {
                    return Err(DataError::ObjectExpected {
                        property: property.to_string(),
                    })
                }
            },
            ViewNode::Collection { table: child, item } => match value {
                Value::Null => {}
                Value::Array(items) => {
                    let model = self.model;
                    let child = model
                        .storage
                        .table(child)
                        .ok_or_else(|| DataError::UnknownEntity(child.clone()))?;
                    for item_value in items {
                        self.write_item(child, item, item_value, owner, property)?;
                    }
                }
                _ => {
                    return Err(DataError::ArrayExpected {
                        property: property.to_string(),
                    })
                }
            },
            ViewNode::Association(assoc) => {
                let id = self.association_value(assoc, value, property)?;
                self.set(row, table, &assoc.column, id);
            }
        }
        Ok(())
    }

    /// One child row at the next level, linked to `owner`
    fn write_item(
        &mut self,
        child: &Table,
        item: &ViewNode,
        value: &Value,
        owner: &SqlValue,
        property: &str,
    ) -> Result<(), DataError> {
        let id = self.mint(child)?;
        let mut row = Row::new();
        self.set(&mut row, child, &child.key, id.clone());
        if let Some(parent_key) = &child.parent_key {
            self.set(&mut row, child, parent_key, owner.clone());
        }
        match (item, value) {
            (ViewNode::Structure { fields }, Value::Object(object)) => {
                self.write_fields(child, fields, object, &mut row, &id, property, false)?
            }
            (ViewNode::Structure { .. }, _) => {
                return Err(DataError::ObjectExpected {
                    property: property.to_string(),
                })
            }
            (node, value) => self.write_node(child, node, value, &mut row, &id, property)?,
        }
        self.push_row(child, row);
        Ok(())
    }

    fn association_value(
        &mut self,
        assoc: &AssociationView,
        value: &Value,
        property: &str,
    ) -> Result<SqlValue, DataError> {
        if assoc.is_virtual {
            return Err(DataError::ReadOnlyProperty {
                property: property.to_string(),
            });
        }
        let object = match value {
            Value::Null => return Ok(SqlValue::Null),
            Value::Object(object) => object,
            _ => {
                return Err(DataError::ObjectExpected {
                    property: property.to_string(),
                })
            }
        };
        let model = self.model;
        let target = model
            .storage
            .table(&assoc.target_table)
            .ok_or_else(|| DataError::UnknownEntity(assoc.target_entity.clone()))?;

        match (object.get(SOURCE_FIELD), object.get(&assoc.target_key_field)) {
            (Some(source), None) => {
                let property = format!("{}.{}", property, SOURCE_FIELD);
                self.resolve_reference(target, source, &property)
            }
            (None, Some(key)) => {
                let storage = target
                    .columns
                    .get(&assoc.target_key_column)
                    .and_then(|column| column.storage)
                    .ok_or_else(|| DataError::ReadOnlyProperty {
                        property: property.to_string(),
                    })?;
                to_storage(key, &storage, property)
            }
            _ => Err(DataError::MalformedAssociation {
                property: property.to_string(),
                key_field: assoc.target_key_field.clone(),
            }),
        }
    }

    fn set(&mut self, row: &mut Row, table: &Table, column: &str, value: SqlValue) {
        let position = self.plan.tables.entry(table.name.clone()).or_default().position(column);
        if row.len() <= position {
            row.resize(position + 1, SqlValue::Null);
        }
        row[position] = value;
    }

    fn push_row(&mut self, table: &Table, row: Row) {
        self.plan.tables.entry(table.name.clone()).or_default().rows.push(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::logic::compile::compile;
    use crate::model::{SchemaDefinition, SequentialKeys, UuidKeys};
    use serde_json::json;
    use std::collections::HashSet;

    fn model() -> CompiledModel {
        let schema: SchemaDefinition = serde_json::from_value(json!({ "definitions": {
            "Person": { "kind": "entity", "elements": {
                "id": { "type": "cds.UUID", "key": true },
                "firstName": { "type": "cds.String", "length": 40 },
                "lastName": { "type": "cds.String", "length": 40 },
                "address": { "elements": {
                    "street": { "type": "cds.String" },
                    "city": { "type": "cds.String" }
                }},
                "phones": { "items": { "elements": {
                    "number": { "type": "cds.String" },
                    "tags": { "items": { "type": "cds.String" } }
                }}},
                "employer": { "type": "cds.Association", "target": "Organization" }
            }},
            "Organization": { "kind": "entity", "elements": {
                "id": { "type": "cds.UUID", "key": true },
                "name": { "type": "cds.String" },
                "employees": { "type": "cds.Association", "target": "Person", "virtual": true }
            }}
        }}))
        .unwrap();
        compile(&schema, &CompilerConfig::default()).unwrap()
    }

    fn batch(value: Value) -> IndexMap<String, Vec<Value>> {
        serde_json::from_value(value).unwrap()
    }

    fn plan(value: Value) -> Result<WritePlan, DataError> {
        plan_writes(&model(), &batch(value), &SequentialKeys::new("k"), &KnownSources::default())
    }

    #[test]
    fn children_point_at_their_owner() {
        let plan = plan(json!({ "Person": [{
            "firstName": "John",
            "address": { "city": "Walldorf" },
            "phones": [
                { "number": "1", "tags": ["home", "main"] },
                { "number": "2", "tags": ["work"] }
            ]
        }]}))
        .unwrap();

        let person = &plan.tables["PERSON"];
        assert_eq!(person.rows.len(), 1);
        assert_eq!(person.columns["ID"], 0);
        let person_id = person.value(0, "ID").unwrap().clone();
        assert_eq!(person.value(0, "ADDRESS_CITY"), Some(&SqlValue::from("Walldorf")));
        assert_eq!(person.value(0, "ADDRESS_STREET"), Some(&SqlValue::Null));

        let phones = &plan.tables["PERSON_PHONES"];
        assert_eq!(phones.rows.len(), 2);
        assert_eq!(phones.columns["_ID"], 0);
        assert_eq!(phones.columns["_PARENT"], 1);
        let phone_ids: HashSet<String> = (0..2)
            .map(|row| {
                assert_eq!(phones.value(row, "_PARENT"), Some(&person_id));
                phones.value(row, "_ID").unwrap().index_key()
            })
            .collect();

        let tags = &plan.tables["PERSON_PHONES_TAGS"];
        assert_eq!(tags.rows.len(), 3);
        for row in 0..3 {
            let parent = tags.value(row, "_PARENT").unwrap().index_key();
            assert!(phone_ids.contains(&parent));
        }
        assert_eq!(tags.value(2, "VALUE"), Some(&SqlValue::from("work")));

        // Parents are listed before their children
        let order: Vec<&str> = plan.tables.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["PERSON", "PERSON_PHONES", "PERSON_PHONES_TAGS"]);

        assert_eq!(plan.documents["Person"][0]["id"], from_storage(&person_id));
    }

    #[test]
    fn rows_are_padded_to_the_stored_columns() {
        let plan = plan(json!({ "Person": [{ "firstName": "A" }, { "lastName": "B" }] })).unwrap();
        let model = model();
        let width = model.storage.table("PERSON").unwrap().stored_column_names().len();
        let person = &plan.tables["PERSON"];
        assert_eq!(person.columns.len(), width);
        assert!(person.rows.iter().all(|row| row.len() == width));
        assert_eq!(person.columns["FIRSTNAME"], 1);
        assert_eq!(person.columns["LASTNAME"], 2);
    }

    #[test]
    fn shared_source_references_mint_one_target() {
        let plan = plan(json!({
            "Person": [
                { "firstName": "A",
                  "employer": { "source": [{ "sid": "acme", "system": "crm" }] } },
                { "firstName": "B", "employer": { "source": [{ "system": "crm", "sid": "acme" }] } }
            ],
            "Organization": [
                { "name": "ACME", "source": [{ "sid": "acme", "system": "crm" }] }
            ]
        }))
        .unwrap();

        let org = &plan.tables["ORGANIZATION"];
        assert_eq!(org.rows.len(), 1);
        let org_id = org.value(0, "ID").unwrap();
        let person = &plan.tables["PERSON"];
        assert_eq!(person.value(0, "EMPLOYER"), Some(org_id));
        assert_eq!(person.value(1, "EMPLOYER"), Some(org_id));
        assert_eq!(plan.sources.len(), 1);
        assert!(plan.replaced.is_empty());
    }

    #[test]
    fn unresolved_references_name_the_key_set() {
        let err = plan(json!({ "Person": [
            { "firstName": "A", "employer": { "source": [{ "sid": "ghost" }] } }
        ]}))
        .unwrap_err();
        assert_eq!(
            err,
            DataError::UnresolvedReferences(vec![r#"ORGANIZATION: {"sid":"ghost"}"#.to_string()])
        );

        // Order within the batch does not matter
        let ok = plan(json!({
            "Organization": [{ "name": "Ghost", "source": [{ "sid": "ghost" }] }],
            "Person": [{ "firstName": "A", "employer": { "source": [{ "sid": "ghost" }] } }]
        }));
        assert!(ok.is_ok());
    }

    #[test]
    fn reserved_key_field_is_rejected() {
        let err = plan(json!({ "Person": [{ "id": "x", "firstName": "A", "lastName": "B" }] }))
            .unwrap_err();
        assert_eq!(
            err,
            DataError::ReservedField {
                entity: "Person".into(),
                property: "id".into()
            }
        );
    }

    #[test]
    fn duplicate_root_source_is_rejected() {
        let err = plan(json!({ "Organization": [
            { "name": "A", "source": [{ "sid": "1" }] },
            { "name": "B", "source": [{ "sid": "1" }] }
        ]}))
        .unwrap_err();
        assert!(matches!(err, DataError::DuplicateSource { .. }));
    }

    #[test]
    fn known_sources_reuse_persisted_ids() {
        let mut known = KnownSources::default();
        known.insert("ORGANIZATION", r#"{"sid":"acme"}"#, SqlValue::from("org-1"));
        let documents = batch(json!({
            "Person": [{ "employer": { "source": [{ "sid": "acme" }] } }],
            "Organization": [{ "name": "ACME", "source": [{ "sid": "acme" }] }]
        }));
        let plan = plan_writes(&model(), &documents, &SequentialKeys::new("k"), &known).unwrap();

        assert_eq!(plan.tables["PERSON"].value(0, "EMPLOYER"), Some(&SqlValue::from("org-1")));
        assert_eq!(plan.tables["ORGANIZATION"].value(0, "ID"), Some(&SqlValue::from("org-1")));
        assert_eq!(plan.replaced["ORGANIZATION"], vec![SqlValue::from("org-1")]);

        // A reference to a persisted object alone is resolved too
        let documents = batch(json!({ "Person": [
            { "employer": { "source": [{ "sid": "acme" }] } }
        ]}));
        let plan = plan_writes(&model(), &documents, &SequentialKeys::new("k"), &known).unwrap();
        assert!(plan.replaced.is_empty());
        assert!(!plan.tables.contains_key("ORGANIZATION"));
    }

    #[test]
    fn explicit_foreign_keys_are_taken_as_is() {
        let plan = plan(json!({ "Person": [{ "employer": { "id": "org-7" } }] })).unwrap();
        assert_eq!(plan.tables["PERSON"].value(0, "EMPLOYER"), Some(&SqlValue::from("org-7")));

        let err = plan_writes(
            &model(),
            &batch(json!({ "Person": [{ "employer": { "name": "ACME" } }] })),
            &SequentialKeys::new("k"),
            &KnownSources::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DataError::MalformedAssociation { .. }));
    }

    #[test]
    fn shape_mismatches_are_reported() {
        let cases = [
            (json!({ "Person": [{ "phones": { "number": "1" } }] }), "array"),
            (json!({ "Person": [{ "address": "Main St" }] }), "object"),
            (json!({ "Person": [{ "firstName": ["A"] }] }), "scalar"),
            (json!({ "Person": [{ "nickname": "A" }] }), "unknown"),
            (json!({ "Organization": [{ "employees": [{ "id": "p" }] }] }), "read-only"),
            (json!({ "Organization": [{ "source": [{ "a": 1 }, { "b": 2 }] }] }), "multiple"),
            (json!({ "Organization": [{ "source": { "a": 1 } }] }), "malformed"),
            (json!({ "Robot": [{}] }), "entity"),
        ];
        for (documents, expected) in cases {
            let err = plan(documents).unwrap_err();
            let matched = match expected {
                "array" => matches!(err, DataError::ArrayExpected { .. }),
                "object" => matches!(err, DataError::ObjectExpected { .. }),
                "scalar" => matches!(err, DataError::ScalarExpected { .. }),
                "unknown" => matches!(err, DataError::UnknownProperty { .. }),
                "read-only" => matches!(err, DataError::ReadOnlyProperty { .. }),
                "multiple" => matches!(err, DataError::MultipleSources { .. }),
                "malformed" => matches!(err, DataError::MalformedSource { .. }),
                _ => matches!(err, DataError::UnknownEntity(_)),
            };
            assert!(matched, "expected {} error, got {:?}", expected, err);
        }
    }

    #[test]
    fn requested_sources_cover_roots_and_references() {
        let documents = batch(json!({
            "Person": [
                { "employer": { "source": [{ "sid": "acme" }] } },
                { "employer": { "source": [{ "sid": "acme" }] }, "source": [{ "pid": 1 }] }
            ]
        }));
        let sources = requested_sources(&model(), &documents);
        assert_eq!(sources["ORGANIZATION"], vec![r#"{"sid":"acme"}"#.to_string()]);
        assert_eq!(sources["PERSON"], vec![r#"{"pid":1}"#.to_string()]);
    }

    #[test]
    fn unsourced_documents_always_get_fresh_ids() {
        let plan = plan(json!({ "Organization": [
            { "name": "A", "source": [{ "sid": "1" }] },
            { "name": "A" },
            { "name": "A" }
        ]}))
        .unwrap();

        let org = &plan.tables["ORGANIZATION"];
        assert_eq!(org.rows.len(), 3);
        let ids: HashSet<String> = (0..3)
            .map(|row| org.value(row, "ID").unwrap().index_key())
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(plan.sources.len(), 1);
        assert_eq!(plan.sources[0].id, *org.value(0, "ID").unwrap());
    }

    #[test]
    fn declared_source_is_stored_with_the_object() {
        let schema: SchemaDefinition = serde_json::from_value(json!({ "definitions": {
            "Sourced": { "kind": "aspect", "elements": {
                "source": { "items": { "elements": {
                    "type": { "type": "cds.String" },
                    "sid": { "type": "cds.String" }
                }}}
            }},
            "Contract": { "kind": "entity", "includes": ["Sourced"], "elements": {
                "id": { "type": "cds.UUID", "key": true },
                "title": { "type": "cds.String" }
            }}
        }}))
        .unwrap();
        let model = compile(&schema, &CompilerConfig::default()).unwrap();
        let documents = batch(json!({ "Contract": [
            { "title": "Lease", "source": [{ "type": "crm", "sid": "1" }] }
        ]}));
        let keys = SequentialKeys::new("k");
        let plan = plan_writes(&model, &documents, &keys, &KnownSources::default()).unwrap();

        let contract_id = plan.tables["CONTRACT"].value(0, "ID").unwrap().clone();
        let source = &plan.tables["CONTRACT_SOURCE"];
        assert_eq!(source.rows.len(), 1);
        assert_eq!(source.value(0, "_PARENT"), Some(&contract_id));
        assert_eq!(source.value(0, "SID"), Some(&SqlValue::from("1")));
        assert_eq!(plan.sources.len(), 1);
        assert_eq!(plan.sources[0].canonical, r#"{"sid":"1","type":"crm"}"#);
    }

    #[test]
    fn minted_keys_respect_the_key_column() {
        let schema: SchemaDefinition = serde_json::from_value(json!({ "definitions": {
            "Counter": { "kind": "entity", "elements": {
                "id": { "type": "cds.Integer", "key": true },
                "label": { "type": "cds.String" }
            }}
        }}))
        .unwrap();
        let model = compile(&schema, &CompilerConfig::default()).unwrap();
        let documents = batch(json!({ "Counter": [{ "label": "a" }, { "label": "b" }] }));

        let plan = plan_writes(&model, &documents, &UuidKeys, &KnownSources::default()).unwrap();
        for row in 0..2 {
            match plan.tables["COUNTER"].value(row, "ID") {
                Some(SqlValue::Int(id)) => assert!((0..=i32::MAX as i64).contains(id)),
                other => panic!("unexpected key {:?}", other),
            }
        }

        // Text keys cannot go into an integer column
        let keys = SequentialKeys::new("k");
        let err = plan_writes(&model, &documents, &keys, &KnownSources::default()).unwrap_err();
        assert!(matches!(
            err,
            DataError::InvalidValue { ref property, .. } if property == "COUNTER.ID"
        ));
    }
}
