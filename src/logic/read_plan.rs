use indexmap::IndexMap;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::DataError;
use crate::logic::values::from_storage;
use crate::model::{
    quote, AssociationView, CompiledModel, Row, SqlTemplates, SqlValue, StorageModel, Table,
    ViewNode, ID_LIST_PLACEHOLDER,
};

/// A statement template addressed at one table, restricted by root ids
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStatement {
    pub table: String,
    pub sql: String,
}

impl TableStatement {
    pub fn bind(&self, count: usize) -> String {
        SqlTemplates::bind(&self.sql, count)
    }
}

/// Reverse lookup feeding a virtual association of the root table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacklinkQuery {
    /// Virtual column on the root table
    pub column: String,
    pub target_table: String,
    /// Concrete association column on the target table
    pub mirror: String,
    pub target_key: String,
    /// Selects (mirror, target key) pairs for a list of root ids
    pub sql: String,
}

/// Table traversal for reading or deleting objects of one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadPlan {
    pub entity: String,
    pub root_table: String,
    /// Children before their parents
    pub order: Vec<String>,
    pub backlinks: Vec<BacklinkQuery>,
}

impl ReadPlan {
    pub fn new(model: &CompiledModel, entity: &str) -> Result<Self, DataError> {
        let root = model
            .storage
            .entity_table(entity)
            .ok_or_else(|| DataError::UnknownEntity(entity.to_string()))?;

        let mut order = Vec::new();
        postorder(&model.storage, root, &mut order);

        let backlinks = root
            .columns
            .values()
            .filter(|column| column.is_virtual)
            .filter_map(|column| {
                let relation = column.relation.as_ref()?;
                let mirror = relation.mirrors.clone()?;
                let target_key = relation.target_key.clone()?;
                let target = quote(&relation.target);
                let sql = format!(
                    "SELECT {}.{}, {}.{} FROM {} WHERE {}.{} IN ({})",
                    target,
                    quote(&mirror),
                    target,
                    quote(&target_key),
                    target,
                    target,
                    quote(&mirror),
                    ID_LIST_PLACEHOLDER
                );
                Some(BacklinkQuery {
                    column: column.name.clone(),
                    target_table: relation.target.clone(),
                    mirror,
                    target_key,
                    sql,
                })
            })
            .collect();

        Ok(Self {
            entity: entity.to_string(),
            root_table: root.name.clone(),
            order,
            backlinks,
        })
    }

    pub fn selects(&self, model: &CompiledModel) -> Vec<TableStatement> {
        self.statements(model, |table| &table.templates.select)
    }

    pub fn deletes(&self, model: &CompiledModel) -> Vec<TableStatement> {
        self.statements(model, |table| &table.templates.delete)
    }

    fn statements(
        &self,
        model: &CompiledModel,
        template: impl Fn(&Table) -> &String,
    ) -> Vec<TableStatement> {
        self.order
            .iter()
            .filter_map(|name| model.storage.table(name))
            .map(|table| TableStatement {
                table: table.name.clone(),
                sql: template(table).clone(),
            })
            .collect()
    }
}

fn postorder(storage: &StorageModel, table: &Table, order: &mut Vec<String>) {
    for child in table.contains.iter().filter_map(|name| storage.table(name)) {
        postorder(storage, child, order);
    }
    order.push(table.name.clone());
}

/// Delete statements of an entity, deepest tables first
pub fn delete_plan(model: &CompiledModel, entity: &str) -> Result<Vec<TableStatement>, DataError> {
    Ok(ReadPlan::new(model, entity)?.deletes(model))
}

/// Rows fetched for one read plan
#[derive(Debug, Clone, Default)]
pub struct FetchedRows {
    /// Table -> rows in stored column order
    pub tables: HashMap<String, Vec<Row>>,
    /// Virtual column -> (root id, target id) pairs
    pub backlinks: HashMap<String, Vec<(SqlValue, SqlValue)>>,
}

/// Rebuild nested documents from per-table rows, in the order of `requested_ids`.
/// Ids without a root row are left out.
pub fn assemble(
    model: &CompiledModel,
    entity: &str,
    requested_ids: &[SqlValue],
    fetched: &FetchedRows,
) -> Result<Vec<Value>, DataError> {
    let view = model
        .view(entity)
        .ok_or_else(|| DataError::UnknownEntity(entity.to_string()))?;
    let plan = ReadPlan::new(model, entity)?;

    let mut items = HashMap::new();
    collection_items(&view.fields, &mut items);

    let mut assembler = Assembler {
        groups: HashMap::new(),
        backlinks: fetched
            .backlinks
            .iter()
            .map(|(column, pairs)| {
                let mut by_owner: HashMap<String, Vec<&SqlValue>> = HashMap::new();
                for (owner, target) in pairs {
                    by_owner.entry(owner.index_key()).or_default().push(target);
                }
                (column.as_str(), by_owner)
            })
            .collect(),
    };

    for name in &plan.order {
        let Some(table) = model.storage.table(name) else { continue };
        let rows = fetched.tables.get(name).map(Vec::as_slice).unwrap_or_default();
        let positions: HashMap<&str, usize> = table
            .stored_column_names()
            .into_iter()
            .enumerate()
            .map(|(position, column)| (column, position))
            .collect();
        let group_column = table.parent_key.as_deref().unwrap_or(&table.key);

        let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
        for row in rows {
            let cell = |column: &str| positions.get(column).and_then(|position| row.get(*position));
            let (Some(key), Some(group)) = (cell(&table.key), cell(group_column)) else {
                continue;
            };
            let ctx = RowCtx {
                row,
                positions: &positions,
                key: key.index_key(),
            };

            let value = if table.level == 0 {
                let mut object = Map::new();
                object.insert(view.key_field.clone(), from_storage(key));
                object.extend(assembler.object(&view.fields, &ctx));
                Some(Value::Object(object))
            } else {
                match items.get(name.as_str()) {
                    Some(ViewNode::Structure { fields }) => {
                        Some(Value::Object(assembler.object(fields, &ctx)))
                    }
                    Some(node) => assembler.node(node, &ctx),
                    None => None,
                }
            };
            if let Some(value) = value {
                groups.entry(group.index_key()).or_default().push(value);
            }
        }
        assembler.groups.insert(name.clone(), groups);
    }

    let mut roots = assembler.groups.remove(&plan.root_table).unwrap_or_default();
    let mut documents = Vec::with_capacity(requested_ids.len());
    for id in requested_ids {
        match roots.remove(&id.index_key()).and_then(|mut found| found.pop()) {
            Some(document) => documents.push(document),
            None => debug!("{} {} not found, omitted", entity, id),
        }
    }
    Ok(documents)
}

/// Item node of every collection table reachable from `fields`
fn collection_items<'v>(
    fields: &'v IndexMap<String, ViewNode>,
    out: &mut HashMap<&'v str, &'v ViewNode>,
) {
    fn visit<'v>(node: &'v ViewNode, out: &mut HashMap<&'v str, &'v ViewNode>) {
        match node {
            ViewNode::Structure { fields } => collection_items(fields, out),
            ViewNode::Collection { table, item } => {
                out.insert(table.as_str(), item);
                visit(item, out);
            }
            ViewNode::Column { .. } | ViewNode::Association(_) => {}
        }
    }
    for node in fields.values() {
        visit(node, out);
    }
}

struct RowCtx<'r> {
    row: &'r Row,
    positions: &'r HashMap<&'r str, usize>,
    /// Index key of the row's own key
    key: String,
}

impl RowCtx<'_> {
    fn cell(&self, column: &str) -> Option<&SqlValue> {
        self.positions
            .get(column)
            .and_then(|position| self.row.get(*position))
            .filter(|value| !value.is_null())
    }
}

struct Assembler<'f> {
    /// Table -> assembled objects grouped by owner key
    groups: HashMap<String, HashMap<String, Vec<Value>>>,
    /// Virtual column -> targets grouped by owner key
    backlinks: HashMap<&'f str, HashMap<String, Vec<&'f SqlValue>>>,
}

impl Assembler<'_> {
    fn object(&mut self, fields: &IndexMap<String, ViewNode>, ctx: &RowCtx) -> Map<String, Value> {
        let mut object = Map::new();
        for (name, node) in fields {
            if let Some(value) = self.node(node, ctx) {
                object.insert(name.clone(), value);
            }
        }
        object
    }

    fn node(&mut self, node: &ViewNode, ctx: &RowCtx) -> Option<Value> {
        match node {
            ViewNode::Column { column } => ctx.cell(column).map(from_storage),
            ViewNode::Structure { fields } => {
                let object = self.object(fields, ctx);
                (!object.is_empty()).then_some(Value::Object(object))
            }
            ViewNode::Collection { table, .. } => self
                .groups
                .get_mut(table)
                .and_then(|groups| groups.remove(&ctx.key))
                .filter(|items| !items.is_empty())
                .map(Value::Array),
            ViewNode::Association(assoc) if assoc.is_virtual => self.backlink(assoc, ctx),
            ViewNode::Association(assoc) => ctx
                .cell(&assoc.column)
                .map(|key| reference(assoc, key)),
        }
    }

    fn backlink(&self, assoc: &AssociationView, ctx: &RowCtx) -> Option<Value> {
        let targets = self.backlinks.get(assoc.column.as_str())?.get(&ctx.key)?;
        let single = assoc.cardinality.as_ref().is_some_and(|c| c.max.is_some() && !c.is_to_many());
        if single {
            targets.first().map(|key| reference(assoc, key))
        } else {
            Some(Value::Array(targets.iter().map(|key| reference(assoc, key)).collect()))
        }
    }
}

fn reference(assoc: &AssociationView, key: &SqlValue) -> Value {
    let mut object = Map::new();
    object.insert(assoc.target_key_field.clone(), from_storage(key));
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::logic::compile::compile;
    use crate::model::SchemaDefinition;
    use serde_json::json;

    fn model() -> CompiledModel {
        let schema: SchemaDefinition = serde_json::from_value(json!({ "definitions": {
            "Person": { "kind": "entity", "elements": {
                "id": { "type": "cds.UUID", "key": true },
                "name": { "type": "cds.String" },
                "address": { "elements": { "city": { "type": "cds.String" } } },
                "phones": { "items": { "elements": {
                    "number": { "type": "cds.String" },
                    "tags": { "items": { "type": "cds.String" } }
                }}},
                "employer": { "type": "cds.Association", "target": "Organization" }
            }},
            "Organization": { "kind": "entity", "elements": {
                "id": { "type": "cds.UUID", "key": true },
                "employees": { "type": "cds.Association", "target": "Person", "virtual": true }
            }}
        }}))
        .unwrap();
        compile(&schema, &CompilerConfig::default()).unwrap()
    }

    fn text(value: &str) -> SqlValue {
        SqlValue::from(value)
    }

    #[test]
    fn traversal_is_postorder() {
        let plan = ReadPlan::new(&model(), "Person").unwrap();
        assert_eq!(plan.root_table, "PERSON");
        assert_eq!(plan.order, vec!["PERSON_PHONES_TAGS", "PERSON_PHONES", "PERSON"]);
        assert!(plan.backlinks.is_empty());

        let deletes = delete_plan(&model(), "Person").unwrap();
        assert_eq!(deletes.len(), 3);
        assert_eq!(deletes[2].bind(2), "DELETE FROM \"PERSON\" WHERE \"ID\" IN (?, ?)");
        assert!(matches!(
            ReadPlan::new(&model(), "Robot"),
            Err(DataError::UnknownEntity(_))
        ));
    }

    #[test]
    fn backlink_queries_select_the_mirror_column() {
        let plan = ReadPlan::new(&model(), "Organization").unwrap();
        assert_eq!(plan.backlinks.len(), 1);
        let backlink = &plan.backlinks[0];
        assert_eq!(backlink.column, "EMPLOYEES");
        assert_eq!(backlink.mirror, "EMPLOYER");
        assert_eq!(
            backlink.sql,
            "SELECT \"PERSON\".\"EMPLOYER\", \"PERSON\".\"ID\" FROM \"PERSON\" \
             WHERE \"PERSON\".\"EMPLOYER\" IN ({ids})"
        );
    }

    #[test]
    fn rows_are_folded_into_documents() {
        let model = model();
        // PERSON: ID, NAME, ADDRESS_CITY, EMPLOYER
        let mut fetched = FetchedRows::default();
        fetched.tables.insert(
            "PERSON".into(),
            vec![
                vec![text("p1"), text("Ann"), text("Walldorf"), text("o1")],
                vec![text("p2"), text("Bob"), SqlValue::Null, SqlValue::Null],
            ],
        );
        // PERSON_PHONES: _ID, _PARENT, NUMBER
        fetched.tables.insert(
            "PERSON_PHONES".into(),
            vec![
                vec![text("ph1"), text("p1"), text("111")],
                vec![text("ph2"), text("p1"), text("222")],
            ],
        );
        // PERSON_PHONES_TAGS: _ID, _PARENT, VALUE
        fetched.tables.insert(
            "PERSON_PHONES_TAGS".into(),
            vec![vec![text("t1"), text("ph2"), text("work")]],
        );

        let requested = [text("p2"), text("missing"), text("p1")];
        let documents = assemble(&model, "Person", &requested, &fetched).unwrap();
        assert_eq!(
            documents,
            vec![
                json!({ "id": "p2", "name": "Bob" }),
                json!({
                    "id": "p1",
                    "name": "Ann",
                    "address": { "city": "Walldorf" },
                    "phones": [
                        { "number": "111" },
                        { "number": "222", "tags": ["work"] }
                    ],
                    "employer": { "id": "o1" }
                }),
            ]
        );
    }

    #[test]
    fn virtual_associations_list_referencing_objects() {
        let model = model();
        let mut fetched = FetchedRows::default();
        fetched
            .tables
            .insert("ORGANIZATION".into(), vec![vec![text("o1")], vec![text("o2")]]);
        fetched.backlinks.insert(
            "EMPLOYEES".into(),
            vec![(text("o1"), text("p1")), (text("o1"), text("p2"))],
        );

        let documents =
            assemble(&model, "Organization", &[text("o1"), text("o2")], &fetched).unwrap();
        assert_eq!(
            documents,
            vec![
                json!({ "id": "o1", "employees": [{ "id": "p1" }, { "id": "p2" }] }),
                json!({ "id": "o2" }),
            ]
        );
    }

    #[test]
    fn single_valued_virtual_association_yields_one_object() {
        let schema: SchemaDefinition = serde_json::from_value(json!({ "definitions": {
            "Account": { "kind": "entity", "elements": {
                "id": { "type": "cds.UUID", "key": true },
                "owner": { "type": "cds.Association", "target": "Profile", "virtual": true,
                           "cardinality": { "max": 1 } }
            }},
            "Profile": { "kind": "entity", "elements": {
                "id": { "type": "cds.UUID", "key": true },
                "account": { "type": "cds.Association", "target": "Account" }
            }}
        }}))
        .unwrap();
        let model = compile(&schema, &CompilerConfig::default()).unwrap();

        let mut fetched = FetchedRows::default();
        fetched
            .tables
            .insert("ACCOUNT".into(), vec![vec![text("a1")], vec![text("a2")]]);
        fetched
            .backlinks
            .insert("OWNER".into(), vec![(text("a1"), text("p1"))]);

        let documents = assemble(&model, "Account", &[text("a1"), text("a2")], &fetched).unwrap();
        assert_eq!(
            documents,
            vec![json!({ "id": "a1", "owner": { "id": "p1" } }), json!({ "id": "a2" })]
        );
    }

    #[test]
    fn empty_structures_and_collections_are_omitted() {
        let model = model();
        let mut fetched = FetchedRows::default();
        fetched.tables.insert(
            "PERSON".into(),
            vec![vec![text("p1"), text("Ann"), SqlValue::Null, SqlValue::Null]],
        );
        fetched
            .tables
            .insert("PERSON_PHONES".into(), vec![vec![text("ph1"), text("p1"), text("111")]]);
        // Null items of a scalar collection leave nothing behind
        fetched.tables.insert(
            "PERSON_PHONES_TAGS".into(),
            vec![vec![text("t1"), text("ph1"), SqlValue::Null]],
        );

        let documents = assemble(&model, "Person", &[text("p1")], &fetched).unwrap();
        assert_eq!(
            documents,
            vec![json!({ "id": "p1", "name": "Ann", "phones": [{ "number": "111" }] })]
        );
    }
}
