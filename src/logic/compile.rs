use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, info};
use std::collections::{HashMap, HashSet};

use crate::config::CompilerConfig;
use crate::error::ModelError;
use crate::logic::naming::NameRegistry;
use crate::model::{
    quote, AssociationDef, AssociationView, Column, CompiledModel, DefinitionKind, Element,
    ElementShape, EntityView, Facets, Relation, RelationKind, SchemaDefinition, SqlTemplates,
    SqlType, StorageModel, StorageType, Table, ViewNode, ID_LIST_PLACEHOLDER,
};

/// Registry path of the generated key column of child tables
const CHILD_KEY_PATH: &str = "$id";
/// Registry path of the parent key column of child tables
const PARENT_KEY_PATH: &str = "$parent";
/// Registry path of the single value column of an array of scalars
const VALUE_PATH: &str = "$value";
const SYSTEM_PREFIX: &str = "_";

/// Compile a schema into its storage model and entity views
pub fn compile(
    schema: &SchemaDefinition,
    config: &CompilerConfig,
) -> Result<CompiledModel, ModelError> {
    let schema_hash = CompiledModel::schema_hash(schema)
        .map_err(|e| ModelError::SchemaHash(format!("{:#}", e)))?;
    let mut compiler = SchemaCompiler::new(schema, config);

    // Pass 0: root tables and keys, so associations can point forward
    let mut roots = Vec::new();
    for (entity, _) in schema.entities() {
        let elements = merged_elements(schema, entity)?;
        compiler.declare_entity(entity, &elements)?;
        roots.push((entity.clone(), elements));
    }

    // Pass 1: element trees
    for (entity, elements) in &roots {
        compiler.compile_entity(entity, elements)?;
    }

    // Pass 2: virtual associations need the whole table graph
    compiler.resolve_backlinks()?;

    // Pass 3: statement templates
    let names: Vec<String> = compiler.storage.tables.keys().cloned().collect();
    for name in names {
        let templates = build_templates(&compiler.storage, &name);
        if let Some(table) = compiler.storage.tables.get_mut(&name) {
            table.templates = templates;
        }
    }

    info!(
        "Compiled {} entities into {} tables",
        compiler.views.len(),
        compiler.storage.tables.len()
    );

    Ok(CompiledModel {
        schema_hash,
        storage: compiler.storage,
        views: compiler.views,
    })
}

#[derive(Debug, Clone)]
struct EntityInfo {
    table: String,
    key_field: String,
    key_column: String,
    key_storage: StorageType,
}

#[derive(Debug, Clone)]
struct PendingBacklink {
    entity: String,
    element: String,
    table: String,
    column: String,
    target_table: String,
    backlink: Option<String>,
}

/// Position of the compiler inside the table graph
#[derive(Debug, Clone)]
struct TableCtx {
    entity: String,
    table: String,
    level: usize,
    /// External path from the entity root to this table's collection
    table_path: Vec<String>,
}

/// Element shape after following type references
enum Resolved<'e> {
    Scalar(StorageType),
    Association(&'e AssociationDef),
    Items(&'e Element),
    Structure(&'e IndexMap<String, Element>),
}

struct SchemaCompiler<'a> {
    schema: &'a SchemaDefinition,
    config: &'a CompilerConfig,
    table_names: NameRegistry,
    column_names: HashMap<String, NameRegistry>,
    entities: HashMap<String, EntityInfo>,
    storage: StorageModel,
    views: IndexMap<String, EntityView>,
    backlinks: Vec<PendingBacklink>,
}

impl<'a> SchemaCompiler<'a> {
    fn new(schema: &'a SchemaDefinition, config: &'a CompilerConfig) -> Self {
        Self {
            schema,
            config,
            table_names: NameRegistry::new(config.max_identifier_length, config.max_segment_length),
            column_names: HashMap::new(),
            entities: HashMap::new(),
            storage: StorageModel::default(),
            views: IndexMap::new(),
            backlinks: Vec::new(),
        }
    }

    fn register_column(
        &mut self,
        table: &str,
        path: &[String],
        prefix: &str,
        element: Option<&Element>,
    ) -> String {
        let config = self.config;
        let registry = self
            .column_names
            .entry(table.to_string())
            .or_insert_with(|| {
                NameRegistry::new(config.max_identifier_length, config.max_segment_length)
            });
        if path.is_empty() {
            return registry.register(&[VALUE_PATH], prefix, element);
        }
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        registry.register(&segments, prefix, element)
    }

    fn declare_entity(
        &mut self,
        entity: &str,
        elements: &IndexMap<String, Element>,
    ) -> Result<(), ModelError> {
        let keys: Vec<(&String, &Element)> = elements
            .iter()
            .filter(|(_, element)| element.key)
            .collect();
        let [(key_field, key_element)] = keys.as_slice() else {
            return Err(ModelError::KeyCardinality {
                entity: entity.to_string(),
                found: keys.len(),
            });
        };

        let element_name = format!("{}.{}", entity, key_field);
        let key_storage = match resolve(self.schema, self.config, &element_name, *key_element)? {
            Resolved::Scalar(storage) => storage,
            _ => {
                return Err(ModelError::UnsupportedShape {
                    element: element_name,
                    reason: "keys must be scalar",
                })
            }
        };

        let table = self.table_names.register(&[entity], "", None);
        let key_column =
            self.register_column(&table, &[key_field.to_string()], "", Some(*key_element));
        debug!("Entity {} -> table {} keyed by {}", entity, table, key_column);

        self.entities.insert(
            entity.to_string(),
            EntityInfo {
                table,
                key_field: key_field.to_string(),
                key_column,
                key_storage,
            },
        );
        Ok(())
    }

    fn entity_info(&self, element: &str, target: &str) -> Result<EntityInfo, ModelError> {
        if let Some(info) = self.entities.get(target) {
            return Ok(info.clone());
        }
        match self.schema.get(target) {
            Some(_) => Err(ModelError::NotAnEntity {
                element: element.to_string(),
                name: target.to_string(),
            }),
            None => Err(ModelError::UnknownType {
                element: element.to_string(),
                type_name: target.to_string(),
            }),
        }
    }

    fn compile_entity(
        &mut self,
        entity: &str,
        elements: &IndexMap<String, Element>,
    ) -> Result<(), ModelError> {
        let info = self.entity_info(entity, entity)?;
        let mut table = Table::new(
            info.table.clone(),
            entity.to_string(),
            0,
            info.key_column.clone(),
        );
        if let Some(definition) = self.schema.get(entity) {
            table.annotations = definition.element.annotations.clone();
        }
        self.storage.tables.insert(info.table.clone(), table);
        self.storage.entities.insert(entity.to_string(), info.table.clone());

        let ctx = TableCtx {
            entity: entity.to_string(),
            table: info.table.clone(),
            level: 0,
            table_path: vec![entity.to_string()],
        };
        let fields = self.compile_elements(&ctx, elements, &[])?;

        self.views.insert(
            entity.to_string(),
            EntityView {
                entity: entity.to_string(),
                table: info.table,
                key_field: info.key_field,
                fields,
            },
        );
        Ok(())
    }

    fn compile_elements(
        &mut self,
        ctx: &TableCtx,
        elements: &IndexMap<String, Element>,
        path: &[String],
    ) -> Result<IndexMap<String, ViewNode>, ModelError> {
        let mut fields = IndexMap::new();
        for (name, element) in elements {
            let mut element_path = path.to_vec();
            element_path.push(name.clone());
            let node = self.compile_element(ctx, element, &element_path)?;
            fields.insert(name.clone(), node);
        }
        Ok(fields)
    }

    /// Compile one element found at `path` inside the rows of `ctx.table`.
    /// An empty path stands for the item of an array.
    fn compile_element(
        &mut self,
        ctx: &TableCtx,
        element: &Element,
        path: &[String],
    ) -> Result<ViewNode, ModelError> {
        let element_name = ctx.table_path.iter().chain(path).join(".");
        match resolve(self.schema, self.config, &element_name, element)? {
            Resolved::Scalar(storage) => {
                let name = self.register_column(&ctx.table, path, "", Some(element));
                let mut column = Column::stored(name.clone(), storage, path.to_vec());
                column.annotations = element.annotations.clone();
                self.add_column(&ctx.table, column);
                Ok(ViewNode::Column { column: name })
            }
            Resolved::Association(assoc) => {
                self.compile_association(ctx, element, assoc, path, &element_name)
            }
            Resolved::Items(item) => self.compile_items(ctx, element, item, path, &element_name),
            Resolved::Structure(elements) => {
                let fields = self.compile_elements(ctx, elements, path)?;
                Ok(ViewNode::Structure { fields })
            }
        }
    }

    fn compile_association(
        &mut self,
        ctx: &TableCtx,
        element: &Element,
        assoc: &AssociationDef,
        path: &[String],
        element_name: &str,
    ) -> Result<ViewNode, ModelError> {
        let target = self.entity_info(element_name, &assoc.target)?;
        let name = self.register_column(&ctx.table, path, "", Some(element));

        let mut column = Column {
            name: name.clone(),
            storage: Some(target.key_storage),
            external_path: path.to_vec(),
            relation: Some(Relation {
                kind: RelationKind::Association,
                target: target.table.clone(),
                cardinality: assoc.cardinality.clone(),
                target_key: Some(target.key_column.clone()),
                mirrors: None,
            }),
            is_virtual: false,
            annotations: element.annotations.clone(),
        };

        if element.is_virtual {
            if ctx.level > 0 {
                return Err(ModelError::VirtualBelowRoot {
                    entity: ctx.entity.clone(),
                    element: element_name.to_string(),
                });
            }
            column.storage = None;
            column.is_virtual = true;
            self.backlinks.push(PendingBacklink {
                entity: ctx.entity.clone(),
                element: element_name.to_string(),
                table: ctx.table.clone(),
                column: name.clone(),
                target_table: target.table.clone(),
                backlink: assoc.backlink.clone(),
            });
        }
        self.add_column(&ctx.table, column);

        Ok(ViewNode::Association(AssociationView {
            column: name,
            target_entity: assoc.target.clone(),
            target_table: target.table,
            target_key_column: target.key_column,
            target_key_field: target.key_field,
            is_virtual: element.is_virtual,
            cardinality: assoc.cardinality.clone(),
        }))
    }

    fn compile_items(
        &mut self,
        ctx: &TableCtx,
        element: &Element,
        item: &Element,
        path: &[String],
        element_name: &str,
    ) -> Result<ViewNode, ModelError> {
        if path.is_empty() {
            return Err(ModelError::UnsupportedShape {
                element: element_name.to_string(),
                reason: "arrays of arrays",
            });
        }

        let mut table_path = ctx.table_path.clone();
        table_path.extend(path.iter().cloned());
        let segments: Vec<&str> = table_path.iter().map(String::as_str).collect();
        let child_name = self.table_names.register(&segments, "", Some(element));

        let parent_key_storage = self
            .storage
            .table(&ctx.table)
            .and_then(|table| table.columns.get(&table.key))
            .and_then(|column| column.storage)
            .unwrap_or(StorageType::with_length(SqlType::Nvarchar, 36));

        let key = self.register_column(
            &child_name,
            &[CHILD_KEY_PATH.to_string()],
            SYSTEM_PREFIX,
            None,
        );
        let parent_key = self.register_column(
            &child_name,
            &[PARENT_KEY_PATH.to_string()],
            SYSTEM_PREFIX,
            None,
        );

        let mut child = Table::new(
            child_name.clone(),
            ctx.entity.clone(),
            ctx.level + 1,
            key.clone(),
        );
        child.parent = Some(ctx.table.clone());
        child.parent_key = Some(parent_key.clone());
        child.annotations = item.annotations.clone();
        child.columns.insert(
            key.clone(),
            Column::stored(key, StorageType::with_length(SqlType::Nvarchar, 36), Vec::new()),
        );
        child
            .columns
            .insert(parent_key.clone(), Column::stored(parent_key, parent_key_storage, Vec::new()));
        self.storage.tables.insert(child_name.clone(), child);
        debug!("Collection {} -> table {} at level {}", element_name, child_name, ctx.level + 1);

        let containment = self.register_column(&ctx.table, path, "", Some(element));
        self.add_column(
            &ctx.table,
            Column {
                name: containment,
                storage: None,
                external_path: path.to_vec(),
                relation: Some(Relation {
                    kind: RelationKind::Containment,
                    target: child_name.clone(),
                    cardinality: None,
                    target_key: None,
                    mirrors: None,
                }),
                is_virtual: true,
                annotations: element.annotations.clone(),
            },
        );
        if let Some(parent) = self.storage.tables.get_mut(&ctx.table) {
            parent.contains.push(child_name.clone());
        }

        let child_ctx = TableCtx {
            entity: ctx.entity.clone(),
            table: child_name.clone(),
            level: ctx.level + 1,
            table_path,
        };
        let item_node = self.compile_element(&child_ctx, item, &[])?;

        Ok(ViewNode::Collection {
            table: child_name,
            item: Box::new(item_node),
        })
    }

    fn add_column(&mut self, table: &str, column: Column) {
        if let Some(table) = self.storage.tables.get_mut(table) {
            table.columns.insert(column.name.clone(), column);
        }
    }

    fn resolve_backlinks(&mut self) -> Result<(), ModelError> {
        for pending in std::mem::take(&mut self.backlinks) {
            let candidates: Vec<(String, String)> = self
                .storage
                .table(&pending.target_table)
                .map(|target| {
                    target
                        .columns
                        .values()
                        .filter(|column| !column.is_virtual)
                        .filter(|column| column.is_association())
                        .filter(|column| {
                            column.relation.as_ref().is_some_and(|rel| rel.target == pending.table)
                        })
                        .map(|column| (column.name.clone(), column.external_path.join(".")))
                        .collect()
                })
                .unwrap_or_default();

            let matching: Vec<&(String, String)> = match &pending.backlink {
                Some(backlink) => candidates.iter().filter(|(_, path)| path == backlink).collect(),
                None => candidates.iter().collect(),
            };

            let mirrored = match matching.as_slice() {
                [(column, _)] => column.clone(),
                [] => {
                    return Err(ModelError::BacklinkNotFound {
                        entity: pending.entity,
                        element: pending.element,
                        target: pending.target_table,
                    })
                }
                _ => {
                    return Err(ModelError::AmbiguousBacklink {
                        entity: pending.entity,
                        element: pending.element,
                        target: pending.target_table,
                        candidates: matching.iter().map(|(_, path)| path.clone()).collect(),
                    })
                }
            };

            debug!(
                "Virtual association {} mirrors {}.{}",
                pending.element, pending.target_table, mirrored
            );
            if let Some(relation) = self
                .storage
                .tables
                .get_mut(&pending.table)
                .and_then(|table| table.columns.get_mut(&pending.column))
                .and_then(|column| column.relation.as_mut())
            {
                relation.mirrors = Some(mirrored);
            }
        }
        Ok(())
    }
}

/// Elements of an entity with the elements of its includes merged in front
fn merged_elements(
    schema: &SchemaDefinition,
    entity: &str,
) -> Result<IndexMap<String, Element>, ModelError> {
    fn collect(
        schema: &SchemaDefinition,
        owner: &str,
        name: &str,
        visiting: &mut HashSet<String>,
        into: &mut IndexMap<String, Element>,
    ) -> Result<(), ModelError> {
        if !visiting.insert(name.to_string()) {
            return Err(ModelError::AliasCycle {
                type_name: name.to_string(),
            });
        }
        let definition = schema.get(name).ok_or_else(|| ModelError::UnknownType {
            element: owner.to_string(),
            type_name: name.to_string(),
        })?;
        for include in &definition.includes {
            collect(schema, owner, include, visiting, into)?;
        }
        let elements = definition.elements().ok_or_else(|| ModelError::BadInclude {
            entity: owner.to_string(),
            name: name.to_string(),
        })?;
        for (element_name, element) in elements {
            into.insert(element_name.clone(), element.clone());
        }
        visiting.remove(name);
        Ok(())
    }

    let mut elements = IndexMap::new();
    collect(schema, entity, entity, &mut HashSet::new(), &mut elements)?;
    Ok(elements)
}

/// Follow type references until a concrete shape is reached
fn resolve<'e>(
    schema: &'e SchemaDefinition,
    config: &CompilerConfig,
    element_name: &str,
    element: &'e Element,
) -> Result<Resolved<'e>, ModelError> {
    let mut facets = Facets::default();
    let mut visited = HashSet::new();
    let mut current = element;
    loop {
        match &current.shape {
            ElementShape::Scalar { type_name, facets: own } => {
                let facets = facets.over(*own);
                return storage_type(type_name, facets, config).map(Resolved::Scalar).ok_or_else(|| {
                    ModelError::UnknownType {
                        element: element_name.to_string(),
                        type_name: type_name.clone(),
                    }
                });
            }
            ElementShape::TypeRef { type_name, facets: own } => {
                facets = facets.over(*own);
                if !visited.insert(type_name.as_str()) {
                    return Err(ModelError::AliasCycle {
                        type_name: type_name.clone(),
                    });
                }
                let definition = schema.get(type_name).ok_or_else(|| ModelError::UnknownType {
                    element: element_name.to_string(),
                    type_name: type_name.clone(),
                })?;
                if definition.kind == DefinitionKind::Other {
                    return Err(ModelError::UnknownType {
                        element: element_name.to_string(),
                        type_name: type_name.clone(),
                    });
                }
                current = &definition.element;
            }
            ElementShape::Association(assoc) => return Ok(Resolved::Association(assoc)),
            ElementShape::Items(item) => return Ok(Resolved::Items(item)),
            ElementShape::Structure(elements) => return Ok(Resolved::Structure(elements)),
        }
    }
}

/// Map a built-in scalar type to its storage type
pub fn storage_type(
    type_name: &str,
    facets: Facets,
    config: &CompilerConfig,
) -> Option<StorageType> {
    let storage = match type_name {
        "cds.UUID" => StorageType::with_length(SqlType::Nvarchar, 36),
        "cds.String" => StorageType::with_length(
            SqlType::Nvarchar,
            facets.length.unwrap_or(config.default_string_length),
        ),
        "cds.LargeString" => StorageType::plain(SqlType::Nclob),
        "cds.Boolean" => StorageType::plain(SqlType::Boolean),
        "cds.UInt8" => StorageType::plain(SqlType::Tinyint),
        "cds.Int16" => StorageType::plain(SqlType::Smallint),
        "cds.Integer" | "cds.Int32" => StorageType::plain(SqlType::Integer),
        "cds.Integer64" | "cds.Int64" => StorageType::plain(SqlType::Bigint),
        "cds.Decimal" => match (facets.precision, facets.scale) {
            (None, None) => StorageType::plain(SqlType::Decimal),
            (precision, scale) => StorageType {
                precision: Some(precision.unwrap_or(config.default_decimal_precision)),
                scale: Some(scale.unwrap_or(0)),
                ..StorageType::plain(SqlType::Decimal)
            },
        },
        "cds.Double" => StorageType::plain(SqlType::Double),
        "cds.Date" => StorageType::plain(SqlType::Date),
        "cds.Time" => StorageType::plain(SqlType::Time),
        "cds.DateTime" => StorageType::plain(SqlType::Seconddate),
        "cds.Timestamp" => StorageType::plain(SqlType::Timestamp),
        "cds.Binary" => StorageType::with_length(
            SqlType::Varbinary,
            facets.length.unwrap_or(config.default_binary_length),
        ),
        "cds.LargeBinary" => StorageType::plain(SqlType::Blob),
        "cds.hana.ST_POINT" => StorageType {
            srid: Some(facets.srid.unwrap_or(config.default_srid)),
            ..StorageType::plain(SqlType::StPoint)
        },
        "cds.hana.ST_GEOMETRY" => StorageType {
            srid: Some(facets.srid.unwrap_or(config.default_srid)),
            ..StorageType::plain(SqlType::StGeometry)
        },
        _ => return None,
    };
    Some(storage)
}

/// Select and delete statements of a table, restricted by level 0 keys.
/// Nested tables join their whole ancestor chain up to the entity root.
fn build_templates(model: &StorageModel, name: &str) -> SqlTemplates {
    let Some(table) = model.table(name) else {
        return SqlTemplates::default();
    };
    let table_name = quote(&table.name);
    let columns = table
        .stored_columns()
        .map(|column| format!("{}.{}", table_name, quote(&column.name)))
        .join(", ");

    let ancestors = model.ancestors(table);
    let Some(root) = ancestors.last().copied() else {
        return SqlTemplates {
            select: format!(
                "SELECT {} FROM {} WHERE {}.{} IN ({})",
                columns,
                table_name,
                table_name,
                quote(&table.key),
                ID_LIST_PLACEHOLDER
            ),
            delete: format!(
                "DELETE FROM {} WHERE {} IN ({})",
                table_name,
                quote(&table.key),
                ID_LIST_PLACEHOLDER
            ),
        };
    };

    let root_filter = format!(
        "{}.{} IN ({})",
        quote(&root.name),
        quote(&root.key),
        ID_LIST_PLACEHOLDER
    );
    // child -> parent pairs from this table up to the root
    let chain: Vec<&Table> = std::iter::once(table).chain(ancestors.iter().copied()).collect();
    let joins = |from: usize| {
        chain[from..]
            .iter()
            .tuple_windows()
            .map(|(child, parent)| {
                format!(
                    "JOIN {} ON {}.{} = {}.{}",
                    quote(&parent.name),
                    quote(&child.name),
                    quote(child.parent_key.as_deref().unwrap_or_default()),
                    quote(&parent.name),
                    quote(&parent.key)
                )
            })
            .join(" ")
    };

    let select = format!(
        "SELECT {} FROM {} {} WHERE {}",
        columns,
        table_name,
        joins(0),
        root_filter
    );
    let parent_key = quote(table.parent_key.as_deref().unwrap_or_default());
    let delete = if table.level == 1 {
        format!("DELETE FROM {} WHERE {} IN ({})", table_name, parent_key, ID_LIST_PLACEHOLDER)
    } else {
        let parent = chain[1];
        format!(
            "DELETE FROM {} WHERE {} IN (SELECT {}.{} FROM {} {} WHERE {})",
            table_name,
            parent_key,
            quote(&parent.name),
            quote(&parent.key),
            quote(&parent.name),
            joins(1),
            root_filter
        )
    };

    SqlTemplates { select, delete }
}
