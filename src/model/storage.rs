use crate::model::{Annotations, Cardinality};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder for the id list in select and delete templates
pub const ID_LIST_PLACEHOLDER: &str = "{ids}";

/// The compiled table graph of a schema
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageModel {
    pub tables: IndexMap<String, Table>,
    /// Entity type name -> level 0 table name
    pub entities: IndexMap<String, String>,
}

impl StorageModel {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn entity_table(&self, entity: &str) -> Option<&Table> {
        self.entities.get(entity).and_then(|name| self.tables.get(name))
    }

    /// Parent chain of a table, nearest first, ending at the level 0 table
    pub fn ancestors(&self, table: &Table) -> Vec<&Table> {
        let mut chain = Vec::new();
        let mut current = table.parent.as_deref().and_then(|name| self.table(name));
        while let Some(parent) = current {
            chain.push(parent);
            current = parent.parent.as_deref().and_then(|name| self.table(name));
        }
        chain
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    /// Entity type that owns this table
    pub entity: String,
    /// Nesting depth, 0 for the entity root
    pub level: usize,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub columns: IndexMap<String, Column>,
    /// Child tables owned through containment
    pub contains: Vec<String>,
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
    pub templates: SqlTemplates,
}

impl Table {
    pub fn new(name: String, entity: String, level: usize, key: String) -> Self {
        Self {
            name,
            entity,
            level,
            key,
            parent_key: None,
            parent: None,
            columns: IndexMap::new(),
            contains: Vec::new(),
            annotations: Annotations::new(),
            templates: SqlTemplates::default(),
        }
    }

    /// Columns that are physically stored, in declaration order
    pub fn stored_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.values().filter(|column| !column.is_virtual)
    }

    pub fn stored_column_names(&self) -> Vec<&str> {
        self.stored_columns().map(|column| column.name.as_str()).collect()
    }

    /// Positional INSERT for rows laid out by `positions`
    pub fn insert_statement(&self, positions: &IndexMap<String, usize>) -> String {
        let columns = positions
            .iter()
            .sorted_by_key(|(_, position)| **position)
            .map(|(name, _)| quote(name))
            .join(", ");
        let params = std::iter::repeat("?").take(positions.len()).join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&self.name),
            columns,
            params
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// None for virtual columns, which are never stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageType>,
    /// Field path from the owning table's row object
    pub external_path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

impl Column {
    pub fn stored(name: String, storage: StorageType, external_path: Vec<String>) -> Self {
        Self {
            name,
            storage: Some(storage),
            external_path,
            relation: None,
            is_virtual: false,
            annotations: Annotations::new(),
        }
    }

    pub fn is_containment(&self) -> bool {
        matches!(&self.relation, Some(rel) if rel.kind == RelationKind::Containment)
    }

    pub fn is_association(&self) -> bool {
        matches!(&self.relation, Some(rel) if rel.kind == RelationKind::Association)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Containment,
    Association,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub kind: RelationKind,
    /// Target table name
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<Cardinality>,
    /// Key column of the target table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_key: Option<String>,
    /// Concrete column on the target table a virtual association mirrors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirrors: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlType {
    Nvarchar,
    Nclob,
    Boolean,
    Tinyint,
    Smallint,
    Integer,
    Bigint,
    Decimal,
    Double,
    Date,
    Time,
    Seconddate,
    Timestamp,
    Varbinary,
    Blob,
    StPoint,
    StGeometry,
}

impl SqlType {
    pub fn is_spatial(self) -> bool {
        matches!(self, SqlType::StPoint | SqlType::StGeometry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageType {
    pub sql_type: SqlType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srid: Option<u32>,
}

impl StorageType {
    pub fn plain(sql_type: SqlType) -> Self {
        Self {
            sql_type,
            length: None,
            precision: None,
            scale: None,
            srid: None,
        }
    }

    pub fn with_length(sql_type: SqlType, length: u32) -> Self {
        Self {
            length: Some(length),
            ..Self::plain(sql_type)
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.sql_type {
            SqlType::Nvarchar => "NVARCHAR",
            SqlType::Nclob => "NCLOB",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Tinyint => "TINYINT",
            SqlType::Smallint => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::Bigint => "BIGINT",
            SqlType::Decimal => "DECIMAL",
            SqlType::Double => "DOUBLE",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Seconddate => "SECONDDATE",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Varbinary => "VARBINARY",
            SqlType::Blob => "BLOB",
            SqlType::StPoint => "ST_POINT",
            SqlType::StGeometry => "ST_GEOMETRY",
        };
        write!(f, "{}", name)?;
        match (self.length, self.precision, self.scale, self.srid) {
            (Some(length), _, _, _) => write!(f, "({})", length),
            (_, Some(precision), Some(scale), _) => write!(f, "({}, {})", precision, scale),
            (_, Some(precision), None, _) => write!(f, "({})", precision),
            (_, _, _, Some(srid)) => write!(f, "({})", srid),
            _ => Ok(()),
        }
    }
}

/// Precompiled statements restricted by the level 0 key list
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SqlTemplates {
    pub select: String,
    pub delete: String,
}

impl SqlTemplates {
    /// Expand the id placeholder of `template` to `count` positional parameters
    pub fn bind(template: &str, count: usize) -> String {
        let params = std::iter::repeat("?").take(count.max(1)).join(", ");
        template.replace(ID_LIST_PLACEHOLDER, &params)
    }
}

pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_types_render_facets() {
        assert_eq!(
            StorageType::with_length(SqlType::Nvarchar, 36).to_string(),
            "NVARCHAR(36)"
        );
        let decimal = StorageType {
            precision: Some(10),
            scale: Some(2),
            ..StorageType::plain(SqlType::Decimal)
        };
        assert_eq!(decimal.to_string(), "DECIMAL(10, 2)");
        let point = StorageType {
            srid: Some(4326),
            ..StorageType::plain(SqlType::StPoint)
        };
        assert_eq!(point.to_string(), "ST_POINT(4326)");
        assert_eq!(StorageType::plain(SqlType::Double).to_string(), "DOUBLE");
    }

    #[test]
    fn bind_expands_placeholder() {
        let sql = SqlTemplates::bind("DELETE FROM \"T\" WHERE \"ID\" IN ({ids})", 3);
        assert_eq!(sql, "DELETE FROM \"T\" WHERE \"ID\" IN (?, ?, ?)");
    }

    #[test]
    fn insert_statement_follows_positions() {
        let table = Table::new("PERSON".into(), "Person".into(), 0, "ID".into());
        let mut positions = IndexMap::new();
        positions.insert("NAME".to_string(), 1);
        positions.insert("ID".to_string(), 0);
        assert_eq!(
            table.insert_statement(&positions),
            "INSERT INTO \"PERSON\" (\"ID\", \"NAME\") VALUES (?, ?)"
        );
    }
}
