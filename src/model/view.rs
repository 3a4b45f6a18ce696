use crate::model::Cardinality;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Maps the external field tree of one entity onto its storage locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub entity: String,
    /// Level 0 table of the entity
    pub table: String,
    /// External name of the key element, reserved on input
    pub key_field: String,
    pub fields: IndexMap<String, ViewNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "lowercase")]
pub enum ViewNode {
    /// Scalar stored in a column of the current table
    Column { column: String },
    /// Nested compound flattened into the current table
    Structure { fields: IndexMap<String, ViewNode> },
    /// Repeated element stored in a child table
    Collection { table: String, item: Box<ViewNode> },
    Association(AssociationView),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationView {
    /// Foreign key column; never stored for virtual associations
    pub column: String,
    pub target_entity: String,
    pub target_table: String,
    pub target_key_column: String,
    pub target_key_field: String,
    pub is_virtual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<Cardinality>,
}
