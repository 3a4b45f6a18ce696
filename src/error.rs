use thiserror::Error;

/// Schema compilation failures. The schema is rejected as a whole.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("element must carry exactly one of type, items or elements, found [{found}]")]
    ElementShape { found: String },
    #[error("entity '{entity}' must have exactly one key element, found {found}")]
    KeyCardinality { entity: String, found: usize },
    #[error("unknown type '{type_name}' referenced by '{element}'")]
    UnknownType { element: String, type_name: String },
    #[error("type alias cycle through '{type_name}'")]
    AliasCycle { type_name: String },
    #[error("'{name}' referenced by '{element}' is not an entity")]
    NotAnEntity { element: String, name: String },
    #[error("element '{element}' is not supported: {reason}")]
    UnsupportedShape {
        element: String,
        reason: &'static str,
    },
    #[error("association '{element}' has no target")]
    MissingTarget { element: String },
    #[error("included definition '{name}' of '{entity}' has no elements")]
    BadInclude { entity: String, name: String },
    #[error("schema could not be hashed: {0}")]
    SchemaHash(String),
    #[error("virtual association '{element}' is only allowed at the root level of '{entity}'")]
    VirtualBelowRoot { entity: String, element: String },
    #[error(
        "virtual association '{element}' of '{entity}': no association on '{target}' points back"
    )]
    BacklinkNotFound {
        entity: String,
        element: String,
        target: String,
    },
    #[error(
        "virtual association '{element}' of '{entity}' is ambiguous, \
         candidates on '{target}': {candidates:?}"
    )]
    AmbiguousBacklink {
        entity: String,
        element: String,
        target: String,
        candidates: Vec<String>,
    },
}

/// Document level failures raised while planning writes or assembling reads.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("unknown object type '{0}'")]
    UnknownEntity(String),
    #[error("unknown property '{property}' on '{entity}'")]
    UnknownProperty { entity: String, property: String },
    #[error("reserved property '{property}' must not be supplied on '{entity}'")]
    ReservedField { entity: String, property: String },
    #[error("property '{property}' is read-only")]
    ReadOnlyProperty { property: String },
    #[error("property '{property}' expects an array")]
    ArrayExpected { property: String },
    #[error("property '{property}' expects an object")]
    ObjectExpected { property: String },
    #[error("property '{property}' expects a scalar value")]
    ScalarExpected { property: String },
    #[error("invalid value for '{property}': {reason}")]
    InvalidValue { property: String, reason: String },
    #[error("source of '{property}' must be a list with one key object")]
    MalformedSource { property: String },
    #[error("multiple source keys on '{property}' are not supported")]
    MultipleSources { property: String },
    #[error("association '{property}' needs either '{key_field}' or 'source'")]
    MalformedAssociation { property: String, key_field: String },
    #[error("object with source {source_key} of '{entity}' supplied twice")]
    DuplicateSource { entity: String, source_key: String },
    #[error("unresolved references: {}", .0.join(", "))]
    UnresolvedReferences(Vec<String>),
}
