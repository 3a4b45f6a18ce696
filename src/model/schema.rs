use crate::error::ModelError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form `@`-prefixed annotations, carried verbatim onto tables and columns
pub type Annotations = BTreeMap<String, Value>;

/// Type name prefix of built-in scalar types
pub const BUILTIN_PREFIX: &str = "cds.";

/// A schema document keyed by type name
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub definitions: IndexMap<String, Definition>,
}

impl SchemaDefinition {
    pub fn get(&self, name: &str) -> Option<&Definition> {
        self.definitions.get(name)
    }

    /// Entity definitions in declaration order
    pub fn entities(&self) -> impl Iterator<Item = (&String, &Definition)> {
        self.definitions
            .iter()
            .filter(|(_, def)| def.kind == DefinitionKind::Entity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Entity,
    Aspect,
    Type,
    /// Services, actions, events and anything else that carries no storage
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDefinition", into = "RawDefinition")]
pub struct Definition {
    pub kind: DefinitionKind,
    /// Aspects whose elements are merged in front of this definition's own elements
    pub includes: Vec<String>,
    pub element: Element,
}

impl Definition {
    /// Named elements of a structured definition
    pub fn elements(&self) -> Option<&IndexMap<String, Element>> {
        match &self.element.shape {
            ElementShape::Structure(elements) => Some(elements),
            _ => None,
        }
    }
}

/// One node of the schema tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawElement", into = "RawElement")]
pub struct Element {
    pub shape: ElementShape,
    pub key: bool,
    pub is_virtual: bool,
    pub annotations: Annotations,
}

/// The closed set of element shapes. Deserialization guarantees that an
/// element carries exactly one of `type`, `items` or `elements`.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementShape {
    /// Built-in `cds.*` scalar
    Scalar { type_name: String, facets: Facets },
    /// Reference to another named definition
    TypeRef { type_name: String, facets: Facets },
    Association(AssociationDef),
    Items(Box<Element>),
    Structure(IndexMap<String, Element>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srid: Option<u32>,
}

impl Facets {
    /// Facets of `self` win over facets of `base`
    pub fn over(self, base: Facets) -> Facets {
        Facets {
            length: self.length.or(base.length),
            precision: self.precision.or(base.precision),
            scale: self.scale.or(base.scale),
            srid: self.srid.or(base.srid),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssociationDef {
    pub target: String,
    pub cardinality: Option<Cardinality>,
    /// Dotted path of the concrete association on the target that a virtual
    /// association mirrors
    pub backlink: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cardinality {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
}

impl Cardinality {
    pub fn is_to_many(&self) -> bool {
        match &self.max {
            Some(Value::String(max)) => max == "*",
            Some(Value::Number(max)) => max.as_u64().is_some_and(|max| max > 1),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawElement {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    items: Option<Box<Element>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elements: Option<IndexMap<String, Element>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    key: bool,
    #[serde(rename = "virtual", default, skip_serializing_if = "std::ops::Not::not")]
    is_virtual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cardinality: Option<Cardinality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backlink: Option<String>,
    #[serde(flatten)]
    facets: Facets,
    #[serde(flatten)]
    rest: BTreeMap<String, Value>,
}

fn is_association_type(type_name: &str) -> bool {
    matches!(type_name, "cds.Association" | "cds.Composition")
}

impl TryFrom<RawElement> for Element {
    type Error = ModelError;

    fn try_from(raw: RawElement) -> Result<Self, Self::Error> {
        let annotations: Annotations = raw
            .rest
            .into_iter()
            .filter(|(name, _)| name.starts_with('@'))
            .collect();

        let shape = match (raw.type_name, raw.items, raw.elements) {
            (Some(type_name), None, None) if is_association_type(&type_name) => {
                let target = raw.target.ok_or_else(|| ModelError::MissingTarget {
                    element: type_name.clone(),
                })?;
                ElementShape::Association(AssociationDef {
                    target,
                    cardinality: raw.cardinality,
                    backlink: raw.backlink,
                })
            }
            (Some(type_name), None, None) if type_name.starts_with(BUILTIN_PREFIX) => {
                ElementShape::Scalar {
                    type_name,
                    facets: raw.facets,
                }
            }
            (Some(type_name), None, None) => ElementShape::TypeRef {
                type_name,
                facets: raw.facets,
            },
            (None, Some(item), None) => ElementShape::Items(item),
            (None, None, Some(elements)) => ElementShape::Structure(elements),
            (type_name, items, elements) => {
                let found = [
                    type_name.map(|_| "type"),
                    items.map(|_| "items"),
                    elements.map(|_| "elements"),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(", ");
                return Err(ModelError::ElementShape { found });
            }
        };

        Ok(Element {
            shape,
            key: raw.key,
            is_virtual: raw.is_virtual,
            annotations,
        })
    }
}

impl From<Element> for RawElement {
    fn from(element: Element) -> Self {
        let mut raw = RawElement {
            key: element.key,
            is_virtual: element.is_virtual,
            rest: element.annotations,
            ..RawElement::default()
        };
        match element.shape {
            ElementShape::Scalar { type_name, facets }
            | ElementShape::TypeRef { type_name, facets } => {
                raw.type_name = Some(type_name);
                raw.facets = facets;
            }
            ElementShape::Association(assoc) => {
                raw.type_name = Some("cds.Association".to_string());
                raw.target = Some(assoc.target);
                raw.cardinality = assoc.cardinality;
                raw.backlink = assoc.backlink;
            }
            ElementShape::Items(item) => raw.items = Some(item),
            ElementShape::Structure(elements) => raw.elements = Some(elements),
        }
        raw
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDefinition {
    kind: DefinitionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    includes: Vec<String>,
    #[serde(flatten)]
    body: RawElement,
}

impl TryFrom<RawDefinition> for Definition {
    type Error = ModelError;

    fn try_from(raw: RawDefinition) -> Result<Self, Self::Error> {
        let mut body = raw.body;
        let shapeless =
            body.type_name.is_none() && body.items.is_none() && body.elements.is_none();
        if shapeless && (raw.kind == DefinitionKind::Other || raw.kind == DefinitionKind::Aspect) {
            body.elements = Some(IndexMap::new());
        }

        Ok(Definition {
            kind: raw.kind,
            includes: raw.includes,
            element: Element::try_from(body)?,
        })
    }
}

impl From<Definition> for RawDefinition {
    fn from(definition: Definition) -> Self {
        RawDefinition {
            kind: definition.kind,
            includes: definition.includes,
            body: definition.element.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn element_shapes_are_parsed_into_variants() {
        let element: Element = serde_json::from_value(json!({
            "type": "cds.String", "length": 40, "@Search.fuzzy": true
        }))
        .unwrap();
        assert_eq!(
            element.shape,
            ElementShape::Scalar {
                type_name: "cds.String".to_string(),
                facets: Facets {
                    length: Some(40),
                    ..Facets::default()
                }
            }
        );
        assert_eq!(element.annotations.get("@Search.fuzzy"), Some(&json!(true)));

        let element: Element = serde_json::from_value(json!({
            "type": "cds.Association", "target": "Organization", "cardinality": {"max": 1}
        }))
        .unwrap();
        match element.shape {
            ElementShape::Association(assoc) => {
                assert_eq!(assoc.target, "Organization");
                assert!(!assoc.cardinality.unwrap().is_to_many());
            }
            other => panic!("expected association, got {:?}", other),
        }

        let element: Element =
            serde_json::from_value(json!({ "items": { "type": "cds.String" } })).unwrap();
        assert!(matches!(element.shape, ElementShape::Items(_)));

        let element: Element = serde_json::from_value(json!({ "type": "Name" })).unwrap();
        assert!(matches!(element.shape, ElementShape::TypeRef { .. }));
    }

    #[test]
    fn element_with_two_shapes_is_rejected() {
        let result = serde_json::from_value::<Element>(json!({
            "type": "cds.String", "items": { "type": "cds.String" }
        }));
        let message = result.unwrap_err().to_string();
        assert!(message.contains("type, items"), "{}", message);

        assert!(serde_json::from_value::<Element>(json!({ "key": true })).is_err());
    }

    #[test]
    fn association_needs_target() {
        assert!(serde_json::from_value::<Element>(json!({ "type": "cds.Association" })).is_err());
    }

    #[test]
    fn definitions_keep_kind_and_includes() {
        let schema: SchemaDefinition = serde_json::from_value(json!({
            "definitions": {
                "Person": { "kind": "entity", "includes": ["Sourced"], "elements": {
                    "id": { "type": "cds.UUID", "key": true }
                }},
                "Sourced": { "kind": "aspect", "elements": {} },
                "Name": { "kind": "type", "type": "cds.String", "length": 60 },
                "Api": { "kind": "service" }
            }
        }))
        .unwrap();

        let person = schema.get("Person").unwrap();
        assert_eq!(person.kind, DefinitionKind::Entity);
        assert_eq!(person.includes, vec!["Sourced".to_string()]);
        assert!(person.elements().unwrap()["id"].key);
        assert_eq!(schema.get("Api").unwrap().kind, DefinitionKind::Other);
        assert_eq!(schema.entities().count(), 1);
    }
}
