//! # Node Types
//!
//! A node type declares which properties a node may carry, whether it is a
//! root type, whether it can be instantiated at all, and which tethered
//! child nodes are created together with it. It also declares the named
//! references its nodes may hold to other nodes, each with an optional
//! limit on the number of targets and typed properties per reference.
//!
//! ```json
//! {
//!   "name": "Acme:Page",
//!   "properties": { "title": { "type": "string", "defaultValue": "" } },
//!   "childNodes": { "main": "Acme:ContentCollection" },
//!   "references": { "author": { "maxItems": 1, "properties": { "role": { "type": "string" } } } }
//! }
//! ```
//!
//! The built-in root type `Neos.ContentRepository:Root` is always present.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{NodeName, NodeTypeName, PropertyValues, ReferenceName};

/// The declared type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
    Any,
}

impl PropertyType {
    /// Returns true if the JSON value is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PropertyType::String => value.is_string(),
            PropertyType::Integer => value.is_i64() || value.is_u64(),
            PropertyType::Float => value.is_number(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Array => value.is_array(),
            PropertyType::Object => value.is_object(),
            PropertyType::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Integer => "integer",
            PropertyType::Float => "float",
            PropertyType::Boolean => "boolean",
            PropertyType::Array => "array",
            PropertyType::Object => "object",
            PropertyType::Any => "any",
        }
    }
}

/// One declared property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// One declared reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDefinition {
    /// Upper bound on the number of targets; unbounded if absent
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Properties carried by each reference edge
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
}

impl ReferenceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// Declares a property of the reference edge.
    pub fn with_property(mut self, name: impl Into<String>, property_type: PropertyType) -> Self {
        self.properties.insert(
            name.into(),
            PropertyDefinition {
                property_type,
                default_value: None,
            },
        );
        self
    }
}

/// A node type as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTypeDefinition {
    pub name: NodeTypeName,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub root: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
    /// Tethered children: node name to node type
    #[serde(default)]
    pub child_nodes: BTreeMap<NodeName, NodeTypeName>,
    #[serde(default)]
    pub references: BTreeMap<ReferenceName, ReferenceDefinition>,
}

impl NodeTypeDefinition {
    /// A concrete, non-root node type without properties.
    pub fn new(name: NodeTypeName) -> Self {
        Self {
            name,
            is_abstract: false,
            root: false,
            properties: BTreeMap::new(),
            child_nodes: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    /// Declares a property.
    pub fn with_property(mut self, name: impl Into<String>, property_type: PropertyType) -> Self {
        self.properties.insert(
            name.into(),
            PropertyDefinition {
                property_type,
                default_value: None,
            },
        );
        self
    }

    /// Declares a property with a default value.
    pub fn with_default(mut self, name: impl Into<String>, property_type: PropertyType, default: Value) -> Self {
        self.properties.insert(
            name.into(),
            PropertyDefinition {
                property_type,
                default_value: Some(default),
            },
        );
        self
    }

    /// Declares a tethered child node.
    pub fn with_child_node(mut self, name: NodeName, node_type: NodeTypeName) -> Self {
        self.child_nodes.insert(name, node_type);
        self
    }

    /// Declares a reference.
    pub fn with_reference(mut self, name: ReferenceName, definition: ReferenceDefinition) -> Self {
        self.references.insert(name, definition);
        self
    }

    /// Marks the type as a root type.
    pub fn as_root(mut self) -> Self {
        self.root = true;
        self
    }

    /// Marks the type as abstract.
    pub fn as_abstract(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}

/// Registry of all configured node types.
#[derive(Debug, Clone, Default)]
pub struct NodeTypeManager {
    types: BTreeMap<NodeTypeName, NodeTypeDefinition>,
}

impl NodeTypeManager {
    /// Builds the registry and adds the built-in root type.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for duplicate types or tethered children of unknown
    /// type.
    pub fn new(definitions: Vec<NodeTypeDefinition>) -> Result<Self> {
        let mut types = BTreeMap::new();
        for definition in definitions {
            let name = definition.name.clone();
            if types.insert(name.clone(), definition).is_some() {
                return Err(Error::Config(format!("node type '{name}' defined twice")));
            }
        }
        types
            .entry(NodeTypeName::root())
            .or_insert_with(|| NodeTypeDefinition::new(NodeTypeName::root()).as_root());

        for definition in types.values() {
            for (child_name, child_type) in &definition.child_nodes {
                if !types.contains_key(child_type) {
                    return Err(Error::Config(format!(
                        "tethered child '{child_name}' of '{}' has unknown node type '{child_type}'",
                        definition.name
                    )));
                }
            }
        }

        Ok(Self { types })
    }

    /// Looks up a node type.
    pub fn get(&self, name: &NodeTypeName) -> Result<&NodeTypeDefinition> {
        self.types
            .get(name)
            .ok_or_else(|| Error::NodeTypeNotFound(name.to_string()))
    }

    /// Returns true if the node type is configured.
    pub fn has(&self, name: &NodeTypeName) -> bool {
        self.types.contains_key(name)
    }

    /// Requires a concrete root node type.
    pub fn require_root_type(&self, name: &NodeTypeName) -> Result<&NodeTypeDefinition> {
        let definition = self.get(name)?;
        if definition.is_abstract {
            return Err(Error::NodeTypeIsAbstract(name.to_string()));
        }
        if !definition.root {
            return Err(Error::NodeTypeIsNotOfTypeRoot(name.to_string()));
        }
        Ok(definition)
    }

    /// Requires a concrete, non-root node type.
    pub fn require_regular_type(&self, name: &NodeTypeName) -> Result<&NodeTypeDefinition> {
        let definition = self.get(name)?;
        if definition.is_abstract {
            return Err(Error::NodeTypeIsAbstract(name.to_string()));
        }
        if definition.root {
            return Err(Error::NodeTypeIsOfTypeRoot(name.to_string()));
        }
        Ok(definition)
    }

    /// Checks every value against the declared property types.
    pub fn validate_properties(&self, name: &NodeTypeName, values: &PropertyValues) -> Result<()> {
        let definition = self.get(name)?;
        check_values(name, None, &definition.properties, values)
    }

    /// Requires the node type to declare the reference.
    pub fn require_reference(&self, name: &NodeTypeName, reference: &ReferenceName) -> Result<&ReferenceDefinition> {
        self.get(name)?
            .references
            .get(reference)
            .ok_or_else(|| Error::ReferenceCannotBeSet {
                node_type: name.to_string(),
                reference: reference.to_string(),
            })
    }

    /// Checks the number of targets and each edge's properties.
    pub fn validate_references<'a>(
        &self,
        name: &NodeTypeName,
        reference: &ReferenceName,
        edges: impl ExactSizeIterator<Item = Option<&'a PropertyValues>>,
    ) -> Result<()> {
        let definition = self.require_reference(name, reference)?;
        if let Some(max_items) = definition.max_items {
            if edges.len() > max_items {
                return Err(Error::ReferenceCardinalityExceeded {
                    node_type: name.to_string(),
                    reference: reference.to_string(),
                    max_items,
                    given: edges.len(),
                });
            }
        }
        for values in edges.flatten() {
            check_values(name, Some(reference), &definition.properties, values)?;
        }
        Ok(())
    }

    /// Checks that every name is a declared property.
    pub fn validate_property_names<'a>(
        &self,
        name: &NodeTypeName,
        properties: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        let definition = self.get(name)?;
        for property in properties {
            if !definition.properties.contains_key(property) {
                return Err(Error::UnknownProperty {
                    node_type: name.to_string(),
                    property: property.clone(),
                });
            }
        }
        Ok(())
    }

    /// Merges the declared defaults with the given values; given values win.
    pub fn values_with_defaults(&self, name: &NodeTypeName, values: &PropertyValues) -> Result<PropertyValues> {
        let definition = self.get(name)?;
        let mut merged: PropertyValues = definition
            .properties
            .iter()
            .filter_map(|(property, d)| d.default_value.clone().map(|v| (property.clone(), v)))
            .collect();
        merged.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(merged)
    }

    /// Returns the tethered children of a node type.
    pub fn tethered_children(&self, name: &NodeTypeName) -> Result<&BTreeMap<NodeName, NodeTypeName>> {
        Ok(&self.get(name)?.child_nodes)
    }
}

/// Checks values against declared properties. Reference properties are
/// reported as `<reference>.<property>`.
fn check_values(
    name: &NodeTypeName,
    reference: Option<&ReferenceName>,
    declared: &BTreeMap<String, PropertyDefinition>,
    values: &PropertyValues,
) -> Result<()> {
    let qualified = |property: &str| match reference {
        Some(reference) => format!("{reference}.{property}"),
        None => property.to_string(),
    };
    for (property, value) in values {
        let definition = declared.get(property).ok_or_else(|| Error::UnknownProperty {
            node_type: name.to_string(),
            property: qualified(property),
        })?;
        if !definition.property_type.accepts(value) {
            return Err(Error::InvalidPropertyType {
                node_type: name.to_string(),
                property: qualified(property),
                expected: definition.property_type.name().to_string(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn name(n: &str) -> NodeTypeName {
        NodeTypeName::new(n).unwrap()
    }

    fn manager() -> NodeTypeManager {
        NodeTypeManager::new(vec![
            NodeTypeDefinition::new(name("Acme:Page"))
                .with_property("title", PropertyType::String)
                .with_default("visits", PropertyType::Integer, json!(0))
                .with_child_node(NodeName::new("main").unwrap(), name("Acme:Collection"))
                .with_reference(
                    ReferenceName::new("author").unwrap(),
                    ReferenceDefinition::new()
                        .with_max_items(1)
                        .with_property("role", PropertyType::String),
                ),
            NodeTypeDefinition::new(name("Acme:Collection")),
            NodeTypeDefinition::new(name("Acme:Abstract")).as_abstract(),
            NodeTypeDefinition::new(name("Acme:Sites")).as_root(),
        ])
        .unwrap()
    }

    #[test]
    fn test_root_type_is_built_in() {
        let manager = NodeTypeManager::new(vec![]).unwrap();
        assert!(manager.require_root_type(&NodeTypeName::root()).is_ok());
    }

    #[test]
    fn test_type_requirements() {
        let manager = manager();
        assert!(matches!(
            manager.require_regular_type(&name("Acme:Missing")),
            Err(Error::NodeTypeNotFound(_))
        ));
        assert!(matches!(
            manager.require_regular_type(&name("Acme:Abstract")),
            Err(Error::NodeTypeIsAbstract(_))
        ));
        assert!(matches!(
            manager.require_regular_type(&name("Acme:Sites")),
            Err(Error::NodeTypeIsOfTypeRoot(_))
        ));
        assert!(matches!(
            manager.require_root_type(&name("Acme:Page")),
            Err(Error::NodeTypeIsNotOfTypeRoot(_))
        ));
    }

    #[test]
    fn test_property_validation() {
        let manager = manager();
        let page = name("Acme:Page");

        let mut values = PropertyValues::new();
        values.insert("title".to_string(), json!("Home"));
        assert!(manager.validate_properties(&page, &values).is_ok());

        values.insert("visits".to_string(), json!("many"));
        assert!(matches!(
            manager.validate_properties(&page, &values),
            Err(Error::InvalidPropertyType { .. })
        ));

        let mut unknown = PropertyValues::new();
        unknown.insert("color".to_string(), json!("red"));
        assert!(matches!(
            manager.validate_properties(&page, &unknown),
            Err(Error::UnknownProperty { .. })
        ));
    }

    #[test]
    fn test_reference_validation() {
        let manager = manager();
        let page = name("Acme:Page");
        let author = ReferenceName::new("author").unwrap();

        assert!(matches!(
            manager.require_reference(&page, &ReferenceName::new("tags").unwrap()),
            Err(Error::ReferenceCannotBeSet { .. })
        ));

        let mut role = PropertyValues::new();
        role.insert("role".to_string(), json!("editor"));
        assert!(manager
            .validate_references(&page, &author, [Some(&role)].into_iter())
            .is_ok());
        assert!(manager.validate_references(&page, &author, [None].into_iter()).is_ok());

        assert!(matches!(
            manager.validate_references(&page, &author, [None, None].into_iter()),
            Err(Error::ReferenceCardinalityExceeded { max_items: 1, given: 2, .. })
        ));

        let mut wrong = PropertyValues::new();
        wrong.insert("role".to_string(), json!(3));
        match manager.validate_references(&page, &author, [Some(&wrong)].into_iter()) {
            Err(Error::InvalidPropertyType { property, .. }) => assert_eq!(property, "author.role"),
            other => panic!("expected an invalid property type, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_merged() {
        let manager = manager();
        let mut values = PropertyValues::new();
        values.insert("title".to_string(), json!("Home"));

        let merged = manager.values_with_defaults(&name("Acme:Page"), &values).unwrap();
        assert_eq!(merged["visits"], json!(0));
        assert_eq!(merged["title"], json!("Home"));
    }

    #[test]
    fn test_unknown_tethered_type_is_rejected() {
        let result = NodeTypeManager::new(vec![NodeTypeDefinition::new(name("Acme:Page"))
            .with_child_node(NodeName::new("main").unwrap(), name("Acme:Nowhere"))]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_definition_from_json() {
        let definition: NodeTypeDefinition = serde_json::from_value(json!({
            "name": "Acme:Page",
            "abstract": false,
            "properties": { "title": { "type": "string", "defaultValue": "" } },
            "childNodes": { "main": "Acme:Collection" },
            "references": { "relatedPages": { "maxItems": 3 } }
        }))
        .unwrap();
        assert_eq!(definition.properties["title"].property_type, PropertyType::String);
        assert_eq!(definition.child_nodes.len(), 1);
        assert_eq!(
            definition.references[&ReferenceName::new("relatedPages").unwrap()].max_items,
            Some(3)
        );
    }
}
