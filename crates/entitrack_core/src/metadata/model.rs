//! The model: the set of entity types known to a state manager.

use super::definition::{EntityTypeDef, ModelDef};
use super::entity_type::{EntityType, ForeignKey, Navigation, Property};
use crate::error::{TrackerError, TrackerResult};
use std::collections::HashMap;
use std::sync::Arc;

/// An immutable collection of resolved entity types.
#[derive(Debug, Clone, Default)]
pub struct Model {
    entity_types: Vec<Arc<EntityType>>,
    by_name: HashMap<String, usize>,
}

impl Model {
    /// Starts building a model.
    #[must_use]
    pub fn builder() -> ModelBuilder {
        ModelBuilder::new()
    }

    /// Builds a model from a JSON document shaped like [`ModelDef`].
    pub fn from_json(json: &str) -> TrackerResult<Self> {
        let def: ModelDef = serde_json::from_str(json)?;
        ModelBuilder::from_def(def).build()
    }

    /// Looks up an entity type by name.
    #[must_use]
    pub fn entity_type(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.by_name.get(name).map(|&i| &self.entity_types[i])
    }

    /// Looks up an entity type by name, failing if it is not in the model.
    pub fn find_entity_type(&self, name: &str) -> TrackerResult<&Arc<EntityType>> {
        self.entity_type(name)
            .ok_or_else(|| TrackerError::UnknownEntityType {
                name: name.to_string(),
            })
    }

    /// Returns all entity types in definition order.
    #[must_use]
    pub fn entity_types(&self) -> &[Arc<EntityType>] {
        &self.entity_types
    }
}

/// Fluent builder for a [`Model`].
///
/// # Example
///
/// ```
/// use entitrack_core::metadata::{EntityTypeDef, Model, PropertyDef, ValueGeneration};
/// use entitrack_core::ValueKind;
///
/// let model = Model::builder()
///     .entity_type(
///         EntityTypeDef::new("Category")
///             .property(PropertyDef::new("Id", ValueKind::Integer).generated(ValueGeneration::OnAdd))
///             .property(PropertyDef::new("Name", ValueKind::Text).nullable())
///             .key(["Id"]),
///     )
///     .build()
///     .unwrap();
///
/// assert!(model.entity_type("Category").is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    def: ModelDef,
}

impl ModelBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder seeded with an existing definition.
    #[must_use]
    pub fn from_def(def: ModelDef) -> Self {
        Self { def }
    }

    /// Adds an entity type definition.
    #[must_use]
    pub fn entity_type(mut self, entity_type: EntityTypeDef) -> Self {
        self.def.entity_types.push(entity_type);
        self
    }

    /// Resolves names to indices and validates the model.
    pub fn build(self) -> TrackerResult<Model> {
        let defs = self.def.entity_types;

        let mut by_name = HashMap::new();
        for (i, def) in defs.iter().enumerate() {
            if by_name.insert(def.name.clone(), i).is_some() {
                return Err(TrackerError::invalid_model(format!(
                    "entity type '{}' is defined more than once",
                    def.name
                )));
            }
        }

        let mut types = defs
            .iter()
            .map(resolve_properties)
            .collect::<TrackerResult<Vec<_>>>()?;

        // Foreign keys need the principal's primary key, so resolve them in a second pass.
        for (i, def) in defs.iter().enumerate() {
            for (fk_index, fk_def) in def.foreign_keys.iter().enumerate() {
                let principal_index = *by_name.get(&fk_def.principal).ok_or_else(|| {
                    TrackerError::invalid_model(format!(
                        "foreign key on '{}' references unknown entity type '{}'",
                        def.name, fk_def.principal
                    ))
                })?;

                let properties = fk_def
                    .properties
                    .iter()
                    .map(|name| property_index(&types[i], name))
                    .collect::<TrackerResult<Vec<_>>>()?;

                let principal_properties = if fk_def.principal_properties.is_empty() {
                    types[principal_index].primary_key.clone()
                } else {
                    fk_def
                        .principal_properties
                        .iter()
                        .map(|name| property_index(&types[principal_index], name))
                        .collect::<TrackerResult<Vec<_>>>()?
                };

                if properties.is_empty() || properties.len() != principal_properties.len() {
                    return Err(TrackerError::invalid_model(format!(
                        "foreign key on '{}' has {} properties but principal '{}' key has {}",
                        def.name,
                        properties.len(),
                        fk_def.principal,
                        principal_properties.len()
                    )));
                }

                for &p in &properties {
                    types[i].properties[p].foreign_key = true;
                }
                for &p in &principal_properties {
                    types[principal_index].properties[p].principal_key = true;
                }

                types[i].foreign_keys.push(ForeignKey {
                    index: fk_index,
                    dependent_type: def.name.clone(),
                    properties,
                    principal_type: fk_def.principal.clone(),
                    principal_properties,
                });
            }

            for (nav_index, nav_def) in def.navigations.iter().enumerate() {
                if !by_name.contains_key(&nav_def.target) {
                    return Err(TrackerError::invalid_model(format!(
                        "navigation '{}.{}' targets unknown entity type '{}'",
                        def.name, nav_def.name, nav_def.target
                    )));
                }
                if !def.clr_backed {
                    return Err(TrackerError::invalid_model(format!(
                        "shadow entity type '{}' cannot declare navigation '{}'",
                        def.name, nav_def.name
                    )));
                }
                types[i].navigations.push(Navigation {
                    name: nav_def.name.clone(),
                    index: nav_index,
                    target: nav_def.target.clone(),
                    collection: nav_def.collection,
                });
            }
        }

        Ok(Model {
            entity_types: types.into_iter().map(Arc::new).collect(),
            by_name,
        })
    }
}

fn property_index(entity_type: &EntityType, name: &str) -> TrackerResult<usize> {
    entity_type
        .property(name)
        .map(Property::index)
        .ok_or_else(|| TrackerError::UnknownProperty {
            entity_type: entity_type.name.clone(),
            name: name.to_string(),
        })
}

fn resolve_properties(def: &EntityTypeDef) -> TrackerResult<EntityType> {
    let mut properties = Vec::with_capacity(def.properties.len());
    let mut shadow_count = 0;

    for (index, p) in def.properties.iter().enumerate() {
        if def.properties[..index].iter().any(|q| q.name == p.name) {
            return Err(TrackerError::invalid_model(format!(
                "property '{}.{}' is defined more than once",
                def.name, p.name
            )));
        }

        // Every property of a shadow-only type lives in shadow storage.
        let shadow = p.shadow || !def.clr_backed;
        let shadow_index = if shadow {
            shadow_count += 1;
            Some(shadow_count - 1)
        } else {
            None
        };

        properties.push(Property {
            name: p.name.clone(),
            index,
            kind: p.kind,
            nullable: p.nullable,
            read_only: p.read_only,
            value_generation: p.value_generation,
            shadow,
            shadow_index,
            store_default: p.store_default,
            primary_key: false,
            foreign_key: false,
            principal_key: false,
        });
    }

    let mut entity_type = EntityType {
        name: def.name.clone(),
        clr_backed: def.clr_backed,
        properties,
        navigations: Vec::new(),
        primary_key: Vec::new(),
        foreign_keys: Vec::new(),
        shadow_count,
    };

    let primary_key = def
        .key
        .iter()
        .map(|name| property_index(&entity_type, name))
        .collect::<TrackerResult<Vec<_>>>()?;
    for &p in &primary_key {
        entity_type.properties[p].primary_key = true;
    }
    entity_type.primary_key = primary_key;

    Ok(entity_type)
}
