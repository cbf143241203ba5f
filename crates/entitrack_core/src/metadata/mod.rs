//! Mapping metadata consumed by the change tracker.
//!
//! The tracker treats the model as an immutable, externally supplied schema:
//! it is built once (fluently or from JSON) and shared behind an `Arc`.

mod definition;
mod entity_type;
mod model;

pub use definition::{EntityTypeDef, ForeignKeyDef, ModelDef, NavigationDef, PropertyDef};
pub use entity_type::{EntityType, ForeignKey, Navigation, Property, ValueGeneration};
pub use model::{Model, ModelBuilder};
