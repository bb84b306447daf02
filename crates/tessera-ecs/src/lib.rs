// Allow unsafe code in ECS - necessary for type-erased component storage
#![allow(unsafe_code)]
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ref_as_ptr)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::float_cmp)]

//! Tessera ECS - Archetype-based Entity Component System
//!
//! # Key Concepts
//!
//! - **Entity**: generational handle; stale handles are always detected
//! - **Component**: any `'static + Send + Sync` value attached to an entity
//! - **Archetype**: the set of entities sharing one exact component set,
//!   stored column-per-component
//! - **Relation**: `Relation<R>` component holding targets (and optional
//!   per-target data), with an optional forward/backward edge index
//! - **Resource**: one value per type, stored outside entities
//!
//! # Access Patterns
//!
//! ```ignore
//! let mut world = World::new();
//! let e = world.spawn_bundle((Position { x: 0.0, y: 0.0 }, Velocity { x: 1.0, y: 0.0 }))?;
//!
//! // Runtime query built from component types (or raw ids)
//! let mut query = world.query().with::<Position>().with::<Velocity>().build();
//!
//! // Typed query with cached matches
//! let mut moving = world.query_state::<(&mut Position, &Velocity)>();
//! for (pos, vel) in moving.iter_mut(&mut world) {
//!     pos.x += vel.x;
//! }
//! ```

mod access;
mod archetype;
mod bundle;
mod component;
mod entity;
mod error;
mod fetch;
mod query;
mod relation;
mod resource;
mod storage;
mod world;

pub use access::{Access, AccessConflict};
pub use archetype::{Archetype, ArchetypeId, ArchetypeStorage, Signature};
pub use bundle::Bundle;
pub use component::{Component, ComponentFlags, ComponentId, ComponentInfo, ComponentRegistry};
pub use entity::{Entities, Entity, EntityId, EntityLocation, Generation};
pub use error::{EcsError, EcsResult};
pub use fetch::{QueryData, QueryFilter, QueryIter, QueryState, ReadOnlyQueryData, With, Without};
pub use query::{Query, QueryBuilder, QueryDescriptor, QueryRow, QueryRowMut, RowIter, RowIterMut};
pub use relation::{Relation, RelationIndex, RelationMode};
pub use resource::{Res, ResMut, Resource, Resources};
pub use storage::Column;
pub use world::{World, WorldId};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Component, EcsError, EcsResult, Entity, QueryState, Relation, RelationMode, Res, ResMut,
        Resource, With, Without, World,
    };
}
