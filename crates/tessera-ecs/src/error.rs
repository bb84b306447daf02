//! Storage and relation error types.

use thiserror::Error;

use crate::{component::ComponentId, entity::Entity, relation::RelationMode};

/// Error raised by storage, relation, and resource operations.
#[derive(Debug, Error)]
pub enum EcsError {
    /// The handle refers to a destroyed (or recycled) entity.
    #[error("stale entity handle: {0:?}")]
    StaleHandle(Entity),

    /// The entity already carries a component of this type.
    #[error("{entity:?} already has component {component}")]
    DuplicateComponent {
        entity: Entity,
        component: &'static str,
    },

    /// The entity does not carry a component of this type.
    #[error("{entity:?} has no component {component}")]
    MissingComponent {
        entity: Entity,
        component: &'static str,
    },

    /// No `relation` edge runs from `from` to `to`.
    #[error("no {relation} edge from {from:?} to {to:?}")]
    EdgeNotFound {
        from: Entity,
        to: Entity,
        relation: &'static str,
    },

    /// A required resource has not been inserted.
    #[error("resource not found: {0}")]
    ResourceNotFound(&'static str),

    /// The resource is already borrowed in a conflicting way.
    #[error("resource already borrowed: {0}")]
    ResourceBorrowed(&'static str),

    /// No event store has been installed for this event type.
    #[error("event store missing for {0}")]
    EventStoreMissing(&'static str),

    /// The component id was never issued by this world.
    #[error("unknown component: {0:?}")]
    UnknownComponent(ComponentId),

    /// A raw byte span does not match the registered component size.
    #[error("component {component} is {expected} bytes, got {actual}")]
    ComponentSize {
        component: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The relation type was already registered with a different mode.
    #[error("relation {relation} registered as {registered:?}, requested {requested:?}")]
    RelationModeConflict {
        relation: &'static str,
        registered: RelationMode,
        requested: RelationMode,
    },

    /// Indexed relation components can only change through the relation API.
    #[error("indexed relation {0} cannot be borrowed mutably; use the relation API")]
    IndexedRelationAccess(&'static str),
}

/// Result type for storage operations.
pub type EcsResult<T> = Result<T, EcsError>;
