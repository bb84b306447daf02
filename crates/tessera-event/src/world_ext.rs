//! World extension for event stores.
//!
//! Each event type gets one [`Events<T>`] store, kept as a world
//! resource. Stores must be added before use; writing to a type that was
//! never added is a wiring error, not a silent no-op.

use std::any::type_name;

use tessera_ecs::{EcsError, EcsResult, Res, World};
use tracing::debug;

use crate::{
    Event,
    event::EventId,
    store::{DEFAULT_EVENT_CAPACITY, Events},
};

fn store_error<T: Event>(err: EcsError) -> EcsError {
    match err {
        EcsError::ResourceNotFound(_) => EcsError::EventStoreMissing(type_name::<T>()),
        other => other,
    }
}

/// Extension trait for World to add event functionality.
pub trait EventWorldExt {
    /// Install a store for `T` holding `capacity` records.
    ///
    /// Returns `false` (and keeps the existing store) if one is present.
    fn add_event<T: Event>(&mut self, capacity: usize) -> bool;

    /// Install a store for `T` with [`DEFAULT_EVENT_CAPACITY`].
    fn add_event_default<T: Event>(&mut self) -> bool {
        self.add_event::<T>(DEFAULT_EVENT_CAPACITY)
    }

    fn has_event<T: Event>(&self) -> bool;

    /// Write an event to its store.
    fn send<T: Event>(&mut self, event: T) -> EcsResult<EventId>;

    /// Shared borrow of the store for `T`.
    fn events<T: Event>(&self) -> EcsResult<Res<'_, Events<T>>>;

    fn events_mut<T: Event>(&mut self) -> EcsResult<&mut Events<T>>;
}

impl EventWorldExt for World {
    fn add_event<T: Event>(&mut self, capacity: usize) -> bool {
        if self.contains_resource::<Events<T>>() {
            return false;
        }
        debug!(event = type_name::<T>(), capacity, "adding event store");
        self.insert_resource(Events::<T>::with_capacity(capacity));
        true
    }

    fn has_event<T: Event>(&self) -> bool {
        self.contains_resource::<Events<T>>()
    }

    fn send<T: Event>(&mut self, event: T) -> EcsResult<EventId> {
        Ok(self.events_mut::<T>()?.write(event))
    }

    fn events<T: Event>(&self) -> EcsResult<Res<'_, Events<T>>> {
        self.resource::<Events<T>>().map_err(store_error::<T>)
    }

    fn events_mut<T: Event>(&mut self) -> EcsResult<&mut Events<T>> {
        self.get_resource_mut::<Events<T>>()
            .map_err(store_error::<T>)
    }
}
