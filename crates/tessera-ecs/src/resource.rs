//! Resources - global state that exists once per world.
//!
//! Unlike regular components which are attached to entities,
//! resources exist independently and are accessed by type.
//! Each one sits behind its own lock so procedures can hold a shared
//! `&World` and still borrow different resources mutably; a
//! conflicting borrow fails instead of blocking.

use std::{
    any::{Any, TypeId},
    fmt,
    ops::{Deref, DerefMut},
};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use rustc_hash::FxHashMap;

use crate::error::{EcsError, EcsResult};

/// Marker trait for resource types.
pub trait Resource: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Resource for T {}

struct ResourceCell {
    name: &'static str,
    value: RwLock<Box<dyn Any + Send + Sync>>,
}

impl ResourceCell {
    fn new<T: Resource>(value: T) -> Self {
        Self {
            name: std::any::type_name::<T>(),
            value: RwLock::new(Box::new(value)),
        }
    }

    fn into_inner<T: Resource>(self) -> Option<T> {
        self.value.into_inner().downcast().ok().map(|b| *b)
    }
}

/// Shared borrow of a resource.
pub struct Res<'w, T: Resource> {
    guard: MappedRwLockReadGuard<'w, T>,
}

impl<T: Resource> Deref for Res<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: Resource + fmt::Debug> fmt::Debug for Res<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Res").field(&*self.guard).finish()
    }
}

/// Exclusive borrow of a resource.
pub struct ResMut<'w, T: Resource> {
    guard: MappedRwLockWriteGuard<'w, T>,
}

impl<T: Resource> Deref for ResMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: Resource> DerefMut for ResMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: Resource + fmt::Debug> fmt::Debug for ResMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResMut").field(&*self.guard).finish()
    }
}

/// Storage for resources, keyed by type.
#[derive(Default)]
pub struct Resources {
    cells: FxHashMap<TypeId, ResourceCell>,
}

impl Resources {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource, replacing any existing value of the same type.
    pub fn insert<T: Resource>(&mut self, value: T) -> Option<T> {
        self.cells
            .insert(TypeId::of::<T>(), ResourceCell::new(value))
            .and_then(ResourceCell::into_inner)
    }

    /// Remove a resource, returning it if it existed.
    pub fn remove<T: Resource>(&mut self) -> Option<T> {
        self.cells
            .remove(&TypeId::of::<T>())
            .and_then(ResourceCell::into_inner)
    }

    #[must_use]
    pub fn contains<T: Resource>(&self) -> bool {
        self.cells.contains_key(&TypeId::of::<T>())
    }

    /// Borrow a resource immutably.
    pub fn get<T: Resource>(&self) -> EcsResult<Res<'_, T>> {
        let name = std::any::type_name::<T>();
        let cell = self
            .cells
            .get(&TypeId::of::<T>())
            .ok_or(EcsError::ResourceNotFound(name))?;
        let guard = cell
            .value
            .try_read()
            .ok_or(EcsError::ResourceBorrowed(cell.name))?;
        let guard = RwLockReadGuard::try_map(guard, |boxed| boxed.downcast_ref::<T>())
            .map_err(|_| EcsError::ResourceNotFound(name))?;
        Ok(Res { guard })
    }

    /// Borrow a resource mutably through a shared reference.
    pub fn get_mut<T: Resource>(&self) -> EcsResult<ResMut<'_, T>> {
        let name = std::any::type_name::<T>();
        let cell = self
            .cells
            .get(&TypeId::of::<T>())
            .ok_or(EcsError::ResourceNotFound(name))?;
        let guard = cell
            .value
            .try_write()
            .ok_or(EcsError::ResourceBorrowed(cell.name))?;
        let guard = RwLockWriteGuard::try_map(guard, |boxed| boxed.downcast_mut::<T>())
            .map_err(|_| EcsError::ResourceNotFound(name))?;
        Ok(ResMut { guard })
    }

    /// Direct mutable access; no lock traffic since `&mut self` is exclusive.
    pub fn get_exclusive<T: Resource>(&mut self) -> EcsResult<&mut T> {
        self.cells
            .get_mut(&TypeId::of::<T>())
            .and_then(|cell| cell.value.get_mut().downcast_mut::<T>())
            .ok_or(EcsError::ResourceNotFound(std::any::type_name::<T>()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.cells.values().map(|cell| cell.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct GameConfig {
        world_size: u32,
        tick_rate: u32,
    }

    #[derive(Debug, Default, PartialEq)]
    struct Time {
        tick: u64,
    }

    #[test]
    fn test_insert_and_get() {
        let mut resources = Resources::new();

        resources.insert(GameConfig {
            world_size: 1000,
            tick_rate: 20,
        });

        let config = resources.get::<GameConfig>().unwrap();
        assert_eq!(config.world_size, 1000);
        assert_eq!(config.tick_rate, 20);
    }

    #[test]
    fn test_replace_returns_old() {
        let mut resources = Resources::new();

        assert!(resources.insert(Time { tick: 1 }).is_none());
        assert_eq!(resources.insert(Time { tick: 2 }), Some(Time { tick: 1 }));
        assert_eq!(resources.remove::<Time>(), Some(Time { tick: 2 }));
        assert!(!resources.contains::<Time>());
    }

    #[test]
    fn test_missing_resource() {
        let resources = Resources::new();

        assert!(matches!(
            resources.get::<Time>(),
            Err(EcsError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_borrow_conflicts_are_reported() {
        let mut resources = Resources::new();
        resources.insert(Time::default());
        resources.insert(GameConfig::default());

        let mut time = resources.get_mut::<Time>().unwrap();
        time.tick += 1;

        // A different resource is independent
        assert!(resources.get_mut::<GameConfig>().is_ok());
        assert!(matches!(
            resources.get::<Time>(),
            Err(EcsError::ResourceBorrowed(_))
        ));
        drop(time);

        let a = resources.get::<Time>().unwrap();
        let b = resources.get::<Time>().unwrap();
        assert_eq!(a.tick, b.tick);
    }
}
