//! Runtime queries built from component ids.
//!
//! Queries are built using method chaining, not type-level generics,
//! so they can be composed from data (scripting, tooling, the
//! serialization layer). For compile-time typed access see
//! [`QueryState`](crate::QueryState).
//!
//! # Basic Usage
//!
//! ```ignore
//! let mut query = world.query()
//!     .with::<Position>()
//!     .with::<Velocity>()
//!     .without::<Frozen>()
//!     .optional::<Name>()
//!     .build();
//!
//! for mut row in query.iter_mut(&mut world) {
//!     let vel = *row.get::<Velocity>().unwrap();
//!     let pos = row.get_mut::<Position>().unwrap();
//!     pos.x += vel.x;
//! }
//! ```
//!
//! # Matching
//!
//! An archetype matches when it holds every `include` type and none of
//! the `exclude` types. `optional` types never affect matching; rows
//! report them as `None` when absent.
//!
//! Matched archetypes are cached and refreshed incrementally: archetypes
//! are never removed, so each refresh only inspects the ones created since
//! the last call, and the iteration order stays stable between calls.
//!
//! # Structural changes
//!
//! Adding or removing components (or despawning) while iterating the
//! same query is not supported: the borrow checker forbids it for
//! `iter_mut`, and callers of `iter` must queue such changes and apply
//! them once the iterator is dropped.

use std::{fmt, marker::PhantomData};

use smallvec::SmallVec;

use crate::{
    World,
    archetype::{Archetype, ArchetypeId},
    component::{Component, ComponentFlags, ComponentId, ComponentRegistry},
    entity::Entity,
    error::{EcsError, EcsResult},
    world::WorldId,
};

type Terms = SmallVec<[ComponentId; 8]>;

/// Include/exclude/optional component sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryDescriptor {
    include: Terms,
    exclude: Terms,
    optional: Terms,
}

impl QueryDescriptor {
    #[must_use]
    pub fn new(include: &[ComponentId], exclude: &[ComponentId], optional: &[ComponentId]) -> Self {
        Self {
            include: include.iter().copied().collect(),
            exclude: exclude.iter().copied().collect(),
            optional: optional.iter().copied().collect(),
        }
    }

    #[must_use]
    pub fn include(&self) -> &[ComponentId] {
        &self.include
    }

    #[must_use]
    pub fn exclude(&self) -> &[ComponentId] {
        &self.exclude
    }

    #[must_use]
    pub fn optional(&self) -> &[ComponentId] {
        &self.optional
    }

    /// `include ⊆ archetype` and `exclude ∩ archetype = ∅`.
    #[must_use]
    pub fn matches(&self, archetype: &Archetype) -> bool {
        self.include.iter().all(|&id| archetype.contains(id))
            && !self.exclude.iter().any(|&id| archetype.contains(id))
    }
}

/// Builder for constructing queries at runtime.
///
/// Registers every named type, so a query built before the first entity
/// with that component exists still matches it later.
pub struct QueryBuilder<'w> {
    world: &'w mut World,
    descriptor: QueryDescriptor,
}

impl<'w> QueryBuilder<'w> {
    pub fn new(world: &'w mut World) -> Self {
        Self {
            world,
            descriptor: QueryDescriptor::default(),
        }
    }

    /// Entity must have component `T`.
    #[must_use]
    pub fn with<T: Component>(mut self) -> Self {
        let id = self.world.register_component::<T>();
        self.descriptor.include.push(id);
        self
    }

    /// Entity must NOT have component `T`.
    #[must_use]
    pub fn without<T: Component>(mut self) -> Self {
        let id = self.world.register_component::<T>();
        self.descriptor.exclude.push(id);
        self
    }

    /// Read `T` when present; does not affect matching.
    #[must_use]
    pub fn optional<T: Component>(mut self) -> Self {
        let id = self.world.register_component::<T>();
        self.descriptor.optional.push(id);
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: ComponentId) -> Self {
        self.descriptor.include.push(id);
        self
    }

    #[must_use]
    pub fn without_id(mut self, id: ComponentId) -> Self {
        self.descriptor.exclude.push(id);
        self
    }

    #[must_use]
    pub fn optional_id(mut self, id: ComponentId) -> Self {
        self.descriptor.optional.push(id);
        self
    }

    /// Build the query, pre-computing the matching archetypes.
    #[must_use]
    pub fn build(self) -> Query {
        Query::new(self.world, self.descriptor)
    }
}

/// An executable query over entities.
pub struct Query {
    descriptor: QueryDescriptor,
    world_id: WorldId,
    matched: Vec<ArchetypeId>,
    /// Number of archetypes already inspected.
    seen: usize,
}

impl Query {
    #[must_use]
    pub fn new(world: &World, descriptor: QueryDescriptor) -> Self {
        let mut query = Self {
            descriptor,
            world_id: world.id(),
            matched: Vec::new(),
            seen: 0,
        };
        query.refresh(world);
        query
    }

    #[must_use]
    pub const fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// Matched archetypes, in creation order.
    #[must_use]
    pub fn matched_archetypes(&self) -> &[ArchetypeId] {
        &self.matched
    }

    /// Inspect archetypes created since the last call.
    pub fn refresh(&mut self, world: &World) {
        assert_eq!(
            self.world_id,
            world.id(),
            "query used with a different world than it was built for"
        );
        let archetypes = world.archetypes();
        for archetype in archetypes.iter_from(self.seen) {
            if self.descriptor.matches(archetype) {
                self.matched.push(archetype.id());
            }
        }
        self.seen = archetypes.len();
    }

    /// Iterate over matching rows with shared access.
    pub fn iter<'w>(&mut self, world: &'w World) -> RowIter<'w, '_> {
        self.refresh(world);
        RowIter {
            cursor: Cursor::new(world, &self.matched),
        }
    }

    /// Iterate over matching rows with mutable component access.
    pub fn iter_mut<'w>(&mut self, world: &'w mut World) -> RowIterMut<'w, '_> {
        self.refresh(world);
        RowIterMut {
            cursor: Cursor::new(world, &self.matched),
            _world: PhantomData,
        }
    }

    /// Count matching entities without touching component data.
    pub fn count(&mut self, world: &World) -> usize {
        self.refresh(world);
        self.matched
            .iter()
            .map(|&id| world.archetypes()[id].len())
            .sum()
    }

    /// Execute a closure for each matching row.
    pub fn each<F>(&mut self, world: &World, mut f: F)
    where
        F: FnMut(QueryRow<'_>),
    {
        for row in self.iter(world) {
            f(row);
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("descriptor", &self.descriptor)
            .field("matching_archetypes", &self.matched.len())
            .finish()
    }
}

/// Walks `(archetype, row)` pairs over a list of archetype ids.
struct Cursor<'w, 's> {
    world: &'w World,
    archetypes: std::slice::Iter<'s, ArchetypeId>,
    current: Option<&'w Archetype>,
    row: usize,
}

impl<'w, 's> Cursor<'w, 's> {
    fn new(world: &'w World, matched: &'s [ArchetypeId]) -> Self {
        Self {
            world,
            archetypes: matched.iter(),
            current: None,
            row: 0,
        }
    }

    fn next(&mut self) -> Option<(&'w Archetype, usize)> {
        loop {
            if let Some(archetype) = self.current {
                if self.row < archetype.len() {
                    let row = self.row;
                    self.row += 1;
                    return Some((archetype, row));
                }
            }
            let &id = self.archetypes.next()?;
            self.current = Some(&self.world.archetypes()[id]);
            self.row = 0;
        }
    }

    fn remaining(&self) -> usize {
        let current = self.current.map_or(0, |a| a.len() - self.row);
        let rest: usize = self
            .archetypes
            .clone()
            .map(|&id| self.world.archetypes()[id].len())
            .sum();
        current + rest
    }
}

/// Iterator over query results with shared access.
pub struct RowIter<'w, 's> {
    cursor: Cursor<'w, 's>,
}

impl<'w> Iterator for RowIter<'w, '_> {
    type Item = QueryRow<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        let (archetype, row) = self.cursor.next()?;
        Some(QueryRow {
            archetype,
            row,
            registry: self.cursor.world.components(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.cursor.remaining();
        (n, Some(n))
    }
}

/// Iterator over query results with mutable access.
pub struct RowIterMut<'w, 's> {
    cursor: Cursor<'w, 's>,
    _world: PhantomData<&'w mut World>,
}

impl<'w> Iterator for RowIterMut<'w, '_> {
    type Item = QueryRowMut<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        let (archetype, row) = self.cursor.next()?;
        Some(QueryRowMut {
            archetype,
            row,
            registry: self.cursor.world.components(),
            _world: PhantomData,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.cursor.remaining();
        (n, Some(n))
    }
}

/// A single row from a query result.
#[derive(Clone, Copy)]
pub struct QueryRow<'w> {
    archetype: &'w Archetype,
    row: usize,
    registry: &'w ComponentRegistry,
}

impl<'w> QueryRow<'w> {
    #[must_use]
    pub fn entity(&self) -> Entity {
        self.archetype.entities()[self.row]
    }

    /// The component, or `None` when this row's archetype lacks it.
    #[must_use]
    pub fn get<T: Component>(&self) -> Option<&'w T> {
        let id = self.registry.get_id::<T>()?;
        // SAFETY: the column under id stores T
        unsafe { self.archetype.get::<T>(id, self.row) }
    }

    /// Raw pointer to a component by id.
    #[must_use]
    pub fn get_ptr(&self, id: ComponentId) -> Option<*const u8> {
        self.archetype
            .component_ptr(id, self.row)
            .map(<*mut u8>::cast_const)
    }

    #[must_use]
    pub fn has<T: Component>(&self) -> bool {
        self.registry
            .get_id::<T>()
            .is_some_and(|id| self.archetype.contains(id))
    }

    #[must_use]
    pub const fn archetype(&self) -> &'w Archetype {
        self.archetype
    }
}

impl fmt::Debug for QueryRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRow")
            .field("entity", &self.entity())
            .field("archetype", &self.archetype.id())
            .finish()
    }
}

/// A single row with mutable component access.
///
/// Each row is a distinct entity, so mutable borrows from different rows
/// never alias; `&mut self` prevents aliasing within one row.
pub struct QueryRowMut<'w> {
    archetype: &'w Archetype,
    row: usize,
    registry: &'w ComponentRegistry,
    _world: PhantomData<&'w mut World>,
}

impl QueryRowMut<'_> {
    #[must_use]
    pub fn entity(&self) -> Entity {
        self.archetype.entities()[self.row]
    }

    #[must_use]
    pub fn get<T: Component>(&self) -> Option<&T> {
        let id = self.registry.get_id::<T>()?;
        // SAFETY: the column under id stores T
        unsafe { self.archetype.get::<T>(id, self.row) }
    }

    /// Mutable access to a component; writes land directly in the column.
    ///
    /// Indexed relation components are refused with
    /// [`EcsError::IndexedRelationAccess`], as in [`World::get_mut`].
    pub fn get_mut<T: Component>(&mut self) -> EcsResult<&mut T> {
        let missing = EcsError::MissingComponent {
            entity: self.entity(),
            component: std::any::type_name::<T>(),
        };
        let Some(id) = self.registry.get_id::<T>() else {
            return Err(missing);
        };
        if self.registry.flags(id).contains(ComponentFlags::INDEXED) {
            return Err(EcsError::IndexedRelationAccess(std::any::type_name::<T>()));
        }
        let ptr = self.archetype.component_ptr(id, self.row).ok_or(missing)?;
        // SAFETY: the iterator holds the world mutably and rows are disjoint
        Ok(unsafe { &mut *ptr.cast::<T>() })
    }

    #[must_use]
    pub fn has<T: Component>(&self) -> bool {
        self.registry
            .get_id::<T>()
            .is_some_and(|id| self.archetype.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Frozen;

    fn entities(query: &mut Query, world: &World) -> Vec<Entity> {
        let mut found: Vec<_> = query.iter(world).map(|row| row.entity()).collect();
        found.sort();
        found
    }

    #[test]
    fn test_include_exclude() {
        let mut world = World::new();
        let both = world
            .spawn_bundle((Position { x: 0.0, y: 0.0 }, Velocity { x: 1.0, y: 1.0 }))
            .unwrap();
        let pos_only = world.spawn(Position { x: 0.0, y: 0.0 }).unwrap();
        let _vel_only = world.spawn(Velocity { x: 0.0, y: 0.0 }).unwrap();

        let mut moving = world.query().with::<Position>().with::<Velocity>().build();
        assert_eq!(entities(&mut moving, &world), vec![both]);

        let mut still = world
            .query()
            .with::<Position>()
            .without::<Velocity>()
            .build();
        assert_eq!(entities(&mut still, &world), vec![pos_only]);
    }

    #[test]
    fn test_optional_does_not_filter() {
        let mut world = World::new();
        let a = world.spawn(Position { x: 1.0, y: 0.0 }).unwrap();
        let b = world
            .spawn_bundle((Position { x: 2.0, y: 0.0 }, Velocity { x: 5.0, y: 0.0 }))
            .unwrap();

        let mut query = world.query().with::<Position>().optional::<Velocity>().build();
        let rows: Vec<(Entity, Option<f32>)> = query
            .iter(&world)
            .map(|row| (row.entity(), row.get::<Velocity>().map(|v| v.x)))
            .collect();

        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&(a, None)));
        assert!(rows.contains(&(b, Some(5.0))));
    }

    #[test]
    fn test_new_archetypes_are_picked_up() {
        let mut world = World::new();
        let mut query = world.query().with::<Position>().build();
        assert_eq!(query.count(&world), 0);

        world.spawn(Position { x: 0.0, y: 0.0 }).unwrap();
        world
            .spawn_bundle((Position { x: 0.0, y: 0.0 }, Frozen))
            .unwrap();

        assert_eq!(query.count(&world), 2);
        assert_eq!(query.matched_archetypes().len(), 2);
    }

    #[test]
    fn test_unknown_include_matches_nothing() {
        let mut world = World::new();
        world.spawn(Position { x: 0.0, y: 0.0 }).unwrap();
        let pos = world.component_id::<Position>().unwrap();
        let bogus = ComponentId::from_raw(500);

        let mut query = world.query_ids(&[pos, bogus], &[], &[]);
        assert_eq!(query.iter(&world).count(), 0);

        // Unknown exclude/optional ids are simply never present
        let mut query = world.query_ids(&[pos], &[bogus], &[bogus]);
        assert_eq!(query.iter(&world).count(), 1);
    }

    #[test]
    fn test_iter_mut_writes_through() {
        let mut world = World::new();
        let entity = world
            .spawn_bundle((Position { x: 0.0, y: 0.0 }, Velocity { x: 1.0, y: 2.0 }))
            .unwrap();

        let mut query = world.query().with::<Position>().with::<Velocity>().build();
        for _ in 0..3 {
            for mut row in query.iter_mut(&mut world) {
                let vel = *row.get::<Velocity>().unwrap();
                let pos = row.get_mut::<Position>().unwrap();
                pos.x += vel.x;
                pos.y += vel.y;
            }
        }

        assert_eq!(world.get::<Position>(entity).unwrap(), &Position { x: 3.0, y: 6.0 });
    }

    #[test]
    fn test_order_is_stable_without_mutation() {
        let mut world = World::new();
        for i in 0..10 {
            if i % 2 == 0 {
                world.spawn(Position { x: i as f32, y: 0.0 }).unwrap();
            } else {
                world
                    .spawn_bundle((Position { x: i as f32, y: 0.0 }, Frozen))
                    .unwrap();
            }
        }

        let mut query = world.query().with::<Position>().build();
        let first: Vec<Entity> = query.iter(&world).map(|row| row.entity()).collect();
        let second: Vec<Entity> = query.iter(&world).map(|row| row.entity()).collect();
        assert_eq!(first, second);
        assert_eq!(query.iter(&world).size_hint(), (10, Some(10)));
    }
}
