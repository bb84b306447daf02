//! The World - central container for all ECS data.
//!
//! Owns the entity table, component registry, archetype storage, the
//! relation index and resources. Every structural change goes through
//! here so the entity table always records the row an entity occupies.

use std::{
    any::type_name,
    fmt,
    mem::ManuallyDrop,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use smallvec::SmallVec;
use tracing::trace;

use crate::{
    archetype::{ArchetypeId, ArchetypeStorage, Leftover, Moved},
    bundle::{Bundle, find_duplicate},
    component::{Component, ComponentFlags, ComponentId, ComponentRegistry},
    entity::{Entities, Entity, EntityLocation},
    error::{EcsError, EcsResult},
    fetch::{QueryData, QueryFilter, QueryState},
    query::{Query, QueryBuilder, QueryDescriptor},
    relation::RelationIndex,
    resource::{Res, ResMut, Resource, Resources},
};

static NEXT_WORLD_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies a world; cached query state is bound to the world that built it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorldId(u64);

/// The ECS World containing all entities, components and resources.
pub struct World {
    id: WorldId,
    pub(crate) entities: Entities,
    pub(crate) components: ComponentRegistry,
    pub(crate) archetypes: ArchetypeStorage,
    pub(crate) relations: RelationIndex,
    resources: Resources,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create a new empty world.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a world with pre-allocated entity slots.
    #[must_use]
    pub fn with_capacity(entities: usize) -> Self {
        Self {
            id: WorldId(NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed)),
            entities: Entities::with_capacity(entities),
            components: ComponentRegistry::new(),
            archetypes: ArchetypeStorage::new(),
            relations: RelationIndex::default(),
            resources: Resources::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> WorldId {
        self.id
    }

    // ==================== Registry ====================

    /// Register a component type and get its ID.
    pub fn register_component<T: Component>(&mut self) -> ComponentId {
        self.components.register::<T>()
    }

    /// Get the component ID for a type, if registered.
    #[must_use]
    pub fn component_id<T: Component>(&self) -> Option<ComponentId> {
        self.components.get_id::<T>()
    }

    #[must_use]
    pub const fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    #[must_use]
    pub const fn archetypes(&self) -> &ArchetypeStorage {
        &self.archetypes
    }

    #[must_use]
    pub const fn entities(&self) -> &Entities {
        &self.entities
    }

    /// Registered relation types and their edge indices.
    #[must_use]
    pub const fn relations(&self) -> &RelationIndex {
        &self.relations
    }

    // ==================== Entity Table ====================

    /// Get the number of alive entities.
    #[must_use]
    pub fn entity_count(&self) -> u32 {
        self.entities.alive_count()
    }

    /// Check if an entity is alive.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Archetype and row of a live entity.
    pub fn location(&self, entity: Entity) -> EcsResult<EntityLocation> {
        self.entities
            .location(entity)
            .ok_or(EcsError::StaleHandle(entity))
    }

    /// Create an entity with no components.
    pub fn spawn_empty(&mut self) -> Entity {
        let entity = self.entities.allocate();
        let row = self.archetypes[ArchetypeId::EMPTY].push_entity(entity);
        self.entities.set_location(
            entity,
            EntityLocation {
                archetype_id: ArchetypeId::EMPTY,
                row,
            },
        );
        entity
    }

    /// Spawn an entity with a single component.
    pub fn spawn<T: Component>(&mut self, component: T) -> EcsResult<Entity> {
        self.spawn_bundle((component,))
    }

    /// Spawn an entity directly into the archetype of `bundle`.
    pub fn spawn_bundle<B: Bundle>(&mut self, bundle: B) -> EcsResult<Entity> {
        let (archetype_id, ids) = self.bundle_archetype::<B>()?;
        let entity = self.entities.allocate();
        self.write_bundle(archetype_id, entity, &ids, bundle);
        self.after_spawn(entity, &ids)?;
        Ok(entity)
    }

    /// Spawn `count` copies of `template` into one archetype, sizing its
    /// columns once up front.
    pub fn spawn_batch<B: Bundle + Clone>(
        &mut self,
        count: usize,
        template: B,
    ) -> EcsResult<Vec<Entity>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let (archetype_id, ids) = self.bundle_archetype::<B>()?;
        self.archetypes[archetype_id].reserve(count);
        self.entities.reserve(count);

        // The first spawn validates relation targets; every copy shares them.
        let first = self.spawn_bundle(template.clone())?;
        let mut spawned = Vec::with_capacity(count);
        spawned.push(first);

        for _ in 1..count {
            let entity = self.entities.allocate();
            self.write_bundle(archetype_id, entity, &ids, template.clone());
            spawned.push(entity);
        }

        let indexed: SmallVec<[ComponentId; 4]> = ids
            .iter()
            .copied()
            .filter(|&id| self.is_indexed_relation(id))
            .collect();
        for &entity in &spawned[1..] {
            for &id in &indexed {
                self.index_relation(entity, id);
            }
        }

        trace!(count, ?archetype_id, "spawned batch");
        Ok(spawned)
    }

    /// Destroy an entity and drop all of its components.
    ///
    /// Indexed relation edges pointing at the entity are removed from their
    /// sources first.
    pub fn despawn(&mut self, entity: Entity) -> EcsResult<()> {
        if !self.is_alive(entity) {
            return Err(EcsError::StaleHandle(entity));
        }

        self.detach_relations(entity)?;

        // Detaching may have migrated the entity itself, so re-read its row
        let location = self.location(entity)?;
        if let Some(displaced) = self.archetypes[location.archetype_id].remove_row(location.row) {
            self.entities.set_row(displaced, location.row);
        }
        self.entities.free(entity);

        Ok(())
    }

    // ==================== Components ====================

    /// Add a component the entity does not have yet.
    pub fn add<T: Component>(&mut self, entity: Entity, component: T) -> EcsResult<()> {
        let id = self.components.register::<T>();
        let location = self.location(entity)?;

        if self.archetypes[location.archetype_id].contains(id) {
            return Err(EcsError::DuplicateComponent {
                entity,
                component: type_name::<T>(),
            });
        }

        let component = ManuallyDrop::new(component);
        let ptr = std::ptr::from_ref::<T>(&component).cast::<u8>();
        if self.is_indexed_relation(id) {
            if let Err(err) = self.check_relation_targets(id, ptr) {
                drop(ManuallyDrop::into_inner(component));
                return Err(err);
            }
        }

        // SAFETY: ptr points at a T registered under id; ownership moves into storage
        unsafe { self.push_new_component(entity, location, id, ptr) };

        if self.is_indexed_relation(id) {
            self.index_relation(entity, id);
        }
        Ok(())
    }

    /// Add a component or replace the existing one, returning the old value.
    pub fn insert<T: Component>(&mut self, entity: Entity, component: T) -> EcsResult<Option<T>> {
        let id = self.components.register::<T>();
        let location = self.location(entity)?;
        let indexed = self.is_indexed_relation(id);

        if indexed {
            self.check_relation_targets(id, std::ptr::from_ref::<T>(&component).cast())?;
        }

        let Some(ptr) = self.archetypes[location.archetype_id].component_ptr(id, location.row)
        else {
            self.add(entity, component)?;
            return Ok(None);
        };

        if indexed {
            self.unindex_relation(entity, id);
        }
        // SAFETY: the column under id stores T
        let old = std::mem::replace(unsafe { &mut *ptr.cast::<T>() }, component);
        if indexed {
            self.index_relation(entity, id);
        }
        Ok(Some(old))
    }

    /// Remove a component, returning its value.
    pub fn remove<T: Component>(&mut self, entity: Entity) -> EcsResult<T> {
        let location = self.location(entity)?;
        let missing = || EcsError::MissingComponent {
            entity,
            component: type_name::<T>(),
        };

        let id = self.components.get_id::<T>().ok_or_else(missing)?;
        if !self.archetypes[location.archetype_id].contains(id) {
            return Err(missing());
        }

        if self.is_indexed_relation(id) {
            self.unindex_relation(entity, id);
        }

        let ptr = self.archetypes[location.archetype_id]
            .component_ptr(id, location.row)
            .ok_or_else(missing)?;
        // SAFETY: the column under id stores T; the slot is forgotten by the move below
        let value = unsafe { std::ptr::read(ptr.cast::<T>()) };
        self.remove_from_table(entity, location, id, Leftover::Forget);

        Ok(value)
    }

    /// Remove and drop a component by id.
    pub fn remove_by_id(&mut self, entity: Entity, id: ComponentId) -> EcsResult<()> {
        let location = self.location(entity)?;
        if self.components.get_info(id).is_none() {
            return Err(EcsError::UnknownComponent(id));
        }
        if !self.archetypes[location.archetype_id].contains(id) {
            return Err(EcsError::MissingComponent {
                entity,
                component: self.components.name(id),
            });
        }

        if self.is_indexed_relation(id) {
            self.unindex_relation(entity, id);
        }
        self.remove_from_table(entity, location, id, Leftover::Drop);
        Ok(())
    }

    /// Get a reference to a component.
    pub fn get<T: Component>(&self, entity: Entity) -> EcsResult<&T> {
        let location = self.location(entity)?;
        self.components
            .get_id::<T>()
            // SAFETY: the column under this id stores T
            .and_then(|id| unsafe { self.archetypes[location.archetype_id].get::<T>(id, location.row) })
            .ok_or(EcsError::MissingComponent {
                entity,
                component: type_name::<T>(),
            })
    }

    /// Get a mutable reference to a component.
    ///
    /// Indexed relation components are refused because rewriting their
    /// targets would desynchronize the index; use the relation API instead.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> EcsResult<&mut T> {
        let location = self.location(entity)?;
        let missing = EcsError::MissingComponent {
            entity,
            component: type_name::<T>(),
        };
        let Some(id) = self.components.get_id::<T>() else {
            return Err(missing);
        };
        if self.is_indexed_relation(id) {
            return Err(EcsError::IndexedRelationAccess(type_name::<T>()));
        }
        // SAFETY: the column under this id stores T
        unsafe { self.archetypes[location.archetype_id].get_mut::<T>(id, location.row) }
            .ok_or(missing)
    }

    /// Check if an entity has a component.
    #[must_use]
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.components
            .get_id::<T>()
            .is_some_and(|id| self.has_id(entity, id))
    }

    #[must_use]
    pub fn has_id(&self, entity: Entity, id: ComponentId) -> bool {
        self.entities
            .location(entity)
            .is_some_and(|location| self.archetypes[location.archetype_id].contains(id))
    }

    /// Sorted component ids of a live entity.
    pub fn component_ids(&self, entity: Entity) -> EcsResult<&[ComponentId]> {
        let location = self.location(entity)?;
        Ok(self.archetypes[location.archetype_id].components())
    }

    /// Untyped pointer to one component of a live entity.
    pub fn component_ptr(&self, entity: Entity, id: ComponentId) -> EcsResult<NonNull<u8>> {
        self.component_raw(entity, id)
            .and_then(NonNull::new)
            .ok_or_else(|| EcsError::MissingComponent {
                entity,
                component: self.components.name(id),
            })
    }

    /// Every component of a live entity as `(id, bytes)`, in id order.
    ///
    /// # Safety
    ///
    /// Every component type on the entity must be free of padding and
    /// interior pointers whose bytes the caller is not allowed to read.
    pub unsafe fn component_bytes(&self, entity: Entity) -> EcsResult<Vec<(ComponentId, &[u8])>> {
        let location = self.location(entity)?;
        let archetype = &self.archetypes[location.archetype_id];

        Ok(archetype
            .columns()
            .iter()
            .map(|column| {
                let info = column.info();
                // SAFETY: row is live; caller vouches the bytes are initialized
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        column.get_unchecked_raw(location.row).cast_const(),
                        info.size(),
                    )
                };
                (info.id(), bytes)
            })
            .collect())
    }

    /// Rebuild an entity from `(id, bytes)` pairs, in any order.
    ///
    /// # Safety
    ///
    /// Each byte span must be a valid value of the type registered under its
    /// id, and the world takes ownership of it (it will be dropped later).
    pub unsafe fn spawn_from_bytes(&mut self, components: &[(ComponentId, &[u8])]) -> EcsResult<Entity> {
        let mut ids: SmallVec<[ComponentId; 8]> = SmallVec::with_capacity(components.len());
        for &(id, bytes) in components {
            let info = self
                .components
                .get_info(id)
                .ok_or(EcsError::UnknownComponent(id))?;
            if bytes.len() != info.size() {
                return Err(EcsError::ComponentSize {
                    component: info.name(),
                    expected: info.size(),
                    actual: bytes.len(),
                });
            }
            ids.push(id);
        }
        if let Some(id) = find_duplicate(&ids) {
            return Err(EcsError::DuplicateComponent {
                entity: Entity::PLACEHOLDER,
                component: self.components.name(id),
            });
        }

        let archetype_id = self.archetypes.get_or_create(&ids, &self.components);
        let entity = self.entities.allocate();
        let archetype = &mut self.archetypes[archetype_id];
        let row = archetype.push_entity(entity);
        for &(id, bytes) in components {
            // SAFETY: size checked above, validity vouched for by the caller
            unsafe { archetype.push_component(id, bytes.as_ptr()) };
        }
        self.entities
            .set_location(entity, EntityLocation { archetype_id, row });

        self.after_spawn(entity, &ids)?;
        Ok(entity)
    }

    // ==================== Queries ====================

    /// Start building a runtime query.
    pub fn query(&mut self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Query by component ids. Unknown include ids match nothing.
    #[must_use]
    pub fn query_ids(
        &self,
        include: &[ComponentId],
        exclude: &[ComponentId],
        optional: &[ComponentId],
    ) -> Query {
        Query::new(self, QueryDescriptor::new(include, exclude, optional))
    }

    /// Typed query state for `D`.
    pub fn query_state<D: QueryData>(&mut self) -> QueryState<D> {
        QueryState::new(self)
    }

    /// Typed query state for `D` restricted by the archetype filter `F`.
    pub fn query_filtered<D: QueryData, F: QueryFilter>(&mut self) -> QueryState<D, F> {
        QueryState::new(self)
    }

    // ==================== Resources ====================

    /// Insert a resource, returning the previous value of the same type.
    pub fn insert_resource<T: Resource>(&mut self, value: T) -> Option<T> {
        self.resources.insert(value)
    }

    /// Insert `T::default()` unless the resource already exists.
    pub fn init_resource<T: Resource + Default>(&mut self) {
        if !self.resources.contains::<T>() {
            self.resources.insert(T::default());
        }
    }

    pub fn remove_resource<T: Resource>(&mut self) -> Option<T> {
        self.resources.remove()
    }

    #[must_use]
    pub fn contains_resource<T: Resource>(&self) -> bool {
        self.resources.contains::<T>()
    }

    /// Shared borrow of a resource.
    pub fn resource<T: Resource>(&self) -> EcsResult<Res<'_, T>> {
        self.resources.get()
    }

    /// Exclusive borrow of a resource through `&self`.
    ///
    /// Fails with [`EcsError::ResourceBorrowed`] instead of blocking when
    /// another borrow of the same resource is alive.
    pub fn resource_mut<T: Resource>(&self) -> EcsResult<ResMut<'_, T>> {
        self.resources.get_mut()
    }

    /// Plain `&mut` access when the world is held exclusively.
    pub fn get_resource_mut<T: Resource>(&mut self) -> EcsResult<&mut T> {
        self.resources.get_exclusive()
    }

    /// Temporarily take a resource out so `f` can use it alongside `&mut World`.
    pub fn resource_scope<T: Resource, U>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut T) -> U,
    ) -> EcsResult<U> {
        let mut value = self
            .resources
            .remove::<T>()
            .ok_or(EcsError::ResourceNotFound(type_name::<T>()))?;
        let out = f(self, &mut value);
        self.resources.insert(value);
        Ok(out)
    }

    #[must_use]
    pub const fn resources(&self) -> &Resources {
        &self.resources
    }

    // ==================== Internals ====================

    pub(crate) fn component_raw(&self, entity: Entity, id: ComponentId) -> Option<*mut u8> {
        let location = self.entities.location(entity)?;
        self.archetypes[location.archetype_id].component_ptr(id, location.row)
    }

    pub(crate) fn is_indexed_relation(&self, id: ComponentId) -> bool {
        self.components
            .flags(id)
            .contains(ComponentFlags::INDEXED)
    }

    fn bundle_archetype<B: Bundle>(
        &mut self,
    ) -> EcsResult<(ArchetypeId, SmallVec<[ComponentId; 8]>)> {
        let mut ids = SmallVec::new();
        B::register(&mut self.components, &mut ids);
        if let Some(id) = find_duplicate(&ids) {
            return Err(EcsError::DuplicateComponent {
                entity: Entity::PLACEHOLDER,
                component: self.components.name(id),
            });
        }
        let archetype_id = self.archetypes.get_or_create(&ids, &self.components);
        Ok((archetype_id, ids))
    }

    fn write_bundle<B: Bundle>(
        &mut self,
        archetype_id: ArchetypeId,
        entity: Entity,
        ids: &[ComponentId],
        bundle: B,
    ) {
        let archetype = &mut self.archetypes[archetype_id];
        let row = archetype.push_entity(entity);
        let mut next = ids.iter();
        bundle.take(&mut |ptr| {
            if let Some(&id) = next.next() {
                // SAFETY: Bundle yields pointers in the order of `ids`
                unsafe { archetype.push_component(id, ptr) };
            }
        });
        self.entities
            .set_location(entity, EntityLocation { archetype_id, row });
    }

    /// Validate and index relation components of a freshly written entity.
    ///
    /// On failure the entity is destroyed again.
    fn after_spawn(&mut self, entity: Entity, ids: &[ComponentId]) -> EcsResult<()> {
        let indexed: SmallVec<[ComponentId; 4]> = ids
            .iter()
            .copied()
            .filter(|&id| self.is_indexed_relation(id))
            .collect();
        if indexed.is_empty() {
            return Ok(());
        }

        let checked = indexed.iter().try_for_each(|&id| match self.component_raw(entity, id) {
            Some(ptr) => self.check_relation_targets(id, ptr),
            None => Ok(()),
        });
        if let Err(err) = checked {
            self.despawn(entity)?;
            return Err(err);
        }

        for id in indexed {
            self.index_relation(entity, id);
        }
        Ok(())
    }

    /// Move an entity into `location.archetype + {id}` and push the new value.
    unsafe fn push_new_component(
        &mut self,
        entity: Entity,
        location: EntityLocation,
        id: ComponentId,
        value: *const u8,
    ) {
        let dst = self
            .archetypes
            .with_component(location.archetype_id, id, &self.components);
        // SAFETY: location is live and dst differs from the source
        let moved = unsafe {
            self.archetypes
                .move_row(location.archetype_id, location.row, dst, Leftover::Drop)
        };
        unsafe { self.archetypes[dst].push_component(id, value) };
        self.commit_move(entity, location, dst, moved);
    }

    fn remove_from_table(
        &mut self,
        entity: Entity,
        location: EntityLocation,
        id: ComponentId,
        leftover: Leftover,
    ) {
        let dst = self
            .archetypes
            .without_component(location.archetype_id, id, &self.components);
        // SAFETY: location is live and dst differs from the source
        let moved = unsafe {
            self.archetypes
                .move_row(location.archetype_id, location.row, dst, leftover)
        };
        self.commit_move(entity, location, dst, moved);
    }

    fn commit_move(&mut self, entity: Entity, from: EntityLocation, dst: ArchetypeId, moved: Moved) {
        if let Some(displaced) = moved.displaced {
            self.entities.set_row(displaced, from.row);
        }
        self.entities.set_location(
            entity,
            EntityLocation {
                archetype_id: dst,
                row: moved.row,
            },
        );
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entities.alive_count())
            .field("archetypes", &self.archetypes.len())
            .field("components", &self.components.len())
            .field("relations", &self.relations.len())
            .field("resources", &self.resources.len())
            .finish()
    }
}
