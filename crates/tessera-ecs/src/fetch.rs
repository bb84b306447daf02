//! Compile-time typed queries.
//!
//! `QueryState<(&mut Position, &Velocity), Without<Frozen>>` resolves its
//! component ids once, validates that it never aliases its own borrows,
//! and caches the archetypes it matches. Iteration hands out typed
//! references straight from the columns.

use std::{any::type_name, fmt, marker::PhantomData};

use crate::{
    World,
    access::{Access, AccessConflict},
    archetype::{Archetype, ArchetypeId},
    component::{Component, ComponentId},
    entity::Entity,
    error::{EcsError, EcsResult},
    world::WorldId,
};

/// Types that can be fetched from a matched archetype row.
///
/// # Safety
///
/// `update_access` must report every component `fetch` reads or writes,
/// and `matches` must only accept archetypes `init_fetch` can serve.
pub unsafe trait QueryData {
    type Item<'w>;
    type Fetch<'w>;
    type State: Send + Sync + 'static;

    fn init_state(world: &mut World) -> Self::State;

    fn update_access(state: &Self::State, access: &mut Access) -> Result<(), AccessConflict>;

    fn matches(state: &Self::State, archetype: &Archetype) -> bool;

    /// # Safety
    ///
    /// `archetype` must satisfy `matches`, and the caller must hold the
    /// borrows declared by `update_access` for `'w`.
    unsafe fn init_fetch<'w>(state: &Self::State, archetype: &'w Archetype) -> Self::Fetch<'w>;

    /// # Safety
    ///
    /// `row` must be in bounds of the archetype passed to `init_fetch`
    /// and must not be fetched twice while a mutable item is alive.
    unsafe fn fetch<'w>(fetch: &mut Self::Fetch<'w>, entity: Entity, row: usize) -> Self::Item<'w>;
}

/// Query data that only reads.
///
/// # Safety
///
/// `update_access` must never register a write.
pub unsafe trait ReadOnlyQueryData: QueryData {}

/// Archetype-level filters that fetch nothing.
pub trait QueryFilter {
    type State: Send + Sync + 'static;

    fn init_state(world: &mut World) -> Self::State;

    fn matches(state: &Self::State, archetype: &Archetype) -> bool;
}

fn column_ptr<T>(archetype: &Archetype, id: ComponentId) -> *mut T {
    archetype
        .column(id)
        .expect("matched archetype stores the queried column")
        .data_ptr()
        .cast::<T>()
}

// SAFETY: registers a read of T and only reads from T's column
unsafe impl<T: Component> QueryData for &T {
    type Item<'w> = &'w T;
    type Fetch<'w> = *const T;
    type State = ComponentId;

    fn init_state(world: &mut World) -> ComponentId {
        world.register_component::<T>()
    }

    fn update_access(state: &ComponentId, access: &mut Access) -> Result<(), AccessConflict> {
        access.add_read(*state)
    }

    fn matches(state: &ComponentId, archetype: &Archetype) -> bool {
        archetype.contains(*state)
    }

    unsafe fn init_fetch<'w>(state: &ComponentId, archetype: &'w Archetype) -> *const T {
        column_ptr::<T>(archetype, *state).cast_const()
    }

    unsafe fn fetch<'w>(fetch: &mut *const T, _entity: Entity, row: usize) -> &'w T {
        // SAFETY: row is in bounds of the column
        unsafe { &*fetch.add(row) }
    }
}

// SAFETY: read-only
unsafe impl<T: Component> ReadOnlyQueryData for &T {}

// SAFETY: registers a write of T
unsafe impl<T: Component> QueryData for &mut T {
    type Item<'w> = &'w mut T;
    type Fetch<'w> = *mut T;
    type State = ComponentId;

    fn init_state(world: &mut World) -> ComponentId {
        world.register_component::<T>()
    }

    fn update_access(state: &ComponentId, access: &mut Access) -> Result<(), AccessConflict> {
        access.add_write(*state)
    }

    fn matches(state: &ComponentId, archetype: &Archetype) -> bool {
        archetype.contains(*state)
    }

    unsafe fn init_fetch<'w>(state: &ComponentId, archetype: &'w Archetype) -> *mut T {
        column_ptr::<T>(archetype, *state)
    }

    unsafe fn fetch<'w>(fetch: &mut *mut T, _entity: Entity, row: usize) -> &'w mut T {
        // SAFETY: each row is fetched once per iteration
        unsafe { &mut *fetch.add(row) }
    }
}

// SAFETY: registers a read of T when present
unsafe impl<T: Component> QueryData for Option<&T> {
    type Item<'w> = Option<&'w T>;
    type Fetch<'w> = Option<*const T>;
    type State = ComponentId;

    fn init_state(world: &mut World) -> ComponentId {
        world.register_component::<T>()
    }

    fn update_access(state: &ComponentId, access: &mut Access) -> Result<(), AccessConflict> {
        access.add_read(*state)
    }

    fn matches(_state: &ComponentId, _archetype: &Archetype) -> bool {
        true
    }

    unsafe fn init_fetch<'w>(state: &ComponentId, archetype: &'w Archetype) -> Option<*const T> {
        archetype
            .column(*state)
            .map(|column| column.data_ptr().cast::<T>().cast_const())
    }

    unsafe fn fetch<'w>(fetch: &mut Option<*const T>, _entity: Entity, row: usize) -> Option<&'w T> {
        // SAFETY: row is in bounds of the column
        fetch.map(|ptr| unsafe { &*ptr.add(row) })
    }
}

// SAFETY: read-only
unsafe impl<T: Component> ReadOnlyQueryData for Option<&T> {}

// SAFETY: registers a write of T when present
unsafe impl<T: Component> QueryData for Option<&mut T> {
    type Item<'w> = Option<&'w mut T>;
    type Fetch<'w> = Option<*mut T>;
    type State = ComponentId;

    fn init_state(world: &mut World) -> ComponentId {
        world.register_component::<T>()
    }

    fn update_access(state: &ComponentId, access: &mut Access) -> Result<(), AccessConflict> {
        access.add_write(*state)
    }

    fn matches(_state: &ComponentId, _archetype: &Archetype) -> bool {
        true
    }

    unsafe fn init_fetch<'w>(state: &ComponentId, archetype: &'w Archetype) -> Option<*mut T> {
        archetype
            .column(*state)
            .map(|column| column.data_ptr().cast::<T>())
    }

    unsafe fn fetch<'w>(fetch: &mut Option<*mut T>, _entity: Entity, row: usize) -> Option<&'w mut T> {
        // SAFETY: each row is fetched once per iteration
        fetch.map(|ptr| unsafe { &mut *ptr.add(row) })
    }
}

// SAFETY: touches no component data
unsafe impl QueryData for Entity {
    type Item<'w> = Self;
    type Fetch<'w> = ();
    type State = ();

    fn init_state(_world: &mut World) {}

    fn update_access(_state: &(), _access: &mut Access) -> Result<(), AccessConflict> {
        Ok(())
    }

    fn matches(_state: &(), _archetype: &Archetype) -> bool {
        true
    }

    unsafe fn init_fetch<'w>(_state: &(), _archetype: &'w Archetype) {}

    unsafe fn fetch<'w>(_fetch: &mut Self::Fetch<'w>, entity: Entity, _row: usize) -> Self::Item<'w> {
        entity
    }
}

// SAFETY: read-only
unsafe impl ReadOnlyQueryData for Entity {}

macro_rules! impl_query_data_tuple {
    ($($name:ident),+) => {
        // SAFETY: delegates to every element
        #[allow(non_snake_case)]
        unsafe impl<$($name: QueryData),+> QueryData for ($($name,)+) {
            type Item<'w> = ($($name::Item<'w>,)+);
            type Fetch<'w> = ($($name::Fetch<'w>,)+);
            type State = ($($name::State,)+);

            fn init_state(world: &mut World) -> Self::State {
                ($($name::init_state(world),)+)
            }

            fn update_access(state: &Self::State, access: &mut Access) -> Result<(), AccessConflict> {
                let ($($name,)+) = state;
                $($name::update_access($name, access)?;)+
                Ok(())
            }

            fn matches(state: &Self::State, archetype: &Archetype) -> bool {
                let ($($name,)+) = state;
                $($name::matches($name, archetype))&&+
            }

            unsafe fn init_fetch<'w>(state: &Self::State, archetype: &'w Archetype) -> Self::Fetch<'w> {
                let ($($name,)+) = state;
                // SAFETY: forwarded contract
                unsafe { ($($name::init_fetch($name, archetype),)+) }
            }

            unsafe fn fetch<'w>(fetch: &mut Self::Fetch<'w>, entity: Entity, row: usize) -> Self::Item<'w> {
                let ($($name,)+) = fetch;
                // SAFETY: forwarded contract
                unsafe { ($($name::fetch($name, entity, row),)+) }
            }
        }

        // SAFETY: every element is read-only
        unsafe impl<$($name: ReadOnlyQueryData),+> ReadOnlyQueryData for ($($name,)+) {}

        #[allow(non_snake_case)]
        impl<$($name: QueryFilter),+> QueryFilter for ($($name,)+) {
            type State = ($($name::State,)+);

            fn init_state(world: &mut World) -> Self::State {
                ($($name::init_state(world),)+)
            }

            fn matches(state: &Self::State, archetype: &Archetype) -> bool {
                let ($($name,)+) = state;
                $($name::matches($name, archetype))&&+
            }
        }
    };
}

impl_query_data_tuple!(A);
impl_query_data_tuple!(A, B);
impl_query_data_tuple!(A, B, C);
impl_query_data_tuple!(A, B, C, D);
impl_query_data_tuple!(A, B, C, D, E);
impl_query_data_tuple!(A, B, C, D, E, F);
impl_query_data_tuple!(A, B, C, D, E, F, G);
impl_query_data_tuple!(A, B, C, D, E, F, G, H);

impl QueryFilter for () {
    type State = ();

    fn init_state(_world: &mut World) {}

    fn matches(_state: &(), _archetype: &Archetype) -> bool {
        true
    }
}

/// Filter: the entity has `T`. Nothing is fetched.
pub struct With<T>(PhantomData<fn() -> T>);

impl<T: Component> QueryFilter for With<T> {
    type State = ComponentId;

    fn init_state(world: &mut World) -> ComponentId {
        world.register_component::<T>()
    }

    fn matches(state: &ComponentId, archetype: &Archetype) -> bool {
        archetype.contains(*state)
    }
}

/// Filter: the entity lacks `T`.
pub struct Without<T>(PhantomData<fn() -> T>);

impl<T: Component> QueryFilter for Without<T> {
    type State = ComponentId;

    fn init_state(world: &mut World) -> ComponentId {
        world.register_component::<T>()
    }

    fn matches(state: &ComponentId, archetype: &Archetype) -> bool {
        !archetype.contains(*state)
    }
}

/// Cached, typed query bound to one world.
pub struct QueryState<D: QueryData, F: QueryFilter = ()> {
    world_id: WorldId,
    data: D::State,
    filter: F::State,
    access: Access,
    matched: Vec<ArchetypeId>,
    seen: usize,
}

impl<D: QueryData, F: QueryFilter> QueryState<D, F> {
    /// # Panics
    ///
    /// When `D` borrows the same component both mutably and otherwise.
    pub fn new(world: &mut World) -> Self {
        match Self::try_new(world) {
            Ok(state) => state,
            Err(conflict) => panic!(
                "query {} conflicts with itself on {conflict}",
                type_name::<D>()
            ),
        }
    }

    pub fn try_new(world: &mut World) -> Result<Self, AccessConflict> {
        let data = D::init_state(world);
        let filter = F::init_state(world);
        let mut access = Access::new();
        D::update_access(&data, &mut access)?;

        let mut state = Self {
            world_id: world.id(),
            data,
            filter,
            access,
            matched: Vec::new(),
            seen: 0,
        };
        state.update_archetypes(world);
        Ok(state)
    }

    #[must_use]
    pub const fn access(&self) -> &Access {
        &self.access
    }

    #[must_use]
    pub fn matched_archetypes(&self) -> &[ArchetypeId] {
        &self.matched
    }

    #[must_use]
    pub fn matches(&self, archetype: &Archetype) -> bool {
        D::matches(&self.data, archetype) && F::matches(&self.filter, archetype)
    }

    /// Pick up archetypes created since the last call.
    ///
    /// # Panics
    ///
    /// When `world` is not the world this state was built from.
    pub fn update_archetypes(&mut self, world: &World) {
        assert_eq!(
            self.world_id,
            world.id(),
            "query state used with a different world than it was built for"
        );
        let archetypes = world.archetypes();
        for archetype in archetypes.iter_from(self.seen) {
            if self.matches(archetype) {
                self.matched.push(archetype.id());
            }
        }
        self.seen = archetypes.len();
    }

    /// Fails when this state writes a component that is an indexed relation.
    ///
    /// Relations can be upgraded to indexed after the state was built, so
    /// every mutable entry point checks again.
    pub fn check_writes(&self, world: &World) -> EcsResult<()> {
        match self.access.writes().find(|&id| world.is_indexed_relation(id)) {
            Some(id) => Err(EcsError::IndexedRelationAccess(world.components().name(id))),
            None => Ok(()),
        }
    }

    pub fn iter<'w, 's>(&'s mut self, world: &'w World) -> QueryIter<'w, 's, D>
    where
        D: ReadOnlyQueryData,
    {
        // SAFETY: read-only data cannot alias a shared world borrow
        unsafe { self.iter_unchecked(world) }
    }

    /// # Panics
    ///
    /// When a written component is an indexed relation; see
    /// [`QueryState::try_iter_mut`].
    pub fn iter_mut<'w, 's>(&'s mut self, world: &'w mut World) -> QueryIter<'w, 's, D> {
        match self.try_iter_mut(world) {
            Ok(iter) => iter,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn try_iter_mut<'w, 's>(
        &'s mut self,
        world: &'w mut World,
    ) -> EcsResult<QueryIter<'w, 's, D>> {
        self.check_writes(world)?;
        // SAFETY: exclusive world borrow covers every declared write
        Ok(unsafe { self.iter_unchecked(world) })
    }

    /// # Safety
    ///
    /// The caller must guarantee nothing else accesses the components
    /// this state writes for `'w`, and that [`QueryState::check_writes`]
    /// passed against the current world.
    pub unsafe fn iter_unchecked<'w, 's>(&'s mut self, world: &'w World) -> QueryIter<'w, 's, D> {
        self.update_archetypes(world);
        QueryIter {
            world,
            state: &self.data,
            archetypes: self.matched.iter(),
            current: None,
            row: 0,
        }
    }

    pub fn count(&mut self, world: &World) -> usize {
        self.update_archetypes(world);
        self.matched
            .iter()
            .map(|&id| world.archetypes()[id].len())
            .sum()
    }

    /// Fetch the data of one entity.
    pub fn get<'w>(&mut self, world: &'w World, entity: Entity) -> EcsResult<D::Item<'w>>
    where
        D: ReadOnlyQueryData,
    {
        // SAFETY: read-only
        unsafe { self.get_unchecked(world, entity) }
    }

    pub fn get_mut<'w>(&mut self, world: &'w mut World, entity: Entity) -> EcsResult<D::Item<'w>> {
        // SAFETY: exclusive world borrow
        unsafe { self.get_unchecked(world, entity) }
    }

    /// # Safety
    ///
    /// Same contract as [`QueryState::iter_unchecked`].
    pub unsafe fn get_unchecked<'w>(
        &mut self,
        world: &'w World,
        entity: Entity,
    ) -> EcsResult<D::Item<'w>> {
        self.check_writes(world)?;
        self.update_archetypes(world);
        let location = world.location(entity)?;
        let archetype = &world.archetypes()[location.archetype_id];
        if !self.matches(archetype) {
            return Err(EcsError::MissingComponent {
                entity,
                component: type_name::<D>(),
            });
        }
        // SAFETY: archetype matches and the row belongs to entity
        unsafe {
            let mut fetch = D::init_fetch(&self.data, archetype);
            Ok(D::fetch(&mut fetch, entity, location.row))
        }
    }
}

impl<D: QueryData, F: QueryFilter> fmt::Debug for QueryState<D, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("data", &type_name::<D>())
            .field("filter", &type_name::<F>())
            .field("matched", &self.matched.len())
            .finish_non_exhaustive()
    }
}

/// Iterator produced by [`QueryState`].
pub struct QueryIter<'w, 's, D: QueryData> {
    world: &'w World,
    state: &'s D::State,
    archetypes: std::slice::Iter<'s, ArchetypeId>,
    current: Option<(&'w Archetype, D::Fetch<'w>)>,
    row: usize,
}

impl<'w, D: QueryData> Iterator for QueryIter<'w, '_, D> {
    type Item = D::Item<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((archetype, fetch)) = &mut self.current {
                if self.row < archetype.len() {
                    let row = self.row;
                    self.row += 1;
                    let entity = archetype.entities()[row];
                    // SAFETY: row in bounds and visited once
                    return Some(unsafe { D::fetch(fetch, entity, row) });
                }
            }

            let &id = self.archetypes.next()?;
            let archetype = &self.world.archetypes()[id];
            if archetype.is_empty() {
                continue;
            }
            // SAFETY: only matched archetypes are listed
            let fetch = unsafe { D::init_fetch(self.state, archetype) };
            self.current = Some((archetype, fetch));
            self.row = 0;
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let current = self
            .current
            .as_ref()
            .map_or(0, |(archetype, _)| archetype.len() - self.row);
        let rest: usize = self
            .archetypes
            .clone()
            .map(|&id| self.world.archetypes()[id].len())
            .sum();
        (current + rest, Some(current + rest))
    }
}
