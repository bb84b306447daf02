//! The procedure parameter catalog.
//!
//! Every parameter kind implements two steps:
//!
//! - **analyze** runs once per procedure: it resolves ids, validates the
//!   wiring, records the access, and returns a persistent state;
//! - **apply** runs on every invocation: it turns that state plus the
//!   world into the live value handed to the function.
//!
//! The procedure invoker only ever calls these two (plus an optional
//! `flush` for deferred work), so new kinds can be added outside this
//! crate by implementing [`ProcedureParam`].

use std::{
    any::{Any, TypeId, type_name},
    borrow::Cow,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use rustc_hash::FxHashMap;
use tessera_ecs::{
    Component, EcsError, Entity, QueryData, QueryFilter, QueryIter, QueryState, ReadOnlyQueryData,
    Relation, RelationMode, Res, ResMut, Resource, World,
};
use tessera_event::{Event, EventCursor, EventId, EventRecord, Events};

use crate::{
    error::{TickError, TickResult},
    procedure::ProcedureMeta,
};

/// The live value of parameter `P`.
pub type ParamItem<'w, 's, P> = <P as ProcedureParam>::Item<'w, 's>;

/// A parameter kind a procedure function may take.
///
/// # Safety
///
/// `analyze` must record every component and resource `apply` hands out,
/// with the right mutability.
pub unsafe trait ProcedureParam {
    /// Per-procedure storage that outlives a single run.
    type State: Send + Sync + 'static;

    type Item<'w, 's>;

    fn analyze(world: &mut World, meta: &mut ProcedureMeta) -> TickResult<Self::State>;

    /// # Safety
    ///
    /// No other live value may hold access conflicting with what
    /// `analyze` recorded for this state.
    unsafe fn apply<'w, 's>(
        state: &'s mut Self::State,
        world: &'w World,
        args: &'w Args,
    ) -> TickResult<Self::Item<'w, 's>>;

    /// Apply deferred work once the procedure returned.
    fn flush(_state: &mut Self::State, _world: &mut World) -> TickResult<()> {
        Ok(())
    }
}

// ==================== Arguments ====================

/// Extra values supplied to one `run_stages_with` call, keyed by type.
#[derive(Default)]
pub struct Args {
    values: FxHashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Args {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Insert a value, returning the previous one of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast().ok().map(|b| *b))
    }

    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>())?.downcast_ref()
    }

    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args").field("len", &self.values.len()).finish()
    }
}

/// A raw extra argument of type `T` passed to the current run.
///
/// Fails the run with [`TickError::ArgumentMissing`] when absent.
pub struct Arg<'w, T: 'static>(&'w T);

impl<T: 'static> Deref for Arg<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.0
    }
}

// SAFETY: reads only from `Args`, never from the world
unsafe impl<T: Send + Sync + 'static> ProcedureParam for Arg<'_, T> {
    type State = ();
    type Item<'w, 's> = Arg<'w, T>;

    fn analyze(_world: &mut World, _meta: &mut ProcedureMeta) -> TickResult<()> {
        Ok(())
    }

    unsafe fn apply<'w, 's>(_state: &'s mut (), _world: &'w World, args: &'w Args) -> TickResult<Arg<'w, T>> {
        args.get::<T>()
            .map(Arg)
            .ok_or(TickError::ArgumentMissing(type_name::<T>()))
    }
}

// SAFETY: reads only from `Args`
unsafe impl<T: Send + Sync + 'static> ProcedureParam for Option<Arg<'_, T>> {
    type State = ();
    type Item<'w, 's> = Option<Arg<'w, T>>;

    fn analyze(_world: &mut World, _meta: &mut ProcedureMeta) -> TickResult<()> {
        Ok(())
    }

    unsafe fn apply<'w, 's>(
        _state: &'s mut (),
        _world: &'w World,
        args: &'w Args,
    ) -> TickResult<Option<Arg<'w, T>>> {
        Ok(args.get::<T>().map(Arg))
    }
}

// ==================== Local ====================

/// State private to one procedure that persists between its runs.
///
/// Two procedures (even two instances of the same function) never share
/// a `Local`.
pub struct Local<'s, T: Send + Sync + Default + 'static>(&'s mut T);

impl<T: Send + Sync + Default> Deref for Local<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.0
    }
}

impl<T: Send + Sync + Default> DerefMut for Local<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.0
    }
}

// SAFETY: touches only procedure-owned state
unsafe impl<T: Send + Sync + Default + 'static> ProcedureParam for Local<'_, T> {
    type State = T;
    type Item<'w, 's> = Local<'s, T>;

    fn analyze(_world: &mut World, _meta: &mut ProcedureMeta) -> TickResult<T> {
        Ok(T::default())
    }

    unsafe fn apply<'w, 's>(state: &'s mut T, _world: &'w World, _args: &'w Args) -> TickResult<Local<'s, T>> {
        Ok(Local(state))
    }
}

// ==================== Resources ====================

fn resource_error<T: Resource>(err: EcsError) -> TickError {
    match err {
        EcsError::ResourceNotFound(_) => EcsError::ResourceNotFound(type_name::<T>()).into(),
        other => other.into(),
    }
}

// SAFETY: records a shared resource read
unsafe impl<T: Resource> ProcedureParam for Res<'_, T> {
    type State = ();
    type Item<'w, 's> = Res<'w, T>;

    fn analyze(_world: &mut World, meta: &mut ProcedureMeta) -> TickResult<()> {
        meta.record(|access| access.add_resource_read(TypeId::of::<T>()))
    }

    unsafe fn apply<'w, 's>(_state: &'s mut (), world: &'w World, _args: &'w Args) -> TickResult<Res<'w, T>> {
        world.resource::<T>().map_err(resource_error::<T>)
    }
}

// SAFETY: records a resource write
unsafe impl<T: Resource> ProcedureParam for ResMut<'_, T> {
    type State = ();
    type Item<'w, 's> = ResMut<'w, T>;

    fn analyze(_world: &mut World, meta: &mut ProcedureMeta) -> TickResult<()> {
        meta.record(|access| access.add_resource_write(TypeId::of::<T>()))
    }

    unsafe fn apply<'w, 's>(_state: &'s mut (), world: &'w World, _args: &'w Args) -> TickResult<ResMut<'w, T>> {
        world.resource_mut::<T>().map_err(resource_error::<T>)
    }
}

// SAFETY: records a shared resource read
unsafe impl<T: Resource> ProcedureParam for Option<Res<'_, T>> {
    type State = ();
    type Item<'w, 's> = Option<Res<'w, T>>;

    fn analyze(_world: &mut World, meta: &mut ProcedureMeta) -> TickResult<()> {
        meta.record(|access| access.add_resource_read(TypeId::of::<T>()))
    }

    unsafe fn apply<'w, 's>(
        _state: &'s mut (),
        world: &'w World,
        _args: &'w Args,
    ) -> TickResult<Option<Res<'w, T>>> {
        match world.resource::<T>() {
            Ok(res) => Ok(Some(res)),
            Err(EcsError::ResourceNotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

// ==================== Queries ====================

/// Typed query over the world, with matches cached across runs.
pub struct Query<'w, 's, D: QueryData + 'static, F: QueryFilter + 'static = ()> {
    world: &'w World,
    state: &'s mut QueryState<D, F>,
}

impl<D: QueryData + 'static, F: QueryFilter + 'static> Query<'_, '_, D, F> {
    /// Shared iteration.
    pub fn iter(&mut self) -> QueryIter<'_, '_, D>
    where
        D: ReadOnlyQueryData,
    {
        self.state.iter(self.world)
    }

    /// Mutable iteration; items borrow this parameter.
    pub fn iter_mut(&mut self) -> QueryIter<'_, '_, D> {
        // SAFETY: the procedure's access was validated against every other
        // parameter, and no other procedure runs concurrently
        unsafe { self.state.iter_unchecked(self.world) }
    }

    pub fn get(&mut self, entity: Entity) -> TickResult<D::Item<'_>>
    where
        D: ReadOnlyQueryData,
    {
        Ok(self.state.get(self.world, entity)?)
    }

    pub fn get_mut(&mut self, entity: Entity) -> TickResult<D::Item<'_>> {
        // SAFETY: same reasoning as iter_mut
        Ok(unsafe { self.state.get_unchecked(self.world, entity) }?)
    }

    pub fn count(&mut self) -> usize {
        self.state.count(self.world)
    }

    pub fn is_empty(&mut self) -> bool {
        self.count() == 0
    }
}

// SAFETY: records the query's own (self-consistent) access
unsafe impl<D: QueryData + 'static, F: QueryFilter + 'static> ProcedureParam for Query<'_, '_, D, F> {
    type State = QueryState<D, F>;
    type Item<'w, 's> = Query<'w, 's, D, F>;

    fn analyze(world: &mut World, meta: &mut ProcedureMeta) -> TickResult<QueryState<D, F>> {
        let state = QueryState::<D, F>::try_new(world).map_err(|conflict| TickError::ConflictingAccess {
            procedure: meta.name(),
            conflict,
        })?;
        meta.record(|access| access.try_extend(state.access()))?;
        state.check_writes(world)?;
        Ok(state)
    }

    unsafe fn apply<'w, 's>(
        state: &'s mut QueryState<D, F>,
        world: &'w World,
        _args: &'w Args,
    ) -> TickResult<Query<'w, 's, D, F>> {
        // Relations may have become indexed since analysis
        state.check_writes(world)?;
        Ok(Query { world, state })
    }
}

// ==================== Events ====================

fn require_store<T: Event>(world: &World) -> TickResult<()> {
    if world.contains_resource::<Events<T>>() {
        Ok(())
    } else {
        Err(EcsError::EventStoreMissing(type_name::<T>()).into())
    }
}

fn store_error<T: Event>(err: EcsError) -> TickError {
    match err {
        EcsError::ResourceNotFound(_) => EcsError::EventStoreMissing(type_name::<T>()).into(),
        other => other.into(),
    }
}

/// Reads events of type `T` not yet seen by this procedure.
pub struct EventReader<'w, 's, T: Event> {
    events: Res<'w, Events<T>>,
    cursor: &'s mut EventCursor,
}

impl<T: Event> EventReader<'_, '_, T> {
    /// Unseen records, oldest first; they count as seen afterwards.
    pub fn read(&mut self) -> impl ExactSizeIterator<Item = &EventRecord<T>> {
        self.events.read(self.cursor)
    }

    /// Next unseen record.
    pub fn read_next(&mut self) -> Option<&EventRecord<T>> {
        self.events.read_next(self.cursor)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.unread(self.cursor)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events overwritten before this reader could see them.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.events.missed(self.cursor)
    }
}

// SAFETY: records a shared read of the store
unsafe impl<T: Event> ProcedureParam for EventReader<'_, '_, T> {
    type State = EventCursor;
    type Item<'w, 's> = EventReader<'w, 's, T>;

    fn analyze(world: &mut World, meta: &mut ProcedureMeta) -> TickResult<EventCursor> {
        require_store::<T>(world)?;
        meta.record(|access| access.add_resource_read(TypeId::of::<Events<T>>()))?;
        Ok(EventCursor::default())
    }

    unsafe fn apply<'w, 's>(
        cursor: &'s mut EventCursor,
        world: &'w World,
        _args: &'w Args,
    ) -> TickResult<EventReader<'w, 's, T>> {
        let events = world.resource::<Events<T>>().map_err(store_error::<T>)?;
        Ok(EventReader { events, cursor })
    }
}

/// Writes events of type `T`.
pub struct EventWriter<'w, T: Event> {
    events: ResMut<'w, Events<T>>,
}

impl<T: Event> EventWriter<'_, T> {
    pub fn send(&mut self, event: T) -> EventId {
        self.events.write(event)
    }

    pub fn send_batch(&mut self, events: impl IntoIterator<Item = T>) {
        for event in events {
            self.events.write(event);
        }
    }

    /// Flag a record as handled, so the cleanup procedure purges it.
    pub fn mark_handled(&self, id: EventId) -> bool {
        self.events.mark_handled(id)
    }
}

// SAFETY: records a write of the store
unsafe impl<T: Event> ProcedureParam for EventWriter<'_, T> {
    type State = ();
    type Item<'w, 's> = EventWriter<'w, T>;

    fn analyze(world: &mut World, meta: &mut ProcedureMeta) -> TickResult<()> {
        require_store::<T>(world)?;
        meta.record(|access| access.add_resource_write(TypeId::of::<Events<T>>()))
    }

    unsafe fn apply<'w, 's>(_state: &'s mut (), world: &'w World, _args: &'w Args) -> TickResult<EventWriter<'w, T>> {
        let events = world.resource_mut::<Events<T>>().map_err(store_error::<T>)?;
        Ok(EventWriter { events })
    }
}

// ==================== Relations ====================

/// Read-only view of relation `R` and its index.
///
/// Edges are changed through [`Commands`](crate::Commands) or an
/// exclusive procedure.
pub struct Relations<'w, R: Component> {
    world: &'w World,
    _marker: PhantomData<fn() -> R>,
}

impl<'w, R: Component> Relations<'w, R> {
    /// Targets of `source`.
    #[must_use]
    pub fn parents(&self, source: Entity) -> &'w [Entity] {
        self.world.parents::<R>(source)
    }

    #[must_use]
    pub fn parent(&self, source: Entity) -> Option<Entity> {
        self.world.parent::<R>(source)
    }

    /// Sources pointing at `target`.
    #[must_use]
    pub fn children(&self, target: Entity) -> Cow<'w, [Entity]> {
        self.world.children::<R>(target)
    }

    #[must_use]
    pub fn contains(&self, source: Entity, target: Entity) -> bool {
        self.world.has_relation::<R>(source, target)
    }

    #[must_use]
    pub fn data(&self, source: Entity, target: Entity) -> Option<&'w R> {
        self.world.relation_data::<R>(source, target)
    }

    #[must_use]
    pub fn mode(&self) -> RelationMode {
        self.world.relation_mode::<R>().unwrap_or_default()
    }
}

// SAFETY: records a read of the relation component
unsafe impl<R: Component> ProcedureParam for Relations<'_, R> {
    type State = ();
    type Item<'w, 's> = Relations<'w, R>;

    fn analyze(world: &mut World, meta: &mut ProcedureMeta) -> TickResult<()> {
        let id = world.register_component::<Relation<R>>();
        meta.record(|access| access.add_read(id))
    }

    unsafe fn apply<'w, 's>(_state: &'s mut (), world: &'w World, _args: &'w Args) -> TickResult<Relations<'w, R>> {
        Ok(Relations {
            world,
            _marker: PhantomData,
        })
    }
}

// ==================== Tuples ====================

macro_rules! impl_param_tuple {
    ($($P:ident),*) => {
        // SAFETY: delegates to every element against one shared meta
        #[allow(non_snake_case, unused_variables, clippy::unused_unit)]
        unsafe impl<$($P: ProcedureParam),*> ProcedureParam for ($($P,)*) {
            type State = ($($P::State,)*);
            type Item<'w, 's> = ($($P::Item<'w, 's>,)*);

            fn analyze(world: &mut World, meta: &mut ProcedureMeta) -> TickResult<Self::State> {
                Ok(($($P::analyze(world, meta)?,)*))
            }

            unsafe fn apply<'w, 's>(
                state: &'s mut Self::State,
                world: &'w World,
                args: &'w Args,
            ) -> TickResult<Self::Item<'w, 's>> {
                let ($($P,)*) = state;
                // SAFETY: forwarded contract
                Ok(($(unsafe { $P::apply($P, world, args) }?,)*))
            }

            fn flush(state: &mut Self::State, world: &mut World) -> TickResult<()> {
                let ($($P,)*) = state;
                $($P::flush($P, world)?;)*
                Ok(())
            }
        }
    };
}

impl_param_tuple!();
impl_param_tuple!(A);
impl_param_tuple!(A, B);
impl_param_tuple!(A, B, C);
impl_param_tuple!(A, B, C, D);
impl_param_tuple!(A, B, C, D, E);
impl_param_tuple!(A, B, C, D, E, F);
impl_param_tuple!(A, B, C, D, E, F, G);
impl_param_tuple!(A, B, C, D, E, F, G, H);
