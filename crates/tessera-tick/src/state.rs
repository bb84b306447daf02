//! Finite state machines driven by the schedule.
//!
//! A state type `S` lives in the world as two resources: [`State<S>`]
//! (the current value) and [`NextState<S>`] (a pending request). Pending
//! requests are applied at [`STATE_TRANSITION`](crate::stage::STATE_TRANSITION),
//! before any stage gated on `S` runs, or immediately through
//! `Schedule::transition_to`.
//!
//! Applying a transition runs every `OnExit(old)` procedure, swaps the
//! value, then runs every `OnEnter(new)` procedure. Hooks may request a
//! further transition; chains stop after `max_transition_cascade` steps.

use std::{
    any::{Any, TypeId, type_name},
    fmt,
    hash::Hash,
};

use hashbrown::HashMap;
use rustc_hash::{FxBuildHasher, FxHashMap};
use tessera_ecs::World;
use tracing::{debug, trace};

use crate::{
    error::{TickError, TickResult},
    param::Args,
    procedure::Procedure,
};

/// Values usable as a state.
pub trait States: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static> States for T {}

/// Current value of state `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State<S: States>(pub(crate) S);

impl<S: States> State<S> {
    #[must_use]
    pub const fn get(&self) -> S {
        self.0
    }
}

/// Pending transition request for state `S`. The last request wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextState<S: States>(Option<S>);

impl<S: States> Default for NextState<S> {
    fn default() -> Self {
        Self(None)
    }
}

impl<S: States> NextState<S> {
    pub fn set(&mut self, value: S) {
        self.0 = Some(value);
    }

    #[must_use]
    pub const fn pending(&self) -> Option<S> {
        self.0
    }

    pub fn take(&mut self) -> Option<S> {
        self.0.take()
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}

type HookMap<S> = HashMap<S, Vec<Box<dyn Procedure>>, FxBuildHasher>;

/// Type-erased handle on one registered state type.
pub(crate) trait StateDriver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn initialize(&mut self, world: &mut World) -> TickResult<()>;

    /// Apply pending requests until none remain, returning how many
    /// transitions happened.
    fn apply_pending(&mut self, world: &mut World, args: &Args, limit: u32) -> TickResult<u32>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Enter and exit procedures of state `S`, keyed by value.
pub(crate) struct StateHooks<S: States> {
    on_enter: HookMap<S>,
    on_exit: HookMap<S>,
}

impl<S: States> Default for StateHooks<S> {
    fn default() -> Self {
        Self {
            on_enter: HookMap::default(),
            on_exit: HookMap::default(),
        }
    }
}

impl<S: States> StateHooks<S> {
    pub fn add_on_enter(&mut self, value: S, procedure: Box<dyn Procedure>) {
        self.on_enter.entry(value).or_default().push(procedure);
    }

    pub fn add_on_exit(&mut self, value: S, procedure: Box<dyn Procedure>) {
        self.on_exit.entry(value).or_default().push(procedure);
    }

    fn run_hooks(hooks: &mut HookMap<S>, value: S, world: &mut World, args: &Args) -> TickResult<()> {
        let Some(procedures) = hooks.get_mut(&value) else {
            return Ok(());
        };
        for procedure in procedures {
            procedure.initialize(world)?;
            trace!(procedure = procedure.name(), state = ?value, "running state hook");
            procedure.run(world, args)?;
        }
        Ok(())
    }

    fn current(world: &World) -> TickResult<S> {
        world
            .resource::<State<S>>()
            .map(|state| state.get())
            .map_err(|_| TickError::StateNotRegistered(type_name::<S>()))
    }

    fn take_pending(world: &mut World) -> TickResult<Option<S>> {
        world
            .get_resource_mut::<NextState<S>>()
            .map(NextState::take)
            .map_err(|_| TickError::StateNotRegistered(type_name::<S>()))
    }
}

impl<S: States> StateDriver for StateHooks<S> {
    fn name(&self) -> &'static str {
        type_name::<S>()
    }

    fn initialize(&mut self, world: &mut World) -> TickResult<()> {
        for procedure in self.on_enter.values_mut().chain(self.on_exit.values_mut()).flatten() {
            procedure.initialize(world)?;
        }
        Ok(())
    }

    fn apply_pending(&mut self, world: &mut World, args: &Args, limit: u32) -> TickResult<u32> {
        let mut applied = 0;
        while let Some(next) = Self::take_pending(world)? {
            let current = Self::current(world)?;
            if next == current {
                trace!(state = ?current, "ignoring transition to the current state");
                continue;
            }
            if applied == limit {
                return Err(TickError::TransitionLoop {
                    state: type_name::<S>(),
                    limit,
                });
            }

            Self::run_hooks(&mut self.on_exit, current, world, args)?;
            world.insert_resource(State(next));
            debug!(from = ?current, to = ?next, "state transition");
            Self::run_hooks(&mut self.on_enter, next, world, args)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Every state type a schedule knows about, in registration order.
#[derive(Default)]
pub(crate) struct StateRegistry {
    drivers: Vec<Box<dyn StateDriver>>,
    index: FxHashMap<TypeId, usize>,
}

impl StateRegistry {
    pub fn contains(&self, state: TypeId) -> bool {
        self.index.contains_key(&state)
    }

    /// Hooks for `S`, registering the type on first use.
    pub fn hooks_mut<S: States>(&mut self) -> &mut StateHooks<S> {
        let slot = *self.index.entry(TypeId::of::<S>()).or_insert_with(|| {
            self.drivers.push(Box::new(StateHooks::<S>::default()));
            self.drivers.len() - 1
        });
        self.drivers[slot]
            .as_any_mut()
            .downcast_mut()
            .expect("state driver registered under the wrong type")
    }

    pub fn initialize(&mut self, world: &mut World) -> TickResult<()> {
        for driver in &mut self.drivers {
            driver.initialize(world)?;
        }
        Ok(())
    }

    /// Apply the pending requests of one state type.
    pub fn apply(&mut self, state: TypeId, world: &mut World, args: &Args, limit: u32) -> TickResult<u32> {
        match self.index.get(&state) {
            Some(&slot) => self.drivers[slot].apply_pending(world, args, limit),
            None => Ok(0),
        }
    }

    /// Apply the pending requests of every state type, in registration order.
    pub fn apply_all(&mut self, world: &mut World, args: &Args, limit: u32) -> TickResult<u32> {
        let mut applied = 0;
        for driver in &mut self.drivers {
            let count = driver.apply_pending(world, args, limit)?;
            if count > 0 {
                trace!(state = driver.name(), count, "applied transitions");
            }
            applied += count;
        }
        Ok(applied)
    }
}

impl fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.drivers.iter().map(|driver| driver.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tessera_ecs::ResMut;

    use super::*;
    use crate::procedure::IntoProcedure;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Phase {
        Menu,
        Playing,
        Paused,
    }

    #[derive(Default)]
    struct Log(Vec<&'static str>);

    fn boxed<M>(p: impl IntoProcedure<M>) -> Box<dyn Procedure> {
        Box::new(p.into_procedure())
    }

    fn install(world: &mut World, initial: Phase) {
        world.insert_resource(State(initial));
        world.insert_resource(NextState::<Phase>::default());
        world.init_resource::<Log>();
    }

    fn request(world: &mut World, value: Phase) {
        world.get_resource_mut::<NextState<Phase>>().unwrap().set(value);
    }

    #[test]
    fn test_exit_runs_before_enter() {
        let mut world = World::new();
        install(&mut world, Phase::Menu);

        let mut hooks = StateHooks::<Phase>::default();
        hooks.add_on_exit(Phase::Menu, boxed(|mut log: ResMut<Log>| log.0.push("exit menu")));
        hooks.add_on_enter(Phase::Playing, boxed(|mut log: ResMut<Log>| log.0.push("enter playing")));

        request(&mut world, Phase::Playing);
        let applied = hooks.apply_pending(&mut world, &Args::new(), 8).unwrap();

        assert_eq!(applied, 1);
        assert_eq!(world.resource::<State<Phase>>().unwrap().get(), Phase::Playing);
        assert_eq!(world.resource::<Log>().unwrap().0, vec!["exit menu", "enter playing"]);
    }

    #[test]
    fn test_same_state_request_is_ignored() {
        let mut world = World::new();
        install(&mut world, Phase::Menu);
        let mut hooks = StateHooks::<Phase>::default();
        hooks.add_on_enter(Phase::Menu, boxed(|mut log: ResMut<Log>| log.0.push("enter menu")));

        request(&mut world, Phase::Menu);
        assert_eq!(hooks.apply_pending(&mut world, &Args::new(), 8).unwrap(), 0);
        assert!(world.resource::<Log>().unwrap().0.is_empty());
    }

    #[test]
    fn test_hooks_may_chain_transitions() {
        let mut world = World::new();
        install(&mut world, Phase::Menu);
        let mut hooks = StateHooks::<Phase>::default();
        hooks.add_on_enter(
            Phase::Playing,
            boxed(|mut next: ResMut<NextState<Phase>>| next.set(Phase::Paused)),
        );

        request(&mut world, Phase::Playing);
        assert_eq!(hooks.apply_pending(&mut world, &Args::new(), 8).unwrap(), 2);
        assert_eq!(world.resource::<State<Phase>>().unwrap().get(), Phase::Paused);
    }

    #[test]
    fn test_cascade_limit() {
        let mut world = World::new();
        install(&mut world, Phase::Menu);
        let mut hooks = StateHooks::<Phase>::default();
        hooks.add_on_enter(
            Phase::Playing,
            boxed(|mut next: ResMut<NextState<Phase>>| next.set(Phase::Paused)),
        );
        hooks.add_on_enter(
            Phase::Paused,
            boxed(|mut next: ResMut<NextState<Phase>>| next.set(Phase::Playing)),
        );

        request(&mut world, Phase::Playing);
        let err = hooks.apply_pending(&mut world, &Args::new(), 4).unwrap_err();
        assert!(matches!(err, TickError::TransitionLoop { limit: 4, .. }));
    }

    #[test]
    fn test_unregistered_state() {
        let mut world = World::new();
        let mut registry = StateRegistry::default();
        registry.hooks_mut::<Phase>();
        assert!(registry.contains(TypeId::of::<Phase>()));
        assert!(matches!(
            registry.apply_all(&mut world, &Args::new(), 8),
            Err(TickError::StateNotRegistered(_))
        ));
    }
}
