//! The stage-ordered schedule.
//!
//! A [`Schedule`] owns every registered procedure, bucketed into stages.
//! [`Schedule::run_stages`] executes the stages whose id falls in an
//! inclusive range, lowest id first, and the procedures of one stage in
//! registration order. The first failure aborts the rest of the run;
//! changes already made stay in place.
//!
//! ```ignore
//! let mut schedule = Schedule::new();
//! schedule
//!     .add_procedure(stage::STARTUP, spawn_level)
//!     .add_procedure(stage::UPDATE, integrate)
//!     .add_procedure(StageId::new(650_000), clamp_velocity);
//!
//! schedule.run_startup(&mut world)?;
//! loop {
//!     schedule.run_frame(&mut world)?;
//! }
//! ```

use std::{any::TypeId, collections::BTreeMap, fmt};

use rustc_hash::FxHashMap;
use tessera_ecs::{ResMut, World};
use tessera_event::{Event, EventWorldExt, Events};
use tracing::{debug, debug_span, trace, warn};

use crate::{
    error::{TickError, TickResult},
    param::Args,
    procedure::{ExclusiveProcedure, IntoProcedure, Procedure, ProcedureOutput},
    stage::{self, PREDEFINED, StageId, StageKey, StageLabel},
    state::{NextState, State, StateRegistry, States},
};

/// Tunables for a [`Schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Transitions a single transition point may apply for one state type
    /// before failing with [`TickError::TransitionLoop`].
    pub max_transition_cascade: u32,
    /// Whether [`Schedule::add_event`] also registers a procedure in
    /// [`stage::LAST`] purging handled records.
    pub event_cleanup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_transition_cascade: 8,
            event_cleanup: true,
        }
    }
}

/// Runs a stage only while a state has a given value.
struct StageCondition {
    state: TypeId,
    check: Box<dyn Fn(&World) -> bool + Send + Sync>,
}

struct Stage {
    label: StageLabel,
    procedures: Vec<Box<dyn Procedure>>,
    condition: Option<StageCondition>,
}

impl Stage {
    const fn new(label: StageLabel) -> Self {
        Self {
            label,
            procedures: Vec::new(),
            condition: None,
        }
    }
}

/// Stages, their procedures and the state machines gating them.
pub struct Schedule {
    stages: BTreeMap<StageKey, Stage>,
    labels: FxHashMap<StageLabel, StageKey>,
    states: StateRegistry,
    config: ScheduleConfig,
    next_seq: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule {
    /// A schedule holding the empty predefined lifecycle stages.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ScheduleConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ScheduleConfig) -> Self {
        let mut schedule = Self {
            stages: BTreeMap::new(),
            labels: FxHashMap::default(),
            states: StateRegistry::default(),
            config,
            next_seq: 0,
        };
        for (id, _) in PREDEFINED {
            schedule.stage_key(StageLabel::Id(id));
        }
        schedule
    }

    #[must_use]
    pub const fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    fn stage_key(&mut self, label: StageLabel) -> StageKey {
        if let Some(key) = self.labels.get(&label) {
            return *key;
        }

        // seq 0 is reserved for range starts
        self.next_seq += 1;
        let key = StageKey {
            id: label.id(),
            seq: self.next_seq,
        };
        debug!(stage = %label, id = ?key.id, "registered stage");
        self.labels.insert(label.clone(), key);
        self.stages.insert(key, Stage::new(label));
        key
    }

    fn stage_mut(&mut self, label: StageLabel) -> &mut Stage {
        let key = self.stage_key(label);
        self.stages
            .get_mut(&key)
            .expect("stage key registered without a stage")
    }

    /// Make sure a stage exists, even with no procedures in it.
    pub fn add_stage(&mut self, label: impl Into<StageLabel>) -> &mut Self {
        self.stage_key(label.into());
        self
    }

    #[must_use]
    pub fn has_stage(&self, label: impl Into<StageLabel>) -> bool {
        self.labels.contains_key(&label.into())
    }

    /// Registered stages in run order.
    pub fn stages(&self) -> impl Iterator<Item = (StageId, &StageLabel)> {
        self.stages.iter().map(|(key, stage)| (key.id, &stage.label))
    }

    /// Procedures registered across every stage, state hooks excluded.
    #[must_use]
    pub fn procedure_count(&self) -> usize {
        self.stages.values().map(|stage| stage.procedures.len()).sum()
    }

    /// Append a procedure to a stage, creating the stage if needed.
    pub fn add_procedure<M>(
        &mut self,
        label: impl Into<StageLabel>,
        procedure: impl IntoProcedure<M>,
    ) -> &mut Self {
        self.add_boxed(label, Box::new(procedure.into_procedure()))
    }

    pub fn add_boxed(&mut self, label: impl Into<StageLabel>, procedure: Box<dyn Procedure>) -> &mut Self {
        let stage = self.stage_mut(label.into());
        trace!(procedure = procedure.name(), stage = %stage.label, "added procedure");
        stage.procedures.push(procedure);
        self
    }

    /// Append a procedure that takes the whole world.
    pub fn add_exclusive<F, Out>(&mut self, label: impl Into<StageLabel>, func: F) -> &mut Self
    where
        F: FnMut(&mut World) -> Out + Send + Sync + 'static,
        Out: ProcedureOutput + 'static,
    {
        self.add_boxed(label, Box::new(ExclusiveProcedure::new(func)))
    }

    /// Only run `label` while state `S` equals `value`.
    ///
    /// Pending transitions of `S` are applied right before the check.
    pub fn in_state<S: States>(&mut self, label: impl Into<StageLabel>, value: S) -> &mut Self {
        self.states.hooks_mut::<S>();
        let stage = self.stage_mut(label.into());
        stage.condition = Some(StageCondition {
            state: TypeId::of::<S>(),
            check: Box::new(move |world| {
                world
                    .resource::<State<S>>()
                    .is_ok_and(|state| state.get() == value)
            }),
        });
        self
    }

    /// Install state `S` with `initial` as its current value.
    ///
    /// No `OnEnter` procedure runs for the initial value.
    pub fn register_state<S: States>(&mut self, world: &mut World, initial: S) -> &mut Self {
        world.insert_resource(State(initial));
        world.insert_resource(NextState::<S>::default());
        self.states.hooks_mut::<S>();
        debug!(state = std::any::type_name::<S>(), initial = ?initial, "registered state");
        self
    }

    /// Run `procedure` every time `S` becomes `value`.
    pub fn add_on_enter<S: States, M>(&mut self, value: S, procedure: impl IntoProcedure<M>) -> &mut Self {
        self.states
            .hooks_mut::<S>()
            .add_on_enter(value, Box::new(procedure.into_procedure()));
        self
    }

    /// Run `procedure` every time `S` stops being `value`.
    pub fn add_on_exit<S: States, M>(&mut self, value: S, procedure: impl IntoProcedure<M>) -> &mut Self {
        self.states
            .hooks_mut::<S>()
            .add_on_exit(value, Box::new(procedure.into_procedure()));
        self
    }

    /// Request a transition and apply it now, hooks included.
    ///
    /// Returns how many transitions ran (hooks may chain more).
    pub fn transition_to<S: States>(&mut self, world: &mut World, value: S) -> TickResult<u32> {
        let state = TypeId::of::<S>();
        if !self.states.contains(state) {
            return Err(TickError::StateNotRegistered(std::any::type_name::<S>()));
        }
        world
            .get_resource_mut::<NextState<S>>()
            .map_err(|_| TickError::StateNotRegistered(std::any::type_name::<S>()))?
            .set(value);
        self.states
            .apply(state, world, &Args::new(), self.config.max_transition_cascade)
    }

    /// Install an event store for `T` and, per config, its cleanup procedure.
    pub fn add_event<T: Event>(&mut self, world: &mut World, capacity: usize) -> &mut Self {
        if world.add_event::<T>(capacity) && self.config.event_cleanup {
            self.add_procedure(stage::LAST, discard_handled_events::<T>);
        }
        self
    }

    /// Resolve every procedure's parameters now instead of on first run.
    pub fn initialize(&mut self, world: &mut World) -> TickResult<()> {
        for stage in self.stages.values_mut() {
            for procedure in &mut stage.procedures {
                procedure.initialize(world)?;
            }
        }
        self.states.initialize(world)
    }

    /// Run every stage with `low <= id <= high`.
    pub fn run_stages(&mut self, world: &mut World, low: StageId, high: StageId) -> TickResult<()> {
        self.run_stages_with(world, low, high, &Args::new())
    }

    /// Like [`run_stages`](Self::run_stages), with extra [`Args`] for
    /// `Arg` parameters.
    pub fn run_stages_with(
        &mut self,
        world: &mut World,
        low: StageId,
        high: StageId,
        args: &Args,
    ) -> TickResult<()> {
        if low > high {
            return Ok(());
        }

        let limit = self.config.max_transition_cascade;
        let Self { stages, states, .. } = self;

        for (key, stage) in stages.range_mut(StageKey::first(low)..=StageKey::last(high)) {
            let _span = debug_span!("stage", stage = %stage.label).entered();
            if let Err(err) = run_stage(key.id, stage, states, world, args, limit) {
                warn!(stage = %stage.label, error = %err, "stage failed, aborting run");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run the startup band, [`PRE_STARTUP`](stage::PRE_STARTUP) to
    /// [`POST_STARTUP`](stage::POST_STARTUP).
    pub fn run_startup(&mut self, world: &mut World) -> TickResult<()> {
        self.run_stages(world, stage::PRE_STARTUP, stage::POST_STARTUP)
    }

    /// Run one frame: [`FIRST`](stage::FIRST) onward, named stages included.
    pub fn run_frame(&mut self, world: &mut World) -> TickResult<()> {
        self.run_stages(world, stage::FIRST, StageId::MAX)
    }
}

fn run_stage(
    id: StageId,
    stage: &mut Stage,
    states: &mut StateRegistry,
    world: &mut World,
    args: &Args,
    limit: u32,
) -> TickResult<()> {
    if id == stage::STATE_TRANSITION {
        states.apply_all(world, args, limit)?;
    }

    if let Some(condition) = &stage.condition {
        states.apply(condition.state, world, args, limit)?;
        if !(condition.check)(world) {
            trace!("state condition not met, skipping");
            return Ok(());
        }
    }

    for procedure in &mut stage.procedures {
        procedure.initialize(world)?;
        trace!(procedure = procedure.name(), "running procedure");
        procedure.run(world, args)?;
    }
    Ok(())
}

fn discard_handled_events<T: Event>(mut events: ResMut<Events<T>>) {
    let purged = events.discard_handled();
    if purged > 0 {
        trace!(event = std::any::type_name::<T>(), purged, "discarded handled events");
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field(
                "stages",
                &self
                    .stages
                    .values()
                    .map(|stage| (stage.label.to_string(), stage.procedures.len()))
                    .collect::<Vec<_>>(),
            )
            .field("states", &self.states)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace(Vec<&'static str>);

    #[test]
    fn test_predefined_stages_exist() {
        let schedule = Schedule::new();
        let ids: Vec<StageId> = schedule.stages().map(|(id, _)| id).collect();
        let expected: Vec<StageId> = PREDEFINED.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, expected);
        assert_eq!(schedule.procedure_count(), 0);
    }

    #[test]
    fn test_custom_stage_splices_between_bands() {
        let mut world = World::new();
        world.init_resource::<Trace>();

        let mut schedule = Schedule::new();
        schedule
            .add_procedure(stage::UPDATE, |mut t: ResMut<Trace>| t.0.push("update"))
            .add_procedure(StageId::new(650_000), |mut t: ResMut<Trace>| t.0.push("custom"))
            .add_procedure(stage::PRE_UPDATE, |mut t: ResMut<Trace>| t.0.push("pre"));

        schedule.run_frame(&mut world).unwrap();
        assert_eq!(world.resource::<Trace>().unwrap().0, vec!["pre", "custom", "update"]);
    }

    #[test]
    fn test_range_is_inclusive() {
        let mut world = World::new();
        world.init_resource::<Trace>();

        let mut schedule = Schedule::new();
        schedule
            .add_procedure(stage::FIRST, |mut t: ResMut<Trace>| t.0.push("first"))
            .add_procedure(stage::UPDATE, |mut t: ResMut<Trace>| t.0.push("update"))
            .add_procedure(stage::LAST, |mut t: ResMut<Trace>| t.0.push("last"));

        schedule.run_stages(&mut world, stage::FIRST, stage::UPDATE).unwrap();
        assert_eq!(world.resource::<Trace>().unwrap().0, vec!["first", "update"]);

        schedule.run_stages(&mut world, stage::LAST, stage::FIRST).unwrap();
        assert_eq!(world.resource::<Trace>().unwrap().0.len(), 2);
    }

    #[test]
    fn test_exclusive_procedure_in_stage() {
        let mut world = World::new();
        let mut schedule = Schedule::new();
        schedule.add_exclusive(stage::STARTUP, |world: &mut World| {
            world.spawn_empty();
        });

        schedule.run_startup(&mut world).unwrap();
        schedule.run_frame(&mut world).unwrap();
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn test_config_disables_event_cleanup() {
        let mut world = World::new();
        let mut schedule = Schedule::with_config(ScheduleConfig {
            event_cleanup: false,
            ..ScheduleConfig::default()
        });
        schedule.add_event::<u8>(&mut world, 4);
        assert_eq!(schedule.procedure_count(), 0);
        assert!(world.has_event::<u8>());

        let mut schedule = Schedule::new();
        schedule.add_event::<u16>(&mut world, 4);
        schedule.add_event::<u16>(&mut world, 4);
        assert_eq!(schedule.procedure_count(), 1);
    }
}
