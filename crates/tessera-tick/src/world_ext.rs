//! A [`Schedule`] stored in the world it drives.

use tessera_ecs::World;
use tracing::debug;

use crate::{
    error::{TickError, TickResult},
    param::Args,
    procedure::{IntoProcedure, Procedure},
    schedule::Schedule,
    stage::{StageId, StageLabel},
    state::States,
};

/// Schedule access on [`World`].
///
/// Everything except `init_schedule` fails with
/// [`TickError::SchedulerNotFound`] until a schedule is installed.
pub trait ScheduleWorldExt {
    /// Install an empty schedule. Returns false if one exists already.
    fn init_schedule(&mut self) -> bool;

    /// Install `schedule`, returning the one it replaces.
    fn insert_schedule(&mut self, schedule: Schedule) -> Option<Schedule>;

    fn has_schedule(&self) -> bool;

    /// Register a procedure, resolving its parameters right away so wiring
    /// mistakes surface here rather than on the first run.
    fn add_procedure<M>(
        &mut self,
        label: impl Into<StageLabel>,
        procedure: impl IntoProcedure<M>,
    ) -> TickResult<()>;

    fn register_state<S: States>(&mut self, initial: S) -> TickResult<()>;

    /// Apply a transition of `S` immediately.
    fn transition_to<S: States>(&mut self, value: S) -> TickResult<u32>;

    fn run_stages(&mut self, low: StageId, high: StageId) -> TickResult<()>;

    fn run_stages_with(&mut self, low: StageId, high: StageId, args: &Args) -> TickResult<()>;

    /// Run one frame of the installed schedule.
    fn run_schedule(&mut self) -> TickResult<()>;
}

/// Take the schedule out so it can borrow the world mutably, then put it back.
fn with_schedule<T>(
    world: &mut World,
    f: impl FnOnce(&mut Schedule, &mut World) -> TickResult<T>,
) -> TickResult<T> {
    let mut schedule = world
        .remove_resource::<Schedule>()
        .ok_or(TickError::SchedulerNotFound)?;
    let result = f(&mut schedule, world);
    world.insert_resource(schedule);
    result
}

impl ScheduleWorldExt for World {
    fn init_schedule(&mut self) -> bool {
        if self.contains_resource::<Schedule>() {
            return false;
        }
        debug!("installing schedule");
        self.insert_resource(Schedule::new());
        true
    }

    fn insert_schedule(&mut self, schedule: Schedule) -> Option<Schedule> {
        self.insert_resource(schedule)
    }

    fn has_schedule(&self) -> bool {
        self.contains_resource::<Schedule>()
    }

    fn add_procedure<M>(
        &mut self,
        label: impl Into<StageLabel>,
        procedure: impl IntoProcedure<M>,
    ) -> TickResult<()> {
        if !self.has_schedule() {
            return Err(TickError::SchedulerNotFound);
        }
        let mut procedure = procedure.into_procedure();
        procedure.initialize(self)?;
        with_schedule(self, |schedule, _| {
            schedule.add_boxed(label, Box::new(procedure));
            Ok(())
        })
    }

    fn register_state<S: States>(&mut self, initial: S) -> TickResult<()> {
        with_schedule(self, |schedule, world| {
            schedule.register_state(world, initial);
            Ok(())
        })
    }

    fn transition_to<S: States>(&mut self, value: S) -> TickResult<u32> {
        with_schedule(self, |schedule, world| schedule.transition_to(world, value))
    }

    fn run_stages(&mut self, low: StageId, high: StageId) -> TickResult<()> {
        with_schedule(self, |schedule, world| schedule.run_stages(world, low, high))
    }

    fn run_stages_with(&mut self, low: StageId, high: StageId, args: &Args) -> TickResult<()> {
        with_schedule(self, |schedule, world| {
            schedule.run_stages_with(world, low, high, args)
        })
    }

    fn run_schedule(&mut self) -> TickResult<()> {
        with_schedule(self, Schedule::run_frame)
    }
}

#[cfg(test)]
mod tests {
    use tessera_ecs::{EcsError, ResMut};

    use super::*;
    use crate::{param::EventReader, stage};

    #[derive(Default)]
    struct Frames(u32);

    fn tick(mut frames: ResMut<Frames>) {
        frames.0 += 1;
    }

    fn listen(_reader: EventReader<u8>) {}

    #[test]
    fn test_missing_schedule() {
        let mut world = World::new();
        assert!(matches!(
            world.add_procedure(stage::UPDATE, tick),
            Err(TickError::SchedulerNotFound)
        ));
        assert!(matches!(world.run_schedule(), Err(TickError::SchedulerNotFound)));
    }

    #[test]
    fn test_run_installed_schedule() {
        let mut world = World::new();
        world.init_resource::<Frames>();
        assert!(world.init_schedule());
        assert!(!world.init_schedule());

        world.add_procedure(stage::UPDATE, tick).unwrap();
        world.run_schedule().unwrap();
        world.run_schedule().unwrap();

        assert_eq!(world.resource::<Frames>().unwrap().0, 2);
        assert!(world.has_schedule());
    }

    #[test]
    fn test_wiring_errors_surface_at_registration() {
        let mut world = World::new();
        world.init_schedule();
        let err = world.add_procedure(stage::UPDATE, listen).unwrap_err();
        assert!(matches!(err, TickError::Ecs(EcsError::EventStoreMissing(_))));
    }
}
