//! Driving a schedule stored inside the world.

use tessera_ecs::{ResMut, World};
use tessera_tick::{ScheduleWorldExt, State, TickError, stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Screen {
    Title,
    Game,
}

#[derive(Default)]
struct Entered(u32);

#[test]
fn test_states_through_world_extension() {
    let mut world = World::new();
    world.init_resource::<Entered>();
    world.init_schedule();
    world.register_state(Screen::Title).unwrap();
    world
        .add_procedure(stage::UPDATE, |mut entered: ResMut<Entered>| entered.0 += 1)
        .unwrap();

    assert_eq!(world.transition_to(Screen::Game).unwrap(), 1);
    assert_eq!(world.resource::<State<Screen>>().unwrap().get(), Screen::Game);

    world.run_stages(stage::UPDATE, stage::UPDATE).unwrap();
    world.run_schedule().unwrap();
    assert_eq!(world.resource::<Entered>().unwrap().0, 2);
}

#[test]
fn test_schedule_survives_failed_run() {
    let mut world = World::new();
    world.init_schedule();
    world
        .add_procedure(stage::UPDATE, || -> Result<(), TickError> {
            Err(TickError::procedure("nope"))
        })
        .unwrap();

    assert!(world.run_schedule().is_err());
    assert!(world.has_schedule());
    assert!(world.run_schedule().is_err());
}
