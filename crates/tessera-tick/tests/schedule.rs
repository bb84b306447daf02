//! Scheduler behaviour end to end.

use tessera_ecs::{Entity, RelationMode, Res, ResMut, World};
use tessera_event::EventWorldExt;
use tessera_tick::{
    Arg, Args, Commands, EventReader, EventWriter, Local, NextState, Query, Relations, Schedule,
    ScheduleConfig, StageId, State, TickError, stage,
};

#[derive(Default)]
struct Trace(Vec<String>);

impl Trace {
    fn push(&mut self, entry: impl Into<String>) {
        self.0.push(entry.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Mode {
    Loading,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Position(f32);

#[derive(Debug, Clone, Copy, PartialEq)]
struct Velocity(f32);

#[derive(Debug, Default, Clone, Copy)]
struct ChildOf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hit(u32);

fn world_with_trace() -> World {
    let mut world = World::new();
    world.init_resource::<Trace>();
    world
}

fn trace(world: &World) -> Vec<String> {
    world.resource::<Trace>().unwrap().0.clone()
}

#[test]
fn test_stages_run_in_id_order_with_custom_stages() {
    let mut world = world_with_trace();
    let mut schedule = Schedule::new();

    schedule
        .add_procedure(stage::UPDATE, |mut t: ResMut<Trace>| t.push("update"))
        .add_procedure(StageId::new(650_000), |mut t: ResMut<Trace>| t.push("650k"))
        .add_procedure(StageId::new(550_000), |mut t: ResMut<Trace>| t.push("550k"))
        .add_procedure(stage::PRE_UPDATE, |mut t: ResMut<Trace>| t.push("pre_update"))
        .add_procedure("physics", |mut t: ResMut<Trace>| t.push("physics"))
        .add_procedure(stage::LAST, |mut t: ResMut<Trace>| t.push("last"));

    schedule.run_frame(&mut world).unwrap();
    assert_eq!(
        trace(&world),
        vec!["pre_update", "550k", "650k", "update", "last", "physics"]
    );
}

#[test]
fn test_procedures_in_a_stage_keep_registration_order() {
    let mut world = world_with_trace();
    let mut schedule = Schedule::new();
    for name in ["a", "b", "c"] {
        schedule.add_exclusive(stage::UPDATE, move |world: &mut World| {
            world.get_resource_mut::<Trace>().unwrap().push(name);
        });
    }

    schedule.run_frame(&mut world).unwrap();
    assert_eq!(trace(&world), vec!["a", "b", "c"]);
}

#[test]
fn test_startup_and_frame_bands() {
    let mut world = world_with_trace();
    let mut schedule = Schedule::new();
    schedule
        .add_procedure(stage::STARTUP, |mut t: ResMut<Trace>| t.push("startup"))
        .add_procedure(stage::UPDATE, |mut t: ResMut<Trace>| t.push("update"));

    schedule.run_startup(&mut world).unwrap();
    schedule.run_frame(&mut world).unwrap();
    schedule.run_frame(&mut world).unwrap();
    assert_eq!(trace(&world), vec!["startup", "update", "update"]);
}

#[test]
fn test_first_failure_aborts_the_run() {
    let mut world = world_with_trace();
    let mut schedule = Schedule::new();
    schedule
        .add_procedure(stage::UPDATE, |mut t: ResMut<Trace>| t.push("before"))
        .add_procedure(stage::UPDATE, |mut t: ResMut<Trace>| -> Result<(), TickError> {
            t.push("failing");
            Err(TickError::procedure("out of fuel"))
        })
        .add_procedure(stage::UPDATE, |mut t: ResMut<Trace>| t.push("after"))
        .add_procedure(stage::LAST, |mut t: ResMut<Trace>| t.push("last"));

    let err = schedule.run_frame(&mut world).unwrap_err();
    assert_eq!(err.to_string(), "out of fuel");
    // Changes made before the failure stay.
    assert_eq!(trace(&world), vec!["before", "failing"]);
}

#[test]
fn test_exit_hooks_run_before_enter_hooks() {
    let mut world = world_with_trace();
    let mut schedule = Schedule::new();
    schedule
        .register_state(&mut world, Mode::Loading)
        .add_on_exit(Mode::Loading, |mut t: ResMut<Trace>| t.push("exit loading"))
        .add_on_exit(Mode::Loading, |mut t: ResMut<Trace>| t.push("exit loading 2"))
        .add_on_enter(Mode::Running, |mut t: ResMut<Trace>| t.push("enter running"))
        .add_on_enter(Mode::Loading, |mut t: ResMut<Trace>| t.push("enter loading"));

    assert!(trace(&world).is_empty(), "initial state runs no enter hooks");

    assert_eq!(schedule.transition_to(&mut world, Mode::Running).unwrap(), 1);
    assert_eq!(world.resource::<State<Mode>>().unwrap().get(), Mode::Running);
    assert_eq!(
        trace(&world),
        vec!["exit loading", "exit loading 2", "enter running"]
    );
}

#[test]
fn test_pending_transition_applies_at_transition_stage() {
    let mut world = world_with_trace();
    let mut schedule = Schedule::new();
    schedule
        .register_state(&mut world, Mode::Loading)
        .add_procedure(stage::PRE_UPDATE, |mut next: ResMut<NextState<Mode>>, state: Res<State<Mode>>| {
            if state.get() == Mode::Loading {
                next.set(Mode::Running);
            }
        })
        .add_procedure(stage::UPDATE, |state: Res<State<Mode>>, mut t: ResMut<Trace>| {
            t.push(format!("{:?}", state.get()));
        })
        .add_on_enter(Mode::Running, |mut t: ResMut<Trace>| t.push("enter running"));

    schedule.run_frame(&mut world).unwrap();
    assert_eq!(trace(&world), vec!["enter running", "Running"]);
}

#[test]
fn test_gated_stage_sees_requests_made_earlier_in_the_run() {
    let mut world = world_with_trace();
    let gameplay = StageId::new(750_000);

    let mut schedule = Schedule::new();
    schedule
        .register_state(&mut world, Mode::Running)
        .in_state(gameplay, Mode::Running)
        .add_procedure(gameplay, |mut t: ResMut<Trace>| t.push("gameplay"))
        // Requested after STATE_TRANSITION, still applied before the gated stage
        .add_procedure(stage::UPDATE, |mut next: ResMut<NextState<Mode>>| next.set(Mode::Paused));

    schedule.run_frame(&mut world).unwrap();
    assert!(trace(&world).is_empty());
    assert_eq!(world.resource::<State<Mode>>().unwrap().get(), Mode::Paused);

    schedule.transition_to(&mut world, Mode::Running).unwrap();
    schedule.run_stages(&mut world, gameplay, gameplay).unwrap();
    assert_eq!(trace(&world), vec!["gameplay"]);
}

#[test]
fn test_transition_cascade_is_bounded() {
    let mut world = World::new();
    let mut schedule = Schedule::with_config(ScheduleConfig {
        max_transition_cascade: 3,
        ..ScheduleConfig::default()
    });
    schedule
        .register_state(&mut world, Mode::Loading)
        .add_on_enter(Mode::Running, |mut next: ResMut<NextState<Mode>>| next.set(Mode::Paused))
        .add_on_enter(Mode::Paused, |mut next: ResMut<NextState<Mode>>| next.set(Mode::Running));

    let err = schedule.transition_to(&mut world, Mode::Running).unwrap_err();
    assert!(matches!(err, TickError::TransitionLoop { limit: 3, .. }));
}

#[test]
fn test_unregistered_state_transition() {
    let mut world = World::new();
    let mut schedule = Schedule::new();
    assert!(matches!(
        schedule.transition_to(&mut world, Mode::Paused),
        Err(TickError::StateNotRegistered(_))
    ));
}

#[test]
fn test_commands_visible_to_next_procedure() {
    let mut world = world_with_trace();
    let mut schedule = Schedule::new();
    schedule
        .add_procedure(stage::UPDATE, |mut commands: Commands| {
            commands.spawn((Position(0.0), Velocity(1.0)));
            commands.spawn((Position(5.0),));
        })
        .add_procedure(stage::UPDATE, |mut query: Query<&Position>, mut t: ResMut<Trace>| {
            t.push(format!("{}", query.iter().count()));
        });

    schedule.run_frame(&mut world).unwrap();
    assert_eq!(trace(&world), vec!["2"]);
}

#[test]
fn test_query_params_and_locals() {
    let mut world = World::new();
    let moving = world.spawn_bundle((Position(0.0), Velocity(2.0))).unwrap();
    let still = world.spawn(Position(9.0)).unwrap();

    let mut schedule = Schedule::new();
    schedule.add_procedure(
        stage::UPDATE,
        |mut frame: Local<u32>, mut query: Query<(&mut Position, &Velocity)>| {
            *frame += 1;
            for (pos, vel) in query.iter_mut() {
                pos.0 += vel.0 * *frame as f32;
            }
        },
    );

    schedule.run_frame(&mut world).unwrap();
    schedule.run_frame(&mut world).unwrap();
    assert_eq!(world.get::<Position>(moving).unwrap(), &Position(6.0));
    assert_eq!(world.get::<Position>(still).unwrap(), &Position(9.0));
}

#[test]
fn test_events_flow_between_procedures_and_get_cleaned_up() {
    let mut world = world_with_trace();
    let mut schedule = Schedule::new();
    schedule
        .add_event::<Hit>(&mut world, 8)
        .add_procedure(stage::PRE_UPDATE, |mut writer: EventWriter<Hit>| {
            writer.send(Hit(1));
            writer.send(Hit(2));
        })
        .add_procedure(stage::UPDATE, |mut reader: EventReader<Hit>, mut t: ResMut<Trace>| {
            for record in reader.read() {
                t.push(format!("hit {}", record.data().0));
                record.mark_handled();
            }
        });

    schedule.run_frame(&mut world).unwrap();
    assert_eq!(trace(&world), vec!["hit 1", "hit 2"]);
    // Handled records were purged in LAST.
    assert!(world.events::<Hit>().unwrap().is_empty());
}

#[test]
fn test_missing_event_store_fails_initialization() {
    let mut world = World::new();
    let mut schedule = Schedule::new();
    schedule.add_procedure(stage::UPDATE, |_reader: EventReader<Hit>| {});
    assert!(matches!(
        schedule.initialize(&mut world),
        Err(TickError::Ecs(tessera_ecs::EcsError::EventStoreMissing(_)))
    ));
}

#[test]
fn test_relations_and_args() {
    let mut world = world_with_trace();
    world.register_relation::<ChildOf>(RelationMode::Exclusive).unwrap();
    let parent = world.spawn_empty();

    let mut schedule = Schedule::new();
    schedule
        .add_procedure(stage::UPDATE, |parent: Arg<Entity>, mut commands: Commands| {
            for _ in 0..3 {
                let parent = *parent;
                commands.spawn_then((Position(0.0),), move |world, child| {
                    Ok(world.relate::<ChildOf>(child, parent)?)
                });
            }
        })
        .add_procedure(
            stage::POST_UPDATE,
            |parent: Arg<Entity>, relations: Relations<ChildOf>, mut t: ResMut<Trace>| {
                t.push(format!("children {}", relations.children(*parent).len()));
            },
        );

    let args = Args::new().with(parent);
    schedule
        .run_stages_with(&mut world, stage::FIRST, StageId::MAX, &args)
        .unwrap();
    assert_eq!(trace(&world), vec!["children 3"]);

    assert!(matches!(
        schedule.run_frame(&mut world),
        Err(TickError::ArgumentMissing(_))
    ));
}
