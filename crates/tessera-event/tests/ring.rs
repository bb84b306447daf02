//! Event stores installed on a world.

use tessera_ecs::{EcsError, World};
use tessera_event::{EventCursor, EventWorldExt, Events};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scored(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Unregistered;

#[test]
fn test_fresh_reader_sees_last_three_of_five() {
    let mut world = World::new();
    world.add_event::<Scored>(3);

    for n in 1..=5 {
        world.send(Scored(n)).unwrap();
    }

    let mut cursor = EventCursor::default();
    let events = world.events::<Scored>().unwrap();
    let seen: Vec<u32> = events.read(&mut cursor).map(|r| r.data().0).collect();
    assert_eq!(seen, vec![3, 4, 5]);
    assert_eq!(events.missed(&EventCursor::default()), 2);
}

#[test]
fn test_two_readers_each_see_everything_once() {
    let mut world = World::new();
    world.add_event::<Scored>(16);
    let mut a = EventCursor::default();
    let mut b = EventCursor::default();

    world.send(Scored(1)).unwrap();
    {
        let events = world.events::<Scored>().unwrap();
        assert_eq!(events.read(&mut a).len(), 1);
    }

    world.send(Scored(2)).unwrap();
    let events = world.events::<Scored>().unwrap();
    assert_eq!(
        events.read(&mut a).map(|r| r.data().0).collect::<Vec<_>>(),
        vec![2]
    );
    assert_eq!(
        events.read(&mut b).map(|r| r.data().0).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[test]
fn test_handled_records_are_purged() {
    let mut world = World::new();
    world.add_event::<Scored>(8);
    for n in 0..6 {
        world.send(Scored(n)).unwrap();
    }

    {
        let events = world.events::<Scored>().unwrap();
        let mut cursor = EventCursor::default();
        for record in events.read(&mut cursor) {
            if record.data().0 % 2 == 0 {
                record.mark_handled();
            }
        }
    }

    let events: &mut Events<Scored> = world.events_mut().unwrap();
    assert_eq!(events.discard_handled(), 3);
    assert!(events.iter().all(|r| r.data().0 % 2 == 1));
}

#[test]
fn test_missing_store_is_a_wiring_error() {
    let mut world = World::new();
    let err = world.send(Unregistered).unwrap_err();
    assert!(matches!(err, EcsError::EventStoreMissing(name) if name.contains("Unregistered")));
    assert!(world.events::<Unregistered>().is_err());
}
