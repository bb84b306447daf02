//! Deferred structural changes.
//!
//! Procedures that only borrow the world record spawns, despawns and edge
//! changes in [`Commands`]; the queue is applied right after the procedure
//! returns, before the next one starts.

use std::{any::type_name, fmt};

use tessera_ecs::{Bundle, Component, Entity, Resource, World};
use tessera_event::{Event, EventWorldExt};
use tracing::trace;

use crate::{
    error::TickResult,
    param::{Args, ProcedureParam},
    procedure::ProcedureMeta,
};

type Command = Box<dyn FnOnce(&mut World) -> TickResult<()> + Send + Sync>;

/// Ordered list of pending world changes.
#[derive(Default)]
pub struct CommandQueue {
    commands: Vec<Command>,
}

impl CommandQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, command: F)
    where
        F: FnOnce(&mut World) -> TickResult<()> + Send + Sync + 'static,
    {
        self.commands.push(Box::new(command));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Apply every command in push order.
    ///
    /// Stops at the first failure; the commands after it are dropped.
    pub fn apply(&mut self, world: &mut World) -> TickResult<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        trace!(count = self.commands.len(), "applying commands");
        for command in self.commands.drain(..) {
            command(world)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("len", &self.commands.len())
            .finish()
    }
}

/// Procedure parameter recording changes into the procedure's own queue.
pub struct Commands<'s> {
    queue: &'s mut CommandQueue,
}

impl<'s> Commands<'s> {
    pub fn new(queue: &'s mut CommandQueue) -> Self {
        Self { queue }
    }

    /// Queue an arbitrary world mutation.
    pub fn push<F>(&mut self, command: F)
    where
        F: FnOnce(&mut World) -> TickResult<()> + Send + Sync + 'static,
    {
        self.queue.push(command);
    }

    /// Spawn an entity carrying `bundle`. The id is only known once applied.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) {
        self.push(move |world| {
            world.spawn_bundle(bundle)?;
            Ok(())
        });
    }

    /// Spawn an entity and hand its id to `then` once applied.
    pub fn spawn_then<B, F>(&mut self, bundle: B, then: F)
    where
        B: Bundle,
        F: FnOnce(&mut World, Entity) -> TickResult<()> + Send + Sync + 'static,
    {
        self.push(move |world| {
            let entity = world.spawn_bundle(bundle)?;
            then(world, entity)
        });
    }

    pub fn despawn(&mut self, entity: Entity) {
        self.push(move |world| Ok(world.despawn(entity)?));
    }

    /// Add a component the entity must not already have.
    pub fn add<T: Component>(&mut self, entity: Entity, component: T) {
        self.push(move |world| Ok(world.add(entity, component)?));
    }

    /// Add or overwrite a component.
    pub fn insert<T: Component>(&mut self, entity: Entity, component: T) {
        self.push(move |world| {
            world.insert(entity, component)?;
            Ok(())
        });
    }

    pub fn remove<T: Component>(&mut self, entity: Entity) {
        self.push(move |world| {
            world.remove::<T>(entity)?;
            Ok(())
        });
    }

    pub fn relate<R: Component + Default>(&mut self, source: Entity, target: Entity) {
        self.push(move |world| Ok(world.relate::<R>(source, target)?));
    }

    pub fn relate_with<R: Component>(&mut self, source: Entity, target: Entity, data: R) {
        self.push(move |world| Ok(world.relate_with(source, target, data)?));
    }

    pub fn unrelate<R: Component>(&mut self, source: Entity, target: Entity) {
        self.push(move |world| {
            world.unrelate::<R>(source, target)?;
            Ok(())
        });
    }

    pub fn insert_resource<T: Resource>(&mut self, value: T) {
        self.push(move |world| {
            world.insert_resource(value);
            Ok(())
        });
    }

    pub fn remove_resource<T: Resource>(&mut self) {
        self.push(move |world| {
            if world.remove_resource::<T>().is_none() {
                trace!(resource = type_name::<T>(), "removing absent resource");
            }
            Ok(())
        });
    }

    /// Send an event once applied. Fails the flush if no store exists.
    pub fn send<T: Event>(&mut self, event: T) {
        self.push(move |world| {
            world.send(event)?;
            Ok(())
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// SAFETY: touches only procedure-owned state until flush, which has `&mut World`
unsafe impl ProcedureParam for Commands<'_> {
    type State = CommandQueue;
    type Item<'w, 's> = Commands<'s>;

    fn analyze(_world: &mut World, _meta: &mut ProcedureMeta) -> TickResult<CommandQueue> {
        Ok(CommandQueue::new())
    }

    unsafe fn apply<'w, 's>(
        state: &'s mut CommandQueue,
        _world: &'w World,
        _args: &'w Args,
    ) -> TickResult<Commands<'s>> {
        Ok(Commands::new(state))
    }

    fn flush(state: &mut CommandQueue, world: &mut World) -> TickResult<()> {
        state.apply(world)
    }
}

#[cfg(test)]
mod tests {
    use tessera_ecs::{EcsError, RelationMode};

    use super::*;
    use crate::error::TickError;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Health(u32);

    #[derive(Debug, Default, Clone, Copy)]
    struct ChildOf;

    #[test]
    fn test_queue_applies_in_order() {
        let mut world = World::new();
        let e = world.spawn_empty();
        let mut queue = CommandQueue::new();
        {
            let mut commands = Commands::new(&mut queue);
            commands.add(e, Health(1));
            commands.insert(e, Health(2));
            commands.spawn((Health(7),));
            assert_eq!(commands.len(), 3);
        }

        assert_eq!(world.entity_count(), 1);
        queue.apply(&mut world).unwrap();
        assert!(queue.is_empty());
        assert_eq!(world.get::<Health>(e).unwrap(), &Health(2));
        assert_eq!(world.entity_count(), 2);
    }

    #[test]
    fn test_first_failure_stops_flush() {
        let mut world = World::new();
        let e = world.spawn_empty();
        let mut queue = CommandQueue::new();
        {
            let mut commands = Commands::new(&mut queue);
            commands.remove::<Health>(e);
            commands.add(e, Health(1));
        }

        let err = queue.apply(&mut world).unwrap_err();
        assert!(matches!(err, TickError::Ecs(EcsError::MissingComponent { .. })));
        assert!(!world.has::<Health>(e));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_relation_commands() {
        let mut world = World::new();
        world.register_relation::<ChildOf>(RelationMode::Exclusive).unwrap();
        let parent = world.spawn_empty();
        let child = world.spawn_empty();

        let mut queue = CommandQueue::new();
        Commands::new(&mut queue).relate::<ChildOf>(child, parent);
        queue.apply(&mut world).unwrap();
        assert_eq!(world.parent::<ChildOf>(child), Some(parent));

        Commands::new(&mut queue).unrelate::<ChildOf>(child, parent);
        Commands::new(&mut queue).despawn(parent);
        queue.apply(&mut world).unwrap();
        assert_eq!(world.parent::<ChildOf>(child), None);
        assert!(!world.is_alive(parent));
    }
}
