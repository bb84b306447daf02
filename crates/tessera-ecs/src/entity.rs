//! Entity handles and the entity table.
//!
//! Entities use a generational index pattern to safely reuse slots
//! while detecting use-after-free scenarios. The table also records
//! where each live entity currently sits in archetype storage.

use std::fmt;

use crate::archetype::ArchetypeId;

/// Bumped every time a slot is freed, so old handles stop matching.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(u32);

impl Generation {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// The following generation, or `None` once `u32::MAX` is reached.
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(next) => Some(Self(next)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Raw entity index into the entity table.
pub type EntityId = u32;

/// A handle to an entity: slot index plus the generation it was issued with.
///
/// A handle is alive exactly when the table's generation for `id`
/// still equals the handle's generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    /// Index into the entity table.
    id: EntityId,
    generation: Generation,
}

impl Entity {
    /// A handle that never refers to a live entity.
    ///
    /// Used in errors raised before an entity has been allocated.
    pub const PLACEHOLDER: Self = Self::new(u32::MAX, Generation(u32::MAX));

    #[must_use]
    pub const fn new(id: EntityId, generation: Generation) -> Self {
        Self { id, generation }
    }

    #[must_use]
    pub const fn id(self) -> EntityId {
        self.id
    }

    #[must_use]
    pub const fn generation(self) -> Generation {
        self.generation
    }

    /// Generation in the high half, index in the low half.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation.0 as u64) << 32) | (self.id as u64)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            id: bits as u32,
            generation: Generation((bits >> 32) as u32),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.id, self.generation.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.id, self.generation.0)
    }
}

/// Archetype and row currently holding an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype_id: ArchetypeId,
    pub row: usize,
}

/// One slot of the entity table.
#[derive(Clone, Copy, Debug)]
struct Slot {
    generation: Generation,
    /// `None` while the slot is free.
    location: Option<EntityLocation>,
    /// Generations exhausted; the index is never handed out again.
    retired: bool,
}

impl Slot {
    fn matches(&self, entity: Entity) -> bool {
        !self.retired && self.generation == entity.generation()
    }
}

/// The entity table: generation counters, a free list, and the
/// archetype/row each live entity occupies.
///
/// Rows move whenever archetype storage swap-removes; the world reports
/// every displaced entity back here via [`Entities::set_row`].
#[derive(Default)]
pub struct Entities {
    /// One slot per index ever handed out.
    slots: Vec<Slot>,
    /// Free list of recycled indices.
    free_list: Vec<EntityId>,
    alive_count: u32,
}

impl Entities {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            alive_count: 0,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::with_capacity(capacity / 4),
            alive_count: 0,
        }
    }

    /// Reserve room for `additional` fresh slots.
    pub fn reserve(&mut self, additional: usize) {
        self.slots
            .reserve(additional.saturating_sub(self.free_list.len()));
    }

    /// Allocate a handle, reusing a freed index when one is available.
    ///
    /// The new entity has no location until [`Entities::set_location`] runs.
    pub fn allocate(&mut self) -> Entity {
        self.alive_count += 1;

        if let Some(id) = self.free_list.pop() {
            // Generation was already bumped when the slot was freed.
            Entity::new(id, self.slots[id as usize].generation)
        } else {
            let id = self.slots.len() as EntityId;
            self.slots.push(Slot {
                generation: Generation::new(),
                location: None,
                retired: false,
            });
            Entity::new(id, Generation::new())
        }
    }

    /// Release an entity's slot and invalidate every copy of its handle.
    ///
    /// A slot whose generation cannot grow any further is retired instead
    /// of recycled. Returns the location the entity occupied, or `None` if
    /// the handle was stale.
    pub fn free(&mut self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.slots.get_mut(entity.id() as usize)?;
        if !slot.matches(entity) {
            return None;
        }

        match slot.generation.checked_next() {
            Some(next) => {
                slot.generation = next;
                self.free_list.push(entity.id());
            }
            None => slot.retired = true,
        }
        let location = slot.location.take();
        self.alive_count -= 1;
        location
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.id() as usize)
            .is_some_and(|slot| slot.matches(entity))
    }

    /// Location of a live entity.
    #[must_use]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.slots.get(entity.id() as usize)?;
        if !slot.matches(entity) {
            return None;
        }
        slot.location
    }

    /// Record where a live entity now sits.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        if let Some(slot) = self.slots.get_mut(entity.id() as usize) {
            debug_assert_eq!(slot.generation, entity.generation());
            slot.location = Some(location);
        }
    }

    /// Update only the row of an entity that was displaced by a swap-remove.
    pub fn set_row(&mut self, entity: Entity, row: usize) {
        if let Some(Some(location)) = self
            .slots
            .get_mut(entity.id() as usize)
            .map(|slot| slot.location.as_mut())
        {
            location.row = row;
        }
    }

    #[must_use]
    pub const fn alive_count(&self) -> u32 {
        self.alive_count
    }

    /// Slots ever handed out, free ones included.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Debug for Entities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entities")
            .field("alive", &self.alive_count)
            .field("slots", &self.slots.len())
            .field("free", &self.free_list.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(table: &mut Entities, entity: Entity, row: usize) {
        table.set_location(
            entity,
            EntityLocation {
                archetype_id: ArchetypeId::EMPTY,
                row,
            },
        );
    }

    #[test]
    fn test_entity_allocation() {
        let mut table = Entities::new();

        let e1 = table.allocate();
        let e2 = table.allocate();

        assert_eq!(e1.id(), 0);
        assert_eq!(e2.id(), 1);
        assert!(table.is_alive(e1));
        assert!(table.is_alive(e2));
        assert_eq!(table.alive_count(), 2);
    }

    #[test]
    fn test_entity_free_and_reuse() {
        let mut table = Entities::new();

        let e1 = table.allocate();
        place(&mut table, e1, 0);
        assert!(table.free(e1).is_some());
        assert!(!table.is_alive(e1));
        assert_eq!(table.alive_count(), 0);

        // New allocation reuses the slot but with a strictly greater generation
        let e2 = table.allocate();
        assert_eq!(e2.id(), e1.id());
        assert!(e2.generation() > e1.generation());
        assert!(table.location(e1).is_none());
    }

    #[test]
    fn test_stale_free_is_rejected() {
        let mut table = Entities::new();

        let e1 = table.allocate();
        place(&mut table, e1, 0);
        table.free(e1);
        let _e2 = table.allocate();

        assert!(table.free(e1).is_none());
        assert_eq!(table.alive_count(), 1);
    }

    #[test]
    fn test_set_row_tracks_displacement() {
        let mut table = Entities::new();

        let e1 = table.allocate();
        place(&mut table, e1, 7);
        table.set_row(e1, 2);

        assert_eq!(table.location(e1).map(|l| l.row), Some(2));
    }

    #[test]
    fn test_entity_bits_roundtrip() {
        let entity = Entity::new(12345, Generation(67890));
        let bits = entity.to_bits();
        let recovered = Entity::from_bits(bits);
        assert_eq!(entity, recovered);
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let mut table = Entities::new();
        let first = table.allocate();
        table.slots[first.id() as usize].generation = Generation(u32::MAX);
        let last = Entity::new(first.id(), Generation(u32::MAX));
        place(&mut table, last, 0);

        assert!(table.is_alive(last));
        assert!(table.free(last).is_some());
        assert!(!table.is_alive(last));
        assert_eq!(table.location(last), None);
        assert!(table.free(last).is_none());

        let fresh = table.allocate();
        assert_ne!(fresh.id(), first.id());
        assert_eq!(table.alive_count(), 1);
    }
}
