//! Relations - directed edges between entities.
//!
//! An edge `source -> target` of relation type `R` lives in a
//! [`Relation<R>`] component on `source`. Each relation type is registered
//! in one of three modes:
//!
//! - [`RelationMode::Unindexed`]: the component is the only record.
//!   Finding the sources that point at an entity scans storage.
//! - [`RelationMode::Exclusive`]: mirrored into forward/backward hash maps,
//!   and a source keeps at most one target. Adding a new edge replaces the old one.
//! - [`RelationMode::Multi`]: mirrored, any number of targets per source.
//!
//! The component stays the source of truth. Adding or removing a
//! `Relation<R>` through the plain component API runs the same index
//! maintenance as [`World::relate`] and [`World::unrelate`].
//!
//! ```ignore
//! struct ChildOf;
//!
//! world.register_relation::<ChildOf>(RelationMode::Exclusive)?;
//! world.relate::<ChildOf>(child, parent_a)?;
//! world.relate::<ChildOf>(child, parent_b)?;
//! assert_eq!(world.parent::<ChildOf>(child), Some(parent_b));
//! assert!(world.children::<ChildOf>(parent_a).is_empty());
//! ```

use std::{any::type_name, borrow::Cow, fmt};

use rustc_hash::{FxBuildHasher, FxHashMap};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::{
    World,
    component::{Component, ComponentFlags, ComponentId},
    entity::Entity,
    error::{EcsError, EcsResult},
};

/// Outgoing edges of one relation type, stored as a component on the source.
///
/// Targets keep insertion order; `data[i]` belongs to `targets[i]`.
#[derive(Clone, PartialEq, Eq)]
pub struct Relation<R> {
    targets: SmallVec<[Entity; 1]>,
    data: SmallVec<[R; 1]>,
}

impl<R> Default for Relation<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Relation<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            targets: SmallVec::new(),
            data: SmallVec::new(),
        }
    }

    /// A relation with a single edge.
    #[must_use]
    pub fn with(target: Entity, data: R) -> Self {
        let mut relation = Self::new();
        relation.insert(target, data);
        relation
    }

    #[must_use]
    pub fn targets(&self) -> &[Entity] {
        &self.targets
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    #[must_use]
    pub fn contains(&self, target: Entity) -> bool {
        self.targets.contains(&target)
    }

    fn position(&self, target: Entity) -> Option<usize> {
        self.targets.iter().position(|&t| t == target)
    }

    /// Payload of the edge to `target`.
    #[must_use]
    pub fn get(&self, target: Entity) -> Option<&R> {
        self.position(target).map(|idx| &self.data[idx])
    }

    pub fn get_mut(&mut self, target: Entity) -> Option<&mut R> {
        self.position(target).map(|idx| &mut self.data[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Entity, &R)> {
        self.targets.iter().copied().zip(self.data.iter())
    }

    /// Add an edge, or replace the payload of an existing one.
    pub fn insert(&mut self, target: Entity, data: R) -> Option<R> {
        match self.position(target) {
            Some(idx) => Some(std::mem::replace(&mut self.data[idx], data)),
            None => {
                self.targets.push(target);
                self.data.push(data);
                None
            }
        }
    }

    /// Remove the edge to `target`, returning its payload.
    pub fn remove(&mut self, target: Entity) -> Option<R> {
        let idx = self.position(target)?;
        self.targets.remove(idx);
        Some(self.data.remove(idx))
    }

    fn clear(&mut self) {
        self.targets.clear();
        self.data.clear();
    }

    /// Drop every edge but the most recently added one.
    fn retain_last(&mut self) {
        let Some(last) = self.targets.len().checked_sub(1) else {
            return;
        };
        if last > 0 {
            self.targets.drain(..last);
            self.data.drain(..last);
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for Relation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// How a relation type is stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RelationMode {
    /// Component only; reverse lookups scan storage.
    #[default]
    Unindexed,
    /// Hash-indexed, one target per source.
    Exclusive,
    /// Hash-indexed, many targets per source.
    Multi,
}

impl RelationMode {
    #[must_use]
    pub const fn is_indexed(self) -> bool {
        !matches!(self, Self::Unindexed)
    }
}

type EdgeMap<V> = hashbrown::HashMap<Entity, V, FxBuildHasher>;
type Bucket = SmallVec<[Entity; 4]>;

/// Secondary index of one relation type.
enum EdgeIndex {
    None,
    Exclusive {
        forward: EdgeMap<Entity>,
        backward: EdgeMap<Bucket>,
    },
    Multi {
        forward: EdgeMap<Bucket>,
        backward: EdgeMap<Bucket>,
    },
}

impl EdgeIndex {
    fn for_mode(mode: RelationMode) -> Self {
        match mode {
            RelationMode::Unindexed => Self::None,
            RelationMode::Exclusive => Self::Exclusive {
                forward: EdgeMap::default(),
                backward: EdgeMap::default(),
            },
            RelationMode::Multi => Self::Multi {
                forward: EdgeMap::default(),
                backward: EdgeMap::default(),
            },
        }
    }

    fn insert(&mut self, source: Entity, target: Entity) {
        match self {
            Self::None => {}
            Self::Exclusive { forward, backward } => {
                if let Some(old) = forward.insert(source, target) {
                    if old != target {
                        bucket_remove(backward, old, source);
                    }
                }
                bucket_insert(backward, target, source);
            }
            Self::Multi { forward, backward } => {
                bucket_insert(forward, source, target);
                bucket_insert(backward, target, source);
            }
        }
    }

    fn remove(&mut self, source: Entity, target: Entity) {
        match self {
            Self::None => {}
            Self::Exclusive { forward, backward } => {
                if forward.get(&source) == Some(&target) {
                    forward.remove(&source);
                    bucket_remove(backward, target, source);
                }
            }
            Self::Multi { forward, backward } => {
                bucket_remove(forward, source, target);
                bucket_remove(backward, target, source);
            }
        }
    }

    /// Targets of `source`; `None` for unindexed relations.
    fn targets(&self, source: Entity) -> Option<&[Entity]> {
        match self {
            Self::None => None,
            Self::Exclusive { forward, .. } => {
                Some(forward.get(&source).map(std::slice::from_ref).unwrap_or_default())
            }
            Self::Multi { forward, .. } => {
                Some(forward.get(&source).map(|b| b.as_slice()).unwrap_or_default())
            }
        }
    }

    /// Sources pointing at `target`; `None` for unindexed relations.
    fn sources(&self, target: Entity) -> Option<&[Entity]> {
        match self {
            Self::None => None,
            Self::Exclusive { backward, .. } | Self::Multi { backward, .. } => {
                Some(backward.get(&target).map(|b| b.as_slice()).unwrap_or_default())
            }
        }
    }

    fn edge_count(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Exclusive { forward, .. } => forward.len(),
            Self::Multi { forward, .. } => forward.values().map(SmallVec::len).sum(),
        }
    }
}

fn bucket_insert(map: &mut EdgeMap<Bucket>, key: Entity, value: Entity) {
    let bucket = map.entry(key).or_default();
    if !bucket.contains(&value) {
        bucket.push(value);
    }
}

fn bucket_remove(map: &mut EdgeMap<Bucket>, key: Entity, value: Entity) {
    let Some(bucket) = map.get_mut(&key) else {
        return;
    };
    if let Some(idx) = bucket.iter().position(|&e| e == value) {
        bucket.remove(idx);
    }
    if bucket.is_empty() {
        map.remove(&key);
    }
}

/// Type-erased operations on a stored `Relation<R>`.
#[derive(Clone, Copy)]
struct RelationVTable {
    targets: unsafe fn(*const u8) -> Bucket,
    retain_last: unsafe fn(*mut u8),
    remove_target: unsafe fn(*mut u8, Entity) -> usize,
}

impl RelationVTable {
    fn of<R: Component>() -> Self {
        Self {
            targets: |ptr| unsafe { (*ptr.cast::<Relation<R>>()).targets.iter().copied().collect() },
            retain_last: |ptr| unsafe { (*ptr.cast::<Relation<R>>()).retain_last() },
            remove_target: |ptr, target| unsafe {
                let relation = &mut *ptr.cast::<Relation<R>>();
                relation.remove(target);
                relation.len()
            },
        }
    }
}

struct RelationSlot {
    name: &'static str,
    mode: RelationMode,
    /// Registered through `register_relation` rather than implied by first use.
    explicit: bool,
    edges: EdgeIndex,
    vtable: RelationVTable,
}

/// Per-world registry of relation types and their edge indices.
#[derive(Default)]
pub struct RelationIndex {
    slots: FxHashMap<ComponentId, RelationSlot>,
}

impl RelationIndex {
    /// Mode of the relation stored under `id` (the id of `Relation<R>`).
    #[must_use]
    pub fn mode(&self, id: ComponentId) -> Option<RelationMode> {
        self.slots.get(&id).map(|slot| slot.mode)
    }

    /// Number of indexed edges of the relation stored under `id`.
    #[must_use]
    pub fn edge_count(&self, id: ComponentId) -> usize {
        self.slots.get(&id).map_or(0, |slot| slot.edges.edge_count())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for RelationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.slots.values().map(|slot| (slot.name, slot.mode)))
            .finish()
    }
}

impl World {
    /// Register relation type `R` with an explicit storage mode.
    ///
    /// A relation first used without registration is implicitly
    /// [`RelationMode::Unindexed`]; registering it later builds the index
    /// from the components already stored. Re-registering an explicit
    /// relation with a different mode fails.
    pub fn register_relation<R: Component>(&mut self, mode: RelationMode) -> EcsResult<ComponentId> {
        self.register_relation_inner::<R>(mode, true)
    }

    /// Storage mode of relation `R`, if it has been used or registered.
    #[must_use]
    pub fn relation_mode<R: Component>(&self) -> Option<RelationMode> {
        self.components
            .get_id::<Relation<R>>()
            .and_then(|id| self.relations.mode(id))
    }

    fn register_relation_inner<R: Component>(
        &mut self,
        mode: RelationMode,
        explicit: bool,
    ) -> EcsResult<ComponentId> {
        let id = self.components.register::<Relation<R>>();
        let name = type_name::<R>();

        if let Some(slot) = self.relations.slots.get_mut(&id) {
            if slot.mode == mode || !explicit {
                slot.explicit |= explicit;
                return Ok(id);
            }
            if slot.explicit {
                return Err(EcsError::RelationModeConflict {
                    relation: name,
                    registered: slot.mode,
                    requested: mode,
                });
            }
        }

        debug!(relation = name, ?mode, explicit, "registering relation");

        let mut flags = ComponentFlags::RELATION;
        if mode.is_indexed() {
            flags |= ComponentFlags::INDEXED;
        }
        self.components.set_flags(id, flags);
        self.relations.slots.insert(
            id,
            RelationSlot {
                name,
                mode,
                explicit,
                edges: EdgeIndex::for_mode(mode),
                vtable: RelationVTable::of::<R>(),
            },
        );

        if mode.is_indexed() {
            self.rebuild_relation_index(id)?;
        }
        Ok(id)
    }

    fn ensure_relation<R: Component>(&mut self) -> EcsResult<ComponentId> {
        match self.components.get_id::<Relation<R>>() {
            Some(id) if self.relations.slots.contains_key(&id) => Ok(id),
            _ => self.register_relation_inner::<R>(RelationMode::Unindexed, false),
        }
    }

    /// Populate the index of `id` from every stored component.
    ///
    /// Unindexed edges are not detached when their target despawns, so
    /// dead targets are pruned here first. Sources left without edges
    /// lose the component.
    fn rebuild_relation_index(&mut self, id: ComponentId) -> EcsResult<()> {
        let Some(slot) = self.relations.slots.get_mut(&id) else {
            return Ok(());
        };
        let exclusive = slot.mode == RelationMode::Exclusive;
        let mut edges = EdgeIndex::for_mode(slot.mode);
        let mut emptied: SmallVec<[Entity; 8]> = SmallVec::new();

        for archetype in self.archetypes.iter() {
            let Some(column) = archetype.column(id) else {
                continue;
            };
            for (row, &source) in archetype.entities().iter().enumerate() {
                // SAFETY: row is live; the vtable matches the column type
                unsafe {
                    let ptr = column.get_unchecked_raw(row);
                    for target in (slot.vtable.targets)(ptr) {
                        if !self.entities.is_alive(target) {
                            (slot.vtable.remove_target)(ptr, target);
                        }
                    }
                    if exclusive {
                        (slot.vtable.retain_last)(ptr);
                    }
                    let targets = (slot.vtable.targets)(ptr);
                    if targets.is_empty() {
                        emptied.push(source);
                    }
                    for target in targets {
                        edges.insert(source, target);
                    }
                }
            }
        }

        slot.edges = edges;
        if !emptied.is_empty() {
            trace!(
                relation = slot.name,
                count = emptied.len(),
                "dropping relations to despawned targets"
            );
        }
        for source in emptied {
            self.remove_by_id(source, id)?;
        }
        Ok(())
    }

    /// Fail with `StaleHandle` if a relation value points at a dead entity.
    pub(crate) fn check_relation_targets(&self, id: ComponentId, value: *const u8) -> EcsResult<()> {
        let Some(slot) = self.relations.slots.get(&id) else {
            return Ok(());
        };
        // SAFETY: value is a Relation<R> matching this slot
        let targets = unsafe { (slot.vtable.targets)(value) };
        match targets.into_iter().find(|&target| !self.is_alive(target)) {
            Some(dead) => Err(EcsError::StaleHandle(dead)),
            None => Ok(()),
        }
    }

    /// Mirror the stored relation component of `source` into its index.
    pub(crate) fn index_relation(&mut self, source: Entity, id: ComponentId) {
        let Some(ptr) = self.component_raw(source, id) else {
            return;
        };
        let Some(slot) = self.relations.slots.get_mut(&id) else {
            return;
        };
        // SAFETY: ptr is a live Relation<R> matching this slot
        unsafe {
            if slot.mode == RelationMode::Exclusive {
                (slot.vtable.retain_last)(ptr);
            }
            for target in (slot.vtable.targets)(ptr) {
                slot.edges.insert(source, target);
            }
        }
    }

    /// Drop the index entries of `source`'s stored relation component.
    pub(crate) fn unindex_relation(&mut self, source: Entity, id: ComponentId) {
        let Some(ptr) = self.component_raw(source, id) else {
            return;
        };
        let Some(slot) = self.relations.slots.get_mut(&id) else {
            return;
        };
        // SAFETY: ptr is a live Relation<R> matching this slot
        for target in unsafe { (slot.vtable.targets)(ptr) } {
            slot.edges.remove(source, target);
        }
    }

    /// Remove every indexed edge that starts or ends at `entity`.
    pub(crate) fn detach_relations(&mut self, entity: Entity) -> EcsResult<()> {
        let indexed: SmallVec<[ComponentId; 8]> = self
            .relations
            .slots
            .iter()
            .filter(|(_, slot)| slot.mode.is_indexed())
            .map(|(&id, _)| id)
            .collect();

        for &id in &indexed {
            let sources: Bucket = self
                .relations
                .slots
                .get(&id)
                .and_then(|slot| slot.edges.sources(entity))
                .map(SmallVec::from_slice)
                .unwrap_or_default();

            for source in sources {
                let Some(ptr) = self.component_raw(source, id) else {
                    continue;
                };
                let Some(slot) = self.relations.slots.get_mut(&id) else {
                    continue;
                };
                slot.edges.remove(source, entity);
                // SAFETY: ptr is a live Relation<R> matching this slot
                let remaining = unsafe { (slot.vtable.remove_target)(ptr, entity) };
                if remaining == 0 {
                    self.remove_by_id(source, id)?;
                }
            }
        }

        let location = self.location(entity)?;
        let outgoing: SmallVec<[ComponentId; 4]> = self.archetypes[location.archetype_id]
            .components()
            .iter()
            .copied()
            .filter(|id| indexed.contains(id))
            .collect();
        for id in outgoing {
            self.unindex_relation(entity, id);
        }

        Ok(())
    }

    /// Add a `source -> target` edge of relation `R` with default payload.
    pub fn relate<R: Component + Default>(&mut self, source: Entity, target: Entity) -> EcsResult<()> {
        self.relate_with(source, target, R::default())
    }

    /// Add a `source -> target` edge carrying `data`.
    ///
    /// An existing edge to the same target gets its payload replaced. For
    /// exclusive relations any other outgoing edge of `source` is removed first.
    pub fn relate_with<R: Component>(
        &mut self,
        source: Entity,
        target: Entity,
        data: R,
    ) -> EcsResult<()> {
        for entity in [source, target] {
            if !self.is_alive(entity) {
                return Err(EcsError::StaleHandle(entity));
            }
        }

        let id = self.ensure_relation::<R>()?;
        let Some(ptr) = self.component_raw(source, id) else {
            return self.add(source, Relation::with(target, data));
        };

        // SAFETY: the column under id stores Relation<R>
        let relation = unsafe { &mut *ptr.cast::<Relation<R>>() };
        if relation.contains(target) {
            relation.insert(target, data);
            return Ok(());
        }

        if let Some(slot) = self.relations.slots.get_mut(&id) {
            if slot.mode == RelationMode::Exclusive {
                for &old in relation.targets() {
                    slot.edges.remove(source, old);
                }
                relation.clear();
            }
            slot.edges.insert(source, target);
        }
        relation.insert(target, data);

        Ok(())
    }

    /// Remove the `source -> target` edge, returning its payload.
    ///
    /// Removing the last outgoing edge removes the `Relation<R>` component.
    pub fn unrelate<R: Component>(&mut self, source: Entity, target: Entity) -> EcsResult<R> {
        if !self.is_alive(source) {
            return Err(EcsError::StaleHandle(source));
        }
        let not_found = || EcsError::EdgeNotFound {
            from: source,
            to: target,
            relation: type_name::<R>(),
        };

        let id = self
            .components
            .get_id::<Relation<R>>()
            .ok_or_else(not_found)?;
        let ptr = self.component_raw(source, id).ok_or_else(not_found)?;

        // SAFETY: the column under id stores Relation<R>
        let relation = unsafe { &mut *ptr.cast::<Relation<R>>() };
        let data = relation.remove(target).ok_or_else(not_found)?;
        let now_empty = relation.is_empty();

        if let Some(slot) = self.relations.slots.get_mut(&id) {
            slot.edges.remove(source, target);
        }
        if now_empty {
            self.remove_by_id(source, id)?;
        }

        Ok(data)
    }

    /// Whether a `source -> target` edge of relation `R` exists.
    #[must_use]
    pub fn has_relation<R: Component>(&self, source: Entity, target: Entity) -> bool {
        self.get::<Relation<R>>(source)
            .is_ok_and(|relation| relation.contains(target))
    }

    /// Targets of `source` (the entities it points at).
    #[must_use]
    pub fn parents<R: Component>(&self, source: Entity) -> &[Entity] {
        self.get::<Relation<R>>(source)
            .map(Relation::targets)
            .unwrap_or_default()
    }

    /// First target of `source`; the only one for exclusive relations.
    #[must_use]
    pub fn parent<R: Component>(&self, source: Entity) -> Option<Entity> {
        self.parents::<R>(source).first().copied()
    }

    /// Sources pointing at `target`.
    ///
    /// Borrowed from the index for indexed relations; collected by scanning
    /// storage otherwise.
    #[must_use]
    pub fn children<R: Component>(&self, target: Entity) -> Cow<'_, [Entity]> {
        let Some(id) = self.components.get_id::<Relation<R>>() else {
            return Cow::Borrowed(&[]);
        };
        if let Some(sources) = self
            .relations
            .slots
            .get(&id)
            .and_then(|slot| slot.edges.sources(target))
        {
            return Cow::Borrowed(sources);
        }

        let mut found = Vec::new();
        for archetype in self.archetypes.iter() {
            let Some(column) = archetype.column(id) else {
                continue;
            };
            // SAFETY: the column under id stores Relation<R>
            let relations = unsafe { column.as_slice::<Relation<R>>() };
            for (&source, relation) in archetype.entities().iter().zip(relations) {
                if relation.contains(target) {
                    found.push(source);
                }
            }
        }
        Cow::Owned(found)
    }

    /// Indexed targets of `source`, bypassing the component.
    ///
    /// `None` when `R` is unknown or unindexed.
    #[must_use]
    pub fn indexed_parents<R: Component>(&self, source: Entity) -> Option<&[Entity]> {
        let id = self.components.get_id::<Relation<R>>()?;
        self.relations.slots.get(&id)?.edges.targets(source)
    }

    /// Payload of the `source -> target` edge.
    #[must_use]
    pub fn relation_data<R: Component>(&self, source: Entity, target: Entity) -> Option<&R> {
        self.get::<Relation<R>>(source).ok()?.get(target)
    }

    /// Mutable payload of the `source -> target` edge.
    ///
    /// Payloads are not part of the index, so this is allowed for every mode.
    pub fn relation_data_mut<R: Component>(&mut self, source: Entity, target: Entity) -> Option<&mut R> {
        let id = self.components.get_id::<Relation<R>>()?;
        let ptr = self.component_raw(source, id)?;
        // SAFETY: the column under id stores Relation<R>; &mut self is exclusive
        unsafe { &mut *ptr.cast::<Relation<R>>() }.get_mut(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct ChildOf;

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Likes(u32);

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Near;

    #[test]
    fn test_relation_component_basics() {
        let a = Entity::new(1, crate::Generation::new());
        let b = Entity::new(2, crate::Generation::new());
        let mut relation = Relation::with(a, Likes(1));

        assert_eq!(relation.insert(b, Likes(2)), None);
        assert_eq!(relation.insert(a, Likes(3)), Some(Likes(1)));
        assert_eq!(relation.targets(), &[a, b]);

        relation.retain_last();
        assert_eq!(relation.targets(), &[b]);
        assert_eq!(relation.get(b), Some(&Likes(2)));
    }

    #[test]
    fn test_exclusive_replaces_previous_parent() {
        let mut world = World::new();
        world.register_relation::<ChildOf>(RelationMode::Exclusive).unwrap();

        let parent_a = world.spawn_empty();
        let parent_b = world.spawn_empty();
        let child = world.spawn_empty();

        world.relate::<ChildOf>(child, parent_a).unwrap();
        world.relate::<ChildOf>(child, parent_b).unwrap();

        assert_eq!(world.parent::<ChildOf>(child), Some(parent_b));
        assert_eq!(world.parents::<ChildOf>(child), &[parent_b]);
        assert!(world.children::<ChildOf>(parent_a).is_empty());
        assert_eq!(world.children::<ChildOf>(parent_b).as_ref(), &[child]);
        assert_eq!(world.indexed_parents::<ChildOf>(child), Some(&[parent_b][..]));
    }

    #[test]
    fn test_multi_index_tracks_all_edges() {
        let mut world = World::new();
        world.register_relation::<Likes>(RelationMode::Multi).unwrap();

        let alice = world.spawn_empty();
        let bob = world.spawn_empty();
        let carol = world.spawn_empty();

        world.relate_with(alice, bob, Likes(5)).unwrap();
        world.relate_with(alice, carol, Likes(7)).unwrap();
        world.relate_with(carol, bob, Likes(1)).unwrap();

        assert_eq!(world.parents::<Likes>(alice), &[bob, carol]);
        assert_eq!(world.children::<Likes>(bob).as_ref(), &[alice, carol]);
        assert_eq!(world.relation_data::<Likes>(alice, carol), Some(&Likes(7)));

        *world.relation_data_mut::<Likes>(alice, carol).unwrap() = Likes(8);
        assert_eq!(world.relation_data::<Likes>(alice, carol), Some(&Likes(8)));
    }

    #[test]
    fn test_unrelate_last_edge_removes_component() {
        let mut world = World::new();
        world.register_relation::<ChildOf>(RelationMode::Multi).unwrap();
        let parent = world.spawn_empty();
        let child = world.spawn_empty();

        world.relate::<ChildOf>(child, parent).unwrap();
        assert!(world.has::<Relation<ChildOf>>(child));

        world.unrelate::<ChildOf>(child, parent).unwrap();
        assert!(!world.has::<Relation<ChildOf>>(child));
        assert!(world.children::<ChildOf>(parent).is_empty());

        assert!(matches!(
            world.unrelate::<ChildOf>(child, parent),
            Err(EcsError::EdgeNotFound { .. })
        ));
    }

    #[test]
    fn test_dead_endpoints_are_rejected() {
        let mut world = World::new();
        let alive = world.spawn_empty();
        let dead = world.spawn_empty();
        world.despawn(dead).unwrap();

        assert!(matches!(
            world.relate::<Near>(alive, dead),
            Err(EcsError::StaleHandle(e)) if e == dead
        ));
        assert!(matches!(
            world.relate::<Near>(dead, alive),
            Err(EcsError::StaleHandle(e)) if e == dead
        ));
    }

    #[test]
    fn test_unindexed_children_scan() {
        let mut world = World::new();
        let target = world.spawn_empty();
        let a = world.spawn_empty();
        let b = world.spawn(Likes(0)).unwrap();

        world.relate::<Near>(a, target).unwrap();
        world.relate::<Near>(b, target).unwrap();

        assert_eq!(world.relation_mode::<Near>(), Some(RelationMode::Unindexed));
        let mut children = world.children::<Near>(target).into_owned();
        children.sort();
        assert_eq!(children, vec![a, b]);
        assert_eq!(world.indexed_parents::<Near>(a), None);
    }

    #[test]
    fn test_upgrade_builds_index_from_components() {
        let mut world = World::new();
        let p1 = world.spawn_empty();
        let p2 = world.spawn_empty();
        let child = world.spawn_empty();

        // Both edges exist before the relation is known to be exclusive
        world.relate::<ChildOf>(child, p1).unwrap();
        world.relate::<ChildOf>(child, p2).unwrap();

        world.register_relation::<ChildOf>(RelationMode::Exclusive).unwrap();

        assert_eq!(world.parents::<ChildOf>(child), &[p2]);
        assert_eq!(world.children::<ChildOf>(p2).as_ref(), &[child]);
        assert!(world.children::<ChildOf>(p1).is_empty());
    }

    #[test]
    fn test_mode_conflict() {
        let mut world = World::new();
        world.register_relation::<ChildOf>(RelationMode::Exclusive).unwrap();

        assert!(world.register_relation::<ChildOf>(RelationMode::Exclusive).is_ok());
        assert!(matches!(
            world.register_relation::<ChildOf>(RelationMode::Multi),
            Err(EcsError::RelationModeConflict { .. })
        ));
    }

    #[test]
    fn test_component_api_keeps_index_in_sync() {
        let mut world = World::new();
        world.register_relation::<ChildOf>(RelationMode::Multi).unwrap();
        let parent = world.spawn_empty();
        let child = world.spawn_empty();

        world.add(child, Relation::with(parent, ChildOf)).unwrap();
        assert_eq!(world.children::<ChildOf>(parent).as_ref(), &[child]);

        world.remove::<Relation<ChildOf>>(child).unwrap();
        assert!(world.children::<ChildOf>(parent).is_empty());

        let spawned = world.spawn(Relation::with(parent, ChildOf)).unwrap();
        assert_eq!(world.children::<ChildOf>(parent).as_ref(), &[spawned]);

        assert!(matches!(
            world.get_mut::<Relation<ChildOf>>(spawned),
            Err(EcsError::IndexedRelationAccess(_))
        ));
    }

    #[test]
    fn test_component_api_rejects_dead_targets() {
        let mut world = World::new();
        world.register_relation::<ChildOf>(RelationMode::Exclusive).unwrap();
        let dead = world.spawn_empty();
        world.despawn(dead).unwrap();
        let count = world.entity_count();

        let err = world.spawn(Relation::with(dead, ChildOf)).unwrap_err();
        assert!(matches!(err, EcsError::StaleHandle(_)));
        assert_eq!(world.entity_count(), count);

        let child = world.spawn_empty();
        assert!(world.add(child, Relation::with(dead, ChildOf)).is_err());
        assert!(!world.has::<Relation<ChildOf>>(child));
    }

    #[test]
    fn test_despawn_target_cleans_sources() {
        let mut world = World::new();
        world.register_relation::<ChildOf>(RelationMode::Exclusive).unwrap();
        world.register_relation::<Likes>(RelationMode::Multi).unwrap();

        let parent = world.spawn_empty();
        let other = world.spawn_empty();
        let child = world.spawn_empty();
        world.relate::<ChildOf>(child, parent).unwrap();
        world.relate_with(child, parent, Likes(1)).unwrap();
        world.relate_with(child, other, Likes(2)).unwrap();

        world.despawn(parent).unwrap();

        assert!(!world.has::<Relation<ChildOf>>(child));
        assert_eq!(world.parents::<Likes>(child), &[other]);
        assert_eq!(world.children::<Likes>(other).as_ref(), &[child]);
    }

    #[test]
    fn test_despawn_source_cleans_index() {
        let mut world = World::new();
        world.register_relation::<ChildOf>(RelationMode::Exclusive).unwrap();
        let parent = world.spawn_empty();
        let child = world.spawn_empty();
        world.relate::<ChildOf>(child, parent).unwrap();

        world.despawn(child).unwrap();

        assert!(world.children::<ChildOf>(parent).is_empty());
        let id = world.component_id::<Relation<ChildOf>>().unwrap();
        assert_eq!(world.relations.edge_count(id), 0);
    }
}
