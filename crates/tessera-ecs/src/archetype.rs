//! Archetype tables.
//!
//! Every distinct set of component types gets one [`Archetype`]: a list of
//! entities plus one [`Column`] per type, kept row-aligned so row `i` of
//! every column belongs to `entities[i]`. Adding or removing a component
//! migrates the entity to the neighbouring archetype.

use std::fmt;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::{
    component::{ComponentId, ComponentRegistry},
    entity::Entity,
    storage::Column,
};

/// Sorted component ids; the canonical key of an archetype.
pub type Signature = SmallVec<[ComponentId; 8]>;

/// Index of an archetype in its [`ArchetypeStorage`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    /// Where freshly spawned, component-less entities live.
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

/// Cached archetype transitions, filled lazily as entities migrate.
#[derive(Default)]
struct Edges {
    add: FxHashMap<ComponentId, ArchetypeId>,
    remove: FxHashMap<ComponentId, ArchetypeId>,
}

/// Entities sharing one exact component signature.
pub struct Archetype {
    id: ArchetypeId,
    components: Signature,
    /// Parallel to `components`.
    columns: Vec<Column>,
    component_indices: FxHashMap<ComponentId, usize>,
    entities: Vec<Entity>,
    edges: Edges,
}

impl Archetype {
    /// Create a new archetype for a sorted, duplicate-free signature.
    fn new(id: ArchetypeId, components: Signature, registry: &ComponentRegistry) -> Self {
        debug_assert!(components.windows(2).all(|w| w[0] < w[1]));

        let mut component_indices =
            FxHashMap::with_capacity_and_hasher(components.len(), Default::default());
        let mut columns = Vec::with_capacity(components.len());

        for (idx, &comp_id) in components.iter().enumerate() {
            let info = registry
                .get_info(comp_id)
                .expect("archetype signature holds an unregistered component");
            component_indices.insert(comp_id, idx);
            columns.push(Column::new(info.clone()));
        }

        Self {
            id,
            components,
            columns,
            component_indices,
            entities: Vec::new(),
            edges: Edges::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Signature, ascending.
    #[must_use]
    pub fn components(&self) -> &[ComponentId] {
        &self.components
    }

    #[must_use]
    pub fn contains(&self, component_id: ComponentId) -> bool {
        self.component_indices.contains_key(&component_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[must_use]
    pub fn column_index(&self, component_id: ComponentId) -> Option<usize> {
        self.component_indices.get(&component_id).copied()
    }

    #[must_use]
    pub fn column(&self, component_id: ComponentId) -> Option<&Column> {
        self.column_index(component_id).map(|idx| &self.columns[idx])
    }

    #[must_use]
    pub fn column_mut(&mut self, component_id: ComponentId) -> Option<&mut Column> {
        self.column_index(component_id)
            .map(|idx| &mut self.columns[idx])
    }

    /// Columns in signature order.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Raw pointer to a component of the entity at `row`, if this archetype stores it.
    #[must_use]
    pub fn component_ptr(&self, component_id: ComponentId, row: usize) -> Option<*mut u8> {
        if row >= self.entities.len() {
            return None;
        }
        let column = self.column(component_id)?;
        // SAFETY: row < len, and every column has the same length as `entities`
        Some(unsafe { column.get_unchecked_raw(row) })
    }

    /// Typed component reference.
    ///
    /// # Safety
    ///
    /// `T` must be the type registered under `component_id`.
    #[must_use]
    pub unsafe fn get<T: 'static>(&self, component_id: ComponentId, row: usize) -> Option<&T> {
        self.component_ptr(component_id, row)
            .map(|ptr| unsafe { &*ptr.cast::<T>() })
    }

    /// Typed mutable component reference.
    ///
    /// # Safety
    ///
    /// `T` must be the type registered under `component_id`.
    #[must_use]
    pub unsafe fn get_mut<T: 'static>(
        &mut self,
        component_id: ComponentId,
        row: usize,
    ) -> Option<&mut T> {
        self.component_ptr(component_id, row)
            .map(|ptr| unsafe { &mut *ptr.cast::<T>() })
    }

    /// Append an entity whose components the caller pushes right after.
    ///
    /// The row-parity invariant is temporarily broken until every column
    /// has received exactly one value.
    pub(crate) fn push_entity(&mut self, entity: Entity) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        row
    }

    /// Push the bytes of one component for the entity most recently appended.
    ///
    /// # Safety
    ///
    /// `value` must point to a valid instance of the type behind `component_id`;
    /// ownership moves into the column.
    pub(crate) unsafe fn push_component(&mut self, component_id: ComponentId, value: *const u8) {
        let idx = self.component_indices[&component_id];
        unsafe { self.columns[idx].push_raw(value) };
    }

    /// Drop every component of `row` and swap-remove it.
    ///
    /// Returns the entity moved into `row`, if any.
    pub(crate) fn remove_row(&mut self, row: usize) -> Option<Entity> {
        for column in &mut self.columns {
            // SAFETY: row < len (checked by swap_remove on entities below)
            unsafe { column.swap_remove_drop(row) };
        }
        self.swap_remove_entity(row)
    }

    fn swap_remove_entity(&mut self, row: usize) -> Option<Entity> {
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.entities.reserve(additional);
        for column in &mut self.columns {
            column.reserve(additional);
        }
    }

    /// Sanity check for the row-parity invariant.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.columns
            .iter()
            .all(|column| column.len() == self.entities.len())
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("components", &self.components)
            .field("entity_count", &self.entities.len())
            .finish()
    }
}

/// What happened to the source table during a migration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Moved {
    /// Row of the entity in the destination archetype.
    pub row: usize,
    /// Entity that was swapped into the vacated source row.
    pub displaced: Option<Entity>,
}

/// What to do with source columns the destination archetype lacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Leftover {
    /// Drop the value in place.
    Drop,
    /// The caller already moved the value out.
    Forget,
}

/// Every archetype of a world, append-only.
///
/// Archetypes are never removed, so an `ArchetypeId` stays valid and
/// iteration order over archetypes is stable.
pub struct ArchetypeStorage {
    archetypes: Vec<Archetype>,
    archetype_map: FxHashMap<Signature, ArchetypeId>,
}

impl Default for ArchetypeStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchetypeStorage {
    /// Storage holding only [`ArchetypeId::EMPTY`].
    #[must_use]
    pub fn new() -> Self {
        let mut storage = Self {
            archetypes: Vec::new(),
            archetype_map: FxHashMap::default(),
        };

        let empty = Archetype::new(ArchetypeId::EMPTY, Signature::new(), &ComponentRegistry::new());
        storage.archetypes.push(empty);
        storage
            .archetype_map
            .insert(Signature::new(), ArchetypeId::EMPTY);

        storage
    }

    /// Archetype for a component set, created on first request.
    ///
    /// The ids may come in any order; duplicates are collapsed.
    pub fn get_or_create(
        &mut self,
        component_ids: &[ComponentId],
        registry: &ComponentRegistry,
    ) -> ArchetypeId {
        let mut key: Signature = component_ids.iter().copied().collect();
        key.sort_unstable();
        key.dedup();
        self.get_or_create_sorted(key, registry)
    }

    fn get_or_create_sorted(&mut self, key: Signature, registry: &ComponentRegistry) -> ArchetypeId {
        if let Some(&id) = self.archetype_map.get(&key) {
            return id;
        }

        let id = ArchetypeId::from_raw(self.archetypes.len() as u32);
        debug!(?id, components = ?key, "creating archetype");

        let archetype = Archetype::new(id, key.clone(), registry);
        self.archetypes.push(archetype);
        self.archetype_map.insert(key, id);

        id
    }

    #[must_use]
    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index())
    }

    #[must_use]
    pub fn get_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id.index())
    }

    /// Archetype count, the empty one included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        // the empty archetype is never removed
        self.archetypes.len() <= 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    /// Archetypes created at or after position `start`.
    pub fn iter_from(&self, start: usize) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter().skip(start)
    }

    /// Lookup without creating.
    #[must_use]
    pub fn find(&self, component_ids: &[ComponentId]) -> Option<ArchetypeId> {
        let mut key: Signature = component_ids.iter().copied().collect();
        key.sort_unstable();
        key.dedup();
        self.archetype_map.get(&key).copied()
    }

    /// Target of adding `component_id` to `base`, via the edge cache.
    pub fn with_component(
        &mut self,
        base: ArchetypeId,
        component_id: ComponentId,
        registry: &ComponentRegistry,
    ) -> ArchetypeId {
        let base_arch = &self.archetypes[base.index()];

        if base_arch.contains(component_id) {
            return base;
        }
        if let Some(&target) = base_arch.edges.add.get(&component_id) {
            return target;
        }

        let mut key = base_arch.components.clone();
        let pos = key.partition_point(|&id| id < component_id);
        key.insert(pos, component_id);

        let target = self.get_or_create_sorted(key, registry);
        self.archetypes[base.index()]
            .edges
            .add
            .insert(component_id, target);
        self.archetypes[target.index()]
            .edges
            .remove
            .insert(component_id, base);
        target
    }

    /// Target of removing `component_id` from `base`, via the edge cache.
    pub fn without_component(
        &mut self,
        base: ArchetypeId,
        component_id: ComponentId,
        registry: &ComponentRegistry,
    ) -> ArchetypeId {
        let base_arch = &self.archetypes[base.index()];

        if !base_arch.contains(component_id) {
            return base;
        }
        if let Some(&target) = base_arch.edges.remove.get(&component_id) {
            return target;
        }

        let key: Signature = base_arch
            .components
            .iter()
            .copied()
            .filter(|&id| id != component_id)
            .collect();

        let target = self.get_or_create_sorted(key, registry);
        self.archetypes[base.index()]
            .edges
            .remove
            .insert(component_id, target);
        self.archetypes[target.index()]
            .edges
            .add
            .insert(component_id, base);
        target
    }

    /// Two distinct archetypes borrowed mutably at once.
    fn pair_mut(&mut self, a: ArchetypeId, b: ArchetypeId) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(a, b, "cannot borrow the same archetype twice");
        if a.index() < b.index() {
            let (lo, hi) = self.archetypes.split_at_mut(b.index());
            (&mut lo[a.index()], &mut hi[0])
        } else {
            let (lo, hi) = self.archetypes.split_at_mut(a.index());
            (&mut hi[0], &mut lo[b.index()])
        }
    }

    /// Move the entity at `row` of `src` into `dst`.
    ///
    /// Columns shared by both archetypes are moved bitwise. Source columns
    /// missing from `dst` are handled per `leftover`. Destination columns
    /// missing from `src` are left one short: the caller must push them
    /// before anything else observes `dst`.
    ///
    /// # Safety
    ///
    /// `row` must be a live row of `src`, and `src != dst`.
    pub(crate) unsafe fn move_row(
        &mut self,
        src: ArchetypeId,
        row: usize,
        dst: ArchetypeId,
        leftover: Leftover,
    ) -> Moved {
        let (from, to) = self.pair_mut(src, dst);
        let entity = from.entities[row];
        trace!(?entity, ?src, ?dst, "migrating row");

        for column in &mut from.columns {
            let id = column.info().id();
            match to.component_indices.get(&id) {
                Some(&dst_idx) => unsafe {
                    to.columns[dst_idx].push_raw(column.get_unchecked_raw(row));
                    column.swap_remove_forget(row);
                },
                None => unsafe {
                    match leftover {
                        Leftover::Drop => column.swap_remove_drop(row),
                        Leftover::Forget => column.swap_remove_forget(row),
                    };
                },
            }
        }

        let new_row = to.push_entity(entity);
        let displaced = from.swap_remove_entity(row);

        Moved {
            row: new_row,
            displaced,
        }
    }
}

impl std::ops::Index<ArchetypeId> for ArchetypeStorage {
    type Output = Archetype;

    fn index(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }
}

impl std::ops::IndexMut<ArchetypeId> for ArchetypeStorage {
    fn index_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }
}

impl fmt::Debug for ArchetypeStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchetypeStorage")
            .field("archetype_count", &self.archetypes.len())
            .finish()
    }
}
