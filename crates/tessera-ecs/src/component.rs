//! Component types and their world-local ids.
//!
//! Columns store components as raw bytes, so every type that ever lands in
//! an archetype is registered first: the registry hands out a dense
//! [`ComponentId`] and keeps the layout and drop glue columns need.

use std::{alloc::Layout, any::TypeId, fmt};

use bitflags::bitflags;
use rustc_hash::FxHashMap;

/// Anything `Send + Sync + 'static` can be attached to an entity.
///
/// Values are moved bitwise between columns on archetype changes.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

/// Identifier of a component type within one world.
///
/// Ids are handed out densely in registration order, so they double as
/// the stable type-key archetype signatures are sorted by.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u32);

impl ComponentId {
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

bitflags! {
    /// Behavioural flags attached to a registered component type.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ComponentFlags: u8 {
        /// The type is a `Relation<R>` registered with the relation index.
        const RELATION = 1 << 0;
        /// Edges of this relation are mirrored into the hash index.
        const INDEXED = 1 << 1;
    }
}

/// Layout, drop glue and flags of one registered type.
#[derive(Clone)]
pub struct ComponentInfo {
    id: ComponentId,
    name: &'static str,
    layout: Layout,
    drop_fn: Option<unsafe fn(*mut u8)>,
    type_id: TypeId,
    flags: ComponentFlags,
}

impl ComponentInfo {
    #[must_use]
    pub fn of<T: Component>(id: ComponentId) -> Self {
        Self {
            id,
            name: std::any::type_name::<T>(),
            layout: Layout::new::<T>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(|ptr| unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) })
            } else {
                None
            },
            type_id: TypeId::of::<T>(),
            flags: ComponentFlags::empty(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ComponentId {
        self.id
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub const fn align(&self) -> usize {
        self.layout.align()
    }

    #[must_use]
    pub const fn flags(&self) -> ComponentFlags {
        self.flags
    }

    #[must_use]
    pub const fn needs_drop(&self) -> bool {
        self.drop_fn.is_some()
    }

    /// Run the type's destructor on `ptr`; a no-op for trivially dropped types.
    ///
    /// # Safety
    ///
    /// `ptr` holds a live value of this type, which is dead afterwards.
    pub unsafe fn drop_in_place(&self, ptr: *mut u8) {
        if let Some(drop_fn) = self.drop_fn {
            unsafe { drop_fn(ptr) };
        }
    }

    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} ({}B, align {}, {:?})",
            self.id,
            self.name,
            self.layout.size(),
            self.layout.align(),
            self.flags
        )
    }
}

/// `TypeId` to [`ComponentId`] table owned by a world.
///
/// Ids from one registry mean nothing to another.
#[derive(Default)]
pub struct ComponentRegistry {
    type_to_id: FxHashMap<TypeId, ComponentId>,
    /// Indexed by `ComponentId`.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `T`, issuing the next free one on first sight.
    pub fn register<T: Component>(&mut self) -> ComponentId {
        let next = ComponentId(self.infos.len() as u32);
        let id = *self.type_to_id.entry(TypeId::of::<T>()).or_insert(next);
        if id == next {
            self.infos.push(ComponentInfo::of::<T>(id));
        }
        id
    }

    #[must_use]
    pub fn get_id<T: Component>(&self) -> Option<ComponentId> {
        self.type_to_id.get(&TypeId::of::<T>()).copied()
    }

    #[must_use]
    pub fn get_id_by_type_id(&self, type_id: TypeId) -> Option<ComponentId> {
        self.type_to_id.get(&type_id).copied()
    }

    #[must_use]
    pub fn get_info(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// Type name for diagnostics, falling back to a placeholder for foreign ids.
    #[must_use]
    pub fn name(&self, id: ComponentId) -> &'static str {
        self.get_info(id).map_or("<unknown>", ComponentInfo::name)
    }

    /// Flags of a registered component, empty for unknown ids.
    #[must_use]
    pub fn flags(&self, id: ComponentId) -> ComponentFlags {
        self.get_info(id)
            .map_or(ComponentFlags::empty(), ComponentInfo::flags)
    }

    pub(crate) fn set_flags(&mut self, id: ComponentId, flags: ComponentFlags) {
        if let Some(info) = self.infos.get_mut(id.index()) {
            info.flags = flags;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Infos in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.iter()
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.infos.iter().map(|info| (info.id, info.name)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    struct Mass(#[allow(dead_code)] f64);

    struct Label(#[allow(dead_code)] String);

    #[derive(Clone, Copy)]
    struct Marker;

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = ComponentRegistry::new();
        let mass = registry.register::<Mass>();
        let label = registry.register::<Label>();

        assert_eq!(registry.register::<Mass>(), mass);
        assert_ne!(mass, label);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_id::<Label>(), Some(label));
        assert_eq!(registry.get_id::<Marker>(), None);
    }

    #[test]
    fn test_ids_are_dense_and_registry_local() {
        let mut a = ComponentRegistry::new();
        let mut b = ComponentRegistry::new();

        a.register::<Label>();
        let mass_in_a = a.register::<Mass>();
        let mass_in_b = b.register::<Mass>();

        assert_eq!(mass_in_a.as_raw(), 1);
        assert_eq!(mass_in_b.as_raw(), 0);
        assert_eq!(a.iter().map(ComponentInfo::id).collect::<Vec<_>>(), vec![
            ComponentId::from_raw(0),
            mass_in_a
        ]);
    }

    #[test]
    fn test_layout_and_drop_glue() {
        let mut registry = ComponentRegistry::new();
        let mass = registry.register::<Mass>();
        let label = registry.register::<Label>();
        let marker = registry.register::<Marker>();

        let info = registry.get_info(mass).unwrap();
        assert_eq!(info.layout(), Layout::new::<Mass>());
        assert!(info.is::<Mass>());
        assert!(!info.needs_drop());

        assert!(registry.get_info(label).unwrap().needs_drop());
        assert_eq!(registry.get_info(marker).unwrap().size(), 0);
        assert!(registry.name(label).ends_with("Label"));
        assert_eq!(registry.name(ComponentId::from_raw(42)), "<unknown>");
    }

    #[test]
    fn test_flags_update() {
        let mut registry = ComponentRegistry::new();
        let id = registry.register::<Mass>();
        assert!(registry.flags(id).is_empty());

        registry.set_flags(id, ComponentFlags::RELATION | ComponentFlags::INDEXED);

        assert!(registry.flags(id).contains(ComponentFlags::INDEXED));
        assert!(registry.flags(ComponentId::from_raw(99)).is_empty());
    }
}
