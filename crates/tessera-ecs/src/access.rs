//! Read/write access sets.
//!
//! Every query and procedure parameter describes the data it touches.
//! A single procedure must not alias its own mutable borrows; embedders
//! that want to run procedures side by side can compare whole sets with
//! [`Access::conflicts_with`].

use std::{any::TypeId, fmt};

use rustc_hash::FxHashSet;

use crate::component::ComponentId;

/// The first overlapping borrow found between two access sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessConflict {
    Component(ComponentId),
    Resource(TypeId),
    /// One side needs the whole world.
    World,
}

impl fmt::Display for AccessConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Component(id) => write!(f, "component {id:?}"),
            Self::Resource(id) => write!(f, "resource {id:?}"),
            Self::World => f.write_str("exclusive world access"),
        }
    }
}

/// Component and resource reads/writes of one query or procedure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Access {
    reads: FxHashSet<ComponentId>,
    writes: FxHashSet<ComponentId>,
    resource_reads: FxHashSet<TypeId>,
    resource_writes: FxHashSet<TypeId>,
    exclusive: bool,
}

impl Access {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a shared component read. Fails if the same set already writes it.
    pub fn add_read(&mut self, id: ComponentId) -> Result<(), AccessConflict> {
        if self.exclusive {
            return Err(AccessConflict::World);
        }
        if self.writes.contains(&id) {
            return Err(AccessConflict::Component(id));
        }
        self.reads.insert(id);
        Ok(())
    }

    /// Record a component write. Fails if the same set already touches it.
    pub fn add_write(&mut self, id: ComponentId) -> Result<(), AccessConflict> {
        if self.exclusive {
            return Err(AccessConflict::World);
        }
        if self.reads.contains(&id) || !self.writes.insert(id) {
            return Err(AccessConflict::Component(id));
        }
        Ok(())
    }

    pub fn add_resource_read(&mut self, id: TypeId) -> Result<(), AccessConflict> {
        if self.exclusive {
            return Err(AccessConflict::World);
        }
        if self.resource_writes.contains(&id) {
            return Err(AccessConflict::Resource(id));
        }
        self.resource_reads.insert(id);
        Ok(())
    }

    pub fn add_resource_write(&mut self, id: TypeId) -> Result<(), AccessConflict> {
        if self.exclusive {
            return Err(AccessConflict::World);
        }
        if self.resource_reads.contains(&id) || !self.resource_writes.insert(id) {
            return Err(AccessConflict::Resource(id));
        }
        Ok(())
    }

    /// Claim the entire world.
    pub fn set_exclusive(&mut self) {
        self.exclusive = true;
    }

    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.exclusive
            && self.reads.is_empty()
            && self.writes.is_empty()
            && self.resource_reads.is_empty()
            && self.resource_writes.is_empty()
    }

    /// Component ids read (and not written).
    pub fn reads(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.reads.iter().copied()
    }

    pub fn writes(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.writes.iter().copied()
    }

    #[must_use]
    pub fn reads_component(&self, id: ComponentId) -> bool {
        self.exclusive || self.reads.contains(&id) || self.writes.contains(&id)
    }

    #[must_use]
    pub fn writes_component(&self, id: ComponentId) -> bool {
        self.exclusive || self.writes.contains(&id)
    }

    /// The first borrow `self` and `other` cannot hold at the same time.
    #[must_use]
    pub fn conflict_with(&self, other: &Self) -> Option<AccessConflict> {
        if (self.exclusive && !other.is_empty()) || (other.exclusive && !self.is_empty()) {
            return Some(AccessConflict::World);
        }

        let component = |a: &Self, b: &Self| {
            a.writes
                .iter()
                .find(|id| b.writes.contains(id) || b.reads.contains(id))
                .copied()
        };
        let resource = |a: &Self, b: &Self| {
            a.resource_writes
                .iter()
                .find(|id| b.resource_writes.contains(id) || b.resource_reads.contains(id))
                .copied()
        };

        component(self, other)
            .or_else(|| component(other, self))
            .map(AccessConflict::Component)
            .or_else(|| {
                resource(self, other)
                    .or_else(|| resource(other, self))
                    .map(AccessConflict::Resource)
            })
    }

    /// Whether the two sets could not run at the same time.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.conflict_with(other).is_some()
    }

    /// Merge `other` into `self`, failing on the first conflict.
    pub fn try_extend(&mut self, other: &Self) -> Result<(), AccessConflict> {
        if let Some(conflict) = self.conflict_with(other) {
            return Err(conflict);
        }
        self.reads.extend(other.reads.iter().copied());
        self.writes.extend(other.writes.iter().copied());
        self.resource_reads
            .extend(other.resource_reads.iter().copied());
        self.resource_writes
            .extend(other.resource_writes.iter().copied());
        self.exclusive |= other.exclusive;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ComponentId = ComponentId::from_raw(0);
    const B: ComponentId = ComponentId::from_raw(1);

    #[test]
    fn test_reads_do_not_conflict() {
        let mut left = Access::new();
        let mut right = Access::new();
        left.add_read(A).unwrap();
        right.add_read(A).unwrap();

        assert!(!left.conflicts_with(&right));
    }

    #[test]
    fn test_write_conflicts_with_read() {
        let mut left = Access::new();
        let mut right = Access::new();
        left.add_write(A).unwrap();
        right.add_read(B).unwrap();
        assert!(!left.conflicts_with(&right));

        right.add_read(A).unwrap();
        assert_eq!(right.conflict_with(&left), Some(AccessConflict::Component(A)));
    }

    #[test]
    fn test_self_aliasing_is_rejected() {
        let mut access = Access::new();
        access.add_read(A).unwrap();

        assert_eq!(access.add_write(A), Err(AccessConflict::Component(A)));
        access.add_write(B).unwrap();
        assert_eq!(access.add_write(B), Err(AccessConflict::Component(B)));
    }

    #[test]
    fn test_resource_conflicts() {
        let id = TypeId::of::<u32>();
        let mut left = Access::new();
        let mut right = Access::new();
        left.add_resource_write(id).unwrap();
        right.add_resource_read(id).unwrap();

        assert_eq!(left.try_extend(&right), Err(AccessConflict::Resource(id)));
    }

    #[test]
    fn test_exclusive_conflicts_with_everything() {
        let mut world = Access::new();
        world.set_exclusive();
        let mut reader = Access::new();
        reader.add_read(A).unwrap();

        assert!(world.conflicts_with(&reader));
        assert!(!world.conflicts_with(&Access::new()));
    }
}
