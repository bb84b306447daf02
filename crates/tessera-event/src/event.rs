//! Event marker trait and stored records.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

/// Marker trait for event payloads.
///
/// Any `Send + Sync + 'static` type can be written to an event store.
pub trait Event: Send + Sync + 'static {}

// Blanket implementation: any Send + Sync + 'static type can be an event
impl<T: Send + Sync + 'static> Event for T {}

/// Sequence number of an event within its store.
///
/// Ids increase by one per write and are never reused, so readers can
/// tell how many events they missed after an overwrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub(crate) u64);

impl EventId {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// A written event plus its handled flag.
pub struct EventRecord<T> {
    id: EventId,
    data: T,
    /// Set by any reader (or the writer) through a shared borrow.
    handled: AtomicBool,
}

impl<T> EventRecord<T> {
    pub(crate) const fn new(id: EventId, data: T) -> Self {
        Self {
            id,
            data,
            handled: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> EventId {
        self.id
    }

    #[must_use]
    pub const fn data(&self) -> &T {
        &self.data
    }

    pub(crate) fn into_data(self) -> T {
        self.data
    }

    /// Flag the record for removal by [`Events::discard_handled`](crate::Events::discard_handled).
    pub fn mark_handled(&self) {
        self.handled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Relaxed)
    }
}

impl<T> std::ops::Deref for EventRecord<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for EventRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("handled", &self.is_handled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Damage {
        amount: f32,
    }

    #[test]
    fn test_any_type_is_event() {
        fn assert_event<T: Event>() {}

        assert_event::<Damage>();
        assert_event::<i32>();
        assert_event::<String>();
    }

    #[test]
    fn test_handled_flag_through_shared_ref() {
        let record = EventRecord::new(EventId(4), Damage { amount: 2.5 });
        let shared = &record;

        assert!(!shared.is_handled());
        shared.mark_handled();
        assert!(record.is_handled());
        assert_eq!(record.amount, 2.5);
        assert_eq!(record.id().get(), 4);
    }
}
