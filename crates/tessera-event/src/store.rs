//! Fixed-capacity event ring with independent reader cursors.
//!
//! Writes never fail: once the ring is full the oldest record is
//! overwritten, even if some reader has not seen it yet. Under sustained
//! overflow a slow reader loses events; [`Events::missed`] reports how
//! many.

use std::collections::VecDeque;

use tracing::trace;

use crate::event::{Event, EventId, EventRecord};

/// Capacity used by [`Events::default`] and `add_event_default`.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Position of one reader within one store.
///
/// Cursors are plain values owned by the reader, so any number of readers
/// see every retained record once each.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventCursor {
    /// Id of the first record this reader has not seen.
    next: u64,
}

/// Ring buffer of events of type `T`.
pub struct Events<T: Event> {
    records: VecDeque<EventRecord<T>>,
    capacity: usize,
    next_id: u64,
}

impl<T: Event> Default for Events<T> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl<T: Event> Events<T> {
    /// Create a store holding at most `capacity` records (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 0,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append an event, evicting the oldest record when full.
    pub fn write(&mut self, data: T) -> EventId {
        if self.records.len() == self.capacity {
            if let Some(evicted) = self.records.pop_front() {
                trace!(
                    event = std::any::type_name::<T>(),
                    id = evicted.id().get(),
                    handled = evicted.is_handled(),
                    "event store full, overwriting oldest record"
                );
            }
        }

        let id = EventId(self.next_id);
        self.next_id += 1;
        self.records.push_back(EventRecord::new(id, data));
        id
    }

    /// A cursor that starts at the oldest retained record.
    #[must_use]
    pub const fn reader(&self) -> EventCursor {
        EventCursor { next: 0 }
    }

    /// A cursor that only sees events written from now on.
    #[must_use]
    pub const fn reader_from_now(&self) -> EventCursor {
        EventCursor { next: self.next_id }
    }

    fn first_unseen(&self, cursor: &EventCursor) -> usize {
        self.records.partition_point(|record| record.id().0 < cursor.next)
    }

    /// Next record `cursor` has not seen, advancing it.
    pub fn read_next(&self, cursor: &mut EventCursor) -> Option<&EventRecord<T>> {
        let record = self.records.get(self.first_unseen(cursor))?;
        cursor.next = record.id().0 + 1;
        Some(record)
    }

    /// Every record `cursor` has not seen, oldest first. The cursor moves
    /// past all of them immediately.
    pub fn read<'a>(
        &'a self,
        cursor: &mut EventCursor,
    ) -> impl ExactSizeIterator<Item = &'a EventRecord<T>> + use<'a, T> {
        let start = self.first_unseen(cursor);
        cursor.next = self.next_id;
        self.records.range(start..)
    }

    /// Number of records written since `cursor` last read that were
    /// overwritten before it could see them.
    #[must_use]
    pub fn missed(&self, cursor: &EventCursor) -> u64 {
        let oldest = self.records.front().map_or(self.next_id, |r| r.id().0);
        oldest.saturating_sub(cursor.next)
    }

    /// Records `cursor` would still see.
    #[must_use]
    pub fn unread(&self, cursor: &EventCursor) -> usize {
        self.records.len() - self.first_unseen(cursor)
    }

    /// All retained records, oldest first.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &EventRecord<T>> {
        self.records.iter()
    }

    /// Look up a retained record by id.
    #[must_use]
    pub fn get(&self, id: EventId) -> Option<&EventRecord<T>> {
        let index = self.records.partition_point(|record| record.id() < id);
        self.records.get(index).filter(|record| record.id() == id)
    }

    /// Flag a record as handled. Returns `false` if it is no longer retained.
    pub fn mark_handled(&self, id: EventId) -> bool {
        self.get(id).map(EventRecord::mark_handled).is_some()
    }

    /// Drop every record flagged handled, returning how many were removed.
    ///
    /// Ids of the remaining records are unchanged, so existing cursors
    /// stay valid.
    pub fn discard_handled(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|record| !record.is_handled());
        before - self.records.len()
    }

    /// Remove and return every retained payload, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.records.drain(..).map(EventRecord::into_data)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl<T: Event> std::fmt::Debug for Events<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("event", &std::any::type_name::<T>())
            .field("len", &self.records.len())
            .field("capacity", &self.capacity)
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(events: &Events<u32>, cursor: &mut EventCursor) -> Vec<u32> {
        events.read(cursor).map(|r| *r.data()).collect()
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut events = Events::with_capacity(3);
        for value in 1..=5 {
            events.write(value);
        }

        let mut cursor = events.reader();
        assert_eq!(collect(&events, &mut cursor), vec![3, 4, 5]);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_readers_are_independent() {
        let mut events = Events::with_capacity(8);
        let mut early = events.reader();
        events.write(1);
        events.write(2);

        let mut late = events.reader();
        assert_eq!(collect(&events, &mut early), vec![1, 2]);
        assert_eq!(collect(&events, &mut early), Vec::<u32>::new());

        events.write(3);
        assert_eq!(collect(&events, &mut early), vec![3]);
        assert_eq!(collect(&events, &mut late), vec![1, 2, 3]);
    }

    #[test]
    fn test_read_next_advances_one_at_a_time() {
        let mut events = Events::with_capacity(4);
        events.write(10);
        events.write(20);

        let mut cursor = events.reader();
        assert_eq!(events.read_next(&mut cursor).map(|r| *r.data()), Some(10));
        assert_eq!(events.unread(&cursor), 1);
        assert_eq!(events.read_next(&mut cursor).map(|r| *r.data()), Some(20));
        assert!(events.read_next(&mut cursor).is_none());
    }

    #[test]
    fn test_reader_from_now_skips_history() {
        let mut events = Events::with_capacity(4);
        events.write(1);
        let mut cursor = events.reader_from_now();
        events.write(2);

        assert_eq!(collect(&events, &mut cursor), vec![2]);
    }

    #[test]
    fn test_missed_counts_overwritten() {
        let mut events = Events::with_capacity(2);
        let cursor = events.reader();
        for value in 0..5 {
            events.write(value);
        }
        assert_eq!(events.missed(&cursor), 3);
        assert_eq!(events.missed(&events.reader_from_now()), 0);
    }

    #[test]
    fn test_discard_handled_keeps_cursor_positions() {
        let mut events = Events::with_capacity(8);
        let ids: Vec<EventId> = (0..4).map(|v| events.write(v)).collect();

        let mut cursor = events.reader();
        assert_eq!(events.read_next(&mut cursor).map(|r| *r.data()), Some(0));

        assert!(events.mark_handled(ids[0]));
        assert!(events.mark_handled(ids[2]));
        assert_eq!(events.discard_handled(), 2);

        assert_eq!(collect(&events, &mut cursor), vec![1, 3]);
        assert!(!events.mark_handled(ids[2]));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut events = Events::with_capacity(0);
        events.write(1);
        events.write(2);
        assert_eq!(events.capacity(), 1);
        assert_eq!(events.drain().collect::<Vec<_>>(), vec![2]);
        assert!(events.is_empty());
    }
}
