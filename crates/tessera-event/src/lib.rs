#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::missing_errors_doc)]

//! Tessera Event System
//!
//! Typed, fixed-capacity event stores living as world resources.
//!
//! # Core Concept: Lossy Rings, Private Cursors
//!
//! - Every event type has one ring of `capacity` records
//! - Writing never fails; a full ring overwrites its oldest record
//! - Each reader owns an [`EventCursor`] and sees every retained record once
//! - Records carry a `handled` flag; [`Events::discard_handled`] purges them
//!
//! # Example
//!
//! ```ignore
//! world.add_event::<Damage>(256);
//! world.send(Damage { amount: 10.0 })?;
//!
//! let mut cursor = EventCursor::default();
//! for record in world.events::<Damage>()?.read(&mut cursor) {
//!     apply(record.data());
//!     record.mark_handled();
//! }
//! ```

mod event;
mod store;
mod world_ext;

pub use event::{Event, EventId, EventRecord};
pub use store::{DEFAULT_EVENT_CAPACITY, EventCursor, Events};
pub use world_ext::EventWorldExt;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{Event, EventCursor, EventWorldExt, Events};
}
