//! Stage identifiers.
//!
//! Stage ids form one total order. The predefined lifecycle stages sit
//! in 100,000-wide bands so custom stages can be spliced between them:
//!
//! ```text
//! PRE_STARTUP      100_000
//! STARTUP          200_000
//! POST_STARTUP     300_000
//! FIRST            400_000
//! PRE_UPDATE       500_000
//! STATE_TRANSITION 600_000
//! UPDATE           700_000
//! POST_UPDATE      800_000
//! LAST             900_000
//! ```
//!
//! Stages registered by name get a hash-derived id with the top bit set,
//! so they always sort after every explicit id below `2^63`.

use std::{
    borrow::Cow,
    fmt,
    hash::{Hash, Hasher},
};

use rustc_hash::FxHasher;

/// Position of a stage in the run order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(u64);

const HASHED_BIT: u64 = 1 << 63;

impl StageId {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    /// An explicit id. Values at or above `2^63` overlap the hashed range.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Deterministic id for a named stage, placed in the upper half.
    #[must_use]
    pub fn hashed(name: &str) -> Self {
        let mut hasher = FxHasher::default();
        name.hash(&mut hasher);
        Self(HASHED_BIT | (hasher.finish() >> 1))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_hashed(self) -> bool {
        self.0 & HASHED_BIT != 0
    }
}

impl fmt::Debug for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hashed() {
            write!(f, "StageId(#{:x})", self.0 & !HASHED_BIT)
        } else {
            write!(f, "StageId({})", self.0)
        }
    }
}

pub const PRE_STARTUP: StageId = StageId(100_000);
pub const STARTUP: StageId = StageId(200_000);
pub const POST_STARTUP: StageId = StageId(300_000);
pub const FIRST: StageId = StageId(400_000);
pub const PRE_UPDATE: StageId = StageId(500_000);
/// Pending state transitions are applied when this stage starts.
pub const STATE_TRANSITION: StageId = StageId(600_000);
pub const UPDATE: StageId = StageId(700_000);
pub const POST_UPDATE: StageId = StageId(800_000);
pub const LAST: StageId = StageId(900_000);

pub(crate) const PREDEFINED: [(StageId, &str); 9] = [
    (PRE_STARTUP, "pre_startup"),
    (STARTUP, "startup"),
    (POST_STARTUP, "post_startup"),
    (FIRST, "first"),
    (PRE_UPDATE, "pre_update"),
    (STATE_TRANSITION, "state_transition"),
    (UPDATE, "update"),
    (POST_UPDATE, "post_update"),
    (LAST, "last"),
];

/// How callers refer to a stage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StageLabel {
    Id(StageId),
    Named(Cow<'static, str>),
}

impl StageLabel {
    /// Run-order id of this label.
    #[must_use]
    pub fn id(&self) -> StageId {
        match self {
            Self::Id(id) => *id,
            Self::Named(name) => StageId::hashed(name),
        }
    }
}

impl From<StageId> for StageLabel {
    fn from(id: StageId) -> Self {
        Self::Id(id)
    }
}

impl From<&'static str> for StageLabel {
    fn from(name: &'static str) -> Self {
        Self::Named(Cow::Borrowed(name))
    }
}

impl From<String> for StageLabel {
    fn from(name: String) -> Self {
        Self::Named(Cow::Owned(name))
    }
}

impl fmt::Display for StageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => match PREDEFINED.iter().find(|(known, _)| known == id) {
                Some((_, name)) => f.write_str(name),
                None => write!(f, "{}", id.get()),
            },
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Sort key of a registered stage. Stages sharing an id (a hash
/// collision) run in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct StageKey {
    pub id: StageId,
    pub seq: u64,
}

impl StageKey {
    pub const fn first(id: StageId) -> Self {
        Self { id, seq: 0 }
    }

    pub const fn last(id: StageId) -> Self {
        Self { id, seq: u64::MAX }
    }
}
