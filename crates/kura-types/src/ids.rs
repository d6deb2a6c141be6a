//! Typed identifiers for blocks, sessions, and patches.
//!
//! `BlockId` is caller-supplied and opaque: a plain string, or path segments
//! joined with `/`. It is used verbatim inside local storage keys, so the key
//! separator `!` is rejected at construction.
//!
//! `SessionId` is the logical-clock owner for patches (one per device). The
//! low range is reserved for well-known sentinels, random ids start at 65536.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::IdError;

/// Separator used by local storage keys; forbidden inside block ids.
pub const KEY_SEPARATOR: char = '!';

/// Identity of one collaboratively edited document.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(String);

impl BlockId {
    /// Build a block id from a string, rejecting empty ids and the key separator.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.contains(KEY_SEPARATOR) {
            return Err(IdError::ReservedChar(id));
        }
        Ok(Self(id))
    }

    /// Build a block id from path segments, e.g. `["users", "42", "profile"]`.
    pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> Result<Self, IdError> {
        let joined = segments
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join("/");
        Self::new(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of this id.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl TryFrom<String> for BlockId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlockId> for String {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BlockId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// The logical-clock owner of a patch (one per device).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Kernel-generated changes.
    pub const SYSTEM: SessionId = SessionId(0);
    /// Changes authored by the server itself.
    pub const SERVER: SessionId = SessionId(1);
    /// "No actor": patches that belong to nobody's clock and are never merged
    /// into an edit session.
    pub const GLOBAL: SessionId = SessionId(2);

    /// Smallest id handed out by [`SessionId::random`].
    pub const MIN_RANDOM: u64 = 0x1_0000;
    /// Random ids stay within the range of an IEEE double.
    pub const MAX_RANDOM: u64 = (1 << 53) - 1;

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// A fresh random device session id.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(Self::MIN_RANDOM..=Self::MAX_RANDOM))
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Whether this id is one of the reserved sentinels.
    pub fn is_reserved(&self) -> bool {
        self.0 < Self::MIN_RANDOM
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SYSTEM => f.write_str("SessionId(system)"),
            Self::SERVER => f.write_str("SessionId(server)"),
            Self::GLOBAL => f.write_str("SessionId(global)"),
            _ => write!(f, "SessionId({})", self.0),
        }
    }
}

/// Identity of one patch: the session that authored it and its first logical tick.
///
/// Ordered by time first, then session, which is the total order used for
/// last-writer-wins resolution.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PatchId {
    pub sid: SessionId,
    pub time: u64,
}

impl PatchId {
    pub const fn new(sid: SessionId, time: u64) -> Self {
        Self { sid, time }
    }

    /// The id `offset` ticks later in the same session.
    pub fn tick(&self, offset: u64) -> Self {
        Self { sid: self.sid, time: self.time + offset }
    }
}

impl Ord for PatchId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time.cmp(&other.time).then(self.sid.cmp(&other.sid))
    }
}

impl PartialOrd for PatchId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sid.0, self.time)
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sid.0, self.time)
    }
}
