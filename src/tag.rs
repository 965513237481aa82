use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Separator between a keyed tag's kind prefix and its entity id.
pub const KEY_SEPARATOR: char = '-';

/// Categories of state that every session receives on first contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GlobalKind {
    Cars,
    Jobs,
    Junctions,
    Player,
}

impl GlobalKind {
    /// Every global kind, in wire-name order. New sessions are seeded with these.
    pub const ALL: [GlobalKind; 4] = [
        GlobalKind::Cars,
        GlobalKind::Jobs,
        GlobalKind::Junctions,
        GlobalKind::Player,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GlobalKind::Cars => "cars",
            GlobalKind::Jobs => "jobs",
            GlobalKind::Junctions => "junctions",
            GlobalKind::Player => "player",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

/// Entity kinds that scope a change to a single id (`<prefix>-<id>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyedKind {
    CarGuid,
    Trainset,
}

impl KeyedKind {
    pub const ALL: [KeyedKind; 2] = [KeyedKind::CarGuid, KeyedKind::Trainset];

    pub fn prefix(self) -> &'static str {
        match self {
            KeyedKind::CarGuid => "carguid",
            KeyedKind::Trainset => "trainset",
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == s)
    }
}

/// A category of simulation state that changed.
///
/// The wire form (`"cars"`, `"carguid-ABC123"`) is only produced and parsed at
/// the edges; inside the crate tags travel as this enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    Global(GlobalKind),
    Keyed(KeyedKind, Arc<str>),
}

impl Tag {
    pub fn keyed(kind: KeyedKind, id: impl fmt::Display) -> Self {
        Tag::Keyed(kind, Arc::from(id.to_string()))
    }

    pub fn car(guid: &str) -> Self {
        Tag::Keyed(KeyedKind::CarGuid, Arc::from(guid))
    }

    pub fn trainset(id: u32) -> Self {
        Tag::keyed(KeyedKind::Trainset, id)
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Tag::Global(_))
    }

    /// The set every new session is seeded with.
    pub fn all_globals() -> impl Iterator<Item = Tag> {
        GlobalKind::ALL.into_iter().map(Tag::Global)
    }
}

impl From<GlobalKind> for Tag {
    fn from(kind: GlobalKind) -> Self {
        Tag::Global(kind)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Global(kind) => f.write_str(kind.as_str()),
            Tag::Keyed(kind, id) => write!(f, "{}{}{}", kind.prefix(), KEY_SEPARATOR, id),
        }
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagParseError {
    #[error("tag must not be empty")]
    Empty,
    #[error("unknown global tag: {0}")]
    UnknownGlobal(String),
    #[error("unknown keyed tag prefix: {0}")]
    UnknownPrefix(String),
    #[error("keyed tag has an empty id: {0}")]
    EmptyId(String),
}

impl FromStr for Tag {
    type Err = TagParseError;

    /// Parse the wire form. Keyed tags split on the first separator only, so
    /// ids may themselves contain `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TagParseError::Empty);
        }
        match s.split_once(KEY_SEPARATOR) {
            None => GlobalKind::from_wire(s)
                .map(Tag::Global)
                .ok_or_else(|| TagParseError::UnknownGlobal(s.to_string())),
            Some((prefix, id)) => {
                let kind = KeyedKind::from_prefix(prefix)
                    .ok_or_else(|| TagParseError::UnknownPrefix(prefix.to_string()))?;
                if id.is_empty() {
                    return Err(TagParseError::EmptyId(s.to_string()));
                }
                Ok(Tag::Keyed(kind, Arc::from(id)))
            }
        }
    }
}
