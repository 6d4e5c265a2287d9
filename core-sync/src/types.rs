//! # Sync Domain Types
//!
//! Identifiers and enums shared by every sync component: libraries, object
//! types, versions, the sync type escalation order and library scopes.

use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Remote group identifier.
pub type GroupId = u64;

/// Per (library, object type) version counter.
pub type Version = u64;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncPassId(Uuid);

impl SyncPassId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SyncPassId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncPassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A library is either the user's personal library or a shared group.
///
/// `User` sorts before every group so ordered sets list it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryId {
    User,
    Group(GroupId),
}

impl LibraryId {
    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            LibraryId::User => None,
            LibraryId::Group(id) => Some(*id),
        }
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryId::User => write!(f, "user"),
            LibraryId::Group(id) => write!(f, "group:{}", id),
        }
    }
}

impl FromStr for LibraryId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "user" {
            return Ok(LibraryId::User);
        }

        s.strip_prefix("group:")
            .and_then(|id| id.parse::<GroupId>().ok())
            .map(LibraryId::Group)
            .ok_or_else(|| SyncError::InvalidLibrary(s.to_string()))
    }
}

// ============================================================================
// Object Types
// ============================================================================

/// Kinds of remote objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Group,
    Collection,
    Item,
    Trash,
    Search,
    Tag,
}

impl ObjectType {
    /// Download order inside one library. Items reference collections and
    /// searches, so those come first.
    pub const DOWNLOAD_ORDER: [ObjectType; 4] = [
        ObjectType::Collection,
        ObjectType::Search,
        ObjectType::Item,
        ObjectType::Trash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Group => "group",
            ObjectType::Collection => "collection",
            ObjectType::Item => "item",
            ObjectType::Trash => "trash",
            ObjectType::Search => "search",
            ObjectType::Tag => "tag",
        }
    }

    /// Whether downloads are checked against unsynced local changes.
    pub fn reports_write_conflicts(&self) -> bool {
        matches!(self, ObjectType::Item | ObjectType::Trash)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "group" => Ok(ObjectType::Group),
            "collection" => Ok(ObjectType::Collection),
            "item" => Ok(ObjectType::Item),
            "trash" => Ok(ObjectType::Trash),
            "search" => Ok(ObjectType::Search),
            "tag" => Ok(ObjectType::Tag),
            _ => Err(SyncError::InvalidObjectType(s.to_string())),
        }
    }
}

// ============================================================================
// Sync Type
// ============================================================================

/// How thorough a pass is.
///
/// Totally ordered: `CollectionsOnly < Normal < IgnoreIndividualDelays < Full`.
/// Merging two requests keeps the larger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Only collections are synced
    CollectionsOnly,
    /// Objects whose previous sync failed are retried after their backoff
    Normal,
    /// Previously failed objects are retried immediately
    IgnoreIndividualDelays,
    /// Local versions are ignored and every object is compared
    Full,
}

impl SyncType {
    fn rank(&self) -> u8 {
        match self {
            SyncType::CollectionsOnly => 0,
            SyncType::Normal => 1,
            SyncType::IgnoreIndividualDelays => 2,
            SyncType::Full => 3,
        }
    }

    /// The stronger of two sync types.
    pub fn escalate(self, other: SyncType) -> SyncType {
        if other > self {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::CollectionsOnly => "collections_only",
            SyncType::Normal => "normal",
            SyncType::IgnoreIndividualDelays => "ignore_individual_delays",
            SyncType::Full => "full",
        }
    }
}

impl PartialOrd for SyncType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SyncType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "collections_only" => Ok(SyncType::CollectionsOnly),
            "normal" => Ok(SyncType::Normal),
            "ignore_individual_delays" => Ok(SyncType::IgnoreIndividualDelays),
            "full" => Ok(SyncType::Full),
            _ => Err(SyncError::InvalidSyncType(s.to_string())),
        }
    }
}

// ============================================================================
// Library Scope
// ============================================================================

/// Which libraries a pass covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LibraryScope {
    All,
    Specific(BTreeSet<LibraryId>),
}

impl LibraryScope {
    pub fn specific(libraries: impl IntoIterator<Item = LibraryId>) -> Self {
        LibraryScope::Specific(libraries.into_iter().collect())
    }

    pub fn contains(&self, library: &LibraryId) -> bool {
        match self {
            LibraryScope::All => true,
            LibraryScope::Specific(set) => set.contains(library),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, LibraryScope::All)
    }

    /// Union of two scopes. `All` absorbs everything and is never narrowed.
    pub fn merge(self, other: LibraryScope) -> LibraryScope {
        match (self, other) {
            (LibraryScope::Specific(mut left), LibraryScope::Specific(right)) => {
                left.extend(right);
                LibraryScope::Specific(left)
            }
            _ => LibraryScope::All,
        }
    }
}

// ============================================================================
// Versions
// ============================================================================

/// Last synced version of each object type in one library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    pub collections: Version,
    pub items: Version,
    pub trash: Version,
    pub searches: Version,
    pub deletions: Version,
    pub settings: Version,
}

impl Versions {
    /// Highest version seen in the library; write requests are made against it.
    pub fn max(&self) -> Version {
        [
            self.collections,
            self.items,
            self.trash,
            self.searches,
            self.deletions,
            self.settings,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }

    pub fn get(&self, object_type: ObjectType) -> Version {
        match object_type {
            ObjectType::Collection => self.collections,
            ObjectType::Item => self.items,
            ObjectType::Trash => self.trash,
            ObjectType::Search => self.searches,
            ObjectType::Group | ObjectType::Tag => self.max(),
        }
    }
}
