//! # Search criteria
//!
//! Module dedicated to search criteria: the target folders, the
//! restriction and the flags defining a search folder. The
//! serialized form of the criteria is what gets persisted alongside
//! the folder, see [`SearchCriteria::encode`] and
//! [`SearchCriteria::decode`].

use std::{collections::BTreeSet, fmt, ops::BitOr, result};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{restriction::Restriction, FolderId};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot build search criteria: target folder list is empty")]
    EmptyFoldersError,
    #[error("cannot decode search criteria: target folder list is missing")]
    MissingFoldersError,
    #[error("cannot decode search criteria: restriction is missing")]
    MissingRestrictionError,
    #[error("cannot build search criteria: nested sub-restrictions are not supported")]
    NestedSubRestrictionError,
    #[error("cannot decode search criteria")]
    DecodeError(#[source] serde_json::Error),
    #[error("cannot encode search criteria")]
    EncodeError(#[source] serde_json::Error),
}

/// The search criteria flags.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchFlags(u32);

impl SearchFlags {
    pub const NONE: Self = Self(0);
    pub const STOP_SEARCH: Self = Self(0x0001);
    pub const RESTART_SEARCH: Self = Self(0x0002);
    /// The target scope includes all descendants of the target
    /// folders.
    pub const RECURSIVE_SEARCH: Self = Self(0x0004);
    pub const SHALLOW_SEARCH: Self = Self(0x0008);
    pub const FOREGROUND_SEARCH: Self = Self(0x0010);
    pub const BACKGROUND_SEARCH: Self = Self(0x0020);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_recursive(&self) -> bool {
        self.contains(Self::RECURSIVE_SEARCH)
    }
}

impl BitOr for SearchFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// The search criteria of a search folder.
///
/// Criteria are immutable once built: redefining a search folder
/// means replacing its criteria as a whole.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchCriteria {
    folders: Vec<FolderId>,
    restriction: Restriction,
    flags: SearchFlags,
}

impl SearchCriteria {
    /// Build new search criteria.
    ///
    /// Duplicate target folders are removed, their order is kept. A
    /// sub-restriction cannot contain another sub-restriction.
    pub fn new(
        folders: impl IntoIterator<Item = FolderId>,
        restriction: Restriction,
        flags: SearchFlags,
    ) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let folders: Vec<_> = folders
            .into_iter()
            .filter(|folder| seen.insert(*folder))
            .collect();

        if folders.is_empty() {
            return Err(Error::EmptyFoldersError);
        }

        if restriction.has_nested_sub_restrictions() {
            return Err(Error::NestedSubRestrictionError);
        }

        Ok(Self {
            folders,
            restriction,
            flags,
        })
    }

    pub fn folders(&self) -> &[FolderId] {
        &self.folders
    }

    pub fn restriction(&self) -> &Restriction {
        &self.restriction
    }

    pub fn flags(&self) -> SearchFlags {
        self.flags
    }

    pub fn is_recursive(&self) -> bool {
        self.flags.is_recursive()
    }

    /// Serialize the criteria into their persisted form.
    pub fn encode(&self) -> Result<String> {
        let persisted = PersistedCriteria {
            folders: Some(self.folders.clone()),
            restriction: Some(self.restriction.clone()),
            flags: self.flags,
        };

        serde_json::to_string(&persisted).map_err(Error::EncodeError)
    }

    /// Deserialize criteria from their persisted form.
    ///
    /// Criteria without target folders or without restriction are
    /// rejected.
    pub fn decode(data: &str) -> Result<Self> {
        let persisted: PersistedCriteria =
            serde_json::from_str(data).map_err(Error::DecodeError)?;
        let folders = persisted.folders.ok_or(Error::MissingFoldersError)?;
        let restriction = persisted
            .restriction
            .ok_or(Error::MissingRestrictionError)?;
        Self::new(folders, restriction, persisted.flags)
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "folders {:?}", self.folders)?;
        if self.is_recursive() {
            write!(f, " (recursive)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PersistedCriteria {
    #[serde(default)]
    folders: Option<Vec<FolderId>>,
    #[serde(default)]
    restriction: Option<Restriction>,
    #[serde(default)]
    flags: SearchFlags,
}
