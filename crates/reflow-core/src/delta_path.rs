#![forbid(unsafe_code)]

//! Positions of elements and blocks inside the rendered tree.
//!
//! A [`DeltaPath`] starts with the index of a [`RootContainer`] and continues
//! with one index per nested block. `[0, 2, 1]` is the second child of the
//! third block in the main container.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level containers a path can be rooted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RootContainer {
    Main,
    Sidebar,
    Event,
    Bottom,
}

impl RootContainer {
    /// Index used as the first component of a path.
    #[must_use]
    pub const fn index(self) -> u32 {
        match self {
            Self::Main => 0,
            Self::Sidebar => 1,
            Self::Event => 2,
            Self::Bottom => 3,
        }
    }
}

/// Location of a UI element or block.
///
/// An empty path addresses nothing; messages carrying one are never
/// coalesced by the outgoing queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaPath(Vec<u32>);

impl DeltaPath {
    /// Build a path from raw indices.
    #[must_use]
    pub fn new(indices: impl Into<Vec<u32>>) -> Self {
        Self(indices.into())
    }

    /// Path of a root container itself.
    #[must_use]
    pub fn root(container: RootContainer) -> Self {
        Self(vec![container.index()])
    }

    /// Path of the `index`-th child of this path.
    #[must_use]
    pub fn child(&self, index: u32) -> Self {
        let mut indices = Vec::with_capacity(self.0.len() + 1);
        indices.extend_from_slice(&self.0);
        indices.push(index);
        Self(indices)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u32>> for DeltaPath {
    fn from(indices: Vec<u32>) -> Self {
        Self(indices)
    }
}

impl From<&[u32]> for DeltaPath {
    fn from(indices: &[u32]) -> Self {
        Self(indices.to_vec())
    }
}

impl fmt::Display for DeltaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{index}")?;
        }
        f.write_str("]")
    }
}
