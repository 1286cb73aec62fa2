//! Changeset interface between the store and its diff collaborator.
//!
//! The engine that compares filesystem trees lives outside this crate; the
//! store only needs the changeset of an image's top layer relative to its
//! parent chain so it can reify deletions as whiteout entries at mount
//! time. Runtimes inject their implementation via
//! [`Store::set_diff_engine`](crate::store::Store::set_diff_engine).

use std::path::{Path, PathBuf};

use crate::error::Result;

/// The kind of change a changeset entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The path was added.
    Add,
    /// The path was modified.
    Modify,
    /// The path was deleted.
    Delete,
}

/// A single entry in a changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// What happened to the path.
    pub kind: ChangeKind,
    /// The affected path, relative to the layer root.
    pub path: PathBuf,
}

/// Computes the changeset of a layer relative to its parent chain.
pub trait DiffEngine: std::fmt::Debug + Send + Sync {
    /// Return the changes the layer at `layer` introduces.
    fn changes(&self, layer: &Path) -> Result<Vec<Change>>;
}

/// A diff engine that reports no changes.
///
/// This is the default engine of a freshly opened store; mounts performed
/// with it materialize no whiteouts.
#[derive(Debug, Default)]
pub struct NoChanges;

impl DiffEngine for NoChanges {
    fn changes(&self, _layer: &Path) -> Result<Vec<Change>> {
        Ok(Vec::new())
    }
}
