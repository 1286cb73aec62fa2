//! Image and layer storage for a container runtime.
//!
//! This library is a persistent catalog of immutable root-filesystem
//! snapshots ("images") organized as parent-linked chains of stacked
//! filesystem layers, together with the machinery that realizes those
//! chains as live, writable mount points via a union filesystem.
//!
//! # Overview
//!
//! The [`Store`] struct is the primary entry point. It owns a SQLite
//! catalog cross-referencing images, lineage, path names, tags and active
//! mount points, and a [`LayerStore`] directory holding the extracted
//! contents of each image's archive.
//!
//! # Storage Structure
//!
//! Store state on disk follows this layout:
//! ```text
//! <root>/
//! +-- db                  # SQLite metadata catalog
//! +-- layers/             # Layer data
//!     +-- <image-id>/     # Extracted archive contents
//! ```
//!
//! Mount point locations are supplied by the caller and live outside the
//! store root.
//!
//! # Example
//!
//! ```no_run
//! use ustorage::Store;
//!
//! let mut store = Store::new("/var/lib/ustorage")?;
//!
//! // Register an image from an uncompressed tar stream
//! let archive = std::fs::File::open("rootfs.tar")?;
//! let image = store.create(archive, None, "base/alpine", "initial import")?;
//!
//! // Realize it as a live union mount
//! let mountpoint = store.mount(&image, "/mnt/c1/rootfs", "/mnt/c1/rw")?;
//! store.unmount(&mountpoint)?;
//! store.deregister(&mountpoint)?;
//! # Ok::<(), ustorage::StorageError>(())
//! ```
//!
//! # Mounting
//!
//! A mount stacks the image's layer chain (child first, root ancestor
//! last) as read-only branches beneath a single read-write overlay, then
//! reifies the image's deletions as `.wh.` whiteout entries in the
//! overlay. The changeset comes from an external [`DiffEngine`]
//! collaborator; the store itself does not compare trees.

pub mod config;
pub mod diff;
pub mod error;
pub mod image;
pub mod layer;
pub mod mount;
pub mod store;
mod util;


pub use config::StorageConfig;
pub use diff::{Change, ChangeKind, DiffEngine, NoChanges};
pub use error::{Result, StorageError};
pub use image::Image;
pub use layer::LayerStore;
pub use mount::{is_mounted, Mountpoint};
pub use store::Store;
pub use util::random_id;
