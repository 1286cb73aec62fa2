//! Error types for the ustorage library.
//!
//! This module defines the error types used throughout the library. All
//! operations that can fail return a [`Result<T>`] which is an alias for
//! `Result<T, StorageError>`.
//!
//! # Error Categories
//!
//! Errors are organized into several categories:
//!
//! - **Entity errors**: [`ImageNotFound`], [`TagNotFound`], [`AlreadyExists`]
//! - **Integrity errors**: [`LayerMissing`], [`ParentMissing`], [`LineageCycle`],
//!   [`TagDangling`]
//! - **Mount errors**: [`Mount`], [`Unmount`], [`MountVerify`], [`NotMounted`],
//!   [`StillMounted`], [`Busy`], [`ImageInUse`], [`RemovalTimeout`]
//! - **Input errors**: [`InvalidReference`], [`Regex`]
//! - **System errors**: [`Io`], [`Database`]
//!
//! [`ImageNotFound`]: StorageError::ImageNotFound
//! [`TagNotFound`]: StorageError::TagNotFound
//! [`AlreadyExists`]: StorageError::AlreadyExists
//! [`LayerMissing`]: StorageError::LayerMissing
//! [`ParentMissing`]: StorageError::ParentMissing
//! [`LineageCycle`]: StorageError::LineageCycle
//! [`TagDangling`]: StorageError::TagDangling
//! [`Mount`]: StorageError::Mount
//! [`Unmount`]: StorageError::Unmount
//! [`MountVerify`]: StorageError::MountVerify
//! [`NotMounted`]: StorageError::NotMounted
//! [`StillMounted`]: StorageError::StillMounted
//! [`Busy`]: StorageError::Busy
//! [`ImageInUse`]: StorageError::ImageInUse
//! [`RemovalTimeout`]: StorageError::RemovalTimeout
//! [`InvalidReference`]: StorageError::InvalidReference
//! [`Regex`]: StorageError::Regex
//! [`Io`]: StorageError::Io
//! [`Database`]: StorageError::Database

use std::path::PathBuf;

/// Result type alias for operations that may return a StorageError.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error types for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested image was not found in the catalog.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The requested tag was not found.
    #[error("tag not found: {0}")]
    TagNotFound(String),

    /// A tag exists but the image it points at does not.
    #[error("tag {tag} points at missing image {image}")]
    TagDangling {
        /// The tag that was looked up.
        tag: String,
        /// The image id the tag refers to.
        image: String,
    },

    /// Primary-key violation on insert.
    #[error("{entity} already exists: {key}")]
    AlreadyExists {
        /// The kind of entity being inserted (image, path, tag, ...).
        entity: &'static str,
        /// The key that collided.
        key: String,
    },

    /// An image in the catalog has no layer directory on disk.
    #[error("no layer found for image {image}")]
    LayerMissing {
        /// The image whose layer directory is missing.
        image: String,
    },

    /// An image references a parent that is not in the catalog.
    #[error("image {image} references missing parent {parent}")]
    ParentMissing {
        /// The image whose parent was looked up.
        image: String,
        /// The missing parent id.
        parent: String,
    },

    /// A parent walk visited more images than the catalog contains.
    #[error("parent chain for image {0} exceeds the catalog image count")]
    LineageCycle(String),

    /// The image cannot be removed while mountpoints reference it.
    #[error("image {0} has registered mountpoints")]
    ImageInUse(String),

    /// The union mount syscall failed.
    #[error("mount of {} failed", .target.display())]
    Mount {
        /// The mount target directory.
        target: PathBuf,
        /// The underlying errno.
        #[source]
        source: rustix::io::Errno,
    },

    /// The unmount syscall failed.
    #[error("unmount of {} failed", .target.display())]
    Unmount {
        /// The mount target directory.
        target: PathBuf,
        /// The underlying errno.
        #[source]
        source: rustix::io::Errno,
    },

    /// The mount syscall returned success but the target is not live.
    #[error("{} is not mounted after mount", .0.display())]
    MountVerify(PathBuf),

    /// The operation requires a live mount but the target is not mounted.
    #[error("{} does not seem to be mounted", .0.display())]
    NotMounted(PathBuf),

    /// The filesystem is still mounted after a successful unmount syscall.
    #[error("{} is still mounted after unmount", .0.display())]
    StillMounted(PathBuf),

    /// Deregistration was attempted on a live mount.
    #[error("{} is currently mounted", .0.display())]
    Busy(PathBuf),

    /// The post-unmount directory removal retry budget was exhausted.
    #[error("timed out removing mount root {}", .0.display())]
    RemovalTimeout(PathBuf),

    /// A user-supplied image reference could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// Regular expression compilation failed.
    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error occurred during SQLite operations.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StorageError {
    /// Map a constraint violation to [`AlreadyExists`](Self::AlreadyExists),
    /// passing every other database error through unchanged.
    pub(crate) fn exists_or_db(entity: &'static str, key: &str, err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StorageError::AlreadyExists {
                    entity,
                    key: key.to_string(),
                }
            }
            other => StorageError::Database(other),
        }
    }
}
