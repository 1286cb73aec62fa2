//! The image store: SQLite catalog plus layer and mount orchestration.
//!
//! This module provides the main [`Store`] struct. It owns the catalog
//! database, the [`LayerStore`] holding extracted layer contents, and the
//! configuration for the union-mount backend.
//!
//! # Storage Structure
//!
//! Store state on disk follows this layout:
//! ```text
//! <root>/
//! +-- db                  # SQLite metadata catalog
//! +-- layers/             # Layer data
//!     +-- <image-id>/     # Extracted contents, one directory per image
//! ```
//!
//! Mount points are not kept under the store root; their locations are
//! supplied by the caller and recorded in the catalog.
//!
//! # Catalog
//!
//! Four relations with primary-key and referential invariants:
//!
//! - `images(id, parent, comment, created)`, keyed by id; a non-empty
//!   parent always references a registered image.
//! - `paths(path, image)`, keyed by the pair; one path may name many
//!   images (a history), listed newest-first.
//! - `tags(tag, image)`, keyed by tag; one image per tag.
//! - `mountpoints(root, rw, image)`, keyed by root.
//!
//! Registration is atomic: the layer directory, image row and initial path
//! row all persist or none do. Multi-row writes go through a scoped
//! transaction that rolls back on every early-return path.

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::StorageConfig;
use crate::diff::{DiffEngine, NoChanges};
use crate::error::{Result, StorageError};
use crate::image::Image;
use crate::layer::LayerStore;
use crate::mount::{self, Mountpoint};
use crate::util::{clean_path, random_id, unix_now};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS images (
    id      TEXT PRIMARY KEY,
    parent  TEXT NOT NULL DEFAULT '',
    comment TEXT NOT NULL DEFAULT '',
    created INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS paths (
    path  TEXT NOT NULL,
    image TEXT NOT NULL,
    PRIMARY KEY (path, image)
);
CREATE TABLE IF NOT EXISTS mountpoints (
    root  TEXT PRIMARY KEY,
    rw    TEXT NOT NULL,
    image TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tags (
    tag   TEXT PRIMARY KEY,
    image TEXT NOT NULL
);
";

fn image_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        parent: row.get(1)?,
        comment: row.get(2)?,
        created: row.get(3)?,
    })
}

fn mountpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mountpoint> {
    Ok(Mountpoint {
        image: row.get(0)?,
        root: PathBuf::from(row.get::<_, String>(1)?),
        rw: PathBuf::from(row.get::<_, String>(2)?),
    })
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn clean(path: impl AsRef<Path>) -> PathBuf {
    PathBuf::from(clean_path(&path.as_ref().to_string_lossy()))
}

/// A persistent catalog of images and their layers, with union-mount
/// lifecycle management.
#[derive(Debug)]
pub struct Store {
    /// Store root directory on the host filesystem.
    root: PathBuf,

    /// Catalog database; a single-writer resource owned by this instance.
    db: Connection,

    /// Extracted layer contents, one directory per image id.
    layers: LayerStore,

    /// Union-mount backend settings.
    config: StorageConfig,

    /// External changeset engine consulted at mount time.
    diff: Box<dyn DiffEngine>,
}

impl Store {
    /// Open (or initialize) a store rooted at `root` with default backend
    /// settings.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(root, StorageConfig::default())
    }

    /// Open (or initialize) a store rooted at `root`.
    ///
    /// Creates the root directory, the catalog database and the layer
    /// directory as needed; an existing store is opened as-is.
    pub fn with_config(root: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        match fs::create_dir(&root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let db = Connection::open(root.join("db"))?;
        db.execute_batch(SCHEMA)?;

        let layers = LayerStore::new(root.join("layers"))?;

        tracing::debug!(root = %root.display(), "store opened");
        Ok(Self {
            root,
            db,
            layers,
            config,
            diff: Box::new(NoChanges),
        })
    }

    /// The store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace the changeset engine consulted at mount time.
    pub fn set_diff_engine(&mut self, engine: Box<dyn DiffEngine>) {
        self.diff = engine;
    }

    // ========== Images ==========

    /// Extract `archive` as a new image and bind it at `path`.
    ///
    /// A fresh random id is allocated; `parent`, when given, links the new
    /// image into the lineage of an existing one.
    pub fn create(
        &mut self,
        archive: impl Read,
        parent: Option<&Image>,
        path: &str,
        comment: &str,
    ) -> Result<Image> {
        let image = Image {
            id: random_id(),
            parent: parent.map(|p| p.id.clone()).unwrap_or_default(),
            comment: comment.to_string(),
            created: unix_now(),
        };
        self.register(archive, &image, path)?;
        Ok(image)
    }

    /// Register a caller-constructed image record with its layer archive.
    ///
    /// This is a single atomic unit: the layer directory is written, then
    /// the image row and the initial (path, image) row are inserted in one
    /// transaction. If any step fails, none of the three persist.
    pub fn register(&mut self, archive: impl Read, image: &Image, path: &str) -> Result<()> {
        let path = clean_path(path);
        let layer_dir = self.layers.add_layer(&image.id, archive)?;

        if let Err(err) = self.insert_registration(image, &path) {
            let _ = fs::remove_dir_all(&layer_dir);
            return Err(err);
        }

        tracing::debug!(id = %image.id, path = %path, "image registered");
        Ok(())
    }

    fn insert_registration(&mut self, image: &Image, path: &str) -> Result<()> {
        let tx = self.db.transaction()?;

        if !image.parent.is_empty() {
            let parent: Option<String> = tx
                .query_row(
                    "SELECT id FROM images WHERE id = ?1",
                    params![image.parent],
                    |row| row.get(0),
                )
                .optional()?;
            if parent.is_none() {
                return Err(StorageError::ParentMissing {
                    image: image.id.clone(),
                    parent: image.parent.clone(),
                });
            }
        }

        tx.execute(
            "INSERT INTO images (id, parent, comment, created) VALUES (?1, ?2, ?3, ?4)",
            params![image.id, image.parent, image.comment, image.created],
        )
        .map_err(|e| StorageError::exists_or_db("image", &image.id, e))?;
        tx.execute(
            "INSERT INTO paths (path, image) VALUES (?1, ?2)",
            params![path, image.id],
        )
        .map_err(|e| StorageError::exists_or_db("path", path, e))?;

        tx.commit()?;
        Ok(())
    }

    /// Look up an image by id.
    pub fn get(&self, id: &str) -> Result<Option<Image>> {
        Ok(self
            .db
            .query_row(
                "SELECT id, parent, comment, created FROM images WHERE id = ?1",
                params![id],
                image_from_row,
            )
            .optional()?)
    }

    /// All images in the catalog.
    pub fn images(&self) -> Result<Vec<Image>> {
        let mut stmt = self
            .db
            .prepare("SELECT id, parent, comment, created FROM images")?;
        let rows = stmt.query_map([], image_from_row)?;
        let mut images = Vec::new();
        for row in rows {
            images.push(row?);
        }
        Ok(images)
    }

    /// The distinct path names in the catalog, lexicographically ordered.
    pub fn paths(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT DISTINCT path FROM paths ORDER BY path")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }
        Ok(paths)
    }

    /// The images bound at `path`, newest first.
    pub fn list(&self, path: &str) -> Result<Vec<Image>> {
        let path = clean_path(path);
        let mut stmt = self.db.prepare(
            "SELECT images.id, images.parent, images.comment, images.created \
             FROM images, paths \
             WHERE paths.path = ?1 AND paths.image = images.id \
             ORDER BY images.created DESC",
        )?;
        let rows = stmt.query_map(params![path], image_from_row)?;
        let mut images = Vec::new();
        for row in rows {
            images.push(row?);
        }
        Ok(images)
    }

    /// Resolve a user-visible image reference.
    ///
    /// The reference is tried in order as (a) an exact image id, (b) a path
    /// name, yielding the most recent image bound there, and (c) a
    /// `path:id` pair split at the last colon, yielding that exact binding.
    /// Path names containing colons resolve at step (b), before the split
    /// is ever attempted.
    pub fn find(&self, spec: &str) -> Result<Option<Image>> {
        if spec.is_empty() {
            return Err(StorageError::InvalidReference(spec.to_string()));
        }
        if let Some(image) = self.get(spec)? {
            return Ok(Some(image));
        }

        let cleaned = clean_path(spec);
        if let Some(image) = self.list(&cleaned)?.into_iter().next() {
            return Ok(Some(image));
        }

        let Some((path, id)) = cleaned.rsplit_once(':') else {
            return Ok(None);
        };
        if path.is_empty() || id.is_empty() {
            return Err(StorageError::InvalidReference(spec.to_string()));
        }
        Ok(self
            .db
            .query_row(
                "SELECT images.id, images.parent, images.comment, images.created \
                 FROM images, paths \
                 WHERE paths.path = ?1 AND images.id = ?2 AND paths.image = images.id",
                params![clean_path(path), id],
                image_from_row,
            )
            .optional()?)
    }

    /// Remove an image from the catalog.
    ///
    /// The image row and its path and tag rows are deleted in one
    /// transaction. Removal is refused while any mountpoint references the
    /// image. The layer directory is left on disk for an external
    /// collector.
    pub fn remove(&mut self, image: &Image) -> Result<()> {
        let mounts: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM mountpoints WHERE image = ?1",
            params![image.id],
            |row| row.get(0),
        )?;
        if mounts > 0 {
            return Err(StorageError::ImageInUse(image.id.clone()));
        }

        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM paths WHERE image = ?1", params![image.id])?;
        tx.execute("DELETE FROM tags WHERE image = ?1", params![image.id])?;
        let deleted = tx.execute("DELETE FROM images WHERE id = ?1", params![image.id])?;
        if deleted == 0 {
            return Err(StorageError::ImageNotFound(image.id.clone()));
        }
        tx.commit()?;

        tracing::debug!(id = %image.id, "image removed");
        Ok(())
    }

    /// Remove every image bound at `path`.
    pub fn remove_in_path(&mut self, path: &str) -> Result<()> {
        for image in self.list(path)? {
            self.remove(&image)?;
        }
        Ok(())
    }

    /// Remove the images of every path matching `pattern`.
    ///
    /// The pattern is matched against each distinct path as a whole-string
    /// regular expression. A failure on one path does not abort the sweep;
    /// it is logged and the first such error is returned once the sweep
    /// completes.
    pub fn remove_regexp(&mut self, pattern: &str) -> Result<()> {
        let re = Regex::new(&format!("^(?:{pattern})$"))?;
        let mut first_err = None;
        for path in self.paths()? {
            if !re.is_match(&path) {
                continue;
            }
            if let Err(err) = self.remove_in_path(&path) {
                tracing::warn!(path = %path, error = %err, "failed to remove images at path");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Bind an existing image at an additional path.
    ///
    /// Only a catalog row is written; the layer is not duplicated. Fails if
    /// the (path, image) pair already exists.
    pub fn copy(&self, image: &Image, new_path: &str) -> Result<()> {
        let new_path = clean_path(new_path);
        self.db
            .execute(
                "INSERT INTO paths (path, image) VALUES (?1, ?2)",
                params![new_path, image.id],
            )
            .map_err(|e| StorageError::exists_or_db("path", &new_path, e))?;
        Ok(())
    }

    // ========== Tags ==========

    /// Point a fresh tag name at an existing image.
    pub fn add_tag(&self, image_id: &str, tag: &str) -> Result<()> {
        if self.get(image_id)?.is_none() {
            return Err(StorageError::ImageNotFound(image_id.to_string()));
        }
        self.db
            .execute(
                "INSERT INTO tags (tag, image) VALUES (?1, ?2)",
                params![tag, image_id],
            )
            .map_err(|e| StorageError::exists_or_db("tag", tag, e))?;
        tracing::debug!(image = image_id, tag, "tag added");
        Ok(())
    }

    /// Resolve a tag to its image.
    ///
    /// # Errors
    ///
    /// [`TagNotFound`](StorageError::TagNotFound) when the tag does not
    /// exist, [`TagDangling`](StorageError::TagDangling) when it points at
    /// a missing image.
    pub fn get_by_tag(&self, tag: &str) -> Result<Image> {
        let image_id: Option<String> = self
            .db
            .query_row(
                "SELECT image FROM tags WHERE tag = ?1",
                params![tag],
                |row| row.get(0),
            )
            .optional()?;
        let image_id = image_id.ok_or_else(|| StorageError::TagNotFound(tag.to_string()))?;
        match self.get(&image_id)? {
            Some(image) => Ok(image),
            None => Err(StorageError::TagDangling {
                tag: tag.to_string(),
                image: image_id,
            }),
        }
    }

    // ========== Layers ==========

    /// The ids of the layers on disk.
    pub fn layers(&self) -> Result<Vec<String>> {
        self.layers.list()
    }

    /// The ordered layer stack for an image, top of stack first.
    ///
    /// Walks from the image through its ancestors, resolving each id to
    /// its layer directory; the union mount presents layers in this order
    /// so the child shadows the parent. A missing layer directory or
    /// parent row is catalog corruption and fails the walk, as does a
    /// chain longer than the total image count.
    pub fn layer_stack(&self, image_id: &str) -> Result<Vec<PathBuf>> {
        let total: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;

        let mut image = self
            .get(image_id)?
            .ok_or_else(|| StorageError::ImageNotFound(image_id.to_string()))?;
        let mut stack = Vec::new();
        loop {
            let layer = self.layers.get(&image.id).ok_or_else(|| {
                StorageError::LayerMissing {
                    image: image.id.clone(),
                }
            })?;
            stack.push(layer);
            if stack.len() as i64 > total {
                return Err(StorageError::LineageCycle(image_id.to_string()));
            }
            if image.is_base() {
                break;
            }
            image = self.get(&image.parent)?.ok_or_else(|| {
                StorageError::ParentMissing {
                    image: image.id.clone(),
                    parent: image.parent.clone(),
                }
            })?;
        }
        Ok(stack)
    }

    // ========== Mountpoints ==========

    /// Register a mountpoint for `image` in the catalog.
    ///
    /// No filesystem activity happens here; the root's uniqueness is the
    /// arbitration mechanism for the host mount table, so a second
    /// registration with the same root fails.
    pub fn add_mountpoint(
        &self,
        image: &Image,
        root: impl AsRef<Path>,
        rw: impl AsRef<Path>,
    ) -> Result<Mountpoint> {
        let mountpoint = Mountpoint {
            image: image.id.clone(),
            root: clean(root),
            rw: clean(rw),
        };
        self.db
            .execute(
                "INSERT INTO mountpoints (root, rw, image) VALUES (?1, ?2, ?3)",
                params![
                    path_str(&mountpoint.root),
                    path_str(&mountpoint.rw),
                    mountpoint.image
                ],
            )
            .map_err(|e| StorageError::exists_or_db("mountpoint", &path_str(&mountpoint.root), e))?;
        Ok(mountpoint)
    }

    /// Look up the mountpoint registered with this exact (root, rw) pair.
    pub fn fetch_mountpoint(
        &self,
        root: impl AsRef<Path>,
        rw: impl AsRef<Path>,
    ) -> Result<Option<Mountpoint>> {
        Ok(self
            .db
            .query_row(
                "SELECT image, root, rw FROM mountpoints WHERE root = ?1 AND rw = ?2",
                params![path_str(&clean(root)), path_str(&clean(rw))],
                mountpoint_from_row,
            )
            .optional()?)
    }

    /// The mountpoints registered for an image.
    pub fn mountpoints(&self, image_id: &str) -> Result<Vec<Mountpoint>> {
        let mut stmt = self
            .db
            .prepare("SELECT image, root, rw FROM mountpoints WHERE image = ?1")?;
        let rows = stmt.query_map(params![image_id], mountpoint_from_row)?;
        let mut mountpoints = Vec::new();
        for row in rows {
            mountpoints.push(row?);
        }
        Ok(mountpoints)
    }

    /// Mount `image` as a live union filesystem at `root` with `rw` as the
    /// writable overlay.
    ///
    /// An existing registration for the same (root, rw) pair is reused;
    /// otherwise one is inserted. The target directories are created if
    /// absent, the layer stack is assembled into a branch list, the mount
    /// is issued and verified live, and the image's deletions relative to
    /// its parent chain are reified as whiteouts in the overlay.
    pub fn mount(
        &self,
        image: &Image,
        root: impl AsRef<Path>,
        rw: impl AsRef<Path>,
    ) -> Result<Mountpoint> {
        let mountpoint = match self.fetch_mountpoint(&root, &rw)? {
            Some(mp) => mp,
            None => self.add_mountpoint(image, &root, &rw)?,
        };
        mountpoint.create_dirs()?;

        let stack = self.layer_stack(&image.id)?;
        let branches = mount::branch_config(&mountpoint.rw, &stack);
        mount::mount_union(&self.config, &mountpoint.root, &branches)?;
        if !mount::is_mounted(&mountpoint.root)? {
            return Err(StorageError::MountVerify(mountpoint.root.clone()));
        }

        let changes = self.diff.changes(&stack[0])?;
        mount::apply_whiteouts(&mountpoint.rw, &changes)?;

        tracing::debug!(
            image = %image.id,
            root = %mountpoint.root.display(),
            "union mount established"
        );
        Ok(mountpoint)
    }

    /// Whether the mountpoint is currently live on the host.
    pub fn mounted(&self, mountpoint: &Mountpoint) -> Result<bool> {
        mount::is_mounted(&mountpoint.root)
    }

    /// Unmount a live mountpoint and remove its root directory.
    pub fn unmount(&self, mountpoint: &Mountpoint) -> Result<()> {
        mount::unmount_union(&mountpoint.root, self.config.unmount_retries)?;
        tracing::debug!(root = %mountpoint.root.display(), "unmounted");
        Ok(())
    }

    /// Mount the mountpoint's image if it is not already live.
    ///
    /// Intended for transparent re-mounting after a process restart.
    pub fn ensure_mounted(&self, mountpoint: &Mountpoint) -> Result<()> {
        if mount::is_mounted(&mountpoint.root)? {
            return Ok(());
        }
        let image = self
            .get(&mountpoint.image)?
            .ok_or_else(|| StorageError::ImageNotFound(mountpoint.image.clone()))?;
        self.mount(&image, &mountpoint.root, &mountpoint.rw)?;
        Ok(())
    }

    /// Delete a mountpoint registration.
    ///
    /// Refused while the mountpoint is live on the host.
    pub fn deregister(&self, mountpoint: &Mountpoint) -> Result<()> {
        if mount::is_mounted(&mountpoint.root)? {
            return Err(StorageError::Busy(mountpoint.root.clone()));
        }
        self.db.execute(
            "DELETE FROM mountpoints WHERE root = ?1",
            params![path_str(&mountpoint.root)],
        )?;
        Ok(())
    }

    /// Open a file under a mountpoint's root with the given options,
    /// mounting first if needed.
    ///
    /// ```no_run
    /// # use ustorage::{Store, Mountpoint};
    /// # fn demo(store: &Store, mountpoint: &Mountpoint) -> ustorage::Result<()> {
    /// let log = store.open_file(
    ///     mountpoint,
    ///     "var/log/app.log",
    ///     std::fs::OpenOptions::new().append(true).create(true),
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open_file(
        &self,
        mountpoint: &Mountpoint,
        path: impl AsRef<Path>,
        opts: &fs::OpenOptions,
    ) -> Result<fs::File> {
        self.ensure_mounted(mountpoint)?;
        let rel = path.as_ref();
        let rel = rel.strip_prefix("/").unwrap_or(rel);
        Ok(opts.open(mountpoint.root.join(rel))?)
    }

    /// List a directory under a mountpoint's root, sorted by name,
    /// mounting first if needed.
    pub fn read_dir(
        &self,
        mountpoint: &Mountpoint,
        path: impl AsRef<Path>,
    ) -> Result<Vec<fs::DirEntry>> {
        self.ensure_mounted(mountpoint)?;
        let rel = path.as_ref();
        let rel = rel.strip_prefix("/").unwrap_or(rel);
        let mut entries = fs::read_dir(mountpoint.root.join(rel))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{fake_archive, TestStore};

    #[test]
    fn test_register_is_atomic() {
        let mut t = TestStore::new();
        let image = Image::new(random_id(), Some("no-such-parent"), "testing");
        let archive = fake_archive(&[("a", "1")]);

        let err = t
            .store
            .register(archive.as_slice(), &image, "foo")
            .unwrap_err();
        assert!(matches!(err, StorageError::ParentMissing { .. }));

        // neither the catalog rows nor the layer directory survive
        assert_eq!(t.store.images().unwrap().len(), 0);
        assert_eq!(t.store.paths().unwrap().len(), 0);
        assert_eq!(t.store.layers().unwrap().len(), 0);
    }

    #[test]
    fn test_find_empty_spec_is_invalid() {
        let t = TestStore::new();
        assert!(matches!(
            t.store.find(""),
            Err(StorageError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_find_unknown_returns_none() {
        let t = TestStore::new();
        assert_eq!(t.store.find("nope").unwrap(), None);
    }

    #[test]
    fn test_path_names_are_cleaned() {
        let mut t = TestStore::new();
        let archive = fake_archive(&[("a", "1")]);
        t.store
            .create(archive.as_slice(), None, "foo//bar/", "")
            .unwrap();

        assert_eq!(t.store.paths().unwrap(), vec!["foo/bar"]);
        assert_eq!(t.store.list("foo/./bar").unwrap().len(), 1);
    }
}
