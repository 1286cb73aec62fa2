//! Layer storage on the host filesystem.
//!
//! A layer holds the extracted contents of one image's archive and acts as
//! a read-only branch in a union-mount stack. The [`LayerStore`] owns a
//! directory with one subdirectory per layer, named by image id:
//!
//! ```text
//! layers/
//! +-- <image-id>/     # extracted archive contents
//! |   +-- etc/
//! |   +-- usr/
//! +-- <image-id>/
//! ```
//!
//! The store knows nothing of images, parents or tags. There is no
//! reference counting and no concurrent-writer arbitration beyond the
//! atomicity of directory creation: two writers racing on the same id see
//! one of them fail with [`AlreadyExists`](crate::StorageError::AlreadyExists).

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;

use crate::error::{Result, StorageError};

/// Directory of extracted layers, keyed by image id.
#[derive(Debug)]
pub struct LayerStore {
    /// Root directory holding one subdirectory per layer.
    root: PathBuf,
}

impl LayerStore {
    /// Open a layer store rooted at `root`, creating the directory if
    /// needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Create the layer directory for `id` and extract `archive` into it.
    ///
    /// The archive is an uncompressed tar stream; permissions and
    /// modification times are preserved, ownership as well when running as
    /// root. On any extraction error the partial directory is removed
    /// before the error is surfaced, so a layer directory either holds the
    /// complete archive contents or does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyExists`](StorageError::AlreadyExists) if a layer
    /// with this id is already present.
    pub fn add_layer(&self, id: &str, archive: impl Read) -> Result<PathBuf> {
        let dir = self.root.join(id);
        fs::create_dir(&dir).map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                StorageError::AlreadyExists {
                    entity: "layer",
                    key: id.to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;

        let mut tar = tar::Archive::new(archive);
        tar.set_preserve_permissions(true);
        tar.set_preserve_mtime(true);
        tar.set_preserve_ownerships(rustix::process::geteuid().is_root());

        if let Err(err) = tar.unpack(&dir) {
            let _ = fs::remove_dir_all(&dir);
            return Err(err.into());
        }

        tracing::debug!(id, path = %dir.display(), "layer extracted");
        Ok(dir)
    }

    /// The directory path for layer `id`, if it exists.
    pub fn get(&self, id: &str) -> Option<PathBuf> {
        let dir = self.root.join(id);
        dir.is_dir().then_some(dir)
    }

    /// Enumerate the stored layer ids.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::fake_archive;

    fn temp_layer_store() -> (LayerStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::new(dir.path().join("layers")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_add_and_get() {
        let (store, _dir) = temp_layer_store();
        let archive = fake_archive(&[("etc/hosts", "127.0.0.1 localhost\n")]);

        let path = store.add_layer("layer1", archive.as_slice()).unwrap();
        assert_eq!(store.get("layer1"), Some(path.clone()));

        let contents = fs::read_to_string(path.join("etc/hosts")).unwrap();
        assert_eq!(contents, "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_get_missing() {
        let (store, _dir) = temp_layer_store();
        assert_eq!(store.get("nope"), None);
    }

    #[test]
    fn test_duplicate_id_fails() {
        let (store, _dir) = temp_layer_store();
        let archive = fake_archive(&[("a", "1")]);
        store.add_layer("layer1", archive.as_slice()).unwrap();

        let err = store.add_layer("layer1", archive.as_slice()).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[test]
    fn test_partial_extraction_is_removed() {
        let (store, _dir) = temp_layer_store();
        let garbage = [0x55u8; 100];

        assert!(store.add_layer("broken", garbage.as_slice()).is_err());
        assert_eq!(store.get("broken"), None);
    }

    #[test]
    fn test_list() {
        let (store, _dir) = temp_layer_store();
        let archive = fake_archive(&[("a", "1")]);
        store.add_layer("b-layer", archive.as_slice()).unwrap();
        let archive = fake_archive(&[("a", "1")]);
        store.add_layer("a-layer", archive.as_slice()).unwrap();

        assert_eq!(store.list().unwrap(), vec!["a-layer", "b-layer"]);
    }
}
