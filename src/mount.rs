//! Union-mount machinery.
//!
//! A mountpoint pairs a target root directory with a read-write overlay
//! directory and the image whose layer stack backs it. The union
//! filesystem presents the overlay as the top writable branch over the
//! read-only layer branches, child shadowing parent.
//!
//! Liveness is detected without parsing the mount table: a directory is a
//! mount point exactly when its device id differs from its parent's.
//! Teardown has one quirk worth preserving: union filesystems release the
//! mount-point inode lazily, so removing the (empty) root directory after
//! unmount can spuriously fail for a while and is retried on a short
//! fixed delay.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use rustix::io::Errno;
use rustix::mount::{MountFlags, UnmountFlags};

use crate::config::StorageConfig;
use crate::diff::{Change, ChangeKind};
use crate::error::{Result, StorageError};

/// Delay between attempts to remove the mount root after unmount.
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A registered union mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountpoint {
    /// Id of the image whose layer stack backs the mount.
    pub image: String,
    /// Target directory the union filesystem is mounted on.
    pub root: PathBuf,
    /// Read-write overlay directory, the top branch of the stack.
    pub rw: PathBuf,
}

impl Mountpoint {
    /// Create the root and rw directories, tolerating existing ones.
    pub(crate) fn create_dirs(&self) -> Result<()> {
        ensure_dir(&self.root)?;
        ensure_dir(&self.rw)
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Build the branch list for the union mount.
///
/// The read-write overlay comes first, then each layer as a read-only
/// branch in stack order, so the child shadows the parent:
/// `br:<rw>=rw:<layer0>=ro:<layer1>=ro:`. The trailing colon is accepted
/// by the filesystem.
pub fn branch_config(rw: &Path, layers: &[PathBuf]) -> String {
    let mut branches = format!("br:{}=rw", rw.display());
    for layer in layers {
        branches.push_str(&format!(":{}=ro", layer.display()));
    }
    branches.push(':');
    branches
}

/// Whether `target` is currently a live mount point.
///
/// Compares the device id of the directory with that of its parent; they
/// differ exactly when a filesystem is mounted on `target`. A missing
/// directory is simply not mounted.
pub fn is_mounted(target: &Path) -> Result<bool> {
    let target_stat = match rustix::fs::stat(target) {
        Ok(st) => st,
        Err(Errno::NOENT) => return Ok(false),
        Err(errno) => return Err(StorageError::Io(errno.into())),
    };
    let parent_stat =
        rustix::fs::stat(target.join("..")).map_err(|errno| StorageError::Io(errno.into()))?;
    Ok(target_stat.st_dev != parent_stat.st_dev)
}

/// Issue the union mount syscall for `target` with the given branch list.
pub(crate) fn mount_union(config: &StorageConfig, target: &Path, branches: &str) -> Result<()> {
    tracing::debug!(
        target = %target.display(),
        driver = %config.driver,
        branches,
        "mounting union filesystem"
    );
    let branches_c = std::ffi::CString::new(branches).map_err(|_| StorageError::Mount {
        target: target.to_path_buf(),
        source: Errno::INVAL,
    })?;
    rustix::mount::mount(
        config.source.as_str(),
        target,
        config.driver.as_str(),
        MountFlags::empty(),
        Some(branches_c.as_c_str()),
    )
    .map_err(|errno| StorageError::Mount {
        target: target.to_path_buf(),
        source: errno,
    })
}

/// Unmount `target` and remove its (now empty) root directory.
///
/// Fails with [`NotMounted`](StorageError::NotMounted) when the target is
/// not live, and with [`StillMounted`](StorageError::StillMounted) when
/// the filesystem survives the unmount syscall.
pub(crate) fn unmount_union(target: &Path, retries: u32) -> Result<()> {
    if !is_mounted(target)? {
        return Err(StorageError::NotMounted(target.to_path_buf()));
    }
    rustix::mount::unmount(target, UnmountFlags::empty()).map_err(|errno| {
        StorageError::Unmount {
            target: target.to_path_buf(),
            source: errno,
        }
    })?;
    if is_mounted(target)? {
        return Err(StorageError::StillMounted(target.to_path_buf()));
    }
    remove_mount_root(target, retries)
}

/// Remove the unmounted root directory, retrying while the union
/// filesystem still holds the inode.
fn remove_mount_root(target: &Path, retries: u32) -> Result<()> {
    for _ in 0..retries {
        match fs::remove_dir(target) {
            Ok(()) => return Ok(()),
            // already gone counts as success
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(_) => thread::sleep(REMOVE_RETRY_DELAY),
        }
    }
    Err(StorageError::RemovalTimeout(target.to_path_buf()))
}

/// Materialize the `Delete` entries of a changeset as whiteouts in `rw`.
///
/// For each deleted path the parent directory is created under the
/// overlay and an empty `.wh.<basename>` file is placed alongside, which
/// instructs the union filesystem to hide the entry from lower layers.
pub(crate) fn apply_whiteouts(rw: &Path, changes: &[Change]) -> Result<()> {
    for change in changes {
        if change.kind != ChangeKind::Delete {
            continue;
        }
        let rel = change
            .path
            .strip_prefix("/")
            .unwrap_or(change.path.as_path());
        let Some(name) = rel.file_name() else {
            continue;
        };
        let dir = match rel.parent() {
            Some(parent) => rw.join(parent),
            None => rw.to_path_buf(),
        };
        fs::create_dir_all(&dir)?;
        fs::File::create(dir.join(format!(".wh.{}", name.to_string_lossy())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_config() {
        let layers = vec![PathBuf::from("/layers/top"), PathBuf::from("/layers/base")];
        assert_eq!(
            branch_config(Path::new("/mnt/rw"), &layers),
            "br:/mnt/rw=rw:/layers/top=ro:/layers/base=ro:"
        );
    }

    #[test]
    fn test_branch_config_no_layers() {
        assert_eq!(branch_config(Path::new("/mnt/rw"), &[]), "br:/mnt/rw=rw:");
    }

    #[test]
    fn test_plain_directory_is_not_mounted() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mounted(dir.path()).unwrap());
    }

    #[test]
    fn test_missing_directory_is_not_mounted() {
        assert!(!is_mounted(Path::new("/nonexistent/mount/root")).unwrap());
    }

    #[test]
    fn test_remove_mount_root() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mnt");
        fs::create_dir(&target).unwrap();

        remove_mount_root(&target, 3).unwrap();
        assert!(!target.exists());

        // removing an already-absent directory is success too
        remove_mount_root(&target, 3).unwrap();
    }

    #[test]
    fn test_remove_mount_root_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mnt");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("occupied"), b"x").unwrap();

        let err = remove_mount_root(&target, 2).unwrap_err();
        assert!(matches!(err, StorageError::RemovalTimeout(_)));
    }

    #[test]
    fn test_apply_whiteouts() {
        let dir = tempfile::tempdir().unwrap();
        let changes = vec![
            Change {
                kind: ChangeKind::Delete,
                path: PathBuf::from("/etc/config"),
            },
            Change {
                kind: ChangeKind::Add,
                path: PathBuf::from("/usr/bin/app"),
            },
            Change {
                kind: ChangeKind::Delete,
                path: PathBuf::from("toplevel"),
            },
        ];

        apply_whiteouts(dir.path(), &changes).unwrap();

        assert!(dir.path().join("etc/.wh.config").exists());
        assert!(dir.path().join(".wh.toplevel").exists());
        assert!(!dir.path().join("usr").exists());
    }
}
