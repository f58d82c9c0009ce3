//! Physical mount mechanism.
//!
//! The engine never touches the mount root directly; it goes through a
//! [`LinkMaterializer`]. The shipped implementation, [`SymlinkMaterializer`],
//! places one file symlink per virtual path. Anything that can make a source
//! file appear at a mount location (hard links, copies, a virtual
//! filesystem) can be substituted without changing the resolver or engine.
//!
//! Both operations are idempotent: linking the same path twice, or unlinking a
//! path that is already gone, leaves the same end state and reports no error.

use crate::error::{Error, Result};
use crate::path::VirtualPath;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io;

/// What currently occupies a mount location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing at this location.
    Absent,
    /// A link pointing at the contained target.
    Linked(Utf8PathBuf),
    /// A regular file or directory that the engine did not create.
    Foreign,
}

/// Mount/unmount a single virtual path.
pub trait LinkMaterializer: Send + Sync {
    /// Make `mount_root/path` resolve to `target`, replacing any existing link
    /// there. Intermediate directories are created as needed.
    fn link(&self, path: &VirtualPath, target: &Utf8Path, mount_root: &Utf8Path) -> Result<()>;

    /// Remove the link at `mount_root/path` if present.
    fn unlink(&self, path: &VirtualPath, mount_root: &Utf8Path) -> Result<()>;

    /// Inspect what is at `mount_root/path` without modifying it.
    fn inspect(&self, path: &VirtualPath, mount_root: &Utf8Path) -> LinkState;
}

/// Symlink-based overlay.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymlinkMaterializer;

impl LinkMaterializer for SymlinkMaterializer {
    fn link(&self, path: &VirtualPath, target: &Utf8Path, mount_root: &Utf8Path) -> Result<()> {
        let dest = path.under(mount_root);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|e| link_error(path, e))?;
        }

        match self.inspect(path, mount_root) {
            LinkState::Linked(existing) if existing.as_path() == target => {
                tracing::trace!("Link already in place: {}", dest);
                return Ok(());
            }
            LinkState::Linked(_) => {
                fs::remove_file(dest.as_std_path()).map_err(|e| link_error(path, e))?;
            }
            LinkState::Foreign => {
                return Err(link_error(
                    path,
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a link", dest),
                    ),
                ));
            }
            LinkState::Absent => {}
        }

        create_symlink(target, &dest).map_err(|e| link_error(path, e))?;
        tracing::debug!("Linked {} -> {}", dest, target);
        Ok(())
    }

    fn unlink(&self, path: &VirtualPath, mount_root: &Utf8Path) -> Result<()> {
        let dest = path.under(mount_root);

        match self.inspect(path, mount_root) {
            LinkState::Absent => Ok(()),
            LinkState::Linked(_) => {
                match fs::remove_file(dest.as_std_path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(link_error(path, e)),
                }
                tracing::debug!("Unlinked {}", dest);
                Ok(())
            }
            LinkState::Foreign => Err(link_error(
                path,
                io::Error::other(format!("{} is not a link, refusing to remove", dest)),
            )),
        }
    }

    fn inspect(&self, path: &VirtualPath, mount_root: &Utf8Path) -> LinkState {
        let dest = path.under(mount_root);
        let Ok(meta) = fs::symlink_metadata(dest.as_std_path()) else {
            return LinkState::Absent;
        };

        if !meta.file_type().is_symlink() {
            return LinkState::Foreign;
        }

        match fs::read_link(dest.as_std_path()) {
            Ok(target) => match Utf8PathBuf::from_path_buf(target) {
                Ok(target) => LinkState::Linked(target),
                Err(target) => {
                    tracing::warn!("Link {} has a non-UTF-8 target: {}", dest, target.display());
                    LinkState::Foreign
                }
            },
            Err(_) => LinkState::Foreign,
        }
    }
}

#[cfg(unix)]
fn create_symlink(target: &Utf8Path, dest: &Utf8Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target.as_std_path(), dest.as_std_path())
}

#[cfg(windows)]
fn create_symlink(target: &Utf8Path, dest: &Utf8Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target.as_std_path(), dest.as_std_path())
}

/// ERROR_PRIVILEGE_NOT_HELD: creating symlinks needs Developer Mode or admin rights.
#[cfg(windows)]
const PRIVILEGE_NOT_HELD: i32 = 1314;

fn link_error(path: &VirtualPath, e: io::Error) -> Error {
    #[cfg(windows)]
    if e.raw_os_error() == Some(PRIVILEGE_NOT_HELD) {
        return Error::LinkPermissionDenied {
            path: path.clone(),
            source: e,
        };
    }
    Error::link(path, e)
}
