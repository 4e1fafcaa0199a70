//! Filesystem helpers shared by the index, overlay and rollback code
//!
//! Everything here operates on the path itself and never follows a final
//! symbolic link: metadata comes from `lstat`, ownership changes use
//! `lchown`, and removal deletes the link rather than its target.

use crate::error::{DeltaError, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Mask selecting the permission bits (including setuid/setgid/sticky)
pub const PERMISSION_MASK: u32 = 0o7777;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Raw `EXDEV` errno, returned by rename(2) across filesystems
const EXDEV: i32 = 18;

/// Whether a raw lstat mode describes a directory
pub fn is_dir_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Whether a raw lstat mode describes a symbolic link
pub fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Permission bits of a raw mode
pub fn permission_bits(mode: u32) -> u32 {
    mode & PERMISSION_MASK
}

/// `lexists`: true for anything present at `path`, including dangling symlinks
pub fn lexists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// True when `path` is a real directory (not a symlink to one)
pub fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_dir())
        .unwrap_or(false)
}

/// Owner and group of `path` without following symlinks
pub fn owner_of(path: &Path) -> Result<(u32, u32)> {
    let metadata = fs::symlink_metadata(path)?;
    Ok((metadata.uid(), metadata.gid()))
}

/// Change ownership of `path` itself (symlinks are not followed)
pub fn lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    trace!("lchown {:?} {}:{}", path, uid, gid);
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

/// Set Unix permission bits
///
/// Symbolic links carry no permissions of their own on Linux, so this is
/// a no-op for them rather than a chmod of the link target.
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    trace!("chmod {:?} {:o}", path, permission_bits(mode));
    fs::set_permissions(path, fs::Permissions::from_mode(permission_bits(mode)))?;
    Ok(())
}

/// Remove whatever is at `path`: file, symlink or directory tree
///
/// Returns `false` if nothing was there.
pub fn remove_any(path: &Path) -> Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if metadata.file_type().is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    trace!("Removed {:?}", path);
    Ok(true)
}

/// Create every missing directory above `path`
///
/// An ancestor that resolves to a directory, including through a symbolic
/// link, is kept. Anything else blocking one of the ancestors (a file, a
/// link to a file, a dangling link) is removed and replaced by a directory.
pub fn mkdir_parents(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };

    let mut current = PathBuf::new();
    for component in parent.components() {
        current.push(component);
        match fs::metadata(&current) {
            Ok(m) if m.is_dir() => continue,
            Ok(_) => {
                trace!("Replacing non-directory {:?} with a directory", current);
                fs::remove_file(&current)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if lexists(&current) {
                    trace!("Replacing dangling symlink {:?} with a directory", current);
                    fs::remove_file(&current)?;
                }
            }
            Err(e) => return Err(e.into()),
        }
        fs::create_dir(&current)?;
    }
    Ok(())
}

/// Move `source` to `dest`, falling back to copy-and-delete across filesystems
///
/// `dest` must not exist and its parent directory must.
pub fn move_path(source: &Path, dest: &Path) -> Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            trace!("Cross-device move {:?} -> {:?}", source, dest);
            copy_tree(source, dest)?;
            remove_any(source)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Copy a file, symlink or directory tree preserving permission bits
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| DeltaError::internal(e.to_string()))?;
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let mode = entry.metadata()?.mode();
            set_permissions(&target, mode)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Lexically normalize an absolute path (`.` and `..` resolved, no symlinks)
pub fn normalize(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(DeltaError::NotAbsolute(path.to_path_buf()));
    }

    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(name) => normalized.push(name),
        }
    }
    Ok(normalized)
}

/// The path below `/`, e.g. `/etc/passwd` -> `etc/passwd`
pub fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Atomically replace `path` with `content`
///
/// The data is written to a temporary file in the same directory and
/// renamed into place only after a successful write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| DeltaError::Io(e.error))?;
    Ok(())
}
