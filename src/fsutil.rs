//! Permission-aware filesystem helpers for secret material
//!
//! Credential and key files are written with owner-only permissions (600 in
//! a 700 directory); certificates are world-readable (644). All writers in
//! the crate go through these helpers so the permission discipline lives in
//! one place.

use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// Create a directory (and parents) and set its mode.
pub fn ensure_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io(format!("creating {}", path.display()), e))?;
    set_mode(path, mode)
}

/// Write a file and set its mode in one step.
///
/// The parent directory must already exist; callers create it via
/// [`ensure_dir_with_mode`] so the directory gets the right mode too.
pub fn write_file_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    fs::write(path, contents).map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
    set_mode(path, mode)
}

/// Copy a file and set the destination's mode.
pub fn copy_with_mode(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    fs::copy(src, dst).map_err(|e| {
        Error::io(
            format!("copying {} to {}", src.display(), dst.display()),
            e,
        )
    })?;
    set_mode(dst, mode)
}

/// Set the mode of an existing path.
///
/// No-op on non-unix targets, where the runtime environment does not carry
/// the same permission semantics.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::io(format!("setting mode on {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Read the mode bits of a path (unix only; returns `None` elsewhere).
pub fn file_mode(path: &Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        fs::metadata(path).ok().map(|m| m.mode() & 0o777)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}
