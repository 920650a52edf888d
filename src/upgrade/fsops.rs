//! File operations shared by the installer, backups and rollback.
//!
//! Every write to the live installation goes through [`atomic_copy`] or
//! [`atomic_write`]: content lands in a temporary file in the target's own
//! directory and is renamed over the target, so a reader sees either the old
//! file or the complete new one.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

fn temp_beside(target: &Path) -> Result<NamedTempFile> {
    let dir = target
        .parent()
        .ok_or_else(|| Error::Filesystem(format!("no parent directory: {}", target.display())))?;
    fs::create_dir_all(dir).map_err(|e| Error::fs("creating", dir, e))?;
    tempfile::Builder::new()
        .prefix(".os-health-agent.")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::fs("creating temp file in", dir, e))
}

fn commit(tmp: NamedTempFile, target: &Path) -> Result<()> {
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::fs("syncing temp file for", target, e))?;
    tmp.persist(target)
        .map_err(|e| Error::fs("renaming over", target, e.error))?;
    Ok(())
}

/// Copy `source` over `target` atomically, keeping `source`'s permissions.
///
/// # Errors
///
/// Returns [`Error::Filesystem`] if reading, writing or the final rename fails.
/// `target` is untouched on error.
pub fn atomic_copy(source: &Path, target: &Path) -> Result<()> {
    let mut src = File::open(source).map_err(|e| Error::fs("opening", source, e))?;
    let permissions = src
        .metadata()
        .map_err(|e| Error::fs("reading metadata of", source, e))?
        .permissions();

    let mut tmp = temp_beside(target)?;
    io::copy(&mut src, tmp.as_file_mut()).map_err(|e| Error::fs("copying", source, e))?;
    tmp.as_file()
        .set_permissions(permissions)
        .map_err(|e| Error::fs("setting permissions for", target, e))?;
    commit(tmp, target)
}

/// Replace `target` with `contents` atomically.
///
/// # Errors
///
/// Returns [`Error::Filesystem`] if the write or rename fails.
pub fn atomic_write(target: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = temp_beside(target)?;
    tmp.write_all(contents)
        .map_err(|e| Error::fs("writing", target, e))?;
    commit(tmp, target)
}

/// Size and lowercase hex SHA-256 of a file, streamed.
///
/// # Errors
///
/// Returns [`Error::Filesystem`] if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path).map_err(|e| Error::fs("opening", path, e))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher).map_err(|e| Error::fs("reading", path, e))?;
    Ok((size, hex::encode(hasher.finalize())))
}
