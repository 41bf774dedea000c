//! Zip bundling and race-safe installation into the destination prefix.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::error::{EmbargoError, Result};
use crate::persistence::temp_sibling;

/// Result of a transfer-if-absent install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// Something already occupies the destination; nothing was written.
    AlreadyPresent,
}

fn archive_error(path: &Path, err: impl std::fmt::Display) -> EmbargoError {
    EmbargoError::Archive {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Sorted names of the regular files directly inside `dir`.
pub fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Zip every regular file in `source_dir` (flat) into `archive`.
///
/// FITS members are stored uncompressed, everything else is deflated.
/// Returns the member names in archive order.
pub fn write_archive(source_dir: &Path, archive: &Path) -> Result<Vec<String>> {
    let members = list_files(source_dir)?;
    let file = File::create(archive)?;
    let mut zip = zip::ZipWriter::new(file);
    for name in &members {
        let path = source_dir.join(name);
        let size = std::fs::metadata(&path)?.len();
        let method = if name.ends_with(".fits") {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .large_file(size >= u64::from(u32::MAX));
        debug!(member = %name, bytes = size, ?method, "Adding to archive");
        zip.start_file(name.as_str(), options)
            .map_err(|e| archive_error(archive, e))?;
        let mut input = File::open(&path)?;
        io::copy(&mut input, &mut zip)?;
    }
    zip.finish().map_err(|e| archive_error(archive, e))?;
    Ok(members)
}

/// Copy `source` to `dest` unless `dest` already exists.
pub fn install_if_absent(source: &Path, dest: &Path) -> Result<InstallOutcome> {
    if dest.exists() {
        return Ok(InstallOutcome::AlreadyPresent);
    }
    install_new(source, dest)
}

/// Copy `source` to `dest` without ever replacing an existing file.
///
/// The bytes go to a hidden temp file in the destination directory first and
/// are then hard-linked to the final name, which fails instead of replacing an
/// existing file. The final name therefore only ever shows complete content.
pub fn install_new(source: &Path, dest: &Path) -> Result<InstallOutcome> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staged = TempGuard(temp_sibling(dest));
    std::fs::copy(source, &staged.0)?;
    match std::fs::hard_link(&staged.0, dest) {
        Ok(()) => Ok(InstallOutcome::Installed),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(InstallOutcome::AlreadyPresent),
        Err(e) => Err(e.into()),
    }
}

/// Removes the staged temp file on every exit path.
struct TempGuard(PathBuf);

impl Drop for TempGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
