//! Replacer module for atomic file replacement.
//!
//! The transcoded bytes are streamed into a hidden sibling of the destination
//! which is then renamed over it. The destination is either the old file or
//! the complete new one; it is never observed partially written.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during file replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Failed to open the transcoded file.
    #[error("failed to open transcoded output: {0}")]
    OpenSource(io::Error),

    /// Failed to create the sibling next to the destination.
    #[error("failed to create temporary file: {0}")]
    CreateTemp(io::Error),

    /// Failed to copy the transcoded bytes.
    #[error("failed to copy transcoded output: {0}")]
    Copy(io::Error),

    /// Failed to flush the copy to disk.
    #[error("failed to sync temporary file: {0}")]
    Sync(io::Error),

    /// Failed to move the sibling over the destination.
    #[error("failed to rename temporary file over destination: {0}")]
    Rename(io::Error),

    /// Failed to remove the task's temporary output.
    #[error("failed to remove temporary output: {0}")]
    Cleanup(io::Error),
}

/// Path of the sibling used while replacing `dst`: `<dir>/.tmp_<name>`.
pub fn swap_sibling_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".tmp_{}", name))
}

/// Replaces `dst` with the contents of `src`.
///
/// Returns the number of bytes written.
pub fn atomic_replace(src: &Path, dst: &Path) -> Result<u64, ReplaceError> {
    let source = File::open(src).map_err(ReplaceError::OpenSource)?;
    let size_hint = source.metadata().map(|m| m.len()).unwrap_or(0);
    replace_from_reader(source, size_hint, dst)
}

/// Replaces `dst` with everything read from `reader`.
///
/// `size_hint` is used to preallocate the sibling; preallocation failure is
/// not an error. The destination's permission bits are carried over when
/// they can be read.
pub fn replace_from_reader<R: Read>(
    mut reader: R,
    size_hint: u64,
    dst: &Path,
) -> Result<u64, ReplaceError> {
    let permissions = fs::metadata(dst).ok().map(|m| m.permissions());

    let sibling = SiblingFile::create(swap_sibling_path(dst))?;

    if let Err(e) = preallocate(&sibling.file, size_hint) {
        debug!(path = %sibling.path.display(), error = %e, "preallocation failed, continuing with plain copy");
    }

    let mut file = &sibling.file;
    let copied = io::copy(&mut reader, &mut file).map_err(ReplaceError::Copy)?;
    sibling.file.set_len(copied).map_err(ReplaceError::Copy)?;
    sibling.file.sync_all().map_err(ReplaceError::Sync)?;

    if let Some(permissions) = permissions {
        if let Err(e) = fs::set_permissions(&sibling.path, permissions) {
            warn!(path = %dst.display(), error = %e, "failed to preserve file permissions");
        }
    }

    sibling.persist(dst)?;
    Ok(copied)
}

/// The sibling file; removed on drop unless persisted.
struct SiblingFile {
    path: PathBuf,
    file: File,
    persisted: bool,
}

impl SiblingFile {
    fn create(path: PathBuf) -> Result<Self, ReplaceError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(ReplaceError::CreateTemp)?;
        Ok(Self {
            path,
            file,
            persisted: false,
        })
    }

    fn persist(mut self, dst: &Path) -> Result<(), ReplaceError> {
        fs::rename(&self.path, dst).map_err(ReplaceError::Rename)?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for SiblingFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove temporary file");
        }
    }
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    if len == 0 {
        return Ok(());
    }
    let len = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "size too large"))?;
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &File, _len: u64) -> io::Result<()> {
    Ok(())
}
