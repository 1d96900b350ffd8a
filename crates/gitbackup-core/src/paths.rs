//! Byte-level path plumbing.
//!
//! Tree paths, index paths and escaped repository paths are byte strings:
//! source filesystems and git trees both allow names that are not valid
//! UTF-8, so conversions go through raw bytes rather than `String`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::{BackupError, Result};

#[cfg(unix)]
pub fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
pub fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
pub fn bytes_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
pub fn bytes_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Does this file name end in `.git`?
pub fn ends_with_git(name: &OsStr) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        name.as_bytes().ends_with(b".git")
    }
    #[cfg(not(unix))]
    {
        name.to_string_lossy().ends_with(".git")
    }
}

/// Map `path` under the source directory `dir` to its backup tree path
/// `<prefix>/<relative>`.
pub fn to_prefix_path(dir: &Path, prefix: &str, path: &Path) -> Result<Vec<u8>> {
    let rel = path.strip_prefix(dir).map_err(|_| {
        BackupError::Other(format!(
            "{} is not under {}",
            path.display(),
            dir.display()
        ))
    })?;
    let mut out = prefix.as_bytes().to_vec();
    out.push(b'/');
    out.extend_from_slice(&path_bytes(rel));
    Ok(out)
}

/// Map a backup tree path under `prefix` to its on-disk location under `dir`.
pub fn from_prefix_path(prefix: &str, dir: &Path, path: &[u8]) -> Result<PathBuf> {
    let rest = path.strip_prefix(prefix.as_bytes()).ok_or_else(|| {
        BackupError::Other(format!(
            "{} has no prefix {prefix}",
            String::from_utf8_lossy(path)
        ))
    })?;
    let rest = {
        let mut r = rest;
        while let Some(stripped) = r.strip_prefix(b"/") {
            r = stripped;
        }
        r
    };
    Ok(dir.join(bytes_path(rest)))
}
