//! Sidecar file storage: large blobs kept outside the manifest database.
//!
//! Filenames are a content-independent digest of the (already key-encoded)
//! key — distinct from the facade's [`crate::key_encoder::KeyEncoder`], per
//! spec §6.2 ("callers cannot influence it").

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Deterministic, fixed-width digest used as a sidecar filename.
pub fn digest(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn path_for(data_dir: &Path, digest: &str) -> PathBuf {
    data_dir.join(digest)
}

/// Writes `bytes` to the sidecar for `digest` via temp-file + atomic rename
/// (spec §4.2 write algorithm, step 2).
pub fn write_atomic(data_dir: &Path, digest: &str, bytes: &[u8]) -> io::Result<()> {
    let tmp_name = format!(".{}.{}.tmp", digest, std::process::id());
    let tmp_path = data_dir.join(tmp_name);
    fs::write(&tmp_path, bytes)?;
    // fsync the temp file before the rename so a crash cannot leave a
    // zero-length file at the final path.
    let file = fs::File::open(&tmp_path)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path_for(data_dir, digest))
}

pub fn read(data_dir: &Path, digest: &str) -> io::Result<Vec<u8>> {
    fs::read(path_for(data_dir, digest))
}

/// Best-effort removal; a missing file is not an error (spec §4.2 "Remove").
pub fn remove(data_dir: &Path, digest: &str) -> io::Result<()> {
    match fs::remove_file(path_for(data_dir, digest)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recreates an empty `data/` directory.
pub fn clear_dir(data_dir: &Path) -> io::Result<()> {
    if data_dir.exists() {
        fs::remove_dir_all(data_dir)?;
    }
    fs::create_dir_all(data_dir)
}

/// Marks `path` as excluded from platform backups, where the platform
/// supports it (spec §6.4). No-op on platforms without such a facility.
#[cfg(target_os = "macos")]
pub fn exclude_from_backup(_path: &Path) {
    // A full implementation would set `NSURLIsExcludedFromBackupKey` via the
    // Foundation bindings; left as a hook since this crate has no Foundation
    // dependency.
}

#[cfg(not(target_os = "macos"))]
pub fn exclude_from_backup(_path: &Path) {}
