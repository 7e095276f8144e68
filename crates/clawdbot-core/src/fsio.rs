//! Atomic filesystem helpers shared by the config, auth, and session stores.
//!
//! Every persisted store writes through `write_atomic`: serialize to a temp
//! file in the destination directory, fsync, then rename over the target.
//! Rename can fail across devices and on Windows-style filesystems when the
//! target is open; the fallback path copies, fixes the mode, and unlinks.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Create `dir` (and parents) with mode 0700 if it does not exist.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Atomically replace `path` with `bytes`.
///
/// `mode` applies on unix (pass 0o600 for credential files). A best-effort
/// `.bak` sibling of the previous contents is written first; failure to
/// write the backup never fails the write itself.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_private_dir(dir)?;

    if path.exists() {
        let bak = path.with_extension(bak_extension(path));
        let _ = fs::copy(path, &bak);
    }

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    match tmp.persist(path) {
        Ok(_) => Ok(()),
        Err(e) => {
            // Rename failed (cross-device, or the target is held open).
            // Fall back to copy + chmod + unlink of the temp file.
            let tmp_path = e.file.path().to_path_buf();
            fs::copy(&tmp_path, path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
            }
            let _ = fs::remove_file(&tmp_path);
            Ok(())
        }
    }
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T, mode: u32) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json, mode)
}

fn bak_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.bak"),
        None => "bak".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_creates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        write_atomic(&path, b"{\"v\":1}", 0o600).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":1}");

        write_atomic(&path, b"{\"v\":2}", 0o600).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}");

        // second write leaves a backup of the first contents
        let bak = path.with_extension("json.bak");
        assert_eq!(fs::read_to_string(&bak).unwrap(), "{\"v\":1}");
    }

    #[cfg(unix)]
    #[test]
    fn write_atomic_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth-profiles.json");
        write_atomic(&path, b"{}", 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
