//! Extracting archive members onto the filesystem.

use std::fs;
use std::io::{Read, Seek};
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::reader::MarReader;
use crate::MarError;

/// Extracts every member below `dest`, creating parent directories as
/// needed and applying the stored permission bits.
pub fn extract_all<R: Read + Seek>(
    reader: &mut MarReader<R>,
    dest: &Path,
) -> Result<(), MarError> {
    let entries = reader.entries().to_vec();
    for entry in entries {
        let path = safe_join(dest, &entry.name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&path)?;
        let written = reader.extract_entry(&entry, &mut out)?;
        debug!("extracted {} ({} bytes)", entry.name, written);
        set_mode(&path, entry.mode)?;
    }
    Ok(())
}

/// Joins a member name onto `base`, refusing names that would land
/// outside it: absolute paths, `..` traversal, empty components.
pub fn safe_join(base: &Path, name: &str) -> Result<PathBuf, MarError> {
    let rel = Path::new(name);
    let plain = !name.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(MarError::UnsafeName(name.to_string()));
    }
    Ok(base.join(rel))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    // Only the permission bits survive extraction.
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
