//! Filesystem helpers for the `.govengine/` state directory.

use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `.govengine/config.yaml` or `.govengine/process.yaml` in one step.
///
/// The YAML is written to a sibling tempfile and renamed over `path`, so a
/// reader sees either the previous document or the new one.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            parent
        }
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create the state directory (and parents) if absent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".govengine/process.yaml");
        atomic_write(&path, b"name: p").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "name: p");
    }

    #[test]
    fn atomic_write_replaces_existing_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".govengine/config.yaml");
        atomic_write(&path, b"engine_guid: a").unwrap();
        atomic_write(&path, b"engine_guid: b").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "engine_guid: b");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
