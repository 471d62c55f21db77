use crate::error::{GovError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const GOVENGINE_DIR: &str = ".govengine";
pub const SCRIPTS_DIR: &str = ".govengine/scripts";

pub const CONFIG_FILE: &str = ".govengine/config.yaml";
pub const PROCESS_FILE: &str = ".govengine/process.yaml";
pub const REPOSITORY_FILE: &str = ".govengine/repository.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn govengine_dir(root: &Path) -> PathBuf {
    root.join(GOVENGINE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn process_path(root: &Path) -> PathBuf {
    root.join(PROCESS_FILE)
}

pub fn repository_path(root: &Path) -> PathBuf {
    root.join(REPOSITORY_FILE)
}

pub fn scripts_dir(root: &Path) -> PathBuf {
    root.join(SCRIPTS_DIR)
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:\-]*$").unwrap())
}

/// Service names and request types: ASCII word characters plus `. _ : -`,
/// starting alphanumeric, at most 128 bytes.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 || !name_re().is_match(name) {
        return Err(GovError::invalid(format!("invalid {kind} '{name}'")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["scan-asset", "a", "infer.schema", "Quality_Check:v2"] {
            validate_name("request type", name)
                .unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["", "-starts-with-dash", "has spaces", "semi;colon", "slash/ed"] {
            assert!(
                validate_name("request type", name).is_err(),
                "expected invalid: {name}"
            );
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.govengine/config.yaml")
        );
        assert_eq!(
            repository_path(root),
            PathBuf::from("/tmp/proj/.govengine/repository.redb")
        );
        assert_eq!(
            process_path(root),
            PathBuf::from("/tmp/proj/.govengine/process.yaml")
        );
    }
}
