pub mod pacman;
pub mod plain;

use crate::error::{MirrorError, Result};
use crate::traits::MirrorSource;
use std::path::{Path, PathBuf};

pub const SUPPORTED_FORMATS: &[&str] = &["plain", "pacman"];

pub fn get_source(format: &str, path: PathBuf) -> Result<Box<dyn MirrorSource>> {
    match format.to_lowercase().as_str() {
        "plain" | "yum" => Ok(Box::new(plain::PlainSource::new(path))),
        "pacman" => Ok(Box::new(pacman::PacmanSource::new(path))),
        _ => Err(MirrorError::UnknownFormat(format!(
            "'{}'. Available: {}",
            format,
            SUPPORTED_FORMATS.join(", ")
        ))),
    }
}

/// Repository id for a mirrorlist file: its file stem.
pub fn repo_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_source() {
        assert_eq!(get_source("plain", PathBuf::from("a")).unwrap().name(), "plain");
        assert_eq!(get_source("Pacman", PathBuf::from("a")).unwrap().name(), "pacman");
        assert!(matches!(
            get_source("apt", PathBuf::from("a")),
            Err(MirrorError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_repo_id() {
        assert_eq!(repo_id(Path::new("/etc/yum.repos.d/fedora.mirrorlist")), "fedora");
        assert_eq!(repo_id(Path::new("mirrorlist")), "mirrorlist");
    }
}
