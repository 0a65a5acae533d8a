//! Temporary migrations directories.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A migrations directory inside a temp dir, removed on Drop.
pub struct MigrationsDir {
    _tmp: TempDir,
    path: PathBuf,
}

impl MigrationsDir {
    /// Create an empty `migrations/` directory.
    pub fn new() -> Result<Self> {
        let tmp = TempDir::new().context("Failed to create temp dir")?;
        let path = tmp.path().join("migrations");
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self { _tmp: tmp, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write (or overwrite) a change file.
    pub fn write(&self, name: &str, body: &str) -> Result<()> {
        let file = self.path.join(name);
        fs::write(&file, body).with_context(|| format!("Failed to write {}", file.display()))
    }

    /// Delete a change file.
    pub fn remove(&self, name: &str) -> Result<()> {
        let file = self.path.join(name);
        fs::remove_file(&file).with_context(|| format!("Failed to remove {}", file.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_remove() {
        let dir = MigrationsDir::new().unwrap();
        assert!(dir.path().is_dir());

        dir.write("001_a.sql", "SELECT 1;").unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("001_a.sql")).unwrap(),
            "SELECT 1;"
        );

        dir.remove("001_a.sql").unwrap();
        assert!(!dir.path().join("001_a.sql").exists());
        assert!(dir.remove("001_a.sql").is_err());
    }
}
