//! Change set loading from a migrations directory.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{MigrateError, Result};

/// Extension a file must carry to be treated as a change.
pub const SCRIPT_EXTENSION: &str = ".sql";

/// A single change file: its name (the file name, also the sort key) and the
/// literal script body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub name: String,
    pub body: String,
}

impl ChangeRecord {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// Reads change files from a directory. Read-only.
#[derive(Debug, Clone)]
pub struct ChangeLoader {
    dir: PathBuf,
}

impl ChangeLoader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// The directory this loader reads from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of every change file, sorted, without reading bodies.
    pub fn names(&self) -> Result<BTreeSet<String>> {
        Ok(self.script_files()?.into_iter().map(|(name, _)| name).collect())
    }

    /// Load every change file, ordered by name.
    pub fn load_all(&self) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::new();

        for (name, path) in self.script_files()? {
            let body = fs::read_to_string(&path).map_err(|e| MigrateError::io(&path, e))?;
            records.push(ChangeRecord { name, body });
        }

        debug!(dir = %self.dir.display(), count = records.len(), "Loaded change set");
        Ok(records)
    }

    /// Script files in the directory as (name, path), sorted by name.
    fn script_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| MigrateError::io(&self.dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MigrateError::io(&self.dir, e))?;
            let path = entry.path();

            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(path = %path.display(), "Skipping file with non UTF-8 name");
                continue;
            };

            if !name.ends_with(SCRIPT_EXTENSION) {
                continue;
            }

            let file_type = entry.file_type().map_err(|e| MigrateError::io(&path, e))?;
            // Follow symlinks so linked change files still count
            let is_file = if file_type.is_symlink() {
                fs::metadata(&path)
                    .map_err(|e| MigrateError::io(&path, e))?
                    .is_file()
            } else {
                file_type.is_file()
            };
            if !is_file {
                continue;
            }

            files.push((name.to_string(), path));
        }

        // read_dir order is platform-dependent; execution order is by name
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_empty_directory_yields_no_changes() {
        let tmp = TempDir::new().unwrap();
        let loader = ChangeLoader::new(tmp.path());

        assert!(loader.load_all().unwrap().is_empty());
        assert!(loader.names().unwrap().is_empty());
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let loader = ChangeLoader::new(tmp.path().join("nope"));

        let err = loader.load_all().unwrap_err();
        assert!(matches!(err, MigrateError::Io { .. }));
    }

    #[test]
    fn test_orders_by_name_not_creation_order() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "010_c.sql", "SELECT 3;");
        write(tmp.path(), "002_b.sql", "SELECT 2;");
        write(tmp.path(), "001_a.sql", "SELECT 1;");

        let records = ChangeLoader::new(tmp.path()).load_all().unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["001_a.sql", "002_b.sql", "010_c.sql"]);
        assert_eq!(records[0].body, "SELECT 1;");
    }

    #[test]
    fn test_ignores_other_extensions_and_directories() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "001_a.sql", "SELECT 1;");
        write(tmp.path(), "README.md", "# notes");
        write(tmp.path(), "002_b.sql.bak", "SELECT 2;");
        fs::create_dir(tmp.path().join("003_dir.sql")).unwrap();

        let names = ChangeLoader::new(tmp.path()).names().unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["001_a.sql"]);
    }

    #[test]
    fn test_body_is_kept_verbatim() {
        let tmp = TempDir::new().unwrap();
        let body = "CREATE TABLE t (id INT);\n\n-- trailing comment\nINSERT INTO t VALUES (1);\n";
        write(tmp.path(), "001_t.sql", body);

        let records = ChangeLoader::new(tmp.path()).load_all().unwrap();
        assert_eq!(records, vec![ChangeRecord::new("001_t.sql", body)]);
    }

    #[test]
    fn test_non_utf8_body_is_io_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("001_bin.sql"), [0xff, 0xfe, 0x00]).unwrap();

        let err = ChangeLoader::new(tmp.path()).load_all().unwrap_err();
        match err {
            MigrateError::Io { path, source } => {
                assert!(path.ends_with("001_bin.sql"));
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidData);
            }
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
