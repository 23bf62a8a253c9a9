use std::path::{Path, PathBuf};

use crate::error::ScriptError;

/// The two fixed fixture folders, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScriptGroup {
    /// Schema and table definitions.
    Create,
    /// Data insertion.
    Insert,
}

impl ScriptGroup {
    pub const ALL: [ScriptGroup; 2] = [ScriptGroup::Create, ScriptGroup::Insert];

    pub fn dir_name(self) -> &'static str {
        match self {
            ScriptGroup::Create => "create",
            ScriptGroup::Insert => "insert",
        }
    }
}

impl std::fmt::Display for ScriptGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One discovered fixture file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureScript {
    pub group: ScriptGroup,
    pub path: PathBuf,
}

/// List every fixture under `root` in execution order.
///
/// A missing group folder contributes nothing. Only regular files directly
/// inside a folder whose extension is exactly `sql` are picked up.
pub fn discover(root: &Path) -> Result<Vec<FixtureScript>, ScriptError> {
    let mut scripts = Vec::new();
    for group in ScriptGroup::ALL {
        scripts.extend(
            discover_group(&root.join(group.dir_name()))?
                .into_iter()
                .map(|path| FixtureScript { group, path }),
        );
    }
    Ok(scripts)
}

fn discover_group(dir: &Path) -> Result<Vec<PathBuf>, ScriptError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "Fixture folder absent");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(ScriptError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ScriptError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_file = entry
            .file_type()
            .map(|t| t.is_file())
            .map_err(|source| ScriptError::Io {
                path: path.clone(),
                source,
            })?;
        if is_file && path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }

    // Byte-wise filename order, independent of directory iteration order.
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_order_and_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let create = dir.path().join("create");
        let insert = dir.path().join("insert");
        fs::create_dir_all(create.join("nested")).unwrap();
        fs::create_dir_all(&insert).unwrap();

        fs::write(create.join("010_tables.sql"), "").unwrap();
        fs::write(create.join("002_schema.sql"), "").unwrap();
        fs::write(create.join("notes.txt"), "").unwrap();
        fs::write(create.join("nested/000_hidden.sql"), "").unwrap();
        fs::write(insert.join("001_rows.sql"), "").unwrap();

        let names: Vec<_> = discover(dir.path())
            .unwrap()
            .into_iter()
            .map(|s| {
                format!(
                    "{}/{}",
                    s.group,
                    s.path.file_name().unwrap().to_string_lossy()
                )
            })
            .collect();

        assert_eq!(
            names,
            vec![
                "create/002_schema.sql",
                "create/010_tables.sql",
                "insert/001_rows.sql",
            ]
        );
    }

    #[test]
    fn test_only_insert_folder_present() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("insert")).unwrap();
        fs::write(dir.path().join("insert/a.sql"), "").unwrap();

        let scripts = discover(dir.path()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].group, ScriptGroup::Insert);
    }
}
