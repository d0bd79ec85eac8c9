//! Local file-tree backend.
//!
//! Key `a/b/c` lives at `<root>/a/b/_c`. The underscore keeps leaf files
//! apart from directories of the same name, so `a/b` and `a/b/c` can
//! coexist. Writes go to a dot-prefixed temporary file and are renamed into
//! place.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Backend, Capabilities, RetryPolicy};
use crate::error::{BackendError, Result, SealvaultError};

const LEAF_PREFIX: &str = "_";
const TEMP_PREFIX: &str = ".";

/// Backend storing one file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
    retry: RetryPolicy,
}

impl FileBackend {
    /// Open (creating if needed) a file tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, retry })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate(key: &str) -> Result<Vec<&str>> {
        let parts: Vec<&str> = key.split('/').collect();
        let bad = parts
            .iter()
            .any(|p| p.is_empty() || *p == "." || *p == ".." || p.contains('\\'));
        if bad {
            return Err(SealvaultError::InvalidParameters(format!("invalid key: {}", key)));
        }
        Ok(parts)
    }

    /// Directory holding the key, and the leaf file path.
    fn locate(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        let parts = Self::validate(key)?;
        let (leaf, dirs) = parts.split_last().ok_or_else(|| {
            SealvaultError::InvalidParameters("empty key".into())
        })?;
        let mut dir = self.root.clone();
        dir.extend(dirs);
        let file = dir.join(format!("{}{}", LEAF_PREFIX, leaf));
        Ok((dir, file))
    }

    /// Remove now-empty directories from `dir` up to, not including, root.
    fn prune(&self, mut dir: &Path) {
        while dir != self.root && dir.starts_with(&self.root) {
            if fs::remove_dir(dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }
}

impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (_, file) = self.locate(key)?;
        self.retry.run("file.get", || match fs::read(&file) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::from(e)),
        })
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let (dir, file) = self.locate(key)?;
        let leaf = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = dir.join(format!("{}{}.tmp", TEMP_PREFIX, leaf));

        self.retry.run("file.put", || {
            fs::create_dir_all(&dir)?;
            let mut f = fs::File::create(&temp)?;
            f.write_all(value)?;
            f.sync_all()?;
            fs::rename(&temp, &file)?;
            Ok(())
        })?;
        debug!(key, bytes = value.len(), "file backend wrote entry");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let (dir, file) = self.locate(key)?;
        self.retry.run("file.delete", || match fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::from(e)),
        })?;
        self.prune(&dir);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let trimmed = prefix.trim_end_matches('/');
        let dir = if trimmed.is_empty() {
            self.root.clone()
        } else {
            let parts = Self::validate(trimmed)?;
            let mut dir = self.root.clone();
            dir.extend(parts);
            dir
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() {
                children.push(format!("{}/", name));
            } else if name.starts_with(TEMP_PREFIX) {
                // An in-flight write.
                continue;
            } else if let Some(leaf) = name.strip_prefix(LEAF_PREFIX) {
                children.push(leaf.to_string());
            }
        }
        children.sort();
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, FileBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), RetryPolicy::none()).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_put_get_list_delete() {
        let (_dir, backend) = backend();

        backend.put("secret/foo", b"a").unwrap();
        backend.put("secret/foo/nested", b"b").unwrap();
        backend.put("core/keyring", b"c").unwrap();

        assert_eq!(backend.get("secret/foo").unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(backend.list("").unwrap(), vec!["core/", "secret/"]);
        assert_eq!(backend.list("secret/").unwrap(), vec!["foo", "foo/"]);

        backend.delete("secret/foo/nested").unwrap();
        backend.delete("secret/foo/nested").unwrap();
        assert_eq!(backend.list("secret/").unwrap(), vec!["foo"]);
        assert_eq!(backend.get("secret/foo/nested").unwrap(), None);
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, backend) = backend();
        assert!(matches!(
            backend.put("../escape", b"x"),
            Err(SealvaultError::InvalidParameters(_))
        ));
        assert!(backend.get("a//b").is_err());
    }

    #[test]
    fn test_lists_dot_directories_but_not_temp_files() {
        let (dir, backend) = backend();
        backend.put("x/.hidden/y", b"1").unwrap();
        backend.put("x/.dotleaf", b"2").unwrap();
        fs::write(dir.path().join("x").join("._pending.tmp"), b"partial").unwrap();

        assert_eq!(backend.list("x/").unwrap(), vec![".dotleaf", ".hidden/"]);
        assert_eq!(backend.list("x/.hidden/").unwrap(), vec!["y"]);
    }

    #[test]
    fn test_survives_reopen() {
        let (dir, backend) = backend();
        backend.put("k", b"v").unwrap();
        drop(backend);

        let reopened = FileBackend::new(dir.path(), RetryPolicy::none()).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }
}
