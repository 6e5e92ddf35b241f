// Task attachment storage on the local filesystem, one directory per task.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist yet.
    pub async fn init(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Write an attachment for a task and return the stored file name.
    /// Any directory components in `filename` are dropped.
    pub async fn save(&self, task_id: i64, filename: &str, bytes: &[u8]) -> io::Result<String> {
        let name = sanitize_filename(filename).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid attachment file name")
        })?;

        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&name), bytes).await?;
        tracing::debug!(task_id, file = %name, size = bytes.len(), "Attachment stored");
        Ok(name)
    }

    /// Remove every attachment of a task. Missing directories are not an error.
    pub async fn delete(&self, task_id: i64) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.task_dir(task_id)).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn path(&self, task_id: i64, filename: &str) -> PathBuf {
        self.task_dir(task_id).join(filename)
    }

    fn task_dir(&self, task_id: i64) -> PathBuf {
        self.root.join(task_id.to_string())
    }
}

fn sanitize_filename(filename: &str) -> Option<String> {
    let base = filename.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("map.png"), Some("map.png".into()));
        assert_eq!(sanitize_filename("../../etc/passwd"), Some("passwd".into()));
        assert_eq!(sanitize_filename("C:\\tmp\\clue.txt"), Some("clue.txt".into()));
        assert_eq!(sanitize_filename("dir/"), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[tokio::test]
    async fn test_save_path_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let name = store.save(7, "nested/clue.txt", b"look north").await.unwrap();
        assert_eq!(name, "clue.txt");

        let path = store.path(7, &name);
        assert_eq!(path, dir.path().join("7").join("clue.txt"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"look north");

        store.delete(7).await.unwrap();
        assert!(!path.exists());
        // Deleting again is fine
        store.delete(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let err = store.save(1, "", b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
