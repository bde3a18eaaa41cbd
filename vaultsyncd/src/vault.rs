//! Filesystem access for the synced tree. All keys are slash-separated
//! paths relative to the vault root; folder keys carry a trailing
//! separator. Nothing outside the root is ever touched.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use thiserror::Error;

use crate::sync::decision::FolderChangeTimes;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trash error: {0}")]
    Trash(#[from] trash::Error),
    #[error("invalid vault key: {0}")]
    InvalidKey(String),
}

/// One entry from a tree walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub key: String,
    pub is_folder: bool,
    /// Epoch milliseconds; 0 when the filesystem does not provide it.
    pub mtime: i64,
    pub ctime: i64,
    pub size: i64,
}

pub struct LocalVault {
    root: PathBuf,
}

impl LocalVault {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, VaultError> {
        let trimmed = key.trim_end_matches('/');
        if trimmed.is_empty()
            || Path::new(trimmed).is_absolute()
            || trimmed.split('/').any(|part| part == ".." || part.is_empty())
        {
            return Err(VaultError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(trimmed))
    }

    /// Walks the whole tree. The root itself is not an entry.
    pub fn list_all(&self) -> Result<Vec<LocalEntry>, VaultError> {
        let mut out = Vec::new();
        self.walk(&self.root, "", &mut out)?;
        Ok(out)
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<LocalEntry>) -> Result<(), VaultError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                // non-UTF-8 names cannot become keys
                continue;
            };
            let metadata = entry.metadata()?;
            let mtime = metadata.modified().map(system_time_millis).unwrap_or(0);
            let ctime = metadata
                .created()
                .map(system_time_millis)
                .unwrap_or(mtime);
            if metadata.is_dir() {
                let key = format!("{prefix}{name}/");
                out.push(LocalEntry {
                    key: key.clone(),
                    is_folder: true,
                    mtime,
                    ctime,
                    size: 0,
                });
                self.walk(&entry.path(), &key, out)?;
            } else if metadata.is_file() {
                out.push(LocalEntry {
                    key: format!("{prefix}{name}"),
                    is_folder: false,
                    mtime,
                    ctime,
                    size: metadata.len() as i64,
                });
            }
            // symlinks and special files are not synced
        }
        Ok(())
    }

    pub async fn mkdirp(&self, key: &str) -> Result<(), VaultError> {
        let path = self.resolve(key)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool, VaultError> {
        Ok(self.resolve(key)?.exists())
    }

    pub async fn read_file(&self, key: &str) -> Result<Vec<u8>, VaultError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Writes content and restores the remote modification time, so the
    /// next run sees the file as unchanged.
    pub async fn write_file(
        &self,
        key: &str,
        content: &[u8],
        mtime_millis: i64,
    ) -> Result<(), VaultError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        if mtime_millis > 0 {
            let mtime = FileTime::from_unix_time(
                mtime_millis.div_euclid(1000),
                (mtime_millis.rem_euclid(1000) * 1_000_000) as u32,
            );
            filetime::set_file_mtime(&path, mtime)?;
        }
        Ok(())
    }

    /// Moves a file or folder to the system trash; falls back to plain
    /// removal where no trash is available.
    pub fn delete_to_trash(&self, key: &str) -> Result<(), VaultError> {
        let path = self.resolve(key)?;
        if !path.exists() {
            return Ok(());
        }
        if trash::delete(&path).is_ok() {
            return Ok(());
        }
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

impl FolderChangeTimes for LocalVault {
    fn folder_change_time(&self, key: &str) -> Option<i64> {
        let path = self.resolve(key).ok()?;
        let metadata = std::fs::metadata(path).ok()?;
        let mtime = metadata.modified().map(system_time_millis).ok()?;
        // creation time is a capability, not a given
        let ctime = metadata.created().map(system_time_millis).unwrap_or(mtime);
        Some(mtime.max(ctime))
    }
}

fn system_time_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_tree_with_folder_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("notes/sub")).unwrap();
        std::fs::write(dir.path().join("notes/a.md"), b"hello").unwrap();
        std::fs::write(dir.path().join("top.md"), b"x").unwrap();

        let vault = LocalVault::new(dir.path().to_path_buf());
        let mut keys: Vec<String> = vault
            .list_all()
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["notes/", "notes/a.md", "notes/sub/", "top.md"]);

        let entries = vault.list_all().unwrap();
        let file = entries.iter().find(|e| e.key == "notes/a.md").unwrap();
        assert!(!file.is_folder);
        assert_eq!(file.size, 5);
        assert!(file.mtime > 0);
    }

    #[tokio::test]
    async fn write_restores_the_given_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let vault = LocalVault::new(dir.path().to_path_buf());
        vault
            .write_file("sub/new.md", b"content", 1_704_067_200_000)
            .await
            .unwrap();

        assert_eq!(vault.read_file("sub/new.md").await.unwrap(), b"content");
        let metadata = std::fs::metadata(dir.path().join("sub/new.md")).unwrap();
        let mtime = system_time_millis(metadata.modified().unwrap());
        assert_eq!(mtime, 1_704_067_200_000);
    }

    #[tokio::test]
    async fn mkdirp_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let vault = LocalVault::new(dir.path().to_path_buf());
        vault.mkdirp("a/b/c/").await.unwrap();
        vault.mkdirp("a/b/c/").await.unwrap();
        assert!(vault.exists("a/b/c/").unwrap());
    }

    #[test]
    fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let vault = LocalVault::new(dir.path().to_path_buf());
        assert!(matches!(
            vault.exists("../outside.md"),
            Err(VaultError::InvalidKey(_))
        ));
        assert!(matches!(
            vault.exists("/etc/passwd"),
            Err(VaultError::InvalidKey(_))
        ));
    }

    #[test]
    fn folder_change_time_reflects_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let vault = LocalVault::new(dir.path().to_path_buf());
        assert!(vault.folder_change_time("sub/").unwrap() > 0);
        assert!(vault.folder_change_time("missing/").is_none());
    }
}
