//! 沙箱文件系统
//!
//! SafeFs 绑定 root，所有路径先做词法归一化（禁止 `..` 越界、`~`、根外绝对路径），
//! 再对已存在的最近祖先做 canonicalize，防止符号链接逃逸。写操作覆盖前备份为 `<name>.backup`。

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::core::ErrorKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("File too large: {path} is {size} bytes (limit {limit})")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error("IO error on {path}: {message}")]
    Io { path: String, message: String },
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::InvalidPath(_) | FsError::PathEscape(_) => ErrorKind::ValidationRejected,
            FsError::TooLarge { .. } => ErrorKind::ResourceLimit,
            FsError::NotFound(_) | FsError::Io { .. } => ErrorKind::ExecutionFailed,
        }
    }
}

fn io_err(path: &Path, e: io::Error) -> FsError {
    let shown = path.display().to_string();
    if e.kind() == io::ErrorKind::NotFound {
        FsError::NotFound(shown)
    } else {
        FsError::Io {
            path: shown,
            message: e.to_string(),
        }
    }
}

/// 写操作结果
#[derive(Debug, Clone, PartialEq)]
pub struct FileWrite {
    pub path: PathBuf,
    pub bytes: usize,
    pub backup: Option<PathBuf>,
}

/// 沙箱文件系统：绑定根目录，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root: PathBuf,
    max_file_bytes: u64,
}

impl SafeFs {
    pub fn new(root: impl AsRef<Path>, max_file_bytes: u64) -> Self {
        let root = root.as_ref().to_path_buf();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            max_file_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// 词法解析，不访问文件系统
    pub fn resolve_lexical(&self, raw: &str) -> Result<PathBuf, FsError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FsError::InvalidPath("empty path".to_string()));
        }
        if raw.starts_with('~') || raw.contains('\0') {
            return Err(FsError::PathEscape(raw.to_string()));
        }
        let candidate = Path::new(raw);
        let relative = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.root)
                .map_err(|_| FsError::PathEscape(raw.to_string()))?
        } else {
            candidate
        };

        let mut parts: Vec<OsString> = Vec::new();
        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => parts.push(part.to_os_string()),
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(FsError::PathEscape(raw.to_string())); // 如 ../../etc/passwd
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::PathEscape(raw.to_string()));
                }
            }
        }
        let mut resolved = self.root.clone();
        resolved.extend(parts);
        Ok(resolved)
    }

    /// 词法解析 + 符号链接检查
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, FsError> {
        let lexical = self.resolve_lexical(raw)?;
        let existing = lexical.ancestors().find(|p| p.exists());
        if let Some(canonical) = existing.and_then(|p| p.canonicalize().ok()) {
            if !canonical.starts_with(&self.root) {
                return Err(FsError::PathEscape(raw.to_string()));
            }
        }
        Ok(lexical)
    }

    fn check_size(&self, path: &str, size: u64) -> Result<(), FsError> {
        if size > self.max_file_bytes {
            return Err(FsError::TooLarge {
                path: path.to_string(),
                size,
                limit: self.max_file_bytes,
            });
        }
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<String, FsError> {
        let resolved = self.resolve(path)?;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| io_err(&resolved, e))?;
        self.check_size(path, meta.len())?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_err(&resolved, e))
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let base = if path.trim().is_empty() || path.trim() == "." {
            self.root.clone()
        } else {
            self.resolve(path)?
        };
        let mut reader = tokio::fs::read_dir(&base)
            .await
            .map_err(|e| io_err(&base, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_err(&base, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        Ok(entries)
    }

    /// 创建文件（自动创建父目录）；已存在时先备份
    pub async fn create_file(&self, path: &str, content: &str) -> Result<FileWrite, FsError> {
        self.check_size(path, content.len() as u64)?;
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        self.write_with_backup(resolved, content).await
    }

    /// 修改已存在的文件，先备份
    pub async fn edit_file(&self, path: &str, content: &str) -> Result<FileWrite, FsError> {
        self.check_size(path, content.len() as u64)?;
        let resolved = self.resolve(path)?;
        if !tokio::fs::try_exists(&resolved).await.unwrap_or(false) {
            return Err(FsError::NotFound(path.to_string()));
        }
        self.write_with_backup(resolved, content).await
    }

    async fn write_with_backup(&self, path: PathBuf, content: &str) -> Result<FileWrite, FsError> {
        let backup = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let backup = backup_path(&path);
            tokio::fs::copy(&path, &backup)
                .await
                .map_err(|e| io_err(&backup, e))?;
            Some(backup)
        } else {
            None
        };
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_err(&path, e))?;
        Ok(FileWrite {
            path,
            bytes: content.len(),
            backup,
        })
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".backup");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_in(dir: &tempfile::TempDir) -> SafeFs {
        SafeFs::new(dir.path(), 1024)
    }

    #[test]
    fn test_lexical_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_in(&dir);
        assert!(matches!(fs.resolve_lexical("../secret"), Err(FsError::PathEscape(_))));
        assert!(matches!(fs.resolve_lexical("a/../../b"), Err(FsError::PathEscape(_))));
        assert!(matches!(fs.resolve_lexical("/etc/passwd"), Err(FsError::PathEscape(_))));
        assert!(matches!(fs.resolve_lexical("~/.ssh/id_rsa"), Err(FsError::PathEscape(_))));
        assert!(matches!(fs.resolve_lexical("  "), Err(FsError::InvalidPath(_))));
        assert_eq!(fs.resolve_lexical("a/./b/../c.txt").unwrap(), fs.root().join("a/c.txt"));
        let inside = fs.root().join("x.txt");
        assert_eq!(fs.resolve_lexical(inside.to_str().unwrap()).unwrap(), inside);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let fs = fs_in(&dir);
        assert!(matches!(fs.resolve("link/file.txt"), Err(FsError::PathEscape(_))));
    }

    #[tokio::test]
    async fn test_create_then_edit_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_in(&dir);
        let first = fs.create_file("notes/out.txt", "hello").await.unwrap();
        assert_eq!(first.backup, None);
        assert_eq!(fs.read_file("notes/out.txt").await.unwrap(), "hello");

        let second = fs.edit_file("notes/out.txt", "world").await.unwrap();
        let backup = second.backup.unwrap();
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "hello");
        assert_eq!(fs.read_file("notes/out.txt").await.unwrap(), "world");
        assert_eq!(fs.list_dir(".").await.unwrap(), vec!["notes/".to_string()]);
    }

    #[tokio::test]
    async fn test_edit_missing_and_oversize() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_in(&dir);
        assert!(matches!(fs.edit_file("nope.txt", "x").await, Err(FsError::NotFound(_))));
        let big = "x".repeat(2048);
        let err = fs.create_file("big.txt", &big).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    }
}
