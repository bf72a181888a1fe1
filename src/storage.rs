//! 存储目录：文件名分配、独占创建与安全路径解析。

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::ErrorKind;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

/// 已独占创建、等待写入的上传目标文件。
#[derive(Debug)]
pub struct AllocatedFile {
    pub name: String,
    pub path: PathBuf,
    pub file: File,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 存储目录不存在时创建它。
    pub async fn ensure_root(&self) -> io::Result<()> {
        if fs::try_exists(&self.root).await? {
            return Ok(());
        }
        info!(path = ?self.root, "storage directory does not exist, creating");
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 探测存储目录，返回第一个未被占用的文件名（冲突时在前面追加 `_`）。
    ///
    /// `desired` 必须是已经过 [`sanitize_file_name`] 处理的单层文件名。
    pub async fn find_free_name(&self, desired: &str) -> io::Result<String> {
        let mut candidate = desired.to_string();
        while entry_exists(&self.root.join(&candidate)).await? {
            candidate.insert(0, '_');
        }
        Ok(candidate)
    }

    /// 分配文件名并以 `create_new` 独占创建，避免并发上传互相覆盖。
    pub async fn create_unique(&self, desired: &str) -> Result<AllocatedFile, StorageError> {
        let mut name = self.find_free_name(desired).await?;
        loop {
            let path = self.root.join(&name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok(AllocatedFile { name, path, file }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!(name = %name, "name taken between probe and create");
                    name = self.find_free_name(&format!("_{name}")).await?;
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
    }

    /// 把请求路径解析到存储目录内的已存在条目；越界或经过符号链接时返回 `InvalidPath`。
    pub async fn resolve_path_checked(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target).await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();

        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(&self, target: &Path) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }
}

/// 只保留客户端提交文件名的最后一段，拒绝无法安全落盘的名字。
pub fn sanitize_file_name(raw: &str) -> Result<String, StorageError> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(StorageError::InvalidPath);
    }
    Ok(base.to_string())
}

async fn entry_exists(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
