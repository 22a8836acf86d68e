use super::{join_rel, FileEntry, FileMeta, Storage};
use crate::error::{FileOpError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use walkdir::WalkDir;

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("file://{}", path);
        Ok(Self { base_path, name })
    }

    /// 解析相对路径，拒绝任何试图越出根目录的写法
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let rel = path.replace('\\', "/");
        let rel = rel.trim_start_matches('/');
        let candidate = Path::new(rel);
        for comp in candidate.components() {
            if matches!(comp, Component::ParentDir) {
                return Err(FileOpError::Security(format!("路径包含上级引用: {}", path)));
            }
        }
        if rel.is_empty() {
            Ok(self.base_path.clone())
        } else {
            Ok(self.base_path.join(rel))
        }
    }

    fn meta_from(metadata: &std::fs::Metadata) -> FileMeta {
        FileMeta {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified_millis: Self::millis(metadata.modified().ok()),
            is_dir: metadata.is_dir(),
        }
    }

    fn millis(time: Option<std::time::SystemTime>) -> i64 {
        time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        let full_path = self.resolve_path(path)?;
        match fs::metadata(&full_path).await {
            Ok(metadata) => Ok(Some(Self::meta_from(&metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = self.resolve_path(path)?;
        if !dir.exists() {
            return Err(FileOpError::NotFound(path.to_string()));
        }
        let rel_base = path.trim_matches('/').to_string();

        // 使用 spawn_blocking 避免阻塞 async runtime；
        // 单层遍历按文件名排序，保证列表顺序确定
        let entries: Vec<FileEntry> = tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter_map(|entry| {
                    let name = entry.file_name().to_str()?.to_string();
                    let metadata = entry.metadata().ok()?;
                    let symlink = entry.path_is_symlink();
                    let mut fe = FileEntry::new(
                        join_rel(&rel_base, &name),
                        if metadata.is_dir() { 0 } else { metadata.len() },
                        Self::millis(metadata.modified().ok()),
                        metadata.is_dir(),
                    );
                    fe.created_millis = metadata.created().ok().map(|t| Self::millis(Some(t)));
                    fe.symlink = symlink;
                    Some(fe)
                })
                .collect()
        })
        .await
        .map_err(|e| FileOpError::Protocol(format!("遍历任务失败: {}", e)))?;

        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(path)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FileOpError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(path)?;
        let mut file = fs::File::open(&full_path).await?;

        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; length as usize];
        match file.read_exact(&mut buffer).await {
            Ok(_) => Ok(buffer),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // 剩余内容不足 length，读到哪里算哪里
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer).await?;
                Ok(buffer)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 临时文件写入后原子重命名
        let temp_path = full_path.with_extension("tmp");
        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, &full_path).await?;

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        if !full_path.exists() {
            return Ok(());
        }

        if full_path.is_dir() {
            fs::remove_dir_all(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
        }

        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.resolve_path(from)?;
        let to_path = self.resolve_path(to)?;
        if !from_path.exists() {
            return Err(FileOpError::NotFound(from.to_string()));
        }
        fs::rename(&from_path, &to_path).await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parent_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_str().unwrap()).unwrap();
        let err = storage.read("../outside.txt").await.unwrap_err();
        assert!(matches!(err, FileOpError::Security(_)));
    }

    #[tokio::test]
    async fn test_children_sorted_single_level() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_str().unwrap()).unwrap();
        storage.write("b.txt", b"b".to_vec()).await.unwrap();
        storage.write("a.txt", b"a".to_vec()).await.unwrap();
        storage.write("sub/c.txt", b"c".to_vec()).await.unwrap();

        let children = storage.children("").await.unwrap();
        let names: Vec<_> = children.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert!(children[2].is_dir);
    }
}
