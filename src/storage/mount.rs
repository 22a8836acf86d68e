use super::{join_rel, normalize_rel_path, FileEntry, FileMeta, Storage};
use crate::endpoint::EndpointConfig;
use crate::error::{FileOpError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::path::Path;
use std::time::Duration;

/// SMB/NFS 挂载存储
///
/// 协议本身由内核客户端承担，这里只消费挂载点之下的文件能力。
/// host/share 仅参与地址展示，实际 IO 全部落在 mount_root。
#[derive(Debug)]
pub struct MountStorage {
    operator: Operator,
    name: String,
}

impl MountStorage {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        use opendal::services::Fs;

        let mount_root = config
            .mount_root
            .as_deref()
            .ok_or_else(|| {
                FileOpError::Config(format!("{} 端点缺少 mountRoot", config.scheme.as_str()))
            })?;

        // 挂载点不存在视为存储不可达，而不是配置问题
        if !Path::new(mount_root).is_dir() {
            return Err(FileOpError::Connection(format!(
                "挂载点不可用: {}",
                mount_root
            )));
        }

        let root = config
            .root
            .as_deref()
            .map(|r| format!("{}/{}", mount_root.trim_end_matches('/'), r.trim_matches('/')))
            .unwrap_or_else(|| mount_root.to_string());

        let builder = Fs::default().root(&root);

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(config.options.connect_timeout_secs))
                    .with_io_timeout(Duration::from_secs(config.options.read_timeout_secs)),
            )
            .finish();

        Ok(Self {
            operator,
            name: config.safe_uri(),
        })
    }

    /// opendal 的目录路径要求以 / 结尾
    fn dir_path(path: &str) -> String {
        let rel = normalize_rel_path(path);
        if rel.is_empty() {
            String::new()
        } else {
            format!("{}/", rel)
        }
    }

    fn millis(meta: &opendal::Metadata) -> i64 {
        meta.last_modified()
            .map(|t| t.timestamp_millis())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Storage for MountStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        let rel = normalize_rel_path(path);
        match self.operator.stat(&rel).await {
            Ok(meta) => Ok(Some(FileMeta {
                size: meta.content_length(),
                modified_millis: Self::millis(&meta),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                // 目录可能需要带斜杠重试
                match self.operator.stat(&Self::dir_path(path)).await {
                    Ok(meta) => Ok(Some(FileMeta {
                        size: 0,
                        modified_millis: Self::millis(&meta),
                        is_dir: true,
                    })),
                    Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = Self::dir_path(path);
        if !dir.is_empty() && self.stat(path).await?.is_none() {
            return Err(FileOpError::NotFound(path.to_string()));
        }
        let rel_base = normalize_rel_path(path);

        let mut lister = self
            .operator
            .lister_with(&dir)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await?;

        let mut entries = Vec::new();
        while let Some(entry) = lister.try_next().await? {
            let path_str = entry.path().to_string();
            // 跳过列出的目录本身
            if path_str.is_empty() || path_str == dir || path_str == "/" {
                continue;
            }
            let meta = entry.metadata();
            let name = path_str
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("")
                .to_string();
            if name.is_empty() {
                continue;
            }
            entries.push(FileEntry::new(
                join_rel(&rel_base, &name),
                if meta.is_dir() { 0 } else { meta.content_length() },
                Self::millis(meta),
                meta.is_dir(),
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let data = self.operator.read(&normalize_rel_path(path)).await?;
        Ok(data.to_vec())
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let data = self
            .operator
            .read_with(&normalize_rel_path(path))
            .range(offset..offset + length)
            .await?;
        Ok(data.to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let rel = normalize_rel_path(path);
        // 确保父目录存在
        if let Some(pos) = rel.rfind('/') {
            self.operator.create_dir(&format!("{}/", &rel[..pos])).await?;
        }
        self.operator.write(&rel, data).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let rel = normalize_rel_path(path);
        match self.operator.remove_all(&rel).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_rel = normalize_rel_path(from);
        let to_rel = normalize_rel_path(to);
        match self.operator.rename(&from_rel, &to_rel).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                Err(FileOpError::NotFound(from.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.operator.create_dir(&Self::dir_path(path)).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ProtocolOptions, Scheme};

    fn config(mount: &str) -> EndpointConfig {
        EndpointConfig {
            scheme: Scheme::Smb,
            host: Some("nas.local".into()),
            port: None,
            username: None,
            password: None,
            path: None,
            mount_root: Some(mount.into()),
            share: Some("archive".into()),
            root: None,
            options: ProtocolOptions::default(),
        }
    }

    #[test]
    fn test_missing_mount_is_connection_error() {
        let err = MountStorage::new(&config("/definitely/not/mounted")).unwrap_err();
        assert!(matches!(err, FileOpError::Connection(_)));
    }

    #[tokio::test]
    async fn test_roundtrip_on_mount() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MountStorage::new(&config(dir.path().to_str().unwrap())).unwrap();
        assert_eq!(storage.name(), "smb://nas.local/archive");

        storage.write("in/a.txt", b"hello".to_vec()).await.unwrap();
        let meta = storage.stat("in/a.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert!(!meta.is_dir);

        let children = storage.children("in").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path, "in/a.txt");

        storage.delete("in/a.txt").await.unwrap();
        assert!(storage.stat("in/a.txt").await.unwrap().is_none());
        // 再删一次不报错
        storage.delete("in/a.txt").await.unwrap();
    }
}
