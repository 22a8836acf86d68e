pub mod ftp;
pub mod local;
pub mod mount;
pub mod sftp;

use crate::endpoint::{EndpointConfig, Scheme};
use crate::error::{FileOpError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use ftp::FtpStorage;
pub use local::LocalStorage;
pub use mount::MountStorage;
pub use sftp::SftpStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 文件条目
///
/// `path` 相对于连接根目录，统一 `/` 分隔，不携带任何凭据。
/// 由列目录产生，只读使用，不做原地修改。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// 文件名（路径最后一段）
    pub name: String,
    /// 服务端相对路径
    pub path: String,
    pub size: u64,
    /// 修改时间（Unix 毫秒）
    pub modified_millis: i64,
    pub is_dir: bool,
    /// 创建时间（Unix 毫秒），多数协议不提供
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_millis: Option<i64>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub symlink: bool,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64, modified_millis: i64, is_dir: bool) -> Self {
        let path: String = path.into();
        let name = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&path)
            .to_string();
        let hidden = name.starts_with('.');
        Self {
            name,
            path,
            size,
            modified_millis,
            is_dir,
            created_millis: None,
            hidden,
            symlink: false,
        }
    }
}

/// 文件元数据（用于快速检查）
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub size: u64,
    pub modified_millis: i64,
    pub is_dir: bool,
}

/// 存储抽象接口
///
/// 每个协议实现一份，上层传输引擎只依赖这组能力。
/// 路径进出均为服务端相对路径，凭据不越过本层。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 获取文件元数据，不存在返回 None
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>>;

    /// 列出 path 的直接子项（单层），不存在的目录报 NotFound
    async fn children(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// 读取整个文件
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// 读取文件的一部分
    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// 写入整个文件
    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// 删除文件或目录，目标不存在时静默成功
    async fn delete(&self, path: &str) -> Result<()>;

    /// 重命名/移动，目标父目录必须已存在
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// 创建目录（递归）
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 获取存储名称（安全形式，用于日志）
    fn name(&self) -> &str;
}

/// 根据端点配置创建存储实例
///
/// 会话一律单次使用：远端协议在每个操作内部新建并关闭连接，
/// 不做池化，也不跨轮询周期共享。
pub fn create_storage(config: &EndpointConfig) -> Result<Arc<dyn Storage>> {
    match config.scheme {
        Scheme::Local => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| FileOpError::Config("本地存储需要 path".into()))?;
            tracing::debug!("初始化本地存储: {}", path);
            Ok(Arc::new(LocalStorage::new(path)?) as Arc<dyn Storage>)
        }
        Scheme::Ftp | Scheme::Ftps => {
            tracing::debug!("初始化 FTP 存储: {}", config.safe_uri());
            Ok(Arc::new(FtpStorage::new(config)?) as Arc<dyn Storage>)
        }
        Scheme::Sftp => {
            tracing::debug!("初始化 SFTP 存储: {}", config.safe_uri());
            Ok(Arc::new(SftpStorage::new(config)?) as Arc<dyn Storage>)
        }
        Scheme::Smb | Scheme::Nfs => {
            tracing::debug!("初始化挂载存储: {}", config.safe_uri());
            Ok(Arc::new(MountStorage::new(config)?) as Arc<dyn Storage>)
        }
    }
}

/// 规范化服务端相对路径：统一分隔符、去掉首尾多余的 `/`
pub(crate) fn normalize_rel_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim_matches('/')
        .to_string()
}

/// 拼接两段相对路径
pub(crate) fn join_rel(base: &str, name: &str) -> String {
    let base = base.trim_matches('/');
    let name = name.trim_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}
