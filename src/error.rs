//! 统一错误类型

use thiserror::Error;

/// 文件操作错误分类
///
/// 所有存储后端和上层操作共用这一套错误，调用方按类别处理：
/// 连接/认证失败不在库内重试，交给工作流引擎按调度节奏重试。
#[derive(Debug, Error)]
pub enum FileOpError {
    /// 连接或认证失败
    #[error("连接失败: {0}")]
    Connection(String),

    /// 源文件或路径不存在
    #[error("文件不存在: {0}")]
    NotFound(String),

    /// 目标已存在且未允许覆盖
    #[error("目标已存在: {0}")]
    AlreadyExists(String),

    /// 传输完整性校验失败（实收字节数与协议报告不一致）
    #[error("大小不一致: {path} (期望 {expected} 字节, 实收 {actual} 字节)")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// 路径越出允许范围
    #[error("路径越界: {0}")]
    Security(String),

    /// 配置不完整或不合法
    #[error("配置无效: {0}")]
    Config(String),

    /// 协议层返回的其他错误
    #[error("协议错误: {0}")]
    Protocol(String),

    /// 状态存储读写失败
    #[error("状态存储错误: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FileOpError {
    /// 判断是否为"不存在"类错误，批量操作的容忍策略会用到
    pub fn is_not_found(&self) -> bool {
        matches!(self, FileOpError::NotFound(_))
    }
}

impl From<opendal::Error> for FileOpError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => FileOpError::NotFound(e.to_string()),
            opendal::ErrorKind::AlreadyExists => FileOpError::AlreadyExists(e.to_string()),
            opendal::ErrorKind::PermissionDenied => FileOpError::Connection(e.to_string()),
            _ => FileOpError::Protocol(e.to_string()),
        }
    }
}

impl From<suppaftp::FtpError> for FileOpError {
    fn from(e: suppaftp::FtpError) -> Self {
        use suppaftp::{FtpError, Status};
        match &e {
            FtpError::ConnectionError(_) => FileOpError::Connection(e.to_string()),
            FtpError::SecureError(_) => FileOpError::Connection(e.to_string()),
            FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable => {
                FileOpError::NotFound(e.to_string())
            }
            _ => FileOpError::Protocol(e.to_string()),
        }
    }
}

impl From<russh::Error> for FileOpError {
    fn from(e: russh::Error) -> Self {
        FileOpError::Connection(e.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for FileOpError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error;
        use russh_sftp::protocol::StatusCode;
        // SFTP 状态码里只关心 NoSuchFile，其余归协议错误
        match &e {
            Error::Status(status) if status.status_code == StatusCode::NoSuchFile => {
                FileOpError::NotFound(e.to_string())
            }
            _ => FileOpError::Protocol(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for FileOpError {
    fn from(e: sqlx::Error) -> Self {
        FileOpError::State(e.to_string())
    }
}

impl From<serde_json::Error> for FileOpError {
    fn from(e: serde_json::Error) -> Self {
        FileOpError::State(e.to_string())
    }
}

impl From<regex::Error> for FileOpError {
    fn from(e: regex::Error) -> Self {
        FileOpError::Config(format!("正则表达式无效: {}", e))
    }
}

pub type Result<T, E = FileOpError> = std::result::Result<T, E>;
