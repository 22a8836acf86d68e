//! filebridge - 工作流任务的统一文件操作与变更监听
//!
//! 两块核心能力：
//! - 通用远程文件操作：FTP/FTPS/SFTP/SMB/NFS/本地磁盘统一成一套
//!   列表/下载/上传/移动/删除契约，路径、凭据、错误语义一致；
//! - 有状态变更轮询：监听远端目录，按 创建/更新 策略触发事件，
//!   借助外部持久化的版本状态保证同一语义事件至多触发一次，
//!   重启可恢复，过期条目按 TTL 清理。
//!
//! 协议线缆实现由客户端库承担（suppaftp、russh/russh-sftp、内核
//! 挂载客户端），本库只消费它们的能力集。调度节奏、重试与执行
//! 记录属于宿主工作流引擎。

pub mod endpoint;
pub mod error;
pub mod logging;
pub mod ops;
pub mod storage;
pub mod trigger;

pub use endpoint::{EndpointConfig, ProtocolOptions, Scheme};
pub use error::FileOpError;
pub use ops::{
    ActionReport, ActionRunner, BatchSummary, DeleteResult, DownloadOptions, DownloadResult,
    FileOperator, ListOptions, MoveResult, PostAction, UploadResult,
};
pub use storage::{create_storage, FileEntry, FileMeta, Storage};
pub use trigger::{
    default_state_key, ChangeOn, ChangeType, ChangedFile, FilePoller, JsonStateStore,
    MemoryStateStore, SqliteStateStore, StateStore, TriggerEvent, VersionEntry, WatchConfig,
};
