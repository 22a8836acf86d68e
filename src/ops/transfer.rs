//! 通用传输操作 - 列表/下载/上传/移动/删除
//!
//! 只依赖 Storage 能力集，不感知具体协议。批量变体保持逐文件
//! 顺序执行，失败语义与单文件操作一致。

use crate::endpoint::EndpointConfig;
use crate::error::{FileOpError, Result};
use crate::storage::{create_storage, join_rel, FileEntry, Storage};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 列表参数
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// 起始目录（服务端相对路径）
    pub path: String,
    /// 完整匹配的正则，作用于服务端相对路径
    pub pattern: Option<String>,
    pub recursive: bool,
    /// 结果上限，超出部分按遍历顺序截断
    pub max_files: Option<usize>,
}

impl ListOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pattern: None,
            recursive: false,
            max_files: None,
        }
    }
}

/// 下载参数
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// 暂存目录，下载文件落在这里
    pub staging_dir: PathBuf,
    /// 空文件是否视为失败
    pub fail_on_empty: bool,
}

impl DownloadOptions {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            fail_on_empty: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// 来源安全地址
    pub from: String,
    /// 本地暂存路径
    pub to: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub uri: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct MoveResult {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct DeleteResult {
    pub uri: String,
    pub deleted: bool,
}

/// 批量操作统计
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub bytes: u64,
}

impl BatchSummary {
    pub fn from_downloads(results: &[DownloadResult]) -> Self {
        Self {
            total: results.len(),
            bytes: results.iter().map(|r| r.size).sum(),
        }
    }

    pub fn from_uploads(results: &[UploadResult]) -> Self {
        Self {
            total: results.len(),
            bytes: results.iter().map(|r| r.size).sum(),
        }
    }
}

/// 把用户正则锚定成完整匹配
fn compile_full_match(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

/// 文件操作器
///
/// 持有一个端点的存储实例；操作内部不重试，也不并行，
/// 需要并发的调用方自行扇出并控制并行度。
pub struct FileOperator {
    storage: Arc<dyn Storage>,
    endpoint: EndpointConfig,
}

impl FileOperator {
    pub fn new(endpoint: &EndpointConfig) -> Result<Self> {
        let storage = create_storage(endpoint)?;
        Ok(Self {
            storage,
            endpoint: endpoint.clone(),
        })
    }

    /// 用现成的存储实例构造（测试和自定义后端用）
    pub fn from_parts(storage: Arc<dyn Storage>, endpoint: EndpointConfig) -> Self {
        Self { storage, endpoint }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    // ============ List ============

    /// 遍历目录并返回终端文件列表
    ///
    /// 目录本身永远不出现在结果里，但递归模式下会继续向下走。
    /// 顺序规则：每层子项按名称排序、深度优先，保证多次列表结果可比。
    /// 过滤顺序固定为：正则过滤 -> 截断。
    pub async fn list(&self, opts: &ListOptions) -> Result<Vec<FileEntry>> {
        let matcher = opts
            .pattern
            .as_deref()
            .map(compile_full_match)
            .transpose()?;

        let root_meta = self
            .storage
            .stat(&opts.path)
            .await?
            .ok_or_else(|| FileOpError::NotFound(self.endpoint.safe_uri_for(&opts.path)))?;

        let mut matched = Vec::new();

        if !root_meta.is_dir {
            // 起点直接是文件：按单条候选处理
            let entry = FileEntry::new(
                opts.path.trim_matches('/').to_string(),
                root_meta.size,
                root_meta.modified_millis,
                false,
            );
            if Self::matches(&matcher, &entry) {
                matched.push(entry);
            }
        } else {
            self.walk(&opts.path, opts.recursive, &matcher, &mut matched)
                .await?;
        }

        if let Some(max) = opts.max_files {
            if matched.len() > max {
                warn!(
                    "列表结果超出上限，截断 {} -> {}: {}",
                    matched.len(),
                    max,
                    self.endpoint.safe_uri_for(&opts.path)
                );
                matched.truncate(max);
            }
        }

        debug!(
            "列表完成: {} ({} 个文件)",
            self.endpoint.safe_uri_for(&opts.path),
            matched.len()
        );
        Ok(matched)
    }

    fn matches(matcher: &Option<Regex>, entry: &FileEntry) -> bool {
        matcher
            .as_ref()
            .map(|re| re.is_match(&entry.path))
            .unwrap_or(true)
    }

    /// 深度优先遍历，children 已按名称排序
    fn walk<'a>(
        &'a self,
        dir: &'a str,
        recursive: bool,
        matcher: &'a Option<Regex>,
        out: &'a mut Vec<FileEntry>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let children = self.storage.children(dir).await?;
            for child in children {
                if child.is_dir {
                    if recursive && !child.symlink {
                        let sub = child.path.clone();
                        self.walk(&sub, recursive, matcher, out).await?;
                    }
                    continue;
                }
                if Self::matches(matcher, &child) {
                    out.push(child);
                }
            }
            Ok(())
        })
    }

    // ============ Download ============

    /// 下载单个文件到暂存目录
    ///
    /// 协议报告了内容长度时校验实收字节数，不一致报 SizeMismatch。
    pub async fn download(&self, path: &str, opts: &DownloadOptions) -> Result<DownloadResult> {
        let safe = self.endpoint.safe_uri_for(path);
        let meta = self
            .storage
            .stat(path)
            .await?
            .ok_or_else(|| FileOpError::NotFound(safe.clone()))?;
        if meta.is_dir {
            return Err(FileOpError::Protocol(format!("不能下载目录: {}", safe)));
        }

        let data = self.storage.read(path).await?;

        if meta.size > 0 && data.len() as u64 != meta.size {
            return Err(FileOpError::SizeMismatch {
                path: safe,
                expected: meta.size,
                actual: data.len() as u64,
            });
        }
        if data.is_empty() && opts.fail_on_empty {
            return Err(FileOpError::Protocol(format!("下载内容为空: {}", safe)));
        }

        tokio::fs::create_dir_all(&opts.staging_dir).await?;
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let local_name = format!("{}-{}", uuid::Uuid::new_v4().simple(), file_name);
        let local_path = opts.staging_dir.join(local_name);

        let size = data.len() as u64;
        tokio::fs::write(&local_path, data).await?;

        info!("下载完成: {} -> {:?} ({} 字节)", safe, local_path, size);
        Ok(DownloadResult {
            from: safe,
            to: local_path,
            size,
        })
    }

    /// 批量下载，顺序执行，任一文件失败即中止
    pub async fn download_many(
        &self,
        entries: &[FileEntry],
        opts: &DownloadOptions,
    ) -> Result<Vec<DownloadResult>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.download(&entry.path, opts).await?);
        }
        Ok(results)
    }

    // ============ Upload ============

    /// 上传本地文件
    ///
    /// `to` 以 `/` 结尾或指向已有目录时，自动拼上源文件名。
    pub async fn upload(&self, local: &Path, to: &str, overwrite: bool) -> Result<UploadResult> {
        let data = match tokio::fs::read(local).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileOpError::NotFound(local.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let dest = self.resolve_dest(local, to).await?;
        let safe = self.endpoint.safe_uri_for(&dest);

        if !overwrite && self.storage.exists(&dest).await? {
            return Err(FileOpError::AlreadyExists(safe));
        }

        let size = data.len() as u64;
        self.storage.write(&dest, data).await?;

        info!("上传完成: {:?} -> {} ({} 字节)", local, safe, size);
        Ok(UploadResult { uri: safe, size })
    }

    /// 批量上传到同一目录
    pub async fn upload_many(
        &self,
        locals: &[PathBuf],
        to_dir: &str,
        overwrite: bool,
    ) -> Result<Vec<UploadResult>> {
        let dir = format!("{}/", to_dir.trim_end_matches('/'));
        let mut results = Vec::with_capacity(locals.len());
        for local in locals {
            results.push(self.upload(local, &dir, overwrite).await?);
        }
        Ok(results)
    }

    /// 目标缺少文件名时补上源文件名
    async fn resolve_dest(&self, local: &Path, to: &str) -> Result<String> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FileOpError::Config(format!("本地路径无文件名: {:?}", local)))?;

        if to.is_empty() || to.ends_with('/') {
            return Ok(join_rel(to, file_name));
        }
        if let Some(meta) = self.storage.stat(to).await? {
            if meta.is_dir {
                return Ok(join_rel(to, file_name));
            }
        }
        Ok(to.trim_matches('/').to_string())
    }

    // ============ Move ============

    /// 移动/重命名
    ///
    /// 目标父目录不存在时先创建；目标以 `/` 结尾视为目录，拼源文件名。
    pub async fn move_file(&self, from: &str, to: &str, overwrite: bool) -> Result<MoveResult> {
        let from_safe = self.endpoint.safe_uri_for(from);
        if !self.storage.exists(from).await? {
            return Err(FileOpError::NotFound(from_safe));
        }

        let file_name = from.trim_end_matches('/').rsplit('/').next().unwrap_or(from);
        let dest = if to.is_empty() || to.ends_with('/') {
            join_rel(to, file_name)
        } else {
            match self.storage.stat(to).await? {
                Some(meta) if meta.is_dir => join_rel(to, file_name),
                _ => to.trim_matches('/').to_string(),
            }
        };
        let dest_safe = self.endpoint.safe_uri_for(&dest);

        if self.storage.exists(&dest).await? {
            if !overwrite {
                return Err(FileOpError::AlreadyExists(dest_safe));
            }
            self.storage.delete(&dest).await?;
        }

        // 父目录兜底创建
        if let Some(pos) = dest.rfind('/') {
            self.storage.create_dir(&dest[..pos]).await?;
        }

        self.storage.rename(from, &dest).await?;
        info!("移动完成: {} -> {}", from_safe, dest_safe);
        Ok(MoveResult {
            from: from_safe,
            to: dest_safe,
        })
    }

    /// 批量移动到同一目录
    pub async fn move_many(
        &self,
        entries: &[FileEntry],
        to_dir: &str,
        overwrite: bool,
    ) -> Result<Vec<MoveResult>> {
        let dir = format!("{}/", to_dir.trim_end_matches('/'));
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.move_file(&entry.path, &dir, overwrite).await?);
        }
        Ok(results)
    }

    // ============ Delete ============

    /// 删除单个目标
    ///
    /// `error_on_missing=false` 时目标不存在返回 `deleted=false`，不报错。
    pub async fn delete(&self, path: &str, error_on_missing: bool) -> Result<DeleteResult> {
        let safe = self.endpoint.safe_uri_for(path);
        if !self.storage.exists(path).await? {
            if error_on_missing {
                return Err(FileOpError::NotFound(safe));
            }
            debug!("删除目标不存在，按成功处理: {}", safe);
            return Ok(DeleteResult {
                uri: safe,
                deleted: false,
            });
        }
        self.storage.delete(path).await?;
        info!("删除完成: {}", safe);
        Ok(DeleteResult {
            uri: safe,
            deleted: true,
        })
    }

    /// 批量删除；单个文件的"不存在"是否致命由 error_on_missing 决定
    pub async fn delete_many(
        &self,
        entries: &[FileEntry],
        error_on_missing: bool,
    ) -> Result<Vec<DeleteResult>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.delete(&entry.path, error_on_missing).await?);
        }
        Ok(results)
    }
}
