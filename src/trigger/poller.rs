//! 有状态轮询触发器
//!
//! 每个调度周期完整走一遍 列表 -> 判定 -> 下载 -> 归档 -> 发射。
//! 同一实例的周期绝不重叠；状态在整个周期成功后一次性落盘，
//! 中途失败不提交，下个周期安全重试（至少一次语义）。

use crate::endpoint::EndpointConfig;
use crate::error::{FileOpError, Result};
use crate::ops::{ActionRunner, DownloadOptions, FileOperator, ListOptions, PostAction};
use crate::storage::FileEntry;
use crate::trigger::state::{
    decide, evict_expired, fingerprint, ChangeOn, ChangeType, StateStore, VersionEntry,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认状态条目 TTL：7 天
const DEFAULT_STATE_TTL_SECS: u64 = 7 * 24 * 3600;

/// 监听配置
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// 被监听的目录（服务端相对路径）
    pub path: String,
    /// 完整匹配正则，作用于服务端相对路径
    pub pattern: Option<String>,
    pub recursive: bool,
    /// 触发策略
    pub on: ChangeOn,
    /// 单周期最多触发的文件数；待触发数超过时整个周期不触发
    pub max_files: Option<usize>,
    /// 状态条目 TTL（秒），0 表示不过期
    pub state_ttl_secs: u64,
    /// 状态键，按触发器身份命名，彼此不得冲突
    pub state_key: String,
    /// 触发后对列出文件的归档动作
    pub post_action: PostAction,
    /// 下载暂存目录
    pub staging_dir: PathBuf,
}

impl WatchConfig {
    pub fn new(path: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pattern: None,
            recursive: false,
            on: ChangeOn::Create,
            max_files: None,
            state_ttl_secs: DEFAULT_STATE_TTL_SECS,
            state_key: state_key.into(),
            post_action: PostAction::None,
            staging_dir: std::env::temp_dir().join("filebridge-staging"),
        }
    }
}

/// 触发的单个文件
#[derive(Debug, Clone, Serialize)]
pub struct ChangedFile {
    pub entry: FileEntry,
    pub change_type: ChangeType,
    /// 下载到暂存区的本地副本
    pub local_path: PathBuf,
}

/// 一次触发事件，文件顺序与遍历顺序一致
#[derive(Debug, Clone, Serialize)]
pub struct TriggerEvent {
    pub files: Vec<ChangedFile>,
}

/// 文件轮询器
pub struct FilePoller {
    operator: FileOperator,
    store: Arc<dyn StateStore>,
    config: WatchConfig,
    in_flight: AtomicBool,
}

impl FilePoller {
    pub fn new(
        endpoint: &EndpointConfig,
        store: Arc<dyn StateStore>,
        config: WatchConfig,
    ) -> Result<Self> {
        Ok(Self {
            operator: FileOperator::new(endpoint)?,
            store,
            config,
            in_flight: AtomicBool::new(false),
        })
    }

    /// 用现成的操作器构造（测试用）
    pub fn from_parts(
        operator: FileOperator,
        store: Arc<dyn StateStore>,
        config: WatchConfig,
    ) -> Self {
        Self {
            operator,
            store,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// 执行一个完整的轮询周期
    ///
    /// 返回 None 表示本周期没有文件触发。上一周期还没结束时直接让路。
    pub async fn poll_once(&self) -> Result<Option<TriggerEvent>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("上一周期尚未结束，跳过本次轮询: {}", self.config.state_key);
            return Ok(None);
        }
        // 所有退出路径都要归还单飞标志
        let _guard = scopeguard::guard(&self.in_flight, |flag| {
            flag.store(false, Ordering::SeqCst);
        });

        self.run_cycle().await
    }

    async fn run_cycle(&self) -> Result<Option<TriggerEvent>> {
        let now = chrono::Utc::now().timestamp();

        // ===== 列表 =====
        let list_opts = ListOptions {
            path: self.config.path.clone(),
            pattern: self.config.pattern.clone(),
            recursive: self.config.recursive,
            max_files: None, // 上限在判定之后作用于待触发集合
        };
        let listed = match self.operator.list(&list_opts).await {
            Ok(files) => files,
            Err(FileOpError::NotFound(_)) => {
                // 监听目录不存在不算故障，等它出现
                debug!("监听路径不存在，本周期无匹配: {}", self.config.path);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        // ===== 判定 =====
        let mut state = self.store.read(&self.config.state_key).await?;
        evict_expired(&mut state, self.config.state_ttl_secs, now);

        let mut next_state = state.clone();
        let mut to_fire: Vec<(FileEntry, ChangeType)> = Vec::new();

        for entry in &listed {
            let key = self.operator.endpoint().safe_uri_for(&entry.path);
            let version = fingerprint(entry.modified_millis, entry.size);
            let decision = decide(state.get(&key), &version, self.config.on);

            // 无论是否触发都写入条目，这是下周期不重复触发的根据
            let updated = match state.get(&key) {
                Some(old) => VersionEntry {
                    key: key.clone(),
                    version: version.clone(),
                    first_seen_at: old.first_seen_at,
                    last_seen_at: now,
                },
                None => VersionEntry {
                    key: key.clone(),
                    version,
                    first_seen_at: now,
                    last_seen_at: now,
                },
            };
            next_state.insert(key, updated);

            if decision.fire {
                let change_type = if decision.is_new {
                    ChangeType::Create
                } else {
                    ChangeType::Update
                };
                to_fire.push((entry.clone(), change_type));
            }
        }

        // 待触发数超过上限：整个周期按"无可触发"处理。
        // 待触发条目回退到判定前的状态（新文件撤销、已变文件保留旧版本
        // 但刷新 last_seen），留给之后的周期重试，不会丢文件。
        if let Some(max) = self.config.max_files {
            if to_fire.len() > max {
                warn!(
                    "待触发文件 {} 个超过上限 {}，本周期不触发: {}",
                    to_fire.len(),
                    max,
                    self.config.state_key
                );
                for (entry, _) in &to_fire {
                    let key = self.operator.endpoint().safe_uri_for(&entry.path);
                    match state.get(&key) {
                        Some(old) => {
                            let mut kept = old.clone();
                            kept.last_seen_at = now;
                            next_state.insert(key, kept);
                        }
                        None => {
                            next_state.remove(&key);
                        }
                    }
                }
                to_fire.clear();
            }
        }

        // ===== 下载 =====
        // 任一文件下载失败都让周期失败且不提交状态，下周期重试
        let mut changed_files = Vec::with_capacity(to_fire.len());
        if !to_fire.is_empty() {
            let download_opts = DownloadOptions::new(&self.config.staging_dir);
            for (entry, change_type) in &to_fire {
                let result = self.operator.download(&entry.path, &download_opts).await?;
                changed_files.push(ChangedFile {
                    entry: entry.clone(),
                    change_type: *change_type,
                    local_path: result.to,
                });
            }
        }

        // ===== 归档 =====
        // 后置动作作用于本周期列出的全部文件（清空目录语义），
        // 而不只是触发子集；此时安全副本已经在暂存区
        ActionRunner::new(&self.operator)
            .run(&listed, &self.config.post_action)
            .await?;

        // ===== 发射 =====
        // 没有触发也要落盘，last_seen 刷新是 TTL 不误杀活跃文件的前提
        self.store
            .write(&self.config.state_key, &next_state, self.config.state_ttl_secs)
            .await?;

        if changed_files.is_empty() {
            debug!("本周期无触发: {}", self.config.state_key);
            Ok(None)
        } else {
            info!(
                "触发事件: {} 个文件 ({})",
                changed_files.len(),
                self.config.state_key
            );
            Ok(Some(TriggerEvent {
                files: changed_files,
            }))
        }
    }

    /// 按固定间隔循环轮询，直到取消信号到来
    ///
    /// 事件经由通道交给宿主；单个周期的失败只记日志不终止循环，
    /// 因为状态未提交，下个周期重试是安全的。
    pub async fn run(
        &self,
        interval: Duration,
        token: CancellationToken,
        events: mpsc::Sender<TriggerEvent>,
    ) {
        info!(
            "轮询启动: {} (间隔 {:?})",
            self.config.state_key, interval
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("轮询停止: {}", self.config.state_key);
                    break;
                }
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(Some(event)) => {
                            if events.send(event).await.is_err() {
                                // 接收端已关闭，没有继续轮询的意义
                                info!("事件通道关闭，轮询退出: {}", self.config.state_key);
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("轮询周期失败: {} - {}", self.config.state_key, e);
                        }
                    }
                }
            }
        }
    }
}
