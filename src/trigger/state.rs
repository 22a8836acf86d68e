//! 变更检测状态 - 版本条目与状态存储
//!
//! 轮询器靠这里记住"见过哪些文件、它们当时长什么样"。
//! 指纹只用修改时间和大小拼接，足够发现变化又不必读文件内容。

use crate::error::{FileOpError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 版本条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionEntry {
    /// 文件的稳定标识（完整安全地址）
    pub key: String,
    /// 指纹: "{修改毫秒}_{字节数}"
    pub version: String,
    /// 首次出现时间（Unix 秒）
    pub first_seen_at: i64,
    /// 最近一次出现时间（Unix 秒）
    pub last_seen_at: i64,
}

/// 计算版本指纹，相等性就是字符串相等，没有容差
pub fn fingerprint(modified_millis: i64, size: u64) -> String {
    format!("{}_{}", modified_millis, size)
}

/// 触发策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOn {
    Create,
    Update,
    CreateOrUpdate,
}

/// 事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
}

/// 变更判定结果，派生值不落盘
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDecision {
    pub is_new: bool,
    pub fire: bool,
}

/// 对比存量条目和候选指纹，按策略判定是否触发
pub fn decide(existing: Option<&VersionEntry>, version: &str, on: ChangeOn) -> ChangeDecision {
    match existing {
        None => ChangeDecision {
            is_new: true,
            fire: matches!(on, ChangeOn::Create | ChangeOn::CreateOrUpdate),
        },
        Some(entry) if entry.version == version => ChangeDecision {
            is_new: false,
            fire: false,
        },
        Some(_) => ChangeDecision {
            is_new: false,
            fire: matches!(on, ChangeOn::Update | ChangeOn::CreateOrUpdate),
        },
    }
}

/// 按 TTL 清理过期条目，返回清掉的数量
///
/// 过期只看 last_seen_at，与远端文件是否还存在无关，
/// 这保证了高流动目录下状态不会无限膨胀。
pub fn evict_expired(map: &mut HashMap<String, VersionEntry>, ttl_secs: u64, now: i64) -> usize {
    if ttl_secs == 0 {
        return 0;
    }
    let before = map.len();
    map.retain(|_, e| now - e.last_seen_at <= ttl_secs as i64);
    let removed = before - map.len();
    if removed > 0 {
        debug!("清理了 {} 个过期状态条目", removed);
    }
    removed
}

/// 默认状态键: 命名空间 + 流程 + 触发器标识
pub fn default_state_key(namespace: &str, flow: &str, trigger: &str) -> String {
    format!("{}:{}:{}", namespace, flow, trigger)
}

/// 状态存储接口
///
/// 每个轮询周期整读整写一次；不同触发器的键互不相交，
/// 所以并发轮询器之间不需要更细的锁。
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<HashMap<String, VersionEntry>>;
    async fn write(
        &self,
        key: &str,
        entries: &HashMap<String, VersionEntry>,
        ttl_secs: u64,
    ) -> Result<()>;
}

// ============ 内存实现 ============

/// 进程内状态存储，重启即失，只适合测试和一次性任务
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<HashMap<String, HashMap<String, VersionEntry>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, key: &str) -> Result<HashMap<String, VersionEntry>> {
        Ok(self.inner.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn write(
        &self,
        key: &str,
        entries: &HashMap<String, VersionEntry>,
        _ttl_secs: u64,
    ) -> Result<()> {
        self.inner
            .write()
            .await
            .insert(key.to_string(), entries.clone());
        Ok(())
    }
}

// ============ JSON 文件实现 ============

/// 单文件 JSON 状态存储
///
/// 每个状态键一个文件，文件名取键的 blake3 哈希前缀，
/// 损坏的文件直接丢弃重建。
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let hash = blake3::hash(key.as_bytes());
        self.dir.join(format!("{}.state", &hash.to_hex()[..16]))
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn read(&self, key: &str) -> Result<HashMap<String, VersionEntry>> {
        let path = self.file_path(key);
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&data) {
            Ok(map) => Ok(map),
            Err(_) => {
                // 状态损坏，删掉从头再来
                info!("状态文件损坏，重置: {:?}", path);
                let _ = tokio::fs::remove_file(&path).await;
                Ok(HashMap::new())
            }
        }
    }

    async fn write(
        &self,
        key: &str,
        entries: &HashMap<String, VersionEntry>,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut map = entries.clone();
        evict_expired(&mut map, ttl_secs, chrono::Utc::now().timestamp());

        let path = self.file_path(key);
        let data = serde_json::to_vec(&map)?;
        // 临时文件写入后原子重命名，半截写入不会毁掉上一版状态
        let temp = path.with_extension("state.tmp");
        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }
}

// ============ SQLite 实现 ============

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct VersionEntryRow {
    entry_key: String,
    version: String,
    first_seen_at: i64,
    last_seen_at: i64,
}

/// SQLite 状态存储，多个触发器共用一个库，按 store_key 隔离
pub struct SqliteStateStore {
    db: Arc<SqlitePool>,
}

impl SqliteStateStore {
    pub async fn new(db: Arc<SqlitePool>) -> Result<Self> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS version_entries (
                store_key TEXT NOT NULL,
                entry_key TEXT NOT NULL,
                version TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                PRIMARY KEY (store_key, entry_key)
            )"#,
        )
        .execute(&*db)
        .await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn read(&self, key: &str) -> Result<HashMap<String, VersionEntry>> {
        let rows = sqlx::query_as::<_, VersionEntryRow>(
            "SELECT entry_key, version, first_seen_at, last_seen_at FROM version_entries WHERE store_key = ?",
        )
        .bind(key)
        .fetch_all(&*self.db)
        .await?;

        let mut map = HashMap::new();
        for row in rows {
            map.insert(
                row.entry_key.clone(),
                VersionEntry {
                    key: row.entry_key,
                    version: row.version,
                    first_seen_at: row.first_seen_at,
                    last_seen_at: row.last_seen_at,
                },
            );
        }
        Ok(map)
    }

    async fn write(
        &self,
        key: &str,
        entries: &HashMap<String, VersionEntry>,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut map = entries.clone();
        evict_expired(&mut map, ttl_secs, chrono::Utc::now().timestamp());

        // 整表替换该键的全部条目，和接口的整读整写语义对齐
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM version_entries WHERE store_key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        for entry in map.values() {
            sqlx::query(
                r#"INSERT INTO version_entries (store_key, entry_key, version, first_seen_at, last_seen_at)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(key)
            .bind(&entry.key)
            .bind(&entry.version)
            .bind(entry.first_seen_at)
            .bind(entry.last_seen_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
