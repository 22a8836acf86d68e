//! 轮询触发器集成测试：本地存储 + 各状态存储后端

use anyhow::Result;
use filebridge::{
    ChangeOn, ChangeType, EndpointConfig, FileOperator, FilePoller, JsonStateStore,
    MemoryStateStore, PostAction, StateStore, WatchConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    root: TempDir,
    endpoint: EndpointConfig,
    store: Arc<dyn StateStore>,
}

fn fixture() -> Result<Fixture> {
    let root = TempDir::new()?;
    let endpoint = EndpointConfig::local(root.path().join("store").to_str().unwrap());
    Ok(Fixture {
        root,
        endpoint,
        store: Arc::new(MemoryStateStore::new()),
    })
}

fn watch_config(fx: &Fixture, on: ChangeOn) -> WatchConfig {
    let mut config = WatchConfig::new("in", "test:flow:trigger-1");
    config.on = on;
    config.staging_dir = fx.root.path().join("_staging");
    config
}

fn poller(fx: &Fixture, config: WatchConfig) -> Result<FilePoller> {
    let operator = FileOperator::new(&fx.endpoint)?;
    Ok(FilePoller::from_parts(operator, fx.store.clone(), config))
}

async fn seed(fx: &Fixture, path: &str, content: &[u8]) -> Result<()> {
    let operator = FileOperator::new(&fx.endpoint)?;
    operator.storage().write(path, content.to_vec()).await?;
    Ok(())
}

#[tokio::test]
async fn test_create_fires_exactly_once() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"hello").await?;

    let poller = poller(&fx, watch_config(&fx, ChangeOn::Create))?;

    // 首次见到：触发一次 CREATE
    let event = poller.poll_once().await?.expect("首个周期应当触发");
    assert_eq!(event.files.len(), 1);
    assert_eq!(event.files[0].entry.path, "in/a.txt");
    assert_eq!(event.files[0].change_type, ChangeType::Create);
    assert!(event.files[0].local_path.exists());

    // 紧接着再轮询一次：不得重复触发
    assert!(poller.poll_once().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_update_policy_only_fires_on_change() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"v1").await?;

    let poller = poller(&fx, watch_config(&fx, ChangeOn::Update))?;

    // On=UPDATE 下新文件不触发，但要记住它
    assert!(poller.poll_once().await?.is_none());

    // 指纹变化（大小不同）后触发 UPDATE
    seed(&fx, "in/a.txt", b"v2 longer").await?;
    let event = poller.poll_once().await?.expect("变更后应当触发");
    assert_eq!(event.files[0].change_type, ChangeType::Update);

    assert!(poller.poll_once().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_create_policy_never_fires_on_change() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"v1").await?;

    let poller = poller(&fx, watch_config(&fx, ChangeOn::Create))?;
    assert!(poller.poll_once().await?.is_some());

    // On=CREATE 对已知文件的变更保持沉默
    seed(&fx, "in/a.txt", b"v2 longer").await?;
    assert!(poller.poll_once().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_create_or_update_full_scenario() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"v1").await?;

    let poller = poller(&fx, watch_config(&fx, ChangeOn::CreateOrUpdate))?;

    // 出现 -> CREATE
    let event = poller.poll_once().await?.unwrap();
    assert_eq!(event.files[0].change_type, ChangeType::Create);

    // 未变化 -> 无事件
    assert!(poller.poll_once().await?.is_none());

    // 变化 -> UPDATE
    seed(&fx, "in/a.txt", b"v2 longer").await?;
    let event = poller.poll_once().await?.unwrap();
    assert_eq!(event.files[0].change_type, ChangeType::Update);

    // 再次未变化 -> 无事件
    assert!(poller.poll_once().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_missing_watch_path_is_empty_cycle() -> Result<()> {
    let fx = fixture()?;
    let poller = poller(&fx, watch_config(&fx, ChangeOn::Create))?;
    // 监听目录还不存在：空周期，不是错误
    assert!(poller.poll_once().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_max_files_defers_whole_cycle() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"a").await?;
    seed(&fx, "in/b.txt", b"b").await?;

    let mut config = watch_config(&fx, ChangeOn::Create);
    config.max_files = Some(1);
    let poller = poller(&fx, config)?;

    // 两个新文件超过上限：本周期零触发，文件保持待定
    assert!(poller.poll_once().await?.is_none());

    // 一个文件被外部拿走后低于上限，剩下的照常触发
    let operator = FileOperator::new(&fx.endpoint)?;
    operator.storage().delete("in/a.txt").await?;

    let event = poller.poll_once().await?.expect("低于上限后应当触发");
    assert_eq!(event.files.len(), 1);
    assert_eq!(event.files[0].entry.path, "in/b.txt");
    Ok(())
}

#[tokio::test]
async fn test_move_action_drains_directory() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"data").await?;

    let mut config = watch_config(&fx, ChangeOn::Create);
    config.post_action = PostAction::Move {
        target_dir: "archive".into(),
    };
    let poller = poller(&fx, config)?;

    let event = poller.poll_once().await?.unwrap();
    assert_eq!(event.files.len(), 1);

    // 源目录被清空，文件进了归档目录
    let operator = FileOperator::new(&fx.endpoint)?;
    assert!(!operator.storage().exists("in/a.txt").await?);
    assert!(operator.storage().exists("archive/a.txt").await?);

    // 对着已清空的目录重复执行：零动作、零事件、零错误
    assert!(poller.poll_once().await?.is_none());
    assert!(poller.poll_once().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_delete_action_tolerates_vanished_files() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"data").await?;

    let mut config = watch_config(&fx, ChangeOn::Create);
    config.post_action = PostAction::Delete;
    let poller = poller(&fx, config)?;

    let event = poller.poll_once().await?.unwrap();
    // 事件先拿到暂存副本，源文件随后被删
    let staged = tokio::fs::read(&event.files[0].local_path).await?;
    assert_eq!(staged, b"data");

    let operator = FileOperator::new(&fx.endpoint)?;
    assert!(!operator.storage().exists("in/a.txt").await?);
    Ok(())
}

#[tokio::test]
async fn test_state_survives_restart_with_json_store() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"hello").await?;

    let state_dir = fx.root.path().join("_state");
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(&state_dir)?);

    let config = watch_config(&fx, ChangeOn::Create);
    let first = FilePoller::from_parts(
        FileOperator::new(&fx.endpoint)?,
        store.clone(),
        config.clone(),
    );
    assert!(first.poll_once().await?.is_some());
    drop(first);

    // 模拟重启：同一个状态目录起新实例，不得重复触发
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(&state_dir)?);
    let second = FilePoller::from_parts(FileOperator::new(&fx.endpoint)?, store, config);
    assert!(second.poll_once().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_pattern_scopes_trigger() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/report.csv", b"csv").await?;
    seed(&fx, "in/notes.txt", b"txt").await?;

    let mut config = watch_config(&fx, ChangeOn::Create);
    config.pattern = Some(r"in/.*\.csv".into());
    let poller = poller(&fx, config)?;

    let event = poller.poll_once().await?.unwrap();
    assert_eq!(event.files.len(), 1);
    assert_eq!(event.files[0].entry.path, "in/report.csv");
    Ok(())
}
