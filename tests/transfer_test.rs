//! 传输操作集成测试：以本地存储为后端验证通用契约

use anyhow::Result;
use filebridge::{
    DownloadOptions, EndpointConfig, FileOpError, FileOperator, ListOptions,
};
use std::path::PathBuf;
use tempfile::TempDir;

struct Fixture {
    _root: TempDir,
    staging: PathBuf,
    operator: FileOperator,
}

fn fixture() -> Result<Fixture> {
    let root = TempDir::new()?;
    let staging = root.path().join("_staging");
    let endpoint = EndpointConfig::local(root.path().join("store").to_str().unwrap());
    let operator = FileOperator::new(&endpoint)?;
    Ok(Fixture {
        _root: root,
        staging,
        operator,
    })
}

async fn seed(fx: &Fixture, path: &str, content: &[u8]) -> Result<()> {
    fx.operator.storage().write(path, content.to_vec()).await?;
    Ok(())
}

#[tokio::test]
async fn test_upload_download_roundtrip() -> Result<()> {
    let fx = fixture()?;
    let payload = b"line one\nline two\n\xf0\x9f\xa6\x80".to_vec();

    let local_src = fx._root.path().join("source.bin");
    tokio::fs::write(&local_src, &payload).await?;

    let uploaded = fx.operator.upload(&local_src, "in/", false).await?;
    assert!(uploaded.uri.ends_with("in/source.bin"));
    assert_eq!(uploaded.size, payload.len() as u64);

    let downloaded = fx
        .operator
        .download("in/source.bin", &DownloadOptions::new(&fx.staging))
        .await?;
    assert_eq!(downloaded.size, payload.len() as u64);

    let roundtripped = tokio::fs::read(&downloaded.to).await?;
    assert_eq!(roundtripped, payload);
    Ok(())
}

#[tokio::test]
async fn test_upload_no_overwrite_conflicts() -> Result<()> {
    let fx = fixture()?;
    let local_src = fx._root.path().join("a.txt");
    tokio::fs::write(&local_src, b"v1").await?;

    fx.operator.upload(&local_src, "out/a.txt", false).await?;
    let err = fx
        .operator
        .upload(&local_src, "out/a.txt", false)
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpError::AlreadyExists(_)));

    // overwrite=true 可以替换
    tokio::fs::write(&local_src, b"v2 longer").await?;
    let result = fx.operator.upload(&local_src, "out/a.txt", true).await?;
    assert_eq!(result.size, 9);
    Ok(())
}

#[tokio::test]
async fn test_list_excludes_directories_and_filters() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.csv", b"a").await?;
    seed(&fx, "in/b.txt", b"b").await?;
    seed(&fx, "in/sub/c.csv", b"c").await?;

    // 非递归：只看直接子项，目录本身不进结果
    let flat = fx
        .operator
        .list(&ListOptions {
            path: "in".into(),
            pattern: None,
            recursive: false,
            max_files: None,
        })
        .await?;
    let paths: Vec<_> = flat.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["in/a.csv", "in/b.txt"]);

    // 递归 + 完整匹配正则
    let csv = fx
        .operator
        .list(&ListOptions {
            path: "in".into(),
            pattern: Some(r"in/.*\.csv".into()),
            recursive: true,
            max_files: None,
        })
        .await?;
    let paths: Vec<_> = csv.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["in/a.csv", "in/sub/c.csv"]);
    Ok(())
}

#[tokio::test]
async fn test_list_truncation_is_deterministic() -> Result<()> {
    let fx = fixture()?;
    for i in 0..5 {
        seed(&fx, &format!("in/file{}.txt", i), b"x").await?;
    }

    let opts = ListOptions {
        path: "in".into(),
        pattern: None,
        recursive: false,
        max_files: Some(3),
    };
    let first = fx.operator.list(&opts).await?;
    assert_eq!(first.len(), 3);

    // 两次列表截断结果一致（按遍历顺序取前 N 个）
    let second = fx.operator.list(&opts).await?;
    let a: Vec<_> = first.iter().map(|e| e.path.clone()).collect();
    let b: Vec<_> = second.iter().map(|e| e.path.clone()).collect();
    assert_eq!(a, b);
    assert_eq!(a, vec!["in/file0.txt", "in/file1.txt", "in/file2.txt"]);
    Ok(())
}

#[tokio::test]
async fn test_list_missing_path_is_not_found() -> Result<()> {
    let fx = fixture()?;
    let err = fx
        .operator
        .list(&ListOptions::new("nowhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn test_delete_error_on_missing_policy() -> Result<()> {
    let fx = fixture()?;

    // 宽松策略：不存在返回 deleted=false
    let result = fx.operator.delete("ghost.txt", false).await?;
    assert!(!result.deleted);

    // 严格策略：不存在报 NotFound
    let err = fx.operator.delete("ghost.txt", true).await.unwrap_err();
    assert!(matches!(err, FileOpError::NotFound(_)));

    seed(&fx, "real.txt", b"data").await?;
    let result = fx.operator.delete("real.txt", true).await?;
    assert!(result.deleted);
    Ok(())
}

#[tokio::test]
async fn test_move_into_directory_creates_parent() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"data").await?;

    // 目标以 / 结尾视为目录，父目录自动创建
    let moved = fx.operator.move_file("in/a.txt", "done/2024/", false).await?;
    assert!(moved.to.ends_with("done/2024/a.txt"));

    assert!(!fx.operator.storage().exists("in/a.txt").await?);
    assert!(fx.operator.storage().exists("done/2024/a.txt").await?);
    Ok(())
}

#[tokio::test]
async fn test_move_missing_source_is_not_found() -> Result<()> {
    let fx = fixture()?;
    let err = fx
        .operator
        .move_file("ghost.txt", "done/", false)
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn test_move_no_overwrite_conflicts() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"new").await?;
    seed(&fx, "done/a.txt", b"old").await?;

    let err = fx
        .operator
        .move_file("in/a.txt", "done/", false)
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpError::AlreadyExists(_)));

    // overwrite=true 替换旧文件
    fx.operator.move_file("in/a.txt", "done/", true).await?;
    let data = fx.operator.storage().read("done/a.txt").await?;
    assert_eq!(data, b"new");
    Ok(())
}

#[tokio::test]
async fn test_plural_operations_collect_outcomes() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/a.txt", b"a").await?;
    seed(&fx, "in/b.txt", b"bb").await?;

    let listed = fx.operator.list(&ListOptions::new("in")).await?;
    assert_eq!(listed.len(), 2);

    let downloads = fx
        .operator
        .download_many(&listed, &DownloadOptions::new(&fx.staging))
        .await?;
    assert_eq!(downloads.len(), 2);
    let summary = filebridge::BatchSummary::from_downloads(&downloads);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.bytes, 3);

    // 批量删除容忍中途消失的文件
    fx.operator.storage().delete("in/a.txt").await?;
    let results = fx.operator.delete_many(&listed, false).await?;
    assert_eq!(results.len(), 2);
    assert!(!results[0].deleted);
    assert!(results[1].deleted);
    Ok(())
}

#[tokio::test]
async fn test_download_missing_is_not_found() -> Result<()> {
    let fx = fixture()?;
    let err = fx
        .operator
        .download("ghost.txt", &DownloadOptions::new(&fx.staging))
        .await
        .unwrap_err();
    assert!(matches!(err, FileOpError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn test_download_empty_file_policy() -> Result<()> {
    let fx = fixture()?;
    seed(&fx, "in/empty.txt", b"").await?;

    // 默认允许空文件
    let ok = fx
        .operator
        .download("in/empty.txt", &DownloadOptions::new(&fx.staging))
        .await?;
    assert_eq!(ok.size, 0);

    // fail_on_empty 拒绝
    let mut opts = DownloadOptions::new(&fx.staging);
    opts.fail_on_empty = true;
    assert!(fx.operator.download("in/empty.txt", &opts).await.is_err());
    Ok(())
}
