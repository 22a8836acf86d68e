//! 批处理后置动作 - 对已列出/已下载的文件做归档处理

use crate::error::{FileOpError, Result};
use crate::ops::transfer::FileOperator;
use crate::storage::{join_rel, FileEntry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 后置动作类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", rename_all_fields = "camelCase", tag = "type")]
pub enum PostAction {
    /// 不做处理
    None,
    /// 移入目标目录，目录不存在时创建
    Move { target_dir: String },
    /// 删除源文件
    Delete,
}

impl Default for PostAction {
    fn default() -> Self {
        PostAction::None
    }
}

/// 动作执行统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionReport {
    pub moved: u32,
    pub deleted: u32,
    pub skipped: u32,
}

/// 动作执行器
///
/// 永远在下载完成之后运行：源文件只有在调用方拿到安全副本后才会被动。
/// 空输入是合法的重复执行，产生零个动作而不是错误。
pub struct ActionRunner<'a> {
    operator: &'a FileOperator,
}

impl<'a> ActionRunner<'a> {
    pub fn new(operator: &'a FileOperator) -> Self {
        Self { operator }
    }

    pub async fn run(&self, files: &[FileEntry], action: &PostAction) -> Result<ActionReport> {
        let mut report = ActionReport::default();

        match action {
            PostAction::None => {}
            PostAction::Delete => {
                for file in files.iter().filter(|f| !f.is_dir) {
                    // 列表和动作之间文件可能已经消失，不视为失败
                    let result = self.operator.delete(&file.path, false).await?;
                    if result.deleted {
                        report.deleted += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
            }
            PostAction::Move { target_dir } => {
                let storage = self.operator.storage();
                if !files.is_empty() {
                    storage.create_dir(target_dir).await?;
                }
                for file in files.iter().filter(|f| !f.is_dir) {
                    let mut dest = join_rel(target_dir, &file.name);
                    if storage.exists(&dest).await? {
                        dest = Self::conflict_name(target_dir, &file.name);
                        debug!("移动目标已占用，改用: {}", dest);
                    }
                    match storage.rename(&file.path, &dest).await {
                        Ok(_) => report.moved += 1,
                        Err(FileOpError::NotFound(_)) => {
                            warn!("移动目标已消失，跳过: {}", file.path);
                            report.skipped += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if report.moved + report.deleted + report.skipped > 0 {
            info!(
                "后置动作完成: 移动 {}, 删除 {}, 跳过 {}",
                report.moved, report.deleted, report.skipped
            );
        }
        Ok(report)
    }

    /// 目标重名时在扩展名前插入短随机后缀
    fn conflict_name(target_dir: &str, name: &str) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let tag = &suffix[..8];
        let renamed = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, tag, ext),
            _ => format!("{}-{}", name, tag),
        };
        join_rel(target_dir, &renamed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_name_keeps_extension() {
        let dest = ActionRunner::conflict_name("done", "report.csv");
        assert!(dest.starts_with("done/report-"));
        assert!(dest.ends_with(".csv"));
        assert_ne!(dest, "done/report.csv");
    }

    #[test]
    fn test_conflict_name_without_extension() {
        let dest = ActionRunner::conflict_name("done", "README");
        assert!(dest.starts_with("done/README-"));
    }

    #[test]
    fn test_post_action_serde_tag() {
        let action: PostAction =
            serde_json::from_str(r#"{"type":"move","targetDir":"archive"}"#).unwrap();
        assert_eq!(
            action,
            PostAction::Move {
                target_dir: "archive".into()
            }
        );
    }
}
