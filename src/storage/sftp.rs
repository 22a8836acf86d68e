use super::{join_rel, normalize_rel_path, FileEntry, FileMeta, Storage};
use crate::endpoint::EndpointConfig;
use crate::error::{FileOpError, Result};
use async_trait::async_trait;
use russh::client::AuthResult;
use russh::keys::{PrivateKeyWithHashAlg, PublicKeyBase64};
use russh_sftp::client::SftpSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// SSH 握手回调：只负责服务端公钥校验
struct SshHandler {
    /// OpenSSH SHA256 指纹或 base64 公钥白名单；为空表示不校验
    allowed_fingerprints: Option<Vec<String>>,
}

impl russh::client::Handler for SshHandler {
    type Error = FileOpError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        if let Some(allowed) = &self.allowed_fingerprints {
            let fp_sha256 = server_public_key
                .fingerprint(russh::keys::HashAlg::Sha256)
                .to_string();
            let key_b64 = server_public_key.public_key_base64();
            let ok = allowed.iter().any(|s| s == &fp_sha256 || s == &key_b64);
            debug!("服务端公钥指纹: {} (匹配白名单: {})", fp_sha256, ok);
            return Ok(ok);
        }
        Ok(true)
    }
}

/// SFTP 存储
///
/// 每个操作内部建立并关闭一条 SSH 会话，密码和私钥两种认证方式二选一，
/// 配置了私钥时优先使用私钥。
pub struct SftpStorage {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    key_path: Option<String>,
    key_passphrase: Option<String>,
    allowed_fingerprints: Option<Vec<String>>,
    root: String,
    root_is_home: bool,
    connect_timeout: Duration,
    inactivity_timeout: Duration,
    keep_alive: Duration,
    name: String,
}

impl SftpStorage {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let host = config.require_host()?.to_string();
        let username = config
            .username
            .clone()
            .ok_or_else(|| FileOpError::Config("SFTP 端点缺少 username".into()))?;
        Ok(Self {
            host,
            port: config.effective_port(),
            username,
            password: config.password.clone(),
            key_path: config.options.private_key_path.clone(),
            key_passphrase: config.options.key_passphrase.clone(),
            allowed_fingerprints: config.options.allowed_fingerprints.clone(),
            root: normalize_rel_path(config.root.as_deref().unwrap_or("")),
            root_is_home: config.options.root_is_home,
            connect_timeout: Duration::from_secs(config.options.connect_timeout_secs),
            inactivity_timeout: Duration::from_secs(config.options.read_timeout_secs),
            keep_alive: Duration::from_secs(config.options.keep_alive_secs),
            name: config.safe_uri(),
        })
    }

    /// 建立会话并解析根目录
    async fn open(&self) -> Result<(russh::client::Handle<SshHandler>, SftpSession, String)> {
        let mut config = russh::client::Config::default();
        config.inactivity_timeout = Some(self.inactivity_timeout);
        config.keepalive_interval = Some(self.keep_alive);

        let handler = SshHandler {
            allowed_fingerprints: self.allowed_fingerprints.clone(),
        };

        let mut session = tokio::time::timeout(
            self.connect_timeout,
            russh::client::connect(Arc::new(config), (self.host.as_str(), self.port), handler),
        )
        .await
        .map_err(|_| {
            FileOpError::Connection(format!(
                "SFTP 连接超时 ({}s): {}",
                self.connect_timeout.as_secs(),
                self.host
            ))
        })??;

        let auth = if let Some(key_path) = &self.key_path {
            let key = russh::keys::load_secret_key(key_path, self.key_passphrase.as_deref())
                .map_err(|e| FileOpError::Connection(format!("加载私钥失败: {}", e)))?;
            let hash = session.best_supported_rsa_hash().await?.flatten();
            session
                .authenticate_publickey(
                    &self.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                )
                .await?
        } else {
            session
                .authenticate_password(&self.username, self.password.as_deref().unwrap_or(""))
                .await?
        };

        if let AuthResult::Failure {
            remaining_methods, ..
        } = auth
        {
            return Err(FileOpError::Connection(format!(
                "SFTP 认证失败，服务端支持: {:?}",
                remaining_methods
            )));
        }

        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;

        // root_is_home: 相对登录用户家目录解析；否则相对文件系统根
        let base = if self.root_is_home {
            let home = sftp.canonicalize(".").await?;
            join_rel(&home, &self.root)
        } else {
            format!("/{}", self.root)
        };

        Ok((session, sftp, base))
    }

    async fn close(session: russh::client::Handle<SshHandler>) {
        let _ = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }

    fn abs(base: &str, path: &str) -> String {
        let joined = join_rel(base, &normalize_rel_path(path));
        if joined.starts_with('/') {
            joined
        } else {
            format!("/{}", joined)
        }
    }

    /// 逐级创建目录，已存在的层级忽略错误
    async fn mkdir_recursive(sftp: &SftpSession, abs_path: &str) {
        let mut current = String::new();
        for part in abs_path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(part);
            let _ = sftp.create_dir(&current).await;
        }
    }

    /// 递归删除目录（SFTP 的 rmdir 只接受空目录）
    async fn remove_dir_all(sftp: &SftpSession, abs_path: &str) -> Result<()> {
        let mut stack = vec![abs_path.to_string()];
        let mut dirs = Vec::new();
        while let Some(dir) = stack.pop() {
            for entry in sftp.read_dir(&dir).await? {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let child = format!("{}/{}", dir.trim_end_matches('/'), name);
                if entry.metadata().is_dir() {
                    stack.push(child);
                } else {
                    sftp.remove_file(&child).await?;
                }
            }
            dirs.push(dir);
        }
        // 自底向上删除目录本身
        for dir in dirs.iter().rev() {
            sftp.remove_dir(dir).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for SftpStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        let (session, sftp, base) = self.open().await?;
        let abs = Self::abs(&base, path);

        let result = async {
            match sftp.try_exists(&abs).await? {
                false => Ok(None),
                true => {
                    let attrs = sftp.metadata(&abs).await?;
                    Ok(Some(FileMeta {
                        size: attrs.size.unwrap_or(0),
                        modified_millis: attrs.mtime.map(|t| t as i64 * 1000).unwrap_or(0),
                        is_dir: attrs.is_dir(),
                    }))
                }
            }
        }
        .await;

        Self::close(session).await;
        result
    }

    async fn children(&self, path: &str) -> Result<Vec<FileEntry>> {
        let (session, sftp, base) = self.open().await?;
        let abs = Self::abs(&base, path);
        let rel_base = normalize_rel_path(path);

        let result = async {
            let mut entries = Vec::new();
            for entry in sftp.read_dir(&abs).await? {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let attrs = entry.metadata();
                let is_dir = attrs.is_dir();
                let mut fe = FileEntry::new(
                    join_rel(&rel_base, &name),
                    if is_dir { 0 } else { attrs.size.unwrap_or(0) },
                    attrs.mtime.map(|t| t as i64 * 1000).unwrap_or(0),
                    is_dir,
                );
                fe.symlink = attrs.is_symlink();
                entries.push(fe);
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        }
        .await;

        Self::close(session).await;
        result
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (session, sftp, base) = self.open().await?;
        let abs = Self::abs(&base, path);

        let result = async {
            let mut file = sftp.open(&abs).await?;
            let mut data = Vec::new();
            file.read_to_end(&mut data).await?;
            Ok(data)
        }
        .await;

        Self::close(session).await;
        result
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let (session, sftp, base) = self.open().await?;
        let abs = Self::abs(&base, path);

        let result = async {
            let mut file = sftp.open(&abs).await?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            let mut data = Vec::new();
            file.take(length).read_to_end(&mut data).await?;
            Ok(data)
        }
        .await;

        Self::close(session).await;
        result
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let (session, sftp, base) = self.open().await?;
        let abs = Self::abs(&base, path);

        let result = async {
            if let Some(pos) = abs.rfind('/') {
                if pos > 0 {
                    Self::mkdir_recursive(&sftp, &abs[..pos]).await;
                }
            }
            let mut file = sftp.create(&abs).await?;
            file.write_all(&data).await?;
            file.shutdown().await?;
            Ok(())
        }
        .await;

        Self::close(session).await;
        result
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let (session, sftp, base) = self.open().await?;
        let abs = Self::abs(&base, path);

        let result = async {
            match sftp.try_exists(&abs).await? {
                false => Ok(()),
                true => {
                    if sftp.metadata(&abs).await?.is_dir() {
                        Self::remove_dir_all(&sftp, &abs).await
                    } else {
                        sftp.remove_file(&abs).await.map_err(FileOpError::from)
                    }
                }
            }
        }
        .await;

        Self::close(session).await;
        result
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (session, sftp, base) = self.open().await?;
        let from_abs = Self::abs(&base, from);
        let to_abs = Self::abs(&base, to);

        let result = async {
            if !sftp.try_exists(&from_abs).await? {
                return Err(FileOpError::NotFound(from_abs.clone()));
            }
            sftp.rename(&from_abs, &to_abs)
                .await
                .map_err(FileOpError::from)
        }
        .await;

        Self::close(session).await;
        result
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let (session, sftp, base) = self.open().await?;
        let abs = Self::abs(&base, path);

        let result = async {
            Self::mkdir_recursive(&sftp, &abs).await;
            if !sftp.try_exists(&abs).await? {
                return Err(FileOpError::Protocol(format!("目录创建失败: {}", abs)));
            }
            Ok(())
        }
        .await;

        Self::close(session).await;
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ProtocolOptions, Scheme};

    #[test]
    fn test_abs_join() {
        assert_eq!(SftpStorage::abs("/home/bob", "in/a.txt"), "/home/bob/in/a.txt");
        assert_eq!(SftpStorage::abs("/", "a.txt"), "/a.txt");
        assert_eq!(SftpStorage::abs("/home/bob", ""), "/home/bob");
    }

    #[test]
    fn test_username_required() {
        let cfg = EndpointConfig {
            scheme: Scheme::Sftp,
            host: Some("sftp.example.com".into()),
            port: None,
            username: None,
            password: None,
            path: None,
            mount_root: None,
            share: None,
            root: None,
            options: ProtocolOptions::default(),
        };
        assert!(matches!(
            SftpStorage::new(&cfg),
            Err(FileOpError::Config(_))
        ));
    }
}
