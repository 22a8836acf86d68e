use super::{join_rel, normalize_rel_path, FileEntry, FileMeta, Storage};
use crate::endpoint::{EndpointConfig, Scheme};
use crate::error::{FileOpError, Result};
use async_trait::async_trait;
use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::time::Duration;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{Mode, NativeTlsConnector, NativeTlsFtpStream};

/// 建立会话所需的参数，整体克隆进 spawn_blocking 闭包
#[derive(Clone)]
struct FtpParams {
    host: String,
    port: u16,
    username: String,
    password: String,
    secure: bool,
    trust_all: bool,
    passive: bool,
    nat_workaround: bool,
    connect_timeout: Duration,
}

/// FTP/FTPS 存储
///
/// 控制连接单次使用：每个操作内部登录、执行、QUIT，不跨操作复用。
/// FTPS 走显式 TLS 升级（AUTH TLS）。
pub struct FtpStorage {
    params: FtpParams,
    root: String,
    op_timeout: Duration,
    name: String,
}

impl FtpStorage {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let host = config.require_host()?.to_string();
        let params = FtpParams {
            host,
            port: config.effective_port(),
            // 未配置用户时按匿名登录处理
            username: config.username.clone().unwrap_or_else(|| "anonymous".into()),
            password: config.password.clone().unwrap_or_default(),
            secure: config.scheme == Scheme::Ftps,
            trust_all: config.options.tls_trust_all,
            passive: config.options.passive_mode,
            nat_workaround: !config.options.verify_remote_ip,
            connect_timeout: Duration::from_secs(config.options.connect_timeout_secs),
        };
        Ok(Self {
            params,
            root: normalize_rel_path(config.root.as_deref().unwrap_or("")),
            op_timeout: Duration::from_secs(config.options.read_timeout_secs),
            name: config.safe_uri(),
        })
    }

    /// 根目录下的绝对路径
    fn abs(&self, path: &str) -> String {
        format!("/{}", join_rel(&self.root, &normalize_rel_path(path)))
    }

    /// 在独立的阻塞任务里建连接、执行、断开，整体受操作超时约束
    async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream) -> Result<T> + Send + 'static,
    {
        let params = self.params.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut ftp = open_session(&params)?;
            let out = f(&mut ftp);
            // 失败也要尽量优雅断开
            let _ = ftp.quit();
            out
        });

        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(joined) => joined.map_err(|e| FileOpError::Protocol(format!("FTP 任务失败: {}", e)))?,
            Err(_) => Err(FileOpError::Connection(format!(
                "FTP 操作超时 ({}s)",
                self.op_timeout.as_secs()
            ))),
        }
    }

    fn millis(time: Option<std::time::SystemTime>) -> i64 {
        time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// 登录并套上协议默认值
fn open_session(params: &FtpParams) -> Result<NativeTlsFtpStream> {
    let addr = format!("{}:{}", params.host, params.port)
        .to_socket_addrs()
        .map_err(|e| FileOpError::Connection(format!("解析地址失败: {}", e)))?
        .next()
        .ok_or_else(|| FileOpError::Connection(format!("无法解析主机: {}", params.host)))?;

    let mut ftp = NativeTlsFtpStream::connect_timeout(addr, params.connect_timeout)
        .map_err(|e| FileOpError::Connection(format!("FTP 连接失败: {}", e)))?;

    if params.secure {
        let tls = if params.trust_all {
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| FileOpError::Connection(format!("TLS 初始化失败: {}", e)))?;

        ftp = ftp
            .into_secure(NativeTlsConnector::from(tls), &params.host)
            .map_err(|e| FileOpError::Connection(format!("TLS 升级失败: {}", e)))?;
    }

    ftp.login(&params.username, &params.password)
        .map_err(|e| FileOpError::Connection(format!("FTP 登录失败: {}", e)))?;

    ftp.set_mode(if params.passive {
        Mode::Passive
    } else {
        Mode::Active
    });
    if params.nat_workaround {
        ftp.set_passive_nat_workaround(true);
    }
    ftp.transfer_type(FileType::Binary)?;

    Ok(ftp)
}

/// 逐级创建目录，已存在的层级忽略错误
fn mkdir_recursive(ftp: &mut NativeTlsFtpStream, abs_path: &str) {
    let mut current = String::new();
    for part in abs_path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(part);
        let _ = ftp.mkdir(&current);
    }
}

#[async_trait]
impl Storage for FtpStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        let abs = self.abs(path);
        self.with_session(move |ftp| {
            // 目录没有 SIZE，用 CWD 探测
            if ftp.cwd(&abs).is_ok() {
                return Ok(Some(FileMeta {
                    size: 0,
                    modified_millis: 0,
                    is_dir: true,
                }));
            }
            let size = match ftp.size(&abs) {
                Ok(s) => s as u64,
                Err(e) => {
                    return match FileOpError::from(e) {
                        FileOpError::NotFound(_) => Ok(None),
                        other => Err(other),
                    }
                }
            };
            let modified_millis = ftp
                .mdtm(&abs)
                .map(|dt| dt.and_utc().timestamp_millis())
                .unwrap_or(0);
            Ok(Some(FileMeta {
                size,
                modified_millis,
                is_dir: false,
            }))
        })
        .await
    }

    async fn children(&self, path: &str) -> Result<Vec<FileEntry>> {
        let abs = self.abs(path);
        let rel_base = normalize_rel_path(path);
        let lines = self
            .with_session(move |ftp| {
                // 先确认目录存在，否则 LIST 在部分服务器上返回空而非报错
                ftp.cwd(&abs)
                    .map_err(|_| FileOpError::NotFound(abs.clone()))?;
                Ok(ftp.list(None)?)
            })
            .await?;

        let mut entries = Vec::new();
        for line in &lines {
            let parsed = match suppaftp::list::File::try_from(line.as_str()) {
                Ok(f) => f,
                Err(_) => continue, // 无法解析的行跳过
            };
            let name = parsed.name().to_string();
            if name == "." || name == ".." {
                continue;
            }
            let mut entry = FileEntry::new(
                join_rel(&rel_base, &name),
                if parsed.is_directory() { 0 } else { parsed.size() as u64 },
                Self::millis(Some(parsed.modified())),
                parsed.is_directory(),
            );
            entry.symlink = parsed.is_symlink();
            entries.push(entry);
        }
        // LIST 输出顺序由服务器决定，统一排序保证确定性
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let abs = self.abs(path);
        self.with_session(move |ftp| {
            let buffer = ftp.retr_as_buffer(&abs)?;
            Ok(buffer.into_inner())
        })
        .await
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        // FTP 不提供可靠的区间读取，读全量后截取
        let data = self.read(path).await?;
        let start = (offset as usize).min(data.len());
        let end = ((offset + length) as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let abs = self.abs(path);
        self.with_session(move |ftp| {
            if let Some(pos) = abs.rfind('/') {
                if pos > 0 {
                    mkdir_recursive(ftp, &abs[..pos]);
                }
            }
            let mut cursor = Cursor::new(data);
            ftp.put_file(&abs, &mut cursor)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let abs = self.abs(path);
        self.with_session(move |ftp| {
            match ftp.rm(&abs) {
                Ok(_) => Ok(()),
                Err(e) => {
                    // 可能是目录，或目标本来就不存在
                    if ftp.rmdir(&abs).is_ok() {
                        return Ok(());
                    }
                    match FileOpError::from(e) {
                        FileOpError::NotFound(_) => Ok(()),
                        other => Err(other),
                    }
                }
            }
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_abs = self.abs(from);
        let to_abs = self.abs(to);
        self.with_session(move |ftp| {
            ftp.rename(&from_abs, &to_abs)?;
            Ok(())
        })
        .await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let abs = self.abs(path);
        self.with_session(move |ftp| {
            mkdir_recursive(ftp, &abs);
            // 创建完再确认，个别服务器静默失败
            ftp.cwd(&abs)
                .map_err(|e| FileOpError::Protocol(format!("目录创建失败: {}", e)))?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
