//! 远程端点描述

use crate::error::{FileOpError, Result};
use serde::{Deserialize, Serialize};

/// 协议类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Local,
    Ftp,
    Ftps,
    Sftp,
    Smb,
    Nfs,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "file",
            Scheme::Ftp => "ftp",
            Scheme::Ftps => "ftps",
            Scheme::Sftp => "sftp",
            Scheme::Smb => "smb",
            Scheme::Nfs => "nfs",
        }
    }

    /// 协议默认端口
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Local => 0,
            Scheme::Ftp | Scheme::Ftps => 21,
            Scheme::Sftp => 22,
            Scheme::Smb => 445,
            Scheme::Nfs => 2049,
        }
    }
}

/// 协议细节选项，全部带默认值，缺省即可用
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolOptions {
    /// 建立连接超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 单次读写操作超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 连接保活间隔（秒），仅对长连接协议生效
    #[serde(default = "default_timeout_secs")]
    pub keep_alive_secs: u64,
    /// FTP/FTPS 被动模式
    #[serde(default = "default_true")]
    pub passive_mode: bool,
    /// FTP/FTPS 校验数据连接返回的远端 IP，关闭后启用 NAT 兼容
    #[serde(default = "default_true")]
    pub verify_remote_ip: bool,
    /// FTPS 信任任意证书（仅测试环境）
    #[serde(default)]
    pub tls_trust_all: bool,
    /// SFTP 私钥文件路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    /// SFTP 私钥口令
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
    /// SFTP 服务端公钥指纹白名单（SHA256 指纹或 base64 公钥）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_fingerprints: Option<Vec<String>>,
    /// SFTP 根目录按登录用户家目录解析
    #[serde(default = "default_true")]
    pub root_is_home: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_timeout_secs(),
            read_timeout_secs: default_timeout_secs(),
            keep_alive_secs: default_timeout_secs(),
            passive_mode: default_true(),
            verify_remote_ip: default_true(),
            tls_trust_all: false,
            private_key_path: None,
            key_passphrase: None,
            allowed_fingerprints: None,
            root_is_home: default_true(),
        }
    }
}

/// 端点配置，任务执行期间不可变
///
/// 凭据只在后端建立会话时使用，任何对外可见的形式（日志、结果、
/// 事件负载）一律通过 [`EndpointConfig::safe_uri`] 输出。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub scheme: Scheme,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// 本地存储根目录
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// SMB/NFS 在本机的挂载点
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_root: Option<String>,
    /// SMB 共享名 / NFS 导出名，仅参与地址展示
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share: Option<String>,
    /// 远端根目录，所有相对路径基于它解析
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default)]
    pub options: ProtocolOptions,
}

impl EndpointConfig {
    /// 本地端点
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Local,
            host: None,
            port: None,
            username: None,
            password: None,
            path: Some(path.into()),
            mount_root: None,
            share: None,
            root: None,
            options: ProtocolOptions::default(),
        }
    }

    /// 实际使用的端口
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// 必填 host，缺失时报配置错误
    pub fn require_host(&self) -> Result<&str> {
        self.host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FileOpError::Config(format!("{} 端点缺少 host", self.scheme.as_str())))
    }

    /// 去除凭据的地址形式，唯一允许出现在日志和输出里的形式
    pub fn safe_uri(&self) -> String {
        match self.scheme {
            Scheme::Local => {
                format!("file://{}", self.path.as_deref().unwrap_or("/"))
            }
            Scheme::Smb | Scheme::Nfs => {
                let host = self.host.as_deref().unwrap_or("localhost");
                let share = self
                    .share
                    .as_deref()
                    .map(|s| format!("/{}", s.trim_matches('/')))
                    .unwrap_or_default();
                format!("{}://{}{}", self.scheme.as_str(), host, share)
            }
            _ => {
                let host = self.host.as_deref().unwrap_or("localhost");
                // 用户名可以展示，密码永远不行
                let user = self
                    .username
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .map(|u| format!("{}@", urlencoding::encode(u)))
                    .unwrap_or_default();
                let port = self.effective_port();
                let root = self
                    .root
                    .as_deref()
                    .map(|r| format!("/{}", r.trim_matches('/')))
                    .unwrap_or_default();
                format!("{}://{}{}:{}{}", self.scheme.as_str(), user, host, port, root)
            }
        }
    }

    /// 拼出某个服务端相对路径的完整安全地址
    pub fn safe_uri_for(&self, path: &str) -> String {
        let base = self.safe_uri();
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            base
        } else {
            format!("{}/{}", base.trim_end_matches('/'), rel)
        }
    }
}
