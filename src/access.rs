//! 基于 IP 白名单的上传访问控制。
//!
//! 白名单保存在 JSON 配置文件中，每个请求都会重新读取，修改后无需重启即可生效。
//! 配置缺失时写入只包含回环地址的默认配置；读取或解析失败时一律拒绝（fail closed）。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderName, Request};
use axum::{middleware, response::Response};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::DEFAULT_ALLOWED_IPS;
use crate::error::ApiError;

/// 白名单配置文件的内容。
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(rename = "AllowedIps", default)]
    pub allowed_addresses: Vec<String>,
    #[serde(rename = "AllowProxyIp", default)]
    pub trust_proxy_header: bool,
}

impl AccessConfig {
    /// 首次启动时写入的默认配置：仅允许本机回环地址。
    pub fn loopback() -> Self {
        Self {
            allowed_addresses: DEFAULT_ALLOWED_IPS.iter().map(|ip| ip.to_string()).collect(),
            trust_proxy_header: false,
        }
    }

    /// 拒绝所有请求的配置，用于配置不可读时。
    pub fn deny_all() -> Self {
        Self::default()
    }
}

/// 访问控制中间件共享的设置。
#[derive(Debug)]
pub struct AccessPolicy {
    pub config_path: PathBuf,
    pub proxy_header: HeaderName,
}

impl AccessPolicy {
    pub fn new(config_path: PathBuf, proxy_header: HeaderName) -> Self {
        Self {
            config_path,
            proxy_header,
        }
    }

    fn forwarded_value<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(&self.proxy_header)
            .and_then(|value| value.to_str().ok())
    }
}

/// 读取白名单配置；文件不存在时先写入默认配置。
pub async fn load_access_config(path: &Path) -> AccessConfig {
    if let Err(err) = ensure_default_config(path).await {
        warn!(path = ?path, error = %err, "failed to create default access config");
    }

    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(err) => {
            warn!(path = ?path, error = %err, "access config unreadable, denying all");
            return AccessConfig::deny_all();
        }
    };

    match serde_json::from_slice::<AccessConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            warn!(path = ?path, error = %err, "access config malformed, denying all");
            AccessConfig::deny_all()
        }
    }
}

async fn ensure_default_config(path: &Path) -> std::io::Result<()> {
    if fs::try_exists(path).await? {
        return Ok(());
    }
    info!(path = ?path, "access config does not exist, creating default");
    let content = serde_json::to_vec_pretty(&AccessConfig::loopback())
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => return Err(err),
    };
    file.write_all(&content).await?;
    file.flush().await
}

/// 判断请求是否允许上传。
///
/// 仅当配置信任代理且转发头非空时使用转发头中的地址，否则从 `remote_addr`
/// 去掉端口得到候选地址。候选地址必须与白名单中的某一项逐字节相等。
pub fn is_allowed(remote_addr: &str, forwarded: Option<&str>, config: &AccessConfig) -> bool {
    let candidate = match forwarded {
        Some(value) if config.trust_proxy_header && !value.is_empty() => value,
        _ => match split_host(remote_addr) {
            Some(host) => host,
            None => {
                warn!(remote_addr, "failed to split client address");
                return false;
            }
        },
    };

    if config
        .allowed_addresses
        .iter()
        .any(|allowed| allowed == candidate)
    {
        return true;
    }
    warn!(remote_addr, candidate, "client blocked from /upload");
    false
}

/// 从 `host:port` 或 `[ipv6]:port` 中取出主机部分。
fn split_host(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        if port.contains([':', '[', ']']) {
            return None;
        }
        return Some(host);
    }

    let (host, _port) = addr.rsplit_once(':')?;
    if host.contains([':', '[', ']']) {
        return None;
    }
    Some(host)
}

/// 双栈监听时 IPv4 客户端以 `::ffff:a.b.c.d` 出现，先还原为 IPv4 再比较。
fn peer_address(addr: &SocketAddr) -> String {
    SocketAddr::new(addr.ip().to_canonical(), addr.port()).to_string()
}

/// 上传路由的访问控制中间件：重新加载白名单，拒绝时返回 401。
pub async fn require_allowed_client(
    Extension(policy): Extension<Arc<AccessPolicy>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| peer_address(addr))
        .unwrap_or_default();
    let config = load_access_config(&policy.config_path).await;

    if is_allowed(&remote_addr, policy.forwarded_value(req.headers()), &config) {
        return Ok(next.run(req).await);
    }
    Err(ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn allowlist(addresses: &[&str], trust_proxy_header: bool) -> AccessConfig {
        AccessConfig {
            allowed_addresses: addresses.iter().map(|ip| ip.to_string()).collect(),
            trust_proxy_header,
        }
    }

    #[test]
    fn allowlisted_addresses_pass_with_any_port() {
        let config = allowlist(&["127.0.0.1", "::1", "10.0.0.7"], false);
        assert!(is_allowed("127.0.0.1:80", None, &config));
        assert!(is_allowed("127.0.0.1:54321", None, &config));
        assert!(is_allowed("[::1]:8080", None, &config));
        assert!(is_allowed("10.0.0.7:1", None, &config));
    }

    #[test]
    fn other_addresses_are_denied() {
        let config = allowlist(&["127.0.0.1"], false);
        assert!(!is_allowed("127.0.0.2:80", None, &config));
        assert!(!is_allowed("[::1]:80", None, &config));
        assert!(!is_allowed("192.168.1.10:443", None, &config));
    }

    #[test]
    fn matching_is_exact_string_equality() {
        let config = allowlist(&["::1", "10.0.0.0/8"], false);
        assert!(!is_allowed("[0:0:0:0:0:0:0:1]:80", None, &config));
        assert!(!is_allowed("10.1.2.3:80", None, &config));

        let upper = allowlist(&["FE80::1"], false);
        assert!(!is_allowed("[fe80::1]:80", None, &upper));
    }

    #[test]
    fn malformed_remote_address_is_denied() {
        let config = allowlist(&["127.0.0.1", "::1"], false);
        assert!(!is_allowed("127.0.0.1", None, &config));
        assert!(!is_allowed("::1", None, &config));
        assert!(!is_allowed("[::1]", None, &config));
        assert!(!is_allowed("", None, &config));
    }

    #[test]
    fn trusted_proxy_header_overrides_remote_address() {
        let config = allowlist(&["203.0.113.9"], true);
        assert!(is_allowed("127.0.0.1:9000", Some("203.0.113.9"), &config));
        assert!(!is_allowed("203.0.113.9:9000", Some("198.51.100.1"), &config));
    }

    #[test]
    fn empty_proxy_header_falls_back_to_remote_address() {
        let config = allowlist(&["127.0.0.1"], true);
        assert!(is_allowed("127.0.0.1:9000", Some(""), &config));
        assert!(is_allowed("127.0.0.1:9000", None, &config));
    }

    #[test]
    fn proxy_header_ignored_unless_trusted() {
        let config = allowlist(&["203.0.113.9"], false);
        assert!(!is_allowed("127.0.0.1:9000", Some("203.0.113.9"), &config));
    }

    #[test]
    fn split_host_handles_both_forms() {
        assert_eq!(split_host("1.2.3.4:80"), Some("1.2.3.4"));
        assert_eq!(split_host("[fe80::1%eth0]:80"), Some("fe80::1%eth0"));
        assert_eq!(split_host("localhost:"), Some("localhost"));
        assert_eq!(split_host("::1:80"), None);
        assert_eq!(split_host("[::1]80"), None);
        assert_eq!(split_host("[::1]:80:90"), None);
    }

    #[test]
    fn mapped_ipv4_peers_match_ipv4_entries() {
        let mapped = SocketAddr::new(
            std::net::Ipv4Addr::LOCALHOST.to_ipv6_mapped().into(),
            50123,
        );
        assert_eq!(peer_address(&mapped), "127.0.0.1:50123");

        let v6: SocketAddr = "[::1]:8080".parse().expect("addr");
        assert_eq!(peer_address(&v6), "[::1]:8080");

        let config = AccessConfig::loopback();
        assert!(is_allowed(&peer_address(&mapped), None, &config));
        assert!(is_allowed(&peer_address(&v6), None, &config));
    }

    #[tokio::test]
    async fn missing_config_is_created_with_loopback_defaults() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");

        let loaded = load_access_config(&path).await;
        assert_eq!(loaded, AccessConfig::loopback());
        assert!(path.exists());

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(written["AllowedIps"], serde_json::json!(["127.0.0.1", "::1"]));
        assert_eq!(written["AllowProxyIp"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn existing_config_is_not_overwritten() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"AllowedIps": ["10.1.1.1"], "AllowProxyIp": true}"#)
            .expect("write");

        let loaded = load_access_config(&path).await;
        assert_eq!(loaded, allowlist(&["10.1.1.1"], true));
        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("10.1.1.1"));
    }

    #[tokio::test]
    async fn missing_fields_take_zero_values() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"AllowProxyIp": true, "Extra": 1}"#).expect("write");

        let loaded = load_access_config(&path).await;
        assert!(loaded.allowed_addresses.is_empty());
        assert!(loaded.trust_proxy_header);
    }

    #[tokio::test]
    async fn malformed_config_fails_closed() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write");

        let loaded = load_access_config(&path).await;
        assert_eq!(loaded, AccessConfig::deny_all());
        assert!(!is_allowed("127.0.0.1:80", None, &loaded));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{ not json");
    }

    #[tokio::test]
    async fn unreadable_config_fails_closed() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::create_dir(&path).expect("mkdir");

        let loaded = load_access_config(&path).await;
        assert!(!is_allowed("127.0.0.1:80", None, &loaded));
    }
}
