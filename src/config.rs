use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use hickory_proto::rr::Name;
use serde::Deserialize;
use tracing::{info, warn};

use crate::health::{DEFAULT_INTERVAL, DEFAULT_MAX_FAILS};
use crate::proxy::{DEFAULT_READ_TIMEOUT, Options};
use crate::transport::DEFAULT_EXPIRE;

const DNS_PORT: u16 = 53;
const DNS_OVER_TLS_PORT: u16 = 853;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// 转发的域（后缀），缺省根域 "."。
    #[serde(default = "default_from")]
    pub from: String,
    /// 不转发的子域。
    #[serde(default)]
    pub except: Vec<String>,
    /// 上游列表："1.1.1.1"、"8.8.8.8:53"、"tls://9.9.9.9"。
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub force_tcp: bool,
    #[serde(default)]
    pub prefer_udp: bool,
    /// 空闲连接过期时间（毫秒）。
    #[serde(default = "default_expire_ms")]
    pub expire_ms: u64,
    /// 连续健康检查失败多少次后标记上游不可用；0 表示从不标记。
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    /// 健康检查间隔（毫秒）。
    #[serde(default = "default_health_check_ms")]
    pub health_check_ms: u64,
    /// 上游读超时（毫秒）。
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl ForwardConfig {
    pub fn options(&self) -> Options {
        Options {
            force_tcp: self.force_tcp,
            prefer_udp: self.prefer_udp,
        }
    }

    pub fn expire(&self) -> Duration {
        Duration::from_millis(self.expire_ms)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Order in which upstreams are tried.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    #[default]
    Random,
    RoundRobin,
    Sequential,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// 证书校验使用的服务器名；缺省使用上游 IP。
    #[serde(default)]
    pub server_name: Option<String>,
    /// PEM 格式 CA 文件；缺省使用 webpki 根证书。
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub tls: bool,
}

/// Parse `[scheme://]ip[:port]`. `tls://` selects DNS-over-TLS on 853 by
/// default, plain upstreams default to 53.
pub fn parse_upstream(raw: &str) -> Result<Upstream> {
    let raw = raw.trim();
    let (rest, tls) = if let Some(rest) = raw.strip_prefix("tls://") {
        (rest, true)
    } else if let Some(rest) = raw.strip_prefix("dns://") {
        (rest, false)
    } else {
        (raw, false)
    };
    let port = if tls { DNS_OVER_TLS_PORT } else { DNS_PORT };

    if let Ok(addr) = rest.parse::<SocketAddr>() {
        return Ok(Upstream { addr, tls });
    }
    let host = rest.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("invalid upstream address: {}", raw))?;
    Ok(Upstream {
        addr: SocketAddr::new(ip, port),
        tls,
    })
}

pub fn parse_zone(raw: &str) -> Result<Name> {
    let mut name = Name::from_ascii(raw).with_context(|| format!("invalid zone: {}", raw))?;
    name.set_fqdn(true);
    Ok(name)
}

pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ServerConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    validate(&cfg)?;
    Ok(cfg)
}

/// 轻量校验：地址、域名提前解析，启动和热加载时尽早报错。
pub fn validate(cfg: &ServerConfig) -> Result<()> {
    cfg.settings
        .bind_udp
        .parse::<SocketAddr>()
        .context("parse udp bind addr")?;
    cfg.settings
        .bind_tcp
        .parse::<SocketAddr>()
        .context("parse tcp bind addr")?;

    let fwd = &cfg.forward;
    if fwd.upstreams.is_empty() {
        anyhow::bail!("forward.upstreams is empty");
    }
    for up in &fwd.upstreams {
        parse_upstream(up)?;
    }
    parse_zone(&fwd.from)?;
    for zone in &fwd.except {
        parse_zone(zone)?;
    }
    if fwd.expire_ms == 0 {
        anyhow::bail!("forward.expire_ms must be positive");
    }
    if fwd.health_check_ms == 0 {
        anyhow::bail!("forward.health_check_ms must be positive");
    }
    if fwd.read_timeout_ms == 0 {
        anyhow::bail!("forward.read_timeout_ms must be positive");
    }
    if fwd.force_tcp && fwd.prefer_udp {
        warn!(target = "config", "both force_tcp and prefer_udp set; force_tcp wins");
    }
    Ok(())
}


fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_from() -> String {
    ".".to_string()
}

fn default_expire_ms() -> u64 {
    DEFAULT_EXPIRE.as_millis() as u64
}

fn default_max_fails() -> u32 {
    DEFAULT_MAX_FAILS
}

fn default_health_check_ms() -> u64 {
    DEFAULT_INTERVAL.as_millis() as u64
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}
