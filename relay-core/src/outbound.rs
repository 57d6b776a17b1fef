use log::debug;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::Ipv6Addr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// 一次会话最多两次连接: 主目标 + 一次回退
const MAX_ATTEMPTS: u8 = 2;

/// 建立出站连接的抽象, 测试里可以换成内存连接
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, host: &str, port: u16) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// 直连 TCP, 连接建立有超时
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("连接 {}:{} 超时 ({:?})", host, port, self.timeout),
                )
            })??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("设置 TCP_NODELAY 失败: {}", e);
        }
        Ok(stream)
    }
}

/// 出站连接目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// 回退目标 (外部配置的 proxy ip), 只读
///
/// 缺省的部分沿用原始目标: 没有端口时用原端口, 为空时重试原地址。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackTarget {
    host: Option<String>,
    port: Option<u16>,
}

impl FallbackTarget {
    /// 解析 `host:port`, 也接受 `host=port` 与 `host-port`
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            return Self::default();
        }

        // [v6]:port 或 [v6]
        if let Some(rest) = value.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix([':', '=', '-'])
                    .and_then(|p| p.parse::<u16>().ok());
                return Self::from_parts(host, port);
            }
        }

        // 不带端口的裸 IPv6
        if value.parse::<Ipv6Addr>().is_ok() {
            return Self::from_parts(value, None);
        }

        if let Some(index) = value.rfind([':', '=', '-']) {
            if let Ok(port) = value[index + 1..].parse::<u16>() {
                return Self::from_parts(&value[..index], Some(port));
            }
        }
        Self::from_parts(value, None)
    }

    fn from_parts(host: &str, port: Option<u16>) -> Self {
        let host = host.trim();
        Self {
            host: (!host.is_empty()).then(|| host.to_string()),
            port,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none()
    }

    /// 用原始目标补全缺省部分
    pub fn resolve(&self, primary: &Target) -> Target {
        Target {
            host: self.host.clone().unwrap_or_else(|| primary.host.clone()),
            port: self.port.unwrap_or(primary.port),
        }
    }
}

/// 连接计划: 主目标一次, 回退目标一次, 之后不再给出目标
#[derive(Debug, Clone)]
pub struct ConnectPlan {
    primary: Target,
    fallback: FallbackTarget,
    attempts_used: u8,
}

impl ConnectPlan {
    pub fn new(primary: Target, fallback: FallbackTarget) -> Self {
        Self {
            primary,
            fallback,
            attempts_used: 0,
        }
    }

    pub fn next_target(&mut self) -> Option<Target> {
        let target = match self.attempts_used {
            0 => self.primary.clone(),
            1 => self.fallback.resolve(&self.primary),
            _ => return None,
        };
        self.attempts_used += 1;
        Some(target)
    }

    pub fn attempts_used(&self) -> u8 {
        self.attempts_used
    }

    /// 是否还剩下一次回退机会
    pub fn has_retry(&self) -> bool {
        self.attempts_used < MAX_ATTEMPTS
    }
}
