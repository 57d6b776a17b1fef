use std::sync::Arc;
use std::time::Duration;

use crate::dns::{DEFAULT_DOH_URL, DnsResolver, DohClient};
use crate::error::Result;
use crate::outbound::{Connector, FallbackTarget, TcpConnector};

/// 中继配置
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 默认回退目标, 可以被单个连接覆盖
    pub fallback: FallbackTarget,
    /// DoH 服务器地址
    pub doh_url: String,
    /// 出站 TCP 连接超时
    pub connect_timeout: Duration,
    /// 单次 DoH 查询超时
    pub dns_timeout: Duration,
    /// 回退连接是否重发首个数据块里的负载
    pub resend_payload_on_retry: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackTarget::default(),
            doh_url: DEFAULT_DOH_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(5),
            resend_payload_on_retry: false,
        }
    }
}

/// 所有会话共享的只读上下文
pub struct Relay<C, R> {
    connector: C,
    resolver: Arc<R>,
    fallback: FallbackTarget,
    resend_payload_on_retry: bool,
}

impl Relay<TcpConnector, DohClient> {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let resolver = DohClient::new(config.doh_url.clone(), config.dns_timeout)?;
        Ok(Relay::new(
            TcpConnector::new(config.connect_timeout),
            Arc::new(resolver),
            config.fallback.clone(),
        )
        .resend_payload_on_retry(config.resend_payload_on_retry))
    }
}

impl<C: Connector, R: DnsResolver> Relay<C, R> {
    pub fn new(connector: C, resolver: Arc<R>, fallback: FallbackTarget) -> Self {
        Self {
            connector,
            resolver,
            fallback,
            resend_payload_on_retry: false,
        }
    }

    pub fn resend_payload_on_retry(mut self, enabled: bool) -> Self {
        self.resend_payload_on_retry = enabled;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn resolver(&self) -> &Arc<R> {
        &self.resolver
    }

    pub fn fallback(&self) -> &FallbackTarget {
        &self.fallback
    }

    pub fn resends_payload_on_retry(&self) -> bool {
        self.resend_payload_on_retry
    }
}
