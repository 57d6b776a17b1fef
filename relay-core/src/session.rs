//! 出站编排: 每个客户端连接一个会话。
//!
//! 首个数据块决定协议与目标, 之后的数据块不再解析, 直接写入出站连接
//! 或交给 DNS 中继。主连接没有返回任何数据时, 换回退目标重试一次。

use bytes::Bytes;
use log::{debug, error, info, warn};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;

use crate::client::ClientConnection;
use crate::config::Relay;
use crate::dns::{DnsRelay, DnsResolver};
use crate::error::{RelayError, Result};
use crate::ingress::Ingress;
use crate::outbound::{ConnectPlan, Connector, FallbackTarget, Target};
use crate::protocol::{DNS_PORT, ParsedHeader, Protocol, parse_header};
use crate::sniff::sniff;
use crate::writer::{WriterOutcome, pump_to_client};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TcpConnected,
    UdpCommitted,
    Closed,
}

/// 会话结束后的摘要
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub protocol: Option<Protocol>,
    pub address_remote: Option<String>,
    pub port_remote: Option<u16>,
    pub is_udp: bool,
    /// 出站连接尝试次数 (含失败的)
    pub attempts: u8,
    /// 发给客户端的字节数 (含响应头)
    pub bytes_to_client: u64,
    pub state: SessionState,
}

struct Session {
    client: Arc<ClientConnection>,
    fallback: FallbackTarget,
    state: SessionState,
    header: Option<ParsedHeader>,
    attempts: u8,
    tag: String,
}

/// 运行一个会话直到两个方向都结束
///
/// `fallback` 为 `None` 时使用 `Relay` 的默认回退目标。
/// 无论成功与否, 返回前客户端连接都已关闭。
pub async fn run_session<C, R>(
    relay: &Relay<C, R>,
    mut ingress: Ingress,
    client: Arc<ClientConnection>,
    fallback: Option<FallbackTarget>,
) -> Result<SessionReport>
where
    C: Connector,
    R: DnsResolver,
{
    let mut session = Session {
        client,
        fallback: fallback.unwrap_or_else(|| relay.fallback().clone()),
        state: SessionState::Idle,
        header: None,
        attempts: 0,
        tag: String::from("-"),
    };
    let cancel = ingress.cancel_handle();

    let result = session.drive(relay, &mut ingress).await;

    cancel.cancel("会话结束").await;
    // 之前的关闭可能在等锁时被取消, 这里补上
    session.client.safe_close().await;
    session.state = SessionState::Closed;

    match result {
        Ok(()) => {
            let report = session.report();
            info!(
                "[{}] 会话结束, 尝试 {} 次, 回写 {} 字节",
                session.tag, report.attempts, report.bytes_to_client
            );
            Ok(report)
        }
        Err(e) => {
            if e.is_header_rejection() {
                warn!("[{}] 拒绝请求: {}", session.tag, e);
            } else {
                error!("[{}] 会话出错: {}", session.tag, e);
            }
            Err(e)
        }
    }
}

impl Session {
    fn report(&self) -> SessionReport {
        SessionReport {
            protocol: self.header.as_ref().map(|h| h.protocol),
            address_remote: self.header.as_ref().map(|h| h.address_remote.clone()),
            port_remote: self.header.as_ref().map(|h| h.port_remote),
            is_udp: self.header.as_ref().is_some_and(|h| h.is_udp),
            attempts: self.attempts,
            bytes_to_client: self.client.bytes_sent(),
            state: self.state,
        }
    }

    async fn drive<C, R>(&mut self, relay: &Relay<C, R>, ingress: &mut Ingress) -> Result<()>
    where
        C: Connector,
        R: DnsResolver,
    {
        let first = match ingress.next_chunk().await {
            Some(chunk) => chunk?,
            None => {
                debug!("客户端未发送任何数据就关闭了连接");
                return Ok(());
            }
        };

        // 每个会话只解析一次协议头
        let protocol = sniff(&first);
        let header = parse_header(protocol, &first)?;
        self.tag = format!(
            "{}:{} -> {}",
            header.address_remote,
            header.port_remote,
            header.transport()
        );
        info!("[{}] 识别为 {} 协议", self.tag, protocol);

        let payload = header.raw_client_data.clone();
        let is_udp = header.is_udp;
        let port = header.port_remote;
        let primary = Target::new(header.address_remote.clone(), port);
        let response_header = header.response_header.clone();
        self.header = Some(header);

        if is_udp && port != DNS_PORT {
            return Err(RelayError::UnsupportedUdpPort(port));
        }
        self.client.set_response_header(response_header).await;

        if is_udp {
            self.state = SessionState::UdpCommitted;
            self.relay_dns(relay, ingress, payload).await
        } else {
            self.relay_tcp(relay, ingress, primary, payload).await
        }
    }

    async fn relay_dns<C, R>(&mut self, relay: &Relay<C, R>, ingress: &mut Ingress, payload: Bytes) -> Result<()>
    where
        C: Connector,
        R: DnsResolver,
    {
        let mut dns = DnsRelay::new(relay.resolver().clone(), self.client.clone());
        dns.handle_chunk(&payload);

        let result = loop {
            match ingress.next_chunk().await {
                Some(Ok(chunk)) => dns.handle_chunk(&chunk),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };

        debug!("[{}] 共转发 {} 个 DNS 查询", self.tag, dns.queries());
        dns.shutdown().await;
        result
    }

    async fn relay_tcp<C, R>(
        &mut self,
        relay: &Relay<C, R>,
        ingress: &mut Ingress,
        primary: Target,
        payload: Bytes,
    ) -> Result<()>
    where
        C: Connector,
        R: DnsResolver,
    {
        let mut plan = ConnectPlan::new(primary, self.fallback.clone());
        let (mut writer, mut pump) = self.connect_next(relay, &mut plan, &payload).await?;
        self.state = SessionState::TcpConnected;

        let result = loop {
            tokio::select! {
                chunk = ingress.next_chunk() => match chunk {
                    Some(Ok(data)) => {
                        if let Err(e) = writer.write_all(&data).await {
                            warn!("[{}] 写入出站连接时出错: {}", self.tag, e);
                            break Err(RelayError::Io(e));
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                joined = &mut pump => {
                    let outcome = joined.unwrap_or_else(|e| WriterOutcome {
                        bytes_received: 0,
                        error: Some(RelayError::Io(io::Error::other(e))),
                    });
                    debug!(
                        "[{}] 出站连接已关闭, 收到数据: {}",
                        self.tag,
                        outcome.has_incoming_data()
                    );
                    if outcome.has_incoming_data() {
                        self.client.safe_close().await;
                        break Ok(());
                    }
                    if !self.client.is_open() {
                        debug!("[{}] 客户端已关闭, 不再重试", self.tag);
                        break Ok(());
                    }
                    if !plan.has_retry() {
                        self.client.safe_close().await;
                        break Err(RelayError::Connect(format!(
                            "主连接与回退连接都没有返回数据, 共尝试 {} 次",
                            plan.attempts_used()
                        )));
                    }

                    info!("[{}] 出站连接没有返回任何数据, 改用回退目标重试", self.tag);
                    // 先关掉旧连接, 同一时刻只持有一个出站连接
                    let _ = writer.shutdown().await;
                    match self.connect_next(relay, &mut plan, &payload).await {
                        Ok((next_writer, next_pump)) => {
                            writer = next_writer;
                            pump = next_pump;
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        pump.abort();
        let _ = writer.shutdown().await;
        result
    }

    /// 按连接计划依次尝试, 直到连上一个目标或计划用完
    ///
    /// 连上之后启动 出站 -> 客户端 的拷贝任务。首次连接写入负载,
    /// 回退连接只有在配置允许时才重发。
    async fn connect_next<C, R>(
        &mut self,
        relay: &Relay<C, R>,
        plan: &mut ConnectPlan,
        payload: &Bytes,
    ) -> Result<(WriteHalf<C::Stream>, JoinHandle<WriterOutcome>)>
    where
        C: Connector,
        R: DnsResolver,
    {
        while let Some(target) = plan.next_target() {
            self.attempts = plan.attempts_used();
            let is_retry = plan.attempts_used() > 1;

            let stream = match relay.connector().connect(&target.host, target.port).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[{}] 连接 {} 失败: {}", self.tag, target, e);
                    continue;
                }
            };
            info!("[{}] 已连接到 {}", self.tag, target);

            let (reader, mut writer) = tokio::io::split(stream);
            let send_payload = !payload.is_empty() && (!is_retry || relay.resends_payload_on_retry());
            if send_payload {
                if let Err(e) = writer.write_all(payload).await {
                    warn!("[{}] 向 {} 写入首包失败: {}", self.tag, target, e);
                    continue;
                }
            }

            let pump = tokio::spawn(pump_to_client(reader, self.client.clone()));
            return Ok((writer, pump));
        }

        Err(RelayError::Connect(format!(
            "所有出站目标都无法连接, 共尝试 {} 次",
            plan.attempts_used()
        )))
    }
}
