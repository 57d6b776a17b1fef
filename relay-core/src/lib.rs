//! WebSocket 边缘中继引擎。
//!
//! 从客户端首个数据块识别 Trojan / VLESS / Shadowsocks, 解析目标地址后
//! 建立 TCP 隧道 (主目标失败或无数据时回退重试一次), UDP 只支持 53 端口,
//! 通过 DNS-over-HTTPS 转发。传输层 (WebSocket) 由调用方适配成
//! `ChunkStream` 与 `ClientSink` 后交给 `run_session`。

pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod ingress;
pub mod outbound;
pub mod protocol;
pub mod session;
pub mod sniff;
pub mod writer;

pub use client::{ClientConnection, ClientSink};
pub use config::{Relay, RelayConfig};
pub use dns::{DnsResolver, DohClient};
pub use error::{RelayError, Result};
pub use ingress::{ChunkStream, Ingress};
pub use outbound::{Connector, FallbackTarget, TcpConnector};
pub use protocol::Protocol;
pub use session::{SessionReport, SessionState, run_session};
