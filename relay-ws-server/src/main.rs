use anyhow::Result;
use axum::{
    Router,
    extract::{
        ConnectInfo, Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header::SEC_WEBSOCKET_PROTOCOL},
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use clap::Parser;
use futures_util::{
    future,
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use log::{debug, info};
use relay_core::{
    ChunkStream, ClientConnection, ClientSink, DohClient, FallbackTarget, Ingress, Relay,
    RelayConfig, RelayError, TcpConnector, run_session,
};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "relay-ws-server")]
#[command(about = "WebSocket edge relay (Trojan / VLESS / Shadowsocks)")]
struct Args {
    /// Server listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Fallback target used when the primary connection yields no data
    /// (host:port, host=port or host-port)
    #[arg(short, long)]
    proxy_ip: Option<String>,

    /// DNS-over-HTTPS endpoint for UDP port 53
    #[arg(long, default_value = relay_core::dns::DEFAULT_DOH_URL)]
    doh_url: String,

    /// Outbound TCP connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Per-query DoH timeout in seconds
    #[arg(long, default_value_t = 5)]
    dns_timeout_secs: u64,

    /// Resend the first payload to the fallback target
    #[arg(long)]
    resend_payload_on_retry: bool,

    /// Default log filter, RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            fallback: FallbackTarget::parse(self.proxy_ip.as_deref().unwrap_or_default()),
            doh_url: self.doh_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            dns_timeout: Duration::from_secs(self.dns_timeout_secs),
            resend_payload_on_retry: self.resend_payload_on_retry,
        }
    }
}

#[derive(Debug)]
struct ClientSession {
    peer: SocketAddr,
    connected_at: Instant,
}

type Sessions = Arc<RwLock<HashMap<String, ClientSession>>>;

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay<TcpConnector, DohClient>>,
    sessions: Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = args.relay_config();
    let relay = Relay::from_config(&config)?;
    if config.fallback.is_empty() {
        info!("未配置回退目标, 重试时使用原目标地址");
    }

    // 存储活跃的客户端会话
    let state = AppState {
        relay: Arc::new(relay),
        sessions: Arc::new(RwLock::new(HashMap::new())),
    };

    // `/{fallback}` 为单个连接指定回退目标
    let app = Router::new()
        .route("/", get(ws_handler))
        .route("/{fallback}", get(ws_fallback_handler))
        .with_state(state);

    let addr: SocketAddr = args.listen_addr.parse()?;
    info!("启动 WebSocket 中继在 {}, DoH: {}", addr, config.doh_url);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    upgrade(ws, state, peer, &headers, None)
}

async fn ws_fallback_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(fallback): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    upgrade(ws, state, peer, &headers, Some(FallbackTarget::parse(&fallback)))
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    peer: SocketAddr,
    headers: &HeaderMap,
    fallback: Option<FallbackTarget>,
) -> axum::response::Response {
    let early_data = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    // 部分客户端要求回显子协议, early data 本身就是子协议名
    let ws = match &early_data {
        Some(token) => ws.protocols([token.clone()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, state, peer, early_data, fallback))
}

async fn handle_websocket(
    socket: WebSocket,
    state: AppState,
    peer: SocketAddr,
    early_data: Option<String>,
    fallback: Option<FallbackTarget>,
) {
    // 生成会话 ID
    let session_id = Uuid::new_v4().to_string();
    let active = {
        let mut sessions = state.sessions.write().await;
        sessions.insert(
            session_id.clone(),
            ClientSession {
                peer,
                connected_at: Instant::now(),
            },
        );
        sessions.len()
    };
    info!("WebSocket 连接建立: {} 会话 {}, 活跃会话 {}", peer, session_id, active);

    let (sink, stream) = socket.split();
    let client = Arc::new(ClientConnection::new(client_sink(sink)));
    let ingress = Ingress::new(chunk_stream(stream), early_data.as_deref(), client.clone());

    let result = run_session(state.relay.as_ref(), ingress, client, fallback).await;

    // 清理会话
    let (session, active) = {
        let mut sessions = state.sessions.write().await;
        let session = sessions.remove(&session_id);
        (session, sessions.len())
    };
    let duration = session
        .map(|s| s.connected_at.elapsed())
        .unwrap_or_default();

    match result {
        Ok(report) => info!(
            "会话 {} 结束 ({}), 持续 {:?}, 协议 {}, 回写 {} 字节, 活跃会话 {}",
            session_id,
            peer,
            duration,
            report.protocol.map_or("-".to_string(), |p| p.to_string()),
            report.bytes_to_client,
            active
        ),
        // 错误已由会话记录
        Err(e) => debug!(
            "会话 {} 异常结束 ({}), 持续 {:?}, 活跃会话 {}: {}",
            session_id, peer, duration, active, e
        ),
    }
}

/// 回包一律作为二进制消息发送
fn client_sink(sink: SplitSink<WebSocket, Message>) -> ClientSink {
    Box::pin(
        sink.sink_map_err(|e| RelayError::Io(io::Error::other(e)))
            .with(|data: Bytes| future::ready(Ok::<_, RelayError>(Message::Binary(data)))),
    )
}

/// 收到 Close 帧即视为流结束
fn chunk_stream(stream: SplitStream<WebSocket>) -> ChunkStream {
    stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| future::ready(message_to_chunk(msg)))
        .boxed()
}

fn message_to_chunk(msg: Result<Message, axum::Error>) -> Option<relay_core::Result<Bytes>> {
    match msg {
        Ok(Message::Binary(data)) => Some(Ok(data)),
        Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
        // Ping/Pong 由 axum 处理
        Ok(_) => None,
        Err(e) => Some(Err(RelayError::Ingress(format!("WebSocket 读取失败: {}", e)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_and_text_become_chunks() {
        let chunk = message_to_chunk(Ok(Message::Binary(Bytes::from_static(b"\x01\x02"))));
        assert_eq!(chunk.unwrap().unwrap(), Bytes::from_static(b"\x01\x02"));

        let chunk = message_to_chunk(Ok(Message::Text("abc".into())));
        assert_eq!(chunk.unwrap().unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_control_frames_skipped() {
        assert!(message_to_chunk(Ok(Message::Ping(Bytes::new()))).is_none());
        assert!(message_to_chunk(Ok(Message::Pong(Bytes::new()))).is_none());
    }

    #[test]
    fn test_transport_error_is_ingress_error() {
        let err = axum::Error::new(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(
            message_to_chunk(Err(err)),
            Some(Err(RelayError::Ingress(_)))
        ));
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "relay-ws-server",
            "--proxy-ip",
            "proxy.example.net-2053",
            "--connect-timeout-secs",
            "3",
        ]);
        let config = args.relay_config();
        assert!(!config.fallback.is_empty());
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.dns_timeout, Duration::from_secs(5));
        assert_eq!(config.doh_url, relay_core::dns::DEFAULT_DOH_URL);
        assert!(!config.resend_payload_on_retry);
        assert_eq!(args.listen_addr, "0.0.0.0:8080");
    }
}
