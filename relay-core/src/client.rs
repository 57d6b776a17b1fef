use bytes::{Bytes, BytesMut};
use futures_util::sink::{Sink, SinkExt};
use log::debug;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};

use crate::error::{RelayError, Result};

/// 发往客户端的二进制消息出口 (WebSocket 发送半部经过适配)
pub type ClientSink = Pin<Box<dyn Sink<Bytes, Error = RelayError> + Send>>;

struct Outgoing {
    sink: ClientSink,
    /// 待发送的协议响应头, 随第一次发送一起发出后清空
    pending_header: Option<Bytes>,
    /// 底层出口已完成关闭
    sink_closed: bool,
}

/// 会话的客户端连接
///
/// 所有回包都经过这里: 发送前检查连接是否仍然打开, 并把待发送的响应头
/// 拼接在第一个回包前面。关闭是幂等的, 任意路径都可以调用 `safe_close`。
pub struct ClientConnection {
    outgoing: Mutex<Outgoing>,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
    bytes_sent: AtomicU64,
}

impl ClientConnection {
    pub fn new(sink: ClientSink) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            outgoing: Mutex::new(Outgoing {
                sink,
                pending_header: None,
                sink_closed: false,
            }),
            open: AtomicBool::new(true),
            closed_tx,
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// 设置首个回包前要附加的响应头, 空头视为没有
    pub async fn set_response_header(&self, header: Option<Bytes>) {
        let mut out = self.outgoing.lock().await;
        out.pending_header = header.filter(|h| !h.is_empty());
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// 客户端累计收到的字节数 (含响应头)
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// 连接关闭时变为 `true` 的信号
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// 发送一个二进制消息, 若还有待发送的响应头则先拼接在前面
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(not_open());
        }
        let mut out = self.outgoing.lock().await;
        // 等锁期间可能已被关闭
        if !self.is_open() {
            return Err(not_open());
        }

        let message = match out.pending_header.take() {
            Some(header) => {
                let mut buf = BytesMut::with_capacity(header.len() + data.len());
                buf.extend_from_slice(&header);
                buf.extend_from_slice(&data);
                buf.freeze()
            }
            None => data,
        };
        let len = message.len() as u64;
        out.sink.send(message).await?;
        self.bytes_sent.fetch_add(len, Ordering::SeqCst);
        Ok(())
    }

    /// 幂等关闭: 底层连接只关闭一次
    ///
    /// 可以中途取消: 标记为关闭后若在等锁时被丢弃, 之后的调用会补上底层关闭。
    pub async fn safe_close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closed_tx.send_replace(true);
        }

        let mut out = self.outgoing.lock().await;
        if out.sink_closed {
            return;
        }
        if let Err(e) = out.sink.close().await {
            debug!("关闭客户端连接时出错: {}", e);
        }
        out.sink_closed = true;
    }
}

fn not_open() -> RelayError {
    RelayError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "客户端连接未处于打开状态",
    ))
}
