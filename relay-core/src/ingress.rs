//! 入站适配: 把客户端连接变成有序、可取消的数据块序列。
//!
//! 序列的第一个块可能来自握手时携带的 early data (base64url),
//! 之后依次是客户端发来的二进制消息。状态流转:
//! `Idle -> Streaming -> Draining -> Closed`, 取消可以从任意状态直接进入 `Closed`。

use base64::{
    Engine, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

use crate::client::ClientConnection;
use crate::error::{RelayError, Result};

/// 客户端传输层产出的数据块, 流结束即表示收到关闭事件
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// 允许省略填充, 也容忍末尾多余的比特
const EARLY_DATA_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// 解码 early data, 空串表示没有
///
/// 同时接受标准字母表的 `+` 和 `/`。
pub fn decode_early_data(token: &str) -> Result<Option<Bytes>> {
    let token = token.trim();
    if token.is_empty() {
        return Ok(None);
    }
    let normalized: String = token
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    EARLY_DATA_ENGINE
        .decode(normalized)
        .map(|data| Some(Bytes::from(data)))
        .map_err(|e| RelayError::Ingress(format!("early data 解码失败: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressState {
    Idle,
    Streaming,
    Draining,
    Closed,
}

pub struct Ingress {
    state: IngressState,
    early_data: Option<Result<Bytes>>,
    inner: ChunkStream,
    client: Arc<ClientConnection>,
    cancelled: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
}

impl Ingress {
    pub fn new(inner: ChunkStream, early_data: Option<&str>, client: Arc<ClientConnection>) -> Self {
        let early_data = decode_early_data(early_data.unwrap_or_default()).transpose();
        let closed = client.closed_signal();
        Self {
            state: IngressState::Idle,
            early_data,
            inner,
            client,
            cancelled: Arc::new(AtomicBool::new(false)),
            closed,
        }
    }

    pub fn state(&self) -> IngressState {
        self.state
    }

    pub fn cancel_handle(&self) -> IngressCancel {
        IngressCancel {
            cancelled: self.cancelled.clone(),
            client: self.client.clone(),
        }
    }

    /// 取下一个数据块; 返回 `None` 表示序列已结束
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.state = IngressState::Closed;
            return None;
        }

        match self.state {
            IngressState::Idle => {
                self.state = IngressState::Streaming;
                match self.early_data.take() {
                    Some(Ok(data)) => return Some(Ok(data)),
                    Some(Err(e)) => {
                        self.state = IngressState::Closed;
                        return Some(Err(e));
                    }
                    None => {}
                }
            }
            IngressState::Streaming => {}
            IngressState::Draining | IngressState::Closed => return None,
        }

        let closed = &mut self.closed;
        let event = tokio::select! {
            biased;
            _ = async {
                let _ = closed.wait_for(|closed| *closed).await;
            } => None,
            item = self.inner.next() => Some(item),
        };

        match event {
            // 连接已在别处关闭或被取消
            None => {
                self.state = IngressState::Closed;
                None
            }
            Some(None) => {
                debug!("客户端关闭了连接");
                self.state = IngressState::Draining;
                self.client.safe_close().await;
                self.state = IngressState::Closed;
                None
            }
            Some(Some(Ok(chunk))) => {
                if self.cancelled.load(Ordering::SeqCst) {
                    self.state = IngressState::Closed;
                    return None;
                }
                Some(Ok(chunk))
            }
            Some(Some(Err(e))) => {
                warn!("客户端连接出错: {}", e);
                self.state = IngressState::Closed;
                Some(Err(e))
            }
        }
    }
}

/// 取消入站流的句柄, 可以从多个收尾路径并发调用
#[derive(Clone)]
pub struct IngressCancel {
    cancelled: Arc<AtomicBool>,
    client: Arc<ClientConnection>,
}

impl IngressCancel {
    pub async fn cancel(&self, reason: &str) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("入站流被取消: {}", reason);
        self.client.safe_close().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::recording_client;
    use futures_util::stream;

    fn chunks(items: Vec<Result<Bytes>>) -> ChunkStream {
        stream::iter(items).boxed()
    }

    #[test]
    fn test_decode_early_data_variants() {
        assert_eq!(decode_early_data("").unwrap(), None);
        // "hello?" 的 url-safe 编码, 带填充与不带填充
        assert_eq!(
            decode_early_data("aGVsbG8_").unwrap(),
            Some(Bytes::from_static(b"hello?"))
        );
        assert_eq!(
            decode_early_data("aGVsbG8/").unwrap(),
            Some(Bytes::from_static(b"hello?"))
        );
        assert_eq!(decode_early_data("AQI").unwrap(), Some(Bytes::from_static(&[1, 2])));
        assert_eq!(decode_early_data("AQI=").unwrap(), Some(Bytes::from_static(&[1, 2])));
        assert!(decode_early_data("***").is_err());
    }

    #[tokio::test]
    async fn test_early_data_comes_first() {
        let (client, _sink) = recording_client();
        let live = chunks(vec![Ok(Bytes::from_static(b"b")), Ok(Bytes::from_static(b"c"))]);
        let mut ingress = Ingress::new(live, Some("YQ"), Arc::new(client));

        assert_eq!(ingress.state(), IngressState::Idle);
        assert_eq!(ingress.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(ingress.state(), IngressState::Streaming);
        assert_eq!(ingress.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        assert_eq!(ingress.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"c"));
        assert!(ingress.next_chunk().await.is_none());
        assert_eq!(ingress.state(), IngressState::Closed);
    }

    #[tokio::test]
    async fn test_bad_early_data_is_terminal() {
        let (client, _sink) = recording_client();
        let live = chunks(vec![Ok(Bytes::from_static(b"live"))]);
        let mut ingress = Ingress::new(live, Some("!!"), Arc::new(client));

        assert!(matches!(
            ingress.next_chunk().await,
            Some(Err(RelayError::Ingress(_)))
        ));
        assert!(ingress.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_transport_close_closes_client() {
        let (client, sink) = recording_client();
        let client = Arc::new(client);
        let mut ingress = Ingress::new(chunks(vec![]), None, client.clone());

        assert!(ingress.next_chunk().await.is_none());
        assert!(!client.is_open());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_terminal() {
        let (client, _sink) = recording_client();
        let live = chunks(vec![
            Err(RelayError::Ingress("reset".into())),
            Ok(Bytes::from_static(b"never")),
        ]);
        let mut ingress = Ingress::new(live, None, Arc::new(client));

        assert!(matches!(ingress.next_chunk().await, Some(Err(_))));
        assert!(ingress.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let (client, sink) = recording_client();
        let live: ChunkStream = stream::iter(vec![Ok(Bytes::from_static(b"first"))])
            .chain(stream::pending())
            .boxed();
        let mut ingress = Ingress::new(live, None, Arc::new(client));
        let cancel = ingress.cancel_handle();

        assert!(ingress.next_chunk().await.is_some());

        let waiter = tokio::spawn(async move { ingress.next_chunk().await.is_none() });
        cancel.cancel("test").await;
        cancel.cancel("again").await;

        assert!(waiter.await.unwrap());
        assert!(cancel.is_cancelled());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }
}
