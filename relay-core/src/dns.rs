//! UDP (仅 DNS) 中继: 长度前缀帧编解码 + DNS-over-HTTPS 查询。
//!
//! 入站块是首尾相连的 `[u16 长度][报文]` 帧, 每个报文单独发起一次 DoH 查询,
//! 结果重新加上长度前缀后写回客户端。各查询互不等待, 回包顺序不保证与请求一致。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::client::ClientConnection;
use crate::error::{RelayError, Result};

pub const DEFAULT_DOH_URL: &str = "https://1.1.1.1/dns-query";
const DNS_MESSAGE: &str = "application/dns-message";
const LENGTH_PREFIX: usize = 2;

/// 长度前缀帧解码器, 不完整的帧留到下一个块再拼
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buf.len() >= LENGTH_PREFIX {
            let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if self.buf.len() < LENGTH_PREFIX + len {
                break;
            }
            self.buf.advance(LENGTH_PREFIX);
            frames.push(self.buf.split_to(len).freeze());
        }
        frames
    }

    /// 尚未凑成完整帧的字节数
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u16::try_from(payload.len())
        .map_err(|_| RelayError::Dns(format!("DNS 响应过长: {} 字节", payload.len())))?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u16(len);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// 把一条 DNS 查询报文换成响应报文
pub trait DnsResolver: Send + Sync + 'static {
    fn resolve(&self, query: Bytes) -> impl Future<Output = Result<Bytes>> + Send;
}

/// 通过 HTTPS POST 查询的 DoH 客户端
#[derive(Debug, Clone)]
pub struct DohClient {
    client: reqwest::Client,
    endpoint: String,
}

impl DohClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Dns(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl DnsResolver for DohClient {
    async fn resolve(&self, query: Bytes) -> Result<Bytes> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(query)
            .send()
            .await
            .map_err(|e| RelayError::Dns(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Dns(format!("DoH 服务器返回 {}", status)));
        }
        response
            .bytes()
            .await
            .map_err(|e| RelayError::Dns(e.to_string()))
    }
}

/// 会话进入 UDP 模式后的 DNS 中继
pub struct DnsRelay<R: DnsResolver> {
    resolver: Arc<R>,
    client: Arc<ClientConnection>,
    decoder: FrameDecoder,
    tasks: JoinSet<()>,
    queries: u64,
}

impl<R: DnsResolver> DnsRelay<R> {
    pub fn new(resolver: Arc<R>, client: Arc<ClientConnection>) -> Self {
        Self {
            resolver,
            client,
            decoder: FrameDecoder::default(),
            tasks: JoinSet::new(),
            queries: 0,
        }
    }

    /// 解码一个入站块, 每个完整报文各自发起一次查询, 不等待结果
    pub fn handle_chunk(&mut self, chunk: &[u8]) {
        for query in self.decoder.push(chunk) {
            self.queries += 1;
            let resolver = self.resolver.clone();
            let client = self.client.clone();
            self.tasks
                .spawn(async move { relay_query(resolver.as_ref(), &client, query).await });
        }

        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                warn!("DNS 查询任务异常退出: {}", e);
            }
        }
    }

    pub fn queries(&self) -> u64 {
        self.queries
    }

    /// 会话结束: 客户端已关闭, 放弃还在进行的查询
    pub async fn shutdown(mut self) {
        if self.decoder.pending() > 0 {
            debug!("丢弃 {} 字节不完整的 UDP 帧", self.decoder.pending());
        }
        self.tasks.shutdown().await;
    }
}

async fn relay_query<R: DnsResolver>(resolver: &R, client: &ClientConnection, query: Bytes) {
    let answer = match resolver.resolve(query).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };
    if !client.is_open() {
        return;
    }

    let frame = match encode_frame(&answer) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };
    debug!("DoH 查询成功, DNS 消息长度 {}", answer.len());
    if let Err(e) = client.send(frame).await {
        debug!("写回 DNS 响应失败: {}", e);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::tests::recording_client;
    use std::sync::Mutex;

    /// 记录收到的查询, 回答 `ans:` + 查询内容
    #[derive(Default)]
    pub(crate) struct EchoResolver {
        pub(crate) queries: Mutex<Vec<Bytes>>,
    }

    impl DnsResolver for EchoResolver {
        async fn resolve(&self, query: Bytes) -> Result<Bytes> {
            self.queries.lock().unwrap().push(query.clone());
            let mut answer = b"ans:".to_vec();
            answer.extend_from_slice(&query);
            Ok(Bytes::from(answer))
        }
    }

    pub(crate) fn framed(payloads: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for p in payloads {
            buf.extend_from_slice(&encode_frame(p).unwrap());
        }
        buf.freeze()
    }

    #[test]
    fn test_decoder_back_to_back_frames() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.push(&framed(&[b"one", b"three"]));
        assert_eq!(frames, vec![Bytes::from_static(b"one"), Bytes::from_static(b"three")]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_frame_across_chunks() {
        let mut decoder = FrameDecoder::default();
        let data = framed(&[b"abcdef"]);

        assert!(decoder.push(&data[..1]).is_empty());
        assert!(decoder.push(&data[1..4]).is_empty());
        assert_eq!(decoder.pending(), 4);
        assert_eq!(decoder.push(&data[4..]), vec![Bytes::from_static(b"abcdef")]);
    }

    #[test]
    fn test_decoder_zero_length_frame() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.push(&[0, 0]), vec![Bytes::new()]);
    }

    #[test]
    fn test_encode_frame() {
        assert_eq!(
            encode_frame(b"xyz").unwrap(),
            Bytes::from_static(&[0x00, 0x03, b'x', b'y', b'z'])
        );
        assert!(encode_frame(&vec![0u8; 70_000]).is_err());
    }

    #[tokio::test]
    async fn test_two_datagrams_two_responses() {
        let (client, sink) = recording_client();
        let client = Arc::new(client);
        client
            .set_response_header(Some(Bytes::from_static(&[0x00, 0x00])))
            .await;
        let resolver = Arc::new(EchoResolver::default());
        let mut relay = DnsRelay::new(resolver.clone(), client.clone());

        relay.handle_chunk(&framed(&[b"q1", b"q2"]));
        while relay.tasks.join_next().await.is_some() {}

        assert_eq!(relay.queries(), 2);
        assert_eq!(resolver.queries.lock().unwrap().len(), 2);

        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        // 响应头只出现在第一个回包前, 顺序不定
        let mut replies: Vec<Vec<u8>> = Vec::new();
        let first = &sent[0];
        assert_eq!(&first[..2], &[0x00, 0x00]);
        replies.push(first[2..].to_vec());
        replies.push(sent[1].to_vec());
        replies.sort();
        assert_eq!(
            replies,
            vec![b"\x00\x06ans:q1".to_vec(), b"\x00\x06ans:q2".to_vec()]
        );
    }
}
