use bytes::BytesMut;
use log::{debug, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::client::ClientConnection;
use crate::error::RelayError;

const READ_BUF_SIZE: usize = 8192;

/// 一次 出站 -> 客户端 拷贝的结果
#[derive(Debug)]
pub struct WriterOutcome {
    /// 从出站连接读到的字节数
    pub bytes_received: u64,
    pub error: Option<RelayError>,
}

impl WriterOutcome {
    /// 远端是否送来过任何数据, 决定要不要回退重试
    pub fn has_incoming_data(&self) -> bool {
        self.bytes_received > 0
    }
}

/// 把出站连接读到的数据转发给客户端, 直到远端关闭或出错
///
/// 待发送的响应头由 `ClientConnection` 拼在第一个回包前。
/// 这里不关闭客户端连接: 没有收到数据时还可能由回退连接接手,
/// 是否关闭由会话根据结果决定。
pub async fn pump_to_client<R>(mut remote: R, client: Arc<ClientConnection>) -> WriterOutcome
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    let mut bytes_received = 0u64;
    let mut error = None;

    loop {
        buf.reserve(READ_BUF_SIZE);
        let n = match remote.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("从出站连接读取数据时出错: {}", e);
                error = Some(RelayError::Io(e));
                break;
            }
        };
        bytes_received += n as u64;

        if let Err(e) = client.send(buf.split().freeze()).await {
            warn!("发送数据到客户端时出错: {}", e);
            error = Some(e);
            break;
        }
    }

    debug!(
        "出站连接读取结束, 收到 {} 字节, 出错: {}",
        bytes_received,
        error.is_some()
    );
    WriterOutcome {
        bytes_received,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::recording_client;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_pump_forwards_with_header() {
        let (client, sink) = recording_client();
        let client = Arc::new(client);
        client
            .set_response_header(Some(Bytes::from_static(&[0x00, 0x00])))
            .await;

        let (local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"hello").await.unwrap();
        drop(remote);

        let outcome = pump_to_client(local, client.clone()).await;

        assert!(outcome.has_incoming_data());
        assert!(outcome.error.is_none());
        let sent = sink.sent.lock().unwrap().concat();
        assert_eq!(sent, b"\x00\x00hello");
        // 关闭由会话决定
        assert!(client.is_open());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_remote_keeps_header_pending() {
        let (client, sink) = recording_client();
        let client = Arc::new(client);
        client
            .set_response_header(Some(Bytes::from_static(&[0x01, 0x00])))
            .await;
        let (local, remote) = tokio::io::duplex(64);
        drop(remote);

        let outcome = pump_to_client(local, client.clone()).await;
        assert!(!outcome.has_incoming_data());
        assert!(client.is_open());
        assert!(sink.sent.lock().unwrap().is_empty());

        // 下一条连接的第一个回包仍然带着响应头
        let (local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"x").await.unwrap();
        drop(remote);
        pump_to_client(local, client).await;
        assert_eq!(sink.sent.lock().unwrap().concat(), b"\x01\x00x");
    }

    #[tokio::test]
    async fn test_closed_client_stops_pump() {
        let (client, _sink) = recording_client();
        let client = Arc::new(client);
        client.safe_close().await;

        let (local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"data").await.unwrap();

        let outcome = pump_to_client(local, client).await;
        assert!(outcome.has_incoming_data());
        assert!(outcome.error.is_some());
    }
}
