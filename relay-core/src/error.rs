use std::io;
use thiserror::Error;

use crate::protocol::Protocol;

/// 中继引擎统一的错误类型
#[derive(Error, Debug)]
pub enum RelayError {
    /// 协议头字段错误或无法识别
    #[error("协议解析错误: {0}")]
    ProtocolParse(String),

    /// 命令字不在该协议支持的 TCP / UDP 范围内
    #[error("{protocol} 不支持的命令: {command}")]
    UnsupportedCommand { protocol: Protocol, command: u8 },

    /// UDP 只允许访问 53 端口 (DNS)
    #[error("UDP 仅支持 DNS 53 端口, 请求端口: {0}")]
    UnsupportedUdpPort(u16),

    /// 主连接与回退连接都失败或没有任何数据
    #[error("出站连接失败: {0}")]
    Connect(String),

    /// early data 无效或客户端传输层故障
    #[error("入站错误: {0}")]
    Ingress(String),

    /// 单次 DoH 查询失败
    #[error("DoH 查询失败: {0}")]
    Dns(String),

    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// 在建立任何出站连接之前就终止会话的错误
    pub fn is_header_rejection(&self) -> bool {
        matches!(
            self,
            RelayError::ProtocolParse(_)
                | RelayError::UnsupportedCommand { .. }
                | RelayError::UnsupportedUdpPort(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_rejection_classification() {
        assert!(RelayError::ProtocolParse("x".into()).is_header_rejection());
        assert!(RelayError::UnsupportedUdpPort(443).is_header_rejection());
        assert!(
            RelayError::UnsupportedCommand {
                protocol: Protocol::Trojan,
                command: 9
            }
            .is_header_rejection()
        );
        assert!(!RelayError::Connect("down".into()).is_header_rejection());
        assert!(!RelayError::Ingress("bad".into()).is_header_rejection());
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::UnsupportedCommand {
            protocol: Protocol::Vless,
            command: 3,
        };
        assert_eq!(err.to_string(), "VLESS 不支持的命令: 3");
        assert_eq!(
            RelayError::UnsupportedUdpPort(443).to_string(),
            "UDP 仅支持 DNS 53 端口, 请求端口: 443"
        );
    }
}
