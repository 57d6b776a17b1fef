use bytes::Bytes;
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{RelayError, Result};

// VLESS 命令字与地址类型
const VLESS_CMD_TCP: u8 = 0x01;
const VLESS_CMD_UDP: u8 = 0x02;
const VLESS_ADDR_IPV4: u8 = 0x01;
const VLESS_ADDR_DOMAIN: u8 = 0x02;
const VLESS_ADDR_IPV6: u8 = 0x03;

// Trojan / Shadowsocks 沿用 SOCKS5 的地址编号
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_CMD_UDP_ASSOCIATE: u8 = 0x03;
const SOCKS_ADDR_IPV4: u8 = 0x01;
const SOCKS_ADDR_DOMAIN: u8 = 0x03;
const SOCKS_ADDR_IPV6: u8 = 0x04;

/// VLESS: 1 字节版本 + 16 字节 UUID, 之后是附加信息长度
const VLESS_ADDON_LEN_INDEX: usize = 17;
/// Trojan: 56 字节密码哈希 + CRLF
pub const TROJAN_CREDENTIAL_LEN: usize = 58;
/// Trojan 请求体 (命令 + 地址类型 + 最短地址 + 端口) 的最小长度
const TROJAN_MIN_REQUEST_LEN: usize = 6;
/// Trojan 端口之后还有一个 CRLF
const TROJAN_PORT_TRAILER_LEN: usize = 2;

/// DNS 目标端口, UDP 只允许访问它
pub const DNS_PORT: u16 = 53;

/// 嗅探出的客户端协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Trojan,
    Vless,
    Shadowsocks,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Trojan => f.write_str("Trojan"),
            Protocol::Vless => f.write_str("VLESS"),
            Protocol::Shadowsocks => f.write_str("Shadowsocks"),
        }
    }
}

/// 目标地址类型, 与各协议的具体编号无关
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4,
    Domain,
    Ipv6,
}

/// 解析后的协议头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    /// 协议类型
    pub protocol: Protocol,
    /// 地址类型
    pub address_type: AddressType,
    /// 目标地址 (点分 IPv4, 域名, 或未压缩的 IPv6)
    pub address_remote: String,
    /// 目标端口
    pub port_remote: u16,
    /// 协议头之后的负载数据
    pub raw_client_data: Bytes,
    /// 首个回包之前要附加的响应头, 仅 VLESS 有
    pub response_header: Option<Bytes>,
    /// 是否为 UDP 请求
    pub is_udp: bool,
}

impl ParsedHeader {
    pub fn transport(&self) -> &'static str {
        if self.is_udp { "UDP" } else { "TCP" }
    }
}

/// 按协议选择对应的解析器
pub fn parse_header(protocol: Protocol, buf: &Bytes) -> Result<ParsedHeader> {
    match protocol {
        Protocol::Trojan => parse_trojan(buf),
        Protocol::Vless => parse_vless(buf),
        Protocol::Shadowsocks => parse_shadowsocks(buf),
    }
}

/// 解析 VLESS 请求头
///
/// 布局: `[版本][UUID x16][附加长度 N][附加 xN][命令][端口 x2][地址类型][地址][负载]`
pub fn parse_vless(buf: &Bytes) -> Result<ParsedHeader> {
    if buf.len() <= VLESS_ADDON_LEN_INDEX {
        return Err(RelayError::ProtocolParse(format!(
            "VLESS 头部长度不足: {}",
            buf.len()
        )));
    }

    let version = buf[0];
    let addon_len = buf[VLESS_ADDON_LEN_INDEX] as usize;
    let cmd_index = VLESS_ADDON_LEN_INDEX + 1 + addon_len;

    let command = *buf
        .get(cmd_index)
        .ok_or_else(|| truncated(Protocol::Vless, "命令"))?;
    let is_udp = match command {
        VLESS_CMD_TCP => false,
        VLESS_CMD_UDP => true,
        _ => {
            return Err(RelayError::UnsupportedCommand {
                protocol: Protocol::Vless,
                command,
            });
        }
    };

    let port_remote = read_port(buf, cmd_index + 1, Protocol::Vless)?;

    let type_index = cmd_index + 3;
    let address_type = match buf.get(type_index) {
        Some(&VLESS_ADDR_IPV4) => AddressType::Ipv4,
        Some(&VLESS_ADDR_DOMAIN) => AddressType::Domain,
        Some(&VLESS_ADDR_IPV6) => AddressType::Ipv6,
        Some(other) => {
            return Err(RelayError::ProtocolParse(format!(
                "VLESS 无效的地址类型: {}",
                other
            )));
        }
        None => return Err(truncated(Protocol::Vless, "地址类型")),
    };

    let (address_remote, end) = decode_address(buf, type_index + 1, address_type)?;

    Ok(ParsedHeader {
        protocol: Protocol::Vless,
        address_type,
        address_remote,
        port_remote,
        raw_client_data: buf.slice(end..),
        response_header: Some(Bytes::copy_from_slice(&[version, 0x00])),
        is_udp,
    })
}

/// 解析 Trojan 请求头
///
/// 布局: `[密码哈希 x56][CRLF][命令][地址类型][地址][端口 x2][CRLF][负载]`
pub fn parse_trojan(buf: &Bytes) -> Result<ParsedHeader> {
    let request_len = buf.len().saturating_sub(TROJAN_CREDENTIAL_LEN);
    if request_len < TROJAN_MIN_REQUEST_LEN {
        return Err(RelayError::ProtocolParse(format!(
            "Trojan 请求数据长度不足: {}",
            request_len
        )));
    }

    let base = TROJAN_CREDENTIAL_LEN;
    let command = buf[base];
    let is_udp = match command {
        SOCKS_CMD_CONNECT => false,
        SOCKS_CMD_UDP_ASSOCIATE => true,
        _ => {
            return Err(RelayError::UnsupportedCommand {
                protocol: Protocol::Trojan,
                command,
            });
        }
    };

    let address_type = socks_address_type(buf[base + 1], Protocol::Trojan)?;
    let (address_remote, port_index) = decode_address(buf, base + 2, address_type)?;
    let port_remote = read_port(buf, port_index, Protocol::Trojan)?;

    // 端口后的 CRLF 不属于负载
    let payload_start = (port_index + 2 + TROJAN_PORT_TRAILER_LEN).min(buf.len());

    Ok(ParsedHeader {
        protocol: Protocol::Trojan,
        address_type,
        address_remote,
        port_remote,
        raw_client_data: buf.slice(payload_start..),
        response_header: None,
        is_udp,
    })
}

/// 解析 Shadowsocks 请求头 (明文, 无加密层)
///
/// 布局: `[地址类型][地址][端口 x2][负载]`, 端口 53 视为 UDP DNS
pub fn parse_shadowsocks(buf: &Bytes) -> Result<ParsedHeader> {
    let raw_type = *buf
        .first()
        .ok_or_else(|| truncated(Protocol::Shadowsocks, "地址类型"))?;
    let address_type = socks_address_type(raw_type, Protocol::Shadowsocks)?;
    let (address_remote, port_index) = decode_address(buf, 1, address_type)?;
    let port_remote = read_port(buf, port_index, Protocol::Shadowsocks)?;

    Ok(ParsedHeader {
        protocol: Protocol::Shadowsocks,
        address_type,
        address_remote,
        port_remote,
        raw_client_data: buf.slice(port_index + 2..),
        response_header: None,
        is_udp: port_remote == DNS_PORT,
    })
}

fn socks_address_type(value: u8, protocol: Protocol) -> Result<AddressType> {
    match value {
        SOCKS_ADDR_IPV4 => Ok(AddressType::Ipv4),
        SOCKS_ADDR_DOMAIN => Ok(AddressType::Domain),
        SOCKS_ADDR_IPV6 => Ok(AddressType::Ipv6),
        _ => Err(RelayError::ProtocolParse(format!(
            "{} 无效的地址类型: {}",
            protocol, value
        ))),
    }
}

/// 从 `offset` 处解码目标地址, 返回地址字符串和地址之后的下标
fn decode_address(buf: &[u8], offset: usize, address_type: AddressType) -> Result<(String, usize)> {
    let (value, end) = match address_type {
        AddressType::Ipv4 => {
            let end = offset + 4;
            let octets = buf.get(offset..end).ok_or_else(|| address_truncated(address_type))?;
            let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            (ip.to_string(), end)
        }
        AddressType::Domain => {
            let len = *buf.get(offset).ok_or_else(|| address_truncated(address_type))? as usize;
            let start = offset + 1;
            let end = start + len;
            let raw = buf.get(start..end).ok_or_else(|| address_truncated(address_type))?;
            let domain = std::str::from_utf8(raw)
                .map_err(|e| RelayError::ProtocolParse(format!("域名不是有效的 UTF-8: {}", e)))?;
            (domain.to_string(), end)
        }
        AddressType::Ipv6 => {
            let end = offset + 16;
            let raw = buf.get(offset..end).ok_or_else(|| address_truncated(address_type))?;
            // 8 组小写十六进制, 不做零压缩
            let groups: Vec<String> = raw
                .chunks_exact(2)
                .map(|g| format!("{:x}", u16::from_be_bytes([g[0], g[1]])))
                .collect();
            (groups.join(":"), end)
        }
    };

    if value.is_empty() {
        return Err(RelayError::ProtocolParse(format!(
            "目标地址为空, 地址类型: {:?}",
            address_type
        )));
    }
    Ok((value, end))
}

fn read_port(buf: &[u8], offset: usize, protocol: Protocol) -> Result<u16> {
    let raw = buf
        .get(offset..offset + 2)
        .ok_or_else(|| truncated(protocol, "端口"))?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

fn truncated(protocol: Protocol, field: &str) -> RelayError {
    RelayError::ProtocolParse(format!("{} 头部被截断, 缺少{}", protocol, field))
}

fn address_truncated(address_type: AddressType) -> RelayError {
    RelayError::ProtocolParse(format!("目标地址被截断, 地址类型: {:?}", address_type))
}
