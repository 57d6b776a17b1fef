//! 根据首个数据块识别客户端协议。
//!
//! 规则按顺序求值, 第一个命中的规则决定协议; 都不命中时回落到 Shadowsocks。
//! 嗅探只针对第一个数据块, 不跨块重试。

use uuid::{Uuid, Variant};

use crate::protocol::Protocol;

/// Trojan 签名: 第 56 字节开始的 CRLF + 命令 + 地址类型
const TROJAN_SIGNATURE_OFFSET: usize = 56;
const TROJAN_MIN_LEN: usize = 62;
const TROJAN_COMMANDS: [u8; 3] = [0x01, 0x03, 0x7F];
const TROJAN_ADDRESS_TYPES: [u8; 3] = [0x01, 0x03, 0x04];

/// VLESS 的 UUID 紧跟在 1 字节版本号之后
const VLESS_UUID_RANGE: std::ops::Range<usize> = 1..17;

type Rule = (fn(&[u8]) -> bool, Protocol);

/// 有序规则表, 顺序即优先级
const RULES: [Rule; 2] = [
    (looks_like_trojan, Protocol::Trojan),
    (looks_like_vless, Protocol::Vless),
];

const DEFAULT_PROTOCOL: Protocol = Protocol::Shadowsocks;

pub fn sniff(buf: &[u8]) -> Protocol {
    RULES
        .iter()
        .find(|(matches, _)| matches(buf))
        .map(|(_, protocol)| *protocol)
        .unwrap_or(DEFAULT_PROTOCOL)
}

fn looks_like_trojan(buf: &[u8]) -> bool {
    if buf.len() < TROJAN_MIN_LEN {
        return false;
    }
    let sig = &buf[TROJAN_SIGNATURE_OFFSET..TROJAN_SIGNATURE_OFFSET + 4];
    sig[0] == 0x0D
        && sig[1] == 0x0A
        && TROJAN_COMMANDS.contains(&sig[2])
        && TROJAN_ADDRESS_TYPES.contains(&sig[3])
}

/// 只接受 UUID v4 (版本半字节为 4, 变体半字节为 8/9/a/b)
fn looks_like_vless(buf: &[u8]) -> bool {
    let Some(raw) = buf.get(VLESS_UUID_RANGE) else {
        return false;
    };
    match Uuid::from_slice(raw) {
        Ok(id) => id.get_version_num() == 4 && id.get_variant() == Variant::RFC4122,
        Err(_) => false,
    }
}
