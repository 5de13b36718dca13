use std::os::unix::io::RawFd;
use thiserror::Error;

/// Tunnel engine errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed config: {0}")]
    MalformedConfig(String),

    #[error("missing required config key: {0}")]
    MissingField(String),

    #[error("invalid upstream address: {0}")]
    InvalidUpstreamAddress(String),

    #[error("invalid tun descriptor: {0}")]
    InvalidDescriptor(RawFd),

    #[error("tun descriptor closed")]
    EndOfStream,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("SOCKS5 request refused: {0}")]
    ProxyRefused(&'static str),

    #[error("SOCKS5 authentication failed")]
    ProxyAuthFailed,

    #[error("SOCKS5 protocol violation: {0}")]
    ProxyProtocol(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("engine not running")]
    NotRunning,

    #[error("engine already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map a SOCKS5 reply status byte (RFC 1928 §6) to a message.
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
