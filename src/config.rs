//! Configuration loading and validation.
//!
//! The file format is the key-value YAML subset the VPN service writes:
//! `misc`, `tunnel` and `socks5` sections, comments allowed, unknown keys
//! ignored for forward compatibility. The loaded [`Config`] is immutable.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 65535;

/// Log verbosity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

/// Username/password pair for RFC 1929 sub-negotiation.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TUN interface MTU; bounds frame buffers.
    pub mtu: usize,
    /// Resolved SOCKS5 upstream endpoint.
    pub upstream: SocketAddr,
    /// Upstream as written in the config, for logging.
    pub upstream_host: String,
    pub credentials: Option<Credentials>,
    /// Whether UDP flows are relayed via UDP ASSOCIATE.
    pub udp_enabled: bool,
    pub tcp_idle_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub log_level: LogLevel,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    misc: MiscSection,
    #[serde(default)]
    tunnel: TunnelSection,
    socks5: Option<Socks5Section>,
}

#[derive(Debug, Default, Deserialize)]
struct MiscSection {
    #[serde(rename = "log-level")]
    log_level: Option<LogLevel>,
    #[serde(rename = "tcp-idle-timeout")]
    tcp_idle_timeout: Option<u64>,
    #[serde(rename = "udp-idle-timeout")]
    udp_idle_timeout: Option<u64>,
    #[serde(rename = "connect-timeout")]
    connect_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TunnelSection {
    mtu: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct Socks5Section {
    address: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    udp: Option<String>,
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// The upstream address must resolve here; an engine never starts with
    /// an unresolvable upstream.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::MalformedConfig(format!("cannot read config file: {}", e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text)
            .map_err(|e| Error::MalformedConfig(e.to_string()))?;

        let socks5 = raw
            .socks5
            .ok_or_else(|| Error::MissingField("socks5".to_string()))?;
        let address = socks5
            .address
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::MissingField("socks5.address".to_string()))?;
        let port = socks5
            .port
            .ok_or_else(|| Error::MissingField("socks5.port".to_string()))?;

        let credentials = match (socks5.username, socks5.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::MissingField("socks5.password".to_string()));
            }
            (None, Some(_)) => {
                return Err(Error::MissingField("socks5.username".to_string()));
            }
        };
        if let Some(ref c) = credentials {
            if c.username.len() > 255 || c.password.len() > 255 {
                return Err(Error::MalformedConfig(
                    "socks5 credentials exceed 255 bytes".to_string(),
                ));
            }
        }

        let mtu = raw.tunnel.mtu.unwrap_or(1500);
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::MalformedConfig(format!(
                "tunnel.mtu {} outside {}..={}",
                mtu, MIN_MTU, MAX_MTU
            )));
        }

        let upstream_host = format!("{}:{}", address, port);
        let upstream = resolve_upstream(&address, port)?;

        // `udp: 'tcp'` turns off the UDP relay; anything else keeps it on.
        let udp_enabled = socks5.udp.as_deref() != Some("tcp");

        Ok(Config {
            mtu,
            upstream,
            upstream_host,
            credentials,
            udp_enabled,
            tcp_idle_timeout: Duration::from_secs(raw.misc.tcp_idle_timeout.unwrap_or(300)),
            udp_idle_timeout: Duration::from_secs(raw.misc.udp_idle_timeout.unwrap_or(60)),
            connect_timeout: Duration::from_secs(raw.misc.connect_timeout.unwrap_or(10)),
            log_level: raw.misc.log_level.unwrap_or_default(),
        })
    }
}

fn resolve_upstream(address: &str, port: u16) -> Result<SocketAddr> {
    (address, port)
        .to_socket_addrs()
        .map_err(|e| Error::InvalidUpstreamAddress(format!("{}:{}: {}", address, port, e)))?
        .next()
        .ok_or_else(|| {
            Error::InvalidUpstreamAddress(format!("{}:{}: no addresses", address, port))
        })
}
