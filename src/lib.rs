//! User-space TUN to SOCKS5 tunnel engine.
//!
//! Frames read from a caller-supplied TUN descriptor are terminated by a
//! small userspace TCP/UDP stack and relayed over a SOCKS5 upstream: one
//! CONNECT per TCP flow, one UDP ASSOCIATE per UDP flow. The [`Engine`]
//! handle drives everything; [`start`], [`stop`] and [`stats`] wrap it in a
//! process-wide singleton for embedders that want a service-style surface.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod packet;
pub mod session;
pub mod socks5;
pub mod stats;
pub mod tcp;
pub mod tun;
pub mod udp;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use stats::STATS_LEN;

use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::path::Path;

static ACTIVE: Mutex<Option<Engine>> = Mutex::new(None);

/// Start the singleton tunnel from a config file and an open TUN descriptor.
pub fn start<P: AsRef<Path>>(config_path: P, tun_fd: RawFd) -> Result<()> {
    let mut active = ACTIVE.lock();
    if active.is_some() {
        return Err(Error::AlreadyRunning);
    }
    let config = Config::load(config_path)?;
    *active = Some(Engine::start(config, tun_fd)?);
    Ok(())
}

/// Stop the singleton tunnel. Idle if none is running.
pub fn stop() {
    if let Some(engine) = ACTIVE.lock().take() {
        engine.stop();
    }
}

/// Counters of the running singleton in fixed order: received packets,
/// transmitted packets, received bytes, transmitted bytes, active sessions.
pub fn stats() -> Result<[u64; STATS_LEN]> {
    match ACTIVE.lock().as_ref() {
        Some(engine) => Ok(engine.stats()),
        None => Err(Error::NotRunning),
    }
}
