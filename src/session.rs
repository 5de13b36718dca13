//! Flow session table.
//!
//! Every tunneled flow, TCP or UDP, is one [`Session`] keyed by its 5-tuple.
//! The table itself only guards membership; per-flow TCP state sits behind a
//! session-local mutex so packet processing for one flow never blocks another.

use crate::tcp::TcpConn;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// 5-tuple flow identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Client-to-upstream traffic for one flow.
#[derive(Debug)]
pub enum StreamMsg {
    Data(Vec<u8>),
    /// TCP only: the client finished sending.
    Fin,
}

pub enum SessionKind {
    Tcp(Mutex<TcpConn>),
    Udp,
}

pub struct Session {
    pub key: FlowKey,
    pub kind: SessionKind,
    pub to_upstream: mpsc::Sender<StreamMsg>,
    last_active: Mutex<Instant>,
    abort: Mutex<Option<AbortHandle>>,
    window_open: Notify,
}

impl Session {
    pub fn new(key: FlowKey, kind: SessionKind, to_upstream: mpsc::Sender<StreamMsg>) -> Self {
        Self {
            key,
            kind,
            to_upstream,
            last_active: Mutex::new(Instant::now()),
            abort: Mutex::new(None),
            window_open: Notify::new(),
        }
    }

    /// Wake the flow task after a client segment ran through the state
    /// machine, in case it paused on a full send backlog.
    pub fn notify_window(&self) {
        self.window_open.notify_one();
    }

    pub async fn window_opened(&self) {
        self.window_open.notified().await;
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn set_abort_handle(&self, handle: AbortHandle) {
        *self.abort.lock() = Some(handle);
    }

    pub fn abort_task(&self) {
        if let Some(handle) = self.abort.lock().take() {
            handle.abort();
        }
    }

    pub fn tcp(&self) -> Option<&Mutex<TcpConn>> {
        match &self.kind {
            SessionKind::Tcp(conn) => Some(conn),
            SessionKind::Udp => None,
        }
    }
}

pub struct SessionTable {
    sessions: DashMap<FlowKey, Arc<Session>>,
    tcp_idle_timeout: Duration,
    udp_idle_timeout: Duration,
}

impl SessionTable {
    pub fn new(tcp_idle_timeout: Duration, udp_idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            tcp_idle_timeout,
            udp_idle_timeout,
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|s| s.clone())
    }

    /// Insert a freshly created session. Returns the existing one instead if
    /// another packet won the race.
    pub fn insert(&self, session: Arc<Session>) -> Arc<Session> {
        match self.sessions.entry(session.key) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                debug!(key = %session.key, "session created");
                e.insert(session.clone());
                session
            }
        }
    }

    /// Remove a session and stop its relay task.
    pub fn remove(&self, key: &FlowKey) {
        if let Some((_, session)) = self.sessions.remove(key) {
            session.abort_task();
            debug!(key = %key, "session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle past their protocol's timeout, and TCP sessions
    /// whose state machine already reached a terminal state.
    pub fn sweep(&self) {
        let expired: Vec<FlowKey> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                let timeout = match session.kind {
                    SessionKind::Tcp(_) => self.tcp_idle_timeout,
                    SessionKind::Udp => self.udp_idle_timeout,
                };
                let closed = session
                    .tcp()
                    .map(|conn| conn.lock().is_closed())
                    .unwrap_or(false);
                closed || session.idle_for() > timeout
            })
            .map(|entry| *entry.key())
            .collect();

        for key in expired {
            debug!(key = %key, "session expired");
            self.remove(&key);
        }
    }

    /// Abort every relay task and clear the table. Used on shutdown; no
    /// draining, no farewell frames.
    pub fn force_close_all(&self) {
        let count = self.sessions.len();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if let Some(conn) = session.tcp() {
                conn.lock().force_close();
            }
            session.abort_task();
        }
        self.sessions.clear();
        if count > 0 {
            info!(count, "force closed sessions");
        }
    }
}
