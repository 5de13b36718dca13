//! Tunnel engine: the single reader/writer pair over the TUN descriptor,
//! per-flow relay tasks, and the lifecycle around them.
//!
//! The engine owns its own tokio runtime so the control surface stays
//! synchronous: `start` brings everything up, `stop` tears it down without
//! draining. Exactly one task reads frames and one task writes them; every
//! other task talks to the device through the frame channel.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::{build_tcp_frame, parse_frame, TcpFlags, TcpSegment, Transport};
use crate::session::{FlowKey, Protocol, Session, SessionKind, SessionTable, StreamMsg};
use crate::socks5::Socks5Client;
use crate::stats::{TunnelStats, STATS_LEN};
use crate::tcp::{ProcessResult, TcpConn, RECV_WINDOW};
use crate::tun::TunDevice;
use crate::{logging, udp};
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const FRAME_QUEUE_SIZE: usize = 1024;
const STREAM_QUEUE_SIZE: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const UPSTREAM_BUF_SIZE: usize = 32 * 1024;

pub struct Engine {
    runtime: tokio::runtime::Runtime,
    core: Arc<Core>,
    tasks: Vec<JoinHandle<()>>,
}

struct Core {
    config: Config,
    device: TunDevice,
    sessions: SessionTable,
    stats: TunnelStats,
    client: Socks5Client,
    frames_tx: mpsc::Sender<Vec<u8>>,
    running: AtomicBool,
}

impl Engine {
    /// Bring the tunnel up over an already-open TUN descriptor. The caller
    /// keeps ownership of the descriptor.
    pub fn start(config: Config, tun_fd: RawFd) -> Result<Self> {
        logging::init(config.log_level);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("tunsocks-worker")
            .build()?;

        let device = {
            let _guard = runtime.enter();
            TunDevice::from_raw_fd(tun_fd, config.mtu)?
        };

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
        let core = Arc::new(Core {
            sessions: SessionTable::new(config.tcp_idle_timeout, config.udp_idle_timeout),
            stats: TunnelStats::default(),
            client: Socks5Client::new(config.upstream, config.credentials.clone()),
            device,
            frames_tx,
            running: AtomicBool::new(true),
            config,
        });

        info!(
            upstream = %core.config.upstream,
            host = %core.config.upstream_host,
            mtu = core.config.mtu,
            udp = core.config.udp_enabled,
            "tunnel started"
        );

        let tasks = vec![
            runtime.spawn(core.clone().write_loop(frames_rx)),
            runtime.spawn(core.clone().read_loop()),
            runtime.spawn(core.clone().sweep_loop()),
        ];

        Ok(Self { runtime, core, tasks })
    }

    /// Snapshot of the transfer counters and live session count.
    pub fn stats(&self) -> [u64; STATS_LEN] {
        self.core
            .stats
            .snapshot(self.core.sessions.len() as u64)
            .to_array()
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Relaxed)
    }

    /// Tear the tunnel down. In-flight traffic is abandoned, not drained;
    /// returns once every task has stopped or the shutdown timeout passes.
    pub fn stop(self) {
        self.core.running.store(false, Ordering::Relaxed);
        self.core.sessions.force_close_all();
        for task in &self.tasks {
            task.abort();
        }
        self.runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        info!("tunnel stopped");
    }
}

impl Core {
    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.device.mtu()];
        while self.running.load(Ordering::Relaxed) {
            let n = match self.device.read_frame(&mut buf).await {
                Ok(n) => n,
                Err(Error::EndOfStream) => {
                    error!("tun descriptor closed");
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "tun read failed");
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            };
            self.stats.record_rx(n);
            self.dispatch(&buf[..n]).await;
        }
    }

    async fn write_loop(self: Arc<Self>, mut frames_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = frames_rx.recv().await {
            match self.device.write_frame(&frame).await {
                Ok(()) => self.stats.record_tx(frame.len()),
                Err(e) => {
                    error!(error = %e, "tun write failed");
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.sessions.sweep();
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: &[u8]) {
        let parsed = match parse_frame(frame) {
            Ok(p) => p,
            Err(e) => {
                self.stats.record_parse_drop();
                debug!(error = %e, "frame dropped");
                return;
            }
        };

        let (Some(src), Some(dst)) = (parsed.src_socket(), parsed.dst_socket()) else {
            // ICMP and friends are not tunneled.
            return;
        };

        match parsed.transport {
            Transport::Tcp(seg) => {
                let payload = &frame[seg.payload_offset..seg.payload_offset + seg.payload_len];
                self.dispatch_tcp(FlowKey { protocol: Protocol::Tcp, src, dst }, &seg, payload)
                    .await;
            }
            Transport::Udp(dg) => {
                let payload = &frame[dg.payload_offset..dg.payload_offset + dg.payload_len];
                self.dispatch_udp(FlowKey { protocol: Protocol::Udp, src, dst }, payload)
                    .await;
            }
            Transport::Other(_) => {}
        }
    }

    async fn dispatch_tcp(self: &Arc<Self>, key: FlowKey, seg: &TcpSegment, payload: &[u8]) {
        if let Some(session) = self.sessions.get(&key) {
            session.touch();
            let result = {
                let Some(conn) = session.tcp() else { return };
                conn.lock().process(seg, payload)
            };
            self.apply_tcp_result(&session, result).await;
            return;
        }

        if seg.flags.syn && !seg.flags.ack {
            self.open_tcp_flow(key, seg).await;
        } else if !seg.flags.rst {
            // No session for this segment; answer with RST like a closed port.
            debug!(%key, "segment for unknown flow");
            let ack = seg.seq.wrapping_add(payload.len() as u32);
            self.send_frame_to_client(&key, seg.ack, ack, TcpFlags::rst_ack(), &[], None)
                .await;
        }
    }

    async fn open_tcp_flow(self: &Arc<Self>, key: FlowKey, seg: &TcpSegment) {
        let conn = TcpConn::new(seg.seq, seg.mss, seg.window);
        let (tx, rx) = mpsc::channel(STREAM_QUEUE_SIZE);
        let session = Arc::new(Session::new(key, SessionKind::Tcp(Mutex::new(conn)), tx));

        let inserted = self.sessions.insert(session.clone());
        if !Arc::ptr_eq(&inserted, &session) {
            // Lost the race to a duplicate SYN; the winner's task answers it.
            return;
        }

        let core = self.clone();
        let handle = tokio::spawn(async move {
            core.run_tcp_flow(session, rx).await;
        });
        inserted.set_abort_handle(handle.abort_handle());
    }

    /// Per-flow TCP task: CONNECT upstream, answer the handshake, then relay
    /// both directions until either side finishes.
    async fn run_tcp_flow(
        self: Arc<Self>,
        session: Arc<Session>,
        mut from_client: mpsc::Receiver<StreamMsg>,
    ) {
        let key = session.key;
        let connect = tokio::time::timeout(self.config.connect_timeout, self.client.connect(key.dst));
        let stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%key, error = %e, "upstream connect failed");
                self.stats.record_connect_failure();
                self.reset_flow(&session).await;
                return;
            }
            Err(_elapsed) => {
                warn!(%key, error = %Error::Timeout("upstream connect"), "upstream connect failed");
                self.stats.record_connect_failure();
                self.reset_flow(&session).await;
                return;
            }
        };

        // CONNECT succeeded: complete the client handshake.
        let (syn_ack, mss) = {
            let Some(conn) = session.tcp() else { return };
            let mut conn = conn.lock();
            (conn.accept(), conn.mss())
        };
        self.send_frame_to_client(&key, syn_ack.seq, syn_ack.ack, syn_ack.flags, &[], Some(mss))
            .await;

        let (mut upstream_rx, mut upstream_tx) = stream.into_split();
        let mut buf = vec![0u8; UPSTREAM_BUF_SIZE];
        let mut upstream_eof = false;

        loop {
            // Stop reading upstream while the client's window holds back a
            // large backlog; a window-opening ACK wakes us up.
            let backlogged = session
                .tcp()
                .map(|conn| conn.lock().backlogged())
                .unwrap_or(false);
            tokio::select! {
                msg = from_client.recv() => match msg {
                    Some(StreamMsg::Data(data)) => {
                        if let Err(e) = upstream_tx.write_all(&data).await {
                            debug!(%key, error = %e, "upstream write failed");
                            self.reset_flow(&session).await;
                            return;
                        }
                    }
                    Some(StreamMsg::Fin) => {
                        let _ = upstream_tx.shutdown().await;
                    }
                    None => return,
                },
                read = upstream_rx.read(&mut buf), if !upstream_eof && !backlogged => match read {
                    Ok(0) => {
                        upstream_eof = true;
                        let fin = session.tcp().and_then(|conn| conn.lock().begin_close());
                        if let Some(fin) = fin {
                            self.send_frame_to_client(&key, fin.seq, fin.ack, fin.flags, &[], None)
                                .await;
                        }
                    }
                    Ok(n) => {
                        session.touch();
                        let replies = {
                            let Some(conn) = session.tcp() else { return };
                            conn.lock().stream_out(&buf[..n])
                        };
                        for reply in replies {
                            self.send_frame_to_client(
                                &key, reply.seq, reply.ack, reply.flags, &reply.payload, None,
                            )
                            .await;
                        }
                    }
                    Err(e) => {
                        debug!(%key, error = %e, "upstream read failed");
                        self.reset_flow(&session).await;
                        return;
                    }
                },
                _ = session.window_opened(), if backlogged => {}
            }
        }
    }

    async fn apply_tcp_result(&self, session: &Arc<Session>, result: ProcessResult) {
        let key = session.key;
        for reply in result.replies {
            self.send_frame_to_client(&key, reply.seq, reply.ack, reply.flags, &reply.payload, None)
                .await;
        }
        if !result.deliver.is_empty() {
            let _ = session.to_upstream.send(StreamMsg::Data(result.deliver)).await;
        }
        if result.fin {
            let _ = session.to_upstream.send(StreamMsg::Fin).await;
        }
        if result.closed {
            self.sessions.remove(&key);
        } else {
            // Flushed replies may have drained the backlog.
            session.notify_window();
        }
    }

    /// Abort a flow with an RST toward the client and drop its session.
    async fn reset_flow(&self, session: &Arc<Session>) {
        let rst = {
            let Some(conn) = session.tcp() else { return };
            conn.lock().abort()
        };
        self.send_frame_to_client(&session.key, rst.seq, rst.ack, rst.flags, &[], None)
            .await;
        self.sessions.remove(&session.key);
    }

    async fn send_frame_to_client(
        &self,
        key: &FlowKey,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
        mss: Option<u16>,
    ) {
        // Synthesized frames travel the reverse path of the flow.
        match build_tcp_frame(key.dst, key.src, seq, ack, flags, RECV_WINDOW, payload, mss) {
            Ok(frame) => {
                let _ = self.frames_tx.send(frame).await;
            }
            Err(e) => warn!(%key, error = %e, "frame synthesis failed"),
        }
    }

    async fn dispatch_udp(self: &Arc<Self>, key: FlowKey, payload: &[u8]) {
        if !self.config.udp_enabled {
            debug!(%key, "udp disabled, datagram dropped");
            return;
        }

        if let Some(session) = self.sessions.get(&key) {
            session.touch();
            let _ = session.to_upstream.send(StreamMsg::Data(payload.to_vec())).await;
            return;
        }

        let (tx, rx) = mpsc::channel(STREAM_QUEUE_SIZE);
        let session = Arc::new(Session::new(key, SessionKind::Udp, tx));
        let inserted = self.sessions.insert(session.clone());
        if !Arc::ptr_eq(&inserted, &session) {
            let _ = inserted.to_upstream.send(StreamMsg::Data(payload.to_vec())).await;
            return;
        }

        let _ = session.to_upstream.send(StreamMsg::Data(payload.to_vec())).await;

        let core = self.clone();
        let handle = tokio::spawn(async move {
            core.run_udp_flow(session, rx).await;
        });
        inserted.set_abort_handle(handle.abort_handle());
    }

    async fn run_udp_flow(
        self: Arc<Self>,
        session: Arc<Session>,
        from_client: mpsc::Receiver<StreamMsg>,
    ) {
        let key = session.key;
        let associate = tokio::time::timeout(self.config.connect_timeout, self.client.udp_associate());
        let assoc = match associate.await {
            Ok(Ok(assoc)) => assoc,
            Ok(Err(e)) => {
                warn!(%key, error = %e, "udp associate failed");
                self.stats.record_connect_failure();
                self.sessions.remove(&key);
                return;
            }
            Err(_elapsed) => {
                warn!(%key, error = %Error::Timeout("udp associate"), "udp associate failed");
                self.stats.record_connect_failure();
                self.sessions.remove(&key);
                return;
            }
        };

        if let Err(e) = udp::run_relay(session, assoc, from_client, self.frames_tx.clone()).await {
            debug!(%key, error = %e, "udp relay ended");
        }
        self.sessions.remove(&key);
    }
}
