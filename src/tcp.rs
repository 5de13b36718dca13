//! Userspace TCP endpoint for one flow.
//!
//! Each client flow gets a [`TcpConn`] that terminates TCP locally while the
//! payload rides a SOCKS5 stream. The state machine is passive on open: the
//! SYN-ACK is only emitted through [`TcpConn::accept`] once the upstream
//! CONNECT has succeeded, so a refused upstream can be answered with a clean
//! RST instead of a half-open handshake.
//!
//! `process` never touches the network. It returns a [`ProcessResult`]
//! describing the frames to synthesize and the bytes to forward upstream, so
//! the caller can hold the session lock only for the state transition.

use crate::packet::{TcpFlags, TcpSegment, DEFAULT_MSS};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

const MAX_OOO_BYTES: usize = 256 * 1024;
const MAX_PENDING_BYTES: usize = 64 * 1024;
pub const RECV_WINDOW: u16 = 65535;

/// TCP state (RFC 793). `Listen`/`SynSent` never occur here; the local side
/// only ever opens passively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// SYN seen, upstream CONNECT still in flight.
    ProxyConnecting,
    SynAckSent,
    Established,
    /// Client sent its FIN; upstream data keeps flowing until EOF.
    CloseWait,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One frame to synthesize toward the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

impl Reply {
    fn control(seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Self { seq, ack, flags, payload: Vec::new() }
    }
}

/// Outcome of feeding one segment into the state machine.
#[derive(Debug, Default)]
pub struct ProcessResult {
    pub replies: Vec<Reply>,
    /// In-order bytes to forward to the upstream stream.
    pub deliver: Vec<u8>,
    /// Client finished sending; shut down the upstream write half.
    pub fin: bool,
    /// Connection reached a terminal state; the session can be removed.
    pub closed: bool,
}

pub struct TcpConn {
    state: TcpState,
    snd_nxt: u32,
    snd_una: u32,
    snd_wnd: u16,
    rcv_nxt: u32,
    mss: u16,
    ooo_segments: BTreeMap<u32, Vec<u8>>,
    ooo_size: usize,
    /// Upstream bytes waiting for the client's window to open.
    pending_out: VecDeque<u8>,
    fin_pending: bool,
}

impl TcpConn {
    pub fn new(their_seq: u32, their_mss: Option<u16>, their_window: u16) -> Self {
        let iss: u32 = rand::random();
        Self {
            state: TcpState::ProxyConnecting,
            snd_nxt: iss.wrapping_add(1),
            snd_una: iss,
            snd_wnd: their_window,
            rcv_nxt: their_seq.wrapping_add(1),
            mss: their_mss.unwrap_or(DEFAULT_MSS).min(DEFAULT_MSS),
            ooo_segments: BTreeMap::new(),
            ooo_size: 0,
            pending_out: VecDeque::new(),
            fin_pending: false,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, TcpState::Closed | TcpState::TimeWait)
    }

    /// Upstream CONNECT succeeded: emit the SYN-ACK.
    pub fn accept(&mut self) -> Reply {
        self.state = TcpState::SynAckSent;
        Reply::control(self.snd_una, self.rcv_nxt, TcpFlags::syn_ack())
    }

    /// Upstream CONNECT failed or the relay died: emit an RST and close.
    pub fn abort(&mut self) -> Reply {
        self.state = TcpState::Closed;
        Reply::control(self.snd_nxt, self.rcv_nxt, TcpFlags::rst_ack())
    }

    /// Upstream reached EOF: start an orderly close toward the client. The
    /// FIN is deferred until every queued byte has gone out.
    pub fn begin_close(&mut self) -> Option<Reply> {
        if !self.pending_out.is_empty() {
            self.fin_pending = true;
            return None;
        }
        let next = match self.state {
            TcpState::Established | TcpState::SynAckSent => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return None,
        };
        self.state = next;
        let reply = Reply::control(self.snd_nxt, self.rcv_nxt, TcpFlags::fin_ack());
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        Some(reply)
    }

    /// Queue upstream bytes toward the client, emitting as many segments as
    /// the advertised window allows. The rest waits for ACKs.
    pub fn stream_out(&mut self, data: &[u8]) -> Vec<Reply> {
        self.pending_out.extend(data.iter().copied());
        let mut replies = Vec::new();
        self.flush_pending(&mut replies);
        replies
    }

    /// The window-limited backlog grew past its cap; the upstream reader
    /// should pause until the client drains it.
    pub fn backlogged(&self) -> bool {
        self.pending_out.len() >= MAX_PENDING_BYTES
    }

    pub fn force_close(&mut self) {
        self.state = TcpState::Closed;
        self.ooo_segments.clear();
        self.ooo_size = 0;
        self.pending_out.clear();
        self.fin_pending = false;
    }

    pub fn process(&mut self, seg: &TcpSegment, payload: &[u8]) -> ProcessResult {
        let mut result = ProcessResult::default();

        if seg.flags.rst {
            debug!(state = %self.state, "RST from client");
            self.state = TcpState::Closed;
            result.closed = true;
            return result;
        }

        self.snd_wnd = seg.window;

        match self.state {
            TcpState::ProxyConnecting => {
                // Retransmitted SYN while CONNECT is in flight; the SYN-ACK
                // will answer it once accept() runs.
            }
            TcpState::SynAckSent => self.on_syn_ack_sent(seg, payload, &mut result),
            TcpState::Established => self.on_established(seg, payload, &mut result),
            TcpState::CloseWait => self.on_close_wait(seg, &mut result),
            TcpState::FinWait1 => self.on_fin_wait1(seg, &mut result),
            TcpState::FinWait2 => self.on_fin_wait2(seg, &mut result),
            TcpState::Closing => self.on_closing(seg, &mut result),
            TcpState::LastAck => self.on_last_ack(seg, &mut result),
            TcpState::TimeWait => {
                if seg.flags.fin {
                    result.replies.push(self.ack_reply());
                }
            }
            TcpState::Closed => {}
        }

        // ACKs may have moved snd_una or widened the window.
        if matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            self.flush_pending(&mut result.replies);
        }

        result
    }

    fn on_syn_ack_sent(&mut self, seg: &TcpSegment, payload: &[u8], result: &mut ProcessResult) {
        if seg.flags.syn {
            // Retransmitted SYN: the SYN-ACK was lost, repeat it.
            result
                .replies
                .push(Reply::control(self.snd_una, self.rcv_nxt, TcpFlags::syn_ack()));
            return;
        }
        if seg.flags.ack && self.valid_ack(seg.ack) {
            self.snd_una = seg.ack;
            self.state = TcpState::Established;
            trace!("established");
            // The handshake ACK may already carry data.
            if !payload.is_empty() || seg.flags.fin {
                self.on_established(seg, payload, result);
            }
        }
    }

    fn on_established(&mut self, seg: &TcpSegment, payload: &[u8], result: &mut ProcessResult) {
        if seg.flags.ack {
            self.process_ack(seg.ack);
        }
        if !payload.is_empty() {
            self.process_data(seg.seq, payload, result);
        }
        if seg.flags.fin && seg.seq.wrapping_add(payload.len() as u32) == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            // Half-close: the upstream may still have a response in flight,
            // so only ACK here. Our FIN waits for upstream EOF.
            self.state = TcpState::CloseWait;
            result.fin = true;
            result.replies.clear();
            result.replies.push(self.ack_reply());
        }
    }

    fn on_close_wait(&mut self, seg: &TcpSegment, result: &mut ProcessResult) {
        if seg.flags.ack {
            self.process_ack(seg.ack);
        }
        if seg.flags.fin {
            // Retransmitted FIN; the ACK got lost.
            result.replies.push(self.ack_reply());
        }
    }

    fn on_fin_wait1(&mut self, seg: &TcpSegment, result: &mut ProcessResult) {
        let fin_acked = seg.flags.ack && self.valid_ack(seg.ack);
        if fin_acked {
            self.snd_una = seg.ack;
        }
        if seg.flags.fin {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            result.fin = true;
            result.replies.push(self.ack_reply());
            if fin_acked {
                self.state = TcpState::TimeWait;
                result.closed = true;
            } else {
                self.state = TcpState::Closing;
            }
        } else if fin_acked {
            self.state = TcpState::FinWait2;
        }
    }

    fn on_fin_wait2(&mut self, seg: &TcpSegment, result: &mut ProcessResult) {
        if seg.flags.fin {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.state = TcpState::TimeWait;
            result.fin = true;
            result.closed = true;
            result.replies.push(self.ack_reply());
        }
    }

    fn on_closing(&mut self, seg: &TcpSegment, result: &mut ProcessResult) {
        if seg.flags.ack && self.valid_ack(seg.ack) {
            self.snd_una = seg.ack;
            self.state = TcpState::TimeWait;
            result.closed = true;
        }
    }

    fn on_last_ack(&mut self, seg: &TcpSegment, result: &mut ProcessResult) {
        if seg.flags.ack && self.valid_ack(seg.ack) {
            self.state = TcpState::Closed;
            result.closed = true;
        }
    }

    fn ack_reply(&self) -> Reply {
        Reply::control(self.snd_nxt, self.rcv_nxt, TcpFlags::ack_only())
    }

    fn valid_ack(&self, ack: u32) -> bool {
        let (una, nxt) = (self.snd_una, self.snd_nxt);
        if una <= nxt {
            ack > una && ack <= nxt
        } else {
            ack > una || ack <= nxt
        }
    }

    fn process_ack(&mut self, ack: u32) {
        if self.valid_ack(ack) {
            self.snd_una = ack;
        }
    }

    /// Emit queued bytes as long as unacked in-flight data stays inside the
    /// client's advertised window, then the deferred FIN if one is due.
    fn flush_pending(&mut self, replies: &mut Vec<Reply>) {
        while !self.pending_out.is_empty() {
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
            let window = self.snd_wnd as usize;
            if in_flight >= window {
                break;
            }
            let take = (window - in_flight)
                .min(self.mss as usize)
                .min(self.pending_out.len());
            let chunk: Vec<u8> = self.pending_out.drain(..take).collect();
            replies.push(Reply {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                flags: TcpFlags::psh_ack(),
                payload: chunk,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(take as u32);
        }
        if self.fin_pending && self.pending_out.is_empty() {
            self.fin_pending = false;
            if let Some(fin) = self.begin_close() {
                replies.push(fin);
            }
        }
    }

    fn process_data(&mut self, seq: u32, data: &[u8], result: &mut ProcessResult) {
        let seq_end = seq.wrapping_add(data.len() as u32);

        // Entirely old data: pure retransmission, re-ACK.
        if seq_before_or_eq(seq_end, self.rcv_nxt) {
            trace!(seq, rcv_nxt = self.rcv_nxt, "retransmission");
            result.replies.push(self.ack_reply());
            return;
        }

        if seq == self.rcv_nxt {
            self.accept_bytes(data, result);
        } else if seq_before(seq, self.rcv_nxt) {
            // Partial overlap with already-received data.
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            if skip < data.len() {
                self.accept_bytes(&data[skip..], result);
            }
        } else {
            // Gap ahead of us; hold the segment until the gap fills.
            if self.ooo_size + data.len() <= MAX_OOO_BYTES
                && !self.ooo_segments.contains_key(&seq)
            {
                debug!(seq, len = data.len(), expected = self.rcv_nxt, "buffering out-of-order");
                self.ooo_size += data.len();
                self.ooo_segments.insert(seq, data.to_vec());
            }
        }

        result.replies.push(self.ack_reply());
    }

    fn accept_bytes(&mut self, data: &[u8], result: &mut ProcessResult) {
        result.deliver.extend_from_slice(data);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
        self.drain_ooo(result);
    }

    fn drain_ooo(&mut self, result: &mut ProcessResult) {
        loop {
            let Some((&seq, _)) = self.ooo_segments.iter().next() else {
                return;
            };
            if seq_after(seq, self.rcv_nxt) {
                return;
            }
            let data = match self.ooo_segments.remove(&seq) {
                Some(d) => d,
                None => return,
            };
            self.ooo_size -= data.len();
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            if skip < data.len() {
                result.deliver.extend_from_slice(&data[skip..]);
                self.rcv_nxt = self.rcv_nxt.wrapping_add((data.len() - skip) as u32);
            }
        }
    }
}

fn seq_before(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

fn seq_after(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

fn seq_before_or_eq(seq1: u32, seq2: u32) -> bool {
    seq1 == seq2 || seq_before(seq1, seq2)
}
