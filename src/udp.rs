//! UDP relay over a SOCKS5 UDP association.
//!
//! One relay task per client flow. Client datagrams arrive through the
//! session channel and leave encapsulated toward the relay; relay datagrams
//! come back decapsulated and are synthesized into frames for the client.
//! The task never ends the flow itself: UDP sessions die only by idle sweep
//! or shutdown, both of which abort the task.

use crate::error::Result;
use crate::packet::build_udp_frame;
use crate::session::{Session, StreamMsg};
use crate::socks5::{decode_udp_packet, encode_udp_packet, UdpAssociation};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const RECV_BUF_SIZE: usize = 65535;

pub async fn run_relay(
    session: Arc<Session>,
    assoc: UdpAssociation,
    mut from_client: mpsc::Receiver<StreamMsg>,
    frames: mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        tokio::select! {
            msg = from_client.recv() => {
                match msg {
                    Some(StreamMsg::Data(payload)) => {
                        let datagram = encode_udp_packet(session.key.dst, &payload);
                        assoc.socket.send(&datagram).await?;
                        session.touch();
                        trace!(key = %session.key, len = payload.len(), "datagram to relay");
                    }
                    Some(StreamMsg::Fin) => {}
                    None => return Ok(()),
                }
            }
            received = assoc.socket.recv(&mut buf) => {
                let n = received?;
                let (origin, offset) = match decode_udp_packet(&buf[..n]) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        debug!(key = %session.key, error = %e, "bad relay datagram");
                        continue;
                    }
                };
                let frame = build_udp_frame(origin, session.key.src, &buf[offset..n])?;
                if frames.send(frame).await.is_err() {
                    return Ok(());
                }
                session.touch();
                trace!(key = %session.key, %origin, "datagram to client");
            }
        }
    }
}
