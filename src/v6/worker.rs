use std::{
    io,
    net::{SocketAddr, UdpSocket},
};

use compact_str::CompactString;
use tracing::{debug, error, info, trace};

use crate::config::SharedConfig;
use crate::hooks::{CalloutHandle, HookPoint};
use crate::packet::Packet;
use crate::v6::handlers::{handle_message, Server6, V6Response};
use crate::wire::{Decodable, Encodable};

/// One UDP payload with its peer and the interface it crossed. The same
/// shape goes both directions: inbound `peer` is the datagram's source,
/// outbound it is the destination.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub peer: SocketAddr,
    pub iface: Option<CompactString>,
}

/// The receive -> decode -> process -> emit loop.
///
/// `recv` hands over the next datagram or `None` at end-of-stream, which
/// is the shutdown signal; the loop then returns with no partial emission
/// in flight. Responses are emitted in the order requests were received.
/// Undecodable and policy-violating packets are dropped with a log line
/// and no response.
pub fn run_pump<R, E>(srv: &Server6, config: &SharedConfig, mut recv: R, mut emit: E)
where
    R: FnMut() -> Option<Datagram>,
    E: FnMut(Datagram),
{
    while let Some(dgram) = recv() {
        trace!(bytes = dgram.bytes.len(), peer = %dgram.peer, "datagram received");

        let mut pkt = match Packet::from_bytes(&dgram.bytes) {
            Ok(pkt) => pkt,
            Err(err) => {
                error!(%err, peer = %dgram.peer, "unable to parse dhcp message");
                continue;
            }
        };
        if let SocketAddr::V6(peer) = dgram.peer {
            pkt.remote_addr = *peer.ip();
        }
        pkt.iface = dgram.iface.clone();

        if srv.hooks.has_callouts(HookPoint::Pkt6Receive) {
            let mut handle = CalloutHandle::for_packet(&mut pkt);
            srv.hooks.invoke(HookPoint::Pkt6Receive, &mut handle);
            if handle.skip() {
                debug!("pkt6_receive callout skipped the packet");
                continue;
            }
        }

        // the configuration snapshot is held for the whole request
        let cfg = config.load();
        let mut reply = match handle_message(srv, &cfg, &mut pkt) {
            V6Response::Reply(reply) => reply,
            V6Response::Drop(reason) => {
                debug!(reason = reason.as_str(), "no response");
                continue;
            }
        };

        if srv.hooks.has_callouts(HookPoint::Pkt6Send) {
            let mut handle = CalloutHandle::for_packet(&mut reply);
            srv.hooks.invoke(HookPoint::Pkt6Send, &mut handle);
            if handle.skip() {
                debug!("pkt6_send callout skipped the response");
                continue;
            }
        }

        emit(Datagram {
            bytes: reply.to_vec(),
            peer: dgram.peer,
            iface: dgram.iface,
        });
    }

    info!("receive stream ended, worker shutting down");
}

/// Serve DHCPv6 over a blocking UDP socket, feeding `run_pump`. Bind
/// address comes from `DUSKDHCP6_BIND`, defaulting to the server port on
/// all interfaces.
pub fn v6_worker(srv: &Server6, config: &SharedConfig) {
    let bind_addr = std::env::var("DUSKDHCP6_BIND").unwrap_or("[::]:547".into());
    let socket = UdpSocket::bind(&bind_addr).expect("udp bind");
    info!("Successfully bound to: {bind_addr}");

    let mut read_buf = [0u8; 2048];
    let recv_socket = &socket;
    let recv = move || loop {
        // if the peer is not listening for the response it may answer
        // with an ICMP unreachable, surfacing here as ConnectionReset
        match recv_socket.recv_from(&mut read_buf) {
            Ok((amount, src)) => {
                debug!("Received {amount} bytes from {src:?}");
                return Some(Datagram {
                    bytes: read_buf[..amount].to_vec(),
                    peer: src,
                    iface: None,
                });
            }
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                error!("Sent response to host that responded with ICMP unreachable");
            }
            Err(err) => {
                error!("Error receiving: {err:?}");
            }
        }
    };

    let emit_socket = &socket;
    let emit = move |dgram: Datagram| match emit_socket.send_to(&dgram.bytes, dgram.peer) {
        Ok(sent) => debug!("responded with {sent} bytes"),
        Err(err) => error!("Problem sending response message: {err}"),
    };

    run_pump(srv, config, recv, emit);
}
