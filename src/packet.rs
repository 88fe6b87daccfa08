use std::net::Ipv6Addr;

use compact_str::CompactString;

use crate::options::{decode_option_body, DhcpOption, DhcpOptions, IaNa, OptionCode};
use crate::wire::{Decodable, DecodeError, Decoder, Encodable, Encoder};

/// UDP port the server listens on.
pub const SERVER_PORT: u16 = 547;
/// UDP port clients (and relays towards clients) use.
pub const CLIENT_PORT: u16 = 546;

/// RFC 3315 HOP_COUNT_LIMIT; also bounds relay-envelope nesting on decode.
const RELAY_HOP_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Solicit,
    Advertise,
    Request,
    Confirm,
    Renew,
    Rebind,
    Reply,
    Release,
    Decline,
    Reconfigure,
    InformationRequest,
    RelayForw,
    RelayRepl,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(ty: u8) -> Self {
        match ty {
            1 => MessageType::Solicit,
            2 => MessageType::Advertise,
            3 => MessageType::Request,
            4 => MessageType::Confirm,
            5 => MessageType::Renew,
            6 => MessageType::Rebind,
            7 => MessageType::Reply,
            8 => MessageType::Release,
            9 => MessageType::Decline,
            10 => MessageType::Reconfigure,
            11 => MessageType::InformationRequest,
            12 => MessageType::RelayForw,
            13 => MessageType::RelayRepl,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(ty: MessageType) -> Self {
        match ty {
            MessageType::Solicit => 1,
            MessageType::Advertise => 2,
            MessageType::Request => 3,
            MessageType::Confirm => 4,
            MessageType::Renew => 5,
            MessageType::Rebind => 6,
            MessageType::Reply => 7,
            MessageType::Release => 8,
            MessageType::Decline => 9,
            MessageType::Reconfigure => 10,
            MessageType::InformationRequest => 11,
            MessageType::RelayForw => 12,
            MessageType::RelayRepl => 13,
            MessageType::Unknown(other) => other,
        }
    }
}

impl MessageType {
    /// Server-originated message types are re-wrapped as relay-reply when
    /// the packet carries relay envelopes; everything else as relay-forward.
    fn is_server_to_client(self) -> bool {
        matches!(
            self,
            MessageType::Advertise | MessageType::Reply | MessageType::Reconfigure
        )
    }
}

/// One relay-forward encapsulation layer, outermost first in
/// `Packet::relay`. The relay-message option itself is unwrapped during
/// decode; `opts` holds the envelope's remaining options (interface-id,
/// remote-id, ...) in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    pub hop_count: u8,
    pub link_addr: Ipv6Addr,
    pub peer_addr: Ipv6Addr,
    pub opts: DhcpOptions,
}

impl RelayEnvelope {
    pub fn interface_id(&self) -> Option<&[u8]> {
        self.opts.iter().find_map(|opt| match opt {
            DhcpOption::InterfaceId(id) => Some(id.as_slice()),
            _ => None,
        })
    }
}

/// A decoded DHCPv6 message plus its relay stack and receive metadata.
///
/// `remote_addr` and `iface` are not wire fields; the transport fills them
/// in so subnet selection can see where the datagram entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_type: MessageType,
    pub xid: [u8; 3],
    pub opts: DhcpOptions,
    pub relay: Vec<RelayEnvelope>,
    pub remote_addr: Ipv6Addr,
    pub iface: Option<CompactString>,
}

impl Packet {
    pub fn new(msg_type: MessageType, xid: [u8; 3]) -> Self {
        Packet {
            msg_type,
            xid,
            opts: DhcpOptions::new(),
            relay: Vec::new(),
            remote_addr: Ipv6Addr::UNSPECIFIED,
            iface: None,
        }
    }

    /// Construct with a numeric transaction id, truncated to 24 bits.
    pub fn with_transid(msg_type: MessageType, transid: u32) -> Self {
        let [_, a, b, c] = transid.to_be_bytes();
        Packet::new(msg_type, [a, b, c])
    }

    pub fn transid(&self) -> u32 {
        u32::from_be_bytes([0, self.xid[0], self.xid[1], self.xid[2]])
    }

    /// Start a response: same transaction id, and the request's relay
    /// envelopes copied so the reply travels back through the same relays.
    pub fn reply_to(&self, msg_type: MessageType) -> Packet {
        Packet {
            msg_type,
            xid: self.xid,
            opts: DhcpOptions::new(),
            relay: self.relay.clone(),
            remote_addr: self.remote_addr,
            iface: self.iface.clone(),
        }
    }

    pub fn client_id(&self) -> Option<&[u8]> {
        self.opts.iter().find_map(|opt| match opt {
            DhcpOption::ClientId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn server_id(&self) -> Option<&[u8]> {
        self.opts.iter().find_map(|opt| match opt {
            DhcpOption::ServerId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn ia_nas(&self) -> impl Iterator<Item = &IaNa> {
        self.opts.iter().filter_map(|opt| match opt {
            DhcpOption::IaNa(ia) => Some(ia),
            _ => None,
        })
    }

    pub fn oro(&self) -> Option<&[u16]> {
        self.opts.iter().find_map(|opt| match opt {
            DhcpOption::Oro(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    /// True when the packet arrived from a link-local source (fe80::/10).
    pub fn from_link_local(&self) -> bool {
        self.remote_addr.segments()[0] & 0xffc0 == 0xfe80
    }
}

impl Decodable for Packet {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let mut relay = Vec::new();
        let mut payload = dec.read_slice(dec.remaining())?;

        loop {
            let mut level = Decoder::new(payload);
            let ty = MessageType::from(level.read_u8()?);

            if !matches!(ty, MessageType::RelayForw | MessageType::RelayRepl) {
                let xid_bytes = level.read_slice(3)?;
                let opts = DhcpOptions::decode_to_end(&mut level)?;
                return Ok(Packet {
                    msg_type: ty,
                    xid: [xid_bytes[0], xid_bytes[1], xid_bytes[2]],
                    opts,
                    relay,
                    remote_addr: Ipv6Addr::UNSPECIFIED,
                    iface: None,
                });
            }

            if relay.len() >= RELAY_HOP_LIMIT {
                return Err(DecodeError::InvalidValue("relay nesting exceeds hop limit"));
            }

            let hop_count = level.read_u8()?;
            let link_addr = level.read_ipv6()?;
            let peer_addr = level.read_ipv6()?;

            let mut opts = DhcpOptions::new();
            let mut inner = None;
            while !level.is_empty() {
                let code = level.read_u16()?;
                let len = usize::from(level.read_u16()?);
                let body = level.read_slice(len)?;
                if OptionCode::from(code) == OptionCode::RelayMsg {
                    inner = Some(body);
                } else {
                    opts.insert(decode_option_body(code, body)?);
                }
            }

            let Some(inner) = inner else {
                return Err(DecodeError::InvalidValue(
                    "relay envelope without relay-message option",
                ));
            };

            relay.push(RelayEnvelope {
                hop_count,
                link_addr,
                peer_addr,
                opts,
            });
            payload = inner;
        }
    }
}

impl Encodable for Packet {
    fn encode(&self, enc: &mut Encoder) {
        let mut inner = Encoder::new();
        inner.write_u8(self.msg_type.into());
        inner.write_slice(&self.xid);
        self.opts.encode(&mut inner);
        let mut payload = inner.into_vec();

        let relay_type: u8 = if self.msg_type.is_server_to_client() {
            MessageType::RelayRepl.into()
        } else {
            MessageType::RelayForw.into()
        };

        // wrap innermost envelope first; the relay-message option goes
        // last, after the envelope's own options
        for env in self.relay.iter().rev() {
            let mut frame = Encoder::new();
            frame.write_u8(relay_type);
            frame.write_u8(env.hop_count);
            frame.write_ipv6(env.link_addr);
            frame.write_ipv6(env.peer_addr);
            env.opts.encode(&mut frame);
            frame.write_u16(OptionCode::RelayMsg.into());
            frame.write_u16(payload.len() as u16);
            frame.write_slice(&payload);
            payload = frame.into_vec();
        }

        enc.write_slice(&payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{IaNa, Status};

    // SOLICIT captured from a MikroTik CPE: client-id, IA_NA, ORO,
    // elapsed-time, rapid-commit and IA_PD.
    const SOLICIT_CAPTURE: [u8; 66] = [
        0x01, 0xa4, 0xcf, 0x70, 0x00, 0x01, 0x00, 0x0a, 0x00, 0x03, 0x00, 0x01, 0x08, 0x55,
        0x31, 0x8f, 0x19, 0x94, 0x00, 0x03, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00,
        0x07, 0x08, 0x00, 0x00, 0x0b, 0x40, 0x00, 0x06, 0x00, 0x02, 0x00, 0x17, 0x00, 0x08,
        0x00, 0x02, 0x00, 0x00, 0x00, 0x0e, 0x00, 0x00, 0x00, 0x19, 0x00, 0x0c, 0x00, 0x00,
        0x00, 0x05, 0x00, 0x00, 0x07, 0x08, 0x00, 0x00, 0x0b, 0x40,
    ];

    // The same SOLICIT as forwarded by the relay: link-layer address
    // option, interface-id, then the relay-message option.
    const RELAY_FORW_CAPTURE: [u8; 124] = [
        0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0xfe, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0a, 0x55,
        0x31, 0xff, 0xfe, 0x8f, 0x19, 0x98, 0x00, 0x4f, 0x00, 0x08, 0x00, 0x01, 0x0a, 0x55,
        0x31, 0x8f, 0x19, 0x98, 0x00, 0x12, 0x00, 0x04, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x09,
        0x00, 0x42, 0x01, 0x9c, 0x31, 0xb2, 0x00, 0x01, 0x00, 0x0a, 0x00, 0x03, 0x00, 0x01,
        0x08, 0x55, 0x31, 0x8f, 0x19, 0x94, 0x00, 0x03, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x05,
        0x00, 0x00, 0x07, 0x08, 0x00, 0x00, 0x0b, 0x40, 0x00, 0x06, 0x00, 0x02, 0x00, 0x17,
        0x00, 0x08, 0x00, 0x02, 0x00, 0x00, 0x00, 0x0e, 0x00, 0x00, 0x00, 0x19, 0x00, 0x0c,
        0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x07, 0x08, 0x00, 0x00, 0x0b, 0x40,
    ];

    #[test]
    fn solicit_capture_decodes() {
        let pkt = Packet::from_bytes(&SOLICIT_CAPTURE).unwrap();
        assert_eq!(pkt.msg_type, MessageType::Solicit);
        assert_eq!(pkt.xid, [0xa4, 0xcf, 0x70]);
        assert!(pkt.relay.is_empty());
        assert!(pkt.client_id().is_some());
        assert_eq!(pkt.ia_nas().count(), 1);
        assert_eq!(pkt.oro(), Some(&[23u16][..]));
        // elapsed-time is not a known code and is carried opaquely
        assert!(pkt.opts.get(OptionCode::Unknown(8)).is_some());
    }

    #[test]
    fn solicit_capture_round_trips() {
        let pkt = Packet::from_bytes(&SOLICIT_CAPTURE).unwrap();
        assert_eq!(pkt.to_vec(), SOLICIT_CAPTURE);
    }

    #[test]
    fn relay_forw_capture_decodes_and_round_trips() {
        let pkt = Packet::from_bytes(&RELAY_FORW_CAPTURE).unwrap();
        assert_eq!(pkt.msg_type, MessageType::Solicit);
        assert_eq!(pkt.relay.len(), 1);

        let env = &pkt.relay[0];
        assert_eq!(env.hop_count, 0);
        assert_eq!(env.link_addr, Ipv6Addr::UNSPECIFIED);
        assert_eq!(
            env.peer_addr,
            "fe80::a55:31ff:fe8f:1998".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(env.interface_id(), Some(&[0x00, 0x00, 0x00, 0x0c][..]));

        assert_eq!(pkt.to_vec(), RELAY_FORW_CAPTURE);
    }

    #[test]
    fn reply_is_wrapped_as_relay_reply() {
        let req = Packet::from_bytes(&RELAY_FORW_CAPTURE).unwrap();
        let mut reply = req.reply_to(MessageType::Reply);
        reply.opts.insert(DhcpOption::ClientId(vec![1, 2, 3]));
        let wire = reply.to_vec();

        assert_eq!(wire[0], u8::from(MessageType::RelayRepl));
        let parsed = Packet::from_bytes(&wire).unwrap();
        assert_eq!(parsed.msg_type, MessageType::Reply);
        assert_eq!(parsed.xid, req.xid);
        assert_eq!(parsed.relay, req.relay);
    }

    #[test]
    fn truncated_header_is_short_buffer() {
        assert!(matches!(
            Packet::from_bytes(&[0x01, 0xa4]),
            Err(DecodeError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn option_length_overrun_is_short_buffer() {
        // client-id claiming 10 bytes with only 2 present
        let wire = [0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x0a, 0xaa, 0xbb];
        assert!(matches!(
            Packet::from_bytes(&wire),
            Err(DecodeError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn relay_envelope_without_inner_message_is_invalid() {
        let mut wire = vec![0x0c, 0x00];
        wire.extend_from_slice(&[0u8; 32]); // link + peer
        wire.extend_from_slice(&[0x00, 0x12, 0x00, 0x01, 0x61]); // interface-id only
        assert_eq!(
            Packet::from_bytes(&wire),
            Err(DecodeError::InvalidValue(
                "relay envelope without relay-message option"
            ))
        );
    }

    #[test]
    fn transid_helpers_mask_to_24_bits() {
        let pkt = Packet::with_transid(MessageType::Solicit, 0xffcafe01);
        assert_eq!(pkt.xid, [0xca, 0xfe, 0x01]);
        assert_eq!(pkt.transid(), 0xcafe01);
    }

    #[test]
    fn ia_nas_yields_request_order() {
        let mut pkt = Packet::with_transid(MessageType::Request, 1);
        for iaid in [7u32, 3, 9] {
            pkt.opts.insert(DhcpOption::IaNa(IaNa {
                iaid,
                t1: 0,
                t2: 0,
                opts: DhcpOptions::new(),
            }));
        }
        let iaids: Vec<u32> = pkt.ia_nas().map(|ia| ia.iaid).collect();
        assert_eq!(iaids, [7, 3, 9]);
    }

    #[test]
    fn link_local_detection() {
        let mut pkt = Packet::with_transid(MessageType::Solicit, 1);
        pkt.remote_addr = "fe80::abcd".parse().unwrap();
        assert!(pkt.from_link_local());
        pkt.remote_addr = "2001:db8::1".parse().unwrap();
        assert!(!pkt.from_link_local());
    }

    #[test]
    fn status_parses_from_wire_code() {
        assert_eq!(Status::from(2), Status::NoAddrsAvail);
        assert_eq!(Status::from(3), Status::NoBinding);
        assert_eq!(u16::from(Status::Unknown(42)), 42);
    }
}
