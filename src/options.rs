use std::{fmt, net::Ipv6Addr};

use crate::wire::{DecodeError, Decoder, Encodable, Encoder};

/// DHCPv6 option codes understood by the server. Everything else is kept
/// as `OptionCode::Unknown` and round-trips untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionCode {
    ClientId,
    ServerId,
    IaNa,
    IaAddr,
    Oro,
    RelayMsg,
    StatusCode,
    InterfaceId,
    DnsServers,
    IaPd,
    IaPrefix,
    SubscriberId,
    Unknown(u16),
}

impl From<u16> for OptionCode {
    fn from(code: u16) -> Self {
        match code {
            1 => OptionCode::ClientId,
            2 => OptionCode::ServerId,
            3 => OptionCode::IaNa,
            5 => OptionCode::IaAddr,
            6 => OptionCode::Oro,
            9 => OptionCode::RelayMsg,
            13 => OptionCode::StatusCode,
            18 => OptionCode::InterfaceId,
            23 => OptionCode::DnsServers,
            25 => OptionCode::IaPd,
            26 => OptionCode::IaPrefix,
            38 => OptionCode::SubscriberId,
            other => OptionCode::Unknown(other),
        }
    }
}

impl From<OptionCode> for u16 {
    fn from(code: OptionCode) -> Self {
        match code {
            OptionCode::ClientId => 1,
            OptionCode::ServerId => 2,
            OptionCode::IaNa => 3,
            OptionCode::IaAddr => 5,
            OptionCode::Oro => 6,
            OptionCode::RelayMsg => 9,
            OptionCode::StatusCode => 13,
            OptionCode::InterfaceId => 18,
            OptionCode::DnsServers => 23,
            OptionCode::IaPd => 25,
            OptionCode::IaPrefix => 26,
            OptionCode::SubscriberId => 38,
            OptionCode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for OptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionCode::Unknown(code) => write!(f, "option({code})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// DHCPv6 status codes (RFC 3315 section 24.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    UnspecFail,
    NoAddrsAvail,
    NoBinding,
    NotOnLink,
    UseMulticast,
    Unknown(u16),
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        match code {
            0 => Status::Success,
            1 => Status::UnspecFail,
            2 => Status::NoAddrsAvail,
            3 => Status::NoBinding,
            4 => Status::NotOnLink,
            5 => Status::UseMulticast,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        match status {
            Status::Success => 0,
            Status::UnspecFail => 1,
            Status::NoAddrsAvail => 2,
            Status::NoBinding => 3,
            Status::NotOnLink => 4,
            Status::UseMulticast => 5,
            Status::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCode {
    pub status: Status,
    pub message: String,
}

impl StatusCode {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        StatusCode {
            status,
            message: message.into(),
        }
    }
}

/// IA_NA container option (code 3). Sub-options typically carry the
/// IA-address and status-code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaNa {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub opts: DhcpOptions,
}

/// IA_PD container option (code 25). Parsed and round-tripped only; this
/// server does not lease prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaPd {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub opts: DhcpOptions,
}

/// IA-address option (code 5), nested inside IA_NA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaAddr {
    pub addr: Ipv6Addr,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub opts: DhcpOptions,
}

/// IA-prefix option (code 26), nested inside IA_PD.
///
/// The address field always holds the masked form: bits beyond
/// `prefix_len` are zero, both after decode and on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaPrefix {
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub opts: DhcpOptions,
}

/// Clear the non-significant bits of `addr` beyond `len`.
pub fn mask_prefix_bits(addr: Ipv6Addr, len: u8) -> Ipv6Addr {
    let bits = u128::from(addr);
    let masked = match len {
        0 => 0,
        1..=127 => bits & (u128::MAX << (128 - u32::from(len))),
        _ => bits,
    };
    Ipv6Addr::from(masked)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    ClientId(Vec<u8>),
    ServerId(Vec<u8>),
    IaNa(IaNa),
    IaAddr(IaAddr),
    Oro(Vec<u16>),
    StatusCode(StatusCode),
    InterfaceId(Vec<u8>),
    DnsServers(Vec<Ipv6Addr>),
    IaPd(IaPd),
    IaPrefix(IaPrefix),
    SubscriberId(Vec<u8>),
    Unknown { code: u16, data: Vec<u8> },
}

impl DhcpOption {
    pub fn code(&self) -> OptionCode {
        match self {
            DhcpOption::ClientId(_) => OptionCode::ClientId,
            DhcpOption::ServerId(_) => OptionCode::ServerId,
            DhcpOption::IaNa(_) => OptionCode::IaNa,
            DhcpOption::IaAddr(_) => OptionCode::IaAddr,
            DhcpOption::Oro(_) => OptionCode::Oro,
            DhcpOption::StatusCode(_) => OptionCode::StatusCode,
            DhcpOption::InterfaceId(_) => OptionCode::InterfaceId,
            DhcpOption::DnsServers(_) => OptionCode::DnsServers,
            DhcpOption::IaPd(_) => OptionCode::IaPd,
            DhcpOption::IaPrefix(_) => OptionCode::IaPrefix,
            DhcpOption::SubscriberId(_) => OptionCode::SubscriberId,
            DhcpOption::Unknown { code, .. } => OptionCode::Unknown(*code),
        }
    }
}

impl fmt::Display for DhcpOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhcpOption::ClientId(id) => write!(f, "client-id len={}", id.len()),
            DhcpOption::ServerId(id) => write!(f, "server-id len={}", id.len()),
            DhcpOption::IaNa(ia) => {
                write!(
                    f,
                    "ia-na iaid={} t1={} t2={} subopts={}",
                    ia.iaid,
                    ia.t1,
                    ia.t2,
                    ia.opts.len()
                )
            }
            DhcpOption::IaAddr(ia) => write!(
                f,
                "ia-addr {} preferred={} valid={}",
                ia.addr, ia.preferred_lifetime, ia.valid_lifetime
            ),
            DhcpOption::Oro(codes) => write!(f, "oro {codes:?}"),
            DhcpOption::StatusCode(sc) => {
                write!(f, "status-code {:?} \"{}\"", sc.status, sc.message)
            }
            DhcpOption::InterfaceId(id) => write!(f, "interface-id {id:02x?}"),
            DhcpOption::DnsServers(addrs) => write!(f, "dns-servers {addrs:?}"),
            DhcpOption::IaPd(pd) => {
                write!(f, "ia-pd iaid={} t1={} t2={}", pd.iaid, pd.t1, pd.t2)
            }
            DhcpOption::IaPrefix(p) => write!(
                f,
                "ia-prefix {}/{} preferred={} valid={}",
                p.prefix, p.prefix_len, p.preferred_lifetime, p.valid_lifetime
            ),
            DhcpOption::SubscriberId(id) => write!(f, "subscriber-id {id:02x?}"),
            DhcpOption::Unknown { code, data } => {
                write!(f, "option({code}) len={}", data.len())
            }
        }
    }
}

/// Ordered option list. Insertion order is preserved on the wire; lookups
/// return the first match, which is what every exchange here needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions(Vec<DhcpOption>);

impl DhcpOptions {
    pub fn new() -> Self {
        DhcpOptions(Vec::new())
    }

    pub fn insert(&mut self, opt: DhcpOption) {
        self.0.push(opt);
    }

    pub fn get(&self, code: OptionCode) -> Option<&DhcpOption> {
        self.0.iter().find(|opt| opt.code() == code)
    }

    pub fn all(&self, code: OptionCode) -> impl Iterator<Item = &DhcpOption> {
        self.0.iter().filter(move |opt| opt.code() == code)
    }

    pub fn count(&self, code: OptionCode) -> usize {
        self.all(code).count()
    }

    /// Remove every instance of `code`, returning how many were dropped.
    pub fn remove(&mut self, code: OptionCode) -> usize {
        let before = self.0.len();
        self.0.retain(|opt| opt.code() != code);
        before - self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DhcpOption> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, DhcpOption> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode options until the decoder is exhausted. Used both for
    /// message bodies and for nested containers, whose sub-decoder is
    /// bounded by the outer option's declared length.
    pub fn decode_to_end(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let mut opts = DhcpOptions::new();
        while !dec.is_empty() {
            opts.insert(decode_option(dec)?);
        }
        Ok(opts)
    }
}

impl<'a> IntoIterator for &'a DhcpOptions {
    type Item = &'a DhcpOption;
    type IntoIter = std::slice::Iter<'a, DhcpOption>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<DhcpOption> for DhcpOptions {
    fn from_iter<T: IntoIterator<Item = DhcpOption>>(iter: T) -> Self {
        DhcpOptions(iter.into_iter().collect())
    }
}

/// Decode one `code:u16 len:u16 payload[len]` frame.
pub fn decode_option(dec: &mut Decoder<'_>) -> Result<DhcpOption, DecodeError> {
    let code = dec.read_u16()?;
    let len = usize::from(dec.read_u16()?);
    let payload = dec.read_slice(len)?;
    decode_option_body(code, payload)
}

/// Decode an option whose framing has already been consumed. The packet
/// decoder uses this directly so it can intercept relay-message payloads.
pub(crate) fn decode_option_body(code: u16, payload: &[u8]) -> Result<DhcpOption, DecodeError> {
    let len = payload.len();
    let mut body = Decoder::new(payload);

    let opt = match OptionCode::from(code) {
        OptionCode::ClientId => DhcpOption::ClientId(payload.to_vec()),
        OptionCode::ServerId => DhcpOption::ServerId(payload.to_vec()),
        OptionCode::IaNa => {
            let iaid = body.read_u32()?;
            let t1 = body.read_u32()?;
            let t2 = body.read_u32()?;
            DhcpOption::IaNa(IaNa {
                iaid,
                t1,
                t2,
                opts: DhcpOptions::decode_to_end(&mut body)?,
            })
        }
        OptionCode::IaPd => {
            let iaid = body.read_u32()?;
            let t1 = body.read_u32()?;
            let t2 = body.read_u32()?;
            DhcpOption::IaPd(IaPd {
                iaid,
                t1,
                t2,
                opts: DhcpOptions::decode_to_end(&mut body)?,
            })
        }
        OptionCode::IaAddr => {
            let addr = body.read_ipv6()?;
            let preferred_lifetime = body.read_u32()?;
            let valid_lifetime = body.read_u32()?;
            DhcpOption::IaAddr(IaAddr {
                addr,
                preferred_lifetime,
                valid_lifetime,
                opts: DhcpOptions::decode_to_end(&mut body)?,
            })
        }
        OptionCode::IaPrefix => {
            // 4 + 4 + 1 + 16 fixed bytes before any sub-option
            if len < 25 {
                return Err(DecodeError::InvalidValue("ia-prefix shorter than 25 bytes"));
            }
            let preferred_lifetime = body.read_u32()?;
            let valid_lifetime = body.read_u32()?;
            let prefix_len = body.read_u8()?;
            if prefix_len > 128 {
                return Err(DecodeError::InvalidValue("prefix length exceeds 128"));
            }
            let prefix = mask_prefix_bits(body.read_ipv6()?, prefix_len);
            DhcpOption::IaPrefix(IaPrefix {
                prefix_len,
                prefix,
                preferred_lifetime,
                valid_lifetime,
                opts: DhcpOptions::decode_to_end(&mut body)?,
            })
        }
        OptionCode::Oro => {
            if len % 2 != 0 {
                return Err(DecodeError::InvalidValue("oro length not a code multiple"));
            }
            let mut codes = Vec::with_capacity(len / 2);
            while !body.is_empty() {
                codes.push(body.read_u16()?);
            }
            DhcpOption::Oro(codes)
        }
        OptionCode::StatusCode => {
            let status = Status::from(body.read_u16()?);
            let text = body.read_slice(body.remaining())?;
            let message = String::from_utf8(text.to_vec())
                .map_err(|_| DecodeError::InvalidValue("status-code text is not utf-8"))?;
            DhcpOption::StatusCode(StatusCode { status, message })
        }
        OptionCode::InterfaceId => DhcpOption::InterfaceId(payload.to_vec()),
        OptionCode::DnsServers => {
            if len % 16 != 0 {
                return Err(DecodeError::InvalidValue(
                    "dns-servers length not an address multiple",
                ));
            }
            let mut addrs = Vec::with_capacity(len / 16);
            while !body.is_empty() {
                addrs.push(body.read_ipv6()?);
            }
            DhcpOption::DnsServers(addrs)
        }
        OptionCode::SubscriberId => DhcpOption::SubscriberId(payload.to_vec()),
        // relay-message options are unwrapped by the packet decoder; one
        // appearing anywhere else is carried opaquely
        OptionCode::RelayMsg | OptionCode::Unknown(_) => DhcpOption::Unknown {
            code,
            data: payload.to_vec(),
        },
    };
    Ok(opt)
}

impl Encodable for DhcpOption {
    fn encode(&self, enc: &mut Encoder) {
        let mut body = Encoder::new();
        match self {
            DhcpOption::ClientId(id) | DhcpOption::ServerId(id) => body.write_slice(id),
            DhcpOption::IaNa(ia) => {
                body.write_u32(ia.iaid);
                body.write_u32(ia.t1);
                body.write_u32(ia.t2);
                ia.opts.encode(&mut body);
            }
            DhcpOption::IaPd(pd) => {
                body.write_u32(pd.iaid);
                body.write_u32(pd.t1);
                body.write_u32(pd.t2);
                pd.opts.encode(&mut body);
            }
            DhcpOption::IaAddr(ia) => {
                body.write_ipv6(ia.addr);
                body.write_u32(ia.preferred_lifetime);
                body.write_u32(ia.valid_lifetime);
                ia.opts.encode(&mut body);
            }
            DhcpOption::IaPrefix(p) => {
                body.write_u32(p.preferred_lifetime);
                body.write_u32(p.valid_lifetime);
                body.write_u8(p.prefix_len);
                body.write_ipv6(mask_prefix_bits(p.prefix, p.prefix_len));
                p.opts.encode(&mut body);
            }
            DhcpOption::Oro(codes) => {
                for code in codes {
                    body.write_u16(*code);
                }
            }
            DhcpOption::StatusCode(sc) => {
                body.write_u16(sc.status.into());
                body.write_slice(sc.message.as_bytes());
            }
            DhcpOption::InterfaceId(id) => body.write_slice(id),
            DhcpOption::DnsServers(addrs) => {
                for addr in addrs {
                    body.write_ipv6(*addr);
                }
            }
            DhcpOption::SubscriberId(id) => body.write_slice(id),
            DhcpOption::Unknown { data, .. } => body.write_slice(data),
        }

        let payload = body.into_vec();
        enc.write_u16(self.code().into());
        enc.write_u16(payload.len() as u16);
        enc.write_slice(&payload);
    }
}

impl Encodable for DhcpOptions {
    fn encode(&self, enc: &mut Encoder) {
        for opt in &self.0 {
            opt.encode(enc);
        }
    }
}
