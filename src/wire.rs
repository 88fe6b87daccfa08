use std::{error, fmt, net::Ipv6Addr};

/// Errors raised while decoding DHCPv6 wire data.
///
/// `ShortBuffer` means a declared length promised more bytes than the
/// buffer holds. `InvalidValue` means the bytes were present but violate
/// the option's constraints (e.g. a prefix length above 128).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    ShortBuffer { needed: usize, remaining: usize },
    InvalidValue(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::ShortBuffer { needed, remaining } => {
                write!(f, "short buffer: need {needed} bytes, {remaining} remain")
            }
            DecodeError::InvalidValue(what) => write!(f, "invalid value: {what}"),
        }
    }
}

impl error::Error for DecodeError {}

/// Cursor over a borrowed byte slice. All reads are big-endian and fail
/// with `ShortBuffer` instead of panicking.
pub struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::ShortBuffer {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }

    pub fn read_ipv6(&mut self) -> Result<Ipv6Addr, DecodeError> {
        let b = self.take(16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(b);
        Ok(Ipv6Addr::from(octets))
    }
}

/// Growable output buffer. Writes cannot fail; the caller frames options
/// itself via `write_u16` length fields.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_slice(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_ipv6(&mut self, addr: Ipv6Addr) {
        self.buf.extend_from_slice(&addr.octets());
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

pub trait Decodable: Sized {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&mut Decoder::new(bytes))
    }
}

pub trait Encodable {
    fn encode(&self, enc: &mut Encoder);

    fn to_vec(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode(&mut enc);
        enc.into_vec()
    }
}
