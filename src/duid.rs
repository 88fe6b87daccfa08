use std::{
    error, fmt, fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use advmac::MacAddr6;
use tracing::{info, warn};

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the epoch
/// DUID-LLT timestamps count from.
pub const DUID_TIME_EPOCH: u64 = 946_684_800;

pub const DUID_TYPE_LLT: u16 = 1;
pub const DUID_TYPE_EN: u16 = 2;
pub const DUID_TYPE_LL: u16 = 3;

const DUID_MIN_LEN: usize = 1;
const DUID_MAX_LEN: usize = 130;

/// A DHCP Unique Identifier: an opaque byte string with a type tag in its
/// first two bytes. Once a server writes its DUID it never changes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Duid {
    pub bytes: Vec<u8>,
}

impl Duid {
    /// Build a DUID-LLT from a hardware type, seconds since the 2000
    /// epoch, and a link-layer address.
    pub fn new_llt(hw_type: u16, time: u32, link_layer: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(8 + link_layer.len());
        bytes.extend_from_slice(&DUID_TYPE_LLT.to_be_bytes());
        bytes.extend_from_slice(&hw_type.to_be_bytes());
        bytes.extend_from_slice(&time.to_be_bytes());
        bytes.extend_from_slice(link_layer);
        Duid { bytes }
    }

    /// The type tag from the first two bytes, when present.
    pub fn type_code(&self) -> Option<u16> {
        match self.bytes.as_slice() {
            [a, b, ..] => Some(u16::from_be_bytes([*a, *b])),
            _ => None,
        }
    }

    pub fn to_colon_string(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Parse the textual `01:ff:02:...` form used by the server-id file.
    pub fn from_colon_string(text: &str) -> Result<Self, DuidParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DuidParseError::BadLength(0));
        }
        let mut bytes = Vec::new();
        for part in text.split(':') {
            if part.len() != 2 {
                return Err(DuidParseError::BadByte(part.to_string()));
            }
            let byte = u8::from_str_radix(part, 16)
                .map_err(|_| DuidParseError::BadByte(part.to_string()))?;
            bytes.push(byte);
        }
        if !(DUID_MIN_LEN..=DUID_MAX_LEN).contains(&bytes.len()) {
            return Err(DuidParseError::BadLength(bytes.len()));
        }
        Ok(Duid { bytes })
    }
}

impl From<Vec<u8>> for Duid {
    fn from(bytes: Vec<u8>) -> Self {
        Duid { bytes }
    }
}

impl fmt::Debug for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Duid({})", self.to_colon_string())
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_colon_string())
    }
}

#[derive(Debug)]
pub enum DuidParseError {
    BadByte(String),
    BadLength(usize),
}

impl fmt::Display for DuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuidParseError::BadByte(part) => write!(f, "`{part}` is not a hex byte"),
            DuidParseError::BadLength(len) => {
                write!(f, "DUID must be 1-130 bytes, got {len}")
            }
        }
    }
}

impl error::Error for DuidParseError {}

#[derive(Debug)]
pub enum DuidError {
    Io { err: io::Error, path: PathBuf },
    Parse { err: DuidParseError, path: PathBuf },
}

impl fmt::Display for DuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuidError::Io { err, path } => {
                write!(f, "`{}`: {err}", path.to_string_lossy())
            }
            DuidError::Parse { err, path } => {
                write!(f, "parsing `{}`: {err}", path.to_string_lossy())
            }
        }
    }
}

impl error::Error for DuidError {}

/// The server DUID persisted as one line of colon-separated hex.
///
/// `ensure` is the startup entry point: load the existing identity, or
/// synthesize a DUID-LLT once and persist it so every later start (and the
/// server-id option) sees the same bytes.
pub struct ServerIdFile {
    path: PathBuf,
}

impl ServerIdFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ServerIdFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Duid, DuidError> {
        let text = fs::read_to_string(&self.path).map_err(|err| DuidError::Io {
            err,
            path: self.path.clone(),
        })?;
        Duid::from_colon_string(&text).map_err(|err| DuidError::Parse {
            err,
            path: self.path.clone(),
        })
    }

    pub fn write(&self, duid: &Duid) -> Result<(), DuidError> {
        fs::write(&self.path, duid.to_colon_string()).map_err(|err| DuidError::Io {
            err,
            path: self.path.clone(),
        })
    }

    pub fn ensure(&self) -> Result<Duid, DuidError> {
        match self.load() {
            Ok(duid) => {
                info!(duid = %duid, "loaded server DUID");
                return Ok(duid);
            }
            Err(DuidError::Io { err, .. }) if err.kind() == io::ErrorKind::NotFound => {}
            Err(DuidError::Parse { err, ref path }) => {
                // never regenerate over an existing file, even a corrupt one
                return Err(DuidError::Parse {
                    err,
                    path: path.clone(),
                });
            }
            Err(err) => return Err(err),
        }

        let duid = generate_llt();
        self.write(&duid)?;
        info!(duid = %duid, path = %self.path.display(), "generated server DUID");
        Ok(duid)
    }
}

/// Seconds since the DUID epoch, saturating at zero for clocks set before
/// 2000.
fn duid_time_now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(DUID_TIME_EPOCH) as u32
}

fn generate_llt() -> Duid {
    let mac = first_interface_mac().unwrap_or_else(|| {
        warn!("no usable interface link-layer address, deriving one from the clock");
        fallback_mac()
    });
    // hardware type 1 = ethernet
    Duid::new_llt(1, duid_time_now(), &mac.to_array())
}

/// First non-loopback, non-zero link-layer address from the platform
/// interface table.
#[cfg(target_os = "linux")]
fn first_interface_mac() -> Option<MacAddr6> {
    let mut names: Vec<_> = fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .collect();
    names.sort();

    for name in names {
        if name == "lo" {
            continue;
        }
        let mut path = PathBuf::from("/sys/class/net");
        path.push(&name);
        path.push("address");
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(mac) = MacAddr6::parse_str(text.trim()) else {
            continue;
        };
        if mac.to_array() != [0; 6] {
            return Some(mac);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn first_interface_mac() -> Option<MacAddr6> {
    None
}

/// Locally-administered pseudo-MAC derived from the clock, used only when
/// the host exposes no link-layer address at all.
fn fallback_mac() -> MacAddr6 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let secs = duid_time_now();
    let [a, b, c, d] = secs.to_be_bytes();
    let [e, f] = (nanos as u16).to_be_bytes();
    MacAddr6::new([a | 0x02, b, c, d, e, f])
}
