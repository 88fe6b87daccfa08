use std::{
    error, fmt,
    net::Ipv6Addr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use arc_swap::ArcSwap;
use compact_str::CompactString;
use ipnet::Ipv6Net;
use serde::Deserialize;

use crate::options::{decode_option_body, DhcpOption};
use crate::v6::{PREFERRED_LIFETIME, REBINDING_TIME, RENEWAL_TIME, VALID_LIFETIME};

/// Shared handle the workers read the configuration through. Reload swaps
/// the whole `Config` atomically between requests.
pub type SharedConfig = Arc<ArcSwap<Config>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Non-temporary addresses (IA_NA)
    Ia,
    /// Temporary addresses (IA_TA)
    Ta,
}

/// A contiguous address range leases are drawn from. Always lies inside
/// its owning subnet's prefix; `Subnet6::add_pool` enforces that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub kind: PoolKind,
    first: Ipv6Addr,
    last: Ipv6Addr,
}

impl Pool {
    pub fn new(kind: PoolKind, first: Ipv6Addr, last: Ipv6Addr) -> Result<Self, ConfigError> {
        if first > last {
            return Err(ConfigError::InvalidPool(format!(
                "{first} - {last} is not an ascending range"
            )));
        }
        Ok(Pool { kind, first, last })
    }

    pub fn from_prefix(kind: PoolKind, net: Ipv6Net) -> Self {
        Pool {
            kind,
            first: net.network(),
            last: net.broadcast(),
        }
    }

    pub fn first(&self) -> Ipv6Addr {
        self.first
    }

    pub fn last(&self) -> Ipv6Addr {
        self.last
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        self.first <= addr && addr <= self.last
    }

    /// Number of addresses in the pool, saturating on the full range.
    pub fn capacity(&self) -> u128 {
        (u128::from(self.last) - u128::from(self.first)).saturating_add(1)
    }

    /// Address at `offset` from the pool start; offset must be within
    /// capacity.
    pub fn addr_at(&self, offset: u128) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.first) + offset)
    }
}

/// A configured IPv6 subnet: prefix, lease timers, pools, and the signals
/// the selector matches on (ingress interface, relay interface-id).
#[derive(Debug, Clone)]
pub struct Subnet6 {
    /// Positive and unique within a configuration; assigned by
    /// `Config::add_subnet`.
    pub id: u32,
    pub prefix: Ipv6Net,
    pub t1: u32,
    pub t2: u32,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub pools: Vec<Pool>,
    pub interface: Option<CompactString>,
    pub interface_id: Option<Vec<u8>>,
    /// Option-data from the configuration, already materialized as typed
    /// options; attached to responses on request (ORO).
    pub options: Vec<DhcpOption>,
}

impl Subnet6 {
    pub fn new(prefix: Ipv6Net, t1: u32, t2: u32, preferred: u32, valid: u32) -> Self {
        Subnet6 {
            id: 0,
            prefix,
            t1,
            t2,
            preferred_lifetime: preferred,
            valid_lifetime: valid,
            pools: Vec::new(),
            interface: None,
            interface_id: None,
            options: Vec::new(),
        }
    }

    pub fn add_pool(&mut self, pool: Pool) -> Result<(), ConfigError> {
        if !self.prefix.contains(&pool.first) || !self.prefix.contains(&pool.last) {
            return Err(ConfigError::PoolOutOfRange {
                pool: format!("{} - {}", pool.first, pool.last),
                subnet: self.prefix.to_string(),
            });
        }
        self.pools.push(pool);
        Ok(())
    }

    pub fn in_range(&self, addr: Ipv6Addr) -> bool {
        self.prefix.contains(&addr)
    }

    pub fn in_pool(&self, addr: Ipv6Addr) -> bool {
        self.pools.iter().any(|pool| pool.contains(addr))
    }

    pub fn pool_capacity(&self) -> u128 {
        self.pools
            .iter()
            .fold(0u128, |acc, pool| acc.saturating_add(pool.capacity()))
    }

    /// Configured option for a requested ORO code, if any.
    pub fn option_for(&self, code: u16) -> Option<&DhcpOption> {
        self.options.iter().find(|opt| u16::from(opt.code()) == code)
    }
}

/// The subnets the server answers for, in configuration order. Read-only
/// during packet processing; reconfiguration builds a fresh `Config` and
/// swaps the `SharedConfig` pointer.
#[derive(Debug)]
pub struct Config {
    subnets: Vec<Arc<Subnet6>>,
    next_subnet_id: u32,
    pub log_level: Option<tracing::Level>,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Config {
            subnets: Vec::new(),
            next_subnet_id: 1,
            log_level: None,
        }
    }

    /// Register a subnet, assigning the next positive subnet id.
    pub fn add_subnet(&mut self, mut subnet: Subnet6) -> Arc<Subnet6> {
        subnet.id = self.next_subnet_id;
        self.next_subnet_id += 1;
        let subnet = Arc::new(subnet);
        self.subnets.push(Arc::clone(&subnet));
        subnet
    }

    pub fn delete_all_subnets(&mut self) {
        self.subnets.clear();
    }

    /// Subnets in insertion order.
    pub fn subnets(&self) -> &[Arc<Subnet6>] {
        &self.subnets
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(ArcSwap::from_pointee(self))
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(path)?;
        let doc: ConfigDocument = serde_json::from_str(&text).context(path)?;
        doc.build()
    }

    pub fn from_json(text: &str) -> Result<Config, ConfigError> {
        let doc: ConfigDocument =
            serde_json::from_str(text).context(Path::new("<inline config>"))?;
        doc.build()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Parsing { err: serde_json::Error, path: PathBuf },
    Io { err: std::io::Error, path: PathBuf },
    InvalidSubnet(String),
    InvalidPool(String),
    PoolOutOfRange { pool: String, subnet: String },
    InvalidOptionData { code: u16, reason: String },
    LogLevel(String),
}

trait PathContext<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError>;
}

impl<T> PathContext<T> for serde_json::Result<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError> {
        self.map_err(|e| ConfigError::Parsing {
            err: e,
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl<T> PathContext<T> for std::io::Result<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError> {
        self.map_err(|e| ConfigError::Io {
            err: e,
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parsing { err, path } => {
                write!(f, "Parsing `{}`: {err}", path.to_string_lossy())
            }
            ConfigError::Io { err, path } => write!(f, "`{}`: {err}", path.to_string_lossy()),
            ConfigError::InvalidSubnet(what) => write!(f, "Invalid subnet6 entry: {what}"),
            ConfigError::InvalidPool(what) => write!(f, "Invalid pool: {what}"),
            ConfigError::PoolOutOfRange { pool, subnet } => {
                write!(f, "Pool `{pool}` lies outside subnet `{subnet}`")
            }
            ConfigError::InvalidOptionData { code, reason } => {
                write!(f, "option-data code {code}: {reason}")
            }
            ConfigError::LogLevel(value) => write!(
                f,
                r#"Unexpected log level {value}. Expected one of [trace, debug, info, warn, error]"#
            ),
        }
    }
}

impl error::Error for ConfigError {}

/// On-disk configuration document, deserialized verbatim and then
/// translated into the runtime `Config`.
#[derive(Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    subnet6: Vec<SubnetEntry>,
    #[serde(rename = "preferred-lifetime")]
    preferred_lifetime: Option<u32>,
    #[serde(rename = "valid-lifetime")]
    valid_lifetime: Option<u32>,
    #[serde(rename = "renew-timer")]
    renew_timer: Option<u32>,
    #[serde(rename = "rebind-timer")]
    rebind_timer: Option<u32>,
    #[serde(rename = "log-level")]
    log_level: Option<String>,
    // listening interfaces are the transport's concern; accepted so shared
    // documents parse
    #[serde(default, rename = "interfaces-config")]
    _interfaces_config: Option<serde_json::Value>,
    #[serde(default, rename = "interface")]
    _interface: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct SubnetEntry {
    subnet: String,
    #[serde(default)]
    pool: Vec<String>,
    #[serde(default)]
    pools: Vec<String>,
    interface: Option<CompactString>,
    #[serde(rename = "interface-id")]
    interface_id: Option<String>,
    #[serde(default, rename = "option-data")]
    option_data: Vec<OptionDataEntry>,
    #[serde(rename = "preferred-lifetime")]
    preferred_lifetime: Option<u32>,
    #[serde(rename = "valid-lifetime")]
    valid_lifetime: Option<u32>,
    #[serde(rename = "renew-timer")]
    renew_timer: Option<u32>,
    #[serde(rename = "rebind-timer")]
    rebind_timer: Option<u32>,
}

#[derive(Deserialize)]
struct OptionDataEntry {
    #[serde(default, rename = "name")]
    _name: Option<String>,
    #[serde(default, rename = "space")]
    _space: Option<String>,
    code: u16,
    data: String,
    #[serde(default, rename = "csv-format")]
    csv_format: bool,
}

impl ConfigDocument {
    fn build(self) -> Result<Config, ConfigError> {
        let log_level = match self.log_level {
            Some(s) if !s.is_empty() => {
                Some(tracing::Level::from_str(&s).map_err(|_| ConfigError::LogLevel(s))?)
            }
            _ => None,
        };

        let mut config = Config::new();
        config.log_level = log_level;

        for entry in self.subnet6 {
            let prefix: Ipv6Net = entry
                .subnet
                .parse()
                .map_err(|_| ConfigError::InvalidSubnet(entry.subnet.clone()))?;

            let valid = entry
                .valid_lifetime
                .or(self.valid_lifetime)
                .unwrap_or(VALID_LIFETIME);
            let preferred = entry
                .preferred_lifetime
                .or(self.preferred_lifetime)
                .unwrap_or(PREFERRED_LIFETIME);
            let t1 = entry.renew_timer.or(self.renew_timer).unwrap_or(RENEWAL_TIME);
            let t2 = entry
                .rebind_timer
                .or(self.rebind_timer)
                .unwrap_or(REBINDING_TIME);

            let mut subnet = Subnet6::new(prefix, t1, t2, preferred, valid);
            subnet.interface = entry.interface;
            subnet.interface_id = entry
                .interface_id
                .map(|id| id.into_bytes())
                .filter(|id| !id.is_empty());

            for pool_text in entry.pool.iter().chain(entry.pools.iter()) {
                subnet.add_pool(parse_pool(pool_text)?)?;
            }

            for od in entry.option_data {
                subnet.options.push(materialize_option(&od)?);
            }

            config.add_subnet(subnet);
        }

        Ok(config)
    }
}

/// A pool is written either as a CIDR (`2001:db8:1::/64`) or as an
/// explicit range (`2001:db8:1::10 - 2001:db8:1::ff`).
fn parse_pool(text: &str) -> Result<Pool, ConfigError> {
    let text = text.trim();
    if let Some((first, last)) = text.split_once('-') {
        let first: Ipv6Addr = first
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPool(text.to_string()))?;
        let last: Ipv6Addr = last
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPool(text.to_string()))?;
        return Pool::new(PoolKind::Ia, first, last);
    }
    let net: Ipv6Net = text
        .parse()
        .map_err(|_| ConfigError::InvalidPool(text.to_string()))?;
    Ok(Pool::from_prefix(PoolKind::Ia, net))
}

/// Turn an option-data entry into a typed option. With csv-format the data
/// is a comma-separated address list; without, a string of hex digits.
/// Either way the bytes run through the regular option decoder so the
/// stored form matches what the wire codec would produce.
fn materialize_option(entry: &OptionDataEntry) -> Result<DhcpOption, ConfigError> {
    let payload = if entry.csv_format {
        let mut bytes = Vec::new();
        for token in entry.data.split(',') {
            let addr: Ipv6Addr =
                token
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOptionData {
                        code: entry.code,
                        reason: format!("`{}` is not an IPv6 address", token.trim()),
                    })?;
            bytes.extend_from_slice(&addr.octets());
        }
        bytes
    } else {
        parse_hex(&entry.data).ok_or_else(|| ConfigError::InvalidOptionData {
            code: entry.code,
            reason: "data is not an even string of hex digits".to_string(),
        })?
    };

    decode_option_body(entry.code, &payload).map_err(|err| ConfigError::InvalidOptionData {
        code: entry.code,
        reason: err.to_string(),
    })
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
