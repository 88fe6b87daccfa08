pub mod alloc;
pub mod config;
pub mod duid;
pub mod hooks;
pub mod leasedb;
pub mod logging;
pub mod options;
pub mod packet;
pub mod signal;
pub mod v6;
pub mod wire;

pub use config::{Config, Pool, PoolKind, SharedConfig, Subnet6};
pub use duid::{Duid, ServerIdFile};
pub use leasedb::{Lease, LeaseStore, LeaseType, MemfileLeaseDb};
pub use options::{DhcpOption, DhcpOptions, Status};
pub use packet::{MessageType, Packet};
pub use v6::handlers::Server6;
