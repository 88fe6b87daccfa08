pub mod handlers;
pub mod selector;
pub mod worker;

/// Valid Lifetime - total time a lease stays usable when the
/// configuration does not say otherwise.
pub(crate) const VALID_LIFETIME: u32 = 7200;
/// Preferred Lifetime - time until an address becomes "deprecated"
/// (typically 0.5 * valid_lifetime)
pub(crate) const PREFERRED_LIFETIME: u32 = VALID_LIFETIME / 2;
/// Renewal Time - T1 - time until the client enters RENEWING state
/// (typically 0.5 * preferred_lifetime)
pub(crate) const RENEWAL_TIME: u32 = PREFERRED_LIFETIME / 2;
/// Rebinding Time - T2 - time until the client enters REBINDING state
/// (typically 0.8 * preferred_lifetime)
pub(crate) const REBINDING_TIME: u32 = PREFERRED_LIFETIME * 4 / 5;

pub use worker::{run_pump, v6_worker, Datagram};
