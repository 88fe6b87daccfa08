use std::{
    error, fmt,
    hash::{Hash, Hasher},
    net::Ipv6Addr,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

use crate::config::{PoolKind, Subnet6};
use crate::duid::Duid;
use crate::leasedb::{Lease, LeaseDbError, LeaseStore, LeaseType};

/// Hashed probes tried before a small pool is scanned linearly or a large
/// one is declared exhausted.
const MAX_PROBES: u32 = 32;

/// Pools at or below this capacity are swept address-by-address once the
/// hashed probes miss, so exhaustion is always detected exactly.
const LINEAR_SCAN_LIMIT: u128 = 65_536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    NoAddressesAvailable,
    NoBinding,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::NoAddressesAvailable => f.write_str("no addresses available"),
            AllocError::NoBinding => f.write_str("no binding"),
        }
    }
}

impl error::Error for AllocError {}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn build_lease(subnet: &Subnet6, duid: &Duid, iaid: u32, addr: Ipv6Addr) -> Lease {
    Lease {
        addr,
        duid: duid.clone(),
        iaid,
        subnet_id: subnet.id,
        lease_type: LeaseType::Na,
        preferred_lifetime: subnet.preferred_lifetime,
        valid_lifetime: subnet.valid_lifetime,
        t1: subnet.t1,
        t2: subnet.t2,
        cltt: now_secs(),
    }
}

/// Choose an address for (DUID, IAID) in `subnet` and, when `commit` is
/// set, persist the lease. SOLICIT handling passes `commit = false`: the
/// advertised address is computed identically but nothing is stored.
///
/// The hint wins when it falls in an IA pool and is unleased. Otherwise
/// the pick is a hash of (DUID, IAID, attempt) over the subnet's aggregate
/// pool capacity, which spreads distinct clients across the pool while
/// keeping each client's pick stable between SOLICIT and REQUEST.
pub fn allocate(
    store: &dyn LeaseStore,
    subnet: &Subnet6,
    duid: &Duid,
    iaid: u32,
    hint: Option<Ipv6Addr>,
    commit: bool,
) -> Result<Lease, AllocError> {
    // a client retransmitting REQUEST already holds its binding
    if let Some(existing) = store.get_by_client(duid, iaid, subnet.id) {
        let refreshed = build_lease(subnet, duid, iaid, existing.addr);
        if commit {
            store
                .update(refreshed.clone())
                .map_err(|_| AllocError::NoAddressesAvailable)?;
        }
        return Ok(refreshed);
    }

    let addr = pick_address(store, subnet, duid, iaid, hint, None)?;
    let lease = build_lease(subnet, duid, iaid, addr);
    if !commit {
        return Ok(lease);
    }

    match store.add(lease.clone()) {
        Ok(()) => Ok(lease),
        Err(LeaseDbError::DuplicateKey(taken)) => {
            // lost a race for the pick; retry once with the address excluded
            debug!(%taken, "allocation raced, retrying once");
            let addr = pick_address(store, subnet, duid, iaid, None, Some(taken))?;
            let lease = build_lease(subnet, duid, iaid, addr);
            store
                .add(lease.clone())
                .map_err(|_| AllocError::NoAddressesAvailable)?;
            Ok(lease)
        }
        Err(LeaseDbError::NoSuchLease(_)) => Err(AllocError::NoAddressesAvailable),
    }
}

/// Refresh the client's existing binding. The stored record is
/// authoritative: a differing `requested` address still refreshes and
/// returns the stored one.
pub fn renew(
    store: &dyn LeaseStore,
    subnet: &Subnet6,
    duid: &Duid,
    iaid: u32,
    requested: Option<Ipv6Addr>,
) -> Result<Lease, AllocError> {
    let Some(existing) = store.get_by_client(duid, iaid, subnet.id) else {
        return Err(AllocError::NoBinding);
    };

    if let Some(requested) = requested {
        if requested != existing.addr {
            debug!(
                %requested,
                stored = %existing.addr,
                "renew for a different address, refreshing the stored lease"
            );
        }
    }

    let refreshed = build_lease(subnet, duid, iaid, existing.addr);
    store
        .update(refreshed.clone())
        .map_err(|_| AllocError::NoBinding)?;
    Ok(refreshed)
}

/// Remove the binding for `addr`, but only for the client that owns it.
pub fn release(
    store: &dyn LeaseStore,
    duid: &Duid,
    iaid: u32,
    addr: Ipv6Addr,
) -> Result<(), AllocError> {
    let Some(existing) = store.get_by_address(addr) else {
        return Err(AllocError::NoBinding);
    };
    if existing.duid != *duid || existing.iaid != iaid {
        return Err(AllocError::NoBinding);
    }
    store.delete(addr);
    Ok(())
}

fn pick_address(
    store: &dyn LeaseStore,
    subnet: &Subnet6,
    duid: &Duid,
    iaid: u32,
    hint: Option<Ipv6Addr>,
    excluded: Option<Ipv6Addr>,
) -> Result<Ipv6Addr, AllocError> {
    let free = |addr: Ipv6Addr| {
        Some(addr) != excluded && store.get_by_address(addr).is_none()
    };

    if let Some(hint) = hint {
        if ia_pools(subnet).any(|pool| pool.contains(hint)) && free(hint) {
            return Ok(hint);
        }
    }

    let capacity = ia_pools(subnet)
        .fold(0u128, |acc, pool| acc.saturating_add(pool.capacity()));
    if capacity == 0 {
        return Err(AllocError::NoAddressesAvailable);
    }

    for attempt in 0..MAX_PROBES {
        let idx = client_hash(duid, iaid, attempt) % capacity;
        let addr = addr_at(subnet, idx);
        if free(addr) {
            return Ok(addr);
        }
    }

    // hashed probes keep colliding; small pools are likely near-full, so
    // sweep them to find any remaining address
    if capacity <= LINEAR_SCAN_LIMIT {
        for pool in ia_pools(subnet) {
            for offset in 0..pool.capacity() {
                let addr = pool.addr_at(offset);
                if free(addr) {
                    return Ok(addr);
                }
            }
        }
    }

    Err(AllocError::NoAddressesAvailable)
}

fn ia_pools(subnet: &Subnet6) -> impl Iterator<Item = &crate::config::Pool> {
    subnet.pools.iter().filter(|pool| pool.kind == PoolKind::Ia)
}

fn addr_at(subnet: &Subnet6, mut idx: u128) -> Ipv6Addr {
    for pool in ia_pools(subnet) {
        if idx < pool.capacity() {
            return pool.addr_at(idx);
        }
        idx -= pool.capacity();
    }
    unreachable!("index beyond aggregate pool capacity");
}

fn client_hash(duid: &Duid, iaid: u32, attempt: u32) -> u128 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    duid.bytes.hash(&mut hasher);
    iaid.hash(&mut hasher);
    attempt.hash(&mut hasher);
    u128::from(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Pool, PoolKind};
    use crate::leasedb::MemfileLeaseDb;
    use std::sync::Arc;

    fn test_subnet() -> Arc<Subnet6> {
        let mut subnet = Subnet6::new(
            "2001:db8:1::/48".parse().unwrap(),
            1000,
            2000,
            3000,
            4000,
        );
        subnet
            .add_pool(Pool::from_prefix(
                PoolKind::Ia,
                "2001:db8:1:1::/64".parse().unwrap(),
            ))
            .unwrap();
        let mut config = Config::new();
        config.add_subnet(subnet)
    }

    fn duid(byte: u8) -> Duid {
        Duid::from(vec![byte; 10])
    }

    #[test]
    fn hint_is_honored_and_persisted() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();
        let hint: Ipv6Addr = "2001:db8:1:1::dead:beef".parse().unwrap();

        let lease = allocate(&db, &subnet, &duid(1), 234, Some(hint), true).unwrap();
        assert_eq!(lease.addr, hint);
        assert_eq!(lease.t1, 1000);
        assert_eq!(lease.t2, 2000);
        assert_eq!(lease.preferred_lifetime, 3000);
        assert_eq!(lease.valid_lifetime, 4000);
        assert_eq!(db.get_by_address(hint).unwrap().iaid, 234);
    }

    #[test]
    fn uncommitted_allocation_leaves_no_record() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();
        let hint: Ipv6Addr = "2001:db8:1:1::dead:beef".parse().unwrap();

        let lease = allocate(&db, &subnet, &duid(1), 234, Some(hint), false).unwrap();
        assert_eq!(lease.addr, hint);
        assert!(db.is_empty());
    }

    #[test]
    fn out_of_pool_hint_falls_back_to_pool_pick() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();
        // inside the subnet, outside the pool
        let hint: Ipv6Addr = "2001:db8:1::cafe:babe".parse().unwrap();

        let lease = allocate(&db, &subnet, &duid(1), 234, Some(hint), true).unwrap();
        assert_ne!(lease.addr, hint);
        assert!(subnet.in_pool(lease.addr));
    }

    #[test]
    fn distinct_clients_get_distinct_addresses() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();

        let a = allocate(&db, &subnet, &duid(1), 1, None, true).unwrap();
        let b = allocate(&db, &subnet, &duid(2), 2, None, true).unwrap();
        let c = allocate(&db, &subnet, &duid(3), 3, None, true).unwrap();

        assert!(subnet.in_pool(a.addr));
        assert!(subnet.in_pool(b.addr));
        assert!(subnet.in_pool(c.addr));
        assert_ne!(a.addr, b.addr);
        assert_ne!(b.addr, c.addr);
        assert_ne!(a.addr, c.addr);
    }

    #[test]
    fn repeat_request_returns_the_existing_binding() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();

        let first = allocate(&db, &subnet, &duid(1), 234, None, true).unwrap();
        let second = allocate(&db, &subnet, &duid(1), 234, None, true).unwrap();
        assert_eq!(first.addr, second.addr);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn tiny_pool_exhausts_cleanly() {
        let db = MemfileLeaseDb::new();
        let mut subnet = Subnet6::new(
            "2001:db8:1::/48".parse().unwrap(),
            1000,
            2000,
            3000,
            4000,
        );
        subnet
            .add_pool(
                Pool::new(
                    PoolKind::Ia,
                    "2001:db8:1::10".parse().unwrap(),
                    "2001:db8:1::11".parse().unwrap(),
                )
                .unwrap(),
            )
            .unwrap();
        let mut config = Config::new();
        let subnet = config.add_subnet(subnet);

        allocate(&db, &subnet, &duid(1), 1, None, true).unwrap();
        allocate(&db, &subnet, &duid(2), 2, None, true).unwrap();
        assert_eq!(
            allocate(&db, &subnet, &duid(3), 3, None, true),
            Err(AllocError::NoAddressesAvailable)
        );
    }

    #[test]
    fn ta_pools_are_not_used_for_address_allocation() {
        let db = MemfileLeaseDb::new();
        let mut subnet = Subnet6::new(
            "2001:db8:1::/48".parse().unwrap(),
            1000,
            2000,
            3000,
            4000,
        );
        subnet
            .add_pool(Pool::from_prefix(
                PoolKind::Ta,
                "2001:db8:1:2::/64".parse().unwrap(),
            ))
            .unwrap();
        let mut config = Config::new();
        let subnet = config.add_subnet(subnet);

        assert_eq!(
            allocate(&db, &subnet, &duid(1), 1, None, true),
            Err(AllocError::NoAddressesAvailable)
        );
    }

    #[test]
    fn renew_refreshes_timers_from_subnet() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();
        let addr: Ipv6Addr = "2001:db8:1:1::cafe:babe".parse().unwrap();

        let mut stale = build_lease(&subnet, &duid(1), 234, addr);
        stale.preferred_lifetime = 501;
        stale.valid_lifetime = 502;
        stale.t1 = 503;
        stale.t2 = 504;
        stale.cltt = 123;
        db.add(stale).unwrap();

        let renewed = renew(&db, &subnet, &duid(1), 234, Some(addr)).unwrap();
        assert_eq!(renewed.addr, addr);
        assert_eq!(renewed.t1, 1000);
        assert_eq!(renewed.t2, 2000);
        assert_eq!(renewed.preferred_lifetime, 3000);
        assert_eq!(renewed.valid_lifetime, 4000);
        assert!(renewed.cltt > 123);
        assert_eq!(db.get_by_address(addr).unwrap(), renewed);
    }

    #[test]
    fn renew_without_binding_fails() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();
        assert_eq!(
            renew(&db, &subnet, &duid(1), 234, None),
            Err(AllocError::NoBinding)
        );
    }

    #[test]
    fn renew_with_wrong_address_returns_the_stored_one() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();
        let stored: Ipv6Addr = "2001:db8:1:1::1".parse().unwrap();
        db.add(build_lease(&subnet, &duid(1), 234, stored)).unwrap();

        let requested: Ipv6Addr = "2001:db8:1:1::2".parse().unwrap();
        let renewed = renew(&db, &subnet, &duid(1), 234, Some(requested)).unwrap();
        assert_eq!(renewed.addr, stored);
        assert!(db.get_by_address(requested).is_none());
    }

    #[test]
    fn release_requires_matching_client() {
        let db = MemfileLeaseDb::new();
        let subnet = test_subnet();
        let addr: Ipv6Addr = "2001:db8:1:1::1".parse().unwrap();
        db.add(build_lease(&subnet, &duid(1), 234, addr)).unwrap();

        // wrong DUID
        assert_eq!(release(&db, &duid(2), 234, addr), Err(AllocError::NoBinding));
        // wrong IAID
        assert_eq!(release(&db, &duid(1), 456, addr), Err(AllocError::NoBinding));
        assert!(db.get_by_address(addr).is_some());

        release(&db, &duid(1), 234, addr).unwrap();
        assert!(db.get_by_address(addr).is_none());

        // releasing again finds nothing
        assert_eq!(release(&db, &duid(1), 234, addr), Err(AllocError::NoBinding));
    }
}
