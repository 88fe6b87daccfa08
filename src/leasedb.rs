use std::{error, fmt, net::Ipv6Addr};

use dashmap::DashMap;

use crate::duid::Duid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseType {
    Na,
    Ta,
}

/// One address binding. The address is the primary key; (DUID, IAID,
/// subnet-id) is the secondary key renews are looked up by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub addr: Ipv6Addr,
    pub duid: Duid,
    pub iaid: u32,
    pub subnet_id: u32,
    pub lease_type: LeaseType,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub t1: u32,
    pub t2: u32,
    /// Client-last-transaction-time, seconds since the Unix epoch.
    pub cltt: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDbError {
    DuplicateKey(Ipv6Addr),
    NoSuchLease(Ipv6Addr),
}

impl fmt::Display for LeaseDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseDbError::DuplicateKey(addr) => write!(f, "{addr} is already leased"),
            LeaseDbError::NoSuchLease(addr) => write!(f, "no lease for {addr}"),
        }
    }
}

impl error::Error for LeaseDbError {}

/// Backend-neutral lease operations. All backends behave identically for
/// these under single-writer access; the in-process maps additionally
/// tolerate concurrent readers.
pub trait LeaseStore: Send + Sync {
    /// Insert a new lease; the address must be free.
    fn add(&self, lease: Lease) -> Result<(), LeaseDbError>;

    fn get_by_address(&self, addr: Ipv6Addr) -> Option<Lease>;

    fn get_by_client(&self, duid: &Duid, iaid: u32, subnet_id: u32) -> Option<Lease>;

    /// Replace an existing lease, keyed by address.
    fn update(&self, lease: Lease) -> Result<(), LeaseDbError>;

    /// Remove a lease; true iff a record was removed.
    fn delete(&self, addr: Ipv6Addr) -> bool;
}

type ClientKey = (Duid, u32, u32);

/// The in-memory backend. Two maps: addresses to leases, and the client
/// secondary key to the leased address. Every mutation keeps them in step.
#[derive(Default)]
pub struct MemfileLeaseDb {
    by_addr: DashMap<Ipv6Addr, Lease>,
    by_client: DashMap<ClientKey, Ipv6Addr>,
}

impl MemfileLeaseDb {
    pub fn new() -> Self {
        Self {
            by_addr: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    fn client_key(lease: &Lease) -> ClientKey {
        (lease.duid.clone(), lease.iaid, lease.subnet_id)
    }
}

impl LeaseStore for MemfileLeaseDb {
    fn add(&self, lease: Lease) -> Result<(), LeaseDbError> {
        if self.by_addr.contains_key(&lease.addr) {
            return Err(LeaseDbError::DuplicateKey(lease.addr));
        }
        self.by_client.insert(Self::client_key(&lease), lease.addr);
        self.by_addr.insert(lease.addr, lease);
        Ok(())
    }

    fn get_by_address(&self, addr: Ipv6Addr) -> Option<Lease> {
        self.by_addr.get(&addr).map(|entry| entry.value().clone())
    }

    fn get_by_client(&self, duid: &Duid, iaid: u32, subnet_id: u32) -> Option<Lease> {
        let addr = self
            .by_client
            .get(&(duid.clone(), iaid, subnet_id))
            .map(|entry| *entry.value())?;
        self.get_by_address(addr)
    }

    fn update(&self, lease: Lease) -> Result<(), LeaseDbError> {
        let Some(previous) = self.get_by_address(lease.addr) else {
            return Err(LeaseDbError::NoSuchLease(lease.addr));
        };
        if Self::client_key(&previous) != Self::client_key(&lease) {
            self.by_client.remove(&Self::client_key(&previous));
        }
        self.by_client.insert(Self::client_key(&lease), lease.addr);
        self.by_addr.insert(lease.addr, lease);
        Ok(())
    }

    fn delete(&self, addr: Ipv6Addr) -> bool {
        match self.by_addr.remove(&addr) {
            Some((_, lease)) => {
                self.by_client.remove(&Self::client_key(&lease));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(addr: &str, duid: &[u8], iaid: u32) -> Lease {
        Lease {
            addr: addr.parse().unwrap(),
            duid: Duid::from(duid.to_vec()),
            iaid,
            subnet_id: 1,
            lease_type: LeaseType::Na,
            preferred_lifetime: 3000,
            valid_lifetime: 4000,
            t1: 1000,
            t2: 2000,
            cltt: 12345,
        }
    }

    #[test]
    fn add_rejects_duplicate_address() {
        let db = MemfileLeaseDb::new();
        db.add(lease("2001:db8::1", &[1, 2, 3], 1)).unwrap();
        assert_eq!(
            db.add(lease("2001:db8::1", &[9, 9, 9], 2)),
            Err(LeaseDbError::DuplicateKey("2001:db8::1".parse().unwrap()))
        );
        // the original binding is untouched
        let stored = db.get_by_address("2001:db8::1".parse().unwrap()).unwrap();
        assert_eq!(stored.duid, Duid::from(vec![1, 2, 3]));
    }

    #[test]
    fn secondary_key_finds_the_lease() {
        let db = MemfileLeaseDb::new();
        db.add(lease("2001:db8::1", &[1, 2, 3], 234)).unwrap();

        let duid = Duid::from(vec![1, 2, 3]);
        let found = db.get_by_client(&duid, 234, 1).unwrap();
        assert_eq!(found.addr, "2001:db8::1".parse::<Ipv6Addr>().unwrap());

        assert!(db.get_by_client(&duid, 456, 1).is_none());
        assert!(db.get_by_client(&duid, 234, 2).is_none());
        assert!(db.get_by_client(&Duid::from(vec![9]), 234, 1).is_none());
    }

    #[test]
    fn update_requires_existing_record() {
        let db = MemfileLeaseDb::new();
        assert_eq!(
            db.update(lease("2001:db8::1", &[1], 1)),
            Err(LeaseDbError::NoSuchLease("2001:db8::1".parse().unwrap()))
        );

        db.add(lease("2001:db8::1", &[1], 1)).unwrap();
        let mut updated = lease("2001:db8::1", &[1], 1);
        updated.cltt = 99999;
        db.update(updated).unwrap();
        assert_eq!(
            db.get_by_address("2001:db8::1".parse().unwrap()).unwrap().cltt,
            99999
        );
    }

    #[test]
    fn delete_cleans_both_indexes() {
        let db = MemfileLeaseDb::new();
        db.add(lease("2001:db8::1", &[1, 2, 3], 234)).unwrap();

        assert!(db.delete("2001:db8::1".parse().unwrap()));
        assert!(!db.delete("2001:db8::1".parse().unwrap()));
        assert!(db
            .get_by_client(&Duid::from(vec![1, 2, 3]), 234, 1)
            .is_none());
        assert!(db.is_empty());
    }
}
