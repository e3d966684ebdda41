use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use parking_lot::Mutex;
use tracing::warn;

use crate::cidr::Cidr;

/// Allocates and recycles IPv4 host addresses within a configured CIDR.
///
/// Never yields the network address, the broadcast address, or any address
/// outside the CIDR. Yields each free address at most once until returned.
/// `acquire` fails cleanly (returns `None`) when the pool is exhausted; it
/// never blocks.
pub struct AddressPool {
    cidr: Cidr,
    free: Mutex<BTreeSet<Ipv4Addr>>,
}

impl AddressPool {
    /// `initial_capacity` is a sizing hint only; it is never validated
    /// against the CIDR.
    pub fn new(cidr: Cidr, initial_capacity: usize) -> Self {
        let mut free = BTreeSet::new();
        for host in cidr.hosts() {
            free.insert(host);
        }
        let _ = initial_capacity;
        Self {
            cidr,
            free: Mutex::new(free),
        }
    }

    /// Returns the numerically smallest free host address, or `None` if the
    /// pool is exhausted.
    pub fn acquire(&self) -> Option<Ipv4Addr> {
        let mut free = self.free.lock();
        let smallest = *free.iter().next()?;
        free.remove(&smallest);
        Some(smallest)
    }

    /// Returns `ip` to the free set. Releasing an address that is not
    /// currently allocated, or that falls outside the CIDR, is a no-op
    /// logged as a defect rather than a panic.
    pub fn release(&self, ip: Ipv4Addr) {
        if !self.cidr.contains(ip) || ip == self.cidr.network() || ip == self.cidr.broadcast() {
            warn!(%ip, "release of address outside pool's CIDR ignored");
            return;
        }
        let mut free = self.free.lock();
        if !free.insert(ip) {
            warn!(%ip, "release of address that was already free (double release)");
        }
    }

    pub fn cidr(&self) -> Cidr {
        self.cidr
    }

    /// Number of addresses currently free (not held by any caller).
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Release(usize),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![Just(Op::Acquire), (0usize..64).prop_map(Op::Release)],
            0..200,
        )
    }

    proptest! {
        /// Address conservation: the pool never yields network/broadcast/out-of-range
        /// addresses, and every yielded address is released at most once before re-use.
        #[test]
        fn address_conservation(ops in ops()) {
            let cidr = Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap();
            let pool = AddressPool::new(cidr, 0);
            let mut held: Vec<Ipv4Addr> = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire => {
                        if let Some(ip) = pool.acquire() {
                            prop_assert!(cidr.contains(ip));
                            prop_assert_ne!(ip, cidr.network());
                            prop_assert_ne!(ip, cidr.broadcast());
                            prop_assert!(!held.contains(&ip));
                            held.push(ip);
                        }
                    }
                    Op::Release(idx) => {
                        if !held.is_empty() {
                            let ip = held.remove(idx % held.len());
                            pool.release(ip);
                        }
                    }
                }
            }
        }
    }
}
