use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{ConcentratorError, Result};

/// An IPv4 network in `address/prefix` form. Thin wrapper over `ipnet::Ipv4Net`
/// so the rest of the crate only has to know about the handful of operations
/// the data plane actually needs.
#[derive(Debug, Clone, Copy)]
pub struct Cidr {
    net: Ipv4Net,
}

impl Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        let net = Ipv4Net::new(addr, prefix_len)
            .map_err(|e| ConcentratorError::Config(format!("invalid CIDR: {e}")))?
            .trunc();
        Ok(Self { net })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.net.network()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.net.broadcast()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.net.contains(&ip)
    }

    /// Iterate host addresses, excluding the network and broadcast addresses.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        self.net.hosts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_network_and_broadcast() {
        let cidr = Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 30).unwrap();
        let hosts: Vec<_> = cidr.hosts().collect();
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
        assert!(!hosts.contains(&cidr.network()));
        assert!(!hosts.contains(&cidr.broadcast()));
    }

    #[test]
    fn contains_respects_prefix() {
        let cidr = Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 8).unwrap();
        assert!(cidr.contains(Ipv4Addr::new(10, 255, 0, 1)));
        assert!(!cidr.contains(Ipv4Addr::new(11, 0, 0, 1)));
    }

    #[test]
    fn truncates_to_network_address() {
        let cidr = Cidr::new(Ipv4Addr::new(10, 0, 0, 5), 24).unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(10, 0, 0, 0));
    }
}
