//! §4.6 IP generation: the only IP allocator in the system — the engine is
//! never allowed to choose an address itself.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::{IpNetwork, Ipv4Network};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpAllocatorError {
    #[error("subnet is not a valid IPv4 network")]
    InvalidSubnet,
    #[error("no free address left in subnet")]
    Exhausted,
}

/// Enumerates candidates starting at `network_base + 2`, skipping `gateway`
/// and every address in `taken`, stopping before the broadcast address.
pub fn allocate_ip(
    subnet: IpNetwork,
    gateway: IpAddr,
    taken: &[IpAddr],
) -> Result<IpAddr, IpAllocatorError> {
    let IpNetwork::V4(subnet) = subnet else {
        return Err(IpAllocatorError::InvalidSubnet);
    };
    let network: Ipv4Network = subnet;

    let base = u32::from(network.network());
    let broadcast = u32::from(network.broadcast());

    let mut candidate = base.wrapping_add(2);
    while candidate < broadcast {
        let addr = IpAddr::V4(Ipv4Addr::from(candidate));
        if addr != gateway && !taken.contains(&addr) {
            return Ok(addr);
        }
        candidate += 1;
    }

    Err(IpAllocatorError::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> IpNetwork {
        "172.21.0.0/16".parse().unwrap()
    }

    fn gw() -> IpAddr {
        "172.21.0.1".parse().unwrap()
    }

    #[test]
    fn allocates_first_candidate_after_base_and_gateway() {
        let ip = allocate_ip(net(), gw(), &[]).unwrap();
        assert_eq!(ip, "172.21.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn skips_gateway_and_taken_addresses() {
        let taken = vec!["172.21.0.2".parse().unwrap(), "172.21.0.3".parse().unwrap()];
        let ip = allocate_ip(net(), gw(), &taken).unwrap();
        assert_eq!(ip, "172.21.0.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn fails_when_subnet_is_exhausted() {
        let small: IpNetwork = "172.21.0.0/30".parse().unwrap();
        let gateway: IpAddr = "172.21.0.1".parse().unwrap();
        let taken = vec!["172.21.0.2".parse().unwrap()];
        assert_eq!(
            allocate_ip(small, gateway, &taken),
            Err(IpAllocatorError::Exhausted)
        );
    }
}
