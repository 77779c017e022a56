//! DHCP-recovery discovery seam.
//!
//! The actual subnet sweep is an external collaborator; the poller only
//! depends on [`SerialFinder`]: given a hardware serial and a subnet, report
//! the host the device now answers from. This module also derives the /24
//! scan subnet from the last known host when none is configured.

use async_trait::async_trait;
use std::net::Ipv4Addr;

/// A PDU located on the network during a recovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPdu {
    pub host: String,
    pub serial: String,
}

/// Locates a PDU by its hardware serial within a subnet. Returns `None`
/// when no device with that serial answered.
#[async_trait]
pub trait SerialFinder: Send + Sync {
    async fn find_by_serial(
        &self,
        serial: &str,
        subnet: &str,
        community: &str,
        port: u16,
    ) -> Option<DiscoveredPdu>;
}

/// Determine the subnet to scan for a device: the configured override wins,
/// otherwise the /24 containing the last known host. Returns `None` when
/// the host is not a parseable IPv4 address.
pub fn recovery_subnet(configured: &str, host: &str) -> Option<String> {
    if !configured.is_empty() {
        return Some(configured.to_string());
    }
    let addr: Ipv4Addr = host.parse().ok()?;
    let octets = addr.octets();
    Some(format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]))
}

// ===========================================================================
// Tests
// ===========================================================================
