//! Virtual interface configuration

use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::{DEFAULT_MTU, MAX_PACKET_SIZE};

/// Smallest MTU that can carry IPv4 traffic
const MIN_MTU_V4: usize = 576;

/// Smallest MTU that can carry IPv6 traffic
const MIN_MTU_V6: usize = 1280;

/// Configuration for a [`VirtualInterface`](crate::VirtualInterface)
#[derive(Debug, Clone)]
pub struct IfaceConfig {
    /// Address assigned to the interface
    pub address: IpAddr,
    /// Network prefix length (e.g. 64 for a /64)
    pub prefix_len: u8,
    /// Maximum transmission unit; one transport read carries at most
    /// this many bytes and yields one packet
    pub mtu: usize,
    /// Log every packet crossing the link (passive, traffic unchanged)
    pub sniff: bool,
}

impl IfaceConfig {
    /// Create a configuration with the default MTU and sniffing off.
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
            mtu: DEFAULT_MTU,
            sniff: false,
        }
    }

    /// Set the MTU.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Enable or disable packet sniffing.
    pub fn with_sniffing(mut self, sniff: bool) -> Self {
        self.sniff = sniff;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_unspecified() {
            return Err(Error::Config(
                "interface address must not be unspecified".into(),
            ));
        }

        let max_prefix = match self.address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if self.prefix_len > max_prefix {
            return Err(Error::Config(format!(
                "prefix length {} is invalid (max {} for this address family)",
                self.prefix_len, max_prefix
            )));
        }

        let min_mtu = match self.address {
            IpAddr::V4(_) => MIN_MTU_V4,
            IpAddr::V6(_) => MIN_MTU_V6,
        };
        if self.mtu < min_mtu {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum {})",
                self.mtu, min_mtu
            )));
        }
        if self.mtu > MAX_PACKET_SIZE {
            return Err(Error::Config(format!(
                "MTU {} is too large (maximum {})",
                self.mtu, MAX_PACKET_SIZE
            )));
        }

        Ok(())
    }
}
