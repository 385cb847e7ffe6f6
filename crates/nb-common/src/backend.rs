//! Capability traits a netboot backend exposes to the DHCP and TFTP layers.

use std::net::Ipv4Addr;

use crate::error::BackendResult;
use crate::types::{Dhcp, Netboot};

/// Read side: resolve a client by hardware or protocol address.
#[async_trait::async_trait]
pub trait BackendReader: Send + Sync {
    async fn get_by_mac(&self, mac: &str) -> BackendResult<(Dhcp, Netboot)>;

    async fn get_by_ip(&self, ip: Ipv4Addr) -> BackendResult<(Dhcp, Netboot)>;

    /// MACs of every active lease.
    async fn get_keys(&self) -> BackendResult<Vec<String>>;
}

/// Write side: persist lease and netboot state for a MAC.
#[async_trait::async_trait]
pub trait BackendWriter: Send + Sync {
    async fn put(
        &self,
        mac: &str,
        dhcp: Option<&Dhcp>,
        netboot: Option<&Netboot>,
    ) -> BackendResult<()>;
}

/// Force the in-memory view back in line with persistent state.
#[async_trait::async_trait]
pub trait BackendSyncer: Send + Sync {
    async fn sync(&self) -> BackendResult<()>;
}
