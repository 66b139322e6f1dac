//! System DNS resolution using getaddrinfo.
//!
//! The proc is blocking: `ProcTask` runs each attempt on the blocking thread
//! pool, so the async runtime is never stalled by a slow resolver.
//!
//! # When to Use
//!
//! - Default resolver for `SYSTEM` tasks and fallback from the DNS client
//! - When the platform configuration (/etc/hosts, nsswitch, VPN resolvers)
//!   must be respected

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::dns::resolve::{AddressFamily, AddressList, HostResolverFlags, HostResolverProc};
use std::net::{SocketAddr, ToSocketAddrs};

/// `HostResolverProc` backed by the standard library's `ToSocketAddrs`.
///
/// Canonical names are not reported; `getaddrinfo` results reached through
/// `ToSocketAddrs` do not carry them.
#[derive(Clone, Debug, Default)]
pub struct SystemHostResolverProc;

impl SystemHostResolverProc {
    pub fn new() -> Self {
        Self
    }
}

impl HostResolverProc for SystemHostResolverProc {
    fn resolve(
        &self,
        host: &str,
        family: AddressFamily,
        flags: HostResolverFlags,
    ) -> Result<AddressList, NetError> {
        tracing::debug!(host = %host, ?family, "resolving via getaddrinfo");

        let addrs: Vec<SocketAddr> = (host, 0u16)
            .to_socket_addrs()
            .dns_context(host)?
            .filter(|addr| family.matches(&addr.ip()))
            .filter(|addr| {
                !flags.contains(HostResolverFlags::LOOPBACK_ONLY) || addr.ip().is_loopback()
            })
            .collect();

        if addrs.is_empty() {
            tracing::debug!(host = %host, "getaddrinfo returned no usable addresses");
            return Err(NetError::NameNotResolved);
        }

        tracing::debug!(host = %host, count = addrs.len(), "system resolution complete");
        Ok(AddressList::from_endpoints(addrs))
    }
}
