//! Core host resolution types and traits.
//!
//! This module defines the value types shared by every layer of the
//! resolver (query types, sources, flags, request parameters, address
//! lists) and the `HostResolverProc` trait used for system resolution.

use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::dns::config::SecureDnsMode;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    ops::BitOr,
    sync::Arc,
};

/// A hostname paired with a port.
#[derive(Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostPortPair {
    host: String,
    port: u16,
}

impl HostPortPair {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// DNS record types a request may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DnsQueryType {
    /// Both A and AAAA.
    #[default]
    Unspecified,
    A,
    Aaaa,
    Txt,
    Ptr,
    Srv,
}

impl DnsQueryType {
    pub fn is_address_type(self) -> bool {
        matches!(self, DnsQueryType::Unspecified | DnsQueryType::A | DnsQueryType::Aaaa)
    }

    pub fn address_family(self) -> AddressFamily {
        match self {
            DnsQueryType::A => AddressFamily::Ipv4,
            DnsQueryType::Aaaa => AddressFamily::Ipv6,
            _ => AddressFamily::Unspecified,
        }
    }
}

/// Address family restriction for system resolution and hosts lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    Unspecified,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Unspecified => true,
            AddressFamily::Ipv4 => ip.is_ipv4(),
            AddressFamily::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Where a request is allowed to get its answer from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HostResolverSource {
    /// Resolver picks: built-in DNS client, system resolver or mDNS.
    #[default]
    Any,
    System,
    Dns,
    MulticastDns,
    /// Cache and hosts file only, never network work.
    LocalOnly,
}

/// How a request may use the host cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheUsage {
    #[default]
    Allowed,
    Disallowed,
    StaleAllowed,
}

/// Resolver bit flags. `CANONNAME` is passed to the system resolver only;
/// the others also become part of the job and cache keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostResolverFlags(u8);

impl HostResolverFlags {
    pub const NONE: Self = Self(0);
    pub const CANONNAME: Self = Self(1 << 0);
    pub const LOOPBACK_ONLY: Self = Self(1 << 1);
    pub const DEFAULT_FAMILY_SET_DUE_TO_NO_IPV6: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for HostResolverFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for HostResolverFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostResolverFlags({:#05b})", self.0)
    }
}

/// Per-request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveHostParameters {
    pub query_type: DnsQueryType,
    pub source: HostResolverSource,
    pub initial_priority: RequestPriority,
    pub cache_usage: CacheUsage,
    pub include_canonical_name: bool,
    pub is_speculative: bool,
    pub loopback_only: bool,
    /// Overrides the secure DNS mode of the effective config for this request.
    pub secure_dns_mode_override: Option<SecureDnsMode>,
}

impl Default for ResolveHostParameters {
    fn default() -> Self {
        Self {
            query_type: DnsQueryType::Unspecified,
            source: HostResolverSource::Any,
            initial_priority: RequestPriority::default(),
            cache_usage: CacheUsage::Allowed,
            include_canonical_name: false,
            is_speculative: false,
            loopback_only: false,
            secure_dns_mode_override: None,
        }
    }
}

impl ResolveHostParameters {
    /// Flags that take part in job and cache keys. `include_canonical_name`
    /// is not one of them; it only steers which task a new job runs.
    pub(crate) fn key_flags(&self) -> HostResolverFlags {
        let mut flags = HostResolverFlags::NONE;
        if self.loopback_only {
            flags = flags | HostResolverFlags::LOOPBACK_ONLY;
        }
        flags
    }
}

/// The ICANN name-collision sentinel address.
pub const ICANN_NAME_COLLISION_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 53, 53);

/// An ordered list of resolved endpoints plus the DNS aliases seen on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressList {
    endpoints: Vec<SocketAddr>,
    dns_aliases: Vec<String>,
}

impl AddressList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ips(ips: impl IntoIterator<Item = IpAddr>, port: u16) -> Self {
        Self {
            endpoints: ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
            dns_aliases: Vec::new(),
        }
    }

    pub fn from_endpoints(endpoints: Vec<SocketAddr>) -> Self {
        Self { endpoints, dns_aliases: Vec::new() }
    }

    pub fn push(&mut self, endpoint: SocketAddr) {
        self.endpoints.push(endpoint);
    }

    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    pub fn dns_aliases(&self) -> &[String] {
        &self.dns_aliases
    }

    pub fn set_dns_aliases(&mut self, aliases: Vec<String>) {
        self.dns_aliases = aliases;
    }

    /// Canonical name, the last alias in the chain.
    pub fn canonical_name(&self) -> Option<&str> {
        self.dns_aliases.last().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Same addresses, rewritten onto `port`.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            endpoints: self.endpoints.iter().map(|ep| SocketAddr::new(ep.ip(), port)).collect(),
            dns_aliases: self.dns_aliases.clone(),
        }
    }

    /// Keep only addresses matching `family`.
    pub fn filter_by_family(mut self, family: AddressFamily) -> Self {
        self.endpoints.retain(|ep| family.matches(&ep.ip()));
        self
    }

    /// IPv6 endpoints first, stable within each family.
    pub fn sort_ipv6_first(&mut self) {
        self.endpoints.sort_by_key(|ep| ep.is_ipv4());
    }

    /// True if `127.0.53.53` appears as a plain IPv4 endpoint.
    pub fn contains_icann_name_collision(&self) -> bool {
        self.endpoints
            .iter()
            .any(|ep| matches!(ep.ip(), IpAddr::V4(v4) if v4 == ICANN_NAME_COLLISION_IP))
    }
}

/// Blocking system resolution, executed off the async runtime.
///
/// Equivalent to Chromium's `HostResolverProc`. Implementations must be
/// thread-safe: concurrent retry attempts call `resolve` in parallel.
pub trait HostResolverProc: Send + Sync {
    /// Resolves `host` to addresses with port 0.
    fn resolve(
        &self,
        host: &str,
        family: AddressFamily,
        flags: HostResolverFlags,
    ) -> Result<AddressList, NetError>;
}

impl<P: HostResolverProc + ?Sized> HostResolverProc for Arc<P> {
    fn resolve(
        &self,
        host: &str,
        family: AddressFamily,
        flags: HostResolverFlags,
    ) -> Result<AddressList, NetError> {
        (**self).resolve(host, family, flags)
    }
}
