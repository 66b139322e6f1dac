//! DNS configuration values.
//!
//! Chromium mapping: net/dns/dns_config.h, net/dns/dns_config_overrides.h
//!
//! [`DnsConfig`] is the immutable description of how the built-in client
//! should talk to nameservers. [`DnsConfigOverrides`] carries the same
//! fields as options and is merged field-by-field over the config read
//! from the system.

use crate::dns::resolve::AddressFamily;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// How secure (DoH) transactions are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecureDnsMode {
    /// Never use DoH.
    #[default]
    Off,
    /// Use DoH servers known to be reachable, fall back to insecure and system.
    Automatic,
    /// Only DoH. No insecure transactions, no system resolver.
    Secure,
}

/// One DoH server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DohServerConfig {
    pub server_template: String,
    #[serde(default)]
    pub use_post: bool,
}

impl DohServerConfig {
    pub fn new(server_template: impl Into<String>, use_post: bool) -> Self {
        Self { server_template: server_template.into(), use_post }
    }
}

/// Parsed hosts file: lowercase hostname to addresses of either family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DnsHosts(HashMap<String, Vec<IpAddr>>);

impl DnsHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hostname: &str, ip: IpAddr) {
        let entry = self.0.entry(hostname.to_ascii_lowercase()).or_default();
        if !entry.contains(&ip) {
            entry.push(ip);
        }
    }

    /// Addresses for `hostname` matching `family`, IPv6 first.
    pub fn lookup(&self, hostname: &str, family: AddressFamily) -> Vec<IpAddr> {
        let Some(ips) = self.0.get(&hostname.to_ascii_lowercase()) else {
            return Vec::new();
        };
        let mut matched: Vec<IpAddr> =
            ips.iter().copied().filter(|ip| family.matches(ip)).collect();
        matched.sort_by_key(|ip| ip.is_ipv4());
        matched
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<S: AsRef<str>> FromIterator<(S, IpAddr)> for DnsHosts {
    fn from_iter<I: IntoIterator<Item = (S, IpAddr)>>(iter: I) -> Self {
        let mut hosts = DnsHosts::new();
        for (name, ip) in iter {
            hosts.insert(name.as_ref(), ip);
        }
        hosts
    }
}

/// Effective configuration of the built-in DNS client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub nameservers: Vec<SocketAddr>,
    pub search: Vec<String>,
    pub hosts: DnsHosts,
    pub ndots: u32,
    pub timeout: Duration,
    pub attempts: u32,
    pub rotate: bool,
    pub use_local_ipv6: bool,
    pub dns_over_https_servers: Vec<DohServerConfig>,
    pub secure_dns_mode: SecureDnsMode,
    /// A setting was present that the client cannot honor; only the system
    /// resolver may be used.
    pub unhandled_options: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            search: Vec::new(),
            hosts: DnsHosts::new(),
            ndots: 1,
            timeout: Duration::from_secs(1),
            attempts: 2,
            rotate: false,
            use_local_ipv6: false,
            dns_over_https_servers: Vec::new(),
            secure_dns_mode: SecureDnsMode::Off,
            unhandled_options: false,
        }
    }
}

impl DnsConfig {
    pub fn new(nameservers: Vec<SocketAddr>) -> Self {
        Self { nameservers, ..Default::default() }
    }

    /// Usable for transactions: at least one nameserver, or DoH-only.
    pub fn is_valid(&self) -> bool {
        !self.nameservers.is_empty() || !self.dns_over_https_servers.is_empty()
    }
}

/// Optional replacements for every [`DnsConfig`] field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfigOverrides {
    pub nameservers: Option<Vec<SocketAddr>>,
    pub search: Option<Vec<String>>,
    pub hosts: Option<DnsHosts>,
    pub ndots: Option<u32>,
    pub timeout: Option<Duration>,
    pub attempts: Option<u32>,
    pub rotate: Option<bool>,
    pub use_local_ipv6: Option<bool>,
    pub dns_over_https_servers: Option<Vec<DohServerConfig>>,
    pub secure_dns_mode: Option<SecureDnsMode>,
    pub unhandled_options: Option<bool>,
}

impl DnsConfigOverrides {
    /// Overrides with every field set to the [`DnsConfig`] default.
    pub fn create_overriding_everything_with_defaults() -> Self {
        let defaults = DnsConfig::default();
        Self {
            nameservers: Some(defaults.nameservers),
            search: Some(defaults.search),
            hosts: Some(defaults.hosts),
            ndots: Some(defaults.ndots),
            timeout: Some(defaults.timeout),
            attempts: Some(defaults.attempts),
            rotate: Some(defaults.rotate),
            use_local_ipv6: Some(defaults.use_local_ipv6),
            dns_over_https_servers: Some(defaults.dns_over_https_servers),
            secure_dns_mode: Some(defaults.secure_dns_mode),
            unhandled_options: Some(defaults.unhandled_options),
        }
    }

    /// True when every field is set, making the system config irrelevant.
    pub fn overrides_everything(&self) -> bool {
        self.nameservers.is_some()
            && self.search.is_some()
            && self.hosts.is_some()
            && self.ndots.is_some()
            && self.timeout.is_some()
            && self.attempts.is_some()
            && self.rotate.is_some()
            && self.use_local_ipv6.is_some()
            && self.dns_over_https_servers.is_some()
            && self.secure_dns_mode.is_some()
            && self.unhandled_options.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge over `base`. Set fields replace, unset fields pass through.
    pub fn apply_overrides(&self, base: &DnsConfig) -> DnsConfig {
        let mut config = base.clone();
        if let Some(nameservers) = &self.nameservers {
            config.nameservers = nameservers.clone();
        }
        if let Some(search) = &self.search {
            config.search = search.clone();
        }
        if let Some(hosts) = &self.hosts {
            config.hosts = hosts.clone();
        }
        if let Some(ndots) = self.ndots {
            config.ndots = ndots;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(attempts) = self.attempts {
            config.attempts = attempts;
        }
        if let Some(rotate) = self.rotate {
            config.rotate = rotate;
        }
        if let Some(use_local_ipv6) = self.use_local_ipv6 {
            config.use_local_ipv6 = use_local_ipv6;
        }
        if let Some(servers) = &self.dns_over_https_servers {
            config.dns_over_https_servers = servers.clone();
        }
        if let Some(mode) = self.secure_dns_mode {
            config.secure_dns_mode = mode;
        }
        if let Some(unhandled) = self.unhandled_options {
            config.unhandled_options = unhandled;
        }
        config
    }
}
