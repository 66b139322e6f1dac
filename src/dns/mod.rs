//! Host Resolution Module
//!
//! Provides Chromium-style host resolution with support for:
//! - Request deduplication into jobs keyed by host, type, flags and source
//! - A prioritized dispatcher limiting concurrent resolutions
//! - The built-in DNS client (hickory-dns), the system resolver
//!   (getaddrinfo via thread pool) and multicast DNS
//! - Fallback between them, with automatic disabling of a failing client
//! - A host cache shared by every request
//!
//! # Architecture
//!
//! This module mirrors Chromium's `HostResolverManager`. A
//! [`HostResolverManager`] hands out [`ResolveHostRequest`]s; started
//! requests are served locally (IP literals, localhost, cache, hosts) or
//! attached to a job. Each job runs an ordered sequence of tasks:
//! [`ProcTask`] for the system resolver, a DNS task over a
//! [`DnsTransactionFactory`] and an mDNS task over an [`MdnsClient`].
//!
//! # Example
//!
//! ```rust,ignore
//! use chromedns::dns::{HostPortPair, HostResolverManager, ResolveHostParameters};
//!
//! let manager = HostResolverManager::new();
//! let host = HostPortPair::new("example.com", 443);
//! let mut request = manager.create_request(host, ResolveHostParameters::default());
//! request.resolve().await?;
//! for endpoint in request.address_results().unwrap().endpoints() {
//!     println!("Resolved: {}", endpoint);
//! }
//! ```

mod client;
mod config;
mod dispatcher;
mod dns_task;
mod gai;
mod hickory;
mod hostcache;
mod job;
mod manager;
mod mdns;
pub mod mock;
mod notifier;
mod proc_task;
mod request;
mod resolve;
mod transaction;

pub use client::{DnsClient, MAX_INSECURE_FALLBACK_FAILURES};
pub use config::{DnsConfig, DnsConfigOverrides, DnsHosts, DohServerConfig, SecureDnsMode};
pub use dispatcher::{Admission, Limits, PrioritizedDispatcher, QueueHandle};
pub use gai::SystemHostResolverProc;
pub use hickory::HickoryTransactionFactory;
pub use hostcache::{
    EntryResults, EntrySource, EntryStaleness, HostCache, HostCacheEntry, HostCacheKey,
};
pub use manager::{
    HostResolverManager, HostResolverManagerBuilder, ManagerOptions,
    DEFAULT_MAX_CONCURRENT_RESOLVES, MAX_HOSTNAME_LENGTH,
};
pub use mdns::{
    MdnsClient, MdnsListener, MdnsListenerDelegate, MdnsTransport, MdnsUpdateType,
    MDNS_GOODBYE_DELAY, MDNS_TRANSACTION_TIMEOUT,
};
pub use notifier::{NetworkChangeNotifier, NetworkChangeObserver};
pub use proc_task::{
    ProcTask, ProcTaskParams, ProcTaskState, DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_RETRY_FACTOR,
    DEFAULT_UNRESPONSIVE_DELAY,
};
pub use request::{CompletionCallback, ResolveHostRequest, StartOutcome};
pub use resolve::{
    AddressFamily, AddressList, CacheUsage, DnsQueryType, HostPortPair, HostResolverFlags,
    HostResolverProc, HostResolverSource, ResolveHostParameters, ICANN_NAME_COLLISION_IP,
};
pub use transaction::{
    BoundTransactionFactory, DnsRecord, DnsRecordType, DnsResponse, DnsSession, DnsTransaction,
    DnsTransactionFactory, RecordData, ResponseCode,
};
