//! Host resolution cache.
//!
//! Chromium mapping: net/dns/host_cache.h (simplified in-memory version)
//!
//! Provides:
//! - Entries keyed by (hostname, query type, flags, source, secure)
//! - Positive and negative entries with a TTL
//! - Stale lookups reporting how far past expiry an entry is and how many
//!   network changes it has survived
//! - Thread-safe concurrent access

use crate::base::neterror::NetError;
use crate::dns::resolve::{
    AddressList, DnsQueryType, HostPortPair, HostResolverFlags, HostResolverSource,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Cache key components.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HostCacheKey {
    /// Lowercased hostname
    pub hostname: String,
    pub query_type: DnsQueryType,
    pub flags: HostResolverFlags,
    pub source: HostResolverSource,
    /// Whether the answer came over a secure transport
    pub secure: bool,
}

impl HostCacheKey {
    pub fn new(
        hostname: &str,
        query_type: DnsQueryType,
        flags: HostResolverFlags,
        source: HostResolverSource,
    ) -> Self {
        Self {
            hostname: hostname.to_ascii_lowercase(),
            query_type,
            flags,
            source,
            secure: false,
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

/// Where an entry's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntrySource {
    #[default]
    Unknown,
    Dns,
    System,
    Hosts,
    MulticastDns,
}

/// The result payload, one variant per kind of answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryResults {
    Addresses(AddressList),
    Text(Vec<String>),
    Hostnames(Vec<HostPortPair>),
}

/// Cached (or freshly produced) resolution outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCacheEntry {
    result: Result<EntryResults, NetError>,
    source: EntrySource,
    /// Time-to-live; `None` means "do not cache"
    ttl: Option<Duration>,
}

impl HostCacheEntry {
    pub fn new(results: EntryResults, source: EntrySource, ttl: Option<Duration>) -> Self {
        Self { result: Ok(results), source, ttl }
    }

    pub fn from_error(error: NetError, source: EntrySource, ttl: Option<Duration>) -> Self {
        Self { result: Err(error), source, ttl }
    }

    pub fn result(&self) -> &Result<EntryResults, NetError> {
        &self.result
    }

    pub fn error(&self) -> Option<NetError> {
        self.result.as_ref().err().copied()
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn addresses(&self) -> Option<&AddressList> {
        match &self.result {
            Ok(EntryResults::Addresses(list)) => Some(list),
            _ => None,
        }
    }

    pub fn text_records(&self) -> Option<&[String]> {
        match &self.result {
            Ok(EntryResults::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn hostnames(&self) -> Option<&[HostPortPair]> {
        match &self.result {
            Ok(EntryResults::Hostnames(hosts)) => Some(hosts),
            _ => None,
        }
    }

    pub fn source(&self) -> EntrySource {
        self.source
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Copy with every address rewritten onto `port`.
    pub fn with_port(&self, port: u16) -> Self {
        let result = match &self.result {
            Ok(EntryResults::Addresses(list)) => Ok(EntryResults::Addresses(list.with_port(port))),
            other => other.clone(),
        };
        Self { result, source: self.source, ttl: self.ttl }
    }
}

/// How stale a returned entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryStaleness {
    /// How long past expiry, `None` if not yet expired
    pub expired_by: Option<Duration>,
    /// Network changes since the entry was written
    pub network_changes: u32,
    /// Times this entry has been served stale, including this one
    pub stale_hits: u32,
}

impl EntryStaleness {
    pub fn is_stale(&self) -> bool {
        self.expired_by.is_some() || self.network_changes > 0
    }
}

struct StoredEntry {
    entry: HostCacheEntry,
    expires: Instant,
    network_changes: u32,
    stale_hits: u32,
}

/// In-memory host cache.
///
/// Thread-safe implementation using DashMap for concurrent access.
/// Evicts expired entries first, then the entry closest to expiry.
pub struct HostCache {
    entries: DashMap<HostCacheKey, StoredEntry>,
    max_entries: usize,
    network_changes: AtomicU32,
}

impl Default for HostCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl HostCache {
    /// A `max_entries` of 0 disables caching.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            network_changes: AtomicU32::new(0),
        }
    }

    /// Fresh lookup: unexpired and written since the last network change.
    pub fn lookup(&self, key: &HostCacheKey, now: Instant) -> Option<HostCacheEntry> {
        let stored = self.entries.get(key)?;
        let generation = self.network_changes.load(Ordering::Acquire);
        if stored.expires <= now || stored.network_changes != generation {
            return None;
        }
        Some(stored.entry.clone())
    }

    /// Lookup that also returns expired or pre-network-change entries.
    pub fn lookup_stale(
        &self,
        key: &HostCacheKey,
        now: Instant,
    ) -> Option<(HostCacheEntry, EntryStaleness)> {
        let mut stored = self.entries.get_mut(key)?;
        let generation = self.network_changes.load(Ordering::Acquire);
        let mut staleness = EntryStaleness {
            expired_by: (stored.expires <= now).then(|| now.duration_since(stored.expires)),
            network_changes: generation.saturating_sub(stored.network_changes),
            stale_hits: stored.stale_hits,
        };
        if staleness.is_stale() {
            stored.stale_hits += 1;
            staleness.stale_hits = stored.stale_hits;
        }
        Some((stored.entry.clone(), staleness))
    }

    /// Store `entry` for `ttl`. Zero TTLs and a disabled cache are no-ops.
    pub fn set(&self, key: HostCacheKey, entry: HostCacheEntry, now: Instant, ttl: Duration) {
        if self.max_entries == 0 || ttl.is_zero() {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_one(now);
        }
        tracing::trace!(
            host = %key.hostname,
            query_type = ?key.query_type,
            ttl_secs = ttl.as_secs(),
            "host cache set"
        );
        self.entries.insert(
            key,
            StoredEntry {
                entry,
                expires: now + ttl,
                network_changes: self.network_changes.load(Ordering::Acquire),
                stale_hits: 0,
            },
        );
    }

    /// Marks every current entry stale.
    pub fn on_network_change(&self) {
        self.network_changes.fetch_add(1, Ordering::AcqRel);
    }

    pub fn network_changes(&self) -> u32 {
        self.network_changes.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn evict_one(&self, now: Instant) {
        let generation = self.network_changes.load(Ordering::Acquire);
        let victim = self
            .entries
            .iter()
            .find(|e| e.expires <= now || e.network_changes != generation)
            .map(|e| e.key().clone())
            .or_else(|| self.entries.iter().min_by_key(|e| e.expires).map(|e| e.key().clone()));
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}
