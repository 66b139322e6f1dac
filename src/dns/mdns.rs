//! Multicast DNS client: one-shot transactions and passive listeners.
//!
//! Chromium mapping: net/dns/mdns_client_impl.cc, net/dns/host_resolver_mdns_task.cc
//!
//! The client never touches sockets. Queries go out through an
//! [`MdnsTransport`]; whatever the network delivers is fed back in through
//! [`MdnsClient::on_records_received`]. Received records land in a record
//! cache, answer pending transactions and are reported to listeners.
//!
//! Record lifetime:
//! - a new record is ADDED, a known record with different data CHANGED
//! - a TTL 0 "goodbye" record expires after a one second grace period
//! - an NSEC record removes cached records of the types it denies
//! - expired records are REMOVED by a cleanup sweep
//!
//! # Example
//!
//! ```rust,ignore
//! let client = MdnsClient::new(Arc::new(transport));
//! let records = client.transaction("printer.local", DnsRecordType::A).await?;
//! ```

use crate::base::neterror::NetError;
use crate::dns::hostcache::EntryResults;
use crate::dns::resolve::{AddressList, DnsQueryType, HostPortPair};
use crate::dns::transaction::{
    extract_results, normalize_name, DnsRecord, DnsRecordType, DnsResponse, ExtractedResults,
    RecordData,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

/// How long a transaction waits for a network answer.
pub const MDNS_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period before a goodbye record is removed.
pub const MDNS_GOODBYE_DELAY: Duration = Duration::from_secs(1);

/// Sends mDNS queries onto the network.
pub trait MdnsTransport: Send + Sync {
    fn send_query(&self, name: &str, record_type: DnsRecordType) -> Result<(), NetError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MdnsUpdateType {
    Added,
    Changed,
    Removed,
}

/// Receives record updates for one listened-to name and type.
pub trait MdnsListenerDelegate: Send + Sync {
    fn on_address_result(
        &self,
        update: MdnsUpdateType,
        query_type: DnsQueryType,
        address: SocketAddr,
    );
    fn on_text_result(&self, update: MdnsUpdateType, query_type: DnsQueryType, text: Vec<String>);
    fn on_hostname_result(
        &self,
        update: MdnsUpdateType,
        query_type: DnsQueryType,
        host: HostPortPair,
    );
    /// A record arrived for the listened-to name that this listener cannot
    /// interpret, either of another type or a PTR to the root domain.
    fn on_unhandled_result(&self, update: MdnsUpdateType, query_type: DnsQueryType);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    name: String,
    record_type: DnsRecordType,
    /// Distinguishes several records of one name and type.
    discriminator: String,
}

impl RecordKey {
    fn for_record(record: &DnsRecord) -> Self {
        let discriminator = match &record.data {
            RecordData::Ptr(target) => normalize_name(target),
            _ => String::new(),
        };
        Self {
            name: normalize_name(&record.name),
            record_type: record.record_type(),
            discriminator,
        }
    }
}

struct CachedRecord {
    record: DnsRecord,
    expires: Instant,
}

struct PendingTransaction {
    name: String,
    record_type: DnsRecordType,
    tx: oneshot::Sender<Result<Vec<DnsRecord>, NetError>>,
}

struct ListenerEntry {
    name: String,
    record_type: DnsRecordType,
    port: u16,
    delegate: Arc<dyn MdnsListenerDelegate>,
}

#[derive(Default)]
struct MdnsState {
    transactions: HashMap<u64, PendingTransaction>,
    listeners: HashMap<u64, ListenerEntry>,
    next_id: u64,
    cleanup_running: bool,
}

struct MdnsShared {
    transport: Arc<dyn MdnsTransport>,
    cache: DashMap<RecordKey, CachedRecord>,
    state: Mutex<MdnsState>,
    cleanup_wakeup: Arc<Notify>,
}

impl Drop for MdnsShared {
    fn drop(&mut self) {
        self.cleanup_wakeup.notify_one();
    }
}

type ListenerCall = (
    Arc<dyn MdnsListenerDelegate>,
    MdnsUpdateType,
    DnsRecord,
    u16,
    DnsRecordType,
);

type TransactionResult = Result<Vec<DnsRecord>, NetError>;
type Answer = (oneshot::Sender<TransactionResult>, TransactionResult);

/// Handle to the mDNS client. Clones share one cache.
#[derive(Clone)]
pub struct MdnsClient {
    shared: Arc<MdnsShared>,
}

impl MdnsClient {
    pub fn new(transport: Arc<dyn MdnsTransport>) -> Self {
        Self {
            shared: Arc::new(MdnsShared {
                transport,
                cache: DashMap::new(),
                state: Mutex::new(MdnsState::default()),
                cleanup_wakeup: Arc::new(Notify::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MdnsState> {
        self.shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of cached records, expired ones included until the next sweep.
    pub fn cached_record_count(&self) -> usize {
        self.shared.cache.len()
    }

    fn cached_records(
        &self,
        name: &str,
        record_type: DnsRecordType,
        now: Instant,
    ) -> Vec<DnsRecord> {
        self.shared
            .cache
            .iter()
            .filter(|e| {
                e.key().name == name && e.key().record_type == record_type && e.expires > now
            })
            .map(|e| e.record.clone())
            .collect()
    }

    fn cached_nsec_denies(&self, name: &str, record_type: DnsRecordType, now: Instant) -> bool {
        self.cached_records(name, DnsRecordType::Nsec, now)
            .iter()
            .any(|r| matches!(&r.data, RecordData::Nsec(types) if types.contains(&record_type)))
    }

    /// Answer from the cache, else query the network and wait for the
    /// first record of `record_type` for `name`.
    pub async fn transaction(
        &self,
        name: &str,
        record_type: DnsRecordType,
    ) -> Result<Vec<DnsRecord>, NetError> {
        let name = normalize_name(name);
        let now = Instant::now();
        self.sweep_if_idle(now);
        if self.cached_nsec_denies(&name, record_type, now) {
            return Err(NetError::NameNotResolved);
        }
        let cached = self.cached_records(&name, record_type, now);
        if !cached.is_empty() {
            tracing::trace!(name = %name, ?record_type, count = cached.len(), "mdns cache hit");
            return Ok(cached);
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state();
            let id = state.next_id;
            state.next_id += 1;
            state.transactions.insert(
                id,
                PendingTransaction {
                    name: name.clone(),
                    record_type,
                    tx,
                },
            );
            id
        };
        let _guard = TransactionGuard { client: self, id };

        self.shared.transport.send_query(&name, record_type).map_err(|e| {
            tracing::debug!(name = %name, error = %e, "mdns query send failed");
            NetError::Failed
        })?;

        match tokio::time::timeout(MDNS_TRANSACTION_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetError::Aborted),
            Err(_) => {
                tracing::debug!(name = %name, ?record_type, "mdns transaction timed out");
                Err(NetError::NameNotResolved)
            }
        }
    }

    /// Ingress for records received from the network.
    pub fn on_records_received(&self, records: Vec<DnsRecord>) {
        let now = Instant::now();
        self.sweep_if_idle(now);
        let mut calls: Vec<ListenerCall> = Vec::new();
        let mut answered: Vec<Answer> = Vec::new();

        {
            let mut state = self.state();
            for record in records {
                if let RecordData::Nsec(denied) = &record.data {
                    self.handle_nsec(&mut state, &record, denied, now, &mut calls, &mut answered);
                    continue;
                }
                let update = self.update_cache(&record, now);

                let name = normalize_name(&record.name);
                let record_type = record.record_type();
                let matching: Vec<u64> = state
                    .transactions
                    .iter()
                    .filter(|(_, t)| t.name == name && t.record_type == record_type)
                    .map(|(id, _)| *id)
                    .collect();
                for id in matching {
                    if let Some(pending) = state.transactions.remove(&id) {
                        answered.push((pending.tx, Ok(vec![record.clone()])));
                    }
                }

                if let Some(update) = update {
                    collect_listener_calls(&state, &record, update, &mut calls);
                }
            }
            if !self.shared.cache.is_empty() && !state.cleanup_running {
                state.cleanup_running = self.spawn_cleanup();
            }
        }
        self.shared.cleanup_wakeup.notify_one();

        for (tx, result) in answered {
            let _ = tx.send(result);
        }
        deliver(calls);
    }

    fn handle_nsec(
        &self,
        state: &mut MdnsState,
        record: &DnsRecord,
        denied: &[DnsRecordType],
        now: Instant,
        calls: &mut Vec<ListenerCall>,
        answered: &mut Vec<Answer>,
    ) {
        let name = normalize_name(&record.name);
        let removed: Vec<RecordKey> = self
            .shared
            .cache
            .iter()
            .filter(|e| e.key().name == name && denied.contains(&e.key().record_type))
            .map(|e| e.key().clone())
            .collect();
        for key in removed {
            if let Some((_, cached)) = self.shared.cache.remove(&key) {
                collect_listener_calls(state, &cached.record, MdnsUpdateType::Removed, calls);
            }
        }

        let ttl = if record.ttl.is_zero() { MDNS_GOODBYE_DELAY } else { record.ttl };
        self.shared.cache.insert(
            RecordKey::for_record(record),
            CachedRecord {
                record: record.clone(),
                expires: now + ttl,
            },
        );

        let denied_ids: Vec<u64> = state
            .transactions
            .iter()
            .filter(|(_, t)| t.name == name && denied.contains(&t.record_type))
            .map(|(id, _)| *id)
            .collect();
        for id in denied_ids {
            if let Some(pending) = state.transactions.remove(&id) {
                answered.push((pending.tx, Err(NetError::NameNotResolved)));
            }
        }
    }

    /// Store `record`. Returns the update to report, if any.
    fn update_cache(&self, record: &DnsRecord, now: Instant) -> Option<MdnsUpdateType> {
        let key = RecordKey::for_record(record);
        let goodbye = record.ttl.is_zero();
        let expires = now + if goodbye { MDNS_GOODBYE_DELAY } else { record.ttl };

        match self.shared.cache.get_mut(&key) {
            Some(mut cached) => {
                let changed = cached.record.data != record.data;
                cached.expires = expires;
                if changed && !goodbye {
                    cached.record = record.clone();
                    return Some(MdnsUpdateType::Changed);
                }
                None
            }
            None if goodbye => None,
            None => {
                self.shared.cache.insert(key, CachedRecord { record: record.clone(), expires });
                Some(MdnsUpdateType::Added)
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.shared.cache.iter().map(|e| e.expires).min()
    }

    /// Remove expired records and report them as REMOVED.
    fn sweep(&self, now: Instant) {
        let expired: Vec<RecordKey> = self
            .shared
            .cache
            .iter()
            .filter(|e| e.expires <= now)
            .map(|e| e.key().clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut calls = Vec::new();
        {
            let state = self.state();
            for key in expired {
                if let Some((_, cached)) = self.shared.cache.remove(&key) {
                    let removed = MdnsUpdateType::Removed;
                    collect_listener_calls(&state, &cached.record, removed, &mut calls);
                }
            }
        }
        tracing::trace!(removed = calls.len(), "mdns cache sweep");
        deliver(calls);
    }

    /// Sweep inline when no cleanup task is running, which happens when
    /// records arrived outside a tokio runtime.
    fn sweep_if_idle(&self, now: Instant) {
        let idle = !self.state().cleanup_running;
        if idle {
            self.sweep(now);
        }
    }

    /// Start the expiry timer task. Returns false without a runtime.
    fn spawn_cleanup(&self) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::trace!("no runtime for mdns cleanup, sweeping on intake");
            return false;
        };
        let weak: Weak<MdnsShared> = Arc::downgrade(&self.shared);
        let wakeup = Arc::clone(&self.shared.cleanup_wakeup);
        runtime.spawn(async move {
            loop {
                let Some(shared) = weak.upgrade() else { break };
                let client = MdnsClient { shared };
                client.sweep(Instant::now());
                // Inserts happen under the state lock, so an empty cache seen
                // here stays empty until a receiver restarts the sweep.
                let next = {
                    let mut state = client.state();
                    let next = client.next_expiry();
                    if next.is_none() {
                        state.cleanup_running = false;
                    }
                    next
                };
                drop(client);
                let Some(deadline) = next else { break };

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = wakeup.notified() => {}
                }
            }
        });
        true
    }

    /// Passive listener for `query_type` records of `host`.
    ///
    /// Unspecified queries cannot be listened for.
    pub fn create_listener(
        &self,
        host: HostPortPair,
        query_type: DnsQueryType,
    ) -> Result<MdnsListener, NetError> {
        let record_type =
            DnsRecordType::from_query_type(query_type).ok_or(NetError::NotImplemented)?;
        Ok(MdnsListener { client: self.clone(), host, query_type, record_type, id: None })
    }

    fn add_listener(&self, entry: ListenerEntry) -> u64 {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, entry);
        id
    }

    fn remove_listener(&self, id: u64) {
        self.state().listeners.remove(&id);
    }

    pub fn num_listeners(&self) -> usize {
        self.state().listeners.len()
    }
}

impl fmt::Debug for MdnsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdnsClient")
            .field("cached_records", &self.shared.cache.len())
            .finish_non_exhaustive()
    }
}

struct TransactionGuard<'a> {
    client: &'a MdnsClient,
    id: u64,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.client.state().transactions.remove(&self.id);
    }
}

fn collect_listener_calls(
    state: &MdnsState,
    record: &DnsRecord,
    update: MdnsUpdateType,
    calls: &mut Vec<ListenerCall>,
) {
    let name = normalize_name(&record.name);
    for listener in state.listeners.values().filter(|l| l.name == name) {
        calls.push((
            Arc::clone(&listener.delegate),
            update,
            record.clone(),
            listener.port,
            listener.record_type,
        ));
    }
}

fn deliver(calls: Vec<ListenerCall>) {
    for (delegate, update, record, port, listening_for) in calls {
        let record_type = record.record_type();
        let Some(query_type) = record_type.query_type() else {
            continue;
        };
        if record_type != listening_for {
            delegate.on_unhandled_result(update, query_type);
            continue;
        }
        match record.data {
            RecordData::A(ip) => {
                let address = SocketAddr::new(IpAddr::V4(ip), port);
                delegate.on_address_result(update, query_type, address)
            }
            RecordData::Aaaa(ip) => {
                let address = SocketAddr::new(IpAddr::V6(ip), port);
                delegate.on_address_result(update, query_type, address)
            }
            RecordData::Txt(text) => delegate.on_text_result(update, query_type, text),
            RecordData::Ptr(target) => {
                let target = normalize_name(&target);
                if target.is_empty() {
                    delegate.on_unhandled_result(update, query_type);
                } else {
                    let host = HostPortPair::new(target, port);
                    delegate.on_hostname_result(update, query_type, host);
                }
            }
            RecordData::Srv { port: srv_port, target, .. } => {
                let host = HostPortPair::new(normalize_name(&target), srv_port);
                delegate.on_hostname_result(update, query_type, host)
            }
            RecordData::Cname(_) | RecordData::Nsec(_) => {}
        }
    }
}

/// Passive listener. Stops on drop.
pub struct MdnsListener {
    client: MdnsClient,
    host: HostPortPair,
    query_type: DnsQueryType,
    record_type: DnsRecordType,
    id: Option<u64>,
}

impl MdnsListener {
    /// Begin delivering updates. Does not send queries.
    pub fn start(&mut self, delegate: Arc<dyn MdnsListenerDelegate>) -> Result<(), NetError> {
        if self.id.is_some() {
            return Err(NetError::Failed);
        }
        let id = self.client.add_listener(ListenerEntry {
            name: normalize_name(self.host.host()),
            record_type: self.record_type,
            port: self.host.port(),
            delegate,
        });
        tracing::debug!(host = %self.host, query_type = ?self.query_type, "mdns listener started");
        self.id = Some(id);
        Ok(())
    }

    pub fn host(&self) -> &HostPortPair {
        &self.host
    }

    pub fn query_type(&self) -> DnsQueryType {
        self.query_type
    }
}

impl Drop for MdnsListener {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.client.remove_listener(id);
        }
    }
}

/// Address or single-type resolution over mDNS, used by resolver jobs.
///
/// Unspecified address queries ask for A and AAAA together and succeed if
/// either answers.
pub(crate) async fn resolve(
    client: &MdnsClient,
    hostname: &str,
    query_type: DnsQueryType,
) -> Result<ExtractedResults, NetError> {
    let record_types = DnsRecordType::for_query(query_type);
    let outcomes =
        futures::future::join_all(record_types.iter().map(|t| client.transaction(hostname, *t)))
            .await;

    let mut addresses = AddressList::new();
    let mut ttl: Option<Duration> = None;
    let mut single: Option<ExtractedResults> = None;
    let mut last_error = NetError::NameNotResolved;

    for (record_type, outcome) in record_types.into_iter().zip(outcomes) {
        let extracted = match outcome.and_then(|records| {
            extract_results(hostname, record_type, &DnsResponse::with_answers(records))
        }) {
            Ok(extracted) if !extracted.is_empty() => extracted,
            Ok(_) => continue,
            Err(error) => {
                last_error = error;
                continue;
            }
        };
        ttl = match (ttl, extracted.ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match extracted.results {
            EntryResults::Addresses(list) => {
                for endpoint in list.endpoints() {
                    addresses.push(*endpoint);
                }
            }
            other => single = Some(ExtractedResults { results: other, ttl: extracted.ttl }),
        }
    }

    if let Some(single) = single {
        return Ok(single);
    }
    if addresses.is_empty() {
        return Err(if last_error == NetError::Failed {
            NetError::Failed
        } else {
            NetError::NameNotResolved
        });
    }
    addresses.sort_ipv6_first();
    Ok(ExtractedResults { results: EntryResults::Addresses(addresses), ttl })
}
