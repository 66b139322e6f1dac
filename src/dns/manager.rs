//! Host resolver manager: request entry point and job orchestration.
//!
//! Chromium mapping: net/dns/host_resolver_manager.cc
//!
//! The manager owns every job, the dispatcher and the DNS client behind one
//! lock. Work that completes requests is collected into a batch while the
//! lock is held and delivered after it is released, so request callbacks
//! may freely start, cancel or reprioritize other requests.
//!
//! Resolution order for a started request:
//! 1. hostname validation
//! 2. IP literals and localhost names, answered locally
//! 3. host cache (unless disallowed)
//! 4. hosts file
//! 5. attach to the job for the same key, or create one
//!
//! # Example
//!
//! ```rust,ignore
//! use chromedns::dns::{HostResolverManager, HostPortPair, ResolveHostParameters};
//!
//! let manager = HostResolverManager::builder().build();
//! let host = HostPortPair::new("example.com", 443);
//! let mut request = manager.create_request(host, ResolveHostParameters::default());
//! request.resolve().await?;
//! println!("{:?}", request.address_results());
//! ```

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::dns::client::DnsClient;
use crate::dns::config::{DnsConfig, DnsConfigOverrides, SecureDnsMode};
use crate::dns::dispatcher::{Admission, Limits, PrioritizedDispatcher};
use crate::dns::dns_task::{DnsTask, DnsTaskDelegate};
use crate::dns::gai::SystemHostResolverProc;
use crate::dns::hickory::HickoryTransactionFactory;
use crate::dns::hostcache::{EntryResults, EntrySource, EntryStaleness, HostCache, HostCacheEntry};
use crate::dns::job::{
    create_task_sequence, Job, JobId, JobKey, JobPhase, RunningTask, SecondSlot, SlotRequest,
    TaskPolicy, TaskType,
};
use crate::dns::mdns::{self, MdnsClient, MdnsListener};
use crate::dns::notifier::{NetworkChangeNotifier, NetworkChangeObserver};
use crate::dns::proc_task::{
    ProcTask, ProcTaskParams, DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_RETRY_FACTOR,
    DEFAULT_UNRESPONSIVE_DELAY,
};
use crate::dns::request::{deliver, Completion, RequestShared, ResolveHostRequest};
use crate::dns::resolve::{
    AddressList, CacheUsage, DnsQueryType, HostPortPair, HostResolverFlags, HostResolverProc,
    HostResolverSource, ResolveHostParameters,
};
use crate::dns::transaction::{DnsTransactionFactory, ExtractedResults};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Longest hostname accepted.
pub const MAX_HOSTNAME_LENGTH: usize = 4096;

pub const DEFAULT_MAX_CONCURRENT_RESOLVES: usize = 6;

/// Resolver-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Jobs allowed to run at once.
    pub max_concurrent_resolves: usize,
    /// Queued jobs allowed before the oldest lowest-priority one is evicted.
    pub max_queued_jobs: usize,
    /// Slots reserved per priority, indexed by `RequestPriority::index()`.
    pub reserved_slots: Option<[usize; RequestPriority::COUNT]>,
    pub max_system_retry_attempts: u32,
    pub system_unresponsive_delay: Duration,
    pub system_retry_factor: u32,
    pub insecure_dns_client_enabled: bool,
    pub additional_types_via_insecure_dns_enabled: bool,
    /// Whether ANY-source jobs may fall back from the DNS client to the
    /// system resolver.
    pub allow_fallback_to_system: bool,
    pub negative_cache_ttl: Duration,
    pub success_cache_ttl_for_system: Duration,
    pub cache_max_entries: usize,
    pub dns_config_overrides: DnsConfigOverrides,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_resolves: DEFAULT_MAX_CONCURRENT_RESOLVES,
            max_queued_jobs: 100 * DEFAULT_MAX_CONCURRENT_RESOLVES,
            reserved_slots: None,
            max_system_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            system_unresponsive_delay: DEFAULT_UNRESPONSIVE_DELAY,
            system_retry_factor: DEFAULT_RETRY_FACTOR,
            insecure_dns_client_enabled: false,
            additional_types_via_insecure_dns_enabled: true,
            allow_fallback_to_system: true,
            negative_cache_ttl: Duration::from_secs(86400),
            success_cache_ttl_for_system: Duration::from_secs(60),
            cache_max_entries: 1000,
            dns_config_overrides: DnsConfigOverrides::default(),
        }
    }
}

impl ManagerOptions {
    pub fn limits(&self) -> Limits {
        Limits {
            reserved_slots: self.reserved_slots.unwrap_or([0; RequestPriority::COUNT]),
            total_jobs: self.max_concurrent_resolves,
        }
    }
}

struct ManagerState {
    manager: Weak<ManagerShared>,
    cache: Arc<HostCache>,
    options: ManagerOptions,
    dispatcher: PrioritizedDispatcher<SlotRequest>,
    keys: HashMap<JobKey, JobId>,
    jobs: HashMap<JobId, Job>,
    request_jobs: HashMap<u64, JobId>,
    next_job_id: JobId,
    next_seq: u64,
    dns_client: DnsClient,
    proc_params: ProcTaskParams,
    mdns_client: Option<MdnsClient>,
    ipv6_reachable: bool,
}

pub(crate) struct ManagerShared {
    state: Mutex<ManagerState>,
    cache: Arc<HostCache>,
    next_request_id: AtomicU64,
}

/// Host resolver. Clones share the same jobs and cache.
///
/// Dropping the last handle completes every attached request with
/// `ERR_CONTEXT_SHUT_DOWN`.
#[derive(Clone)]
pub struct HostResolverManager {
    shared: Arc<ManagerShared>,
}

impl HostResolverManager {
    /// Manager with default options, the OS resolver and the hickory client.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HostResolverManagerBuilder {
        HostResolverManagerBuilder::default()
    }

    /// Create a request. Nothing happens until it is started.
    pub fn create_request(
        &self,
        host: HostPortPair,
        params: ResolveHostParameters,
    ) -> ResolveHostRequest {
        let id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(RequestShared::new(id, host, params));
        ResolveHostRequest::new(shared, Arc::downgrade(&self.shared))
    }

    /// Subscribe to address and DNS config changes.
    pub fn observe_network_changes(&self, notifier: &NetworkChangeNotifier) {
        let observer: Arc<dyn NetworkChangeObserver> = self.shared.clone();
        notifier.add_observer(Arc::downgrade(&observer));
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManagerState, &mut Vec<Completion>) -> R) -> R {
        let mut batch = Vec::new();
        let result = {
            let mut state = self.shared.lock();
            f(&mut *state, &mut batch)
        };
        deliver(batch);
        result
    }

    /// Replace the config overrides. Jobs are aborted if the effective
    /// config changes.
    pub fn set_dns_config_overrides(&self, overrides: DnsConfigOverrides) {
        self.with_state(|state, batch| {
            state.options.dns_config_overrides = overrides.clone();
            if state.dns_client.set_config_overrides(overrides) {
                state.on_effective_config_changed(false, batch);
            }
        });
    }

    /// Enable or disable insecure transactions of the built-in client.
    ///
    /// Disabling moves running insecure DNS tasks to their fallback, or
    /// fails their jobs with `ERR_FAILED` when none remains.
    pub fn set_insecure_dns_client_enabled(&self, enabled: bool, additional_types_enabled: bool) {
        self.with_state(|state, batch| {
            if !state.dns_client.set_insecure_enabled(enabled, additional_types_enabled) {
                return;
            }
            tracing::info!(enabled, additional_types_enabled, "insecure dns client toggled");
            if !enabled {
                state.abort_insecure_dns_tasks(NetError::Failed, false, batch);
            }
        });
    }

    /// Record a DoH availability result for server `index` of the current config.
    pub fn set_doh_server_availability(&self, index: usize, available: bool) {
        self.shared.lock().dns_client.set_doh_server_available(index, available);
    }

    /// When false, unspecified queries are narrowed to IPv4.
    pub fn set_ipv6_reachable(&self, reachable: bool) {
        self.shared.lock().ipv6_reachable = reachable;
    }

    pub fn set_mdns_client(&self, client: Option<MdnsClient>) {
        self.shared.lock().mdns_client = client;
    }

    /// Passive mDNS listener for `host`. Fails if no mDNS client is set.
    pub fn create_mdns_listener(
        &self,
        host: HostPortPair,
        query_type: DnsQueryType,
    ) -> Result<MdnsListener, NetError> {
        let client = self.shared.lock().mdns_client.clone().ok_or(NetError::Failed)?;
        client.create_listener(host, query_type)
    }

    /// Replace dispatcher limits, starting queued jobs that now fit.
    pub fn set_dispatcher_limits(&self, limits: Limits) {
        self.with_state(|state, batch| {
            for granted in state.dispatcher.set_limits(limits) {
                state.on_slot_granted(granted, batch);
            }
        });
    }

    pub fn dispatcher_limits(&self) -> Limits {
        self.shared.lock().dispatcher.limits().clone()
    }

    /// Lowering the limit evicts queued jobs until the queue fits.
    pub fn set_max_queued_jobs(&self, max_queued_jobs: usize) {
        self.with_state(|state, batch| {
            state.options.max_queued_jobs = max_queued_jobs;
            state.enforce_queue_limit(batch);
        });
    }

    /// Effective DNS config as JSON, `Null` when there is none.
    pub fn dns_config_as_value(&self) -> serde_json::Value {
        let state = self.shared.lock();
        match state.dns_client.effective_config() {
            Some(config) => serde_json::to_value(config).unwrap_or(serde_json::Value::Null),
            None => serde_json::Value::Null,
        }
    }

    pub fn effective_dns_config(&self) -> Option<DnsConfig> {
        self.shared.lock().dns_client.effective_config().cloned()
    }

    pub fn host_cache(&self) -> Arc<HostCache> {
        Arc::clone(&self.shared.cache)
    }

    /// Consecutive insecure DNS failures counted toward auto-disable.
    pub fn insecure_fallback_failures(&self) -> usize {
        self.shared.lock().dns_client.insecure_fallback_failures()
    }

    pub fn num_jobs(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn num_running_jobs(&self) -> usize {
        let state = self.shared.lock();
        state.jobs.values().filter(|job| matches!(job.phase, JobPhase::Running { .. })).count()
    }

    pub fn num_queued_jobs(&self) -> usize {
        let state = self.shared.lock();
        state.jobs.values().filter(|job| matches!(job.phase, JobPhase::Queued(_))).count()
    }
}

impl Default for HostResolverManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostResolverManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("HostResolverManager")
            .field("jobs", &state.jobs.len())
            .field("running", &state.dispatcher.num_running())
            .field("queued", &state.dispatcher.num_queued())
            .field("dns_session", &state.dns_client.session_id())
            .finish_non_exhaustive()
    }
}

/// Builder for [`HostResolverManager`].
#[derive(Default)]
pub struct HostResolverManagerBuilder {
    options: ManagerOptions,
    resolver_proc: Option<Arc<dyn HostResolverProc>>,
    transaction_factory: Option<Arc<dyn DnsTransactionFactory>>,
    mdns_client: Option<MdnsClient>,
}

impl HostResolverManagerBuilder {
    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolver used by system tasks. Defaults to the OS resolver.
    pub fn resolver_proc(mut self, resolver_proc: Arc<dyn HostResolverProc>) -> Self {
        self.resolver_proc = Some(resolver_proc);
        self
    }

    /// Transport of the built-in client. Defaults to hickory.
    pub fn transaction_factory(mut self, factory: Arc<dyn DnsTransactionFactory>) -> Self {
        self.transaction_factory = Some(factory);
        self
    }

    pub fn mdns_client(mut self, client: MdnsClient) -> Self {
        self.mdns_client = Some(client);
        self
    }

    pub fn build(self) -> HostResolverManager {
        let options = self.options;
        let resolver_proc = self
            .resolver_proc
            .unwrap_or_else(|| Arc::new(SystemHostResolverProc::new()));
        let factory = self
            .transaction_factory
            .unwrap_or_else(|| Arc::new(HickoryTransactionFactory::new()));

        let mut dns_client = DnsClient::new(
            factory,
            options.insecure_dns_client_enabled,
            options.additional_types_via_insecure_dns_enabled,
        );
        dns_client.set_config_overrides(options.dns_config_overrides.clone());

        let mut proc_params = ProcTaskParams::new(resolver_proc, options.max_system_retry_attempts);
        proc_params.unresponsive_delay = options.system_unresponsive_delay;
        proc_params.retry_factor = options.system_retry_factor;

        let cache = Arc::new(HostCache::new(options.cache_max_entries));
        let mdns_client = self.mdns_client;
        let shared = Arc::new_cyclic(|weak| ManagerShared {
            state: Mutex::new(ManagerState {
                manager: weak.clone(),
                cache: Arc::clone(&cache),
                dispatcher: PrioritizedDispatcher::new(options.limits()),
                options,
                keys: HashMap::new(),
                jobs: HashMap::new(),
                request_jobs: HashMap::new(),
                next_job_id: 1,
                next_seq: 1,
                dns_client,
                proc_params,
                mdns_client,
                ipv6_reachable: true,
            }),
            cache,
            next_request_id: AtomicU64::new(1),
        });
        HostResolverManager { shared }
    }
}

impl ManagerShared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn start_request(&self, request: &Arc<RequestShared>) -> Vec<Completion> {
        let mut batch = Vec::new();
        self.lock().start_request(request, &mut batch);
        batch
    }

    pub(crate) fn cancel_request(&self, request_id: u64) -> Vec<Completion> {
        let mut batch = Vec::new();
        self.lock().cancel_request(request_id, &mut batch);
        batch
    }

    pub(crate) fn change_request_priority(
        &self,
        request_id: u64,
        priority: RequestPriority,
    ) -> Vec<Completion> {
        let mut batch = Vec::new();
        let mut state = self.lock();
        let Some(&job_id) = state.request_jobs.get(&request_id) else {
            return batch;
        };
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.change_request_priority(request_id, priority);
        }
        state.update_job_priority(job_id, &mut batch);
        drop(state);
        batch
    }

    pub(crate) fn request_load_state(&self, request_id: u64) -> LoadState {
        let state = self.lock();
        match state.request_jobs.get(&request_id).and_then(|id| state.jobs.get(id)) {
            Some(job) if job.is_running() => LoadState::ResolvingHost,
            _ => LoadState::Idle,
        }
    }
}

impl NetworkChangeObserver for ManagerShared {
    fn on_ip_address_changed(&self) {
        let mut batch = Vec::new();
        {
            let mut state = self.lock();
            state.cache.on_network_change();
            state.abort_all_jobs(NetError::NetworkChanged, &mut batch);
        }
        deliver(batch);
    }

    fn on_dns_config_changed(&self, config: Option<DnsConfig>, initial_read: bool) {
        let mut batch = Vec::new();
        {
            let mut state = self.lock();
            if state.dns_client.set_system_config(config) {
                state.on_effective_config_changed(initial_read, &mut batch);
            }
        }
        deliver(batch);
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut batch = Vec::new();
        state.dispatcher.set_limits_to_zero();
        let ids: Vec<JobId> = state.jobs.keys().copied().collect();
        for id in ids {
            state.complete_job(id, error_entry(NetError::ContextShutDown), None, &mut batch);
        }
        tracing::debug!(completed = batch.len(), "host resolver manager shut down");
        deliver(batch);
    }
}

fn error_entry(error: NetError) -> HostCacheEntry {
    HostCacheEntry::from_error(error, EntrySource::Unknown, None)
}

fn entry_source(task_type: TaskType) -> EntrySource {
    match task_type {
        TaskType::SecureDns | TaskType::Dns => EntrySource::Dns,
        TaskType::System => EntrySource::System,
        TaskType::Mdns => EntrySource::MulticastDns,
    }
}

fn spawn_task<F>(future: F) -> Result<JoinHandle<()>, NetError>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => Ok(runtime.spawn(future)),
        Err(_) => {
            tracing::warn!("no tokio runtime available for resolver task");
            Err(NetError::Failed)
        }
    }
}

/// Hand a task result back to the manager, if it still exists.
fn report_task_result(
    manager: &Weak<ManagerShared>,
    job_id: JobId,
    seq: u64,
    result: Result<ExtractedResults, NetError>,
) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let mut batch = Vec::new();
    manager.lock().handle_task_result(job_id, seq, result, &mut batch);
    deliver(batch);
}

struct JobTaskDelegate {
    manager: Weak<ManagerShared>,
    job_id: JobId,
    seq: u64,
}

impl DnsTaskDelegate for JobTaskDelegate {
    fn on_intermediate_transactions_complete(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut batch = Vec::new();
        manager.lock().reduce_to_one_slot(self.job_id, self.seq, &mut batch);
        deliver(batch);
    }
}

pub(crate) fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LENGTH {
        return false;
    }
    let trimmed = hostname.strip_suffix('.').unwrap_or(hostname);
    !trimmed.is_empty() && trimmed.split('.').all(|label| !label.is_empty() && label.len() <= 63)
}

fn is_local_hostname(hostname: &str) -> bool {
    let lower = hostname.to_ascii_lowercase();
    let name = lower.strip_suffix('.').unwrap_or(&lower);
    matches!(name, "localhost" | "localhost6" | "localhost6.localdomain6")
        || name.ends_with(".localhost")
}

/// Answer IP literals and localhost names without any task. `None` means
/// the name needs real resolution.
fn resolve_locally(
    hostname: &str,
    query_type: DnsQueryType,
) -> Option<Result<AddressList, NetError>> {
    if !query_type.is_address_type() {
        return None;
    }
    let literal = hostname
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(hostname);
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Some(if query_type.address_family().matches(&ip) {
            Ok(AddressList::from_ips([ip], 0))
        } else {
            Err(NetError::NameNotResolved)
        });
    }
    if is_local_hostname(hostname) {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let ips = match query_type {
            DnsQueryType::A => vec![v4],
            DnsQueryType::Aaaa => vec![v6],
            _ => vec![v6, v4],
        };
        return Some(Ok(AddressList::from_ips(ips, 0)));
    }
    None
}

impl ManagerState {
    fn start_request(&mut self, request: &Arc<RequestShared>, batch: &mut Vec<Completion>) {
        let params = request.params();
        let hostname = request.host().host();

        if !is_valid_hostname(hostname) {
            tracing::debug!(host = %hostname, "rejecting invalid hostname");
            let entry = error_entry(NetError::NameNotResolved);
            batch.push(Completion::new(Arc::clone(request), entry, None));
            return;
        }

        if let Some(result) = resolve_locally(hostname, params.query_type) {
            let entry = match result {
                Ok(list) => {
                    HostCacheEntry::new(EntryResults::Addresses(list), EntrySource::Unknown, None)
                }
                Err(error) => error_entry(error),
            };
            batch.push(Completion::new(Arc::clone(request), entry, None));
            return;
        }

        let key = self.job_key(hostname, params);

        if params.cache_usage != CacheUsage::Disallowed {
            if let Some((entry, staleness)) = self.serve_from_cache(&key, params.cache_usage) {
                batch.push(Completion::new(Arc::clone(request), entry, Some(staleness)));
                return;
            }
        }

        if let Some(entry) = self.serve_from_hosts(&key.hostname, key.query_type) {
            batch.push(Completion::new(Arc::clone(request), entry, None));
            return;
        }

        if params.source == HostResolverSource::LocalOnly {
            let entry = error_entry(NetError::DnsCacheMiss);
            batch.push(Completion::new(Arc::clone(request), entry, None));
            return;
        }

        self.create_or_attach(request, key, batch);
    }

    fn job_key(&self, hostname: &str, params: &ResolveHostParameters) -> JobKey {
        let mut query_type = params.query_type;
        let mut flags = params.key_flags();
        if query_type == DnsQueryType::Unspecified && !self.ipv6_reachable {
            query_type = DnsQueryType::A;
            flags = flags | HostResolverFlags::DEFAULT_FAMILY_SET_DUE_TO_NO_IPV6;
        }
        let secure_dns_mode = params
            .secure_dns_mode_override
            .or_else(|| self.dns_client.effective_config().map(|c| c.secure_dns_mode))
            .unwrap_or_default();
        let source = match params.source {
            HostResolverSource::LocalOnly => HostResolverSource::Any,
            source => source,
        };
        JobKey {
            hostname: hostname.to_ascii_lowercase(),
            query_type,
            flags,
            source,
            secure_dns_mode,
        }
    }

    fn serve_from_cache(
        &self,
        key: &JobKey,
        usage: CacheUsage,
    ) -> Option<(HostCacheEntry, EntryStaleness)> {
        let now = Instant::now();
        let candidates: &[bool] =
            if key.secure_dns_mode == SecureDnsMode::Secure { &[true] } else { &[true, false] };
        for &secure in candidates {
            let cache_key = key.cache_key(secure);
            let hit = match usage {
                CacheUsage::Allowed => self
                    .cache
                    .lookup(&cache_key, now)
                    .map(|entry| (entry, EntryStaleness::default())),
                CacheUsage::StaleAllowed => self.cache.lookup_stale(&cache_key, now),
                CacheUsage::Disallowed => None,
            };
            if hit.is_some() {
                tracing::trace!(host = %key.hostname, secure, "served from host cache");
                return hit;
            }
        }
        None
    }

    fn serve_from_hosts(&self, hostname: &str, query_type: DnsQueryType) -> Option<HostCacheEntry> {
        if !query_type.is_address_type() {
            return None;
        }
        let config = self.dns_client.effective_config().or(self.dns_client.system_config())?;
        let ips = config.hosts.lookup(hostname, query_type.address_family());
        if ips.is_empty() {
            return None;
        }
        tracing::trace!(host = %hostname, count = ips.len(), "served from hosts");
        let results = EntryResults::Addresses(AddressList::from_ips(ips, 0));
        Some(HostCacheEntry::new(results, EntrySource::Hosts, None))
    }

    fn create_or_attach(
        &mut self,
        request: &Arc<RequestShared>,
        key: JobKey,
        batch: &mut Vec<Completion>,
    ) {
        let priority = request.priority();
        if let Some(&job_id) = self.keys.get(&key) {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.attach(Arc::clone(request), priority);
                self.request_jobs.insert(request.id(), job_id);
                tracing::debug!(
                    job_id,
                    request_id = request.id(),
                    host = %key.hostname,
                    "attached to existing job"
                );
                self.update_job_priority(job_id, batch);
                return;
            }
        }

        let policy = TaskPolicy {
            client: &self.dns_client,
            has_mdns_client: self.mdns_client.is_some(),
            allow_fallback_to_system: self.options.allow_fallback_to_system,
            include_canonical_name: request.params().include_canonical_name,
        };
        let tasks = match create_task_sequence(&key, &policy) {
            Ok(tasks) => tasks,
            Err(error) => {
                tracing::debug!(host = %key.hostname, %error, "no usable task for request");
                batch.push(Completion::new(Arc::clone(request), error_entry(error), None));
                return;
            }
        };

        let job_id = self.next_job_id;
        self.next_job_id += 1;
        let admission = self.dispatcher.add(SlotRequest::Job(job_id), priority);
        let phase = match admission {
            Admission::Started => JobPhase::Running { task: None, second_slot: SecondSlot::None },
            Admission::Queued(handle) => JobPhase::Queued(handle),
        };
        let mut job = Job::new(job_id, key.clone(), tasks, phase);
        job.attach(Arc::clone(request), priority);
        tracing::debug!(
            job_id,
            host = %key.hostname,
            query_type = ?key.query_type,
            tasks = ?job.tasks,
            queued = matches!(admission, Admission::Queued(_)),
            "created job"
        );
        self.jobs.insert(job_id, job);
        self.keys.insert(key, job_id);
        self.request_jobs.insert(request.id(), job_id);

        match admission {
            Admission::Started => self.start_next_task(job_id, batch),
            Admission::Queued(_) => self.enforce_queue_limit(batch),
        }
    }

    fn enforce_queue_limit(&mut self, batch: &mut Vec<Completion>) {
        while self.dispatcher.num_queued() > self.options.max_queued_jobs {
            let evicted = self
                .dispatcher
                .evict_oldest_lowest_where(|slot| matches!(slot, SlotRequest::Job(_)));
            let Some(SlotRequest::Job(job_id)) = evicted else {
                break;
            };
            tracing::debug!(job_id, "queue too large, evicting job");
            let entry = error_entry(NetError::HostResolverQueueTooLarge);
            self.complete_job(job_id, entry, None, batch);
        }
    }

    fn cancel_request(&mut self, request_id: u64, batch: &mut Vec<Completion>) {
        let Some(job_id) = self.request_jobs.remove(&request_id) else {
            return;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        job.detach(request_id);
        if !job.requests.is_empty() {
            self.update_job_priority(job_id, batch);
            return;
        }
        tracing::debug!(job_id, host = %job.key.hostname, "last request cancelled, abandoning job");
        if let Some((_, slots)) = self.remove_job(job_id) {
            self.release_slots(slots, batch);
        }
    }

    /// Bring the dispatcher in line with the highest attached priority.
    fn update_job_priority(&mut self, job_id: JobId, batch: &mut Vec<Completion>) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let priority = job.priority();
        let (handle, slot) = match &job.phase {
            JobPhase::Queued(handle) => (*handle, SlotRequest::Job(job_id)),
            JobPhase::Running { second_slot: SecondSlot::Queued(handle, _), .. } => {
                (*handle, SlotRequest::SecondSlot(job_id))
            }
            _ => return,
        };
        if handle.priority() == priority {
            return;
        }
        match self.dispatcher.change_priority(handle, priority) {
            Some(Admission::Started) => self.on_slot_granted(slot, batch),
            Some(Admission::Queued(new_handle)) => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    match &mut job.phase {
                        JobPhase::Queued(handle) => *handle = new_handle,
                        JobPhase::Running { second_slot: SecondSlot::Queued(handle, _), .. } => {
                            *handle = new_handle
                        }
                        _ => {}
                    }
                }
            }
            None => {}
        }
    }

    fn on_slot_granted(&mut self, slot: SlotRequest, batch: &mut Vec<Completion>) {
        match slot {
            SlotRequest::Job(job_id) => {
                let Some(job) = self.jobs.get_mut(&job_id) else {
                    self.release_slot(batch);
                    return;
                };
                if !matches!(job.phase, JobPhase::Queued(_)) {
                    self.release_slot(batch);
                    return;
                }
                job.phase = JobPhase::Running { task: None, second_slot: SecondSlot::None };
                tracing::trace!(job_id, "job granted a slot");
                self.start_next_task(job_id, batch);
            }
            SlotRequest::SecondSlot(job_id) => {
                let mut delivered = false;
                let phase = self.jobs.get_mut(&job_id).map(|job| &mut job.phase);
                if let Some(JobPhase::Running { second_slot, .. }) = phase {
                    if matches!(second_slot, SecondSlot::Queued(..)) {
                        let queued = std::mem::replace(second_slot, SecondSlot::None);
                        if let SecondSlot::Queued(_, grant) = queued {
                            delivered = grant.send(()).is_ok();
                        }
                        if delivered {
                            *second_slot = SecondSlot::Held;
                        }
                    }
                }
                if !delivered {
                    self.release_slot(batch);
                }
            }
        }
    }

    fn release_slot(&mut self, batch: &mut Vec<Completion>) {
        if let Some(granted) = self.dispatcher.on_job_finished() {
            self.on_slot_granted(granted, batch);
        }
    }

    fn release_slots(&mut self, count: usize, batch: &mut Vec<Completion>) {
        for _ in 0..count {
            self.release_slot(batch);
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Pop and spawn the job's next task. The job must hold its slot.
    fn start_next_task(&mut self, job_id: JobId, batch: &mut Vec<Completion>) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let Some(task_type) = job.tasks.pop_front() else {
            self.complete_job(job_id, error_entry(NetError::NameNotResolved), None, batch);
            return;
        };
        let key = job.key.clone();
        let priority = job.priority();
        let system_flags = job.system_flags();
        let seq = self.next_seq();

        let spawned = match task_type {
            TaskType::System => self
                .spawn_system_task(job_id, seq, &key, system_flags)
                .map(|h| (h, SecondSlot::None)),
            TaskType::SecureDns | TaskType::Dns => {
                self.spawn_dns_task(job_id, seq, &key, task_type == TaskType::SecureDns, priority)
            }
            TaskType::Mdns => {
                self.spawn_mdns_task(job_id, seq, &key).map(|h| (h, SecondSlot::None))
            }
        };

        match spawned {
            Ok((handle, second_slot)) => {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.phase = JobPhase::Running {
                        task: Some(RunningTask { task_type, seq, handle }),
                        second_slot,
                    };
                }
                tracing::debug!(job_id, host = %key.hostname, ?task_type, "job task started");
            }
            Err(error) => self.on_task_finished(job_id, task_type, Err(error), batch),
        }
    }

    fn spawn_system_task(
        &self,
        job_id: JobId,
        seq: u64,
        key: &JobKey,
        flags: HostResolverFlags,
    ) -> Result<JoinHandle<()>, NetError> {
        let manager = self.manager.clone();
        let params = self.proc_params.clone();
        let hostname = key.hostname.clone();
        let family = key.query_type.address_family();
        spawn_task(async move {
            let mut task = ProcTask::new(hostname, family, flags, params);
            let result = task
                .run()
                .await
                .map(|list| ExtractedResults { results: EntryResults::Addresses(list), ttl: None });
            drop(task);
            report_task_result(&manager, job_id, seq, result);
        })
    }

    fn spawn_dns_task(
        &mut self,
        job_id: JobId,
        seq: u64,
        key: &JobKey,
        secure: bool,
        priority: RequestPriority,
    ) -> Result<(JoinHandle<()>, SecondSlot), NetError> {
        let factory = self.dns_client.transaction_factory().ok_or(NetError::Failed)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| NetError::Failed)?;
        let task = DnsTask::new(key.hostname.clone(), key.query_type, secure, factory);

        let (second_slot, grant) = if task.num_transactions() > 1 {
            match self.dispatcher.add(SlotRequest::SecondSlot(job_id), priority) {
                Admission::Started => (SecondSlot::Held, None),
                Admission::Queued(handle) => {
                    let (tx, rx) = oneshot::channel();
                    (SecondSlot::Queued(handle, tx), Some(rx))
                }
            }
        } else {
            (SecondSlot::None, None)
        };

        let manager = self.manager.clone();
        let delegate = JobTaskDelegate { manager: manager.clone(), job_id, seq };
        let handle = runtime.spawn(async move {
            let result = task.run(&delegate, grant).await;
            report_task_result(&manager, job_id, seq, result);
        });
        Ok((handle, second_slot))
    }

    fn spawn_mdns_task(
        &self,
        job_id: JobId,
        seq: u64,
        key: &JobKey,
    ) -> Result<JoinHandle<()>, NetError> {
        let client = self.mdns_client.clone().ok_or(NetError::Failed)?;
        let manager = self.manager.clone();
        let hostname = key.hostname.clone();
        let query_type = key.query_type;
        spawn_task(async move {
            let result = mdns::resolve(&client, &hostname, query_type).await;
            report_task_result(&manager, job_id, seq, result);
        })
    }

    fn reduce_to_one_slot(&mut self, job_id: JobId, seq: u64, batch: &mut Vec<Completion>) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.running_seq() != Some(seq) {
            return;
        }
        let JobPhase::Running { second_slot, .. } = &mut job.phase else {
            return;
        };
        match std::mem::replace(second_slot, SecondSlot::None) {
            SecondSlot::Queued(handle, _) => {
                self.dispatcher.cancel(handle);
            }
            SecondSlot::Held => self.release_slot(batch),
            SecondSlot::None => {}
        }
    }

    fn handle_task_result(
        &mut self,
        job_id: JobId,
        seq: u64,
        result: Result<ExtractedResults, NetError>,
        batch: &mut Vec<Completion>,
    ) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        if job.running_seq() != Some(seq) {
            tracing::trace!(job_id, seq, "ignoring result of a replaced task");
            return;
        }
        let Some(task_type) = self.stop_running_task(job_id, batch) else {
            return;
        };
        self.on_task_finished(job_id, task_type, result, batch);
    }

    /// Abort the running task and give back its second slot. Returns the
    /// type of the task that was running.
    fn stop_running_task(
        &mut self,
        job_id: JobId,
        batch: &mut Vec<Completion>,
    ) -> Option<TaskType> {
        let job = self.jobs.get_mut(&job_id)?;
        let JobPhase::Running { task, second_slot } = &mut job.phase else {
            return None;
        };
        let running = task.take()?;
        running.handle.abort();
        match std::mem::replace(second_slot, SecondSlot::None) {
            SecondSlot::Queued(handle, _) => {
                self.dispatcher.cancel(handle);
            }
            SecondSlot::Held => self.release_slot(batch),
            SecondSlot::None => {}
        }
        Some(running.task_type)
    }

    fn on_task_finished(
        &mut self,
        job_id: JobId,
        task_type: TaskType,
        result: Result<ExtractedResults, NetError>,
        batch: &mut Vec<Completion>,
    ) {
        let source = entry_source(task_type);
        let secure = task_type == TaskType::SecureDns;

        let error = match result {
            Ok(extracted) => {
                if task_type.is_insecure_dns() {
                    self.dns_client.clear_insecure_fallback_failures();
                }
                let ttl = match task_type {
                    TaskType::System => Some(self.options.success_cache_ttl_for_system),
                    _ => extracted.ttl,
                };
                let entry = HostCacheEntry::new(extracted.results, source, ttl);
                self.complete_job(job_id, entry, Some(secure), batch);
                return;
            }
            Err(error) => error,
        };

        let negative = task_type.is_dns() && error == NetError::NameNotResolved;
        let ttl = negative.then_some(self.options.negative_cache_ttl);
        let entry = HostCacheEntry::from_error(error, source, ttl);

        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let fall_back = error != NetError::IcannNameCollision && !job.tasks.is_empty();
        tracing::debug!(
            job_id,
            host = %job.key.hostname,
            ?task_type,
            %error,
            fall_back,
            "job task failed"
        );
        if !fall_back {
            self.complete_job(job_id, entry, Some(secure), batch);
            return;
        }

        if let Some(ttl) = entry.ttl() {
            let cache_key = job.key.cache_key(secure);
            job.cache_drafts.push((cache_key, entry, ttl));
        }
        if task_type.is_insecure_dns() {
            self.on_fallback_resolve(batch);
        }
        self.start_next_task(job_id, batch);
    }

    /// Count an insecure DNS failure. Reaching the threshold moves every
    /// running insecure DNS task with a fallback onto it.
    fn on_fallback_resolve(&mut self, batch: &mut Vec<Completion>) {
        if self.dns_client.fallback_from_insecure_transaction_preferred() {
            return;
        }
        if self.dns_client.increment_insecure_fallback_failures() {
            self.abort_insecure_dns_tasks(NetError::Failed, true, batch);
        }
    }

    fn abort_insecure_dns_tasks(
        &mut self,
        error: NetError,
        fallback_only: bool,
        batch: &mut Vec<Completion>,
    ) {
        let ids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.running_task_type() == Some(TaskType::Dns))
            .map(|job| job.id)
            .collect();
        for job_id in ids {
            let Some(job) = self.jobs.get(&job_id) else {
                continue;
            };
            if job.tasks.is_empty() {
                if !fallback_only {
                    let entry = HostCacheEntry::from_error(error, EntrySource::Dns, None);
                    self.complete_job(job_id, entry, None, batch);
                }
                continue;
            }
            tracing::debug!(
                job_id,
                host = %job.key.hostname,
                "moving insecure dns task to fallback"
            );
            self.stop_running_task(job_id, batch);
            self.start_next_task(job_id, batch);
        }
    }

    /// Remove a job from every index and stop its work. Returns the job and
    /// the number of dispatcher slots it held.
    fn remove_job(&mut self, job_id: JobId) -> Option<(Job, usize)> {
        let mut job = self.jobs.remove(&job_id)?;
        if self.keys.get(&job.key) == Some(&job_id) {
            self.keys.remove(&job.key);
        }
        let detached = JobPhase::Running { task: None, second_slot: SecondSlot::None };
        let phase = std::mem::replace(&mut job.phase, detached);
        let slots = match phase {
            JobPhase::Queued(handle) => {
                self.dispatcher.cancel(handle);
                0
            }
            JobPhase::Running { task, second_slot } => {
                if let Some(running) = task {
                    running.handle.abort();
                }
                match second_slot {
                    SecondSlot::Queued(handle, _) => {
                        self.dispatcher.cancel(handle);
                        1
                    }
                    SecondSlot::Held => 2,
                    SecondSlot::None => 1,
                }
            }
        };
        Some((job, slots))
    }

    /// Finish a job: write cache entries when `cache_secure` is set and
    /// deliver `entry` to every attached request.
    fn complete_job(
        &mut self,
        job_id: JobId,
        entry: HostCacheEntry,
        cache_secure: Option<bool>,
        batch: &mut Vec<Completion>,
    ) {
        let Some((job, slots)) = self.remove_job(job_id) else {
            return;
        };

        if let Some(secure) = cache_secure {
            let now = Instant::now();
            for (key, draft, ttl) in job.cache_drafts {
                self.cache.set(key, draft, now, ttl);
            }
            if let Some(ttl) = entry.ttl() {
                self.cache.set(job.key.cache_key(secure), entry.clone(), now, ttl);
            }
        }

        tracing::debug!(
            job_id,
            host = %job.key.hostname,
            requests = job.requests.len(),
            error = ?entry.error(),
            "job completed"
        );
        for attachment in job.requests {
            self.request_jobs.remove(&attachment.request.id());
            batch.push(Completion::new(attachment.request, entry.clone(), None));
        }
        self.release_slots(slots, batch);
    }

    fn abort_all_jobs(&mut self, error: NetError, batch: &mut Vec<Completion>) {
        let limits = self.dispatcher.limits().clone();
        self.dispatcher.set_limits_to_zero();
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        if !ids.is_empty() {
            tracing::debug!(jobs = ids.len(), %error, "aborting all jobs");
        }
        for job_id in ids {
            self.complete_job(job_id, error_entry(error), None, batch);
        }
        for granted in self.dispatcher.set_limits(limits) {
            self.on_slot_granted(granted, batch);
        }
    }

    /// Complete jobs the hosts file can now answer.
    fn serve_jobs_from_hosts(&mut self, batch: &mut Vec<Completion>) {
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        for job_id in ids {
            let Some(job) = self.jobs.get(&job_id) else {
                continue;
            };
            if let Some(entry) = self.serve_from_hosts(&job.key.hostname, job.key.query_type) {
                self.complete_job(job_id, entry, None, batch);
            }
        }
    }

    fn on_effective_config_changed(&mut self, initial_read: bool, batch: &mut Vec<Completion>) {
        self.cache.on_network_change();
        if !initial_read {
            self.abort_all_jobs(NetError::NetworkChanged, batch);
        }
        self.serve_jobs_from_hosts(batch);
    }
}
