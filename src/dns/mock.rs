//! Deterministic test doubles for the resolver's seams.
//!
//! - [`RuleBasedHostResolverProc`]: pattern-to-address rules for the system
//!   resolver, with an optional gate that holds lookups until released
//! - [`AttemptGatedHostResolverProc`]: makes early retry attempts hang
//! - [`MockDnsTransactionFactory`]: scripted DNS transactions, optionally
//!   held until [`MockDnsTransactionFactory::complete_delayed_transactions`]
//! - [`RecordingMdnsTransport`]: records outgoing mDNS queries

use crate::base::neterror::NetError;
use crate::dns::mdns::MdnsTransport;
use crate::dns::resolve::{AddressFamily, AddressList, HostResolverFlags, HostResolverProc};
use crate::dns::transaction::{
    DnsRecord, DnsRecordType, DnsResponse, DnsSession, DnsTransaction, DnsTransactionFactory,
    ResponseCode,
};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

/// Upper bound on how long a gated lookup waits before giving up.
const GATE_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_ip_list(ip_list: &str) -> Vec<IpAddr> {
    ip_list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn pattern_matches(pattern: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_prefix('*') {
        Some(suffix) => host.ends_with(suffix),
        None => pattern == host,
    }
}

#[derive(Debug, Clone)]
enum RuleResult {
    Addresses { ips: Vec<IpAddr>, canonical_name: Option<String> },
    Error(NetError),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    family: Option<AddressFamily>,
    result: RuleResult,
}

#[derive(Default)]
struct Gate {
    blocking: bool,
    permits: usize,
}

/// System resolver double driven by host patterns.
///
/// Patterns are exact hostnames, `*` or `*.suffix`. The first matching rule
/// wins; hosts without a rule fail with `NameNotResolved`.
pub struct RuleBasedHostResolverProc {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, AddressFamily)>>,
    gate: Mutex<Gate>,
    gate_cv: Condvar,
    waiting: watch::Sender<usize>,
}

impl Default for RuleBasedHostResolverProc {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBasedHostResolverProc {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(Gate::default()),
            gate_cv: Condvar::new(),
            waiting: watch::Sender::new(0),
        }
    }

    /// `ip_list` is comma-separated; an empty list resolves to no addresses.
    pub fn add_rule(&self, pattern: &str, ip_list: &str) {
        let result = RuleResult::Addresses { ips: parse_ip_list(ip_list), canonical_name: None };
        self.push(pattern, None, result);
    }

    pub fn add_rule_for_family(&self, pattern: &str, family: AddressFamily, ip_list: &str) {
        self.push(
            pattern,
            Some(family),
            RuleResult::Addresses { ips: parse_ip_list(ip_list), canonical_name: None },
        );
    }

    /// The canonical name is only reported when `CANONNAME` is requested.
    pub fn add_rule_with_canonical_name(&self, pattern: &str, ip_list: &str, canonical_name: &str) {
        self.push(
            pattern,
            None,
            RuleResult::Addresses {
                ips: parse_ip_list(ip_list),
                canonical_name: Some(canonical_name.to_string()),
            },
        );
    }

    pub fn add_simulated_failure(&self, pattern: &str) {
        self.push(pattern, None, RuleResult::Error(NetError::NameNotResolved));
    }

    pub fn add_rule_with_error(&self, pattern: &str, error: NetError) {
        self.push(pattern, None, RuleResult::Error(error));
    }

    pub fn clear_rules(&self) {
        lock(&self.rules).clear();
    }

    fn push(&self, pattern: &str, family: Option<AddressFamily>, result: RuleResult) {
        lock(&self.rules).push(Rule { pattern: pattern.to_string(), family, result });
    }

    /// Number of `resolve` calls so far, including blocked ones.
    pub fn num_resolves(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Every `(host, family)` passed to `resolve`, in call order.
    pub fn resolved_hosts(&self) -> Vec<(String, AddressFamily)> {
        lock(&self.calls).clone()
    }

    /// While blocking, lookups wait until signaled.
    pub fn set_blocking(&self, blocking: bool) {
        lock(&self.gate).blocking = blocking;
        self.gate_cv.notify_all();
    }

    /// Release up to `count` waiting lookups.
    pub fn signal_multiple(&self, count: usize) {
        lock(&self.gate).permits += count;
        self.gate_cv.notify_all();
    }

    /// Release every waiting lookup and stop blocking.
    pub fn signal_all(&self) {
        self.set_blocking(false);
    }

    pub fn num_waiting(&self) -> usize {
        *self.waiting.borrow()
    }

    /// Wait until at least `count` lookups are blocked on the gate.
    pub async fn wait_for_waiters(&self, count: usize) {
        let mut rx = self.waiting.subscribe();
        let _ = rx.wait_for(|waiting| *waiting >= count).await;
    }

    fn wait_at_gate(&self) {
        let mut gate = lock(&self.gate);
        if !gate.blocking {
            return;
        }
        self.waiting.send_modify(|n| *n += 1);
        let deadline = std::time::Instant::now() + GATE_TIMEOUT;
        while gate.blocking && gate.permits == 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                tracing::warn!("gated lookup timed out");
                break;
            }
            gate = match self.gate_cv.wait_timeout(gate, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        if gate.blocking && gate.permits > 0 {
            gate.permits -= 1;
        }
        self.waiting.send_modify(|n| *n -= 1);
    }
}

impl HostResolverProc for RuleBasedHostResolverProc {
    fn resolve(
        &self,
        host: &str,
        family: AddressFamily,
        flags: HostResolverFlags,
    ) -> Result<AddressList, NetError> {
        lock(&self.calls).push((host.to_string(), family));
        self.wait_at_gate();

        let rule = lock(&self.rules)
            .iter()
            .find(|rule| {
                pattern_matches(&rule.pattern, host) && rule.family.map_or(true, |f| f == family)
            })
            .cloned();
        let Some(rule) = rule else {
            return Err(NetError::NameNotResolved);
        };
        match rule.result {
            RuleResult::Error(error) => Err(error),
            RuleResult::Addresses { ips, canonical_name } => {
                let mut list =
                    AddressList::from_ips(ips.into_iter().filter(|ip| family.matches(ip)), 0);
                let wants_name = flags.contains(HostResolverFlags::CANONNAME);
                if let Some(name) = canonical_name.filter(|_| wants_name) {
                    list.set_dns_aliases(vec![name]);
                }
                Ok(list)
            }
        }
    }
}

impl fmt::Debug for RuleBasedHostResolverProc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleBasedHostResolverProc")
            .field("rules", &lock(&self.rules).len())
            .field("calls", &self.num_resolves())
            .finish_non_exhaustive()
    }
}

/// Attempts numbered below `attempt_to_allow` hang until [`release`];
/// attempt `k` resolves to `10.0.0.k`.
///
/// [`release`]: AttemptGatedHostResolverProc::release
#[derive(Debug)]
pub struct AttemptGatedHostResolverProc {
    attempt_to_allow: usize,
    total: AtomicUsize,
    finished: AtomicUsize,
    released: Mutex<bool>,
    cv: Condvar,
}

impl AttemptGatedHostResolverProc {
    pub fn new(attempt_to_allow: usize) -> Self {
        Self {
            attempt_to_allow,
            total: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            released: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn release(&self) {
        *lock(&self.released) = true;
        self.cv.notify_all();
    }

    pub fn total_attempts(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn finished_attempts(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl HostResolverProc for AttemptGatedHostResolverProc {
    fn resolve(
        &self,
        _host: &str,
        _family: AddressFamily,
        _flags: HostResolverFlags,
    ) -> Result<AddressList, NetError> {
        let attempt = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < self.attempt_to_allow {
            let guard = lock(&self.released);
            let _released = self
                .cv
                .wait_timeout_while(guard, GATE_TIMEOUT, |released| !*released)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, attempt as u8));
        Ok(AddressList::from_ips([ip], 0))
    }
}

/// Scripted outcome of one mock transaction.
#[derive(Debug, Clone)]
pub enum MockDnsResult {
    Records(Vec<DnsRecord>),
    Response(DnsResponse),
    NxDomain,
    NoData,
    Timeout,
    ServerFailure,
    Malformed,
    Error(NetError),
}

impl MockDnsResult {
    fn into_outcome(self) -> Result<DnsResponse, NetError> {
        match self {
            MockDnsResult::Records(records) => Ok(DnsResponse::with_answers(records)),
            MockDnsResult::Response(response) => Ok(response),
            MockDnsResult::NxDomain => Ok(DnsResponse::nx_domain()),
            MockDnsResult::NoData => Ok(DnsResponse::no_data()),
            MockDnsResult::Timeout => Err(NetError::DnsTimedOut),
            MockDnsResult::ServerFailure => Ok(DnsResponse::with_rcode(ResponseCode::ServFail)),
            MockDnsResult::Malformed => Err(NetError::DnsMalformedResponse),
            MockDnsResult::Error(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone)]
struct MockRule {
    result: MockDnsResult,
    delay: bool,
}

type RuleKey = (String, DnsRecordType, Option<bool>);

/// Transaction factory answering from per-(host, type, secure) rules.
///
/// Hosts without a rule answer NXDOMAIN. Delayed rules hold the transaction
/// until the next [`complete_delayed_transactions`] call.
///
/// [`complete_delayed_transactions`]: MockDnsTransactionFactory::complete_delayed_transactions
pub struct MockDnsTransactionFactory {
    rules: Mutex<HashMap<RuleKey, MockRule>>,
    started: Mutex<Vec<(String, DnsRecordType, bool)>>,
    release: watch::Sender<u64>,
    delayed_pending: Arc<AtomicUsize>,
}

impl Default for MockDnsTransactionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDnsTransactionFactory {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            release: watch::Sender::new(0),
            delayed_pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Rule used for both secure and insecure transactions.
    pub fn add_rule(&self, host: &str, record_type: DnsRecordType, result: MockDnsResult) {
        self.insert((host.to_ascii_lowercase(), record_type, None), result, false);
    }

    /// Rule used only for transactions with the given `secure` flag.
    pub fn add_rule_for(
        &self,
        host: &str,
        record_type: DnsRecordType,
        secure: bool,
        result: MockDnsResult,
    ) {
        self.insert((host.to_ascii_lowercase(), record_type, Some(secure)), result, false);
    }

    pub fn add_delayed_rule(&self, host: &str, record_type: DnsRecordType, result: MockDnsResult) {
        self.insert((host.to_ascii_lowercase(), record_type, None), result, true);
    }

    fn insert(&self, key: RuleKey, result: MockDnsResult, delay: bool) {
        lock(&self.rules).insert(key, MockRule { result, delay });
    }

    /// Let every delayed transaction started so far complete.
    pub fn complete_delayed_transactions(&self) {
        self.release.send_modify(|generation| *generation += 1);
    }

    pub fn num_delayed_pending(&self) -> usize {
        self.delayed_pending.load(Ordering::SeqCst)
    }

    pub fn num_transactions(&self) -> usize {
        lock(&self.started).len()
    }

    /// Every `(host, type, secure)` transaction created, in order.
    pub fn transactions(&self) -> Vec<(String, DnsRecordType, bool)> {
        lock(&self.started).clone()
    }

    fn find_rule(&self, host: &str, record_type: DnsRecordType, secure: bool) -> Option<MockRule> {
        let rules = lock(&self.rules);
        let host = host.to_ascii_lowercase();
        rules
            .get(&(host.clone(), record_type, Some(secure)))
            .or_else(|| rules.get(&(host, record_type, None)))
            .cloned()
    }
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DnsTransactionFactory for MockDnsTransactionFactory {
    fn create_transaction(
        &self,
        _session: &Arc<DnsSession>,
        hostname: &str,
        record_type: DnsRecordType,
        secure: bool,
    ) -> DnsTransaction {
        lock(&self.started).push((hostname.to_string(), record_type, secure));
        let rule = self
            .find_rule(hostname, record_type, secure)
            .unwrap_or(MockRule { result: MockDnsResult::NxDomain, delay: false });

        if !rule.delay {
            return Box::pin(std::future::ready(rule.result.into_outcome()));
        }

        let mut rx = self.release.subscribe();
        let started_at = *rx.borrow();
        self.delayed_pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(Arc::clone(&self.delayed_pending));
        Box::pin(async move {
            let _guard = guard;
            if rx.wait_for(|generation| *generation > started_at).await.is_err() {
                return Err(NetError::Aborted);
            }
            rule.result.into_outcome()
        })
    }
}

impl fmt::Debug for MockDnsTransactionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDnsTransactionFactory")
            .field("rules", &lock(&self.rules).len())
            .field("transactions", &self.num_transactions())
            .finish_non_exhaustive()
    }
}

/// mDNS transport that records queries instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingMdnsTransport {
    queries: Mutex<Vec<(String, DnsRecordType)>>,
    fail_sends: Mutex<bool>,
}

impl RecordingMdnsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *lock(&self.fail_sends) = fail;
    }

    pub fn queries(&self) -> Vec<(String, DnsRecordType)> {
        lock(&self.queries).clone()
    }
}

impl MdnsTransport for RecordingMdnsTransport {
    fn send_query(&self, name: &str, record_type: DnsRecordType) -> Result<(), NetError> {
        if *lock(&self.fail_sends) {
            return Err(NetError::Failed);
        }
        lock(&self.queries).push((name.to_string(), record_type));
        Ok(())
    }
}
