//! Job bookkeeping: keys, task sequences and per-job state.
//!
//! Chromium mapping: net/dns/host_resolver_manager_job.cc
//!
//! A job is the deduplicated unit of work for one [`JobKey`]. At creation it
//! computes the ordered list of tasks it may run; a task failure that allows
//! fallback pops the next one. The orchestration itself lives in
//! `manager.rs`, which owns every job behind its state lock.

use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::dns::client::DnsClient;
use crate::dns::config::SecureDnsMode;
use crate::dns::dispatcher::QueueHandle;
use crate::dns::hostcache::{HostCacheEntry, HostCacheKey};
use crate::dns::request::RequestShared;
use crate::dns::resolve::{DnsQueryType, HostResolverFlags, HostResolverSource};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub(crate) type JobId = u64;

/// Identity of a job. At most one live job exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct JobKey {
    pub hostname: String,
    pub query_type: DnsQueryType,
    pub flags: HostResolverFlags,
    pub source: HostResolverSource,
    pub secure_dns_mode: SecureDnsMode,
}

impl JobKey {
    pub fn cache_key(&self, secure: bool) -> HostCacheKey {
        HostCacheKey::new(&self.hostname, self.query_type, self.flags, self.source)
            .with_secure(secure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskType {
    SecureDns,
    Dns,
    System,
    Mdns,
}

impl TaskType {
    pub fn is_dns(self) -> bool {
        matches!(self, TaskType::SecureDns | TaskType::Dns)
    }

    pub fn is_insecure_dns(self) -> bool {
        self == TaskType::Dns
    }
}

/// Entry in the dispatcher: a job's main slot or its second slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotRequest {
    Job(JobId),
    SecondSlot(JobId),
}

/// Counts attached requests per priority.
#[derive(Debug, Default)]
pub(crate) struct PriorityTracker {
    counts: [usize; RequestPriority::COUNT],
    total: usize,
}

impl PriorityTracker {
    pub fn add(&mut self, priority: RequestPriority) {
        self.counts[priority.index()] += 1;
        self.total += 1;
    }

    pub fn remove(&mut self, priority: RequestPriority) {
        let count = &mut self.counts[priority.index()];
        if *count > 0 {
            *count -= 1;
            self.total -= 1;
        }
    }

    pub fn highest(&self) -> RequestPriority {
        RequestPriority::ALL
            .iter()
            .rev()
            .copied()
            .find(|p| self.counts[p.index()] > 0)
            .unwrap_or(RequestPriority::Throttled)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

pub(crate) enum SecondSlot {
    None,
    Queued(QueueHandle, oneshot::Sender<()>),
    Held,
}

pub(crate) struct RunningTask {
    pub task_type: TaskType,
    pub seq: u64,
    pub handle: JoinHandle<()>,
}

pub(crate) enum JobPhase {
    Queued(QueueHandle),
    /// Holds a dispatcher slot; `task` is `None` only between tasks.
    Running { task: Option<RunningTask>, second_slot: SecondSlot },
}

pub(crate) struct Attachment {
    pub request: Arc<RequestShared>,
    pub priority: RequestPriority,
}

pub(crate) struct Job {
    pub id: JobId,
    pub key: JobKey,
    pub tasks: VecDeque<TaskType>,
    pub requests: Vec<Attachment>,
    pub priorities: PriorityTracker,
    pub phase: JobPhase,
    /// Failures of earlier tasks, written to the cache when the job completes.
    pub cache_drafts: Vec<(HostCacheKey, HostCacheEntry, Duration)>,
    /// Some attached request asked for the canonical name.
    pub canonical_name: bool,
}

impl Job {
    pub fn new(id: JobId, key: JobKey, tasks: VecDeque<TaskType>, phase: JobPhase) -> Self {
        Self {
            id,
            key,
            tasks,
            requests: Vec::new(),
            priorities: PriorityTracker::default(),
            phase,
            cache_drafts: Vec::new(),
            canonical_name: false,
        }
    }

    pub fn priority(&self) -> RequestPriority {
        self.priorities.highest()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, JobPhase::Running { task: Some(_), .. })
    }

    pub fn running_task_type(&self) -> Option<TaskType> {
        match &self.phase {
            JobPhase::Running { task: Some(task), .. } => Some(task.task_type),
            _ => None,
        }
    }

    /// Flags for system resolver attempts started from now on.
    pub fn system_flags(&self) -> HostResolverFlags {
        if self.canonical_name {
            self.key.flags | HostResolverFlags::CANONNAME
        } else {
            self.key.flags
        }
    }

    pub fn running_seq(&self) -> Option<u64> {
        match &self.phase {
            JobPhase::Running { task: Some(task), .. } => Some(task.seq),
            _ => None,
        }
    }

    pub fn attach(&mut self, request: Arc<RequestShared>, priority: RequestPriority) {
        self.canonical_name |= request.params().include_canonical_name;
        self.priorities.add(priority);
        self.requests.push(Attachment { request, priority });
    }

    /// Detach request `id`. Returns true if it was attached.
    pub fn detach(&mut self, id: u64) -> bool {
        let Some(pos) = self.requests.iter().position(|a| a.request.id() == id) else {
            return false;
        };
        let attachment = self.requests.remove(pos);
        self.priorities.remove(attachment.priority);
        true
    }

    pub fn change_request_priority(&mut self, id: u64, priority: RequestPriority) -> bool {
        let Some(attachment) = self.requests.iter_mut().find(|a| a.request.id() == id) else {
            return false;
        };
        self.priorities.remove(attachment.priority);
        self.priorities.add(priority);
        attachment.priority = priority;
        true
    }
}

/// Inputs to [`create_task_sequence`].
pub(crate) struct TaskPolicy<'a> {
    pub client: &'a DnsClient,
    pub has_mdns_client: bool,
    pub allow_fallback_to_system: bool,
    /// The creating request asked for the canonical name.
    pub include_canonical_name: bool,
}

pub(crate) fn resembles_multicast_dns_name(hostname: &str) -> bool {
    let trimmed = hostname.trim_end_matches('.');
    trimmed.len() > ".local".len() && trimmed.to_ascii_lowercase().ends_with(".local")
}

/// Ordered tasks a job for `key` may run.
///
/// An empty sequence is an error: `Failed` when the caller asked for the
/// built-in client (explicitly or via secure mode) and it is unusable,
/// `NameNotResolved` otherwise.
pub(crate) fn create_task_sequence(
    key: &JobKey,
    policy: &TaskPolicy<'_>,
) -> Result<VecDeque<TaskType>, NetError> {
    let mut tasks = VecDeque::new();
    let address = key.query_type.is_address_type();
    let client = policy.client;

    match key.source {
        HostResolverSource::System => {
            if !address {
                return Err(NetError::NameNotResolved);
            }
            tasks.push_back(TaskType::System);
        }
        HostResolverSource::MulticastDns => {
            if !policy.has_mdns_client {
                return Err(NetError::Failed);
            }
            tasks.push_back(TaskType::Mdns);
        }
        HostResolverSource::Dns => {
            let insecure_allowed = client.can_use_insecure_dns_transactions()
                && (address || client.can_query_additional_types_via_insecure_dns());
            push_dns_tasks(&mut tasks, key, policy, false, insecure_allowed);
            if tasks.is_empty() {
                return Err(NetError::Failed);
            }
        }
        HostResolverSource::Any => {
            if address
                && policy.include_canonical_name
                && key.secure_dns_mode != SecureDnsMode::Secure
            {
                tasks.push_back(TaskType::System);
            } else if resembles_multicast_dns_name(&key.hostname) {
                if policy.has_mdns_client {
                    tasks.push_back(TaskType::Mdns);
                } else if address {
                    tasks.push_back(TaskType::System);
                }
            } else {
                let system_allowed = address && key.secure_dns_mode != SecureDnsMode::Secure;
                let insecure_allowed = !client.fallback_from_insecure_transaction_preferred()
                    && (address || client.can_query_additional_types_via_insecure_dns());
                push_dns_tasks(&mut tasks, key, policy, system_allowed, insecure_allowed);
            }
            if tasks.is_empty() {
                return Err(if key.secure_dns_mode == SecureDnsMode::Secure {
                    NetError::Failed
                } else {
                    NetError::NameNotResolved
                });
            }
        }
        HostResolverSource::LocalOnly => return Err(NetError::DnsCacheMiss),
    }
    Ok(tasks)
}

fn push_dns_tasks(
    tasks: &mut VecDeque<TaskType>,
    key: &JobKey,
    policy: &TaskPolicy<'_>,
    system_allowed: bool,
    insecure_allowed: bool,
) {
    let client = policy.client;
    match key.secure_dns_mode {
        SecureDnsMode::Secure => {
            if client.can_use_secure_dns_transactions_in(SecureDnsMode::Secure) {
                tasks.push_back(TaskType::SecureDns);
            }
        }
        SecureDnsMode::Automatic => {
            if client.can_use_secure_dns_transactions_in(SecureDnsMode::Automatic) {
                tasks.push_back(TaskType::SecureDns);
            }
            if insecure_allowed {
                tasks.push_back(TaskType::Dns);
            }
        }
        SecureDnsMode::Off => {
            if insecure_allowed {
                tasks.push_back(TaskType::Dns);
            }
        }
    }
    if system_allowed && (tasks.is_empty() || policy.allow_fallback_to_system) {
        tasks.push_back(TaskType::System);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::config::{DnsConfig, DohServerConfig};
    use crate::dns::mock::MockDnsTransactionFactory;

    fn key(
        host: &str,
        query_type: DnsQueryType,
        source: HostResolverSource,
        mode: SecureDnsMode,
    ) -> JobKey {
        JobKey {
            hostname: host.to_string(),
            query_type,
            flags: HostResolverFlags::NONE,
            source,
            secure_dns_mode: mode,
        }
    }

    fn client(insecure: bool, doh: bool) -> DnsClient {
        let mut client = DnsClient::new(Arc::new(MockDnsTransactionFactory::new()), insecure, true);
        let mut config = DnsConfig::new(vec!["192.0.2.53:53".parse().unwrap()]);
        if doh {
            config.dns_over_https_servers =
                vec![DohServerConfig::new("https://doh.example/dns-query", true)];
        }
        client.set_system_config(Some(config));
        client
    }

    fn sequence(key: &JobKey, client: &DnsClient) -> Result<Vec<TaskType>, NetError> {
        let policy = TaskPolicy {
            client,
            has_mdns_client: false,
            allow_fallback_to_system: true,
            include_canonical_name: false,
        };
        create_task_sequence(key, &policy).map(Vec::from)
    }

    use TaskType::*;

    #[test]
    fn test_any_source_sequences() {
        let insecure = client(true, false);
        let k = key(
            "a.example",
            DnsQueryType::Unspecified,
            HostResolverSource::Any,
            SecureDnsMode::Off,
        );
        assert_eq!(sequence(&k, &insecure), Ok(vec![Dns, System]));

        let no_client = client(false, false);
        assert_eq!(sequence(&k, &no_client), Ok(vec![System]));

        let txt = key("a.example", DnsQueryType::Txt, HostResolverSource::Any, SecureDnsMode::Off);
        assert_eq!(sequence(&txt, &insecure), Ok(vec![Dns]));
        assert_eq!(sequence(&txt, &no_client), Err(NetError::NameNotResolved));
    }

    #[test]
    fn test_canonname_forces_system() {
        let insecure = client(true, false);
        let k = key("a.example", DnsQueryType::A, HostResolverSource::Any, SecureDnsMode::Off);
        let policy = TaskPolicy {
            client: &insecure,
            has_mdns_client: false,
            allow_fallback_to_system: true,
            include_canonical_name: true,
        };
        assert_eq!(create_task_sequence(&k, &policy).map(Vec::from), Ok(vec![System]));
    }

    #[test]
    fn test_secure_modes() {
        let mut doh = client(true, true);
        let automatic = key(
            "a.example",
            DnsQueryType::Unspecified,
            HostResolverSource::Any,
            SecureDnsMode::Automatic,
        );
        // No DoH server marked available: automatic mode skips secure transactions.
        assert_eq!(sequence(&automatic, &doh), Ok(vec![Dns, System]));
        doh.set_doh_server_available(0, true);
        assert_eq!(sequence(&automatic, &doh), Ok(vec![SecureDns, Dns, System]));

        let secure = key(
            "a.example",
            DnsQueryType::Unspecified,
            HostResolverSource::Any,
            SecureDnsMode::Secure,
        );
        assert_eq!(sequence(&secure, &doh), Ok(vec![SecureDns]));
        assert_eq!(sequence(&secure, &client(true, false)), Err(NetError::Failed));
    }

    #[test]
    fn test_explicit_sources() {
        let insecure = client(true, false);
        let dns = key("a.example", DnsQueryType::A, HostResolverSource::Dns, SecureDnsMode::Off);
        assert_eq!(sequence(&dns, &insecure), Ok(vec![Dns]));
        assert_eq!(sequence(&dns, &client(false, false)), Err(NetError::Failed));

        let system = key(
            "a.example",
            DnsQueryType::Aaaa,
            HostResolverSource::System,
            SecureDnsMode::Off,
        );
        assert_eq!(sequence(&system, &insecure), Ok(vec![System]));
        let system_txt = key(
            "a.example",
            DnsQueryType::Txt,
            HostResolverSource::System,
            SecureDnsMode::Off,
        );
        assert_eq!(sequence(&system_txt, &insecure), Err(NetError::NameNotResolved));
    }

    #[test]
    fn test_auto_disabled_client_skips_insecure_for_any_only() {
        let mut c = client(true, false);
        for _ in 0..crate::dns::client::MAX_INSECURE_FALLBACK_FAILURES {
            c.increment_insecure_fallback_failures();
        }
        let any = key(
            "a.example",
            DnsQueryType::Unspecified,
            HostResolverSource::Any,
            SecureDnsMode::Off,
        );
        assert_eq!(sequence(&any, &c), Ok(vec![System]));
        let dns = key(
            "a.example",
            DnsQueryType::Unspecified,
            HostResolverSource::Dns,
            SecureDnsMode::Off,
        );
        assert_eq!(sequence(&dns, &c), Ok(vec![Dns]));
    }

    #[test]
    fn test_local_names() {
        let insecure = client(true, false);
        let k = key("printer.local", DnsQueryType::A, HostResolverSource::Any, SecureDnsMode::Off);
        assert_eq!(sequence(&k, &insecure), Ok(vec![System]));
        let policy = TaskPolicy {
            client: &insecure,
            has_mdns_client: true,
            allow_fallback_to_system: true,
            include_canonical_name: false,
        };
        assert_eq!(create_task_sequence(&k, &policy).map(Vec::from), Ok(vec![Mdns]));
        assert!(!resembles_multicast_dns_name("local"));
        assert!(resembles_multicast_dns_name("Printer.LOCAL."));
    }

    #[test]
    fn test_priority_tracker() {
        let mut tracker = PriorityTracker::default();
        assert_eq!(tracker.highest(), RequestPriority::Throttled);
        tracker.add(RequestPriority::Low);
        tracker.add(RequestPriority::Highest);
        assert_eq!(tracker.highest(), RequestPriority::Highest);
        tracker.remove(RequestPriority::Highest);
        assert_eq!(tracker.highest(), RequestPriority::Low);
        assert_eq!(tracker.total(), 1);
    }
}
