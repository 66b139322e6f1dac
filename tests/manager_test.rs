//! Host resolver manager integration tests.
//!
//! Covers:
//! - Local answers (IP literals, localhost, invalid names)
//! - System resolution, job deduplication, cancellation
//! - Dispatcher priorities, queue eviction, limits
//! - Host cache usage modes and network changes
//! - Built-in DNS client tasks, fallback and auto-disable
//! - Secure mode, hosts file, config overrides, shutdown

use chromedns::base::loadstate::LoadState;
use chromedns::base::neterror::NetError;
use chromedns::base::priority::RequestPriority;
use chromedns::dns::mock::{MockDnsResult, MockDnsTransactionFactory, RuleBasedHostResolverProc};
use chromedns::dns::{
    AddressFamily, CacheUsage, DnsConfig, DnsConfigOverrides, DnsQueryType, DnsRecord,
    DnsRecordType, DohServerConfig, HostPortPair, HostResolverManager, HostResolverSource, Limits,
    ManagerOptions, NetworkChangeNotifier, ResolveHostParameters, ResolveHostRequest, SecureDnsMode,
    StartOutcome, MAX_INSECURE_FALLBACK_FAILURES,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const NAMESERVER: &str = "192.0.2.53:53";
const RECORD_TTL: Duration = Duration::from_secs(60);

struct Harness {
    manager: HostResolverManager,
    proc: Arc<RuleBasedHostResolverProc>,
    factory: Arc<MockDnsTransactionFactory>,
    notifier: NetworkChangeNotifier,
}

impl Harness {
    fn new(options: ManagerOptions) -> Self {
        let proc = Arc::new(RuleBasedHostResolverProc::new());
        let factory = Arc::new(MockDnsTransactionFactory::new());
        let manager = HostResolverManager::builder()
            .options(options)
            .resolver_proc(proc.clone())
            .transaction_factory(factory.clone())
            .build();
        let notifier = NetworkChangeNotifier::new();
        manager.observe_network_changes(&notifier);
        Self { manager, proc, factory, notifier }
    }

    /// Manager with an insecure-capable DNS client configured.
    fn with_dns_client() -> Self {
        let harness = Self::new(dns_client_options());
        harness.notifier.set_dns_config(Some(dns_config()));
        harness
    }

    fn request(&self, host: &str, port: u16) -> ResolveHostRequest {
        self.manager.create_request(HostPortPair::new(host, port), ResolveHostParameters::default())
    }

    fn request_with(
        &self,
        host: &str,
        port: u16,
        params: ResolveHostParameters,
    ) -> ResolveHostRequest {
        self.manager.create_request(HostPortPair::new(host, port), params)
    }
}

fn dns_client_options() -> ManagerOptions {
    ManagerOptions { insecure_dns_client_enabled: true, ..Default::default() }
}

fn dns_config() -> DnsConfig {
    DnsConfig::new(vec![NAMESERVER.parse().unwrap()])
}

fn with_priority(priority: RequestPriority) -> ResolveHostParameters {
    ResolveHostParameters { initial_priority: priority, ..Default::default() }
}

/// Start `request`, asserting it does not complete synchronously.
fn start_pending(request: &mut ResolveHostRequest) -> oneshot::Receiver<Result<(), NetError>> {
    let (tx, rx) = oneshot::channel();
    let outcome = request.start(move |result| {
        let _ = tx.send(result);
    });
    assert_eq!(outcome, StartOutcome::Pending);
    rx
}

fn start_sync(request: &mut ResolveHostRequest) -> StartOutcome {
    request.start(|_| panic!("synchronous completion must not invoke the callback"))
}

fn endpoints(request: &ResolveHostRequest) -> Vec<SocketAddr> {
    request.address_results().expect("address results").endpoints().to_vec()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

fn records(record: DnsRecord) -> MockDnsResult {
    MockDnsResult::Records(vec![record])
}

// ============================================================================
// Local answers
// ============================================================================

#[tokio::test]
async fn test_ip_literal_completes_synchronously() {
    let h = Harness::new(ManagerOptions::default());

    let mut request = h.request("192.0.2.1", 80);
    assert_eq!(start_sync(&mut request), StartOutcome::Complete(Ok(())));
    assert_eq!(endpoints(&request), vec!["192.0.2.1:80".parse::<SocketAddr>().unwrap()]);

    let mut v6 = h.request("[::1]", 443);
    assert_eq!(start_sync(&mut v6), StartOutcome::Complete(Ok(())));
    assert_eq!(endpoints(&v6)[0].ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));

    let mut mismatch = h.request_with(
        "::1",
        80,
        ResolveHostParameters { query_type: DnsQueryType::A, ..Default::default() },
    );
    assert_eq!(start_sync(&mut mismatch), StartOutcome::Complete(Err(NetError::NameNotResolved)));
    assert_eq!(h.proc.num_resolves(), 0);
}

#[tokio::test]
async fn test_invalid_hostname_fails_synchronously() {
    let h = Harness::new(ManagerOptions::default());
    for host in ["", "a..b", ".leading.dot"] {
        let mut request = h.request(host, 80);
        assert_eq!(
            start_sync(&mut request),
            StartOutcome::Complete(Err(NetError::NameNotResolved))
        );
        assert_eq!(request.error(), Some(NetError::NameNotResolved));
    }
    assert_eq!(h.manager.num_jobs(), 0);
}

#[tokio::test]
async fn test_localhost_names() {
    let h = Harness::new(ManagerOptions::default());
    let mut request = h.request("localhost", 80);
    assert_eq!(start_sync(&mut request), StartOutcome::Complete(Ok(())));
    let ips: Vec<IpAddr> = endpoints(&request).iter().map(SocketAddr::ip).collect();
    assert_eq!(ips, vec![IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::LOCALHOST)]);

    let mut sub = h.request_with(
        "foo.localhost",
        80,
        ResolveHostParameters { query_type: DnsQueryType::A, ..Default::default() },
    );
    assert_eq!(start_sync(&mut sub), StartOutcome::Complete(Ok(())));
    assert_eq!(endpoints(&sub)[0].ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
}

#[tokio::test]
async fn test_start_twice_fails() {
    let h = Harness::new(ManagerOptions::default());
    let mut request = h.request("192.0.2.1", 80);
    assert_eq!(start_sync(&mut request), StartOutcome::Complete(Ok(())));
    assert_eq!(start_sync(&mut request), StartOutcome::Complete(Err(NetError::Failed)));
}

// ============================================================================
// System resolution and jobs
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_system_resolution_populates_cache() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule("just.testing", "192.168.1.42");

    let mut request = h.request("just.testing", 80);
    assert_eq!(request.resolve().await, Ok(()));
    assert_eq!(endpoints(&request), vec!["192.168.1.42:80".parse::<SocketAddr>().unwrap()]);
    assert!(request.stale_info().is_none());
    assert_eq!(request.load_state(), LoadState::Idle);

    let mut cached = h.request("just.testing", 443);
    assert_eq!(start_sync(&mut cached), StartOutcome::Complete(Ok(())));
    assert_eq!(endpoints(&cached), vec!["192.168.1.42:443".parse::<SocketAddr>().unwrap()]);
    assert!(!cached.stale_info().unwrap().is_stale());
    assert_eq!(h.proc.num_resolves(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_system_failure_not_cached() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_simulated_failure("broken.test");

    let mut request = h.request("broken.test", 80);
    assert_eq!(request.resolve().await, Err(NetError::NameNotResolved));
    assert!(request.address_results().is_none());
    assert_eq!(h.manager.host_cache().len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requests_for_same_key_share_one_job() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule("*", "192.0.2.10");
    h.proc.set_blocking(true);

    let mut a1 = h.request("a.test", 80);
    let mut a2 = h.request("A.TEST", 81);
    let mut a3 = h.request("a.test", 82);
    let mut b = h.request("b.test", 80);
    let rx = [
        start_pending(&mut a1),
        start_pending(&mut a2),
        start_pending(&mut a3),
        start_pending(&mut b),
    ];

    h.proc.wait_for_waiters(2).await;
    assert_eq!(h.manager.num_jobs(), 2);
    assert_eq!(h.proc.num_resolves(), 2);
    assert_eq!(a1.load_state(), LoadState::ResolvingHost);

    h.proc.signal_all();
    for receiver in rx {
        assert_eq!(receiver.await.unwrap(), Ok(()));
    }
    assert_eq!(endpoints(&a2)[0].port(), 81);
    assert_eq!(h.manager.num_jobs(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_canonical_name_request_shares_job() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule_with_canonical_name("canon.test", "192.0.2.18", "canonical.test");
    h.proc.set_blocking(true);

    let mut plain = h.request("canon.test", 80);
    let mut canon = h.request_with(
        "canon.test",
        80,
        ResolveHostParameters { include_canonical_name: true, ..Default::default() },
    );
    let rx_plain = start_pending(&mut plain);
    let rx_canon = start_pending(&mut canon);

    h.proc.wait_for_waiters(1).await;
    assert_eq!(h.manager.num_jobs(), 1);
    assert_eq!(h.proc.num_resolves(), 1);

    h.proc.signal_all();
    assert_eq!(rx_plain.await.unwrap(), Ok(()));
    assert_eq!(rx_canon.await.unwrap(), Ok(()));
    assert_eq!(endpoints(&canon), endpoints(&plain));
    assert_eq!(h.proc.num_resolves(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_request_never_called_back() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule("*", "192.0.2.11");
    h.proc.set_blocking(true);

    let mut first = h.request("shared.test", 80);
    let mut second = h.request("shared.test", 80);
    let rx1 = start_pending(&mut first);
    let rx2 = start_pending(&mut second);
    h.proc.wait_for_waiters(1).await;

    first.cancel();
    assert!(!first.is_complete());
    h.proc.signal_all();

    assert_eq!(rx2.await.unwrap(), Ok(()));
    assert!(rx1.await.is_err());
    assert!(first.address_results().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callback_cancels_and_starts_requests() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule("*", "192.0.2.19");
    h.proc.set_blocking(true);

    let slot: Arc<Mutex<Option<ResolveHostRequest>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = oneshot::channel();
    let mut first = h.request("shared.test", 80);
    let outcome = {
        let slot = slot.clone();
        let manager = h.manager.clone();
        first.start(move |result| {
            let mut sibling = slot.lock().unwrap().take().expect("sibling stored");
            sibling.cancel();
            let follow_host = HostPortPair::new("follow.test", 80);
            let mut follow_up =
                manager.create_request(follow_host, ResolveHostParameters::default());
            let (follow_tx, follow_rx) = oneshot::channel();
            let follow_outcome = follow_up.start(move |r| {
                let _ = follow_tx.send(r);
            });
            let _ = tx.send((result, sibling, follow_up, follow_outcome, follow_rx));
        })
    };
    assert_eq!(outcome, StartOutcome::Pending);

    let mut sibling = h.request("shared.test", 81);
    let rx_sibling = start_pending(&mut sibling);
    *slot.lock().unwrap() = Some(sibling);
    h.proc.wait_for_waiters(1).await;
    assert_eq!(h.manager.num_jobs(), 1);
    h.proc.signal_all();

    let (result, sibling, follow_up, follow_outcome, follow_rx) = rx.await.unwrap();
    assert_eq!(result, Ok(()));
    assert!(!sibling.is_complete());
    assert!(rx_sibling.await.is_err());
    assert_eq!(follow_outcome, StartOutcome::Pending);
    assert_eq!(follow_rx.await.unwrap(), Ok(()));
    assert_eq!(endpoints(&follow_up)[0].ip(), IpAddr::V4(v4(192, 0, 2, 19)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelling_last_request_frees_slot() {
    let h = Harness::new(ManagerOptions { max_concurrent_resolves: 1, ..Default::default() });
    h.proc.add_rule("*", "192.0.2.12");
    h.proc.set_blocking(true);

    let mut running = h.request("running.test", 80);
    let mut queued = h.request("queued.test", 80);
    let _rx_running = start_pending(&mut running);
    let rx_queued = start_pending(&mut queued);
    h.proc.wait_for_waiters(1).await;
    assert_eq!(h.manager.num_running_jobs(), 1);
    assert_eq!(h.manager.num_queued_jobs(), 1);
    assert_eq!(queued.load_state(), LoadState::Idle);

    drop(running);
    assert_eq!(h.manager.num_jobs(), 1);
    assert_eq!(h.manager.num_running_jobs(), 1);

    // The abandoned lookup keeps its thread until released.
    h.proc.wait_for_waiters(2).await;
    h.proc.signal_all();
    assert_eq!(rx_queued.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queued_jobs_run_in_priority_order() {
    let h = Harness::new(ManagerOptions { max_concurrent_resolves: 1, ..Default::default() });
    h.proc.add_rule("*", "192.0.2.13");
    h.proc.set_blocking(true);

    let mut first = h.request_with("first.test", 80, with_priority(RequestPriority::Lowest));
    let rx_first = start_pending(&mut first);
    h.proc.wait_for_waiters(1).await;

    let mut low = h.request_with("low.test", 80, with_priority(RequestPriority::Low));
    let mut medium = h.request_with("medium.test", 80, with_priority(RequestPriority::Medium));
    let mut bumped = h.request_with("bumped.test", 80, with_priority(RequestPriority::Lowest));
    let mut highest = h.request_with("highest.test", 80, with_priority(RequestPriority::Highest));
    let rx = [
        start_pending(&mut low),
        start_pending(&mut medium),
        start_pending(&mut bumped),
        start_pending(&mut highest),
    ];
    bumped.change_request_priority(RequestPriority::Highest);
    assert_eq!(bumped.priority(), RequestPriority::Highest);
    assert_eq!(h.manager.num_queued_jobs(), 4);

    h.proc.signal_all();
    assert_eq!(rx_first.await.unwrap(), Ok(()));
    for receiver in rx {
        assert_eq!(receiver.await.unwrap(), Ok(()));
    }

    let order: Vec<String> = h.proc.resolved_hosts().into_iter().map(|(host, _)| host).collect();
    assert_eq!(order, vec!["first.test", "highest.test", "bumped.test", "medium.test", "low.test"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_overflow_evicts_oldest_lowest() {
    let h = Harness::new(ManagerOptions {
        max_concurrent_resolves: 1,
        max_queued_jobs: 2,
        ..Default::default()
    });
    h.proc.add_rule("*", "192.0.2.14");
    h.proc.set_blocking(true);

    let mut running = h.request_with("running.test", 80, with_priority(RequestPriority::Highest));
    let rx_running = start_pending(&mut running);
    h.proc.wait_for_waiters(1).await;

    let mut low = h.request_with("low.test", 80, with_priority(RequestPriority::Low));
    let mut medium = h.request_with("medium.test", 80, with_priority(RequestPriority::Medium));
    let rx_low = start_pending(&mut low);
    let rx_medium = start_pending(&mut medium);

    let mut high = h.request_with("high.test", 80, with_priority(RequestPriority::Highest));
    let rx_high = start_pending(&mut high);
    assert_eq!(rx_low.await.unwrap(), Err(NetError::HostResolverQueueTooLarge));
    assert_eq!(low.error(), Some(NetError::HostResolverQueueTooLarge));

    // A newcomer that is itself the lowest is evicted synchronously.
    let mut lowest = h.request_with("lowest.test", 80, with_priority(RequestPriority::Lowest));
    assert_eq!(
        start_sync(&mut lowest),
        StartOutcome::Complete(Err(NetError::HostResolverQueueTooLarge))
    );

    h.proc.signal_all();
    assert_eq!(rx_running.await.unwrap(), Ok(()));
    assert_eq!(rx_high.await.unwrap(), Ok(()));
    assert_eq!(rx_medium.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_queue_evicts_newcomer() {
    let h = Harness::new(ManagerOptions {
        max_concurrent_resolves: 1,
        max_queued_jobs: 0,
        ..Default::default()
    });
    h.proc.add_rule("*", "192.0.2.20");
    h.proc.set_blocking(true);

    let mut running = h.request("running.test", 80);
    let rx_running = start_pending(&mut running);
    h.proc.wait_for_waiters(1).await;

    let mut newcomer = h.request_with("newcomer.test", 80, with_priority(RequestPriority::Highest));
    assert_eq!(
        start_sync(&mut newcomer),
        StartOutcome::Complete(Err(NetError::HostResolverQueueTooLarge))
    );
    assert_eq!(h.manager.num_jobs(), 1);
    assert_eq!(h.manager.num_queued_jobs(), 0);

    h.proc.signal_all();
    assert_eq!(rx_running.await.unwrap(), Ok(()));
    assert_eq!(h.proc.num_resolves(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lowering_queue_limit_evicts_excess_jobs() {
    let h = Harness::new(ManagerOptions { max_concurrent_resolves: 1, ..Default::default() });
    h.proc.add_rule("*", "192.0.2.21");
    h.proc.set_blocking(true);

    let mut running = h.request("running.test", 80);
    let rx_running = start_pending(&mut running);
    h.proc.wait_for_waiters(1).await;

    let mut low = h.request_with("low.test", 80, with_priority(RequestPriority::Low));
    let mut medium = h.request_with("medium.test", 80, with_priority(RequestPriority::Medium));
    let mut high = h.request_with("high.test", 80, with_priority(RequestPriority::Highest));
    let rx_low = start_pending(&mut low);
    let rx_medium = start_pending(&mut medium);
    let rx_high = start_pending(&mut high);
    assert_eq!(h.manager.num_queued_jobs(), 3);

    h.manager.set_max_queued_jobs(1);
    assert_eq!(rx_low.await.unwrap(), Err(NetError::HostResolverQueueTooLarge));
    assert_eq!(rx_medium.await.unwrap(), Err(NetError::HostResolverQueueTooLarge));
    assert_eq!(h.manager.num_queued_jobs(), 1);

    h.proc.signal_all();
    assert_eq!(rx_running.await.unwrap(), Ok(()));
    assert_eq!(rx_high.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_raising_limits_starts_queued_jobs() {
    let h = Harness::new(ManagerOptions { max_concurrent_resolves: 1, ..Default::default() });
    h.proc.add_rule("*", "192.0.2.15");
    h.proc.set_blocking(true);

    let mut a = h.request("a.test", 80);
    let mut b = h.request("b.test", 80);
    let rx_a = start_pending(&mut a);
    let rx_b = start_pending(&mut b);
    h.proc.wait_for_waiters(1).await;
    assert_eq!(h.manager.num_queued_jobs(), 1);

    h.manager.set_dispatcher_limits(Limits::new(2));
    assert_eq!(h.manager.dispatcher_limits().total_jobs, 2);
    h.proc.wait_for_waiters(2).await;
    assert_eq!(h.manager.num_running_jobs(), 2);

    h.proc.signal_all();
    assert_eq!(rx_a.await.unwrap(), Ok(()));
    assert_eq!(rx_b.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_options_reach_system_resolver() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule_with_canonical_name("canon.test", "192.0.2.16", "canonical.test");
    h.proc.add_rule("*", "192.0.2.17");

    let mut canon = h.request_with(
        "canon.test",
        80,
        ResolveHostParameters { include_canonical_name: true, ..Default::default() },
    );
    assert_eq!(canon.resolve().await, Ok(()));
    assert_eq!(canon.dns_alias_results(), Some(vec!["canonical.test".to_string()]));

    h.manager.set_ipv6_reachable(false);
    let mut narrowed = h.request("narrowed.test", 80);
    assert_eq!(narrowed.resolve().await, Ok(()));
    assert_eq!(h.proc.resolved_hosts().last().unwrap().1, AddressFamily::Ipv4);

    let mut speculative = h.request_with(
        "speculative.test",
        80,
        ResolveHostParameters { is_speculative: true, ..Default::default() },
    );
    assert_eq!(speculative.resolve().await, Ok(()));
    assert!(speculative.address_results().is_none());
}

// ============================================================================
// Cache usage and network changes
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_local_only_and_disallowed_cache() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule("*", "192.0.2.20");
    let local_only =
        || ResolveHostParameters { source: HostResolverSource::LocalOnly, ..Default::default() };

    let mut miss = h.request_with("cached.test", 80, local_only());
    assert_eq!(start_sync(&mut miss), StartOutcome::Complete(Err(NetError::DnsCacheMiss)));

    let mut warm = h.request("cached.test", 80);
    assert_eq!(warm.resolve().await, Ok(()));

    let mut hit = h.request_with("cached.test", 80, local_only());
    assert_eq!(start_sync(&mut hit), StartOutcome::Complete(Ok(())));

    let mut bypass = h.request_with(
        "cached.test",
        80,
        ResolveHostParameters { cache_usage: CacheUsage::Disallowed, ..Default::default() },
    );
    assert_eq!(bypass.resolve().await, Ok(()));
    assert_eq!(h.proc.num_resolves(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_network_change_makes_cache_stale() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule("*", "192.0.2.21");

    let mut warm = h.request("stale.test", 80);
    assert_eq!(warm.resolve().await, Ok(()));
    h.notifier.notify_ip_address_changed();

    let mut stale = h.request_with(
        "stale.test",
        80,
        ResolveHostParameters { cache_usage: CacheUsage::StaleAllowed, ..Default::default() },
    );
    assert_eq!(start_sync(&mut stale), StartOutcome::Complete(Ok(())));
    let info = stale.stale_info().unwrap();
    assert!(info.is_stale());
    assert_eq!(info.network_changes, 1);

    let mut fresh = h.request("stale.test", 80);
    assert_eq!(fresh.resolve().await, Ok(()));
    assert_eq!(h.proc.num_resolves(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ip_change_aborts_jobs() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.add_rule("*", "192.0.2.22");
    h.proc.set_blocking(true);

    let mut request = h.request("aborted.test", 80);
    let rx = start_pending(&mut request);
    h.proc.wait_for_waiters(1).await;

    h.notifier.notify_ip_address_changed();
    assert_eq!(rx.await.unwrap(), Err(NetError::NetworkChanged));
    assert_eq!(h.manager.num_jobs(), 0);
    h.proc.signal_all();

    // Dispatcher limits survive the abort.
    let mut after = h.request("after.test", 80);
    assert_eq!(after.resolve().await, Ok(()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initial_config_read_serves_jobs_from_hosts() {
    let h = Harness::new(ManagerOptions::default());
    h.proc.set_blocking(true);

    let mut request = h.request("hosted.test", 80);
    let rx = start_pending(&mut request);
    h.proc.wait_for_waiters(1).await;

    let mut config = dns_config();
    config.hosts.insert("hosted.test", IpAddr::V4(v4(192, 0, 2, 77)));
    h.notifier.set_dns_config(Some(config));

    assert_eq!(rx.await.unwrap(), Ok(()));
    assert_eq!(endpoints(&request)[0].ip(), IpAddr::V4(v4(192, 0, 2, 77)));
    h.proc.signal_all();

    let mut again = h.request("hosted.test", 80);
    assert_eq!(start_sync(&mut again), StartOutcome::Complete(Ok(())));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_later_config_change_aborts_jobs() {
    let h = Harness::new(ManagerOptions::default());
    h.notifier.set_dns_config(Some(dns_config()));
    h.proc.set_blocking(true);

    let mut request = h.request("changing.test", 80);
    let rx = start_pending(&mut request);
    h.proc.wait_for_waiters(1).await;

    h.notifier.set_dns_config(Some(DnsConfig::new(vec!["198.51.100.53:53".parse().unwrap()])));
    assert_eq!(rx.await.unwrap(), Err(NetError::NetworkChanged));
    h.proc.signal_all();
}

// ============================================================================
// Built-in DNS client
// ============================================================================

#[tokio::test]
async fn test_dns_task_merges_ipv6_first() {
    let h = Harness::with_dns_client();
    h.factory.add_rule(
        "ok",
        DnsRecordType::A,
        records(DnsRecord::a("ok", v4(127, 0, 0, 1), RECORD_TTL)),
    );
    h.factory.add_rule(
        "ok",
        DnsRecordType::Aaaa,
        records(DnsRecord::aaaa("ok", Ipv6Addr::LOCALHOST, RECORD_TTL)),
    );

    let mut request = h.request("ok", 80);
    assert_eq!(request.resolve().await, Ok(()));
    assert_eq!(
        endpoints(&request),
        vec![
            "[::1]:80".parse::<SocketAddr>().unwrap(),
            "127.0.0.1:80".parse::<SocketAddr>().unwrap()
        ]
    );
    assert_eq!(h.factory.num_transactions(), 2);
    assert_eq!(h.proc.num_resolves(), 0);
    assert_eq!(h.manager.host_cache().len(), 1);
}

#[tokio::test]
async fn test_dns_task_with_single_dispatcher_slot() {
    let h = Harness::new(ManagerOptions {
        insecure_dns_client_enabled: true,
        max_concurrent_resolves: 1,
        ..Default::default()
    });
    h.notifier.set_dns_config(Some(dns_config()));
    h.factory.add_rule(
        "slot.test",
        DnsRecordType::Aaaa,
        records(DnsRecord::aaaa("slot.test", Ipv6Addr::LOCALHOST, RECORD_TTL)),
    );

    let mut request = h.request("slot.test", 80);
    assert_eq!(request.resolve().await, Ok(()));
    assert_eq!(h.factory.num_transactions(), 2);
    assert_eq!(endpoints(&request).len(), 1);

    // Both slots were returned: another job can run.
    assert_eq!(h.manager.num_jobs(), 0);
    let mut next = h.request_with(
        "slot.test",
        80,
        ResolveHostParameters { cache_usage: CacheUsage::Disallowed, ..Default::default() },
    );
    assert_eq!(next.resolve().await, Ok(()));
    assert_eq!(h.factory.num_transactions(), 4);
}

#[tokio::test]
async fn test_dns_txt_query() {
    let h = Harness::with_dns_client();
    h.factory.add_rule(
        "txt.test",
        DnsRecordType::Txt,
        records(DnsRecord::txt(
            "txt.test",
            vec!["v=spf1".to_string(), "hello".to_string()],
            RECORD_TTL,
        )),
    );
    let mut request = h.request_with(
        "txt.test",
        80,
        ResolveHostParameters { query_type: DnsQueryType::Txt, ..Default::default() },
    );
    assert_eq!(request.resolve().await, Ok(()));
    assert_eq!(request.text_results(), Some(vec!["v=spf1".to_string(), "hello".to_string()]));
    assert!(request.address_results().is_none());
}

#[tokio::test]
async fn test_nxdomain_is_negatively_cached() {
    let h = Harness::with_dns_client();
    let dns_only =
        || ResolveHostParameters { source: HostResolverSource::Dns, ..Default::default() };

    let mut request = h.request_with("missing.test", 80, dns_only());
    assert_eq!(request.resolve().await, Err(NetError::NameNotResolved));
    let transactions = h.factory.num_transactions();

    let mut cached = h.request_with("missing.test", 80, dns_only());
    assert_eq!(start_sync(&mut cached), StartOutcome::Complete(Err(NetError::NameNotResolved)));
    assert_eq!(h.factory.num_transactions(), transactions);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dns_failure_falls_back_to_system() {
    let h = Harness::with_dns_client();
    h.proc.add_rule("fallback.test", "192.0.2.30");

    let mut request = h.request("fallback.test", 80);
    assert_eq!(request.resolve().await, Ok(()));
    assert_eq!(endpoints(&request)[0].ip(), IpAddr::V4(v4(192, 0, 2, 30)));
    assert_eq!(h.factory.num_transactions(), 2);
    assert_eq!(h.proc.num_resolves(), 1);
    assert_eq!(h.manager.insecure_fallback_failures(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_icann_name_collision_does_not_fall_back() {
    let h = Harness::with_dns_client();
    h.proc.add_rule("*", "192.0.2.31");
    h.factory.add_rule(
        "collision.test",
        DnsRecordType::A,
        records(DnsRecord::a("collision.test", v4(127, 0, 53, 53), RECORD_TTL)),
    );

    let mut request = h.request_with(
        "collision.test",
        80,
        ResolveHostParameters { query_type: DnsQueryType::A, ..Default::default() },
    );
    assert_eq!(request.resolve().await, Err(NetError::IcannNameCollision));
    assert_eq!(h.proc.num_resolves(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_insecure_client_disabled_after_consecutive_failures() {
    let h = Harness::with_dns_client();
    h.proc.add_rule("*", "192.0.2.32");

    for i in 0..MAX_INSECURE_FALLBACK_FAILURES {
        let mut request = h.request(&format!("fail{}.test", i), 80);
        assert_eq!(request.resolve().await, Ok(()));
    }
    assert_eq!(h.manager.insecure_fallback_failures(), MAX_INSECURE_FALLBACK_FAILURES);
    let transactions = h.factory.num_transactions();

    let mut request = h.request("after.test", 80);
    assert_eq!(request.resolve().await, Ok(()));
    assert_eq!(h.factory.num_transactions(), transactions);

    // Explicit DNS-source requests still use the client.
    let mut explicit = h.request_with(
        "explicit.test",
        80,
        ResolveHostParameters { source: HostResolverSource::Dns, ..Default::default() },
    );
    assert_eq!(explicit.resolve().await, Err(NetError::NameNotResolved));
    assert!(h.factory.num_transactions() > transactions);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dns_success_clears_failure_count() {
    let h = Harness::with_dns_client();
    h.proc.add_rule("*", "192.0.2.33");
    h.factory.add_rule(
        "good.test",
        DnsRecordType::A,
        records(DnsRecord::a("good.test", v4(192, 0, 2, 34), RECORD_TTL)),
    );

    for host in ["bad1.test", "bad2.test"] {
        let mut request = h.request(host, 80);
        assert_eq!(request.resolve().await, Ok(()));
    }
    assert_eq!(h.manager.insecure_fallback_failures(), 2);

    let mut good = h.request("good.test", 80);
    assert_eq!(good.resolve().await, Ok(()));
    assert_eq!(h.manager.insecure_fallback_failures(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabling_client_moves_running_tasks_to_fallback() {
    let h = Harness::with_dns_client();
    h.proc.add_rule("slow.test", "192.0.2.35");
    for record_type in [DnsRecordType::A, DnsRecordType::Aaaa] {
        h.factory.add_delayed_rule("slow.test", record_type, MockDnsResult::NoData);
        h.factory.add_delayed_rule("slow-dns.test", record_type, MockDnsResult::NoData);
    }

    let mut with_fallback = h.request("slow.test", 80);
    let mut dns_only = h.request_with(
        "slow-dns.test",
        80,
        ResolveHostParameters { source: HostResolverSource::Dns, ..Default::default() },
    );
    let rx_fallback = start_pending(&mut with_fallback);
    let rx_dns = start_pending(&mut dns_only);
    let factory = h.factory.clone();
    wait_until(move || factory.num_delayed_pending() >= 2).await;

    h.manager.set_insecure_dns_client_enabled(false, true);
    assert_eq!(rx_dns.await.unwrap(), Err(NetError::Failed));
    assert_eq!(rx_fallback.await.unwrap(), Ok(()));
    assert_eq!(endpoints(&with_fallback)[0].ip(), IpAddr::V4(v4(192, 0, 2, 35)));
    h.factory.complete_delayed_transactions();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_secure_mode_uses_only_secure_transactions() {
    let h = Harness::new(dns_client_options());
    h.proc.add_rule("*", "192.0.2.40");
    let mut config = dns_config();
    config.dns_over_https_servers =
        vec![DohServerConfig::new("https://doh.example/dns-query", true)];
    config.secure_dns_mode = SecureDnsMode::Secure;
    h.notifier.set_dns_config(Some(config));

    h.factory.add_rule_for(
        "secure.test",
        DnsRecordType::A,
        true,
        records(DnsRecord::a("secure.test", v4(192, 0, 2, 41), RECORD_TTL)),
    );
    let a_only = || ResolveHostParameters { query_type: DnsQueryType::A, ..Default::default() };

    let mut request = h.request_with("secure.test", 80, a_only());
    assert_eq!(request.resolve().await, Ok(()));
    assert_eq!(endpoints(&request)[0].ip(), IpAddr::V4(v4(192, 0, 2, 41)));

    let mut missing = h.request_with("missing.test", 80, a_only());
    assert_eq!(missing.resolve().await, Err(NetError::NameNotResolved));
    assert!(h.factory.transactions().iter().all(|(_, _, secure)| *secure));
    assert_eq!(h.proc.num_resolves(), 0);
}

#[tokio::test]
async fn test_secure_override_without_doh_servers_fails() {
    let h = Harness::with_dns_client();
    let mut request = h.request_with(
        "secure.test",
        80,
        ResolveHostParameters {
            secure_dns_mode_override: Some(SecureDnsMode::Secure),
            ..Default::default()
        },
    );
    assert_eq!(start_sync(&mut request), StartOutcome::Complete(Err(NetError::Failed)));
}

#[tokio::test]
async fn test_config_overrides_enable_client() {
    let h = Harness::new(dns_client_options());
    assert_eq!(h.manager.dns_config_as_value(), serde_json::Value::Null);

    let mut overrides = DnsConfigOverrides::create_overriding_everything_with_defaults();
    overrides.nameservers = Some(vec![NAMESERVER.parse().unwrap()]);
    h.manager.set_dns_config_overrides(overrides);

    let value = h.manager.dns_config_as_value();
    assert_eq!(value["nameservers"][0], NAMESERVER);
    h.factory.add_rule(
        "override.test",
        DnsRecordType::A,
        records(DnsRecord::a("override.test", v4(192, 0, 2, 50), RECORD_TTL)),
    );
    let mut request = h.request_with(
        "override.test",
        80,
        ResolveHostParameters { query_type: DnsQueryType::A, ..Default::default() },
    );
    assert_eq!(request.resolve().await, Ok(()));
    assert_eq!(h.factory.num_transactions(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overriding_everything_ignores_system_config_churn() {
    let h = Harness::new(dns_client_options());
    let mut overrides = DnsConfigOverrides::create_overriding_everything_with_defaults();
    overrides.nameservers = Some(vec![NAMESERVER.parse().unwrap()]);
    h.manager.set_dns_config_overrides(overrides);

    h.factory.add_delayed_rule(
        "steady.test",
        DnsRecordType::A,
        records(DnsRecord::a("steady.test", v4(192, 0, 2, 51), RECORD_TTL)),
    );
    let mut request = h.request_with(
        "steady.test",
        80,
        ResolveHostParameters { query_type: DnsQueryType::A, ..Default::default() },
    );
    let rx = start_pending(&mut request);
    let factory = h.factory.clone();
    wait_until(move || factory.num_delayed_pending() >= 1).await;

    h.notifier.set_dns_config(Some(dns_config()));
    h.notifier.set_dns_config(Some(DnsConfig::new(vec!["198.51.100.53:53".parse().unwrap()])));
    h.notifier.set_dns_config(None);
    assert_eq!(h.manager.num_running_jobs(), 1);

    h.factory.complete_delayed_transactions();
    assert_eq!(rx.await.unwrap(), Ok(()));
    assert_eq!(endpoints(&request)[0].ip(), IpAddr::V4(v4(192, 0, 2, 51)));
    assert_eq!(h.proc.num_resolves(), 0);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_dropping_manager_completes_requests() {
    let Harness { manager, proc, factory: _factory, notifier: _notifier } =
        Harness::new(ManagerOptions::default());
    proc.add_rule("*", "192.0.2.60");
    proc.set_blocking(true);

    let pending = HostPortPair::new("pending.test", 80);
    let mut request = manager.create_request(pending, ResolveHostParameters::default());
    let later = HostPortPair::new("later.test", 80);
    let mut unstarted = manager.create_request(later, ResolveHostParameters::default());
    let rx = start_pending(&mut request);
    proc.wait_for_waiters(1).await;

    drop(manager);
    assert_eq!(rx.await.unwrap(), Err(NetError::ContextShutDown));
    assert_eq!(start_sync(&mut unstarted), StartOutcome::Complete(Err(NetError::ContextShutDown)));
    proc.signal_all();
}
