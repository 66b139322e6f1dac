//! Caller-owned resolve requests.
//!
//! Chromium mapping: net/dns/host_resolver_manager_request_impl.cc
//!
//! A [`ResolveHostRequest`] is created by the manager and started once. It
//! completes either synchronously (returned from [`start`]) or later by a
//! single invocation of its callback. Cancelling or dropping a pending
//! request detaches it from its job and guarantees the callback never runs.
//!
//! [`start`]: ResolveHostRequest::start

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::base::priority::RequestPriority;
use crate::dns::hostcache::{EntryStaleness, HostCacheEntry};
use crate::dns::manager::ManagerShared;
use crate::dns::resolve::{AddressList, HostPortPair, ResolveHostParameters};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;

/// Completion callback, invoked at most once with the final result.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), NetError>) + Send>;

/// Result of [`ResolveHostRequest::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The callback will be invoked later.
    Pending,
    /// Finished synchronously; the callback has been dropped unused.
    Complete(Result<(), NetError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Pending,
    Complete,
    Cancelled,
}

struct RequestInner {
    phase: Phase,
    callback: Option<CompletionCallback>,
    priority: RequestPriority,
    results: Option<HostCacheEntry>,
    error: Option<NetError>,
    stale_info: Option<EntryStaleness>,
}

/// Request state shared between the caller's handle and the manager.
pub(crate) struct RequestShared {
    id: u64,
    host: HostPortPair,
    params: ResolveHostParameters,
    inner: Mutex<RequestInner>,
}

/// A finished result waiting to be delivered outside the manager lock.
pub(crate) struct Completion {
    pub request: Arc<RequestShared>,
    pub entry: HostCacheEntry,
    pub staleness: Option<EntryStaleness>,
}

impl Completion {
    pub fn new(
        request: Arc<RequestShared>,
        entry: HostCacheEntry,
        staleness: Option<EntryStaleness>,
    ) -> Self {
        Self { request, entry, staleness }
    }
}

impl RequestShared {
    pub(crate) fn new(id: u64, host: HostPortPair, params: ResolveHostParameters) -> Self {
        let priority = params.initial_priority;
        Self {
            id,
            host,
            params,
            inner: Mutex::new(RequestInner {
                phase: Phase::NotStarted,
                callback: None,
                priority,
                results: None,
                error: None,
                stale_info: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RequestInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &HostPortPair {
        &self.host
    }

    pub fn params(&self) -> &ResolveHostParameters {
        &self.params
    }

    pub fn priority(&self) -> RequestPriority {
        self.lock().priority
    }

    /// Record the result if still pending and hand back the callback.
    fn complete(
        &self,
        entry: HostCacheEntry,
        staleness: Option<EntryStaleness>,
    ) -> Option<(Option<CompletionCallback>, Result<(), NetError>)> {
        let mut inner = self.lock();
        if inner.phase != Phase::Pending {
            return None;
        }
        inner.phase = Phase::Complete;
        let result = match entry.error() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        inner.error = entry.error();
        inner.stale_info = staleness;
        if !self.params.is_speculative {
            inner.results = Some(entry.with_port(self.host.port()));
        }
        Some((inner.callback.take(), result))
    }
}

/// Deliver completions, invoking each pending callback exactly once.
///
/// Must be called without the manager lock held.
pub(crate) fn deliver(batch: Vec<Completion>) {
    for completion in batch {
        let Completion { request, entry, staleness } = completion;
        if let Some((Some(callback), result)) = request.complete(entry, staleness) {
            callback(result);
        }
    }
}

/// Handle to one host resolution.
///
/// Dropping a pending request cancels it.
pub struct ResolveHostRequest {
    shared: Arc<RequestShared>,
    manager: Weak<ManagerShared>,
}

impl ResolveHostRequest {
    pub(crate) fn new(shared: Arc<RequestShared>, manager: Weak<ManagerShared>) -> Self {
        Self { shared, manager }
    }

    /// Start resolving.
    ///
    /// Returns [`StartOutcome::Complete`] when the result is known right
    /// away (IP literals, cache and hosts hits, immediate errors). Otherwise
    /// `callback` runs once when the owning job finishes. Starting a request
    /// twice fails with `ERR_FAILED` and leaves the first start untouched.
    pub fn start<F>(&mut self, callback: F) -> StartOutcome
    where
        F: FnOnce(Result<(), NetError>) + Send + 'static,
    {
        {
            let mut inner = self.shared.lock();
            if inner.phase != Phase::NotStarted {
                return StartOutcome::Complete(Err(NetError::Failed));
            }
            inner.phase = Phase::Pending;
            inner.callback = Some(Box::new(callback));
        }

        let Some(manager) = self.manager.upgrade() else {
            let mut inner = self.shared.lock();
            inner.phase = Phase::Complete;
            inner.callback = None;
            inner.error = Some(NetError::ContextShutDown);
            return StartOutcome::Complete(Err(NetError::ContextShutDown));
        };

        let batch = manager.start_request(&self.shared);
        drop(manager);

        let mut own = None;
        let mut others = Vec::with_capacity(batch.len());
        for completion in batch {
            if Arc::ptr_eq(&completion.request, &self.shared) {
                own = Some(completion);
            } else {
                others.push(completion);
            }
        }
        deliver(others);

        match own.and_then(|c| self.shared.complete(c.entry, c.staleness)) {
            Some((_callback, result)) => StartOutcome::Complete(result),
            None => StartOutcome::Pending,
        }
    }

    /// Start and wait for the result.
    pub async fn resolve(&mut self) -> Result<(), NetError> {
        let (tx, rx) = oneshot::channel();
        match self.start(move |result| {
            let _ = tx.send(result);
        }) {
            StartOutcome::Complete(result) => result,
            StartOutcome::Pending => rx.await.unwrap_or(Err(NetError::Aborted)),
        }
    }

    /// Cancel a pending request. Its callback will not be invoked.
    pub fn cancel(&mut self) {
        {
            let mut inner = self.shared.lock();
            if inner.phase != Phase::Pending {
                return;
            }
            inner.phase = Phase::Cancelled;
            inner.callback = None;
        }
        if let Some(manager) = self.manager.upgrade() {
            let batch = manager.cancel_request(self.shared.id);
            drop(manager);
            deliver(batch);
        }
    }

    pub fn change_request_priority(&mut self, priority: RequestPriority) {
        let pending = {
            let mut inner = self.shared.lock();
            inner.priority = priority;
            inner.phase == Phase::Pending
        };
        if !pending {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            let batch = manager.change_request_priority(self.shared.id, priority);
            drop(manager);
            deliver(batch);
        }
    }

    pub fn priority(&self) -> RequestPriority {
        self.shared.priority()
    }

    pub fn load_state(&self) -> LoadState {
        if self.shared.lock().phase != Phase::Pending {
            return LoadState::Idle;
        }
        match self.manager.upgrade() {
            Some(manager) => manager.request_load_state(self.shared.id),
            None => LoadState::Idle,
        }
    }

    pub fn host(&self) -> &HostPortPair {
        self.shared.host()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.lock().phase == Phase::Complete
    }

    /// Final error, if the request completed with one.
    pub fn error(&self) -> Option<NetError> {
        self.shared.lock().error
    }

    /// Resolved endpoints, already carrying the request's port.
    pub fn address_results(&self) -> Option<AddressList> {
        self.shared.lock().results.as_ref()?.addresses().cloned()
    }

    pub fn text_results(&self) -> Option<Vec<String>> {
        self.shared.lock().results.as_ref()?.text_records().map(<[String]>::to_vec)
    }

    pub fn hostname_results(&self) -> Option<Vec<HostPortPair>> {
        self.shared.lock().results.as_ref()?.hostnames().map(<[HostPortPair]>::to_vec)
    }

    /// Aliases followed while resolving, canonical name last.
    pub fn dns_alias_results(&self) -> Option<Vec<String>> {
        self.address_results().map(|list| list.dns_aliases().to_vec())
    }

    /// Staleness of a cache-served result. `None` unless served from cache.
    pub fn stale_info(&self) -> Option<EntryStaleness> {
        self.shared.lock().stale_info
    }
}

impl Drop for ResolveHostRequest {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ResolveHostRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ResolveHostRequest")
            .field("id", &self.shared.id)
            .field("host", &self.shared.host)
            .field("phase", &inner.phase)
            .field("priority", &inner.priority)
            .finish_non_exhaustive()
    }
}
