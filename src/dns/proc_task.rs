//! System resolver task with retry escalation.
//!
//! A `ProcTask` runs one `HostResolverProc` lookup on the blocking pool. If
//! no attempt has returned within `unresponsive_delay`, another attempt is
//! started alongside the first; the delay grows by `retry_factor` each time
//! until `max_retry_attempts` retries have been started. The first attempt
//! to return decides the outcome. Attempts still running at that point are
//! drained in the background and their results dropped.
//!
//! ```text
//! Idle -> AttemptRunning(1) -> AttemptRunning(2) -> ... -> Resolved(n)
//!                                                      \-> Exhausted(n)
//! (any non-terminal state) -> Aborted
//! ```

use crate::base::neterror::NetError;
use crate::dns::resolve::{AddressFamily, AddressList, HostResolverFlags, HostResolverProc};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 4;
pub const DEFAULT_UNRESPONSIVE_DELAY: Duration = Duration::from_secs(6);
pub const DEFAULT_RETRY_FACTOR: u32 = 2;

/// Parameters shared by every `ProcTask` of a resolver.
#[derive(Clone)]
pub struct ProcTaskParams {
    pub resolver_proc: Arc<dyn HostResolverProc>,
    /// Retries after the first attempt.
    pub max_retry_attempts: u32,
    pub unresponsive_delay: Duration,
    pub retry_factor: u32,
}

impl ProcTaskParams {
    pub fn new(resolver_proc: Arc<dyn HostResolverProc>, max_retry_attempts: u32) -> Self {
        Self {
            resolver_proc,
            max_retry_attempts,
            unresponsive_delay: DEFAULT_UNRESPONSIVE_DELAY,
            retry_factor: DEFAULT_RETRY_FACTOR,
        }
    }
}

impl std::fmt::Debug for ProcTaskParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcTaskParams")
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("unresponsive_delay", &self.unresponsive_delay)
            .field("retry_factor", &self.retry_factor)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcTaskState {
    Idle,
    /// Attempt `n` is the most recently started one.
    AttemptRunning(u32),
    /// Attempt `n` returned addresses first.
    Resolved(u32),
    /// Attempt `n` returned first, with an error.
    Exhausted(u32),
    Aborted,
}

impl ProcTaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcTaskState::Resolved(_) | ProcTaskState::Exhausted(_) | ProcTaskState::Aborted
        )
    }
}

type AttemptOutcome = (u32, Result<AddressList, NetError>);

pub struct ProcTask {
    hostname: String,
    family: AddressFamily,
    flags: HostResolverFlags,
    params: ProcTaskParams,
    state: ProcTaskState,
    attempts: JoinSet<AttemptOutcome>,
}

impl ProcTask {
    pub fn new(
        hostname: impl Into<String>,
        family: AddressFamily,
        flags: HostResolverFlags,
        params: ProcTaskParams,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            family,
            flags,
            params,
            state: ProcTaskState::Idle,
            attempts: JoinSet::new(),
        }
    }

    pub fn state(&self) -> ProcTaskState {
        self.state
    }

    /// Run to completion. Must be called once, from the `Idle` state.
    pub async fn run(&mut self) -> Result<AddressList, NetError> {
        if self.state != ProcTaskState::Idle {
            return Err(NetError::Failed);
        }
        self.start_attempt();
        let mut delay = self.params.unresponsive_delay;

        loop {
            let retry_allowed = matches!(
                self.state,
                ProcTaskState::AttemptRunning(n) if n <= self.params.max_retry_attempts
            );
            tokio::select! {
                Some(joined) = self.attempts.join_next() => {
                    let (attempt, result) = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::warn!(
                                host = %self.hostname,
                                error = %e,
                                "resolver attempt panicked"
                            );
                            (self.current_attempt(), Err(NetError::Failed))
                        }
                    };
                    return self.finish(attempt, result);
                }
                _ = tokio::time::sleep(delay), if retry_allowed => {
                    delay = delay.saturating_mul(self.params.retry_factor);
                    self.start_attempt();
                }
            }
        }
    }

    fn current_attempt(&self) -> u32 {
        match self.state {
            ProcTaskState::AttemptRunning(n) => n,
            _ => 0,
        }
    }

    fn start_attempt(&mut self) {
        let attempt = self.current_attempt() + 1;
        self.state = ProcTaskState::AttemptRunning(attempt);

        let resolver_proc = Arc::clone(&self.params.resolver_proc);
        let host = self.hostname.clone();
        let family = self.family;
        let flags = self.flags;
        tracing::trace!(host = %host, attempt, "starting system resolver attempt");
        self.attempts
            .spawn_blocking(move || (attempt, resolver_proc.resolve(&host, family, flags)));
    }

    fn finish(
        &mut self,
        attempt: u32,
        result: Result<AddressList, NetError>,
    ) -> Result<AddressList, NetError> {
        let result = result.and_then(|list| {
            if list.is_empty() {
                Err(NetError::NameNotResolved)
            } else if list.contains_icann_name_collision() {
                Err(NetError::IcannNameCollision)
            } else {
                Ok(list)
            }
        });
        self.state = match result {
            Ok(_) => ProcTaskState::Resolved(attempt),
            Err(_) => ProcTaskState::Exhausted(attempt),
        };
        tracing::debug!(
            host = %self.hostname,
            attempt,
            started = self.attempts.len() as u32 + 1,
            ok = result.is_ok(),
            "system resolution finished"
        );
        self.drain_attempts();
        result
    }

    /// Let still-running attempts finish off the task, discarding their results.
    fn drain_attempts(&mut self) {
        if self.attempts.is_empty() {
            return;
        }
        let mut remaining = mem::take(&mut self.attempts);
        let host = self.hostname.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(joined) = remaining.join_next().await {
                        if let Ok((attempt, _)) = joined {
                            tracing::trace!(
                                host = %host,
                                attempt,
                                "discarded late resolver attempt"
                            );
                        }
                    }
                });
            }
            Err(_) => remaining.detach_all(),
        }
    }
}

impl Drop for ProcTask {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.state != ProcTaskState::Idle {
            tracing::debug!(host = %self.hostname, "system resolution aborted");
            self.state = ProcTaskState::Aborted;
        }
        self.drain_attempts();
    }
}
