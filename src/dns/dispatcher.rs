//! Priority-aware admission control for resolver jobs.
//!
//! Chromium mapping: net/base/prioritized_dispatcher.cc
//!
//! Jobs are admitted while running slots are available for their priority.
//! Limits may reserve slots per priority: a job at priority `p` only runs if
//! the running count is below `total_jobs` minus the slots reserved for
//! priorities strictly above `p`. Everything else queues FIFO per priority,
//! highest priority first.

use crate::base::priority::RequestPriority;
use std::collections::VecDeque;

/// Concurrency limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Slots reserved for each priority, indexed by `RequestPriority::index()`.
    pub reserved_slots: [usize; RequestPriority::COUNT],
    pub total_jobs: usize,
}

impl Limits {
    /// `total_jobs` slots, none reserved.
    pub fn new(total_jobs: usize) -> Self {
        Self { reserved_slots: [0; RequestPriority::COUNT], total_jobs }
    }

    pub fn with_reserved(mut self, priority: RequestPriority, slots: usize) -> Self {
        self.reserved_slots[priority.index()] = slots;
        self
    }
}

/// Identifies a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    id: u64,
    priority: RequestPriority,
}

impl QueueHandle {
    pub fn priority(&self) -> RequestPriority {
        self.priority
    }
}

/// Outcome of [`PrioritizedDispatcher::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job holds a running slot now.
    Started,
    /// The job waits in the queue.
    Queued(QueueHandle),
}

/// Dispatcher over job identifiers `T`.
///
/// The dispatcher never runs anything itself: `add` and `on_job_finished`
/// report which jobs were granted a slot and the caller starts them.
#[derive(Debug)]
pub struct PrioritizedDispatcher<T> {
    queues: Vec<VecDeque<(u64, T)>>,
    limits: Limits,
    num_running: usize,
    next_id: u64,
}

impl<T: Clone + PartialEq> PrioritizedDispatcher<T> {
    pub fn new(limits: Limits) -> Self {
        Self {
            queues: (0..RequestPriority::COUNT).map(|_| VecDeque::new()).collect(),
            limits,
            num_running: 0,
            next_id: 1,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn num_running(&self) -> usize {
        self.num_running
    }

    pub fn num_queued(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn num_queued_at(&self, priority: RequestPriority) -> usize {
        self.queues[priority.index()].len()
    }

    fn limit_for(&self, priority: RequestPriority) -> usize {
        let reserved_above: usize = self.limits.reserved_slots[priority.index() + 1..].iter().sum();
        self.limits.total_jobs.saturating_sub(reserved_above)
    }

    fn can_start(&self, priority: RequestPriority) -> bool {
        self.num_running < self.limit_for(priority)
    }

    /// Start `job` now if a slot is available, else queue it at the back.
    pub fn add(&mut self, job: T, priority: RequestPriority) -> Admission {
        if self.can_start(priority) {
            self.num_running += 1;
            return Admission::Started;
        }
        Admission::Queued(self.enqueue(job, priority, false))
    }

    /// Like [`add`](Self::add) but queues at the front of its priority.
    pub fn add_at_head(&mut self, job: T, priority: RequestPriority) -> Admission {
        if self.can_start(priority) {
            self.num_running += 1;
            return Admission::Started;
        }
        Admission::Queued(self.enqueue(job, priority, true))
    }

    fn enqueue(&mut self, job: T, priority: RequestPriority, at_head: bool) -> QueueHandle {
        let id = self.next_id;
        self.next_id += 1;
        let queue = &mut self.queues[priority.index()];
        if at_head {
            queue.push_front((id, job));
        } else {
            queue.push_back((id, job));
        }
        QueueHandle { id, priority }
    }

    /// Remove a queued entry. Returns its job if it was still queued.
    pub fn cancel(&mut self, handle: QueueHandle) -> Option<T> {
        let queue = &mut self.queues[handle.priority.index()];
        let pos = queue.iter().position(|(id, _)| *id == handle.id)?;
        queue.remove(pos).map(|(_, job)| job)
    }

    /// Move a queued entry to `priority`, keeping FIFO order at the new level.
    ///
    /// If the new priority can start right away the entry is removed from
    /// the queue and `Admission::Started` is returned.
    pub fn change_priority(
        &mut self,
        handle: QueueHandle,
        priority: RequestPriority,
    ) -> Option<Admission> {
        let job = self.cancel(handle)?;
        Some(self.add(job, priority))
    }

    /// Release a running slot and hand it to the best queued job that fits.
    pub fn on_job_finished(&mut self) -> Option<T> {
        self.num_running = self.num_running.saturating_sub(1);
        self.start_next()
    }

    fn start_next(&mut self) -> Option<T> {
        for priority in RequestPriority::ALL.iter().rev() {
            if self.queues[priority.index()].is_empty() {
                continue;
            }
            if !self.can_start(*priority) {
                // Lower priorities have at least as many slots reserved above them.
                return None;
            }
            let (_, job) = self.queues[priority.index()].pop_front()?;
            self.num_running += 1;
            return Some(job);
        }
        None
    }

    /// Replace the limits and start whatever now fits, in priority order.
    pub fn set_limits(&mut self, limits: Limits) -> Vec<T> {
        self.limits = limits;
        let mut started = Vec::new();
        while let Some(job) = self.start_next() {
            started.push(job);
        }
        started
    }

    /// Limits to zero, returning nothing.
    pub fn set_limits_to_zero(&mut self) {
        self.limits = Limits::new(0);
    }

    /// Remove the oldest entry at the lowest non-empty priority for which
    /// `pred` holds.
    pub fn evict_oldest_lowest_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|(_, job)| pred(job)) {
                return queue.remove(pos).map(|(_, job)| job);
            }
        }
        None
    }

    /// Whether `job` is queued anywhere.
    pub fn is_queued(&self, job: &T) -> bool {
        self.queues.iter().any(|q| q.iter().any(|(_, j)| j == job))
    }
}
