//! Single-threaded, time-ordered job queue.
//!
//! Every asynchronous behaviour of a node (RPC timeouts, republish cycles,
//! routing-table refreshes, simulated message delivery) is a job in this
//! queue. Jobs run to completion one at a time, so handlers can mutate shared
//! state without locks. A handler may schedule or cancel further jobs while it
//! runs; the loop re-reads the earliest job on every iteration.
//!
//! Two clocks are supported:
//!
//! - [`Clock::Virtual`]: time only moves when the loop jumps straight to the
//!   next job's fire time. Used by simulations and tests.
//! - [`Clock::Realtime`]: time is tokio's monotonic clock measured from the
//!   scheduler's creation; the driver sleeps until the next job is due.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::time::{Duration, Instant};

/// Milliseconds since the scheduler's epoch.
pub type Timestamp = u64;

/// Cancellation token shared by every job that belongs to one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Owner(u64);

/// Position of a job in the queue: fire time first, insertion order second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    at: Timestamp,
    seq: u64,
}

impl JobKey {
    pub fn fire_time(&self) -> Timestamp {
        self.at
    }
}

/// Time source for a [`Scheduler`].
#[derive(Clone, Copy, Debug)]
pub enum Clock {
    Virtual,
    Realtime { origin: Instant },
}

#[derive(Debug)]
struct Entry<J> {
    owner: Owner,
    job: J,
}

/// Time-ordered job queue with owner-based bulk cancellation.
#[derive(Debug)]
pub struct Scheduler<J> {
    clock: Clock,
    /// Virtual time. Unused by the realtime clock.
    now: Timestamp,
    jobs: BTreeMap<JobKey, Entry<J>>,
    owners: HashMap<Owner, BTreeSet<JobKey>>,
    next_seq: u64,
    next_owner: u64,
    jobs_done: u64,
    running: bool,
}

impl<J> Default for Scheduler<J> {
    fn default() -> Self {
        Self::new(Clock::Virtual)
    }
}

impl<J> Scheduler<J> {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            now: 0,
            jobs: BTreeMap::new(),
            owners: HashMap::new(),
            next_seq: 0,
            next_owner: 0,
            jobs_done: 0,
            running: false,
        }
    }

    /// A scheduler whose clock only advances by jumping to the next job.
    pub fn with_virtual_clock() -> Self {
        Self::new(Clock::Virtual)
    }

    /// A scheduler following tokio's clock from this instant.
    pub fn with_realtime_clock() -> Self {
        Self::new(Clock::Realtime {
            origin: Instant::now(),
        })
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.clock, Clock::Virtual)
    }

    pub fn now(&self) -> Timestamp {
        match self.clock {
            Clock::Virtual => self.now,
            Clock::Realtime { origin } => origin.elapsed().as_millis() as Timestamp,
        }
    }

    /// Allocate a fresh cancellation token.
    pub fn new_owner(&mut self) -> Owner {
        let owner = Owner(self.next_owner);
        self.next_owner += 1;
        owner
    }

    /// Schedule `job` at absolute time `at`.
    ///
    /// Jobs with equal fire times run in insertion order. A time in the past
    /// makes the job due immediately.
    pub fn schedule_at(&mut self, at: Timestamp, owner: Owner, job: J) -> JobKey {
        let key = JobKey {
            at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.jobs.insert(key, Entry { owner, job });
        self.owners.entry(owner).or_default().insert(key);
        key
    }

    /// Schedule `job` to run `delay` milliseconds from now.
    pub fn schedule_after(&mut self, delay: u64, owner: Owner, job: J) -> JobKey {
        let at = self.now().saturating_add(delay);
        self.schedule_at(at, owner, job)
    }

    /// Remove every not-yet-fired job belonging to `owner`.
    ///
    /// Returns how many jobs were removed.
    pub fn cancel_all(&mut self, owner: Owner) -> usize {
        let Some(keys) = self.owners.remove(&owner) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if self.jobs.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Number of queued jobs belonging to `owner`.
    pub fn pending_for(&self, owner: Owner) -> usize {
        self.owners.get(&owner).map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs_done(&self) -> u64 {
        self.jobs_done
    }

    /// Fire time of the earliest queued job.
    pub fn next_fire_time(&self) -> Option<Timestamp> {
        self.jobs.keys().next().map(JobKey::fire_time)
    }

    /// Tokio deadline of the earliest queued job under the realtime clock.
    pub fn next_deadline(&self) -> Option<Instant> {
        let at = self.next_fire_time()?;
        match self.clock {
            Clock::Virtual => None,
            Clock::Realtime { origin } => Some(origin + Duration::from_millis(at)),
        }
    }

    /// Pop the earliest job if its fire time has arrived.
    pub fn pop_due(&mut self) -> Option<J> {
        let key = *self.jobs.keys().next()?;
        if key.at > self.now() {
            return None;
        }
        Some(self.take(key))
    }

    /// Pop the earliest job, moving the virtual clock forward to its fire time.
    ///
    /// Under the realtime clock this is the same as [`Scheduler::pop_due`].
    pub fn advance(&mut self) -> Option<J> {
        self.advance_until(Timestamp::MAX)
    }

    /// Like [`Scheduler::advance`], but never moves the virtual clock past
    /// `limit`. When no job is due by `limit` the clock is left at `limit`.
    pub fn advance_until(&mut self, limit: Timestamp) -> Option<J> {
        if !self.is_virtual() {
            return self.pop_due();
        }
        match self.jobs.keys().next().copied() {
            Some(key) if key.at <= limit => {
                self.now = self.now.max(key.at);
                Some(self.take(key))
            }
            _ => {
                if limit != Timestamp::MAX {
                    self.now = self.now.max(limit);
                }
                None
            }
        }
    }

    /// Drive the queue under the virtual clock until it drains or
    /// [`Scheduler::stop`] is called from inside a handler.
    pub fn run<F>(&mut self, mut handler: F)
    where
        F: FnMut(&mut Self, J),
    {
        self.running = true;
        while self.running {
            match self.advance() {
                Some(job) => handler(self, job),
                None => break,
            }
        }
        self.running = false;
    }

    /// Sleep until the earliest job is due. Pends forever on an empty queue,
    /// so callers race it against whatever can post new jobs.
    pub async fn sleep_until_due(&self) {
        match self.next_deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Mark the loop as running; used by external drivers.
    pub fn start(&mut self) {
        self.running = true;
    }

    /// End the loop once the in-flight handler returns.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn take(&mut self, key: JobKey) -> J {
        let entry = self
            .jobs
            .remove(&key)
            .unwrap_or_else(|| unreachable!("job key taken from the queue itself"));
        if let Some(keys) = self.owners.get_mut(&entry.owner) {
            keys.remove(&key);
            if keys.is_empty() {
                self.owners.remove(&entry.owner);
            }
        }
        self.jobs_done += 1;
        entry.job
    }
}
