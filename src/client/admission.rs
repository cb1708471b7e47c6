//! Client-side admission control driven by server load feedback.
//!
//! Every successful response and every low-memory failure carries the
//! server's memory and thread state. The client folds it into one of four
//! policies that decide how many compilation threads it keeps busy.

use crate::protocol::message::{ActiveThreadsState, ServerLoad, ServerMemoryState};
use parking_lot::Mutex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionPolicy {
    /// New compilation threads may be started.
    Aggressive,
    /// Keep the running threads, start no new ones.
    Maintain,
    /// Retire one thread.
    Subdue,
    /// Ratchet down to a single thread.
    Suspend,
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdmissionPolicy::Aggressive => "AGGRESSIVE",
            AdmissionPolicy::Maintain => "MAINTAIN",
            AdmissionPolicy::Subdue => "SUBDUE",
            AdmissionPolicy::Suspend => "SUSPEND",
        };
        f.write_str(name)
    }
}

impl AdmissionPolicy {
    pub fn for_load(load: ServerLoad) -> AdmissionPolicy {
        if load.memory == ServerMemoryState::VeryLow {
            AdmissionPolicy::Suspend
        } else if load.threads == ActiveThreadsState::VeryHigh {
            AdmissionPolicy::Subdue
        } else if load.memory == ServerMemoryState::Low || load.threads == ActiveThreadsState::High {
            AdmissionPolicy::Maintain
        } else {
            AdmissionPolicy::Aggressive
        }
    }
}

#[derive(Debug)]
pub struct AdmissionControl {
    max_threads: usize,
    policy: Mutex<AdmissionPolicy>,
}

impl AdmissionControl {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads: max_threads.max(1),
            policy: Mutex::new(AdmissionPolicy::Aggressive),
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        *self.policy.lock()
    }

    /// Fold one load report into the policy; returns the policy now in force.
    pub fn on_feedback(&self, load: ServerLoad) -> AdmissionPolicy {
        let next = AdmissionPolicy::for_load(load);
        let mut policy = self.policy.lock();
        if *policy != next {
            log::info!(
                "admission policy {} -> {} (server memory {:?}, threads {:?})",
                *policy,
                next,
                load.memory,
                load.threads
            );
            *policy = next;
        }
        next
    }

    /// Whether one more compilation thread may start while `active` are running.
    pub fn may_start_thread(&self, active: usize) -> bool {
        self.policy() == AdmissionPolicy::Aggressive && active < self.max_threads
    }

    /// Number of threads that should be running, given `active` now.
    pub fn target_threads(&self, active: usize) -> usize {
        match self.policy() {
            AdmissionPolicy::Aggressive => self.max_threads,
            AdmissionPolicy::Maintain => active.clamp(1, self.max_threads),
            AdmissionPolicy::Subdue => active.saturating_sub(1).max(1),
            AdmissionPolicy::Suspend => 1,
        }
    }
}
