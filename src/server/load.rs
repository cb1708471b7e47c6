//! Server load monitor.
//!
//! Memory pressure is estimated from the bytes held by compilation arenas
//! against the configured budget, charged while the compilations run; thread pressure from the number of
//! compilations in flight against the configured compilation thread count.
//! Both are reported back to clients on every successful response and on
//! low-memory refusals.

use crate::protocol::message::{ActiveThreadsState, ServerLoad, ServerMemoryState};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct LoadMonitor {
    memory_budget: usize,
    thread_limit: usize,
    memory_in_use: AtomicUsize,
    active_compilations: AtomicUsize,
}

impl LoadMonitor {
    pub fn new(memory_budget: usize, thread_limit: usize) -> Self {
        Self {
            memory_budget: memory_budget.max(1),
            thread_limit: thread_limit.max(1),
            memory_in_use: AtomicUsize::new(0),
            active_compilations: AtomicUsize::new(0),
        }
    }

    /// Track one compilation until the returned guard drops.
    pub fn begin_compilation(&self) -> ActiveCompilation<'_> {
        self.active_compilations.fetch_add(1, Ordering::AcqRel);
        ActiveCompilation {
            monitor: self,
            charged: Cell::new(0),
        }
    }

    pub fn active_compilations(&self) -> usize {
        self.active_compilations.load(Ordering::Acquire)
    }

    pub fn memory_in_use(&self) -> usize {
        self.memory_in_use.load(Ordering::Acquire)
    }

    pub fn memory_state(&self) -> ServerMemoryState {
        let used = self.memory_in_use() as u128 * 100;
        let budget = self.memory_budget as u128;
        if used >= budget * 90 {
            ServerMemoryState::VeryLow
        } else if used >= budget * 75 {
            ServerMemoryState::Low
        } else {
            ServerMemoryState::Normal
        }
    }

    pub fn threads_state(&self) -> ActiveThreadsState {
        let active = self.active_compilations();
        if active >= self.thread_limit {
            ActiveThreadsState::VeryHigh
        } else if active * 4 >= self.thread_limit * 3 {
            ActiveThreadsState::High
        } else {
            ActiveThreadsState::Normal
        }
    }

    pub fn current(&self) -> ServerLoad {
        ServerLoad {
            memory: self.memory_state(),
            threads: self.threads_state(),
        }
    }
}

/// One in-flight compilation; releases its memory charge and thread slot on drop.
pub struct ActiveCompilation<'a> {
    monitor: &'a LoadMonitor,
    charged: Cell<usize>,
}

impl ActiveCompilation<'_> {
    /// Update the bytes this compilation holds.
    pub fn charge(&self, bytes: usize) {
        let charged = self.charged.replace(bytes);
        if bytes >= charged {
            self.monitor
                .memory_in_use
                .fetch_add(bytes - charged, Ordering::AcqRel);
        } else {
            self.monitor
                .memory_in_use
                .fetch_sub(charged - bytes, Ordering::AcqRel);
        }
    }

    pub fn charged(&self) -> usize {
        self.charged.get()
    }
}

impl Drop for ActiveCompilation<'_> {
    fn drop(&mut self) {
        self.charge(0);
        self.monitor.active_compilations.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_buckets() {
        let monitor = LoadMonitor::new(1000, 8);
        let compile = monitor.begin_compilation();
        assert_eq!(monitor.memory_state(), ServerMemoryState::Normal);
        compile.charge(750);
        assert_eq!(monitor.memory_state(), ServerMemoryState::Low);
        compile.charge(900);
        assert_eq!(monitor.memory_state(), ServerMemoryState::VeryLow);
        compile.charge(100);
        assert_eq!(monitor.memory_state(), ServerMemoryState::Normal);
        drop(compile);
        assert_eq!(monitor.memory_in_use(), 0);
    }

    #[test]
    fn test_thread_buckets() {
        let monitor = LoadMonitor::new(1000, 4);
        let a = monitor.begin_compilation();
        let b = monitor.begin_compilation();
        assert_eq!(monitor.threads_state(), ActiveThreadsState::Normal);
        let c = monitor.begin_compilation();
        assert_eq!(monitor.threads_state(), ActiveThreadsState::High);
        let d = monitor.begin_compilation();
        assert_eq!(monitor.threads_state(), ActiveThreadsState::VeryHigh);
        drop((a, b, c, d));
        assert_eq!(monitor.active_compilations(), 0);
        assert_eq!(monitor.current(), ServerLoad::IDLE);
    }
}
