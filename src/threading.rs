use crate::sync::{Arc, AtomicBool, AtomicU64, AtomicUsize, Condvar, Mutex, MutexGuard, Ordering};
use std::{
    cell::Cell,
    collections::HashMap,
    thread::ThreadId,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

thread_local! {
    /// Cached mutator ID for the current thread
    static MUTATOR_ID: Cell<Option<u64>> = const { Cell::new(None) };
    /// Set while this thread holds a [`SuspensionGuard`]
    static IS_SUSPENDING: Cell<bool> = const { Cell::new(false) };
}

const SLOW_SUSPENSION: Duration = Duration::from_secs(1);

/// Where a mutator thread currently is with respect to suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatorState {
    /// Executing stubs or managed code; may be inside a write barrier
    Running,
    /// Parked at a safe point until the suspension ends
    AtSafePoint,
    /// Unregistered
    Exited,
}

impl MutatorState {
    fn decode(raw: u64) -> Self {
        match raw {
            1 => MutatorState::AtSafePoint,
            2 => MutatorState::Exited,
            _ => MutatorState::Running,
        }
    }
}

#[derive(Debug)]
struct Mutator {
    native_id: ThreadId,
    state: AtomicU64,
}

impl Mutator {
    fn state(&self) -> MutatorState {
        MutatorState::decode(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: MutatorState) {
        self.state.store(state as u64, Ordering::Release);
    }
}

/// Tracks mutator threads and parks them for code patching.
///
/// Code that may run a write barrier or a dispatch stub registers with the
/// manager and calls [`ThreadManager::safe_point`] between invocations. A
/// thread that needs to rewrite live code calls
/// [`ThreadManager::suspend_all`], which returns once every other registered
/// mutator is parked; dropping the returned guard releases them.
///
/// The suspending thread may itself be a registered mutator. It is not waited
/// for, and its own safe points are no-ops while it holds the guard.
pub struct ThreadManager {
    mutators: Mutex<HashMap<u64, Arc<Mutator>>>,
    next_id: AtomicU64,
    suspend_requested: AtomicBool,
    parked: AtomicUsize,
    parked_changed: Condvar,
    coordination: Mutex<()>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            mutators: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            suspend_requested: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            parked_changed: Condvar::new(),
            coordination: Mutex::new(()),
        }
    }

    /// Register the calling thread as a mutator and return its ID.
    pub fn register_thread(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mutator = Arc::new(Mutator {
            native_id: std::thread::current().id(),
            state: AtomicU64::new(MutatorState::Running as u64),
        });
        self.mutators.lock().insert(id, mutator);
        MUTATOR_ID.set(Some(id));
        debug!(mutator = id, "registered mutator thread");
        id
    }

    pub fn unregister_thread(&self, id: u64) {
        let mut mutators = self.mutators.lock();
        if let Some(mutator) = mutators.remove(&id) {
            mutator.set_state(MutatorState::Exited);
        }
        drop(mutators);
        MUTATOR_ID.set(None);
        // The suspender may be waiting on a count that just shrank.
        self.parked_changed.notify_all();
        debug!(mutator = id, "unregistered mutator thread");
    }

    pub fn current_thread_id(&self) -> Option<u64> {
        if let Some(id) = MUTATOR_ID.get() {
            return Some(id);
        }
        let native_id = std::thread::current().id();
        let id = self
            .mutators
            .lock()
            .iter()
            .find(|(_, m)| m.native_id == native_id)
            .map(|(id, _)| *id);
        if id.is_some() {
            MUTATOR_ID.set(id);
        }
        id
    }

    pub fn thread_count(&self) -> usize {
        self.mutators.lock().len()
    }

    pub fn state_of(&self, id: u64) -> Option<MutatorState> {
        self.mutators.lock().get(&id).map(|m| m.state())
    }

    #[inline]
    pub fn is_suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    /// True when the calling thread holds the suspension guard.
    pub fn is_suspended(&self) -> bool {
        IS_SUSPENDING.get() && self.is_suspend_requested()
    }

    /// Park the calling mutator if a suspension is pending.
    pub fn safe_point(&self, id: u64) {
        if !self.is_suspend_requested() || IS_SUSPENDING.get() {
            return;
        }

        let mutator = self.mutators.lock().get(&id).cloned();
        let Some(mutator) = mutator else {
            return;
        };

        mutator.set_state(MutatorState::AtSafePoint);
        // Counted before taking the coordination lock; the suspender holds it while waiting.
        self.parked.fetch_add(1, Ordering::AcqRel);
        self.parked_changed.notify_all();
        let mut guard = self.coordination.lock();
        while self.suspend_requested.load(Ordering::Acquire) {
            self.parked_changed.wait(&mut guard);
        }
        // Leave the count under the lock so the next suspender never sees a stale total.
        self.parked.fetch_sub(1, Ordering::Release);
        mutator.set_state(MutatorState::Running);
    }

    /// Bring every other registered mutator to a safe point.
    pub fn suspend_all(&self) -> SuspensionGuard<'_> {
        let mut guard = self.coordination.lock();
        let started = Instant::now();
        let mut warned = false;

        self.suspend_requested.store(true, Ordering::Release);

        loop {
            let total = self.thread_count();
            let target = if self.current_thread_id().is_some() {
                total.saturating_sub(1)
            } else {
                total
            };
            if self.parked.load(Ordering::Acquire) >= target {
                break;
            }

            if !warned && started.elapsed() > SLOW_SUSPENSION {
                let mutators = self.mutators.lock();
                let stragglers: Vec<u64> = mutators
                    .iter()
                    .filter(|(_, m)| m.state() != MutatorState::AtSafePoint)
                    .map(|(id, _)| *id)
                    .collect();
                warn!(
                    total,
                    parked = self.parked.load(Ordering::Acquire),
                    ?stragglers,
                    "suspension for code patching is taking longer than expected"
                );
                warned = true;
            }

            self.parked_changed
                .wait_for(&mut guard, Duration::from_millis(10));
        }

        debug!(
            elapsed_us = started.elapsed().as_micros() as u64,
            "all mutators suspended"
        );
        SuspensionGuard::new(self, guard)
    }

    fn resume_all(&self) {
        self.suspend_requested.store(false, Ordering::Release);
        self.parked_changed.notify_all();
        debug!("mutators resumed");
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps every other mutator parked until dropped.
pub struct SuspensionGuard<'a> {
    manager: &'a ThreadManager,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> SuspensionGuard<'a> {
    fn new(manager: &'a ThreadManager, lock: MutexGuard<'a, ()>) -> Self {
        IS_SUSPENDING.set(true);
        Self {
            manager,
            _lock: lock,
        }
    }
}

impl Drop for SuspensionGuard<'_> {
    fn drop(&mut self) {
        self.manager.resume_all();
        IS_SUSPENDING.set(false);
    }
}

impl std::fmt::Debug for SuspensionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspensionGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_registration() {
        let manager = ThreadManager::new();
        let id = manager.register_thread();
        assert_eq!(manager.thread_count(), 1);
        assert_eq!(manager.current_thread_id(), Some(id));
        assert_eq!(manager.state_of(id), Some(MutatorState::Running));

        manager.unregister_thread(id);
        assert_eq!(manager.thread_count(), 0);
        assert_eq!(manager.current_thread_id(), None);
    }

    #[test]
    fn test_safe_point_without_request_returns() {
        let manager = ThreadManager::new();
        let id = manager.register_thread();
        manager.safe_point(id);
        manager.unregister_thread(id);
    }

    #[test]
    fn test_suspending_mutator_is_not_waited_for() {
        let manager = ThreadManager::new();
        let id = manager.register_thread();
        {
            let _guard = manager.suspend_all();
            assert!(manager.is_suspended());
            // Own safe points must not deadlock.
            manager.safe_point(id);
        }
        assert!(!manager.is_suspended());
        manager.unregister_thread(id);
    }

    #[test]
    fn test_suspension_parks_workers() {
        let manager = Arc::new(ThreadManager::new());
        let stop = Arc::new(AtomicBool::new(false));
        let in_window = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let stop = stop.clone();
                let in_window = in_window.clone();
                let violations = violations.clone();
                thread::spawn(move || {
                    let id = manager.register_thread();
                    while !stop.load(Ordering::Acquire) {
                        if in_window.load(Ordering::Acquire) {
                            violations.fetch_add(1, Ordering::Relaxed);
                        }
                        manager.safe_point(id);
                    }
                    manager.unregister_thread(id);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        for _ in 0..5 {
            let guard = manager.suspend_all();
            in_window.store(true, Ordering::Release);
            thread::sleep(Duration::from_millis(5));
            in_window.store(false, Ordering::Release);
            drop(guard);
            thread::sleep(Duration::from_millis(2));
        }
        stop.store(true, Ordering::Release);

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::Relaxed), 0);
        assert_eq!(manager.thread_count(), 0);
    }

    #[test]
    fn test_registration_during_suspension() {
        let manager = Arc::new(ThreadManager::new());
        let suspender = {
            let manager = manager.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                let _guard = manager.suspend_all();
                thread::sleep(Duration::from_millis(50));
            })
        };
        let worker = {
            let manager = manager.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    let id = manager.register_thread();
                    thread::sleep(Duration::from_millis(3));
                    manager.safe_point(id);
                    manager.unregister_thread(id);
                }
            })
        };
        worker.join().unwrap();
        suspender.join().unwrap();
        assert_eq!(manager.thread_count(), 0);
    }
}
