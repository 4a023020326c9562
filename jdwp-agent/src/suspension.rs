// Suspension and run-lock coordination
//
// The host VM advances the whole target program on one logical execution
// thread, checking for debugger pauses only at safe points between
// indivisible steps. Debugger commands run on separate threads. A single
// reentrant RunLock serializes the two roles; suspend-counter bookkeeping
// lives under its own lock so a command thread never deadlocks against a
// parked execution thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::protocol::{AgentError, AgentResult};
use crate::vm::{handle_key, HandleRef, HostVm};

/// Mutual exclusion between the execution thread and command threads.
///
/// Reentrant by owner thread id: the holder may lock again without
/// deadlocking, and the lock is released once the depth returns to zero.
pub struct RunLock {
    state: Mutex<RunLockState>,
    available: Condvar,
}

#[derive(Default)]
struct RunLockState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl RunLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunLockState::default()),
            available: Condvar::new(),
        }
    }

    pub fn lock(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            self.available.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    pub fn unlock(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(me), "run lock released by non-owner");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.available.notify_one();
        }
    }

    pub fn guard(&self) -> RunLockGuard<'_> {
        self.lock();
        RunLockGuard { lock: self }
    }
}

pub struct RunLockGuard<'a> {
    lock: &'a RunLock,
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[derive(Default)]
struct SuspendState {
    // Keyed by thread handle identity.
    counts: HashMap<usize, u32>,
    all_suspended: bool,
    exit_requested: bool,
}

/// Reconciles debugger suspend/resume with the single-run-lock host VM.
///
/// The host model runs all threads or none, so suspending any one thread
/// conservatively pauses the whole machine (`all_suspended`); resume is
/// conjunctive and only lets the machine continue once every live thread's
/// counter is back to zero. This whole-machine approximation is part of
/// the model, not an accident.
pub struct SuspensionCoordinator {
    vm: Arc<dyn HostVm>,
    run_lock: RunLock,
    state: Mutex<SuspendState>,
    wakeup: Condvar,
}

impl SuspensionCoordinator {
    pub fn new(vm: Arc<dyn HostVm>) -> Self {
        Self {
            vm,
            run_lock: RunLock::new(),
            state: Mutex::new(SuspendState::default()),
            wakeup: Condvar::new(),
        }
    }

    pub fn run_lock(&self) -> &RunLock {
        &self.run_lock
    }

    pub fn mark_thread_suspended(&self, thread: &HandleRef) {
        let mut state = self.state.lock();
        let count = state.counts.entry(handle_key(thread)).or_insert(0);
        *count += 1;
        let count = *count;
        state.all_suspended = true;
        debug!(?thread, count, "thread suspended, machine paused");
    }

    pub fn mark_thread_resumed(&self, thread: &HandleRef) {
        let mut state = self.state.lock();
        if let Some(count) = state.counts.get_mut(&handle_key(thread)) {
            *count = count.saturating_sub(1);
            trace!(?thread, count = *count, "thread resume");
        }
        self.conditionally_resume_vm(&mut state);
    }

    pub fn mark_vm_suspended(&self) {
        let mut state = self.state.lock();
        for thread in self.vm.live_threads() {
            *state.counts.entry(handle_key(&thread)).or_insert(0) += 1;
        }
        state.all_suspended = true;
        debug!("machine suspended");
    }

    pub fn mark_vm_resumed(&self) {
        let mut state = self.state.lock();
        for thread in self.vm.live_threads() {
            if let Some(count) = state.counts.get_mut(&handle_key(&thread)) {
                *count = count.saturating_sub(1);
            }
        }
        self.conditionally_resume_vm(&mut state);
    }

    /// Clear `all_suspended` and wake the execution thread only when every
    /// live thread's counter is zero.
    fn conditionally_resume_vm(&self, state: &mut SuspendState) {
        let all_zero = self
            .vm
            .live_threads()
            .iter()
            .all(|t| state.counts.get(&handle_key(t)).copied().unwrap_or(0) == 0);
        if all_zero && state.all_suspended {
            state.all_suspended = false;
            debug!("machine resumed");
            self.wakeup.notify_all();
        }
    }

    pub fn suspend_count(&self, thread: &HandleRef) -> u32 {
        self.state
            .lock()
            .counts
            .get(&handle_key(thread))
            .copied()
            .unwrap_or(0)
    }

    /// A thread is suspended if its own counter is positive or the whole
    /// machine is paused.
    pub fn is_thread_suspended(&self, thread: &HandleRef) -> bool {
        let state = self.state.lock();
        state.all_suspended
            || state
                .counts
                .get(&handle_key(thread))
                .is_some_and(|c| *c > 0)
    }

    pub fn is_all_suspended(&self) -> bool {
        self.state.lock().all_suspended
    }

    pub fn exit_requested(&self) -> bool {
        self.state.lock().exit_requested
    }

    /// Sticky termination signal: wakes the parked execution thread and
    /// makes every later hook and wake fail fast.
    pub fn request_exit(&self) {
        let mut state = self.state.lock();
        state.exit_requested = true;
        debug!("exit requested");
        self.wakeup.notify_all();
    }

    /// Session teardown: drop every suspension and let the machine run.
    pub fn clear_suspensions(&self) {
        let mut state = self.state.lock();
        state.counts.clear();
        if state.all_suspended {
            state.all_suspended = false;
            self.wakeup.notify_all();
        }
        debug!("suspension state cleared");
    }

    /// Park the execution thread until the machine is resumed.
    ///
    /// Callable only by the execution thread, with the RunLock held once.
    /// Releases the RunLock for the duration of the wait so command
    /// threads get in, and re-checks the exit flag on every wake to guard
    /// against spurious wakeups and exit races.
    pub fn block_vm_execution(&self) -> AgentResult<()> {
        self.run_lock.unlock();
        let exit = {
            let mut state = self.state.lock();
            while state.all_suspended && !state.exit_requested {
                self.wakeup.wait(&mut state);
            }
            state.exit_requested
        };
        self.run_lock.lock();
        if exit {
            return Err(AgentError::VmDead);
        }
        Ok(())
    }

    /// Safe-point check, called by the execution thread between steps.
    ///
    /// Blocks repeatedly while the machine is suspended, raises the
    /// termination signal if exit was requested, and otherwise yields the
    /// RunLock once so command threads get a fair window.
    pub fn execution_hook(&self) -> AgentResult<()> {
        while self.is_all_suspended() {
            self.block_vm_execution()?;
        }
        if self.exit_requested() {
            return Err(AgentError::VmDead);
        }
        self.run_lock.unlock();
        self.run_lock.lock();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEntity, MockVm};
    use std::sync::mpsc;
    use std::time::Duration;

    fn coordinator_with_threads(names: &[&str]) -> (Arc<SuspensionCoordinator>, Vec<HandleRef>) {
        let vm = Arc::new(MockVm::new());
        let threads: Vec<HandleRef> = names.iter().map(|n| vm.spawn_thread(n)).collect();
        (Arc::new(SuspensionCoordinator::new(vm)), threads)
    }

    #[test]
    fn single_thread_suspend_pauses_the_machine() {
        let (coord, threads) = coordinator_with_threads(&["main", "worker"]);

        coord.mark_thread_suspended(&threads[0]);
        assert!(coord.is_all_suspended());
        assert!(coord.is_thread_suspended(&threads[1])); // machine-wide pause

        coord.mark_thread_resumed(&threads[0]);
        assert!(!coord.is_all_suspended());
    }

    #[test]
    fn resume_is_conjunctive() {
        let (coord, threads) = coordinator_with_threads(&["a", "b"]);

        coord.mark_thread_suspended(&threads[0]);
        coord.mark_thread_suspended(&threads[1]);
        coord.mark_vm_resumed();
        assert_eq!(coord.suspend_count(&threads[0]), 0);
        assert_eq!(coord.suspend_count(&threads[1]), 0);
        assert!(!coord.is_all_suspended());

        // Same shape, but one thread suspended twice: the global resume
        // leaves it at 1 and the machine stays paused.
        coord.mark_thread_suspended(&threads[0]);
        coord.mark_thread_suspended(&threads[0]);
        coord.mark_thread_suspended(&threads[1]);
        coord.mark_vm_resumed();
        assert_eq!(coord.suspend_count(&threads[0]), 1);
        assert_eq!(coord.suspend_count(&threads[1]), 0);
        assert!(coord.is_all_suspended());

        coord.mark_thread_resumed(&threads[0]);
        assert!(!coord.is_all_suspended());
    }

    #[test]
    fn resume_below_zero_is_floored() {
        let (coord, threads) = coordinator_with_threads(&["main"]);
        coord.mark_thread_resumed(&threads[0]);
        assert_eq!(coord.suspend_count(&threads[0]), 0);

        coord.mark_thread_suspended(&threads[0]);
        coord.mark_thread_resumed(&threads[0]);
        coord.mark_thread_resumed(&threads[0]);
        coord.mark_thread_suspended(&threads[0]);
        assert_eq!(coord.suspend_count(&threads[0]), 1);
    }

    #[test]
    fn run_lock_is_reentrant_and_exclusive() {
        let (coord, _) = coordinator_with_threads(&["main"]);
        let lock = coord.run_lock();

        lock.lock();
        lock.lock(); // reentrant
        let (tx, rx) = mpsc::channel();
        std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = coord.run_lock().guard();
                tx.send(()).unwrap();
            });
            // Still held twice: the other thread stays out.
            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
            lock.unlock();
            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
            lock.unlock();
            assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        });
    }

    #[test]
    fn execution_thread_parks_until_resume() {
        let (coord, threads) = coordinator_with_threads(&["main"]);
        coord.mark_thread_suspended(&threads[0]);

        let (tx, rx) = mpsc::channel();
        let hook_coord = Arc::clone(&coord);
        let exec = std::thread::spawn(move || {
            hook_coord.run_lock().lock();
            let result = hook_coord.execution_hook();
            hook_coord.run_lock().unlock();
            tx.send(()).unwrap();
            result
        });

        // Parked: the hook does not return while suspended.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        coord.mark_thread_resumed(&threads[0]);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(exec.join().unwrap().is_ok());
    }

    #[test]
    fn exit_request_unparks_with_termination_signal() {
        let (coord, _) = coordinator_with_threads(&["main"]);
        coord.mark_vm_suspended();

        let hook_coord = Arc::clone(&coord);
        let exec = std::thread::spawn(move || {
            hook_coord.run_lock().lock();
            let result = hook_coord.execution_hook();
            hook_coord.run_lock().unlock();
            result
        });

        coord.request_exit();
        let result = exec.join().unwrap();
        assert!(matches!(result, Err(AgentError::VmDead)));

        // Sticky: a later hook fails immediately.
        coord.run_lock().lock();
        assert!(matches!(coord.execution_hook(), Err(AgentError::VmDead)));
        coord.run_lock().unlock();
    }
}
