// Deterministic, in-memory host VM test double.
//
// Entities are plain `Arc` allocations, so "the VM collects an object" is
// literally dropping the strong reference and letting the identifier
// manager's weak slot die.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::vm::{handle_key, handles_equal, HandleRef, HostObject, HostVm};

/// A mock object, thread, class or frame.
#[derive(Debug)]
pub struct MockEntity {
    name: String,
    type_name: Option<String>,
    runtime_type: Option<HandleRef>,
}

impl MockEntity {
    /// A plain entity (object, thread, frame).
    pub fn named(name: &str) -> HandleRef {
        Arc::new(Self {
            name: name.to_string(),
            type_name: None,
            runtime_type: None,
        })
    }

    /// A reference-type entity with a dotted name.
    pub fn class(name: &str) -> HandleRef {
        Arc::new(Self {
            name: name.to_string(),
            type_name: Some(name.to_string()),
            runtime_type: None,
        })
    }

    /// An object whose runtime type is `class`.
    pub fn instance_of(name: &str, class: &HandleRef) -> HandleRef {
        Arc::new(Self {
            name: name.to_string(),
            type_name: None,
            runtime_type: Some(class.clone()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl HostObject for MockEntity {
    fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    fn runtime_type(&self) -> Option<HandleRef> {
        self.runtime_type.clone()
    }
}

/// Mock VM: a mutable thread list plus recorded GC pin/unpin calls.
#[derive(Default)]
pub struct MockVm {
    threads: Mutex<Vec<HandleRef>>,
    pin_calls: Mutex<Vec<usize>>,
    unpin_calls: Mutex<Vec<usize>>,
    terminated: AtomicBool,
}

impl MockVm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_thread(&self, name: &str) -> HandleRef {
        let thread = MockEntity::named(name);
        self.threads.lock().push(thread.clone());
        thread
    }

    pub fn kill_thread(&self, thread: &HandleRef) {
        self.threads.lock().retain(|t| !handles_equal(t, thread));
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn pin_calls(&self) -> Vec<usize> {
        self.pin_calls.lock().clone()
    }

    pub fn unpin_calls(&self) -> Vec<usize> {
        self.unpin_calls.lock().clone()
    }
}

impl HostVm for MockVm {
    fn live_threads(&self) -> Vec<HandleRef> {
        self.threads.lock().clone()
    }

    fn gc_pin(&self, handle: &HandleRef) {
        self.pin_calls.lock().push(handle_key(handle));
    }

    fn gc_unpin(&self, handle: &HandleRef) {
        self.unpin_calls.lock().push(handle_key(handle));
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
