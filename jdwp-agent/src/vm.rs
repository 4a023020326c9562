// Host VM collaborator interface
//
// The agent never executes the target program itself. It inspects and
// controls a VM that advances the program on a single logical execution
// thread, pausing only at cooperative safe points.

use std::fmt;
use std::sync::{Arc, Weak};

/// An entity the host VM exposes to the debugger: an object, thread,
/// thread group, reference type or stack frame.
///
/// Identity is the allocation itself: two handles denote the same entity
/// iff they point at the same `Arc` allocation. The VM reclaims an entity
/// by dropping its strong references, which is what invalidates the
/// identifier manager's weak slots.
pub trait HostObject: fmt::Debug + Send + Sync + 'static {
    /// Dotted type name for reference-type handles (e.g. `java.util.List`).
    /// `None` for handles that are not reference types.
    fn type_name(&self) -> Option<&str> {
        None
    }

    /// Reference type of an object handle. `None` for handles that are not
    /// objects (or whose type the VM does not expose).
    fn runtime_type(&self) -> Option<HandleRef> {
        None
    }
}

pub type HandleRef = Arc<dyn HostObject>;
pub type WeakHandle = Weak<dyn HostObject>;

/// Address-based identity key for a handle.
///
/// Stable for the lifetime of the allocation. The address may be reused
/// after the VM collects the entity, so map hits keyed on this value must
/// be re-verified against the live handle (see `IdentifierManager`).
pub fn handle_key(handle: &HandleRef) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

pub fn handles_equal(a: &HandleRef, b: &HandleRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// What the agent consumes from the host VM.
///
/// Event production is not part of this trait: the VM's instruction hook
/// constructs `Event` values itself and feeds them to
/// `Session::report_events`.
pub trait HostVm: Send + Sync + 'static {
    /// Threads currently alive in the target program.
    fn live_threads(&self) -> Vec<HandleRef>;

    /// Keep the referent of `handle` alive until a matching `gc_unpin`,
    /// regardless of reachability in the target program.
    fn gc_pin(&self, handle: &HandleRef);

    fn gc_unpin(&self, handle: &HandleRef);

    /// True once the target program has terminated.
    fn is_terminated(&self) -> bool;
}
