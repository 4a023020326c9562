// Event request registry and matching
//
// Registration runs on command threads while matching runs on the
// execution thread, so each event kind gets its own lock instead of one
// registry-wide lock.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::events::{Event, EventKind, MatchedEvent, RequestId};
use crate::filter::Filter;
use crate::ids::IdentifierManager;

/// How broadly execution pauses when an event fires. Totally ordered:
/// escalation across simultaneously matched requests takes the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

impl SuspendPolicy {
    pub fn wire(self) -> u8 {
        match self {
            SuspendPolicy::None => 0,
            SuspendPolicy::EventThread => 1,
            SuspendPolicy::All => 2,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SuspendPolicy::None),
            1 => Some(SuspendPolicy::EventThread),
            2 => Some(SuspendPolicy::All),
            _ => None,
        }
    }

    pub fn escalate(self, other: SuspendPolicy) -> SuspendPolicy {
        self.max(other)
    }
}

/// Request id used by the synthetic, auto-registered requests.
pub const SYNTHETIC_REQUEST_ID: RequestId = 0;

/// Debugger interest in one event kind, with an ordered filter chain.
#[derive(Debug)]
pub struct EventRequest {
    pub id: RequestId,
    pub kind: EventKind,
    pub policy: SuspendPolicy,
    pub filters: Vec<Filter>,
}

impl EventRequest {
    pub fn new(
        id: RequestId,
        kind: EventKind,
        policy: SuspendPolicy,
        filters: Vec<Filter>,
    ) -> Self {
        Self {
            id,
            kind,
            policy,
            filters,
        }
    }

    fn is_synthetic(&self) -> bool {
        self.id == SYNTHETIC_REQUEST_ID
    }

    /// Every filter must accept, in order, short-circuiting on the first
    /// rejection. Count filters depend on the short-circuit.
    fn matches(&mut self, event: &Event, ids: &IdentifierManager) -> bool {
        self.filters.iter_mut().all(|f| f.accepts(event, ids))
    }
}

/// Per-kind request tables. Thread-end and vm-init are wire aliases of
/// thread-death and vm-start, so they share storage by construction.
pub struct EventRequestManager {
    tables: HashMap<EventKind, Mutex<Vec<EventRequest>>>,
}

impl EventRequestManager {
    /// Build the registry and auto-register the synthetic start/death
    /// requests the protocol promises without any SET command.
    pub fn new() -> Self {
        let tables = EventKind::ALL
            .iter()
            .map(|&kind| (kind, Mutex::new(Vec::new())))
            .collect();
        let manager = Self { tables };

        for kind in [
            EventKind::VmStart,
            EventKind::VmDeath,
            EventKind::ThreadStart,
            EventKind::ThreadDeath,
        ] {
            manager.add(EventRequest::new(
                SYNTHETIC_REQUEST_ID,
                kind,
                SuspendPolicy::None,
                Vec::new(),
            ));
        }
        manager
    }

    fn table(&self, kind: EventKind) -> &Mutex<Vec<EventRequest>> {
        // Every kind is inserted at construction.
        &self.tables[&kind]
    }

    pub fn add(&self, request: EventRequest) {
        debug!(kind = ?request.kind, id = request.id, policy = ?request.policy, "event request registered");
        self.table(request.kind).lock().push(request);
    }

    /// Removing a request that does not exist is success, not an error;
    /// debuggers retry CLEAR freely. Synthetic requests are not removable.
    pub fn remove(&self, kind: EventKind, id: RequestId) {
        let mut requests = self.table(kind).lock();
        requests.retain(|r| r.is_synthetic() || r.id != id);
        debug!(?kind, id, "event request cleared");
    }

    pub fn clear(&self, kind: EventKind) {
        self.table(kind).lock().retain(|r| r.is_synthetic());
        debug!(?kind, "event requests cleared");
    }

    pub fn clear_all(&self) {
        for kind in EventKind::ALL {
            self.table(kind).lock().retain(|r| r.is_synthetic());
        }
        debug!("all event requests cleared");
    }

    pub fn request_count(&self, kind: EventKind) -> usize {
        self.table(kind).lock().len()
    }

    /// Match `event` against every request of its kind in registration
    /// order, append it to `matched` at most once (recording every
    /// matching request id), and fold each matching request's suspend
    /// policy into `policy` by max-restrictiveness.
    pub fn match_event(
        &self,
        event: &Event,
        matched: &mut Vec<MatchedEvent>,
        mut policy: SuspendPolicy,
        ids: &IdentifierManager,
    ) -> SuspendPolicy {
        let mut requests = self.table(event.kind()).lock();

        let mut matching: Vec<RequestId> = Vec::new();
        for request in requests.iter_mut() {
            if request.matches(event, ids) {
                trace!(kind = ?event.kind(), id = request.id, "event matched request");
                policy = policy.escalate(request.policy);
                matching.push(request.id);
            }
        }

        if !matching.is_empty() {
            matched.push(MatchedEvent {
                event: event.clone(),
                requests: matching,
            });
        }
        policy
    }
}

impl Default for EventRequestManager {
    fn default() -> Self {
        Self::new()
    }
}
