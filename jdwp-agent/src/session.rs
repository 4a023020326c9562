// Debug session wiring
//
// One session per debugger connection. Every manager is session-scoped and
// threaded through explicitly; there is no process-global state, so
// independent sessions (and tests) coexist freely.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info};

use crate::events::{write_composite, Event, MatchedEvent, RequestId};
use crate::ids::IdentifierManager;
use crate::protocol::{AgentError, AgentResult};
use crate::request::{EventRequestManager, SuspendPolicy};
use crate::suspension::SuspensionCoordinator;
use crate::vm::{handles_equal, HandleRef, HostVm};

/// Where serialized composite event packets go. The transport layer wraps
/// each one into a command packet (set 64, command 100) toward the
/// debugger.
pub trait EventSink: Send {
    fn deliver(&mut self, composite: &[u8]) -> AgentResult<()>;
}

/// Collecting sink, handy for tests and buffered embeddings.
impl EventSink for Vec<Vec<u8>> {
    fn deliver(&mut self, composite: &[u8]) -> AgentResult<()> {
        self.push(composite.to_vec());
        Ok(())
    }
}

pub struct Session {
    vm: Arc<dyn HostVm>,
    ids: IdentifierManager,
    requests: EventRequestManager,
    coordinator: SuspensionCoordinator,
    next_request_id: AtomicI32,
}

impl Session {
    pub fn new(vm: Arc<dyn HostVm>) -> Self {
        Self {
            coordinator: SuspensionCoordinator::new(vm.clone()),
            vm,
            ids: IdentifierManager::new(),
            requests: EventRequestManager::new(),
            next_request_id: AtomicI32::new(1),
        }
    }

    pub fn vm(&self) -> &Arc<dyn HostVm> {
        &self.vm
    }

    pub fn ids(&self) -> &IdentifierManager {
        &self.ids
    }

    pub fn requests(&self) -> &EventRequestManager {
        &self.requests
    }

    pub fn coordinator(&self) -> &SuspensionCoordinator {
        &self.coordinator
    }

    /// Mint a fresh 4-byte request id. Id 0 stays reserved for the
    /// synthetic requests.
    pub fn next_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Guard for handlers whose operation requires the thread to already
    /// be suspended.
    pub fn ensure_thread_suspended(&self, thread: &HandleRef) -> AgentResult<()> {
        if self.coordinator.is_thread_suspended(thread) {
            Ok(())
        } else {
            Err(AgentError::ThreadNotSuspended)
        }
    }

    /// Report one or more simultaneously produced events: match them
    /// against the registered requests, enact the computed suspend policy,
    /// then serialize and deliver the composite envelope.
    ///
    /// Suspension is enacted before delivery so the execution thread
    /// cannot advance past the producing instruction before the decision
    /// has taken effect; it parks at its next `execution_hook`. Events
    /// that match nothing cost no identifier allocation and produce no
    /// packet.
    pub fn report_events(
        &self,
        events: &[Event],
        sink: &mut dyn EventSink,
    ) -> AgentResult<SuspendPolicy> {
        let mut matched: Vec<MatchedEvent> = Vec::new();
        let mut policy = SuspendPolicy::None;
        for event in events {
            policy = self.requests.match_event(event, &mut matched, policy, &self.ids);
        }
        if matched.is_empty() {
            return Ok(SuspendPolicy::None);
        }

        match policy {
            SuspendPolicy::None => {}
            SuspendPolicy::EventThread => {
                // A batch may span threads; suspend each one exactly once.
                let mut suspended: Vec<&HandleRef> = Vec::new();
                for thread in matched.iter().filter_map(|m| m.event.thread()) {
                    if !suspended.iter().any(|s| handles_equal(s, thread)) {
                        self.coordinator.mark_thread_suspended(thread);
                        suspended.push(thread);
                    }
                }
            }
            SuspendPolicy::All => self.coordinator.mark_vm_suspended(),
        }

        let mut buf = BytesMut::new();
        write_composite(&mut buf, policy, &matched, &self.ids)?;
        info!(
            events = matched.len(),
            ?policy,
            bytes = buf.len(),
            "delivering composite event"
        );
        sink.deliver(&buf)?;
        Ok(policy)
    }

    pub fn report_event(
        &self,
        event: Event,
        sink: &mut dyn EventSink,
    ) -> AgentResult<SuspendPolicy> {
        self.report_events(std::slice::from_ref(&event), sink)
    }

    /// Session teardown (VirtualMachine.Dispose): identifiers, event
    /// requests and suspensions are all session-scoped and never leak into
    /// a later session. Outstanding collection pins are handed back to the
    /// host VM, so disconnecting re-enables collection everywhere the
    /// debugger disabled it.
    pub fn dispose(&self) {
        debug!("session disposed");
        self.requests.clear_all();
        for handle in self.ids.clear() {
            self.vm.gc_unpin(&handle);
        }
        self.coordinator.clear_suspensions();
    }
}
