// Command dispatch
//
// Two-level lookup: (command set, command) -> handler, one trait with a
// single execution method per command. The dispatcher holds the RunLock
// for the whole handler execution, so command threads and the execution
// thread never observe half-applied state, and maps failures to protocol
// error codes at the boundary.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::constants::{
    command_sets, event_request_commands, object_commands, thread_commands, vm_commands,
};
use crate::events::EventKind;
use crate::filter;
use crate::ids::IdKind;
use crate::protocol::{error_code_name, error_codes, AgentError, AgentResult, Reply};
use crate::request::{EventRequest, SuspendPolicy};
use crate::session::Session;
use crate::wire;

pub trait CommandHandler: Send + Sync {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        reply: &mut BytesMut,
    ) -> AgentResult<()>;
}

pub struct CommandDispatcher {
    handlers: HashMap<(u8, u8), Box<dyn CommandHandler>>,
}

impl CommandDispatcher {
    /// Dispatcher with the structural command set registered: event
    /// requests, suspension, collection pinning, disposal. Handlers that
    /// read or write VM state (frames, values, signatures) are registered
    /// by the embedding VM on top of these.
    pub fn new() -> Self {
        let mut dispatcher = Self {
            handlers: HashMap::new(),
        };

        dispatcher.register(
            command_sets::EVENT_REQUEST,
            event_request_commands::SET,
            EventRequestSet,
        );
        dispatcher.register(
            command_sets::EVENT_REQUEST,
            event_request_commands::CLEAR,
            EventRequestClear,
        );
        dispatcher.register(
            command_sets::EVENT_REQUEST,
            event_request_commands::CLEAR_ALL_BREAKPOINTS,
            ClearAllBreakpoints,
        );
        dispatcher.register(command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND, VmSuspend);
        dispatcher.register(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, VmResume);
        dispatcher.register(command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE, VmDispose);
        dispatcher.register(
            command_sets::THREAD_REFERENCE,
            thread_commands::SUSPEND,
            ThreadSuspend,
        );
        dispatcher.register(
            command_sets::THREAD_REFERENCE,
            thread_commands::RESUME,
            ThreadResume,
        );
        dispatcher.register(
            command_sets::THREAD_REFERENCE,
            thread_commands::SUSPEND_COUNT,
            ThreadSuspendCount,
        );
        dispatcher.register(
            command_sets::OBJECT_REFERENCE,
            object_commands::DISABLE_COLLECTION,
            DisableCollection,
        );
        dispatcher.register(
            command_sets::OBJECT_REFERENCE,
            object_commands::ENABLE_COLLECTION,
            EnableCollection,
        );
        dispatcher.register(
            command_sets::OBJECT_REFERENCE,
            object_commands::IS_COLLECTED,
            IsCollected,
        );
        dispatcher
    }

    pub fn register(&mut self, set: u8, command: u8, handler: impl CommandHandler + 'static) {
        self.handlers.insert((set, command), Box::new(handler));
    }

    /// Execute one command payload and produce the reply. The transport
    /// layer supplies the payload and frames the result.
    pub fn dispatch(&self, session: &Session, set: u8, command: u8, payload: &[u8]) -> Reply {
        let _run = session.coordinator().run_lock().guard();

        if self.vm_is_dead(session) {
            return Reply::error(error_codes::VM_DEAD);
        }

        let Some(handler) = self.handlers.get(&(set, command)) else {
            warn!(set, command, "command not implemented");
            return Reply::error(error_codes::NOT_IMPLEMENTED);
        };

        debug!(set, command, len = payload.len(), "dispatching command");
        let mut payload = payload;
        let mut data = BytesMut::new();
        match handler.execute(session, &mut payload, &mut data) {
            Ok(()) => Reply::ok(data.to_vec()),
            Err(err) => {
                // Target termination supersedes whatever else went wrong.
                let code = if self.vm_is_dead(session) {
                    error_codes::VM_DEAD
                } else {
                    err.error_code()
                };
                warn!(set, command, %err, code = error_code_name(code), "command failed");
                // The scratch reply buffer is discarded: a failed command
                // never emits a partial reply.
                Reply::error(code)
            }
        }
    }

    fn vm_is_dead(&self, session: &Session) -> bool {
        session.coordinator().exit_requested() || session.vm().is_terminated()
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ---- EventRequest (set 15) ----

struct EventRequestSet;

impl CommandHandler for EventRequestSet {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        reply: &mut BytesMut,
    ) -> AgentResult<()> {
        let kind_byte = wire::read_u8(payload)?;
        let kind =
            EventKind::from_wire(kind_byte).ok_or(AgentError::InvalidEventKind(kind_byte))?;
        let policy_byte = wire::read_u8(payload)?;
        let policy = SuspendPolicy::from_wire(policy_byte).ok_or_else(|| {
            AgentError::Malformed(format!("invalid suspend policy {policy_byte}"))
        })?;
        let filters = filter::parse_modifiers(payload)?;

        let id = session.next_request_id();
        session
            .requests()
            .add(EventRequest::new(id, kind, policy, filters));
        reply.put_i32(id);
        Ok(())
    }
}

struct EventRequestClear;

impl CommandHandler for EventRequestClear {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        let kind_byte = wire::read_u8(payload)?;
        let kind =
            EventKind::from_wire(kind_byte).ok_or(AgentError::InvalidEventKind(kind_byte))?;
        let id = wire::read_i32(payload)?;
        // Clearing an unknown request succeeds; debuggers retry freely.
        session.requests().remove(kind, id);
        Ok(())
    }
}

struct ClearAllBreakpoints;

impl CommandHandler for ClearAllBreakpoints {
    fn execute(
        &self,
        session: &Session,
        _payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        session.requests().clear(EventKind::Breakpoint);
        Ok(())
    }
}

// ---- VirtualMachine (set 1) ----

struct VmSuspend;

impl CommandHandler for VmSuspend {
    fn execute(
        &self,
        session: &Session,
        _payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        session.coordinator().mark_vm_suspended();
        Ok(())
    }
}

struct VmResume;

impl CommandHandler for VmResume {
    fn execute(
        &self,
        session: &Session,
        _payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        session.coordinator().mark_vm_resumed();
        Ok(())
    }
}

struct VmDispose;

impl CommandHandler for VmDispose {
    fn execute(
        &self,
        session: &Session,
        _payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        session.dispose();
        Ok(())
    }
}

// ---- ThreadReference (set 11) ----

struct ThreadSuspend;

impl CommandHandler for ThreadSuspend {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        let id = wire::read_u64(payload)?;
        let thread = session.ids().expect(IdKind::Thread, id)?;
        session.coordinator().mark_thread_suspended(&thread);
        Ok(())
    }
}

struct ThreadResume;

impl CommandHandler for ThreadResume {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        let id = wire::read_u64(payload)?;
        let thread = session.ids().expect(IdKind::Thread, id)?;
        session.coordinator().mark_thread_resumed(&thread);
        Ok(())
    }
}

struct ThreadSuspendCount;

impl CommandHandler for ThreadSuspendCount {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        reply: &mut BytesMut,
    ) -> AgentResult<()> {
        let id = wire::read_u64(payload)?;
        let thread = session.ids().expect(IdKind::Thread, id)?;
        reply.put_i32(session.coordinator().suspend_count(&thread) as i32);
        Ok(())
    }
}

// ---- ObjectReference (set 9) ----

struct DisableCollection;

impl CommandHandler for DisableCollection {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        let id = wire::read_u64(payload)?;
        let (handle, first_pin) = session.ids().disable_collection(IdKind::Object, id)?;
        if first_pin {
            session.vm().gc_pin(&handle);
        }
        Ok(())
    }
}

struct EnableCollection;

impl CommandHandler for EnableCollection {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        _reply: &mut BytesMut,
    ) -> AgentResult<()> {
        let id = wire::read_u64(payload)?;
        if let Some(handle) = session.ids().enable_collection(IdKind::Object, id)? {
            session.vm().gc_unpin(&handle);
        }
        Ok(())
    }
}

struct IsCollected;

impl CommandHandler for IsCollected {
    fn execute(
        &self,
        session: &Session,
        payload: &mut &[u8],
        reply: &mut BytesMut,
    ) -> AgentResult<()> {
        let id = wire::read_u64(payload)?;
        let collected = session.ids().is_collected(IdKind::Object, id)?;
        reply.put_u8(u8::from(collected));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::modifier_kinds;
    use crate::events::{Event, Location};
    use crate::mock::{MockEntity, MockVm};
    use crate::vm::handle_key;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (CommandDispatcher, Arc<Session>, Arc<MockVm>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let vm = Arc::new(MockVm::new());
        let session = Arc::new(Session::new(vm.clone()));
        (CommandDispatcher::new(), session, vm)
    }

    fn set_breakpoint_payload(class_id: u64, method: u64, index: u64, policy: u8) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(EventKind::Breakpoint.wire());
        buf.put_u8(policy);
        buf.put_i32(1);
        buf.put_u8(modifier_kinds::LOCATION_ONLY);
        buf.put_u8(1);
        buf.put_u64(class_id);
        buf.put_u64(method);
        buf.put_u64(index);
        buf.to_vec()
    }

    #[test]
    fn set_replies_with_a_fresh_request_id() {
        let (dispatcher, session, _vm) = setup();
        let class = MockEntity::class("com.example.Main");
        let class_id = session.ids().get_or_create(IdKind::ReferenceType, Some(&class));

        let payload = set_breakpoint_payload(class_id, 3, 14, 2);
        let reply = dispatcher.dispatch(
            &session,
            command_sets::EVENT_REQUEST,
            event_request_commands::SET,
            &payload,
        );

        assert!(!reply.is_error());
        assert_eq!(reply.data, vec![0, 0, 0, 1]); // first minted id
        assert_eq!(session.requests().request_count(EventKind::Breakpoint), 1);

        let reply = dispatcher.dispatch(
            &session,
            command_sets::EVENT_REQUEST,
            event_request_commands::SET,
            &payload,
        );
        assert_eq!(reply.data, vec![0, 0, 0, 2]);
    }

    #[test]
    fn clear_of_unknown_request_is_success() {
        let (dispatcher, session, _vm) = setup();

        let mut payload = BytesMut::new();
        payload.put_u8(EventKind::Breakpoint.wire());
        payload.put_i32(12345);
        let reply = dispatcher.dispatch(
            &session,
            command_sets::EVENT_REQUEST,
            event_request_commands::CLEAR,
            &payload,
        );
        assert!(!reply.is_error());
    }

    #[test]
    fn unknown_command_maps_to_not_implemented() {
        let (dispatcher, session, _vm) = setup();
        let reply = dispatcher.dispatch(&session, 200, 1, &[]);
        assert_eq!(reply.error_code, error_codes::NOT_IMPLEMENTED);
    }

    #[test]
    fn malformed_payload_yields_illegal_argument_and_no_partial_reply() {
        let (dispatcher, session, _vm) = setup();
        // SuspendCount with a truncated thread id.
        let reply = dispatcher.dispatch(
            &session,
            command_sets::THREAD_REFERENCE,
            thread_commands::SUSPEND_COUNT,
            &[1, 2, 3],
        );
        assert_eq!(reply.error_code, error_codes::ILLEGAL_ARGUMENT);
        assert!(reply.data.is_empty());
    }

    #[test]
    fn thread_suspend_resume_and_count_through_the_wire() {
        let (dispatcher, session, vm) = setup();
        let thread = vm.spawn_thread("main");
        let tid = session.ids().get_or_create(IdKind::Thread, Some(&thread));

        let mut payload = BytesMut::new();
        payload.put_u64(tid);
        let payload = payload.to_vec();

        let reply = dispatcher.dispatch(
            &session,
            command_sets::THREAD_REFERENCE,
            thread_commands::SUSPEND,
            &payload,
        );
        assert!(!reply.is_error());
        assert!(session.coordinator().is_all_suspended());

        let reply = dispatcher.dispatch(
            &session,
            command_sets::THREAD_REFERENCE,
            thread_commands::SUSPEND_COUNT,
            &payload,
        );
        assert_eq!(reply.data, vec![0, 0, 0, 1]);

        let reply = dispatcher.dispatch(
            &session,
            command_sets::THREAD_REFERENCE,
            thread_commands::RESUME,
            &payload,
        );
        assert!(!reply.is_error());
        assert!(!session.coordinator().is_all_suspended());

        // An id from the wrong kind-space is invalid, not collected.
        let reply = dispatcher.dispatch(
            &session,
            command_sets::THREAD_REFERENCE,
            thread_commands::SUSPEND,
            &{
                let mut buf = BytesMut::new();
                buf.put_u64(999);
                buf.to_vec()
            },
        );
        assert_eq!(reply.error_code, error_codes::INVALID_THREAD);
    }

    #[test]
    fn collection_pinning_through_the_wire() {
        let (dispatcher, session, vm) = setup();
        let object = MockEntity::named("payload");
        let key = handle_key(&object);
        let oid = session.ids().get_or_create(IdKind::Object, Some(&object));

        let mut payload = BytesMut::new();
        payload.put_u64(oid);
        let payload = payload.to_vec();

        let reply = dispatcher.dispatch(
            &session,
            command_sets::OBJECT_REFERENCE,
            object_commands::DISABLE_COLLECTION,
            &payload,
        );
        assert!(!reply.is_error());
        assert_eq!(vm.pin_calls(), vec![key]);

        // Program drops its reference; the pin keeps the object alive.
        drop(object);
        let reply = dispatcher.dispatch(
            &session,
            command_sets::OBJECT_REFERENCE,
            object_commands::IS_COLLECTED,
            &payload,
        );
        assert_eq!(reply.data, vec![0]);

        let reply = dispatcher.dispatch(
            &session,
            command_sets::OBJECT_REFERENCE,
            object_commands::ENABLE_COLLECTION,
            &payload,
        );
        assert!(!reply.is_error());
        assert_eq!(vm.unpin_calls(), vec![key]);

        let reply = dispatcher.dispatch(
            &session,
            command_sets::OBJECT_REFERENCE,
            object_commands::IS_COLLECTED,
            &payload,
        );
        assert_eq!(reply.data, vec![1]);
    }

    #[test]
    fn vm_death_supersedes_every_other_outcome() {
        let (dispatcher, session, vm) = setup();
        vm.terminate();

        let reply = dispatcher.dispatch(
            &session,
            command_sets::VIRTUAL_MACHINE,
            vm_commands::SUSPEND,
            &[],
        );
        assert_eq!(reply.error_code, error_codes::VM_DEAD);
    }

    /// End to end: a breakpoint request with suspend policy
    /// ALL matches, the execution thread parks at its hook, and a global
    /// RESUME unblocks it.
    #[test]
    fn breakpoint_suspend_resume_scenario() {
        let (dispatcher, session, vm) = setup();
        let thread = vm.spawn_thread("main");
        let class = MockEntity::class("com.example.Main");
        let class_id = session.ids().get_or_create(IdKind::ReferenceType, Some(&class));

        let payload = set_breakpoint_payload(class_id, 1, 0, 2); // policy ALL
        let reply = dispatcher.dispatch(
            &session,
            command_sets::EVENT_REQUEST,
            event_request_commands::SET,
            &payload,
        );
        assert!(!reply.is_error());

        let (hook_tx, hook_rx) = mpsc::channel();
        let exec_session = session.clone();
        let exec_thread = thread.clone();
        let exec_class = class.clone();
        let exec = std::thread::spawn(move || {
            let coordinator = exec_session.coordinator();
            coordinator.run_lock().lock();

            let mut sink: Vec<Vec<u8>> = Vec::new();
            let event = Event::Breakpoint {
                thread: exec_thread,
                location: Location {
                    type_tag: 1,
                    class: exec_class,
                    method: 1,
                    index: 0,
                },
            };
            let policy = exec_session.report_event(event, &mut sink).unwrap();
            assert_eq!(policy, SuspendPolicy::All);
            assert_eq!(sink.len(), 1);
            assert_eq!(sink[0][0], SuspendPolicy::All.wire());

            let hook_result = coordinator.execution_hook();
            coordinator.run_lock().unlock();
            hook_tx.send(()).unwrap();
            hook_result
        });

        // The execution thread must be parked, not finishing the hook.
        assert!(hook_rx.recv_timeout(Duration::from_millis(200)).is_err());

        let reply = dispatcher.dispatch(
            &session,
            command_sets::VIRTUAL_MACHINE,
            vm_commands::RESUME,
            &[],
        );
        assert!(!reply.is_error());

        assert!(hook_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(exec.join().unwrap().is_ok());
    }
}
