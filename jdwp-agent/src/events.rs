// Events and composite notification serialization
//
// An `Event` is transient and carries live host handles. Wire identifiers
// are resolved only when a matched event is serialized, so events nobody
// asked for never pay identifier-allocation cost.

use bytes::{BufMut, BytesMut};

use crate::constants::{location_tags, type_tags};
use crate::ids::{IdKind, IdentifierManager};
use crate::protocol::AgentResult;
use crate::request::SuspendPolicy;
use crate::vm::HandleRef;
use crate::wire;

/// Closed enumeration of event kinds, with their wire bytes.
///
/// VM_INIT (90) and THREAD_END (7) are protocol aliases of `VmStart` and
/// `ThreadDeath`: same byte, same registry storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SingleStep,
    Breakpoint,
    FramePop,
    Exception,
    UserDefined,
    ThreadStart,
    ThreadDeath,
    ClassPrepare,
    ClassUnload,
    ClassLoad,
    FieldAccess,
    FieldModification,
    ExceptionCatch,
    MethodEntry,
    MethodExit,
    MethodExitWithReturnValue,
    MonitorContendedEnter,
    MonitorContendedEntered,
    MonitorWait,
    MonitorWaited,
    VmStart,
    VmDeath,
}

impl EventKind {
    pub const ALL: [EventKind; 22] = [
        EventKind::SingleStep,
        EventKind::Breakpoint,
        EventKind::FramePop,
        EventKind::Exception,
        EventKind::UserDefined,
        EventKind::ThreadStart,
        EventKind::ThreadDeath,
        EventKind::ClassPrepare,
        EventKind::ClassUnload,
        EventKind::ClassLoad,
        EventKind::FieldAccess,
        EventKind::FieldModification,
        EventKind::ExceptionCatch,
        EventKind::MethodEntry,
        EventKind::MethodExit,
        EventKind::MethodExitWithReturnValue,
        EventKind::MonitorContendedEnter,
        EventKind::MonitorContendedEntered,
        EventKind::MonitorWait,
        EventKind::MonitorWaited,
        EventKind::VmStart,
        EventKind::VmDeath,
    ];

    pub fn wire(self) -> u8 {
        match self {
            EventKind::SingleStep => 1,
            EventKind::Breakpoint => 2,
            EventKind::FramePop => 3,
            EventKind::Exception => 4,
            EventKind::UserDefined => 5,
            EventKind::ThreadStart => 6,
            EventKind::ThreadDeath => 7,
            EventKind::ClassPrepare => 8,
            EventKind::ClassUnload => 9,
            EventKind::ClassLoad => 10,
            EventKind::FieldAccess => 20,
            EventKind::FieldModification => 21,
            EventKind::ExceptionCatch => 30,
            EventKind::MethodEntry => 40,
            EventKind::MethodExit => 41,
            EventKind::MethodExitWithReturnValue => 42,
            EventKind::MonitorContendedEnter => 43,
            EventKind::MonitorContendedEntered => 44,
            EventKind::MonitorWait => 45,
            EventKind::MonitorWaited => 46,
            EventKind::VmStart => 90,
            EventKind::VmDeath => 99,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        EventKind::ALL.iter().copied().find(|k| k.wire() == byte)
    }
}

/// A code position: reference type, method, bytecode index.
#[derive(Debug, Clone)]
pub struct Location {
    pub type_tag: u8,
    pub class: HandleRef,
    pub method: u64,
    pub index: u64,
}

fn write_location(buf: &mut BytesMut, ids: &IdentifierManager, location: &Location) {
    buf.put_u8(location.type_tag);
    ids.write_handle(buf, IdKind::ReferenceType, Some(&location.class));
    buf.put_u64(location.method);
    buf.put_u64(location.index);
}

fn write_null_location(buf: &mut BytesMut) {
    buf.put_u8(location_tags::CLASS);
    buf.put_u64(0);
    buf.put_u64(0);
    buf.put_u64(0);
}

/// A live event produced by the host VM's instruction hook.
#[derive(Debug, Clone)]
pub enum Event {
    VmStart {
        thread: Option<HandleRef>,
    },
    VmDeath,
    ThreadStart {
        thread: HandleRef,
    },
    ThreadDeath {
        thread: HandleRef,
    },
    ClassPrepare {
        thread: HandleRef,
        type_tag: u8,
        ref_type: HandleRef,
        signature: String,
        status: i32,
    },
    Breakpoint {
        thread: HandleRef,
        location: Location,
    },
    SingleStep {
        thread: HandleRef,
        location: Location,
    },
    Exception {
        thread: HandleRef,
        location: Location,
        exception: HandleRef,
        caught: bool,
        catch_location: Option<Location>,
    },
    MethodEntry {
        thread: HandleRef,
        location: Location,
    },
    MethodExit {
        thread: HandleRef,
        location: Location,
    },
    FieldAccess {
        thread: HandleRef,
        location: Location,
        field_type: HandleRef,
        field: u64,
        object: Option<HandleRef>,
    },
    FieldModification {
        thread: HandleRef,
        location: Location,
        field_type: HandleRef,
        field: u64,
        object: Option<HandleRef>,
    },
    MonitorContendedEnter {
        thread: HandleRef,
        object: HandleRef,
        location: Location,
    },
    MonitorContendedEntered {
        thread: HandleRef,
        object: HandleRef,
        location: Location,
    },
    MonitorWait {
        thread: HandleRef,
        object: HandleRef,
        location: Location,
        timeout: i64,
    },
    MonitorWaited {
        thread: HandleRef,
        object: HandleRef,
        location: Location,
        timed_out: bool,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::VmStart { .. } => EventKind::VmStart,
            Event::VmDeath => EventKind::VmDeath,
            Event::ThreadStart { .. } => EventKind::ThreadStart,
            Event::ThreadDeath { .. } => EventKind::ThreadDeath,
            Event::ClassPrepare { .. } => EventKind::ClassPrepare,
            Event::Breakpoint { .. } => EventKind::Breakpoint,
            Event::SingleStep { .. } => EventKind::SingleStep,
            Event::Exception { .. } => EventKind::Exception,
            Event::MethodEntry { .. } => EventKind::MethodEntry,
            Event::MethodExit { .. } => EventKind::MethodExit,
            Event::FieldAccess { .. } => EventKind::FieldAccess,
            Event::FieldModification { .. } => EventKind::FieldModification,
            Event::MonitorContendedEnter { .. } => EventKind::MonitorContendedEnter,
            Event::MonitorContendedEntered { .. } => EventKind::MonitorContendedEntered,
            Event::MonitorWait { .. } => EventKind::MonitorWait,
            Event::MonitorWaited { .. } => EventKind::MonitorWaited,
        }
    }

    /// Thread the event occurred on, if any.
    pub fn thread(&self) -> Option<&HandleRef> {
        match self {
            Event::VmStart { thread } => thread.as_ref(),
            Event::VmDeath => None,
            Event::ThreadStart { thread }
            | Event::ThreadDeath { thread }
            | Event::ClassPrepare { thread, .. }
            | Event::Breakpoint { thread, .. }
            | Event::SingleStep { thread, .. }
            | Event::Exception { thread, .. }
            | Event::MethodEntry { thread, .. }
            | Event::MethodExit { thread, .. }
            | Event::FieldAccess { thread, .. }
            | Event::FieldModification { thread, .. }
            | Event::MonitorContendedEnter { thread, .. }
            | Event::MonitorContendedEntered { thread, .. }
            | Event::MonitorWait { thread, .. }
            | Event::MonitorWaited { thread, .. } => Some(thread),
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            Event::Breakpoint { location, .. }
            | Event::SingleStep { location, .. }
            | Event::Exception { location, .. }
            | Event::MethodEntry { location, .. }
            | Event::MethodExit { location, .. }
            | Event::FieldAccess { location, .. }
            | Event::FieldModification { location, .. }
            | Event::MonitorContendedEnter { location, .. }
            | Event::MonitorContendedEntered { location, .. }
            | Event::MonitorWait { location, .. }
            | Event::MonitorWaited { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Reference type the event is about, for class filters: the prepared
    /// class for ClassPrepare, otherwise the class of the location.
    pub fn ref_type(&self) -> Option<&HandleRef> {
        match self {
            Event::ClassPrepare { ref_type, .. } => Some(ref_type),
            other => other.location().map(|l| &l.class),
        }
    }

    /// Dotted type name for class match/exclude patterns.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Event::ClassPrepare { signature, .. } => Some(signature.as_str()),
            other => other.location().and_then(|l| l.class.type_name()),
        }
    }

    /// Object instance the event is about, for InstanceOnly filters.
    pub fn instance(&self) -> Option<&HandleRef> {
        match self {
            Event::FieldAccess { object, .. } | Event::FieldModification { object, .. } => {
                object.as_ref()
            }
            Event::MonitorContendedEnter { object, .. }
            | Event::MonitorContendedEntered { object, .. }
            | Event::MonitorWait { object, .. }
            | Event::MonitorWaited { object, .. } => Some(object),
            _ => None,
        }
    }

    /// Exception object and caught-ness, for ExceptionOnly filters.
    pub fn exception(&self) -> Option<(&HandleRef, bool)> {
        match self {
            Event::Exception {
                exception, caught, ..
            } => Some((exception, *caught)),
            _ => None,
        }
    }

    /// Declaring type and field id, for FieldOnly filters.
    pub fn field(&self) -> Option<(&HandleRef, u64)> {
        match self {
            Event::FieldAccess {
                field_type, field, ..
            }
            | Event::FieldModification {
                field_type, field, ..
            } => Some((field_type, *field)),
            _ => None,
        }
    }

    /// Serialize the kind-specific body, resolving identifiers now.
    fn write_body(&self, buf: &mut BytesMut, ids: &IdentifierManager) -> AgentResult<()> {
        match self {
            Event::VmStart { thread } => {
                ids.write_handle(buf, IdKind::Thread, thread.as_ref());
            }
            Event::VmDeath => {}
            Event::ThreadStart { thread } | Event::ThreadDeath { thread } => {
                ids.write_handle(buf, IdKind::Thread, Some(thread));
            }
            Event::ClassPrepare {
                thread,
                type_tag,
                ref_type,
                signature,
                status,
            } => {
                ids.write_handle(buf, IdKind::Thread, Some(thread));
                buf.put_u8(*type_tag);
                ids.write_handle(buf, IdKind::ReferenceType, Some(ref_type));
                wire::write_string(buf, signature);
                buf.put_i32(*status);
            }
            Event::Breakpoint { thread, location }
            | Event::SingleStep { thread, location }
            | Event::MethodEntry { thread, location }
            | Event::MethodExit { thread, location } => {
                ids.write_handle(buf, IdKind::Thread, Some(thread));
                write_location(buf, ids, location);
            }
            Event::Exception {
                thread,
                location,
                exception,
                catch_location,
                ..
            } => {
                ids.write_handle(buf, IdKind::Thread, Some(thread));
                write_location(buf, ids, location);
                ids.write_tagged_handle(buf, type_tags::OBJECT, IdKind::Object, Some(exception));
                match catch_location {
                    Some(catch) => write_location(buf, ids, catch),
                    None => write_null_location(buf),
                }
            }
            Event::FieldAccess {
                thread,
                location,
                field_type,
                field,
                object,
            }
            | Event::FieldModification {
                thread,
                location,
                field_type,
                field,
                object,
            } => {
                ids.write_handle(buf, IdKind::Thread, Some(thread));
                write_location(buf, ids, location);
                buf.put_u8(location_tags::CLASS);
                ids.write_handle(buf, IdKind::ReferenceType, Some(field_type));
                buf.put_u64(*field);
                ids.write_tagged_handle(buf, type_tags::OBJECT, IdKind::Object, object.as_ref());
            }
            Event::MonitorContendedEnter {
                thread,
                object,
                location,
            }
            | Event::MonitorContendedEntered {
                thread,
                object,
                location,
            } => {
                ids.write_handle(buf, IdKind::Thread, Some(thread));
                ids.write_tagged_handle(buf, type_tags::OBJECT, IdKind::Object, Some(object));
                write_location(buf, ids, location);
            }
            Event::MonitorWait {
                thread,
                object,
                location,
                timeout,
            } => {
                ids.write_handle(buf, IdKind::Thread, Some(thread));
                ids.write_tagged_handle(buf, type_tags::OBJECT, IdKind::Object, Some(object));
                write_location(buf, ids, location);
                buf.put_i64(*timeout);
            }
            Event::MonitorWaited {
                thread,
                object,
                location,
                timed_out,
            } => {
                ids.write_handle(buf, IdKind::Thread, Some(thread));
                ids.write_tagged_handle(buf, type_tags::OBJECT, IdKind::Object, Some(object));
                write_location(buf, ids, location);
                buf.put_u8(u8::from(*timed_out));
            }
        }
        Ok(())
    }
}

pub type RequestId = i32;

/// One matched event plus every request it satisfied. The matcher keeps
/// set semantics: the event itself appears once no matter how many
/// requests it matched.
#[derive(Debug)]
pub struct MatchedEvent {
    pub event: Event,
    pub requests: Vec<RequestId>,
}

/// Serialize the composite envelope: {suspendPolicy, count,
/// (eventKind, requestId, body)*}. Every delivery is enveloped, even a
/// single event.
pub fn write_composite(
    buf: &mut BytesMut,
    policy: SuspendPolicy,
    matched: &[MatchedEvent],
    ids: &IdentifierManager,
) -> AgentResult<()> {
    buf.put_u8(policy.wire());
    let count: i32 = matched.iter().map(|m| m.requests.len() as i32).sum();
    buf.put_i32(count);

    for m in matched {
        for &request_id in &m.requests {
            buf.put_u8(m.event.kind().wire());
            buf.put_i32(request_id);
            m.event.write_body(buf, ids)?;
        }
    }
    Ok(())
}
