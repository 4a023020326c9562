// Event request filter chains
//
// Filters are evaluated in registration order with short-circuit on the
// first rejection; Count filters rely on that ordering for their mutable
// state. A filter that references a wire identifier it cannot resolve
// (unknown or collected) rejects the event instead of erroring.

use tracing::trace;

use crate::constants::modifier_kinds;
use crate::events::Event;
use crate::ids::{IdKind, IdentifierManager, WireId};
use crate::protocol::{AgentError, AgentResult};
use crate::vm::{handles_equal, HandleRef};
use crate::wire;

/// A location expressed in wire identifiers, as carried by the
/// LocationOnly modifier.
#[derive(Debug, Clone)]
pub struct WireLocation {
    pub type_tag: u8,
    pub class: WireId,
    pub method: u64,
    pub index: u64,
}

#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches exactly when the count strikes zero, never afterwards.
    Count { remaining: i32 },
    ThreadOnly { thread: WireId },
    ClassOnly { ref_type: WireId },
    ClassMatch { pattern: String },
    ClassExclude { pattern: String },
    LocationOnly { location: WireLocation },
    ExceptionOnly {
        ref_type: WireId,
        caught: bool,
        uncaught: bool,
    },
    FieldOnly { ref_type: WireId, field: u64 },
    Step {
        thread: WireId,
        size: i32,
        depth: i32,
    },
    InstanceOnly { object: WireId },
}

/// A `*` is allowed at the start or the end of the pattern, nowhere else.
fn class_pattern_matches(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        pattern == name
    }
}

/// Resolve a wire id to a handle, treating every failure (and the null id)
/// as "no handle".
fn soft_resolve(ids: &IdentifierManager, kind: IdKind, id: WireId) -> Option<HandleRef> {
    ids.resolve(kind, id).ok().flatten()
}

impl Filter {
    /// Whether this filter accepts `event`. Mutates count state.
    pub fn accepts(&mut self, event: &Event, ids: &IdentifierManager) -> bool {
        match self {
            Filter::Count { remaining } => {
                if *remaining <= 0 {
                    return false;
                }
                *remaining -= 1;
                *remaining == 0
            }
            Filter::ThreadOnly { thread } | Filter::Step { thread, .. } => {
                match (soft_resolve(ids, IdKind::Thread, *thread), event.thread()) {
                    (Some(want), Some(got)) => handles_equal(&want, got),
                    _ => false,
                }
            }
            Filter::ClassOnly { ref_type } => {
                match (
                    soft_resolve(ids, IdKind::ReferenceType, *ref_type),
                    event.ref_type(),
                ) {
                    (Some(want), Some(got)) => handles_equal(&want, got),
                    _ => false,
                }
            }
            Filter::ClassMatch { pattern } => event
                .type_name()
                .is_some_and(|name| class_pattern_matches(pattern, name)),
            Filter::ClassExclude { pattern } => event
                .type_name()
                .is_none_or(|name| !class_pattern_matches(pattern, name)),
            Filter::LocationOnly { location } => {
                let Some(at) = event.location() else {
                    return false;
                };
                let Some(class) = soft_resolve(ids, IdKind::ReferenceType, location.class) else {
                    return false;
                };
                handles_equal(&class, &at.class)
                    && location.method == at.method
                    && location.index == at.index
            }
            Filter::ExceptionOnly {
                ref_type,
                caught,
                uncaught,
            } => {
                let Some((exception, was_caught)) = event.exception() else {
                    return false;
                };
                if was_caught && !*caught {
                    return false;
                }
                if !was_caught && !*uncaught {
                    return false;
                }
                if *ref_type == 0 {
                    return true;
                }
                let Some(want) = soft_resolve(ids, IdKind::ReferenceType, *ref_type) else {
                    return false;
                };
                exception
                    .runtime_type()
                    .is_some_and(|rt| handles_equal(&rt, &want))
            }
            Filter::FieldOnly { ref_type, field } => {
                let Some((declaring, field_id)) = event.field() else {
                    return false;
                };
                if field_id != *field {
                    return false;
                }
                match soft_resolve(ids, IdKind::ReferenceType, *ref_type) {
                    Some(want) => handles_equal(&want, declaring),
                    None => false,
                }
            }
            Filter::InstanceOnly { object } => {
                match (soft_resolve(ids, IdKind::Object, *object), event.instance()) {
                    (Some(want), Some(got)) => handles_equal(&want, got),
                    _ => false,
                }
            }
        }
    }
}

/// Parse the modifier chain of an EventRequest.Set payload.
pub fn parse_modifiers(buf: &mut &[u8]) -> AgentResult<Vec<Filter>> {
    let count = wire::read_i32(buf)?;
    if count < 0 {
        return Err(AgentError::Malformed(format!(
            "negative modifier count {count}"
        )));
    }

    let mut filters = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = wire::read_u8(buf)?;
        let filter = match kind {
            modifier_kinds::COUNT => {
                let remaining = wire::read_i32(buf)?;
                if remaining <= 0 {
                    return Err(AgentError::Malformed(format!(
                        "nonpositive count {remaining}"
                    )));
                }
                Filter::Count { remaining }
            }
            modifier_kinds::THREAD_ONLY => Filter::ThreadOnly {
                thread: wire::read_u64(buf)?,
            },
            modifier_kinds::CLASS_ONLY => Filter::ClassOnly {
                ref_type: wire::read_u64(buf)?,
            },
            modifier_kinds::CLASS_MATCH => Filter::ClassMatch {
                pattern: wire::read_string(buf)?,
            },
            modifier_kinds::CLASS_EXCLUDE => Filter::ClassExclude {
                pattern: wire::read_string(buf)?,
            },
            modifier_kinds::LOCATION_ONLY => Filter::LocationOnly {
                location: WireLocation {
                    type_tag: wire::read_u8(buf)?,
                    class: wire::read_u64(buf)?,
                    method: wire::read_u64(buf)?,
                    index: wire::read_u64(buf)?,
                },
            },
            modifier_kinds::EXCEPTION_ONLY => Filter::ExceptionOnly {
                ref_type: wire::read_u64(buf)?,
                caught: wire::read_bool(buf)?,
                uncaught: wire::read_bool(buf)?,
            },
            modifier_kinds::FIELD_ONLY => Filter::FieldOnly {
                ref_type: wire::read_u64(buf)?,
                field: wire::read_u64(buf)?,
            },
            modifier_kinds::STEP => Filter::Step {
                thread: wire::read_u64(buf)?,
                size: wire::read_i32(buf)?,
                depth: wire::read_i32(buf)?,
            },
            modifier_kinds::INSTANCE_ONLY => Filter::InstanceOnly {
                object: wire::read_u64(buf)?,
            },
            // No expression evaluator or source-name table in the host VM.
            modifier_kinds::CONDITIONAL | modifier_kinds::SOURCE_NAME_MATCH => {
                trace!(kind, "unsupported modifier kind");
                return Err(AgentError::NotImplemented);
            }
            other => {
                return Err(AgentError::Malformed(format!(
                    "unknown modifier kind {other}"
                )));
            }
        };
        filters.push(filter);
    }
    Ok(filters)
}
