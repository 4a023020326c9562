// Wire identifier management
//
// Mints fixed-width wire identifiers for host VM handles and resolves them
// back. Slots hold weak references so the agent never keeps the target
// program's objects alive by accident; DisableCollection upgrades a slot to
// a strong keep-alive until the matching EnableCollection.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::protocol::{AgentError, AgentResult};
use crate::vm::{handle_key, handles_equal, HandleRef, WeakHandle};
use crate::wire;

pub type WireId = u64;

/// Identifier reserved for "no object". Never allocated, always resolves.
pub const NULL_ID: WireId = 0;

/// Kind-spaces the manager partitions identifiers into. An id is unique
/// within its kind-space for the lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Object,
    Thread,
    ThreadGroup,
    ReferenceType,
    Frame,
}

const KIND_COUNT: usize = 5;

impl IdKind {
    fn index(self) -> usize {
        match self {
            IdKind::Object => 0,
            IdKind::Thread => 1,
            IdKind::ThreadGroup => 2,
            IdKind::ReferenceType => 3,
            IdKind::Frame => 4,
        }
    }
}

#[derive(Debug)]
struct Slot {
    handle: WeakHandle,
    pin_count: u32,
    // Strong keep-alive, present only while pin_count > 0.
    pinned: Option<HandleRef>,
}

#[derive(Debug, Default)]
struct KindSpace {
    next: WireId,
    by_handle: HashMap<usize, WireId>,
    by_id: HashMap<WireId, Slot>,
}

impl KindSpace {
    fn slot_mut(&mut self, kind: IdKind, id: WireId) -> AgentResult<&mut Slot> {
        self.by_id
            .get_mut(&id)
            .ok_or(AgentError::InvalidIdentifier { kind, id })
    }
}

/// Bidirectional handle <-> identifier map, partitioned by kind.
///
/// One lock covers all spaces: minting is rare and cheap, and a single lock
/// makes `get_or_create` trivially exactly-once when the execution thread
/// and a command thread race on the same handle.
#[derive(Debug, Default)]
pub struct IdentifierManager {
    spaces: Mutex<[KindSpace; KIND_COUNT]>,
}

impl IdentifierManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing identifier for `handle` or mint a new one.
    /// `None` is the "no object" handle and always maps to id 0 with no
    /// allocation.
    pub fn get_or_create(&self, kind: IdKind, handle: Option<&HandleRef>) -> WireId {
        let Some(handle) = handle else {
            return NULL_ID;
        };

        let mut spaces = self.spaces.lock();
        let space = &mut spaces[kind.index()];
        let key = handle_key(handle);

        if let Some(&id) = space.by_handle.get(&key) {
            // The VM may have reclaimed the old entity and reused its
            // address. A slot is never rebound to a different handle, so
            // verify the hit still upgrades to this exact handle.
            let same = space
                .by_id
                .get(&id)
                .and_then(|slot| slot.handle.upgrade())
                .is_some_and(|live| handles_equal(&live, handle));
            if same {
                return id;
            }
            space.by_handle.remove(&key);
        }

        space.next += 1;
        let id = space.next;
        space.by_handle.insert(key, id);
        space.by_id.insert(
            id,
            Slot {
                handle: Arc::downgrade(handle),
                pin_count: 0,
                pinned: None,
            },
        );
        trace!(?kind, id, "minted wire identifier");
        id
    }

    /// Resolve an identifier back to its live handle.
    ///
    /// Three distinct outcomes: `Ok(None)` for the null identifier,
    /// `InvalidIdentifier` for an id never minted in this kind-space, and
    /// `ObjectCollected` for a minted id whose referent is gone.
    pub fn resolve(&self, kind: IdKind, id: WireId) -> AgentResult<Option<HandleRef>> {
        if id == NULL_ID {
            return Ok(None);
        }

        let spaces = self.spaces.lock();
        let slot = spaces[kind.index()]
            .by_id
            .get(&id)
            .ok_or(AgentError::InvalidIdentifier { kind, id })?;

        match slot.handle.upgrade() {
            Some(handle) => Ok(Some(handle)),
            None => Err(AgentError::ObjectCollected { kind, id }),
        }
    }

    /// Resolve an identifier that must denote a real entity; the null
    /// identifier is rejected as invalid.
    pub fn expect(&self, kind: IdKind, id: WireId) -> AgentResult<HandleRef> {
        self.resolve(kind, id)?
            .ok_or(AgentError::InvalidIdentifier { kind, id })
    }

    /// Reference-counted pin. Returns the handle plus whether this call was
    /// the 0 -> 1 transition, so the caller can forward to the VM's GC pin
    /// hook exactly once.
    pub fn disable_collection(
        &self,
        kind: IdKind,
        id: WireId,
    ) -> AgentResult<(HandleRef, bool)> {
        let mut spaces = self.spaces.lock();
        let slot = spaces[kind.index()].slot_mut(kind, id)?;

        if let Some(pinned) = &slot.pinned {
            let handle = Arc::clone(pinned);
            slot.pin_count += 1;
            return Ok((handle, false));
        }

        let handle = slot
            .handle
            .upgrade()
            .ok_or(AgentError::ObjectCollected { kind, id })?;
        slot.pinned = Some(Arc::clone(&handle));
        slot.pin_count = 1;
        debug!(?kind, id, "collection disabled");
        Ok((handle, true))
    }

    /// Undo one `disable_collection`. Returns the handle when the count
    /// reached zero and the keep-alive was dropped; extra calls with no
    /// pins outstanding are a safe no-op.
    pub fn enable_collection(
        &self,
        kind: IdKind,
        id: WireId,
    ) -> AgentResult<Option<HandleRef>> {
        let mut spaces = self.spaces.lock();
        let slot = spaces[kind.index()].slot_mut(kind, id)?;

        if slot.pin_count == 0 {
            return Ok(None);
        }
        slot.pin_count -= 1;
        if slot.pin_count > 0 {
            return Ok(None);
        }
        debug!(?kind, id, "collection re-enabled");
        Ok(slot.pinned.take())
    }

    /// Whether the referent of a known identifier has been reclaimed.
    pub fn is_collected(&self, kind: IdKind, id: WireId) -> AgentResult<bool> {
        if id == NULL_ID {
            return Ok(false);
        }
        let spaces = self.spaces.lock();
        let slot = spaces[kind.index()]
            .by_id
            .get(&id)
            .ok_or(AgentError::InvalidIdentifier { kind, id })?;
        Ok(slot.handle.upgrade().is_none())
    }

    /// Serialize the identifier of `handle`, minting it if needed.
    pub fn write_handle(&self, buf: &mut BytesMut, kind: IdKind, handle: Option<&HandleRef>) {
        wire::write_id(buf, self.get_or_create(kind, handle));
    }

    /// Serialize a {1-byte tag, identifier} pair.
    pub fn write_tagged_handle(
        &self,
        buf: &mut BytesMut,
        tag: u8,
        kind: IdKind,
        handle: Option<&HandleRef>,
    ) {
        wire::write_tagged_id(buf, tag, self.get_or_create(kind, handle));
    }

    /// Session teardown: every identifier (and pin) is session-scoped.
    ///
    /// Returns the handles that still carried pins, one per slot, so the
    /// caller can undo the host VM's GC pin (which was forwarded exactly
    /// once per slot, on the 0 -> 1 transition).
    pub fn clear(&self) -> Vec<HandleRef> {
        let mut spaces = self.spaces.lock();
        let mut still_pinned = Vec::new();
        for space in spaces.iter_mut() {
            space.by_handle.clear();
            for (_, slot) in space.by_id.drain() {
                if slot.pin_count > 0 {
                    if let Some(handle) = slot.pinned {
                        still_pinned.push(handle);
                    }
                }
            }
        }
        debug!(pins = still_pinned.len(), "identifier tables cleared");
        still_pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEntity;

    fn entity(name: &str) -> HandleRef {
        MockEntity::named(name)
    }

    #[test]
    fn round_trip_and_idempotence() {
        let ids = IdentifierManager::new();
        let obj = entity("o1");

        let id = ids.get_or_create(IdKind::Object, Some(&obj));
        assert_ne!(id, NULL_ID);
        assert_eq!(ids.get_or_create(IdKind::Object, Some(&obj)), id);

        let resolved = ids.resolve(IdKind::Object, id).unwrap().unwrap();
        assert!(handles_equal(&resolved, &obj));
    }

    #[test]
    fn kind_spaces_are_independent() {
        let ids = IdentifierManager::new();
        let obj = entity("o1");
        let thread = entity("t1");

        let oid = ids.get_or_create(IdKind::Object, Some(&obj));
        let tid = ids.get_or_create(IdKind::Thread, Some(&thread));
        // Both spaces mint from 1; the same numeric id denotes different
        // entities in different spaces.
        assert_eq!(oid, 1);
        assert_eq!(tid, 1);
        assert!(ids.resolve(IdKind::Frame, 1).is_err());
    }

    #[test]
    fn null_identity() {
        let ids = IdentifierManager::new();
        assert_eq!(ids.get_or_create(IdKind::Object, None), NULL_ID);
        assert!(ids.resolve(IdKind::Object, NULL_ID).unwrap().is_none());
        assert!(!ids.is_collected(IdKind::Object, NULL_ID).unwrap());
    }

    #[test]
    fn invalid_and_collected_are_distinct() {
        let ids = IdentifierManager::new();

        let id = {
            let obj = entity("short-lived");
            ids.get_or_create(IdKind::Object, Some(&obj))
        };
        // The only strong reference is gone: simulated collection.
        assert!(matches!(
            ids.resolve(IdKind::Object, id),
            Err(AgentError::ObjectCollected { .. })
        ));
        assert!(ids.is_collected(IdKind::Object, id).unwrap());

        assert!(matches!(
            ids.resolve(IdKind::Object, 999),
            Err(AgentError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn pin_counting_survives_collection_pressure() {
        let ids = IdentifierManager::new();
        let obj = entity("pinned");
        let id = ids.get_or_create(IdKind::Object, Some(&obj));

        let (_, first) = ids.disable_collection(IdKind::Object, id).unwrap();
        assert!(first);
        let (_, first) = ids.disable_collection(IdKind::Object, id).unwrap();
        assert!(!first);

        // Drop the program's reference; the pin keeps the slot live.
        drop(obj);
        assert!(!ids.is_collected(IdKind::Object, id).unwrap());
        assert!(ids.resolve(IdKind::Object, id).unwrap().is_some());

        assert!(ids.enable_collection(IdKind::Object, id).unwrap().is_none());
        assert!(!ids.is_collected(IdKind::Object, id).unwrap());

        // Count back to zero: the keep-alive drops and the referent goes.
        assert!(ids.enable_collection(IdKind::Object, id).unwrap().is_some());
        assert!(ids.is_collected(IdKind::Object, id).unwrap());

        // Extra enables past zero stay a no-op.
        assert!(ids.enable_collection(IdKind::Object, id).unwrap().is_none());
    }

    #[test]
    fn slot_is_not_rebound_on_address_reuse() {
        let ids = IdentifierManager::new();
        let first = entity("first");
        let key = handle_key(&first);
        let id = ids.get_or_create(IdKind::Object, Some(&first));
        drop(first);

        // Force the stale by-address entry to be re-checked by minting for
        // a handle that claims the same key. Allocators rarely cooperate on
        // demand, so fake it by clearing nothing and asserting the guard
        // path: a dead slot never satisfies a lookup for a new handle.
        let second = entity("second");
        let id2 = ids.get_or_create(IdKind::Object, Some(&second));
        assert_ne!(id2, NULL_ID);
        if handle_key(&second) == key {
            assert_ne!(id2, id);
        }
        assert!(matches!(
            ids.resolve(IdKind::Object, id),
            Err(AgentError::ObjectCollected { .. })
        ));
    }

    #[test]
    fn clear_drops_everything_and_yields_outstanding_pins() {
        let ids = IdentifierManager::new();
        let obj = entity("o");
        let id = ids.get_or_create(IdKind::Object, Some(&obj));
        // Pinned twice, but only one slot: one handle comes back.
        ids.disable_collection(IdKind::Object, id).unwrap();
        ids.disable_collection(IdKind::Object, id).unwrap();
        let loose = entity("loose");
        ids.get_or_create(IdKind::Object, Some(&loose));

        let pins = ids.clear();
        assert_eq!(pins.len(), 1);
        assert!(handles_equal(&pins[0], &obj));
        assert!(matches!(
            ids.resolve(IdKind::Object, id),
            Err(AgentError::InvalidIdentifier { .. })
        ));

        // Nothing left to yield on a second clear.
        assert!(ids.clear().is_empty());
    }
}
