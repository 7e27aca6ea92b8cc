//! Generation-checked handle table.
//!
//! The table maps [`Handle`]s to reference-counted object records. Every
//! lookup validates the handle's generation, so a stale handle can never
//! reach the object that later reuses its slot.
//!
//! # Lifetimes
//!
//! - Objects start with a reference count of 1, owned by the creator.
//! - [`HandleTable::assign`] hands that reference to an owner object
//!   without touching the count.
//! - When the count reaches zero the object is finalized exactly once:
//!   its slot is recycled with a bumped generation and every object it owns
//!   is released in turn.
//! - Voices are special: while the engine holds a voice, the slot cannot be
//!   recycled. Releasing it reports [`Released::Deferred`] and hands back a
//!   [`Teardown`] request the caller must forward to the engine.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::command::Ticks;
use crate::error::{Error, Result};
use crate::handle::{Handle, MAX_SLOTS, next_generation};
use crate::object::{InstanceId, ObjectKind, Payload, Record, VoiceInfo, VoicePhase};
use crate::program::Program;

/// Outcome of a successful release.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Released {
    /// Other references remain.
    Retained { refcount: u32 },
    /// The object was destroyed and its handle recycled.
    Finalized,
    /// The object refuses to go away synchronously (a voice still held by
    /// the engine). Teardown has been scheduled if this was the last
    /// reference.
    Deferred,
}

impl Released {
    /// True when the object refused immediate destruction.
    pub fn is_refused(self) -> bool {
        matches!(self, Released::Deferred)
    }
}

/// Request to detach a voice handle inside the engine that runs it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub instance: InstanceId,
    pub handle: Handle,
    /// Earliest due time for the detach command.
    pub not_before: Ticks,
}

struct Slot {
    generation: u32,
    record: Option<Record>,
}

/// The slot arena.
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
    next_instance: u32,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Create a table holding only the root bank at handle 0.
    pub fn new() -> Self {
        let root = Record::new(Payload::Bank).with_name(Some("root"));
        Self {
            slots: vec![Slot {
                generation: 0,
                record: Some(root),
            }],
            free: Vec::new(),
            live: 1,
            next_instance: 0,
        }
    }

    pub(crate) fn next_instance_id(&mut self) -> InstanceId {
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        id
    }

    /// Number of live objects, including the root bank.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store a new record and return its handle.
    pub fn insert(&mut self, record: Record) -> Result<Handle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(Error::TableFull);
                }
                self.slots.push(Slot {
                    generation: 0,
                    record: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        debug_assert!(slot.record.is_none());
        slot.record = Some(record);
        self.live += 1;
        Ok(Handle::new(index, slot.generation))
    }

    /// Create a voice placeholder owned by `instance`.
    pub(crate) fn insert_voice(
        &mut self,
        instance: InstanceId,
        program: Arc<dyn Program>,
        start: Ticks,
    ) -> Result<Handle> {
        let name = program.name().map(str::to_string);
        let mut record = Record::new(Payload::Voice(VoiceInfo {
            instance,
            program,
            phase: VoicePhase::Pending,
            start,
            attached: true,
            release_requested: false,
        }));
        record.name = name;
        self.insert(record)
    }

    pub fn get(&self, handle: Handle) -> Result<&Record> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.record.as_ref())
            .ok_or(Error::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut Record> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.record.as_mut())
            .ok_or(Error::InvalidHandle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    pub fn type_of(&self, handle: Handle) -> Result<ObjectKind> {
        self.get(handle).map(Record::kind)
    }

    pub fn name(&self, handle: Handle) -> Result<Option<&str>> {
        self.get(handle).map(|r| r.name.as_deref())
    }

    pub fn describe(&self, handle: Handle) -> Result<String> {
        self.get(handle).map(|r| r.describe(handle))
    }

    pub fn refcount(&self, handle: Handle) -> Result<u32> {
        self.get(handle).map(|r| r.refcount)
    }

    pub fn retain(&mut self, handle: Handle) -> Result<()> {
        let record = self.get_mut(handle)?;
        record.refcount += 1;
        Ok(())
    }

    /// Drop one reference. Teardown requests for voices are appended to
    /// `teardowns`; they must reach the owning engine.
    pub fn release(&mut self, handle: Handle, teardowns: &mut Vec<Teardown>) -> Result<Released> {
        if handle == Handle::ROOT_BANK {
            return Err(Error::Refused);
        }
        let record = self.get_mut(handle)?;
        if record.refcount == 0 {
            // Last reference already gone; the slot waits for the engine.
            return Err(Error::Refused);
        }
        record.refcount -= 1;
        let refcount = record.refcount;

        if let Some(voice) = record.voice_mut() {
            if voice.attached {
                if refcount == 0 {
                    voice.release_requested = true;
                    voice.phase = VoicePhase::Stopping;
                    teardowns.push(Teardown {
                        instance: voice.instance,
                        handle,
                        not_before: voice.start,
                    });
                }
                return Ok(Released::Deferred);
            }
        }

        if refcount > 0 {
            return Ok(Released::Retained { refcount });
        }
        self.finalize(handle, teardowns);
        Ok(Released::Finalized)
    }

    /// Destroy the object at `handle` and release everything it owns.
    fn finalize(&mut self, handle: Handle, teardowns: &mut Vec<Teardown>) {
        let Some(slot) = self.slots.get_mut(handle.index()) else {
            return;
        };
        if slot.generation != handle.generation() {
            return;
        }
        let Some(record) = slot.record.take() else {
            return;
        };
        slot.generation = next_generation(slot.generation);
        self.free.push(handle.index());
        self.live -= 1;
        debug!("finalized {}", record.describe(handle));

        if let Some(owner) = record.owner {
            if let Ok(owner_record) = self.get_mut(owner) {
                owner_record.owned.retain(|h| *h != handle);
                if let Some(exports) = owner_record.exports.as_mut() {
                    exports.remove_handle(handle);
                }
            }
        }

        for child in record.owned {
            if let Ok(child_record) = self.get_mut(child) {
                child_record.owner = None;
            }
            // Children may already be gone; stale handles are ignored.
            let _ = self.release(child, teardowns);
        }
    }

    /// Hand the caller's reference to `handle` over to `owner`.
    pub fn assign(&mut self, owner: Handle, handle: Handle) -> Result<()> {
        self.check_assign(owner, handle)?;
        let record = self.get_mut(handle)?;
        if record.owner == Some(owner) {
            return Ok(());
        }
        record.owner = Some(owner);
        record.api_owner = None;
        self.get_mut(owner)?.owned.push(handle);
        Ok(())
    }

    fn check_assign(&self, owner: Handle, handle: Handle) -> Result<()> {
        let owner_record = self.get(owner)?;
        if !owner_record.kind().can_own() {
            return Err(Error::WrongType);
        }
        let record = self.get(handle)?;
        // Voice lifetimes belong to the engine, not to an owner object.
        if handle == owner || handle == Handle::ROOT_BANK || record.kind() == ObjectKind::Voice {
            return Err(Error::Refused);
        }
        match record.owner {
            Some(current) if current != owner => Err(Error::Refused),
            _ => Ok(()),
        }
    }

    /// Assign `handle` to `owner` and export it under `name`, or under the
    /// object's own name when `name` is `None`.
    pub fn export(&mut self, owner: Handle, handle: Handle, name: Option<&str>) -> Result<()> {
        let owner_record = self.get(owner)?;
        let Some(exports) = owner_record.exports.as_ref() else {
            return Err(Error::WrongType);
        };
        let name = match name {
            Some(name) => name.to_string(),
            None => self
                .get(handle)?
                .name
                .clone()
                .ok_or(Error::NoName)?,
        };
        if exports.contains(&name) {
            return Err(Error::NameExists(name));
        }
        self.check_assign(owner, handle)?;

        self.assign(owner, handle)?;
        let exports = self
            .get_mut(owner)?
            .exports
            .as_mut()
            .ok_or(Error::WrongType)?;
        exports.insert(&name, handle)
    }

    /// Resolve a `/` separated path of export names starting at `node`.
    ///
    /// The empty path is `node` itself; an empty segment anywhere else
    /// matches nothing.
    pub fn lookup(&self, node: Handle, path: &str) -> Result<Handle> {
        let mut current = node;
        self.get(current)?;
        if path.is_empty() {
            return Ok(current);
        }
        for segment in path.split('/') {
            if segment.is_empty() {
                return Err(Error::NotFound);
            }
            let record = self.get(current)?;
            current = record
                .exports
                .as_ref()
                .and_then(|e| e.find(segment))
                .ok_or(Error::NotFound)?;
        }
        Ok(current)
    }

    /// Handle of export `index` of `node`.
    pub fn export_at(&self, node: Handle, index: usize) -> Result<Handle> {
        let exports = self.get(node)?.exports.as_ref().ok_or(Error::WrongType)?;
        exports.get(index).map(|(_, h)| h).ok_or(Error::IndexRange)
    }

    /// Name of export `index` of `node`.
    pub fn export_name_at(&self, node: Handle, index: usize) -> Result<&str> {
        let exports = self.get(node)?.exports.as_ref().ok_or(Error::WrongType)?;
        exports.get(index).map(|(n, _)| n).ok_or(Error::IndexRange)
    }

    /// Release the creation reference of every object `family` created
    /// through the API and never handed to an owner.
    pub fn unload_all(&mut self, family: InstanceId, teardowns: &mut Vec<Teardown>) -> usize {
        let handles: Vec<Handle> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let record = slot.record.as_ref()?;
                (record.api_owner == Some(family)).then(|| Handle::new(index, slot.generation))
            })
            .collect();

        let mut released = 0;
        for handle in handles {
            let Ok(record) = self.get_mut(handle) else {
                // Finalized as a side effect of an earlier release.
                continue;
            };
            record.api_owner = None;
            if self.release(handle, teardowns).is_ok() {
                released += 1;
            }
        }
        released
    }

    // ───────────────────────────────────────────────────────────────
    // Engine acknowledgements
    // ───────────────────────────────────────────────────────────────

    /// The engine started running the voice.
    pub(crate) fn voice_started(&mut self, handle: Handle) {
        if let Some(voice) = self.get_mut(handle).ok().and_then(Record::voice_mut) {
            if voice.phase == VoicePhase::Pending {
                voice.phase = VoicePhase::Active;
            }
        }
    }

    /// The engine stopped the voice (kill or natural end). Consumes the
    /// creation reference unless the caller already released it.
    pub(crate) fn voice_ended(&mut self, handle: Handle, teardowns: &mut Vec<Teardown>) {
        let Ok(record) = self.get_mut(handle) else {
            return;
        };
        let Some(voice) = record.voice_mut() else {
            return;
        };
        if !voice.attached {
            return;
        }
        voice.attached = false;
        voice.phase = VoicePhase::Released;
        let consume = !voice.release_requested;
        if consume {
            record.refcount = record.refcount.saturating_sub(1);
        }
        if record.refcount == 0 {
            self.finalize(handle, teardowns);
        }
    }

    /// The engine dropped its binding to the voice handle.
    pub(crate) fn voice_detached(&mut self, handle: Handle, teardowns: &mut Vec<Teardown>) {
        let Ok(record) = self.get_mut(handle) else {
            return;
        };
        let Some(voice) = record.voice_mut() else {
            return;
        };
        voice.attached = false;
        if record.refcount == 0 {
            self.finalize(handle, teardowns);
        }
    }

    /// Forcibly finalize every voice handle of `instance`.
    ///
    /// Used when the instance closes and its engine is gone.
    pub(crate) fn purge_voices(&mut self, instance: InstanceId) -> usize {
        let handles: Vec<Handle> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let voice = slot.record.as_ref()?.voice()?;
                (voice.instance == instance).then(|| Handle::new(index, slot.generation))
            })
            .collect();
        let mut teardowns = Vec::new();
        for &handle in &handles {
            self.finalize(handle, &mut teardowns);
        }
        handles.len()
    }
}

/// Handle table shared by a master instance and its substates.
#[derive(Clone, Default)]
pub struct SharedTable {
    inner: Arc<Mutex<HandleTable>>,
}

impl SharedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the table. Control context only.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, HandleTable> {
        self.inner.lock()
    }

    /// Whether two instances share the same table.
    pub fn same_table(&self, other: &SharedTable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
