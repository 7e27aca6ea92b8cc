// src/object.rs
//
// Object records stored in the handle table.

use std::fmt;
use std::sync::Arc;

use crate::command::Ticks;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::program::Program;
use crate::wave::Wave;

/// Object type tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Bank,
    Wave,
    Program,
    String,
    Voice,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Bank => "bank",
            ObjectKind::Wave => "wave",
            ObjectKind::Program => "program",
            ObjectKind::String => "string",
            ObjectKind::Voice => "voice",
        }
    }

    /// Whether objects of this kind may take ownership of other objects.
    pub fn can_own(self) -> bool {
        matches!(self, ObjectKind::Bank | ObjectKind::Voice)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one engine instance (master or substate) within a table family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(pub(crate) u32);

/// Lifecycle of a voice as seen from the control side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VoicePhase {
    /// Start command queued, not yet applied by the engine.
    Pending,
    /// Running and responsive to messages.
    Active,
    /// Release requested; waiting for the engine to let go of the voice.
    Stopping,
    /// The engine no longer runs this voice.
    Released,
}

/// Control-side bookkeeping for a voice handle.
pub struct VoiceInfo {
    pub instance: InstanceId,
    /// Program running on the voice; used to validate messages.
    pub program: Arc<dyn Program>,
    pub phase: VoicePhase,
    /// Due time of the start command. Teardown is never due earlier.
    pub start: Ticks,
    /// The engine holds the voice (queued or running).
    pub attached: bool,
    /// The last caller reference was released while attached.
    pub release_requested: bool,
}

/// Type-specific object data.
pub enum Payload {
    Bank,
    Wave(Wave),
    Program(Arc<dyn Program>),
    String(String),
    Voice(VoiceInfo),
}

impl Payload {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Payload::Bank => ObjectKind::Bank,
            Payload::Wave(_) => ObjectKind::Wave,
            Payload::Program(_) => ObjectKind::Program,
            Payload::String(_) => ObjectKind::String,
            Payload::Voice(_) => ObjectKind::Voice,
        }
    }
}

/// Insertion-ordered, uniquely named exports of a bank.
#[derive(Debug, Default, Clone)]
pub struct ExportTable {
    entries: Vec<(String, Handle)>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn find(&self, name: &str) -> Option<Handle> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, h)| *h)
    }

    /// Insert a new export. Existing names are left untouched.
    pub fn insert(&mut self, name: &str, handle: Handle) -> Result<()> {
        if self.contains(name) {
            return Err(Error::NameExists(name.to_string()));
        }
        self.entries.push((name.to_string(), handle));
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<(&str, Handle)> {
        self.entries.get(index).map(|(n, h)| (n.as_str(), *h))
    }

    /// Drop every entry referring to `handle`.
    pub fn remove_handle(&mut self, handle: Handle) {
        self.entries.retain(|(_, h)| *h != handle);
    }
}

/// One live object.
pub struct Record {
    pub payload: Payload,
    pub refcount: u32,
    /// Object that releases this one when it is destroyed.
    pub owner: Option<Handle>,
    /// Objects this one releases when it is destroyed.
    pub owned: Vec<Handle>,
    /// Named exports; only banks have them.
    pub exports: Option<ExportTable>,
    pub name: Option<String>,
    /// Application-visible object flags.
    pub flags: i32,
    /// Instance family that created this object through the API and still
    /// holds its creation reference.
    pub api_owner: Option<InstanceId>,
}

impl Record {
    pub fn new(payload: Payload) -> Self {
        let exports = matches!(payload, Payload::Bank).then(ExportTable::new);
        Self {
            payload,
            refcount: 1,
            owner: None,
            owned: Vec::new(),
            exports,
            name: None,
            flags: 0,
            api_owner: None,
        }
    }

    pub fn with_name(mut self, name: Option<&str>) -> Self {
        self.name = name.map(str::to_string);
        self
    }

    pub fn kind(&self) -> ObjectKind {
        self.payload.kind()
    }

    pub fn voice(&self) -> Option<&VoiceInfo> {
        match &self.payload {
            Payload::Voice(v) => Some(v),
            _ => None,
        }
    }

    pub fn voice_mut(&mut self) -> Option<&mut VoiceInfo> {
        match &mut self.payload {
            Payload::Voice(v) => Some(v),
            _ => None,
        }
    }

    /// Short human readable description.
    pub fn describe(&self, handle: Handle) -> String {
        let mut s = match &self.name {
            Some(name) => format!("{} '{}'", self.kind(), name),
            None => self.kind().to_string(),
        };
        match &self.payload {
            Payload::Wave(w) => s.push_str(&format!(" ({} frames)", w.len())),
            Payload::String(text) => s.push_str(&format!(" \"{text}\"")),
            Payload::Voice(v) => s.push_str(&format!(" [{:?}]", v.phase)),
            Payload::Bank => {
                let n = self.exports.as_ref().map_or(0, ExportTable::len);
                s.push_str(&format!(" ({n} exports)"));
            }
            Payload::Program(_) => {}
        }
        s.push_str(&format!(" #{handle}"));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_table_unique_names() {
        let mut t = ExportTable::new();
        t.insert("a", Handle::new(1, 0)).unwrap();
        t.insert("b", Handle::new(2, 0)).unwrap();
        assert!(matches!(
            t.insert("a", Handle::new(3, 0)),
            Err(Error::NameExists(_))
        ));
        assert_eq!(t.find("a"), Some(Handle::new(1, 0)));
        assert_eq!(t.get(1), Some(("b", Handle::new(2, 0))));
        t.remove_handle(Handle::new(1, 0));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_only_banks_have_exports() {
        assert!(Record::new(Payload::Bank).exports.is_some());
        assert!(Record::new(Payload::String("x".into())).exports.is_none());
        assert!(ObjectKind::Voice.can_own());
        assert!(!ObjectKind::Wave.can_own());
    }

    #[test]
    fn test_describe() {
        let r = Record::new(Payload::String("hi".into())).with_name(Some("greeting"));
        assert_eq!(r.describe(Handle::new(4, 0)), "string 'greeting' \"hi\" #4");
    }
}
