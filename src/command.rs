// src/command.rs
//
// Commands from the control context to the engine, and notices back.
//
// Commands are the ONLY way the control side can mutate a voice tree.
// They are timestamped on the control side and applied by the engine in
// (timestamp, submission) order.

use std::fmt;

use crate::audio_buffer::AudioBuffer;
use crate::fixed::Args;
use crate::handle::Handle;
use crate::program::VoiceUnit;

/// Fractional bits of a [`Ticks`] timestamp.
pub const FRAC_BITS: u32 = 8;

/// Timestamp in sample frames with [`FRAC_BITS`] fractional bits.
pub type Ticks = u64;

#[inline]
pub fn frames_to_ticks(frames: u64) -> Ticks {
    frames << FRAC_BITS
}

/// Whole frame a timestamp falls in.
#[inline]
pub fn ticks_to_frame(ticks: Ticks) -> u64 {
    ticks >> FRAC_BITS
}

/// Read-only callback run on a voice's output.
pub type TapFn = Box<dyn FnMut(&AudioBuffer) + Send>;

/// In-place processing callback run on a voice's output.
pub type InsertFn = Box<dyn FnMut(&mut AudioBuffer) + Send>;

/// Callback stage appended to a voice's processing.
pub enum XInsert {
    Tap(TapFn),
    Insert(InsertFn),
}

impl XInsert {
    #[inline]
    pub(crate) fn run(&mut self, io: &mut AudioBuffer) {
        match self {
            XInsert::Tap(f) => f(&*io),
            XInsert::Insert(f) => f(io),
        }
    }
}

impl fmt::Debug for XInsert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XInsert::Tap(_) => f.write_str("Tap"),
            XInsert::Insert(_) => f.write_str("Insert"),
        }
    }
}

/// What a command does once it is due.
pub enum Action {
    // ═══════════════════════════════════════════
    // Voice tree
    // ═══════════════════════════════════════════
    /// Create a subvoice of `parent` running `unit`. `handle` is `None` for
    /// fire-and-forget voices.
    Start {
        parent: Handle,
        handle: Option<Handle>,
        unit: Box<dyn VoiceUnit>,
    },

    /// Terminate a voice and its whole subtree.
    Kill { target: Handle },

    /// Terminate every child of a voice.
    KillChildren { target: Handle },

    /// Forget the handle of a voice; the voice keeps running unaddressed.
    Detach { target: Handle },

    /// Terminate every voice below the root.
    KillAll,

    // ═══════════════════════════════════════════
    // Messages
    // ═══════════════════════════════════════════
    /// Deliver a message to one voice.
    Send {
        target: Handle,
        entry: usize,
        args: Args,
    },

    /// Deliver a message to every child of a voice.
    SendChildren {
        target: Handle,
        entry: usize,
        args: Args,
    },

    // ═══════════════════════════════════════════
    // Callbacks
    // ═══════════════════════════════════════════
    /// Install a callback stage on a voice, replacing any previous one.
    SetXInsert { target: Handle, xinsert: XInsert },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start { parent, handle, .. } => f
                .debug_struct("Start")
                .field("parent", parent)
                .field("handle", handle)
                .finish_non_exhaustive(),
            Action::Kill { target } => f.debug_struct("Kill").field("target", target).finish(),
            Action::KillChildren { target } => f
                .debug_struct("KillChildren")
                .field("target", target)
                .finish(),
            Action::Detach { target } => f.debug_struct("Detach").field("target", target).finish(),
            Action::KillAll => f.write_str("KillAll"),
            Action::Send {
                target,
                entry,
                args,
            } => f
                .debug_struct("Send")
                .field("target", target)
                .field("entry", entry)
                .field("args", args)
                .finish(),
            Action::SendChildren {
                target,
                entry,
                args,
            } => f
                .debug_struct("SendChildren")
                .field("target", target)
                .field("entry", entry)
                .field("args", args)
                .finish(),
            Action::SetXInsert { target, xinsert } => f
                .debug_struct("SetXInsert")
                .field("target", target)
                .field("xinsert", xinsert)
                .finish(),
        }
    }
}

/// A timestamped command.
#[derive(Debug)]
pub struct Command {
    pub due: Ticks,
    pub action: Action,
}

impl Command {
    #[inline]
    pub fn new(due: Ticks, action: Action) -> Self {
        Self { due, action }
    }

    /// Frame the command is due in.
    #[inline]
    pub fn due_frame(&self) -> u64 {
        ticks_to_frame(self.due)
    }
}

/// Report from the engine about a voice handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The voice was created and is running.
    Started(Handle),
    /// The voice is gone (killed, finished or never created).
    Ended(Handle),
    /// The engine no longer refers to this handle.
    Detached(Handle),
}
