//! Thread-safe bridge between the control side and an engine.
//!
//! This module provides the communication layer that allows the control
//! thread to drive a real-time engine without sharing any of its state.
//!
//! # Architecture
//!
//! - **Control thread** owns a [`ControlLink`] inside its engine instance
//! - **Audio context** owns an [`EngineLink`] inside the [`Engine`]
//! - Commands and notices travel over bounded channels; counters are
//!   published through atomics
//!
//! # Usage
//!
//! ```ignore
//! let (control, link) = create_bridge(1024);
//! let engine = Engine::new(link, &setup, root, group_unit);
//!
//! // Control thread: queue commands
//! control.send(Command::new(due, Action::KillAll))?;
//!
//! // Audio context: apply and render
//! engine.process(&mut output);
//! ```
//!
//! [`Engine`]: crate::engine::Engine

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use log::warn;

use crate::command::{Command, Notice};
use crate::error::{Error, Result};

/// Handle for the control thread to talk to one engine.
pub struct ControlLink {
    /// Channel to send commands to the engine.
    command_tx: Sender<Command>,

    /// Channel to receive voice notices.
    notice_rx: Receiver<Notice>,

    /// Shared readback state (updated by engine, read by control).
    readback: Arc<SharedReadback>,
}

/// The engine's end of the bridge.
pub struct EngineLink {
    /// Channel to receive commands from the control side.
    pub(crate) command_rx: Receiver<Command>,

    /// Channel to send notices back.
    pub(crate) notice_tx: Sender<Notice>,

    /// Shared readback state (written by engine).
    pub(crate) readback: Arc<SharedReadback>,
}

/// Lock-free shared state for engine -> control readback.
///
/// Uses atomics for frequently updated values.
#[derive(Debug, Default)]
pub struct SharedReadback {
    sample_position: AtomicU64,
    active_voices: AtomicU32,
    free_voices: AtomicU32,
    total_voices: AtomicU32,
    /// Percent of real time spent processing.
    cpu_load_avg: AtomicU32,
    cpu_load_max: AtomicU32,
    /// Microseconds per processing call.
    cpu_time_avg: AtomicU32,
    cpu_time_max: AtomicU32,
    instructions: AtomicU64,
    /// Commands dropped because their voice pool was exhausted.
    dropped_starts: AtomicU64,
}

/// Snapshot of [`SharedReadback`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineReadback {
    pub sample_position: u64,
    pub active_voices: u32,
    pub free_voices: u32,
    pub total_voices: u32,
    pub cpu_load_avg: u32,
    pub cpu_load_max: u32,
    pub cpu_time_avg: u32,
    pub cpu_time_max: u32,
    pub instructions: u64,
    pub dropped_starts: u64,
}

/// Create a linked pair of ends. `capacity` bounds the command queue; the
/// notice queue gets twice that, since a kill can report a whole subtree.
pub fn create_bridge(capacity: usize) -> (ControlLink, EngineLink) {
    let (command_tx, command_rx) = bounded(capacity);
    let (notice_tx, notice_rx) = bounded(capacity * 2);
    let readback = Arc::new(SharedReadback::default());

    let control = ControlLink {
        command_tx,
        notice_rx,
        readback: Arc::clone(&readback),
    };

    let engine = EngineLink {
        command_rx,
        notice_tx,
        readback,
    };

    (control, engine)
}

// ═══════════════════════════════════════════════════════════════════
// ControlLink - control thread API
// ═══════════════════════════════════════════════════════════════════

impl ControlLink {
    /// Queue a command. Never blocks.
    pub fn send(&self, cmd: Command) -> Result<()> {
        match self.command_tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(cmd)) => {
                warn!("command queue full, rejecting {:?}", cmd.action);
                Err(Error::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::Closed),
        }
    }

    /// Take every notice the engine has published so far.
    pub fn drain_notices(&self) -> impl Iterator<Item = Notice> + '_ {
        self.notice_rx.try_iter()
    }

    /// Get the current engine readback state.
    pub fn readback(&self) -> EngineReadback {
        self.readback.snapshot()
    }

    /// Engine time in sample frames.
    #[inline]
    pub fn sample_position(&self) -> u64 {
        self.readback.sample_position.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════
// EngineLink - audio context API
// ═══════════════════════════════════════════════════════════════════

impl EngineLink {
    /// Try to receive a single command (non-blocking).
    #[inline]
    pub fn try_recv(&self) -> Option<Command> {
        match self.command_rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Publish a notice. Hands it back when the control side is behind.
    #[inline]
    pub fn notify(&self, notice: Notice) -> std::result::Result<(), Notice> {
        match self.notice_tx.try_send(notice) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(n)) => Err(n),
            // Nobody is listening any more.
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }

    #[inline]
    pub fn readback(&self) -> &SharedReadback {
        &self.readback
    }
}

// ═══════════════════════════════════════════════════════════════════
// Readback
// ═══════════════════════════════════════════════════════════════════

impl SharedReadback {
    pub fn snapshot(&self) -> EngineReadback {
        EngineReadback {
            sample_position: self.sample_position.load(Ordering::Relaxed),
            active_voices: self.active_voices.load(Ordering::Relaxed),
            free_voices: self.free_voices.load(Ordering::Relaxed),
            total_voices: self.total_voices.load(Ordering::Relaxed),
            cpu_load_avg: self.cpu_load_avg.load(Ordering::Relaxed),
            cpu_load_max: self.cpu_load_max.load(Ordering::Relaxed),
            cpu_time_avg: self.cpu_time_avg.load(Ordering::Relaxed),
            cpu_time_max: self.cpu_time_max.load(Ordering::Relaxed),
            instructions: self.instructions.load(Ordering::Relaxed),
            dropped_starts: self.dropped_starts.load(Ordering::Relaxed),
        }
    }

    /// Update the sample position readback (called every block).
    #[inline]
    pub fn update_sample_position(&self, pos: u64) {
        self.sample_position.store(pos, Ordering::Relaxed);
    }

    /// Update the voice pool readback.
    #[inline]
    pub fn update_voices(&self, active: usize, free: usize, total: usize) {
        self.active_voices.store(active as u32, Ordering::Relaxed);
        self.free_voices.store(free as u32, Ordering::Relaxed);
        self.total_voices.store(total as u32, Ordering::Relaxed);
    }

    #[inline]
    pub fn update_cpu(&self, load_avg: u32, load_max: u32, time_avg: u32, time_max: u32) {
        self.cpu_load_avg.store(load_avg, Ordering::Relaxed);
        self.cpu_load_max.store(load_max, Ordering::Relaxed);
        self.cpu_time_avg.store(time_avg, Ordering::Relaxed);
        self.cpu_time_max.store(time_max, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_instructions(&self, n: u64) {
        self.instructions.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_dropped_start(&self) {
        self.dropped_starts.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Action;
    use crate::handle::Handle;

    #[test]
    fn test_full_queue_reports_queue_full() {
        let (control, link) = create_bridge(2);
        control.send(Command::new(0, Action::KillAll)).unwrap();
        control.send(Command::new(0, Action::KillAll)).unwrap();
        assert!(matches!(
            control.send(Command::new(0, Action::KillAll)),
            Err(Error::QueueFull)
        ));
        assert!(link.try_recv().is_some());
        control.send(Command::new(0, Action::KillAll)).unwrap();
    }

    #[test]
    fn test_closed_engine_reports_closed() {
        let (control, link) = create_bridge(2);
        drop(link);
        assert!(matches!(
            control.send(Command::new(0, Action::KillAll)),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_notices_and_readback() {
        let (control, link) = create_bridge(1);
        let h = Handle::new(3, 0);
        link.notify(Notice::Started(h)).unwrap();
        link.notify(Notice::Ended(h)).unwrap();
        assert_eq!(link.notify(Notice::Detached(h)), Err(Notice::Detached(h)));
        let got: Vec<_> = control.drain_notices().collect();
        assert_eq!(got, vec![Notice::Started(h), Notice::Ended(h)]);

        link.readback().update_sample_position(4096);
        link.readback().update_voices(3, 5, 8);
        let rb = control.readback();
        assert_eq!(control.sample_position(), 4096);
        assert_eq!((rb.active_voices, rb.free_voices, rb.total_voices), (3, 5, 8));
    }
}
