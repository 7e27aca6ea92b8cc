// src/program.rs
//
// Programs and the voices that run them.
//
// Program code itself (the scripting VM) lives outside this crate. The engine
// only needs to instantiate a program on a voice, deliver messages to its
// entry points and ask it for audio.

use crate::audio_buffer::AudioBuffer;
use crate::fixed::{Args, MAX_ARGS};

/// Maximum number of entry points a program can have. Entry point 0 is main.
pub const MAX_ENTRY_POINTS: usize = 8;

/// Parameters a voice is instantiated with.
#[derive(Debug, Clone, Copy)]
pub struct VoiceSetup {
    pub sample_rate: u32,
    pub channels: usize,
}

/// Context passed to voice units during processing.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    /// Number of frames to process
    pub frames: usize,

    /// Sample rate
    pub sample_rate: u32,

    /// Sample position of the first frame
    pub sample_pos: u64,
}

/// Whether a voice keeps running after a processing call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    Running,
    Finished,
}

/// A loaded program that can be started on voices.
///
/// Programs are shared by every voice running them and must be immutable.
pub trait Program: Send + Sync {
    /// Import/export name of the program, if it has one.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Number of entry points, including main.
    fn entry_points(&self) -> usize {
        1
    }

    /// Maximum argument count accepted by entry point `entry`.
    fn max_args(&self, _entry: usize) -> usize {
        MAX_ARGS
    }

    /// Create the per-voice state for a new voice running this program.
    ///
    /// Called on the control side, so it may allocate.
    fn instantiate(&self, setup: &VoiceSetup, args: &Args) -> Box<dyn VoiceUnit>;
}

/// Per-voice program state, owned by the audio context.
///
/// Units:
/// - do NOT allocate
/// - do NOT block
/// - receive their children's mix in `io` and leave their output there
pub trait VoiceUnit: Send {
    /// Deliver a message to entry point `entry` (never 0).
    fn message(&mut self, entry: usize, args: &Args);

    /// Process `ctx.frames` frames in place.
    fn process(&mut self, ctx: &ProcessContext, io: &mut AudioBuffer) -> UnitStatus;

    /// Instructions executed since the last call; used for profiling.
    fn take_instructions(&mut self) -> u64 {
        0
    }
}

/// Built-in group program: a mixer voice with volume and pan controls.
///
/// `main(volume = 1.0, pan = 0.0)`; entry 1 sets volume, entry 2 sets pan.
#[derive(Debug, Default)]
pub struct GroupProgram;

pub mod group_ep {
    pub const VOLUME: usize = 1;
    pub const PAN: usize = 2;
}

impl Program for GroupProgram {
    fn name(&self) -> Option<&str> {
        Some("groupdriver")
    }

    fn entry_points(&self) -> usize {
        3
    }

    fn max_args(&self, entry: usize) -> usize {
        if entry == 0 { 2 } else { 1 }
    }

    fn instantiate(&self, _setup: &VoiceSetup, args: &Args) -> Box<dyn VoiceUnit> {
        Box::new(GroupUnit {
            volume: args.get_f32(0, 1.0),
            pan: args.get_f32(1, 0.0).clamp(-1.0, 1.0),
        })
    }
}

struct GroupUnit {
    volume: f32,
    pan: f32,
}

impl VoiceUnit for GroupUnit {
    fn message(&mut self, entry: usize, args: &Args) {
        match entry {
            group_ep::VOLUME => self.volume = args.get_f32(0, self.volume),
            group_ep::PAN => self.pan = args.get_f32(0, self.pan).clamp(-1.0, 1.0),
            _ => {}
        }
    }

    fn process(&mut self, ctx: &ProcessContext, io: &mut AudioBuffer) -> UnitStatus {
        if io.channels == 1 {
            for s in &mut io.channel_mut(0)[..ctx.frames] {
                *s *= self.volume;
            }
            return UnitStatus::Running;
        }
        let left = self.volume * (1.0 - self.pan).min(1.0);
        let right = self.volume * (1.0 + self.pan).min(1.0);
        for ch in 0..io.channels {
            let gain = match ch {
                0 => left,
                1 => right,
                _ => self.volume,
            };
            for s in &mut io.channel_mut(ch)[..ctx.frames] {
                *s *= gain;
            }
        }
        // Groups only end when killed.
        UnitStatus::Running
    }
}
