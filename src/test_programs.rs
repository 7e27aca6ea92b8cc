// src/test_programs.rs
//
// Small deterministic programs for tests.

use std::f32::consts::TAU;

use crate::audio_buffer::AudioBuffer;
use crate::fixed::Args;
use crate::program::{ProcessContext, Program, UnitStatus, VoiceSetup, VoiceUnit};

/// `main(freq = 1000, amp = 0.5, frames = 0)`: a sine tone, finishing after
/// `frames` frames (0 runs forever).
pub struct ToneProgram;

impl Program for ToneProgram {
    fn name(&self) -> Option<&str> {
        Some("tone")
    }

    fn max_args(&self, _entry: usize) -> usize {
        3
    }

    fn instantiate(&self, setup: &VoiceSetup, args: &Args) -> Box<dyn VoiceUnit> {
        let freq = args.get_f32(0, 1000.0);
        Box::new(Tone {
            step: freq / setup.sample_rate as f32,
            phase: 0.0,
            amp: args.get_f32(1, 0.5),
            remaining: match args.get_f32(2, 0.0) as u64 {
                0 => None,
                n => Some(n),
            },
        })
    }
}

struct Tone {
    step: f32,
    phase: f32,
    amp: f32,
    remaining: Option<u64>,
}

impl VoiceUnit for Tone {
    fn message(&mut self, _entry: usize, _args: &Args) {}

    fn process(&mut self, ctx: &ProcessContext, io: &mut AudioBuffer) -> UnitStatus {
        let n = match self.remaining {
            Some(r) => (r as usize).min(ctx.frames),
            None => ctx.frames,
        };
        for i in 0..n {
            let s = (self.phase * TAU).sin() * self.amp;
            self.phase = (self.phase + self.step).fract();
            for ch in 0..io.channels {
                io.channel_mut(ch)[i] += s;
            }
        }
        match self.remaining.as_mut() {
            Some(r) => {
                *r -= n as u64;
                if *r == 0 {
                    UnitStatus::Finished
                } else {
                    UnitStatus::Running
                }
            }
            None => UnitStatus::Running,
        }
    }

    fn take_instructions(&mut self) -> u64 {
        1
    }
}

pub mod level_ep {
    pub const SET: usize = 1;
    pub const DOUBLE: usize = 2;
    pub const FINISH: usize = 3;
}

/// `main(level = 0)`: a constant level. Entry 1 sets it, entry 2 doubles
/// it, entry 3 ends the voice.
pub struct LevelProgram;

impl Program for LevelProgram {
    fn name(&self) -> Option<&str> {
        Some("level")
    }

    fn entry_points(&self) -> usize {
        4
    }

    fn max_args(&self, entry: usize) -> usize {
        match entry {
            0 | level_ep::SET => 1,
            _ => 0,
        }
    }

    fn instantiate(&self, _setup: &VoiceSetup, args: &Args) -> Box<dyn VoiceUnit> {
        Box::new(Level {
            level: args.get_f32(0, 0.0),
            finished: false,
        })
    }
}

struct Level {
    level: f32,
    finished: bool,
}

impl VoiceUnit for Level {
    fn message(&mut self, entry: usize, args: &Args) {
        match entry {
            level_ep::SET => self.level = args.get_f32(0, self.level),
            level_ep::DOUBLE => self.level *= 2.0,
            level_ep::FINISH => self.finished = true,
            _ => {}
        }
    }

    fn process(&mut self, ctx: &ProcessContext, io: &mut AudioBuffer) -> UnitStatus {
        if self.finished {
            return UnitStatus::Finished;
        }
        for ch in 0..io.channels {
            for s in &mut io.channel_mut(ch)[..ctx.frames] {
                *s += self.level;
            }
        }
        UnitStatus::Running
    }
}
