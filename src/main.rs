// src/main.rs
//
// Sanity check: render a decaying tone offline and report what came out.

use std::f32::consts::TAU;
use std::sync::Arc;

use cadenza::{
    Args, AudioBuffer, Config, Payload, ProcessContext, Program, State, UnitStatus, VoiceSetup,
    VoiceUnit, WaveFlags, WaveKind, args,
};

/// ===============================
/// Test Program
/// ===============================

/// `main(freq, decay_ms)`: a sine with an exponential decay.
struct PluckProgram;

impl Program for PluckProgram {
    fn name(&self) -> Option<&str> {
        Some("pluck")
    }

    fn max_args(&self, _entry: usize) -> usize {
        2
    }

    fn instantiate(&self, setup: &VoiceSetup, args: &Args) -> Box<dyn VoiceUnit> {
        let sr = setup.sample_rate as f32;
        let decay_frames = args.get_f32(1, 50.0) * sr / 1000.0;
        Box::new(Pluck {
            step: args.get_f32(0, 440.0) / sr,
            phase: 0.0,
            gain: 0.8,
            falloff: (-1.0 / decay_frames.max(1.0)).exp(),
        })
    }
}

struct Pluck {
    step: f32,
    phase: f32,
    gain: f32,
    falloff: f32,
}

impl VoiceUnit for Pluck {
    fn message(&mut self, _entry: usize, _args: &Args) {}

    fn process(&mut self, ctx: &ProcessContext, io: &mut AudioBuffer) -> UnitStatus {
        for i in 0..ctx.frames {
            let s = (self.phase * TAU).sin() * self.gain;
            self.phase = (self.phase + self.step).fract();
            self.gain *= self.falloff;
            for ch in 0..io.channels {
                io.channel_mut(ch)[i] += s;
            }
        }
        if self.gain < 1e-6 {
            UnitStatus::Finished
        } else {
            UnitStatus::Running
        }
    }
}

/// ===============================
/// Main
/// ===============================

fn main() -> cadenza::Result<()> {
    let sample_rate = 44_100;

    let state = State::open(Config::new().with_sample_rate(sample_rate))?;
    let pluck = state.new_program(Arc::new(PluckProgram))?;

    // --------------------------------
    // Render until silent
    // --------------------------------

    let wave = state.new_wave(WaveKind::Wave, 0, WaveFlags::NONE)?;
    let frames = state.render(wave, sample_rate, 0, pluck, &args(&[440.0, 20.0])?)?;
    state.flush(wave)?;

    let peak = match &state.table().lock().get(wave)?.payload {
        Payload::Wave(w) => w.samples().iter().fold(0.0f32, |m, s| m.max(s.abs())),
        _ => 0.0,
    };

    println!("rendered {frames} frames ({:.1} ms)", frames as f64 * 1000.0 / sample_rate as f64);
    println!("peak: {peak:.3}");
    println!("{}", state.describe(wave)?);

    drop(state.close());
    Ok(())
}
