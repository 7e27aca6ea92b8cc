// src/render.rs
//
// Offline rendering: run a program on a private substate and collect its
// output into a wave.

use log::debug;

use crate::config::{Config, StateFlags};
use crate::error::{Error, Result};
use crate::fixed::Args;
use crate::handle::Handle;
use crate::object::ObjectKind;
use crate::state::State;
use crate::wave::{Wave, WaveFlags, WaveKind};

impl State {
    /// Render `program` into the writable object `sink`.
    ///
    /// With `length > 0` exactly `length` frames are rendered. With
    /// `length == 0` rendering continues until at least the silence grace
    /// period has passed and the output has stayed at or below the silence
    /// level for the silence window. Returns the number of frames rendered.
    ///
    /// Blocks until done.
    pub fn render(
        &self,
        sink: Handle,
        sample_rate: u32,
        length: u64,
        program: Handle,
        args: &Args,
    ) -> Result<u64> {
        if self.type_of(sink)? != ObjectKind::Wave {
            return Err(Error::WrongType);
        }
        let settings = *self.render_settings();
        let config = Config::new()
            .with_sample_rate(sample_rate)
            .with_buffer(settings.offline_buffer)
            .with_channels(1)
            .with_flags(StateFlags::TIMESTAMP);
        let sub = self.substate(config)?;

        let result = (|| -> Result<u64> {
            sub.play(sub.root_voice(), program, args)?;
            let block = settings.offline_buffer as u64;
            let mut out = Vec::with_capacity(settings.offline_buffer);
            let mut frames = 0u64;
            let mut since_peak = 0u64;
            loop {
                let n = if length > 0 {
                    block.min(length - frames)
                } else {
                    block
                };
                sub.run(n as usize, &mut out)?;
                let samples = &out[..n as usize];

                if length == 0 {
                    since_peak += n;
                    if let Some(i) = samples
                        .iter()
                        .rposition(|s| s.abs() > settings.silence_level)
                    {
                        since_peak = n - i as u64;
                    }
                }
                frames += n;
                self.write(sink, samples)?;

                let done = if length > 0 {
                    frames >= length
                } else {
                    frames >= settings.silence_grace && since_peak >= settings.silence_window
                };
                if done {
                    return Ok(frames);
                }
            }
        })();

        drop(sub.close());
        if let Ok(frames) = result {
            debug!("rendered {frames} frames into {sink}");
        }
        result
    }

    /// Render `program` into a new wave and prepare it for playback.
    ///
    /// A `period` of 0 tunes the wave so that pitch 0.0 plays it back at
    /// `sample_rate`. Nothing is left behind on failure.
    #[allow(clippy::too_many_arguments)]
    pub fn render_to_new_wave(
        &self,
        kind: WaveKind,
        period: u32,
        flags: WaveFlags,
        sample_rate: u32,
        length: u64,
        program: Handle,
        args: &Args,
    ) -> Result<Handle> {
        let period = match period {
            0 => Wave::period_for_rate(sample_rate),
            p => p,
        };
        let wave = self.new_wave(kind, period, flags)?;
        let rendered = self
            .render(wave, sample_rate, length, program, args)
            .and_then(|_| self.flush(wave));
        if let Err(e) = rendered {
            let _ = self.release(wave);
            return Err(e);
        }
        Ok(wave)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::error::Error;
    use crate::fixed::args;
    use crate::object::ObjectKind;
    use crate::object::Payload;
    use crate::state::State;
    use crate::test_programs::{LevelProgram, ToneProgram};
    use crate::wave::{WaveFlags, WaveKind};
    use std::sync::Arc;

    fn master() -> State {
        State::open(Config::new().with_sample_rate(44_100)).unwrap()
    }

    fn wave_len(state: &State, wave: crate::handle::Handle) -> usize {
        match &state.table().lock().get(wave).unwrap().payload {
            Payload::Wave(w) => w.len(),
            _ => panic!("not a wave"),
        }
    }

    #[test]
    fn test_silence_ends_open_ended_render() {
        let mut state = master();
        {
            let r = state.render_settings_mut();
            r.offline_buffer = 256;
            r.silence_grace = 1000;
            r.silence_window = 500;
        }
        let tone = state.new_program(Arc::new(ToneProgram)).unwrap();
        let wave = state.new_wave(WaveKind::Wave, 0, WaveFlags::NONE).unwrap();
        let frames = state
            .render(wave, 44_100, 0, tone, &args(&[1000.0, 0.5, 1000.0]).unwrap())
            .unwrap();
        assert!(frames >= 1000, "{frames}");
        // 1000 + 500 rounded up to the block size.
        assert!(frames <= 1536, "{frames}");
        assert_eq!(frames % 256, 0);
        assert_eq!(wave_len(&state, wave), frames as usize);
    }

    #[test]
    fn test_grace_period_is_always_rendered() {
        let mut state = master();
        {
            let r = state.render_settings_mut();
            r.offline_buffer = 100;
            r.silence_grace = 1000;
            r.silence_window = 0;
        }
        // Silent from the start.
        let silent = state.new_program(Arc::new(LevelProgram)).unwrap();
        let wave = state.new_wave(WaveKind::Wave, 0, WaveFlags::NONE).unwrap();
        let frames = state
            .render(wave, 44_100, 0, silent, &args(&[0.0]).unwrap())
            .unwrap();
        assert_eq!(frames, 1000);
    }

    #[test]
    fn test_fixed_length_is_exact() {
        let state = master();
        let level = state.new_program(Arc::new(LevelProgram)).unwrap();
        let wave = state.new_wave(WaveKind::Wave, 0, WaveFlags::NONE).unwrap();
        let frames = state
            .render(wave, 44_100, 3000, level, &args(&[0.25]).unwrap())
            .unwrap();
        assert_eq!(frames, 3000);
        assert_eq!(wave_len(&state, wave), 3000);
        match &state.table().lock().get(wave).unwrap().payload {
            Payload::Wave(w) => assert!(w.samples().iter().all(|&s| s == 0.25)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_render_to_new_wave_flushes() {
        let state = master();
        let tone = state.new_program(Arc::new(ToneProgram)).unwrap();
        let wave = state
            .render_to_new_wave(
                WaveKind::MipWave,
                0,
                WaveFlags::LOOPED,
                44_100,
                512,
                tone,
                &args(&[440.0]).unwrap(),
            )
            .unwrap();
        assert_eq!(state.type_of(wave).unwrap(), ObjectKind::Wave);
        match &state.table().lock().get(wave).unwrap().payload {
            Payload::Wave(w) => {
                assert!(w.is_prepared());
                assert_eq!(w.len(), 512);
                assert_eq!(w.period(), 168);
                assert_eq!(w.level(1).map(<[f32]>::len), Some(256));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_failed_render_leaves_nothing_behind() {
        let state = master();
        let before = state.table().lock().len();
        let not_a_program = state.new_string("nope").unwrap();
        let err = state
            .render_to_new_wave(
                WaveKind::Wave,
                0,
                WaveFlags::NONE,
                44_100,
                100,
                not_a_program,
                &args(&[]).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::WrongType));
        // Only the string is new; the wave and the substate's root voice
        // are gone.
        assert_eq!(state.table().lock().len(), before + 1);
    }

    #[test]
    fn test_render_needs_writable_sink() {
        let state = master();
        let level = state.new_program(Arc::new(LevelProgram)).unwrap();
        let text = state.new_string("x").unwrap();
        assert!(matches!(
            state.render(text, 44_100, 10, level, &args(&[]).unwrap()),
            Err(Error::WrongType)
        ));
    }
}
