// src/engine.rs

use std::time::Instant;

use crate::audio_buffer::AudioBuffer;
use crate::bridge::EngineLink;
use crate::command::{Action, Command, Notice};
use crate::handle::Handle;
use crate::program::{ProcessContext, VoiceUnit};
use crate::scheduler::PendingQueue;
use crate::voice::{MAX_FRAG, VoiceTree};

/// Fixed parameters of one engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineSetup {
    pub sample_rate: u32,
    pub channels: usize,
    pub max_voices: usize,
    /// Commands held while waiting for their due time.
    pub queue_capacity: usize,
}

/// Real-time audio engine of one instance.
///
/// This struct runs exclusively in the audio context (a driver thread, or
/// the control thread itself when rendering offline).
/// It must be deterministic, allocation-free, and lock-free.
/// It never touches the handle table; everything it learns arrives as
/// commands and everything it reports leaves as notices.
pub struct Engine {
    link: EngineLink,

    /// Voice tree below the instance's root voice
    tree: VoiceTree,

    /// Commands waiting for their due frame
    pending: PendingQueue,

    /// Notices not yet accepted by the notice channel
    outbox: Vec<Notice>,

    sample_rate: u32,

    /// Current sample position
    sample_pos: u64,

    /// Smoothed CPU figures
    load_avg: f32,
    load_max: f32,
    time_avg: f32,
    time_max: f32,
}

impl Engine {
    pub fn new(
        link: EngineLink,
        setup: &EngineSetup,
        root: Handle,
        root_unit: Box<dyn VoiceUnit>,
    ) -> Self {
        let tree = VoiceTree::new(setup.max_voices, setup.channels, root, root_unit);
        link.readback()
            .update_voices(0, tree.free_count(), tree.total());
        Self {
            link,
            tree,
            pending: PendingQueue::with_capacity(setup.queue_capacity),
            outbox: Vec::with_capacity(setup.max_voices * 2 + setup.queue_capacity),
            sample_rate: setup.sample_rate,
            sample_pos: 0,
            load_avg: 0.0,
            load_max: 0.0,
            time_avg: 0.0,
            time_max: 0.0,
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.tree.channels()
    }

    #[inline]
    pub fn sample_position(&self) -> u64 {
        self.sample_pos
    }

    /// Get active voice count
    #[inline]
    pub fn active_voices(&self) -> usize {
        self.tree.active_count()
    }

    /// Render `output.frames` frames.
    ///
    /// Called once per audio block. Commands queued before the call are
    /// picked up first; each is applied at the start of the frame it is due
    /// in, so processing is split into fragments at due times and at
    /// [`MAX_FRAG`] frames.
    pub fn process(&mut self, output: &mut AudioBuffer) {
        let started = Instant::now();
        self.fetch_commands();
        output.clear();

        let frames = output.frames;
        let channels = output.channels.min(self.tree.channels());
        let mut instructions = 0u64;
        let mut done = 0usize;

        while done < frames {
            self.apply_due();

            let mut chunk = (frames - done).min(MAX_FRAG);
            if let Some(due) = self.pending.next_due_frame() {
                // apply_due() left only future commands behind.
                chunk = chunk.min((due - self.sample_pos) as usize);
            }

            let ctx = ProcessContext {
                frames: chunk,
                sample_rate: self.sample_rate,
                sample_pos: self.sample_pos,
            };
            let mixed = self.tree.render(&ctx, &mut self.outbox, &mut instructions);
            for ch in 0..channels {
                output.channel_mut(ch)[done..done + chunk]
                    .copy_from_slice(&mixed[ch * chunk..(ch + 1) * chunk]);
            }

            self.sample_pos += chunk as u64;
            done += chunk;

            // Refill once a full backlog has been worked off.
            if self.pending.is_empty() {
                self.fetch_commands();
            }
        }

        self.flush_notices();
        self.publish(frames, started, instructions);
    }

    /// Wind the engine down once its driver has let go of it.
    ///
    /// Applies whatever is already due, which ends with the `KillAll` queued
    /// by a closing instance, then kills anything still below the root in
    /// case that command did not fit in the queue.
    pub fn finish(&mut self) {
        self.fetch_commands();
        self.apply_due();
        self.apply(Command::new(0, Action::KillAll));
        self.flush_notices();
        self.link.readback().update_voices(
            self.tree.active_count(),
            self.tree.free_count(),
            self.tree.total(),
        );
    }

    /// Move queued commands into the pending queue while it has room.
    fn fetch_commands(&mut self) {
        while !self.pending.is_full() {
            let Some(cmd) = self.link.try_recv() else {
                break;
            };
            if self.pending.push(cmd).is_err() {
                break;
            }
        }
    }

    /// Apply every command due at or before the current frame.
    fn apply_due(&mut self) {
        while let Some(cmd) = self.pending.pop_due(self.sample_pos) {
            self.apply(cmd);
        }
    }

    /// Apply one command immediately.
    ///
    /// Commands addressed to voices that are gone are dropped.
    #[inline]
    fn apply(&mut self, cmd: Command) {
        match cmd.action {
            Action::Start {
                parent,
                handle,
                unit,
            } => {
                let Some(parent) = self.tree.find(parent) else {
                    if let Some(h) = handle {
                        self.outbox.push(Notice::Ended(h));
                    }
                    return;
                };
                match self.tree.spawn(parent, handle, unit) {
                    Ok(_) => {
                        if let Some(h) = handle {
                            self.outbox.push(Notice::Started(h));
                        }
                    }
                    Err(_unit) => {
                        self.link.readback().count_dropped_start();
                        if let Some(h) = handle {
                            self.outbox.push(Notice::Ended(h));
                        }
                    }
                }
            }

            Action::Kill { target } => {
                if let Some(id) = self.tree.find(target) {
                    self.tree.kill(id, &mut self.outbox);
                }
            }

            Action::KillChildren { target } => {
                if let Some(id) = self.tree.find(target) {
                    self.tree.kill_children(id, &mut self.outbox);
                }
            }

            Action::KillAll => {
                let root = self.tree.root();
                self.tree.kill_children(root, &mut self.outbox);
            }

            Action::Detach { target } => {
                self.tree.detach(target);
                self.outbox.push(Notice::Detached(target));
            }

            Action::Send {
                target,
                entry,
                args,
            } => {
                if let Some(id) = self.tree.find(target) {
                    self.tree.message(id, entry, &args);
                }
            }

            Action::SendChildren {
                target,
                entry,
                args,
            } => {
                if let Some(id) = self.tree.find(target) {
                    self.tree.message_children(id, entry, &args);
                }
            }

            Action::SetXInsert { target, xinsert } => {
                if let Some(id) = self.tree.find(target) {
                    self.tree.set_xinsert(id, xinsert);
                }
            }
        }
    }

    /// Hand notices to the control side. Whatever does not fit stays in the
    /// outbox for the next block.
    fn flush_notices(&mut self) {
        let mut sent = 0;
        for notice in &self.outbox {
            if self.link.notify(*notice).is_err() {
                break;
            }
            sent += 1;
        }
        self.outbox.drain(..sent);
    }

    fn publish(&mut self, frames: usize, started: Instant, instructions: u64) {
        let readback = self.link.readback();
        readback.update_sample_position(self.sample_pos);
        readback.update_voices(
            self.tree.active_count(),
            self.tree.free_count(),
            self.tree.total(),
        );
        readback.add_instructions(instructions);

        if frames == 0 {
            return;
        }
        let elapsed_us = started.elapsed().as_secs_f32() * 1e6;
        let budget_us = frames as f32 * 1e6 / self.sample_rate as f32;
        let load = 100.0 * elapsed_us / budget_us;
        self.load_avg += (load - self.load_avg) * 0.1;
        self.time_avg += (elapsed_us - self.time_avg) * 0.1;
        self.load_max = self.load_max.max(load);
        self.time_max = self.time_max.max(elapsed_us);
        readback.update_cpu(
            self.load_avg.round() as u32,
            self.load_max.round() as u32,
            self.time_avg.round() as u32,
            self.time_max.round() as u32,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ControlLink, create_bridge};
    use crate::command::{Command, frames_to_ticks};
    use crate::fixed::{Args, args};
    use crate::program::{GroupProgram, Program, UnitStatus, VoiceSetup};

    /// Outputs `level` until told otherwise. Entry 1 sets the level, entry 2
    /// doubles it.
    struct Level(f32);

    impl VoiceUnit for Level {
        fn message(&mut self, entry: usize, args: &Args) {
            match entry {
                1 => self.0 = args.get_f32(0, self.0),
                2 => self.0 *= 2.0,
                _ => {}
            }
        }

        fn process(&mut self, ctx: &ProcessContext, io: &mut AudioBuffer) -> UnitStatus {
            for ch in 0..io.channels {
                for s in &mut io.channel_mut(ch)[..ctx.frames] {
                    *s += self.0;
                }
            }
            UnitStatus::Running
        }
    }

    const ROOT: Handle = Handle::ROOT_BANK;

    fn engine(max_voices: usize, queue: usize) -> (ControlLink, Engine) {
        let (control, link) = create_bridge(queue);
        let setup = EngineSetup {
            sample_rate: 48_000,
            channels: 1,
            max_voices,
            queue_capacity: queue,
        };
        let vs = VoiceSetup {
            sample_rate: 48_000,
            channels: 1,
        };
        let root = GroupProgram.instantiate(&vs, &Args::EMPTY);
        (control, Engine::new(link, &setup, ROOT, root))
    }

    fn run(engine: &mut Engine, frames: usize) -> Vec<f32> {
        let mut data = vec![0.0; frames];
        engine.process(&mut AudioBuffer::new(&mut data, 1));
        data
    }

    fn start(h: usize, level: f32, at: u64) -> Command {
        Command::new(
            frames_to_ticks(at),
            Action::Start {
                parent: ROOT,
                handle: Some(Handle::new(h, 0)),
                unit: Box::new(Level(level)),
            },
        )
    }

    #[test]
    fn test_start_is_sample_accurate() {
        let (control, mut engine) = engine(4, 16);
        control.send(start(1, 1.0, 10)).unwrap();
        let out = run(&mut engine, 128);
        assert!(out[..10].iter().all(|&s| s == 0.0));
        assert!(out[10..].iter().all(|&s| s == 1.0));
        assert_eq!(
            control.drain_notices().collect::<Vec<_>>(),
            vec![Notice::Started(Handle::new(1, 0))]
        );
        assert_eq!(engine.sample_position(), 128);
        assert_eq!(control.readback().active_voices, 1);
    }

    #[test]
    fn test_same_timestamp_applies_in_submission_order() {
        let (control, mut engine) = engine(4, 16);
        let h = Handle::new(1, 0);
        control.send(start(1, 0.0, 0)).unwrap();
        // A sets, B doubles: B must see A's value.
        control
            .send(Command::new(
                frames_to_ticks(4),
                Action::Send {
                    target: h,
                    entry: 1,
                    args: args(&[0.25]).unwrap(),
                },
            ))
            .unwrap();
        control
            .send(Command::new(
                frames_to_ticks(4),
                Action::Send {
                    target: h,
                    entry: 2,
                    args: Args::EMPTY,
                },
            ))
            .unwrap();
        let out = run(&mut engine, 8);
        assert_eq!(&out[..4], &[0.0; 4]);
        assert_eq!(&out[4..], &[0.5; 4]);
    }

    #[test]
    fn test_commands_for_gone_voices_are_dropped() {
        let (control, mut engine) = engine(4, 16);
        control
            .send(Command::new(
                0,
                Action::Kill {
                    target: Handle::new(9, 0),
                },
            ))
            .unwrap();
        control
            .send(Command::new(
                0,
                Action::Send {
                    target: Handle::new(9, 0),
                    entry: 1,
                    args: Args::EMPTY,
                },
            ))
            .unwrap();
        run(&mut engine, 16);
        assert_eq!(control.drain_notices().count(), 0);
    }

    #[test]
    fn test_exhausted_pool_ends_voice() {
        let (control, mut engine) = engine(1, 16);
        control.send(start(1, 1.0, 0)).unwrap();
        control.send(start(2, 1.0, 0)).unwrap();
        run(&mut engine, 16);
        let notices: Vec<_> = control.drain_notices().collect();
        assert_eq!(
            notices,
            vec![
                Notice::Started(Handle::new(1, 0)),
                Notice::Ended(Handle::new(2, 0))
            ]
        );
        assert_eq!(control.readback().dropped_starts, 1);
    }

    #[test]
    fn test_detach_keeps_voice_running() {
        let (control, mut engine) = engine(4, 16);
        let h = Handle::new(1, 0);
        control.send(start(1, 1.0, 0)).unwrap();
        control.send(Command::new(0, Action::Detach { target: h })).unwrap();
        // Addressing the old handle no longer reaches the voice.
        control.send(Command::new(0, Action::Kill { target: h })).unwrap();
        let out = run(&mut engine, 4);
        assert_eq!(out, vec![1.0; 4]);
        assert_eq!(
            control.drain_notices().collect::<Vec<_>>(),
            vec![Notice::Started(h), Notice::Detached(h)]
        );
        control.send(Command::new(0, Action::KillAll)).unwrap();
        let out = run(&mut engine, 4);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_tap_sees_voice_output() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let (control, mut engine) = engine(4, 16);
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_tap = Arc::clone(&seen);
        control.send(start(1, 1.0, 0)).unwrap();
        control
            .send(Command::new(
                0,
                Action::SetXInsert {
                    target: ROOT,
                    xinsert: crate::command::XInsert::Tap(Box::new(move |io: &AudioBuffer| {
                        seen_in_tap.fetch_add(io.frames as u32, Ordering::Relaxed);
                    })),
                },
            ))
            .unwrap();
        run(&mut engine, 100);
        assert_eq!(seen.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_finish_kills_every_voice() {
        let (control, mut engine) = engine(4, 16);
        control.send(start(1, 1.0, 0)).unwrap();
        control.send(start(2, 1.0, 0)).unwrap();
        run(&mut engine, 4);
        // Never due before the engine stops.
        control.send(start(3, 1.0, 1000)).unwrap();
        control.send(Command::new(0, Action::KillAll)).unwrap();
        engine.finish();
        assert_eq!(engine.active_voices(), 0);
        assert_eq!(control.readback().active_voices, 0);
        assert_eq!(
            control.drain_notices().collect::<Vec<_>>(),
            vec![
                Notice::Started(Handle::new(1, 0)),
                Notice::Started(Handle::new(2, 0)),
                Notice::Ended(Handle::new(1, 0)),
                Notice::Ended(Handle::new(2, 0)),
            ]
        );
    }

    #[test]
    fn test_finish_without_queued_kill() {
        let (control, mut engine) = engine(4, 1);
        control.send(start(1, 1.0, 0)).unwrap();
        run(&mut engine, 4);
        engine.finish();
        assert_eq!(engine.active_voices(), 0);
        let notices: Vec<_> = control.drain_notices().collect();
        assert_eq!(notices.last(), Some(&Notice::Ended(Handle::new(1, 0))));
    }
}
