// src/voice.rs
//
// Audio-side voice tree.
//
// Voices live in a preallocated pool of slots linked by index (parent,
// first child, siblings). Nothing here allocates after construction, so the
// tree can be mutated from the audio callback.

use std::collections::HashMap;

use crate::audio_buffer::AudioBuffer;
use crate::command::{Notice, XInsert};
use crate::fixed::Args;
use crate::handle::Handle;
use crate::program::{ProcessContext, UnitStatus, VoiceUnit};

/// Largest number of frames a voice processes in one call.
pub const MAX_FRAG: usize = 64;

pub type VoiceId = usize;

/// One slot of the voice pool.
///
/// Voices do NOT know about the handle table; `handle` is only the key the
/// control side addresses them by.
pub struct Voice {
    active: bool,
    handle: Option<Handle>,
    unit: Option<Box<dyn VoiceUnit>>,
    xinsert: Option<XInsert>,
    parent: Option<VoiceId>,
    first_child: Option<VoiceId>,
    last_child: Option<VoiceId>,
    prev_sibling: Option<VoiceId>,
    next_sibling: Option<VoiceId>,
    /// Planar scratch, `channels * MAX_FRAG` samples.
    buffer: Vec<f32>,
}

impl Voice {
    fn new(channels: usize) -> Self {
        Self {
            active: false,
            handle: None,
            unit: None,
            xinsert: None,
            parent: None,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
            buffer: vec![0.0; channels * MAX_FRAG],
        }
    }
}

/// Pool of voices arranged as a tree below a permanent root voice.
pub struct VoiceTree {
    voices: Vec<Voice>,
    free: Vec<VoiceId>,
    by_handle: HashMap<Handle, VoiceId>,
    channels: usize,
    root: VoiceId,
}

impl VoiceTree {
    /// Create a pool of `max_voices` slots plus the root voice.
    pub fn new(
        max_voices: usize,
        channels: usize,
        root_handle: Handle,
        root_unit: Box<dyn VoiceUnit>,
    ) -> Self {
        let total = max_voices + 1;
        let voices: Vec<Voice> = (0..total).map(|_| Voice::new(channels)).collect();
        // Pop order hands out low ids first.
        let free: Vec<VoiceId> = (1..total).rev().collect();
        let mut tree = Self {
            voices,
            free,
            by_handle: HashMap::with_capacity(total),
            channels,
            root: 0,
        };
        let root = &mut tree.voices[0];
        root.active = true;
        root.handle = Some(root_handle);
        root.unit = Some(root_unit);
        tree.by_handle.insert(root_handle, 0);
        tree
    }

    #[inline]
    pub fn root(&self) -> VoiceId {
        self.root
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Voices in use below the root.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.voices.len() - 1 - self.free.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pool size, excluding the root voice.
    #[inline]
    pub fn total(&self) -> usize {
        self.voices.len() - 1
    }

    #[inline]
    pub fn find(&self, handle: Handle) -> Option<VoiceId> {
        self.by_handle.get(&handle).copied()
    }

    /// Create a child of `parent`. Hands the unit back when the pool is
    /// exhausted.
    pub fn spawn(
        &mut self,
        parent: VoiceId,
        handle: Option<Handle>,
        unit: Box<dyn VoiceUnit>,
    ) -> Result<VoiceId, Box<dyn VoiceUnit>> {
        let Some(id) = self.free.pop() else {
            return Err(unit);
        };
        let prev = self.voices[parent].last_child;
        {
            let voice = &mut self.voices[id];
            voice.active = true;
            voice.handle = handle;
            voice.unit = Some(unit);
            voice.xinsert = None;
            voice.parent = Some(parent);
            voice.first_child = None;
            voice.last_child = None;
            voice.prev_sibling = prev;
            voice.next_sibling = None;
        }
        match prev {
            Some(prev) => self.voices[prev].next_sibling = Some(id),
            None => self.voices[parent].first_child = Some(id),
        }
        self.voices[parent].last_child = Some(id);
        if let Some(handle) = handle {
            self.by_handle.insert(handle, id);
        }
        Ok(id)
    }

    /// Deliver a message to one voice.
    #[inline]
    pub fn message(&mut self, id: VoiceId, entry: usize, args: &Args) {
        if let Some(unit) = self.voices[id].unit.as_mut() {
            unit.message(entry, args);
        }
    }

    /// Deliver a message to every direct child of `id`.
    pub fn message_children(&mut self, id: VoiceId, entry: usize, args: &Args) {
        let mut child = self.voices[id].first_child;
        while let Some(c) = child {
            self.message(c, entry, args);
            child = self.voices[c].next_sibling;
        }
    }

    pub fn set_xinsert(&mut self, id: VoiceId, xinsert: XInsert) {
        self.voices[id].xinsert = Some(xinsert);
    }

    /// Forget the handle of a voice; it keeps running.
    pub fn detach(&mut self, handle: Handle) {
        if let Some(id) = self.by_handle.remove(&handle) {
            self.voices[id].handle = None;
        }
    }

    /// Terminate `id` and its subtree, depth first. The root voice only
    /// loses its children.
    pub fn kill(&mut self, id: VoiceId, notices: &mut Vec<Notice>) {
        self.kill_children(id, notices);
        if id == self.root {
            return;
        }
        self.unlink(id);
        let voice = &mut self.voices[id];
        voice.active = false;
        voice.unit = None;
        voice.xinsert = None;
        voice.parent = None;
        if let Some(handle) = voice.handle.take() {
            self.by_handle.remove(&handle);
            notices.push(Notice::Ended(handle));
        }
        self.free.push(id);
    }

    pub fn kill_children(&mut self, id: VoiceId, notices: &mut Vec<Notice>) {
        while let Some(child) = self.voices[id].first_child {
            self.kill(child, notices);
        }
    }

    fn unlink(&mut self, id: VoiceId) {
        let (parent, prev, next) = {
            let v = &self.voices[id];
            (v.parent, v.prev_sibling, v.next_sibling)
        };
        match prev {
            Some(prev) => self.voices[prev].next_sibling = next,
            None => {
                if let Some(parent) = parent {
                    self.voices[parent].first_child = next;
                }
            }
        }
        match next {
            Some(next) => self.voices[next].prev_sibling = prev,
            None => {
                if let Some(parent) = parent {
                    self.voices[parent].last_child = prev;
                }
            }
        }
        let v = &mut self.voices[id];
        v.prev_sibling = None;
        v.next_sibling = None;
    }

    /// Render the whole tree for `ctx.frames` (at most [`MAX_FRAG`]) frames.
    ///
    /// Returns a planar view of the root voice's output, valid until the
    /// next call. Executed instructions are added to `instructions`.
    pub fn render(
        &mut self,
        ctx: &ProcessContext,
        notices: &mut Vec<Notice>,
        instructions: &mut u64,
    ) -> &[f32] {
        debug_assert!(ctx.frames <= MAX_FRAG);
        self.render_voice(self.root, ctx, notices, instructions);
        &self.voices[self.root].buffer[..self.channels * ctx.frames]
    }

    /// Render one voice: mix its children, then run its unit and callbacks.
    /// Returns `true` when the voice finished on its own.
    fn render_voice(
        &mut self,
        id: VoiceId,
        ctx: &ProcessContext,
        notices: &mut Vec<Notice>,
        instructions: &mut u64,
    ) -> bool {
        let len = self.channels * ctx.frames;
        self.voices[id].buffer[..len].fill(0.0);

        let mut child = self.voices[id].first_child;
        while let Some(c) = child {
            let finished = self.render_voice(c, ctx, notices, instructions);
            // Take the child's scratch out so both buffers can be borrowed.
            let mut src = std::mem::take(&mut self.voices[c].buffer);
            {
                let src_view = AudioBuffer::new(&mut src[..len], self.channels);
                let mut dst = AudioBuffer::new(&mut self.voices[id].buffer[..len], self.channels);
                dst.mix_from(&src_view);
            }
            self.voices[c].buffer = src;
            // Read before a kill clears the links.
            child = self.voices[c].next_sibling;
            if finished {
                self.kill(c, notices);
            }
        }

        let channels = self.channels;
        let voice = &mut self.voices[id];
        let mut io = AudioBuffer::new(&mut voice.buffer[..len], channels);
        let status = match voice.unit.as_mut() {
            Some(unit) => {
                let status = unit.process(ctx, &mut io);
                *instructions += unit.take_instructions();
                status
            }
            None => UnitStatus::Finished,
        };
        if let Some(xinsert) = voice.xinsert.as_mut() {
            xinsert.run(&mut io);
        }
        status == UnitStatus::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::args;
    use crate::program::{GroupProgram, Program, VoiceSetup};

    /// Outputs a constant level for `frames` frames, then finishes.
    struct Dc {
        level: f32,
        remaining: usize,
    }

    impl VoiceUnit for Dc {
        fn message(&mut self, _entry: usize, args: &Args) {
            self.level = args.get_f32(0, self.level);
        }

        fn process(&mut self, ctx: &ProcessContext, io: &mut AudioBuffer) -> UnitStatus {
            let n = ctx.frames.min(self.remaining);
            for ch in 0..io.channels {
                for s in &mut io.channel_mut(ch)[..n] {
                    *s += self.level;
                }
            }
            self.remaining -= n;
            if self.remaining == 0 {
                UnitStatus::Finished
            } else {
                UnitStatus::Running
            }
        }

        fn take_instructions(&mut self) -> u64 {
            1
        }
    }

    fn dc(level: f32, frames: usize) -> Box<dyn VoiceUnit> {
        Box::new(Dc {
            level,
            remaining: frames,
        })
    }

    fn tree(max: usize) -> VoiceTree {
        let setup = VoiceSetup {
            sample_rate: 48_000,
            channels: 1,
        };
        VoiceTree::new(max, 1, Handle::new(1, 0), GroupProgram.instantiate(&setup, &Args::EMPTY))
    }

    fn ctx(frames: usize) -> ProcessContext {
        ProcessContext {
            frames,
            sample_rate: 48_000,
            sample_pos: 0,
        }
    }

    #[test]
    fn test_children_are_mixed_into_parent() {
        let mut t = tree(4);
        let mut notices = Vec::new();
        let mut instr = 0;
        let root = t.root();
        t.spawn(root, None, dc(0.25, 100)).ok().unwrap();
        t.spawn(root, None, dc(0.5, 100)).ok().unwrap();
        let out = t.render(&ctx(4), &mut notices, &mut instr);
        assert_eq!(out, &[0.75; 4]);
        assert_eq!(instr, 2);
        assert_eq!(t.active_count(), 2);
    }

    #[test]
    fn test_finished_voice_is_reclaimed() {
        let mut t = tree(4);
        let mut notices = Vec::new();
        let mut instr = 0;
        let root = t.root();
        let h = Handle::new(7, 0);
        t.spawn(root, Some(h), dc(1.0, 2)).ok().unwrap();
        let out = t.render(&ctx(4), &mut notices, &mut instr);
        assert_eq!(out, &[1.0, 1.0, 0.0, 0.0]);
        assert_eq!(notices, vec![Notice::Ended(h)]);
        assert_eq!(t.find(h), None);
        assert_eq!(t.free_count(), 4);
    }

    #[test]
    fn test_kill_is_depth_first() {
        let mut t = tree(4);
        let mut notices = Vec::new();
        let root = t.root();
        let (a, b, c) = (Handle::new(2, 0), Handle::new(3, 0), Handle::new(4, 0));
        let va = t.spawn(root, Some(a), dc(0.0, 100)).ok().unwrap();
        let vb = t.spawn(va, Some(b), dc(0.0, 100)).ok().unwrap();
        t.spawn(vb, Some(c), dc(0.0, 100)).ok().unwrap();
        t.kill(va, &mut notices);
        assert_eq!(
            notices,
            vec![Notice::Ended(c), Notice::Ended(b), Notice::Ended(a)]
        );
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.find(a), None);
    }

    #[test]
    fn test_kill_middle_sibling_keeps_links() {
        let mut t = tree(4);
        let mut notices = Vec::new();
        let mut instr = 0;
        let root = t.root();
        t.spawn(root, None, dc(1.0, 100)).ok().unwrap();
        let mid = t.spawn(root, None, dc(2.0, 100)).ok().unwrap();
        t.spawn(root, None, dc(4.0, 100)).ok().unwrap();
        t.kill(mid, &mut notices);
        assert!(notices.is_empty());
        let out = t.render(&ctx(1), &mut notices, &mut instr);
        assert_eq!(out, &[5.0]);
    }

    #[test]
    fn test_pool_exhaustion_returns_unit() {
        let mut t = tree(1);
        let root = t.root();
        assert!(t.spawn(root, None, dc(0.0, 1)).is_ok());
        assert!(t.spawn(root, None, dc(0.0, 1)).is_err());
    }

    #[test]
    fn test_message_children() {
        let mut t = tree(4);
        let mut notices = Vec::new();
        let mut instr = 0;
        let root = t.root();
        t.spawn(root, None, dc(0.0, 100)).ok().unwrap();
        t.spawn(root, None, dc(0.0, 100)).ok().unwrap();
        t.message_children(root, 1, &args(&[0.5]).unwrap());
        let out = t.render(&ctx(2), &mut notices, &mut instr);
        assert_eq!(out, &[1.0, 1.0]);
    }

    #[test]
    fn test_kill_root_only_clears_children() {
        let mut t = tree(2);
        let mut notices = Vec::new();
        let root = t.root();
        t.spawn(root, None, dc(0.0, 100)).ok().unwrap();
        t.kill(root, &mut notices);
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.find(Handle::new(1, 0)), Some(root));
    }
}
