// src/scheduler.rs
//
// Timestamping on the control side and due-ordering on the audio side.

use std::collections::VecDeque;

use crate::command::{Command, Ticks, frames_to_ticks};

/// Control-side time cursor.
///
/// Every command submitted through an instance is stamped with the cursor.
/// `now()` snaps it to engine time, `wait()` moves it forward.
///
/// This struct is NOT real-time safe.
/// It must never be accessed from the audio thread.
#[derive(Debug, Clone)]
pub struct Timeline {
    sample_rate: u32,
    cursor: Ticks,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            cursor: 0,
        }
    }

    /// Timestamp given to the next command.
    #[inline]
    pub fn cursor(&self) -> Ticks {
        self.cursor
    }

    /// Snap the cursor to `engine_frame`, plus `latency` frames for drivers
    /// that render ahead of the control thread.
    pub fn now(&mut self, engine_frame: u64, latency: u64) {
        self.cursor = frames_to_ticks(engine_frame + latency);
    }

    /// Advance the cursor by `ms` milliseconds.
    ///
    /// Negative or non-finite delays are ignored.
    pub fn wait(&mut self, ms: f32) {
        self.cursor += self.ms_to_ticks(ms);
    }

    /// Convert milliseconds to ticks at this timeline's sample rate.
    #[inline]
    pub fn ms_to_ticks(&self, ms: f32) -> Ticks {
        if !ms.is_finite() || ms <= 0.0 {
            return 0;
        }
        let ticks = ms as f64 * self.sample_rate as f64 * frames_to_ticks(1) as f64 / 1000.0;
        ticks.round() as Ticks
    }
}

/// Audio-side queue of commands waiting for their due time.
///
/// Capacity is fixed at construction; the engine stops draining the command
/// channel while the queue is full, so pushing never allocates.
pub struct PendingQueue {
    entries: VecDeque<Command>,
    capacity: usize,
}

impl PendingQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Insert in (due, arrival) order. Returns the command back when full.
    pub fn push(&mut self, command: Command) -> Result<(), Command> {
        if self.is_full() {
            return Err(command);
        }
        // After every entry with the same or an earlier timestamp.
        let at = self.entries.partition_point(|c| c.due <= command.due);
        self.entries.insert(at, command);
        Ok(())
    }

    /// Frame of the earliest pending command.
    #[inline]
    pub fn next_due_frame(&self) -> Option<u64> {
        self.entries.front().map(Command::due_frame)
    }

    /// Pop the earliest command if it is due in or before `frame`.
    #[inline]
    pub fn pop_due(&mut self, frame: u64) -> Option<Command> {
        match self.next_due_frame() {
            Some(due) if due <= frame => self.entries.pop_front(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Action, ticks_to_frame};
    use crate::handle::Handle;

    fn kill(due: Ticks, index: usize) -> Command {
        Command::new(
            due,
            Action::Kill {
                target: Handle::new(index, 0),
            },
        )
    }

    fn target(cmd: &Command) -> usize {
        match cmd.action {
            Action::Kill { target } => target.index(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_wait_converts_ms_to_ticks() {
        let mut t = Timeline::new(48_000);
        t.wait(1.0);
        assert_eq!(t.cursor(), 48 * 256);
        t.wait(-5.0);
        t.wait(f32::NAN);
        assert_eq!(t.cursor(), 48 * 256);
        t.now(100, 0);
        assert_eq!(t.cursor(), frames_to_ticks(100));
        t.now(100, 512);
        assert_eq!(t.cursor(), frames_to_ticks(612));
    }

    #[test]
    fn test_fractional_wait_accumulates() {
        let mut t = Timeline::new(44_100);
        // 0.1 ms = 4.41 frames
        for _ in 0..10 {
            t.wait(0.1);
        }
        assert_eq!(ticks_to_frame(t.cursor()), 44);
    }

    #[test]
    fn test_same_timestamp_keeps_submission_order() {
        let mut q = PendingQueue::with_capacity(8);
        q.push(kill(512, 1)).unwrap();
        q.push(kill(256, 2)).unwrap();
        q.push(kill(512, 3)).unwrap();
        q.push(kill(256, 4)).unwrap();

        assert!(q.pop_due(0).is_none());
        assert_eq!(target(&q.pop_due(1).unwrap()), 2);
        assert_eq!(target(&q.pop_due(1).unwrap()), 4);
        assert!(q.pop_due(1).is_none());
        assert_eq!(q.next_due_frame(), Some(2));
        assert_eq!(target(&q.pop_due(10).unwrap()), 1);
        assert_eq!(target(&q.pop_due(10).unwrap()), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn test_full_queue_hands_command_back() {
        let mut q = PendingQueue::with_capacity(1);
        q.push(kill(0, 1)).unwrap();
        let rejected = q.push(kill(0, 2)).unwrap_err();
        assert_eq!(target(&rejected), 2);
        assert!(q.is_full());
    }
}
