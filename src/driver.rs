// src/driver.rs
//
// Audio drivers: what runs an engine and where its output goes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::audio_buffer::AudioBuffer;
use crate::config::StateFlags;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Stream parameters of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub sample_rate: u32,
    /// Frames per block.
    pub buffer: usize,
    pub channels: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer: 512,
            channels: 2,
        }
    }
}

/// Something that drives an engine.
///
/// Drivers are opened (by the instance, or beforehand by the caller), then
/// handed the engine with `start()`. `stop()` hands it back.
pub trait AudioDriver: Send {
    fn name(&self) -> &str;

    fn open(&mut self, settings: DriverSettings, flags: StateFlags) -> Result<()>;

    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// Parameters in effect. Only meaningful while open.
    fn settings(&self) -> DriverSettings;

    /// Flags the driver was opened with.
    fn flags(&self) -> StateFlags;

    /// Whether the driver runs the engine on its own clock.
    fn is_realtime(&self) -> bool {
        false
    }

    fn start(&mut self, engine: Engine) -> Result<()>;

    fn stop(&mut self) -> Option<Engine>;

    /// Render `frames` frames synchronously and return them planar.
    /// Only offline drivers support this.
    fn run(&mut self, _frames: usize) -> Result<&[f32]> {
        Err(Error::NotSupported("run() on a realtime driver"))
    }
}

// ═══════════════════════════════════════════════════════════════════
// BufferDriver
// ═══════════════════════════════════════════════════════════════════

/// Offline driver: renders into an internal buffer when asked to.
pub struct BufferDriver {
    settings: DriverSettings,
    flags: StateFlags,
    open: bool,
    engine: Option<Engine>,
    buffer: Vec<f32>,
}

impl Default for BufferDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferDriver {
    pub fn new() -> Self {
        Self {
            settings: DriverSettings::default(),
            flags: StateFlags::NONE,
            open: false,
            engine: None,
            buffer: Vec::new(),
        }
    }
}

impl AudioDriver for BufferDriver {
    fn name(&self) -> &str {
        "buffer"
    }

    fn open(&mut self, settings: DriverSettings, flags: StateFlags) -> Result<()> {
        if self.open {
            return Err(Error::DriverOpen("buffer driver already open".into()));
        }
        self.settings = settings;
        self.flags = flags;
        self.buffer = vec![0.0; settings.channels * settings.buffer];
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.engine = None;
        self.buffer = Vec::new();
        self.open = false;
    }

    fn settings(&self) -> DriverSettings {
        self.settings
    }

    fn flags(&self) -> StateFlags {
        self.flags
    }

    fn start(&mut self, engine: Engine) -> Result<()> {
        if !self.open {
            return Err(Error::DriverOpen("buffer driver not open".into()));
        }
        self.engine = Some(engine);
        Ok(())
    }

    fn stop(&mut self) -> Option<Engine> {
        self.engine.take()
    }

    fn run(&mut self, frames: usize) -> Result<&[f32]> {
        let engine = self.engine.as_mut().ok_or(Error::Closed)?;
        let channels = self.settings.channels;
        let len = channels * frames;
        if self.buffer.len() < len {
            self.buffer.resize(len, 0.0);
        }
        let mut io = AudioBuffer::new(&mut self.buffer[..len], channels);
        engine.process(&mut io);
        Ok(&self.buffer[..len])
    }
}

// ═══════════════════════════════════════════════════════════════════
// StreamDriver
// ═══════════════════════════════════════════════════════════════════

/// Receives every block a [`StreamDriver`] renders.
pub type BlockSink = Box<dyn FnMut(&AudioBuffer) + Send>;

/// Realtime driver: runs the engine on its own thread and hands each block
/// to a sink (an audio device callback, a file writer, a network stream).
pub struct StreamDriver {
    settings: DriverSettings,
    flags: StateFlags,
    open: bool,
    /// Sleep between blocks to keep to the sample rate.
    paced: bool,
    sink: Option<BlockSink>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<(Engine, BlockSink)>>,
}

impl StreamDriver {
    pub fn new(sink: BlockSink) -> Self {
        Self {
            settings: DriverSettings::default(),
            flags: StateFlags::NONE,
            open: false,
            paced: true,
            sink: Some(sink),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Render blocks back to back instead of in real time.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl AudioDriver for StreamDriver {
    fn name(&self) -> &str {
        "stream"
    }

    fn open(&mut self, settings: DriverSettings, flags: StateFlags) -> Result<()> {
        if self.open {
            return Err(Error::DriverOpen("stream driver already open".into()));
        }
        if self.sink.is_none() {
            return Err(Error::DriverOpen("stream driver has no sink".into()));
        }
        self.settings = settings;
        self.flags = flags;
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        drop(self.stop());
        self.open = false;
    }

    fn settings(&self) -> DriverSettings {
        self.settings
    }

    fn flags(&self) -> StateFlags {
        self.flags
    }

    fn is_realtime(&self) -> bool {
        true
    }

    fn start(&mut self, mut engine: Engine) -> Result<()> {
        if !self.open {
            return Err(Error::DriverOpen("stream driver not open".into()));
        }
        if self.worker.is_some() {
            return Err(Error::DriverOpen("stream driver already running".into()));
        }
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| Error::DriverOpen("stream driver has no sink".into()))?;
        let DriverSettings {
            sample_rate,
            buffer,
            channels,
        } = self.settings;
        let paced = self.paced;
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let worker = thread::Builder::new()
            .name("cadenza-audio".into())
            .spawn(move || {
                let mut data = vec![0.0; channels * buffer];
                let period = Duration::from_secs_f64(buffer as f64 / sample_rate as f64);
                let mut next = Instant::now();
                while running.load(Ordering::Acquire) {
                    let mut io = AudioBuffer::new(&mut data, channels);
                    engine.process(&mut io);
                    sink(&io);
                    if paced {
                        next += period;
                        let now = Instant::now();
                        if next > now {
                            thread::sleep(next - now);
                        } else {
                            next = now;
                        }
                    } else {
                        thread::yield_now();
                    }
                }
                (engine, sink)
            })?;
        debug!("stream driver started ({sample_rate} Hz, {buffer} frames)");
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Option<Engine> {
        let worker = self.worker.take()?;
        self.running.store(false, Ordering::Release);
        match worker.join() {
            Ok((engine, sink)) => {
                self.sink = Some(sink);
                Some(engine)
            }
            Err(_) => {
                warn!("audio thread panicked");
                None
            }
        }
    }
}

impl Drop for StreamDriver {
    fn drop(&mut self) {
        drop(self.stop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::create_bridge;
    use crate::engine::EngineSetup;
    use crate::fixed::Args;
    use crate::handle::Handle;
    use crate::program::{GroupProgram, Program, VoiceSetup};

    fn engine(channels: usize) -> Engine {
        let (_control, link) = create_bridge(4);
        let setup = EngineSetup {
            sample_rate: 48_000,
            channels,
            max_voices: 4,
            queue_capacity: 4,
        };
        let vs = VoiceSetup {
            sample_rate: 48_000,
            channels,
        };
        Engine::new(
            link,
            &setup,
            Handle::ROOT_BANK,
            GroupProgram.instantiate(&vs, &Args::EMPTY),
        )
    }

    fn settings(channels: usize) -> DriverSettings {
        DriverSettings {
            sample_rate: 48_000,
            buffer: 64,
            channels,
        }
    }

    #[test]
    fn test_buffer_driver_runs_engine() {
        let mut driver = BufferDriver::new();
        assert!(driver.run(16).is_err());
        driver.open(settings(2), StateFlags::NONE).unwrap();
        assert!(driver.open(settings(2), StateFlags::NONE).is_err());
        driver.start(engine(2)).unwrap();
        assert_eq!(driver.run(16).unwrap().len(), 32);
        // Larger than the configured block.
        assert_eq!(driver.run(100).unwrap().len(), 200);
        let engine = driver.stop().unwrap();
        assert_eq!(engine.sample_position(), 116);
        driver.close();
        assert!(!driver.is_open());
    }

    #[test]
    fn test_stream_driver_feeds_sink() {
        use std::sync::atomic::AtomicUsize;

        let frames = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&frames);
        let mut driver = StreamDriver::new(Box::new(move |io: &AudioBuffer| {
            counter.fetch_add(io.frames, Ordering::Relaxed);
        }))
        .unpaced();
        driver.open(settings(1), StateFlags::NONE).unwrap();
        assert!(driver.is_realtime());
        assert!(driver.run(16).is_err());
        driver.start(engine(1)).unwrap();
        while frames.load(Ordering::Relaxed) < 256 {
            thread::yield_now();
        }
        let engine = driver.stop().unwrap();
        assert!(engine.sample_position() >= 256);
        assert!(!driver.is_running());
        // The sink is back, so the driver can run again.
        driver.start(engine).unwrap();
        driver.close();
        assert!(!driver.is_running());
    }
}
