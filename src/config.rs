//! Engine instance configuration.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::compiler::ScriptCompiler;
use crate::driver::AudioDriver;
use crate::error::{Error, Result};
use crate::fixed::Fixed;

/// Most output channels an instance can have.
pub const MAX_CHANNELS: usize = 8;

/// Largest block, in frames, a driver or the offline renderer may use.
pub const MAX_BUFFER: usize = 16_384;

/// Instance flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StateFlags(pub u32);

impl StateFlags {
    pub const NONE: StateFlags = StateFlags(0);
    /// The driver runs the engine on its own clock. Set by the instance.
    pub const REALTIME: StateFlags = StateFlags(1 << 0);
    /// The instance closes its driver, even one handed over already open.
    pub const STATE_CLOSE: StateFlags = StateFlags(1 << 1);
    /// Loading exports every definition, not just the public ones.
    pub const EXPORT_ALL: StateFlags = StateFlags(1 << 2);
    /// `now()`/`wait()` stamp commands; otherwise commands are due on arrival.
    pub const TIMESTAMP: StateFlags = StateFlags(1 << 3);

    #[inline]
    pub fn contains(self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn set(&mut self, other: StateFlags, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl Default for StateFlags {
    fn default() -> Self {
        StateFlags::STATE_CLOSE | StateFlags::TIMESTAMP
    }
}

impl BitOr for StateFlags {
    type Output = StateFlags;

    fn bitor(self, rhs: StateFlags) -> StateFlags {
        StateFlags(self.0 | rhs.0)
    }
}

/// Offline renderer settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    /// Frames per processing step.
    pub offline_buffer: usize,
    /// Magnitude above which a sample counts as signal.
    pub silence_level: f32,
    /// Trailing silence, in frames, that ends an open-ended render.
    pub silence_window: u64,
    /// Frames always rendered before silence can end a render.
    pub silence_grace: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            offline_buffer: 1024,
            silence_level: 1.0 / 32768.0,
            silence_window: 4096,
            silence_grace: 0,
        }
    }
}

impl RenderSettings {
    pub fn silence_level_fixed(&self) -> Fixed {
        Fixed::from_f32(self.silence_level)
    }
}

/// Configuration for an engine instance.
pub struct Config {
    pub sample_rate: u32,
    /// Frames per driver block.
    pub buffer: usize,
    pub channels: usize,
    pub flags: StateFlags,
    /// Voice pool size, excluding the root voice.
    pub max_voices: usize,
    /// Commands that can be in flight before submission fails.
    pub queue_capacity: usize,
    /// Driver to use instead of a fresh buffer driver. If it is already
    /// open, its parameters override the ones above.
    pub driver: Option<Box<dyn AudioDriver>>,
    /// Compiler for `load()`/`load_string()`.
    pub compiler: Option<Arc<dyn ScriptCompiler>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer: 512,
            channels: 2,
            flags: StateFlags::default(),
            max_voices: 256,
            queue_capacity: 1024,
            driver: None,
            compiler: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sample_rate", &self.sample_rate)
            .field("buffer", &self.buffer)
            .field("channels", &self.channels)
            .field("flags", &self.flags)
            .field("max_voices", &self.max_voices)
            .field("queue_capacity", &self.queue_capacity)
            .field("driver", &self.driver.as_ref().map(|d| d.name()))
            .field("compiler", &self.compiler.is_some())
            .finish()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_buffer(mut self, frames: usize) -> Self {
        self.buffer = frames;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_flags(mut self, flags: StateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_max_voices(mut self, max_voices: usize) -> Self {
        self.max_voices = max_voices;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_driver(mut self, driver: Box<dyn AudioDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn ScriptCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(Error::InvalidConfig(format!(
                "sample_rate {} out of range (8000-384000 Hz)",
                self.sample_rate
            )));
        }
        if !(1..=MAX_BUFFER).contains(&self.buffer) {
            return Err(Error::InvalidConfig(format!(
                "buffer {} out of range (1-{MAX_BUFFER} frames)",
                self.buffer
            )));
        }
        if !(1..=MAX_CHANNELS).contains(&self.channels) {
            return Err(Error::InvalidConfig(format!(
                "channels {} out of range (1-{MAX_CHANNELS})",
                self.channels
            )));
        }
        if self.max_voices == 0 {
            return Err(Error::InvalidConfig("max_voices must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sample_rate, 48_000);
        assert!(config.flags.contains(StateFlags::STATE_CLOSE));
        assert!(config.flags.contains(StateFlags::TIMESTAMP));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_values() {
        assert!(Config::new().with_sample_rate(1000).validate().is_err());
        assert!(Config::new().with_channels(0).validate().is_err());
        assert!(Config::new().with_channels(9).validate().is_err());
        assert!(Config::new().with_buffer(0).validate().is_err());
        assert!(matches!(
            Config::new().with_queue_capacity(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_flag_ops() {
        let mut flags = StateFlags::NONE | StateFlags::EXPORT_ALL;
        assert!(flags.contains(StateFlags::EXPORT_ALL));
        flags.set(StateFlags::EXPORT_ALL, false);
        assert_eq!(flags, StateFlags::NONE);
    }

    #[test]
    fn test_render_defaults() {
        let r = RenderSettings::default();
        assert_eq!(r.offline_buffer, 1024);
        assert_eq!(r.silence_level_fixed().raw(), 2);
    }
}
