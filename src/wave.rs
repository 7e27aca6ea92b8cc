// src/wave.rs
//
// Waveform objects: sample storage written by the offline renderer and
// prepared ("flushed") for playback.

/// Default reference frequency for linear pitch 0.0; "middle C".
pub const MIDDLE_C: f32 = 261.626;

/// Number of waveform mipmap levels.
pub const MIP_LEVELS: usize = 10;

/// Storage layout of a wave.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaveKind {
    /// Plain single-level wave.
    Wave,
    /// Wave with precomputed mip levels for alias-free playback.
    MipWave,
}

/// Wave flags.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct WaveFlags(pub u32);

impl WaveFlags {
    pub const NONE: WaveFlags = WaveFlags(0);
    pub const LOOPED: WaveFlags = WaveFlags(1);

    #[inline]
    pub fn contains(self, other: WaveFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A mono waveform.
#[derive(Debug, Clone)]
pub struct Wave {
    kind: WaveKind,
    /// Period in sample frames; sets the tuning of pitch 0.0.
    period: u32,
    flags: WaveFlags,
    data: Vec<f32>,
    /// Decimated copies, level 1 upwards (only for mip waves).
    mip: Vec<Vec<f32>>,
    prepared: bool,
}

impl Wave {
    pub fn new(kind: WaveKind, period: u32, flags: WaveFlags) -> Self {
        Self {
            kind,
            period: period.max(1),
            flags,
            data: Vec::new(),
            mip: Vec::new(),
            prepared: false,
        }
    }

    /// Period giving playback at `sample_rate` for pitch 0.0.
    pub fn period_for_rate(sample_rate: u32) -> u32 {
        ((sample_rate as f32 / MIDDLE_C) as u32).max(1)
    }

    pub fn kind(&self) -> WaveKind {
        self.kind
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn flags(&self) -> WaveFlags {
        self.flags
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.data
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn is_looped(&self) -> bool {
        self.flags.contains(WaveFlags::LOOPED)
    }

    pub fn set_looped(&mut self, looped: bool) {
        if looped {
            self.flags.0 |= WaveFlags::LOOPED.0;
        } else {
            self.flags.0 &= !WaveFlags::LOOPED.0;
        }
    }

    /// Append frames. Invalidates any derived playback data.
    pub fn write(&mut self, frames: &[f32]) {
        self.data.extend_from_slice(frames);
        self.prepared = false;
    }

    /// Build playback-ready derived data.
    pub fn flush(&mut self) {
        self.mip.clear();
        if self.kind == WaveKind::MipWave {
            let mut levels: Vec<Vec<f32>> = Vec::with_capacity(MIP_LEVELS - 1);
            for _ in 1..MIP_LEVELS {
                let prev = levels.last().unwrap_or(&self.data);
                let level = decimate(prev);
                levels.push(level);
            }
            self.mip = levels;
        }
        self.prepared = true;
    }

    /// Sample data of mip level `level` (0 is the original data).
    pub fn level(&self, level: usize) -> Option<&[f32]> {
        match level {
            0 => Some(&self.data),
            n => self.mip.get(n - 1).map(Vec::as_slice),
        }
    }
}

fn decimate(samples: &[f32]) -> Vec<f32> {
    samples
        .chunks(2)
        .map(|pair| pair.iter().sum::<f32>() / pair.len() as f32)
        .collect()
}
