// src/audio_buffer.rs

/// Planar multi-channel view over sample memory.
///
/// Channel `ch` occupies `data[ch * frames..(ch + 1) * frames]`.
#[derive(Debug)]
pub struct AudioBuffer<'a> {
    pub channels: usize,
    pub frames: usize,
    pub data: &'a mut [f32],
}

impl<'a> AudioBuffer<'a> {
    /// Create a new AudioBuffer wrapping existing data.
    #[inline]
    pub fn new(data: &'a mut [f32], channels: usize) -> Self {
        let frames = data.len() / channels;
        Self {
            channels,
            frames,
            data,
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    #[inline]
    pub fn channel(&self, ch: usize) -> &[f32] {
        let start = ch * self.frames;
        &self.data[start..start + self.frames]
    }

    #[inline]
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        let start = ch * self.frames;
        &mut self.data[start..start + self.frames]
    }

    /// Add `other` into this buffer, channel by channel.
    ///
    /// A mono source is spread over every channel of this buffer.
    #[inline]
    pub fn mix_from(&mut self, other: &AudioBuffer) {
        let frames = self.frames.min(other.frames);
        for ch in 0..self.channels {
            let src_ch = if other.channels == 1 { 0 } else { ch };
            if src_ch >= other.channels {
                continue;
            }
            let src = &other.channel(src_ch)[..frames];
            let dst = &mut self.channel_mut(ch)[..frames];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }
    }

    /// Get direct access to the sample data.
    #[inline]
    pub fn samples(&self) -> &[f32] {
        self.data
    }

    /// Get mutable access to the sample data.
    #[inline]
    pub fn samples_mut(&mut self) -> &mut [f32] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_channels() {
        let mut data = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let buf = AudioBuffer::new(&mut data, 2);
        assert_eq!(buf.frames, 3);
        assert_eq!(buf.channel(1), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_mix_mono_into_stereo() {
        let mut mono = vec![0.5, 0.25];
        let mut stereo = vec![1.0; 4];
        let src = AudioBuffer::new(&mut mono, 1);
        let mut dst = AudioBuffer::new(&mut stereo, 2);
        dst.mix_from(&src);
        assert_eq!(dst.samples(), &[1.5, 1.25, 1.5, 1.25]);
    }
}
