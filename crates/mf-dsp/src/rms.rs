//! Sliding-window RMS.

use mf_core::{BufferMut, BufferRef, Error, MAX_CHANNELS, Result};

use crate::{Plugin, PluginHeader, ProcessFlags, check_buffers};

/// How squared samples combine across channels in mono sidechain mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombineOp {
    /// Track the loudest channel.
    #[default]
    MaxOfSquares,
    /// Sum energy across channels.
    SumOfSquares,
}

impl CombineOp {
    #[inline]
    fn apply(self, accum: &mut f32, value: f32) {
        match self {
            CombineOp::MaxOfSquares => *accum = accum.max(value),
            CombineOp::SumOfSquares => *accum += value,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RmsConfig {
    pub window_samples: usize,
    pub combine_op: CombineOp,
}

impl Default for RmsConfig {
    fn default() -> Self {
        Self { window_samples: 512, combine_op: CombineOp::default() }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RmsChannel {
    squared_sum: f32,
}

/// Running root-mean-square over a sample window. Writing to a mono
/// destination from a multichannel source combines channels per sample with
/// the configured op before accumulating (sidechain mode).
pub struct Rms {
    header: PluginHeader,
    pub config: RmsConfig,
    channels: [RmsChannel; MAX_CHANNELS],
    /// Ring of squared samples, one `window_samples` plane per channel.
    buffer: Vec<f32>,
    index: usize,
}

impl Rms {
    pub fn new(config: RmsConfig) -> Self {
        Self {
            header: PluginHeader::new("RMS"),
            config,
            channels: [RmsChannel::default(); MAX_CHANNELS],
            buffer: Vec::new(),
            index: 0,
        }
    }

    fn ensure_buffer(&mut self, channels: usize) -> Result<()> {
        let needed = self.config.window_samples * channels;
        if self.buffer.len() < needed {
            self.buffer.resize(needed, 0.0);
            self.reset_state();
        }
        Ok(())
    }

    fn reset_state(&mut self) {
        self.index = 0;
        self.buffer.fill(0.0);
        self.channels = [RmsChannel::default(); MAX_CHANNELS];
    }

    /// One step of a channel's window: retire the oldest squared sample,
    /// admit the new one, clamp underflow, return the RMS.
    #[inline]
    fn step(&mut self, channel: usize, squared: f32) -> f32 {
        let window = self.config.window_samples;
        let slot = channel * window + self.index;
        let state = &mut self.channels[channel];
        state.squared_sum -= self.buffer[slot];
        self.buffer[slot] = squared;
        state.squared_sum += squared;
        // Rounding errors can drive the sum slightly negative, which would
        // turn sqrt into NaN.
        if state.squared_sum < 0.0 {
            state.squared_sum = 0.0;
        }
        (state.squared_sum / window as f32).sqrt()
    }

    #[inline]
    fn advance(&mut self) {
        self.index += 1;
        if self.index >= self.config.window_samples {
            self.index = 0;
        }
    }
}

impl Plugin for Rms {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut PluginHeader {
        &mut self.header
    }

    fn process(&mut self, buffer: &mut BufferMut, flags: ProcessFlags) -> Result<()> {
        if flags.contains(ProcessFlags::CUT) {
            self.reset();
        }
        buffer.check()?;
        self.ensure_buffer(buffer.channels())?;
        if let Some((first, count)) = self.header.track_channels(buffer.channels()) {
            self.reset_channels(first, count);
        }
        let channels = buffer.channels();
        for i in 0..buffer.frames() {
            for c in 0..channels {
                let sample = buffer.sample(i, c);
                let rms = self.step(c, sample * sample);
                buffer.set_sample(i, c, rms);
            }
            self.advance();
        }
        Ok(())
    }

    fn process_dual(
        &mut self,
        dst: &mut BufferMut,
        src: &BufferRef,
        flags: ProcessFlags,
    ) -> Result<()> {
        if flags.contains(ProcessFlags::CUT) {
            self.reset();
        }
        check_buffers(dst, src, true, false)?;
        if dst.channels() != 1 && dst.channels() != src.channels() {
            log::error!(
                "RMS expects dst to have either 1 channel or src's channel count, got {} vs {}",
                dst.channels(),
                src.channels()
            );
            return Err(Error::MismatchedChannelCount);
        }
        self.ensure_buffer(dst.channels())?;
        if let Some((first, count)) = self.header.track_channels(dst.channels()) {
            self.reset_channels(first, count);
        }
        if dst.channels() == 1 && src.channels() != 1 {
            // Mono sidechain: combine channels per sample before the window.
            let op = self.config.combine_op;
            for i in 0..src.frames() {
                let mut combined = 0.0;
                for c in 0..src.channels() {
                    let sample = src.sample(i, c);
                    op.apply(&mut combined, sample * sample);
                }
                let rms = self.step(0, combined);
                dst.set_sample(i, 0, rms);
                self.advance();
            }
        } else {
            let channels = dst.channels();
            for i in 0..src.frames() {
                for c in 0..channels {
                    let sample = src.sample(i, c);
                    let rms = self.step(c, sample * sample);
                    dst.set_sample(i, c, rms);
                }
                self.advance();
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.reset_state();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        let window = self.config.window_samples;
        for c in first..(first + count).min(MAX_CHANNELS) {
            self.channels[c] = RmsChannel::default();
            let start = c * window;
            if start < self.buffer.len() {
                let end = (start + window).min(self.buffer.len());
                self.buffer[start..end].fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use mf_core::{Buffer, ChannelLayout};

    #[test]
    fn window_of_ones_reads_one() {
        let window = 64;
        let mut rms = Rms::new(RmsConfig { window_samples: window, ..Default::default() });
        let mut buffer =
            Buffer::from_samples(vec![1.0f32; window], ChannelLayout::mono(), 48000).unwrap();
        rms.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        // After the window fills, the output is exactly 1 within 1 ULP.
        assert_abs_diff_eq!(buffer.as_ref().sample(window - 1, 0), 1.0, epsilon = f32::EPSILON);
    }

    #[test]
    fn window_of_zeros_reads_zero() {
        let window = 32;
        let mut rms = Rms::new(RmsConfig { window_samples: window, ..Default::default() });
        // Prime with signal, then feed a full window of silence.
        let mut loud =
            Buffer::from_samples(vec![0.8f32; window], ChannelLayout::mono(), 48000).unwrap();
        rms.process(&mut loud.as_mut(), ProcessFlags::NONE).unwrap();
        let mut silent = Buffer::new(window, 0, 0, ChannelLayout::mono(), 48000).unwrap();
        rms.process(&mut silent.as_mut(), ProcessFlags::NONE).unwrap();
        assert_eq!(silent.as_ref().sample(window - 1, 0), 0.0);
    }

    #[test]
    fn mono_sidechain_combines_channels() {
        let window = 16;
        let mut rms = Rms::new(RmsConfig {
            window_samples: window,
            combine_op: CombineOp::MaxOfSquares,
        });
        // Stereo source, right channel louder.
        let mut samples = Vec::new();
        for _ in 0..window {
            samples.push(0.1f32);
            samples.push(1.0f32);
        }
        let src = Buffer::from_samples(samples, ChannelLayout::stereo(), 48000).unwrap();
        let mut dst = Buffer::new(window, 0, 0, ChannelLayout::mono(), 48000).unwrap();
        rms.process_dual(&mut dst.as_mut(), &src.as_ref(), ProcessFlags::NONE).unwrap();
        // Max-of-squares follows the loud channel.
        assert_abs_diff_eq!(dst.as_ref().sample(window - 1, 0), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn cut_resets_history() {
        let window = 32;
        let mut rms = Rms::new(RmsConfig { window_samples: window, ..Default::default() });
        let mut loud =
            Buffer::from_samples(vec![1.0f32; window], ChannelLayout::mono(), 48000).unwrap();
        rms.process(&mut loud.as_mut(), ProcessFlags::NONE).unwrap();
        let mut silent = Buffer::new(1, 0, 0, ChannelLayout::mono(), 48000).unwrap();
        rms.process(&mut silent.as_mut(), ProcessFlags::CUT).unwrap();
        assert_eq!(silent.as_ref().sample(0, 0), 0.0);
    }
}
