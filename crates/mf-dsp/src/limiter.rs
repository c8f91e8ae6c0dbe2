//! Limiters: cubic soft clip and the lookahead brickwall limiter.

use mf_core::math::db_to_amp;
use mf_core::{BufferMut, MAX_CHANNELS, Result, push_scratch};

use crate::{Meters, Plugin, PluginHeader, PluginSpecs, ProcessFlags};

/// Cheap soft clipper: hard clamp to [-1, 1] followed by the cubic
/// `1.5x - 0.5x^3`, which is smooth at the rails.
pub struct CubicLimiter {
    header: PluginHeader,
}

impl CubicLimiter {
    pub fn new() -> Self {
        Self { header: PluginHeader::new("Cubic Limiter") }
    }
}

impl Default for CubicLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn cubic_limit(sample: f32) -> f32 {
    let sample = sample.clamp(-1.0, 1.0);
    1.5 * sample - 0.5 * sample * sample * sample
}

impl Plugin for CubicLimiter {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut PluginHeader {
        &mut self.header
    }

    fn process(&mut self, buffer: &mut BufferMut, _flags: ProcessFlags) -> Result<()> {
        buffer.check()?;
        for i in 0..buffer.frames() {
            for c in 0..buffer.channels() {
                buffer.set_sample(i, c, cubic_limit(buffer.sample(i, c)));
            }
        }
        Ok(())
    }

    fn reset(&mut self) {}
}

/// Frames of lookahead the limiter plans gain over; also its latency.
pub const LOOKAHEAD_SAMPLES: usize = 128;

#[derive(Debug, Clone, Copy, Default)]
pub struct LookaheadLimiterConfig {
    /// Gain applied before limiting, in dB.
    pub gain_input: f32,
    /// Gain applied after limiting, in dB. Useful to get headroom back when
    /// feeding further processing.
    pub gain_output: f32,
}

#[derive(Debug, Clone, Copy)]
struct LookaheadChannel {
    values: [f32; LOOKAHEAD_SAMPLES],
}

impl Default for LookaheadChannel {
    fn default() -> Self {
        Self { values: [0.0; LOOKAHEAD_SAMPLES] }
    }
}

/// Keeps output within [-1, 1] by planning attenuation slopes over a
/// lookahead window, so peaks are caught by a ramp instead of a hard clip.
/// All channels share one gain plan computed from the loudest channel.
pub struct LookaheadLimiter {
    header: PluginHeader,
    pub config: LookaheadLimiterConfig,
    /// Current gain, walked by `slope` each frame.
    gain: f32,
    slope: f32,
    /// Frames until the active slope's target peak leaves the window.
    cooldown: usize,
    /// Mono peak ring shared by the gain planner.
    peaks: [f32; LOOKAHEAD_SAMPLES],
    index: usize,
    /// Deepest attenuation ever, for metering.
    pub min_amp: f32,
    /// Deepest attenuation in the current block.
    pub min_amp_short: f32,
    channels: Box<[LookaheadChannel; MAX_CHANNELS]>,
    pub meters_input: Meters,
    pub meters_output: Meters,
}

impl LookaheadLimiter {
    pub fn new(config: LookaheadLimiterConfig) -> Self {
        Self {
            header: PluginHeader::new("Lookahead Limiter"),
            config,
            gain: 1.0,
            slope: 0.0,
            cooldown: 0,
            peaks: [1.0; LOOKAHEAD_SAMPLES],
            index: 0,
            min_amp: 1.0,
            min_amp_short: 1.0,
            channels: Box::new([LookaheadChannel::default(); MAX_CHANNELS]),
            meters_input: Meters::default(),
            meters_output: Meters::default(),
        }
    }
}

impl Plugin for LookaheadLimiter {
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
        if let Some((first, count)) = self.header.track_channels(buffer.channels()) {
            self.reset_channels(first, count);
        }
        let amount_input = db_to_amp(self.config.gain_input);
        let amount_output = db_to_amp(self.config.gain_output);
        if self.header.observed {
            self.meters_input.update(&buffer.as_ref(), amount_input);
        }
        let frames = buffer.frames();
        let channels = buffer.channels();
        let mut gain_scratch = push_scratch(frames, 0, 0, 1, buffer.samplerate);
        let gain_plan = gain_scratch.samples_mut();
        // Plan the shared gain curve from the per-frame channel maximum.
        let mut index = self.index;
        self.min_amp_short = 1.0;
        for i in 0..frames {
            let mut loudest = 0.0f32;
            for c in 0..channels {
                loudest = loudest.max(buffer.sample(i, c).abs());
            }
            let peak = (loudest * amount_input).max(1.0);
            self.peaks[index] = peak;
            index = (index + 1) % LOOKAHEAD_SAMPLES;
            let slope = (1.0 / peak - self.gain) / LOOKAHEAD_SAMPLES as f32;
            if slope < self.slope {
                self.slope = slope;
                self.cooldown = LOOKAHEAD_SAMPLES;
            } else if self.cooldown == 0 && self.gain < 1.0 {
                // No active target: recover slowly, unless a peak still in
                // the window demands a steeper descent.
                self.slope = (1.0 - self.gain) / (LOOKAHEAD_SAMPLES as f32 * 5.0);
                for ahead in 0..LOOKAHEAD_SAMPLES {
                    let peak_ahead = self.peaks[(index + ahead) % LOOKAHEAD_SAMPLES];
                    let slope_ahead = (1.0 / peak_ahead - self.gain) / (ahead + 1) as f32;
                    if slope_ahead < self.slope {
                        self.slope = slope_ahead;
                        self.cooldown = ahead + 1;
                    }
                }
            } else if self.cooldown > 0 {
                self.cooldown -= 1;
            }
            self.gain += self.slope;
            self.min_amp_short = self.min_amp_short.min(self.gain);
            if self.gain > 1.0 {
                self.slope = 0.0;
                self.gain = 1.0;
            }
            gain_plan[i] = self.gain;
        }
        self.min_amp = self.min_amp.min(self.min_amp_short);
        // Apply the plan to every channel through its value delay line.
        for c in 0..channels {
            let state = &mut self.channels[c];
            let mut index = self.index;
            for i in 0..frames {
                state.values[index] = buffer.sample(i, c);
                index = (index + 1) % LOOKAHEAD_SAMPLES;
                let out = (state.values[index] * gain_plan[i] * amount_input).clamp(-1.0, 1.0);
                buffer.set_sample(i, c, out * amount_output);
            }
        }
        self.index = index_after(self.index, frames);
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn get_specs(&self, _samplerate: u32) -> PluginSpecs {
        PluginSpecs { latency_frames: LOOKAHEAD_SAMPLES as u32, ..Default::default() }
    }

    fn reset(&mut self) {
        self.gain = 1.0;
        self.slope = 0.0;
        self.cooldown = 0;
        self.peaks = [1.0; LOOKAHEAD_SAMPLES];
        self.index = 0;
        self.min_amp = 1.0;
        self.min_amp_short = 1.0;
        *self.channels = [LookaheadChannel::default(); MAX_CHANNELS];
        self.meters_input.reset();
        self.meters_output.reset();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        self.meters_input.reset_channels(first, count);
        self.meters_output.reset_channels(first, count);
        for c in first..(first + count).min(MAX_CHANNELS) {
            self.channels[c] = LookaheadChannel::default();
        }
    }
}

#[inline]
fn index_after(index: usize, frames: usize) -> usize {
    (index + frames) % LOOKAHEAD_SAMPLES
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use mf_core::{Buffer, ChannelLayout};

    #[test]
    fn cubic_is_bounded_and_smooth_at_rails() {
        assert_abs_diff_eq!(cubic_limit(1.0), 1.0);
        assert_abs_diff_eq!(cubic_limit(-1.0), -1.0);
        assert_abs_diff_eq!(cubic_limit(5.0), 1.0);
        assert_abs_diff_eq!(cubic_limit(0.0), 0.0);
        assert!(cubic_limit(0.5).abs() <= 1.0);
    }

    #[test]
    fn impulse_never_exceeds_unity_and_gain_recovers() {
        let mut limiter = LookaheadLimiter::new(LookaheadLimiterConfig::default());
        // Long enough for the slow recovery ramp to settle back to unity.
        let frames = LOOKAHEAD_SAMPLES * 120;
        let mut samples = vec![0.0f32; frames];
        samples[0] = 2.0;
        let mut buffer =
            Buffer::from_samples(samples, ChannelLayout::mono(), 48000).unwrap();
        limiter.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        let view = buffer.as_ref();
        for i in 0..frames {
            assert!(view.sample(i, 0).abs() <= 1.0, "sample {i} exceeded unity");
        }
        // The impulse was attenuated at its delayed position.
        assert!(limiter.min_amp < 0.75);
        // Well after the lookahead window, gain returns to unity.
        assert_abs_diff_eq!(limiter.gain, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn quiet_signal_passes_with_latency() {
        let mut limiter = LookaheadLimiter::new(LookaheadLimiterConfig::default());
        let frames = LOOKAHEAD_SAMPLES * 2;
        let samples: Vec<f32> = (0..frames).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        let mut buffer =
            Buffer::from_samples(samples.clone(), ChannelLayout::mono(), 48000).unwrap();
        limiter.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        let view = buffer.as_ref();
        // The head is the (zeroed) delay line flushing out; the ring holds
        // LOOKAHEAD_SAMPLES - 1 frames of history.
        let shift = LOOKAHEAD_SAMPLES - 1;
        for i in LOOKAHEAD_SAMPLES..frames {
            assert_abs_diff_eq!(view.sample(i, 0), samples[i - shift], epsilon = 1e-6);
        }
        assert_eq!(limiter.get_specs(48000).latency_frames, LOOKAHEAD_SAMPLES as u32);
    }
}
