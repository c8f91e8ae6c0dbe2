//! Kernel-sampled variable delay, the doppler workhorse.
//!
//! Each channel owns a ring sized `delay_max + kernel + block` with the
//! "now" point a fixed offset from the end, so kernel sampling never runs
//! off either side. Delay targets are followed linearly across the block;
//! per output frame the read position interpolates between the start and
//! end delay, and the kernel radius adapts to the resulting resampling
//! rate to bound aliasing when the delay shrinks over time.

use mf_core::math::{db_to_amp, lerp, ms_to_samples};
use mf_core::{BufferMut, MAX_CHANNELS, Result, push_scratch_copy};

use crate::chain::DspChain;
use crate::kernel::{Kernel, default_lanczos, radius_for_rate, sample_with_kernel_1ch};
use crate::meters::FollowerLinear;
use crate::{Meters, Plugin, PluginHeader, PluginSpecs, ProcessFlags};

/// Kernel radius targeted at unity rate; 13 plays nice with 8-wide SIMD.
const DESIRED_KERNEL_RADIUS: usize = 13;

/// Rates below this would make kernel sampling arbitrarily expensive
/// (cost grows as 1/rate), so the channel outputs silence instead.
const MIN_RATE: f32 = 0.01;

#[derive(Debug, Clone, Copy, Default)]
pub struct DelayDynamicChannelConfig {
    /// Target delay for this channel, in ms.
    pub delay_ms: f32,
}

#[derive(Debug, Clone)]
pub struct DelayDynamicConfig {
    pub gain_wet: f32,
    pub gain_dry: f32,
    pub mute_wet: bool,
    pub mute_dry: bool,
    /// Upper bound on any channel's delay, in ms. Determines ring size.
    pub delay_max_ms: f32,
    /// How long a delay change takes to settle, in ms.
    pub delay_follow_time_ms: f32,
    pub feedback: f32,
    pub pingpong: f32,
    /// Overrides the rate-adaptive default kernel bank.
    pub kernel: Option<Kernel>,
    pub channels: [DelayDynamicChannelConfig; MAX_CHANNELS],
}

impl Default for DelayDynamicConfig {
    fn default() -> Self {
        Self {
            gain_wet: -6.0,
            gain_dry: 0.0,
            mute_wet: false,
            mute_dry: false,
            delay_max_ms: 500.0,
            delay_follow_time_ms: 20.0,
            feedback: 0.5,
            pingpong: 0.0,
            kernel: None,
            channels: [DelayDynamicChannelConfig::default(); MAX_CHANNELS],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DelayDynamicChannel {
    delay_ms: FollowerLinear,
    rate_previous: f32,
}

pub struct DelayDynamic {
    header: PluginHeader,
    pub config: DelayDynamicConfig,
    /// Effects applied to the wet path before it enters the ring.
    pub input_effects: DspChain,
    /// One `per_channel_cap` plane per channel.
    buffer: Vec<f32>,
    per_channel_cap: usize,
    buffer_channels: usize,
    last_src_frames: usize,
    channels: [DelayDynamicChannel; MAX_CHANNELS],
    pub meters_input: Meters,
    pub meters_output: Meters,
}

impl DelayDynamic {
    pub fn new(config: DelayDynamicConfig) -> Self {
        Self {
            header: PluginHeader::new("Dynamic Delay"),
            config,
            input_effects: DspChain::new(),
            buffer: Vec::new(),
            per_channel_cap: 0,
            buffer_channels: 0,
            last_src_frames: 0,
            channels: [DelayDynamicChannel::default(); MAX_CHANNELS],
            meters_input: Meters::default(),
            meters_output: Meters::default(),
        }
    }

    fn kernel(&self, rate: f32) -> &Kernel {
        match &self.config.kernel {
            Some(kernel) => kernel,
            None => default_lanczos(radius_for_rate(rate, DESIRED_KERNEL_RADIUS)),
        }
    }

    /// Delay bound in whole samples, excluding the kernel margin.
    fn delay_samples_max(&self, samplerate: u32) -> usize {
        ms_to_samples(self.config.delay_max_ms, samplerate as f32).ceil() as usize
    }

    fn handle_resizes(&mut self, samplerate: u32, frames: usize, channel_count: usize) -> Result<()> {
        let kernel_samples = self.kernel(1.0).length();
        let ring = self.delay_samples_max(samplerate) + kernel_samples;
        let needed = ring + frames;
        if self.per_channel_cap >= needed && self.buffer_channels == channel_count {
            return Ok(());
        }
        let new_cap = needed.next_multiple_of(256);
        let mut new_buffer = vec![0.0f32; new_cap * channel_count];
        if self.per_channel_cap > 0 && self.buffer_channels == channel_count {
            // Existing history lands at the end of each new plane so the
            // "now" point stays put relative to the ring's tail.
            for c in 0..channel_count {
                let old_plane = &self.buffer[c * self.per_channel_cap..][..self.per_channel_cap];
                new_buffer[c * new_cap + new_cap - self.per_channel_cap..][..self.per_channel_cap]
                    .copy_from_slice(old_plane);
            }
        }
        if self.buffer_channels != channel_count {
            // Fresh planes; nothing from the previous block carries over.
            self.last_src_frames = 0;
        }
        self.buffer = new_buffer;
        self.per_channel_cap = new_cap;
        self.buffer_channels = channel_count;
        Ok(())
    }

    /// Slides the ring left by the last block and appends the new input at
    /// the "now" point.
    fn prime_buffer(&mut self, wet: &mf_core::BufferRef, samplerate: u32) {
        let kernel_samples = self.kernel(1.0).length();
        let ring = self.delay_samples_max(samplerate) + kernel_samples;
        for c in 0..wet.channels() {
            let plane = &mut self.buffer[c * self.per_channel_cap..][..self.per_channel_cap];
            if self.last_src_frames > 0 {
                plane.copy_within(self.last_src_frames..self.last_src_frames + ring, 0);
            }
            for i in 0..wet.frames() {
                plane[ring + i] = wet.sample(i, c);
            }
        }
        self.last_src_frames = wet.frames();
    }

    /// Start/end read positions and rate for one channel over this block.
    /// Returns `None` when the rate is too low to sample affordably.
    fn channel_ramp(
        &mut self,
        c: usize,
        frames: usize,
        samplerate: u32,
        advance: bool,
    ) -> Option<(f32, f32, f32, f32)> {
        let delay_max = self.config.delay_max_ms;
        let dsm = self.delay_samples_max(samplerate) as f32;
        let follow_samples = ms_to_samples(self.config.delay_follow_time_ms, samplerate as f32);
        let delta_t = frames as f32 / follow_samples.max(1.0);
        let follower_backup = self.channels[c].delay_ms;
        let state = &mut self.channels[c];
        state.delay_ms.set_target(self.config.channels[c].delay_ms);
        let delay_start = state.delay_ms.update(delta_t).clamp(0.0, delay_max);
        let delay_end = state.delay_ms.value().clamp(0.0, delay_max);
        let start_index = dsm - ms_to_samples(delay_start, samplerate as f32);
        let end_index = dsm - ms_to_samples(delay_end, samplerate as f32) + frames as f32;
        let end_rate = ((end_index - start_index) / frames as f32).min(1.0);
        if !advance {
            self.channels[c].delay_ms = follower_backup;
        }
        if end_rate <= MIN_RATE {
            return None;
        }
        let state = &mut self.channels[c];
        let start_rate = if state.rate_previous != 0.0 { state.rate_previous } else { end_rate };
        if advance {
            state.rate_previous = end_rate;
        }
        Some((start_index, end_index, start_rate, end_rate))
    }
}

impl Plugin for DelayDynamic {
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
        let channel_count = buffer.channels();
        let frames = buffer.frames();
        let samplerate = buffer.samplerate;
        self.handle_resizes(samplerate, frames, channel_count)?;
        if let Some((first, count)) = self.header.track_channels(channel_count) {
            self.reset_channels(first, count);
        }
        if self.header.observed {
            self.meters_input.update(&buffer.as_ref(), 1.0);
        }
        let kernel_left = self.kernel(1.0).sample_zero() as i64;
        let dsm = self.delay_samples_max(samplerate);
        let sample_extent = (dsm + self.kernel(1.0).length() + frames) as i64;
        let mut wet = push_scratch_copy(&buffer.as_ref());
        if self.config.feedback != 0.0 {
            // Prime the wet signal with feedback read at the (not yet
            // advanced) delay ramp.
            let mut wet_view = wet.as_mut();
            for c in 0..channel_count {
                let Some((start_index, end_index, start_rate, end_rate)) =
                    self.channel_ramp(c, frames, samplerate, false)
                else {
                    continue;
                };
                let kernel = self.kernel(start_rate);
                let next = (c + 1) % channel_count;
                let feedback = self.config.feedback;
                let pingpong = self.config.pingpong;
                let plane = &self.buffer[c * self.per_channel_cap..][..self.per_channel_cap];
                for i in 0..frames {
                    let t = i as f32 / frames as f32;
                    let rate = lerp(start_rate, end_rate, t);
                    let index = lerp(start_index, end_index, t);
                    let frame = index.trunc() as i64;
                    let fraction = index - frame as f32;
                    let to_add = sample_with_kernel_1ch(
                        kernel,
                        plane,
                        1,
                        0,
                        sample_extent,
                        false,
                        frame + kernel_left,
                        fraction,
                        rate,
                    ) * feedback;
                    wet_view.add_sample(i, c, to_add * (1.0 - pingpong));
                    wet_view.add_sample(i, next, to_add * pingpong);
                }
            }
        }
        if !self.input_effects.is_empty() {
            self.input_effects.process(&mut wet.as_mut(), flags)?;
        }
        self.prime_buffer(&wet.as_ref(), samplerate);
        let amount_wet = if self.config.mute_wet { 0.0 } else { db_to_amp(self.config.gain_wet) };
        let amount_dry = if self.config.mute_dry { 0.0 } else { db_to_amp(self.config.gain_dry) };
        for c in 0..channel_count {
            let Some((start_index, end_index, start_rate, end_rate)) =
                self.channel_ramp(c, frames, samplerate, true)
            else {
                let mut silent = buffer.one_channel(c);
                silent.zero();
                continue;
            };
            let kernel = self.kernel(start_rate);
            let plane = &self.buffer[c * self.per_channel_cap..][..self.per_channel_cap];
            for i in 0..frames {
                let t = i as f32 / frames as f32;
                let rate = lerp(start_rate, end_rate, t);
                let index = lerp(start_index, end_index, t);
                let frame = index.trunc() as i64;
                let fraction = index - frame as f32;
                let delayed = sample_with_kernel_1ch(
                    kernel,
                    plane,
                    1,
                    0,
                    sample_extent,
                    false,
                    frame + kernel_left,
                    fraction,
                    rate,
                );
                let dry = buffer.sample(i, c);
                buffer.set_sample(i, c, delayed * amount_wet + dry * amount_dry);
            }
        }
        drop(wet);
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn get_specs(&self, _samplerate: u32) -> PluginSpecs {
        let kernel = self.kernel(1.0);
        PluginSpecs {
            latency_frames: 0,
            leading_frames: kernel.sample_zero() as u32 - 1,
            trailing_frames: (kernel.length() - kernel.sample_zero()) as u32,
        }
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.last_src_frames = 0;
        for state in &mut self.channels {
            let target = state.delay_ms.target();
            state.delay_ms.jump(target);
            state.rate_previous = 0.0;
        }
        self.input_effects.reset();
        self.meters_input.reset();
        self.meters_output.reset();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        self.meters_input.reset_channels(first, count);
        self.meters_output.reset_channels(first, count);
        for c in first..(first + count).min(MAX_CHANNELS) {
            if self.per_channel_cap > 0 && c < self.buffer_channels {
                self.buffer[c * self.per_channel_cap..][..self.per_channel_cap].fill(0.0);
            }
            self.channels[c].rate_previous = 0.0;
        }
    }
}

/// Sets up per-channel delay ramps spanning exactly one block, jumping the
/// followers to `start` and targeting `end`. The spatializer uses this to
/// hand the delay its per-ear path lengths.
pub fn set_delay_ramps(
    delay: &mut DelayDynamic,
    channel_count: usize,
    start_delay_ms: &[f32],
    end_delay_ms: &[f32],
    frames: usize,
    samplerate: u32,
) {
    delay.config.delay_follow_time_ms =
        mf_core::math::samples_to_ms(frames as f32, samplerate as f32);
    for c in 0..channel_count.min(MAX_CHANNELS) {
        delay.channels[c].delay_ms.jump(start_delay_ms[c]);
        delay.config.channels[c].delay_ms = end_delay_ms[c];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::{Buffer, ChannelLayout};

    fn constant_delay(delay_ms: f32) -> DelayDynamic {
        let mut config = DelayDynamicConfig {
            gain_wet: 0.0,
            gain_dry: f32::NEG_INFINITY,
            delay_max_ms: 100.0,
            delay_follow_time_ms: 1.0,
            feedback: 0.0,
            pingpong: 0.0,
            ..Default::default()
        };
        for channel in &mut config.channels {
            channel.delay_ms = delay_ms;
        }
        let mut delay = DelayDynamic::new(config);
        for state in &mut delay.channels {
            state.delay_ms.jump(delay_ms);
        }
        delay
    }

    #[test]
    fn constant_delay_reproduces_input_shifted() {
        let samplerate = 48000u32;
        let delay_ms = 10.0;
        let mut delay = constant_delay(delay_ms);
        let frames = 512;
        // 480 samples of configured delay plus the kernel's radius (the
        // sampling window is centered that far behind the newest sample).
        let shift = 480 + 13;
        let mut produced = Vec::new();
        let mut input = Vec::new();
        for block in 0..4 {
            let samples: Vec<f32> = (0..frames)
                .map(|i| ((block * frames + i) as f32 * 0.013).sin() * 0.8)
                .collect();
            input.extend_from_slice(&samples);
            let mut buffer =
                Buffer::from_samples(samples, ChannelLayout::mono(), samplerate).unwrap();
            delay.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
            for i in 0..frames {
                produced.push(buffer.as_ref().sample(i, 0));
            }
        }
        // After the first block settles, output is input delayed by 480
        // samples to within the kernel's passband error.
        for i in frames + shift..produced.len() {
            let expected = input[i - shift];
            assert!(
                (produced[i] - expected).abs() < 2e-3,
                "sample {i}: got {} expected {expected}",
                produced[i]
            );
        }
    }

    #[test]
    fn shrinking_delay_pitches_up_without_blowup() {
        let samplerate = 48000u32;
        let mut delay = constant_delay(50.0);
        let frames = 256;
        // Retarget to a much shorter delay and let the follower ramp.
        for channel in &mut delay.config.channels {
            channel.delay_ms = 5.0;
        }
        delay.config.delay_follow_time_ms = 100.0;
        for block in 0..20 {
            let samples: Vec<f32> = (0..frames)
                .map(|i| ((block * frames + i) as f32 * 0.02).sin() * 0.5)
                .collect();
            let mut buffer =
                Buffer::from_samples(samples, ChannelLayout::mono(), samplerate).unwrap();
            delay.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
            for i in 0..frames {
                let sample = buffer.as_ref().sample(i, 0);
                assert!(sample.is_finite() && sample.abs() < 2.0, "block {block} sample {i}");
            }
        }
        // The follower settled on the new target.
        assert!((delay.channels[0].delay_ms.value() - 5.0).abs() < 1e-3);
    }

    #[test]
    fn cut_silences_history() {
        let samplerate = 48000u32;
        let mut delay = constant_delay(2.0);
        let mut loud =
            Buffer::from_samples(vec![0.9f32; 512], ChannelLayout::mono(), samplerate).unwrap();
        delay.process(&mut loud.as_mut(), ProcessFlags::NONE).unwrap();
        let mut silent = Buffer::new(512, 0, 0, ChannelLayout::mono(), samplerate).unwrap();
        delay.process(&mut silent.as_mut(), ProcessFlags::CUT).unwrap();
        for i in 0..512 {
            assert_eq!(silent.as_ref().sample(i, 0), 0.0, "sample {i}");
        }
    }

    #[test]
    fn reports_kernel_guard_requirements() {
        let delay = DelayDynamic::new(DelayDynamicConfig::default());
        let specs = delay.get_specs(48000);
        let kernel = default_lanczos(DESIRED_KERNEL_RADIUS);
        assert_eq!(specs.leading_frames as usize, kernel.sample_zero() - 1);
        assert_eq!(
            specs.trailing_frames as usize,
            kernel.length() - kernel.sample_zero()
        );
    }
}
