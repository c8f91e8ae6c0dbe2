//! Static delays: the per-channel feedback delay and a frame-aligned
//! sample delay used for latency compensation.

use mf_core::math::{db_to_amp, ms_to_samples};
use mf_core::{Buffer, BufferMut, BufferRef, ChannelLayout, MAX_CHANNELS, Result, push_scratch_copy, push_scratch_zero};

use crate::chain::DspChain;
use crate::{Meters, Plugin, PluginHeader, ProcessFlags, check_buffers};

#[derive(Debug, Clone, Copy, Default)]
pub struct DelayChannelConfig {
    /// Extra delay for this channel on top of the main delay, in ms.
    pub delay_ms: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct DelayConfig {
    /// Wet gain in dB.
    pub gain_wet: f32,
    /// Dry gain in dB.
    pub gain_dry: f32,
    pub mute_wet: bool,
    pub mute_dry: bool,
    pub delay_ms: f32,
    /// Fraction of the delayed signal fed back into the line.
    pub feedback: f32,
    /// 0 keeps the wet signal on its own channel, 1 sends it all to the
    /// next channel.
    pub pingpong: f32,
    pub channels: [DelayChannelConfig; MAX_CHANNELS],
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            gain_wet: -6.0,
            gain_dry: 0.0,
            mute_wet: false,
            mute_dry: false,
            delay_ms: 300.0,
            feedback: 0.5,
            pingpong: 0.0,
            channels: [DelayChannelConfig::default(); MAX_CHANNELS],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DelayChannel {
    delay_samples: usize,
    index: usize,
}

/// Per-channel circular delay with feedback, ping-pong crossfeed, and an
/// optional effect chain on the wet path.
pub struct Delay {
    header: PluginHeader,
    pub config: DelayConfig,
    /// Effects applied to the wet signal before it enters the line.
    pub input_effects: DspChain,
    /// One `per_channel_cap` plane per channel.
    buffer: Vec<f32>,
    per_channel_cap: usize,
    channels: [DelayChannel; MAX_CHANNELS],
    pub meters_input: Meters,
    pub meters_output: Meters,
}

impl Delay {
    pub fn new(config: DelayConfig) -> Self {
        Self {
            header: PluginHeader::new("Delay"),
            config,
            input_effects: DspChain::new(),
            buffer: Vec::new(),
            per_channel_cap: 0,
            channels: [DelayChannel::default(); MAX_CHANNELS],
            meters_input: Meters::default(),
            meters_output: Meters::default(),
        }
    }

    /// Applies the configured delay times, resizing the ring if any channel
    /// outgrew it. Content is preserved: growing a channel's delay leaves
    /// the new region silent until written; shrinking brings the read
    /// pointer forward.
    fn handle_resizes(&mut self, samplerate: u32, channel_count: usize) -> Result<()> {
        let mut delay_samples_max = 0;
        let mut needs_realloc = false;
        for c in 0..channel_count {
            let delay_ms = self.config.delay_ms + self.config.channels[c].delay_ms;
            let delay_samples =
                (ms_to_samples(delay_ms, samplerate as f32).round() as usize).max(1);
            delay_samples_max = delay_samples_max.max(delay_samples);
            let state = &mut self.channels[c];
            if state.delay_samples >= delay_samples {
                if state.index > delay_samples {
                    state.index = 0;
                }
                state.delay_samples = delay_samples;
            } else if self.per_channel_cap >= delay_samples {
                state.delay_samples = delay_samples;
            } else {
                needs_realloc = true;
            }
        }
        if !needs_realloc {
            return Ok(());
        }
        let new_cap = grow(self.per_channel_cap, delay_samples_max, 256);
        let mut new_buffer = vec![0.0f32; new_cap * channel_count];
        for c in 0..channel_count {
            let state = &mut self.channels[c];
            if self.per_channel_cap > 0 && state.delay_samples > 0 {
                let old_plane = &self.buffer[c * self.per_channel_cap..][..state.delay_samples];
                new_buffer[c * new_cap..][..state.delay_samples].copy_from_slice(old_plane);
            }
            let delay_ms = self.config.delay_ms + self.config.channels[c].delay_ms;
            state.delay_samples =
                (ms_to_samples(delay_ms, samplerate as f32).round() as usize).max(1);
        }
        self.buffer = new_buffer;
        self.per_channel_cap = new_cap;
        Ok(())
    }
}

/// Grows `size` by 3/2 steps (aligned) until it covers `min_size`.
fn grow(size: usize, min_size: usize, alignment: usize) -> usize {
    let mut size = size.max(alignment);
    while size < min_size {
        size = (size * 3 / 2).next_multiple_of(alignment);
    }
    size
}

impl Plugin for Delay {
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
        self.handle_resizes(buffer.samplerate, channel_count)?;
        if let Some((first, count)) = self.header.track_channels(channel_count) {
            self.reset_channels(first, count);
        }
        if self.header.observed {
            self.meters_input.update(&buffer.as_ref(), 1.0);
        }
        let mut wet = push_scratch_zero(buffer.frames(), 0, 0, channel_count, buffer.samplerate);
        {
            // Accumulate input plus feedback into the wet buffer, split
            // between this channel and the next by the ping-pong amount.
            let mut wet_view = wet.as_mut();
            for c in 0..channel_count {
                let state = self.channels[c];
                let plane = &self.buffer[c * self.per_channel_cap..][..state.delay_samples];
                let next = (c + 1) % channel_count;
                let mut index = state.index;
                for i in 0..buffer.frames() {
                    let to_add = buffer.sample(i, c) + plane[index] * self.config.feedback;
                    wet_view.add_sample(i, c, to_add * (1.0 - self.config.pingpong));
                    wet_view.add_sample(i, next, to_add * self.config.pingpong);
                    index = (index + 1) % state.delay_samples;
                }
            }
            if !self.input_effects.is_empty() {
                self.input_effects.process(&mut wet_view, flags)?;
            }
        }
        let amount_wet = if self.config.mute_wet { 0.0 } else { db_to_amp(self.config.gain_wet) };
        let amount_dry = if self.config.mute_dry { 0.0 } else { db_to_amp(self.config.gain_dry) };
        let wet_view = wet.as_ref();
        for c in 0..channel_count {
            let state = &mut self.channels[c];
            let plane = &mut self.buffer[c * self.per_channel_cap..][..state.delay_samples];
            let mut index = state.index;
            for i in 0..buffer.frames() {
                let delayed = plane[index];
                plane[index] = wet_view.sample(i, c);
                index = (index + 1) % state.delay_samples;
                let dry = buffer.sample(i, c);
                buffer.set_sample(i, c, delayed * amount_wet + dry * amount_dry);
            }
            state.index = index;
        }
        drop(wet);
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        for state in &mut self.channels {
            state.index = 0;
        }
        self.input_effects.reset();
        self.meters_input.reset();
        self.meters_output.reset();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        self.meters_input.reset_channels(first, count);
        self.meters_output.reset_channels(first, count);
        for c in first..(first + count).min(MAX_CHANNELS) {
            if self.per_channel_cap > 0 {
                self.buffer[c * self.per_channel_cap..][..self.per_channel_cap].fill(0.0);
            }
            self.channels[c].index = 0;
        }
    }
}

/// Delays audio by a whole number of frames by carrying blocks through an
/// internal buffer. Used for plugin delay compensation; zero delay is a
/// plain copy.
pub struct SampleDelay {
    header: PluginHeader,
    pub delay_frames: usize,
    buffer: Buffer,
}

impl SampleDelay {
    pub fn new(delay_frames: usize) -> Self {
        Self {
            header: PluginHeader::new("Sample Delay"),
            delay_frames,
            buffer: Buffer::default(),
        }
    }

    fn ensure_buffer(&mut self, layout: ChannelLayout, samplerate: u32) -> Result<()> {
        if self.buffer.frames() != self.delay_frames || self.buffer.channels() != layout.count() {
            self.buffer = Buffer::new(self.delay_frames, 0, 0, layout, samplerate)?;
        }
        Ok(())
    }
}

impl Plugin for SampleDelay {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut PluginHeader {
        &mut self.header
    }

    fn process(&mut self, buffer: &mut BufferMut, flags: ProcessFlags) -> Result<()> {
        if self.delay_frames == 0 {
            return Ok(());
        }
        let src = push_scratch_copy(&buffer.as_ref());
        self.process_dual(buffer, &src.as_ref(), flags)
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
        check_buffers(dst, src, true, true)?;
        if self.delay_frames == 0 {
            dst.copy_from(src);
            return Ok(());
        }
        self.ensure_buffer(*dst.layout(), dst.samplerate)?;
        // The carry buffer holds the last `delay` input frames in
        // chronological order, oldest first.
        let delay = self.buffer.frames();
        let frames = dst.frames();
        if frames >= delay {
            let body = frames - delay;
            {
                let held = self.buffer.as_ref();
                let held_all = held.slice(0, delay);
                dst.slice(0, delay).copy_from(&held_all);
            }
            if body > 0 {
                dst.slice(delay, body).copy_from(&src.slice(0, body));
            }
            self.buffer.as_mut().copy_from(&src.slice(body, delay));
        } else {
            {
                let held = self.buffer.as_ref();
                let held_head = held.slice(0, frames);
                dst.slice(0, frames).copy_from(&held_head);
            }
            let stride = self.buffer.channels();
            self.buffer.samples_mut().copy_within(frames * stride.., 0);
            self.buffer.as_mut().slice(delay - frames, frames).copy_from(&src.slice(0, frames));
        }
        Ok(())
    }

    fn get_specs(&self, _samplerate: u32) -> crate::PluginSpecs {
        crate::PluginSpecs { latency_frames: self.delay_frames as u32, ..Default::default() }
    }

    fn reset(&mut self) {
        self.buffer.zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::{Buffer, ChannelLayout};

    #[test]
    fn delay_shifts_by_exact_sample_count() {
        // 10 ms at 48 kHz is 480 samples; with no feedback the output is
        // the input shifted by exactly that, zeros filling the head.
        let mut delay = Delay::new(DelayConfig {
            gain_wet: 0.0,
            gain_dry: f32::NEG_INFINITY,
            delay_ms: 10.0,
            feedback: 0.0,
            pingpong: 0.0,
            ..Default::default()
        });
        let frames = 2000;
        let samples: Vec<f32> = (0..frames).map(|i| ((i * 13) % 97) as f32 / 97.0).collect();
        let mut buffer =
            Buffer::from_samples(samples.clone(), ChannelLayout::mono(), 48000).unwrap();
        delay.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        let view = buffer.as_ref();
        let shift = 480;
        for i in 0..shift {
            assert_eq!(view.sample(i, 0), 0.0, "head sample {i} not silent");
        }
        for i in shift..frames {
            assert_eq!(view.sample(i, 0), samples[i - shift], "sample {i} mismatched");
        }
    }

    #[test]
    fn pingpong_routes_wet_to_next_channel() {
        let mut delay = Delay::new(DelayConfig {
            gain_wet: 0.0,
            gain_dry: f32::NEG_INFINITY,
            delay_ms: 1.0,
            feedback: 0.0,
            pingpong: 1.0,
            ..Default::default()
        });
        let frames = 200;
        // Impulse on the left only.
        let mut samples = vec![0.0f32; frames * 2];
        samples[0] = 1.0;
        let mut buffer =
            Buffer::from_samples(samples, ChannelLayout::stereo(), 48000).unwrap();
        delay.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        let view = buffer.as_ref();
        let shift = 48;
        assert_eq!(view.sample(shift, 0), 0.0);
        assert_eq!(view.sample(shift, 1), 1.0);
    }

    #[test]
    fn cut_clears_the_line() {
        let mut delay = Delay::new(DelayConfig {
            gain_wet: 0.0,
            gain_dry: f32::NEG_INFINITY,
            delay_ms: 1.0,
            feedback: 0.9,
            ..Default::default()
        });
        let mut loud =
            Buffer::from_samples(vec![1.0f32; 256], ChannelLayout::mono(), 48000).unwrap();
        delay.process(&mut loud.as_mut(), ProcessFlags::NONE).unwrap();
        let mut silent = Buffer::new(256, 0, 0, ChannelLayout::mono(), 48000).unwrap();
        delay.process(&mut silent.as_mut(), ProcessFlags::CUT).unwrap();
        for i in 0..256 {
            assert_eq!(silent.as_ref().sample(i, 0), 0.0);
        }
    }

    #[test]
    fn sample_delay_carries_across_blocks() {
        let mut delay = SampleDelay::new(100);
        let frames = 64;
        let mut output = Vec::new();
        let mut counter = 0;
        for _ in 0..5 {
            let samples: Vec<f32> = (0..frames)
                .map(|_| {
                    counter += 1;
                    counter as f32
                })
                .collect();
            let mut buffer =
                Buffer::from_samples(samples, ChannelLayout::mono(), 48000).unwrap();
            delay.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
            for i in 0..frames {
                output.push(buffer.as_ref().sample(i, 0));
            }
        }
        // First 100 samples are the (initially zero) carry buffer.
        for (i, &sample) in output.iter().enumerate().take(100) {
            assert_eq!(sample, 0.0, "sample {i}");
        }
        for (i, &sample) in output.iter().enumerate().skip(100) {
            assert_eq!(sample, (i - 100 + 1) as f32, "sample {i}");
        }
    }

    #[test]
    fn zero_sample_delay_is_identity() {
        let mut delay = SampleDelay::new(0);
        let samples: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let mut buffer =
            Buffer::from_samples(samples.clone(), ChannelLayout::mono(), 48000).unwrap();
        delay.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        for i in 0..32 {
            assert_eq!(buffer.as_ref().sample(i, 0), samples[i]);
        }
    }
}
