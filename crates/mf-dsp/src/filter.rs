//! Multi-pole one-pole filter (low-pass, high-pass, band-pass).

use mf_core::math::{TAU, db_to_amp};
use mf_core::{BufferMut, MAX_CHANNELS, Result};

use crate::{Meters, Plugin, PluginHeader, ProcessFlags};

pub const FILTER_MAX_POLES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    HighPass,
    #[default]
    LowPass,
    /// Serial low-pass then high-pass per pole, with a x2 gain correction
    /// for the -3dB-at-cutoff each stage costs.
    BandPass,
}

#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    pub kind: FilterKind,
    /// Pole count, 1..=8 (6 dB/octave per pole).
    pub poles: usize,
    /// Cutoff in Hz.
    pub frequency: f32,
    /// 0 is fully wet, 1 fully dry.
    pub dry_mix: f32,
    /// Wet gain in dB.
    pub gain_wet: f32,
    /// Per-channel cutoff overrides; 0 falls back to `frequency`.
    pub channel_frequency_override: [f32; MAX_CHANNELS],
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            kind: FilterKind::LowPass,
            poles: 2,
            frequency: 500.0,
            dry_mix: 0.0,
            gain_wet: 0.0,
            channel_frequency_override: [0.0; MAX_CHANNELS],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FilterChannel {
    /// One-pole accumulators; band-pass uses two per pole.
    outputs: [f32; 2 * FILTER_MAX_POLES],
}

pub struct Filter {
    header: PluginHeader,
    pub config: FilterConfig,
    channels: [FilterChannel; MAX_CHANNELS],
    pub meters_input: Meters,
    pub meters_output: Meters,
}

impl Filter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            header: PluginHeader::new("Filter"),
            config,
            channels: [FilterChannel::default(); MAX_CHANNELS],
            meters_input: Meters::default(),
            meters_output: Meters::default(),
        }
    }
}

impl Plugin for Filter {
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
        if self.header.observed {
            self.meters_input.update(&buffer.as_ref(), 1.0);
        }
        let amount_wet = (1.0 - self.config.dry_mix).clamp(0.0, 1.0) * db_to_amp(self.config.gain_wet);
        let amount_dry = self.config.dry_mix.clamp(0.0, 1.0);
        let poles = self.config.poles.clamp(1, FILTER_MAX_POLES);
        let samplerate = buffer.samplerate as f32;
        for c in 0..buffer.channels() {
            let state = &mut self.channels[c];
            let frequency_override = self.config.channel_frequency_override[c];
            let frequency =
                if frequency_override != 0.0 { frequency_override } else { self.config.frequency };
            let decay = (-TAU * (frequency / samplerate)).exp().clamp(0.0, 1.0);
            match self.config.kind {
                FilterKind::HighPass => {
                    for i in 0..buffer.frames() {
                        let input = buffer.sample(i, c);
                        let mut sample = input;
                        for pole in 0..poles {
                            state.outputs[pole] = sample + decay * (state.outputs[pole] - sample);
                            sample -= state.outputs[pole];
                        }
                        buffer.set_sample(i, c, sample * amount_wet + input * amount_dry);
                    }
                }
                FilterKind::LowPass => {
                    for i in 0..buffer.frames() {
                        let input = buffer.sample(i, c);
                        state.outputs[0] = input + decay * (state.outputs[0] - input);
                        for pole in 1..poles {
                            state.outputs[pole] = state.outputs[pole - 1]
                                + decay * (state.outputs[pole] - state.outputs[pole - 1]);
                        }
                        buffer
                            .set_sample(i, c, state.outputs[poles - 1] * amount_wet + input * amount_dry);
                    }
                }
                FilterKind::BandPass => {
                    for i in 0..buffer.frames() {
                        let input = buffer.sample(i, c);
                        let mut sample = input;
                        for pole in 0..poles {
                            // Low pass.
                            state.outputs[2 * pole] = sample + decay * (state.outputs[2 * pole] - sample);
                            sample = state.outputs[2 * pole];
                            // High pass.
                            state.outputs[2 * pole + 1] =
                                sample + decay * (state.outputs[2 * pole + 1] - sample);
                            sample -= state.outputs[2 * pole + 1];
                            sample *= 2.0;
                        }
                        buffer.set_sample(i, c, sample * amount_wet + input * amount_dry);
                    }
                }
            }
        }
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.meters_input.reset();
        self.meters_output.reset();
        self.channels = [FilterChannel::default(); MAX_CHANNELS];
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        self.meters_input.reset_channels(first, count);
        self.meters_output.reset_channels(first, count);
        for c in first..(first + count).min(MAX_CHANNELS) {
            self.channels[c] = FilterChannel::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::{Buffer, ChannelLayout};

    fn sine(frequency: f32, frames: usize, samplerate: f32) -> Buffer {
        let samples: Vec<f32> = (0..frames)
            .map(|i| (i as f32 * frequency * std::f32::consts::TAU / samplerate).sin())
            .collect();
        Buffer::from_samples(samples, ChannelLayout::mono(), samplerate as u32).unwrap()
    }

    fn peak(buffer: &Buffer, skip: usize) -> f32 {
        let view = buffer.as_ref();
        (skip..view.frames()).map(|i| view.sample(i, 0).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn low_pass_attenuates_high_frequencies() {
        let mut filter = Filter::new(FilterConfig {
            kind: FilterKind::LowPass,
            poles: 4,
            frequency: 200.0,
            ..Default::default()
        });
        let mut high = sine(8000.0, 4096, 48000.0);
        filter.process(&mut high.as_mut(), ProcessFlags::NONE).unwrap();
        assert!(peak(&high, 1024) < 0.05, "high band leaked: {}", peak(&high, 1024));

        filter.reset();
        let mut low = sine(50.0, 4096, 48000.0);
        filter.process(&mut low.as_mut(), ProcessFlags::NONE).unwrap();
        assert!(peak(&low, 1024) > 0.7, "low band lost: {}", peak(&low, 1024));
    }

    #[test]
    fn high_pass_attenuates_low_frequencies() {
        let mut filter = Filter::new(FilterConfig {
            kind: FilterKind::HighPass,
            poles: 2,
            frequency: 2000.0,
            ..Default::default()
        });
        let mut low = sine(50.0, 4096, 48000.0);
        filter.process(&mut low.as_mut(), ProcessFlags::NONE).unwrap();
        assert!(peak(&low, 1024) < 0.1, "low band leaked: {}", peak(&low, 1024));
    }

    #[test]
    fn per_channel_override_wins() {
        let mut config = FilterConfig {
            kind: FilterKind::LowPass,
            poles: 4,
            frequency: 20000.0,
            ..Default::default()
        };
        // Channel 1 gets a much lower cutoff than the global one.
        config.channel_frequency_override[1] = 100.0;
        let mut filter = Filter::new(config);
        let frames = 4096;
        let mut samples = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let s = (i as f32 * 8000.0 * std::f32::consts::TAU / 48000.0).sin();
            samples.push(s);
            samples.push(s);
        }
        let mut buffer =
            Buffer::from_samples(samples, ChannelLayout::stereo(), 48000).unwrap();
        filter.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        let view = buffer.as_ref();
        let peak_left = (1024..frames).map(|i| view.sample(i, 0).abs()).fold(0.0, f32::max);
        let peak_right = (1024..frames).map(|i| view.sample(i, 1).abs()).fold(0.0, f32::max);
        assert!(peak_right < peak_left * 0.2, "override had no effect: {peak_left} vs {peak_right}");
    }

    #[test]
    fn dry_mix_passes_signal_through() {
        let mut filter = Filter::new(FilterConfig {
            kind: FilterKind::LowPass,
            poles: 8,
            frequency: 10.0,
            dry_mix: 1.0,
            ..Default::default()
        });
        let mut buffer = sine(8000.0, 256, 48000.0);
        let original = buffer.as_ref().raw().to_vec();
        filter.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        for (a, b) in buffer.as_ref().raw().iter().zip(&original) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
