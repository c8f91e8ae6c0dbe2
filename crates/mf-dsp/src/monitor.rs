//! Spectrum monitor: windowed FFT magnitudes for display.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use mf_core::math::{WINDOW_BLACKMAN_HARRIS_INTEGRAL, window_blackman_harris};
use mf_core::{BufferMut, Error, Result};

use crate::{Plugin, PluginHeader, ProcessFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpectrumMode {
    /// Analyze one chosen channel.
    OneChannel,
    /// Average the spectra of all channels.
    #[default]
    AvgChannels,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSpectrumConfig {
    pub mode: SpectrumMode,
    /// Which channel `OneChannel` looks at.
    pub channel_chosen: usize,
    /// Advance a full window per transform instead of half (no overlap).
    pub full_window_progression: bool,
    /// Transform size in frames; must be a power of two.
    pub window: usize,
    /// How many past spectra the smoothing averages over.
    pub smoothing: u32,
    /// Display floor in dB.
    pub floor: f32,
    /// Display ceiling in dB.
    pub ceiling: f32,
}

impl Default for MonitorSpectrumConfig {
    fn default() -> Self {
        Self {
            mode: SpectrumMode::AvgChannels,
            channel_chosen: 0,
            full_window_progression: false,
            window: 1024,
            smoothing: 1,
            floor: -96.0,
            ceiling: 12.0,
        }
    }
}

/// Accumulates input frames into a window, transforms, and exponentially
/// smooths magnitude/phase pairs for the lower `window/2 + 1` bins.
/// Passes audio through untouched.
pub struct MonitorSpectrum {
    header: PluginHeader,
    pub config: MonitorSpectrumConfig,
    pub samplerate: u32,
    input: Vec<f32>,
    input_used: usize,
    input_channels: usize,
    /// Magnitudes in the first `window` floats, phases in the second.
    output: Vec<f32>,
    num_counted: u32,
    fft: Option<Arc<dyn Fft<f32>>>,
    scratch: Vec<Complex<f32>>,
}

impl MonitorSpectrum {
    pub fn new(config: MonitorSpectrumConfig) -> Self {
        Self {
            header: PluginHeader::new("Spectrum Monitor"),
            config,
            samplerate: 0,
            input: Vec::new(),
            input_used: 0,
            input_channels: 0,
            output: Vec::new(),
            num_counted: 0,
            fft: None,
            scratch: Vec::new(),
        }
    }

    /// Magnitudes for bins `0..window/2 + 1`.
    pub fn magnitudes(&self) -> &[f32] {
        let bins = (self.config.window >> 1) + 1;
        &self.output[..bins.min(self.output.len())]
    }

    /// Phases for bins `0..window/2 + 1`.
    pub fn phases(&self) -> &[f32] {
        let bins = (self.config.window >> 1) + 1;
        if self.output.len() < self.config.window + bins {
            return &[];
        }
        &self.output[self.config.window..self.config.window + bins]
    }

    fn handle_resizes(&mut self, channels: usize) -> Result<()> {
        if !self.config.window.is_power_of_two() || self.config.window < 2 {
            log::error!("spectrum window {} must be a power of two", self.config.window);
            return Err(Error::InvalidConfiguration);
        }
        let required_input = self.config.window * channels;
        if self.input.len() < required_input {
            self.input.resize(required_input, 0.0);
            self.input_used = 0;
        }
        if self.input_channels != channels {
            self.input_channels = channels;
            self.input_used = 0;
        }
        let required_output = self.config.window * 2;
        if self.output.len() < required_output {
            self.output = vec![0.0; required_output];
            self.num_counted = 0;
        }
        let needs_plan =
            self.fft.as_ref().map(|fft| fft.len() != self.config.window).unwrap_or(true);
        if needs_plan {
            let mut planner = FftPlanner::new();
            self.fft = Some(planner.plan_fft_forward(self.config.window));
            self.scratch = vec![Complex::new(0.0, 0.0); self.config.window];
        }
        Ok(())
    }

    /// Copies frames from the block into the accumulation window; returns
    /// how many were used.
    fn prime(&mut self, buffer: &BufferMut, offset: usize) -> usize {
        let used = (self.config.window - self.input_used).min(buffer.frames() - offset);
        let channels = self.input_channels;
        for i in 0..used {
            for c in 0..channels {
                self.input[(self.input_used + i) * channels + c] =
                    buffer.sample(offset + i, c);
            }
        }
        self.input_used += used;
        used
    }

    /// Transforms one channel of the accumulated window and folds it into
    /// the smoothed output.
    fn analyze_channel(&mut self, channel: usize) {
        let window = self.config.window;
        let channels = self.input_channels;
        let window_f = window as f32;
        for i in 0..window {
            let t = i as f32 / window_f;
            let mul = window_blackman_harris(t) / WINDOW_BLACKMAN_HARRIS_INTEGRAL;
            self.scratch[i] = Complex::new(self.input[i * channels + channel] * mul, 0.0);
        }
        let fft = self.fft.as_ref().expect("planned in handle_resizes").clone();
        fft.process(&mut self.scratch);
        let bins = (window >> 1) + 1;
        let mix = 1.0 / (1.0 + self.num_counted as f32);
        for (i, value) in self.scratch[..bins].iter().enumerate() {
            let magnitude = (value.re * value.re + value.im * value.im).sqrt() / bins as f32;
            let phase = value.im.atan2(value.re);
            self.output[i] += (magnitude - self.output[i]) * mix;
            self.output[window + i] += (phase - self.output[window + i]) * mix;
        }
        self.num_counted = (self.num_counted + 1).min(self.config.smoothing);
    }

    fn advance_window(&mut self) {
        let channels = self.input_channels;
        let step = if self.config.full_window_progression {
            self.config.window
        } else {
            self.config.window >> 1
        };
        self.input_used -= step;
        if self.input_used > 0 {
            self.input.copy_within(step * channels..(step + self.input_used) * channels, 0);
        }
    }
}

impl Plugin for MonitorSpectrum {
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
        self.handle_resizes(buffer.channels())?;
        if buffer.channels() < self.header.prev_channels {
            self.config.channel_chosen = self.config.channel_chosen.min(buffer.channels() - 1);
        }
        self.header.track_channels(buffer.channels());
        self.samplerate = buffer.samplerate;
        let mut offset = 0;
        while offset < buffer.frames() {
            let used = self.prime(buffer, offset);
            offset += used;
            while self.input_used >= self.config.window {
                match self.config.mode {
                    SpectrumMode::OneChannel => {
                        let channel = if self.config.channel_chosen < self.input_channels {
                            self.config.channel_chosen
                        } else {
                            0
                        };
                        self.analyze_channel(channel);
                    }
                    SpectrumMode::AvgChannels => {
                        for channel in 0..self.input_channels {
                            self.analyze_channel(channel);
                        }
                    }
                }
                self.advance_window();
            }
            if used == 0 {
                break;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.output.fill(0.0);
        self.num_counted = 0;
        self.input_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::{Buffer, ChannelLayout};

    fn run_sine(monitor: &mut MonitorSpectrum, frequency: f32, frames: usize) {
        let samplerate = 48000.0;
        let samples: Vec<f32> = (0..frames)
            .map(|i| (i as f32 * frequency * std::f32::consts::TAU / samplerate).sin())
            .collect();
        let mut buffer =
            Buffer::from_samples(samples, ChannelLayout::mono(), samplerate as u32).unwrap();
        monitor.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
    }

    #[test]
    fn sine_peaks_in_the_right_bin() {
        let window = 1024;
        let mut monitor = MonitorSpectrum::new(MonitorSpectrumConfig {
            window,
            smoothing: 1,
            ..Default::default()
        });
        // Bin 64 of a 1024-point transform at 48 kHz is 3000 Hz.
        let bin = 64;
        let frequency = bin as f32 * 48000.0 / window as f32;
        run_sine(&mut monitor, frequency, window * 4);
        let magnitudes = monitor.magnitudes();
        let peak_bin = magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak_bin, bin);
    }

    #[test]
    fn passes_audio_through_untouched() {
        let mut monitor = MonitorSpectrum::new(MonitorSpectrumConfig::default());
        let samples: Vec<f32> = (0..2048).map(|i| (i as f32 * 0.3).sin()).collect();
        let mut buffer =
            Buffer::from_samples(samples.clone(), ChannelLayout::stereo(), 48000).unwrap();
        monitor.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        assert_eq!(buffer.as_ref().raw(), samples.as_slice());
    }

    #[test]
    fn rejects_non_power_of_two_windows() {
        let mut monitor = MonitorSpectrum::new(MonitorSpectrumConfig {
            window: 1000,
            ..Default::default()
        });
        let mut buffer = Buffer::new(256, 0, 0, ChannelLayout::mono(), 48000).unwrap();
        assert_eq!(
            monitor.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap_err(),
            Error::InvalidConfiguration
        );
    }

    #[test]
    fn cut_clears_the_spectrum() {
        let mut monitor = MonitorSpectrum::new(MonitorSpectrumConfig::default());
        run_sine(&mut monitor, 1000.0, 4096);
        assert!(monitor.magnitudes().iter().any(|&m| m > 0.0));
        let mut buffer = Buffer::new(64, 0, 0, ChannelLayout::mono(), 48000).unwrap();
        monitor.process(&mut buffer.as_mut(), ProcessFlags::CUT).unwrap();
        assert!(monitor.magnitudes().iter().all(|&m| m == 0.0));
    }
}
