//! Dynamics: compressor and gate, both driven by a mono RMS sidechain.

use mf_core::math::{amp_to_db, db_to_amp};
use mf_core::{BufferMut, Result, push_scratch, push_scratch_copy};

use crate::chain::DspChain;
use crate::rms::{CombineOp, Rms, RmsConfig};
use crate::{Meters, Plugin, PluginHeader, ProcessFlags};

/// Window of the internal envelope RMS, in samples.
const DYNAMICS_RMS_WINDOW: usize = 128;

fn make_envelope_rms() -> Rms {
    Rms::new(RmsConfig { window_samples: DYNAMICS_RMS_WINDOW, combine_op: CombineOp::MaxOfSquares })
}

#[derive(Debug, Clone, Copy)]
pub struct CompressorConfig {
    /// Level above which compression sets in, in dB.
    pub threshold: f32,
    /// `> 1` compresses by that ratio; `< 0` expands by `-ratio`.
    pub ratio: f32,
    /// Attack time in ms.
    pub attack: f32,
    /// Decay time in ms.
    pub decay: f32,
    /// Makeup gain in dB.
    pub gain: f32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self { threshold: -12.0, ratio: 10.0, attack: 50.0, decay: 200.0, gain: 0.0 }
    }
}

pub struct Compressor {
    header: PluginHeader,
    pub config: CompressorConfig,
    rms: Rms,
    /// Envelope in dB the gain computer follows.
    attenuation: f32,
    /// Deepest gain reduction ever, in dB (for metering).
    pub min_gain: f32,
    /// Deepest gain reduction in the current block.
    pub min_gain_short: f32,
    pub meters_input: Meters,
    pub meters_output: Meters,
}

impl Compressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self {
            header: PluginHeader::new("Compressor"),
            config,
            rms: make_envelope_rms(),
            attenuation: 0.0,
            min_gain: 0.0,
            min_gain_short: 0.0,
            meters_input: Meters::default(),
            meters_output: Meters::default(),
        }
    }
}

impl Plugin for Compressor {
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
        self.header.track_channels(buffer.channels());
        if self.header.observed {
            self.meters_input.update(&buffer.as_ref(), 1.0);
        }
        let mut rms_scratch = push_scratch(buffer.frames(), 0, 0, 1, buffer.samplerate);
        self.rms.process_dual(&mut rms_scratch.as_mut(), &buffer.as_ref(), flags)?;
        let t = buffer.samplerate as f32 / 1000.0;
        let attack_factor = (-1.0 / (self.config.attack * t)).exp();
        let decay_factor = (-1.0 / (self.config.decay * t)).exp();
        let overgain_factor = if self.config.ratio > 1.0 {
            1.0 - 1.0 / self.config.ratio
        } else if self.config.ratio < 0.0 {
            -self.config.ratio
        } else {
            0.0
        };
        self.min_gain_short = 0.0;
        let envelope = rms_scratch.as_ref();
        for i in 0..buffer.frames() {
            let rms = amp_to_db(envelope.sample(i, 0)).max(-120.0);
            if rms > self.attenuation {
                self.attenuation = rms + attack_factor * (self.attenuation - rms);
            } else {
                self.attenuation = rms + decay_factor * (self.attenuation - rms);
            }
            let gain = if self.attenuation > self.config.threshold {
                overgain_factor * (self.config.threshold - self.attenuation)
            } else {
                0.0
            };
            self.min_gain_short = self.min_gain_short.min(gain);
            let amp = db_to_amp(gain + self.config.gain);
            for c in 0..buffer.channels() {
                let sample = buffer.sample(i, c);
                buffer.set_sample(i, c, sample * amp);
            }
        }
        self.min_gain = self.min_gain.min(self.min_gain_short);
        drop(rms_scratch);
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.rms.reset();
        self.attenuation = 0.0;
        self.min_gain = 0.0;
        self.min_gain_short = 0.0;
        self.meters_input.reset();
        self.meters_output.reset();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        self.meters_input.reset_channels(first, count);
        self.meters_output.reset_channels(first, count);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Level below which the gate closes, in dB.
    pub threshold: f32,
    /// Attack time in ms.
    pub attack: f32,
    /// Decay time in ms.
    pub decay: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { threshold: -18.0, attack: 5.0, decay: 100.0 }
    }
}

/// Noise gate. The level detector can run through an optional activation
/// chain (e.g. a band-pass filter) so the gate keys off a shaped copy of
/// the input instead of the raw signal.
pub struct Gate {
    header: PluginHeader,
    pub config: GateConfig,
    /// Sidechain effects applied to the detector copy only.
    pub activation_effects: DspChain,
    rms: Rms,
    attenuation: f32,
    /// Current gate gain in dB, for display.
    pub gain: f32,
    pub meters_input: Meters,
    pub meters_output: Meters,
}

impl Gate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            header: PluginHeader::new("Gate"),
            config,
            activation_effects: DspChain::new(),
            rms: make_envelope_rms(),
            attenuation: 0.0,
            gain: 0.0,
            meters_input: Meters::default(),
            meters_output: Meters::default(),
        }
    }
}

impl Plugin for Gate {
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
        self.header.track_channels(buffer.channels());
        if self.header.observed {
            self.meters_input.update(&buffer.as_ref(), 1.0);
        }
        let mut rms_scratch = push_scratch(buffer.frames(), 0, 0, 1, buffer.samplerate);
        if self.activation_effects.is_empty() {
            self.rms.process_dual(&mut rms_scratch.as_mut(), &buffer.as_ref(), flags)?;
        } else {
            let mut activation = push_scratch_copy(&buffer.as_ref());
            self.activation_effects.process(&mut activation.as_mut(), flags)?;
            self.rms.process_dual(&mut rms_scratch.as_mut(), &activation.as_ref(), flags)?;
        }
        let t = buffer.samplerate as f32 / 1000.0;
        let attack_factor = (-1.0 / (self.config.attack * t)).exp();
        let decay_factor = (-1.0 / (self.config.decay * t)).exp();
        let envelope = rms_scratch.as_ref();
        for i in 0..buffer.frames() {
            let rms = amp_to_db(envelope.sample(i, 0)).max(-120.0);
            if rms > self.config.threshold {
                self.attenuation = rms + attack_factor * (self.attenuation - rms);
            } else {
                self.attenuation = rms + decay_factor * (self.attenuation - rms);
            }
            let gain = if self.attenuation > self.config.threshold {
                0.0
            } else {
                -10.0 * (self.config.threshold - self.attenuation)
            };
            self.gain = gain;
            let amp = db_to_amp(gain);
            for c in 0..buffer.channels() {
                let sample = buffer.sample(i, c);
                buffer.set_sample(i, c, sample * amp);
            }
        }
        drop(rms_scratch);
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.rms.reset();
        self.activation_effects.reset();
        self.attenuation = 0.0;
        self.gain = 0.0;
        self.meters_input.reset();
        self.meters_output.reset();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        self.meters_input.reset_channels(first, count);
        self.meters_output.reset_channels(first, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::{Buffer, ChannelLayout};

    fn loud_then_quiet(frames: usize, loud: f32, quiet: f32) -> Buffer {
        let half = frames / 2;
        let samples: Vec<f32> = (0..frames)
            .map(|i| if i < half { loud } else { quiet } * if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        Buffer::from_samples(samples, ChannelLayout::mono(), 48000).unwrap()
    }

    #[test]
    fn compressor_reduces_loud_signal() {
        let mut compressor = Compressor::new(CompressorConfig {
            threshold: -20.0,
            ratio: 10.0,
            attack: 1.0,
            decay: 50.0,
            gain: 0.0,
        });
        let mut buffer = loud_then_quiet(8192, 0.9, 0.9);
        compressor.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        // 0.9 is about -1 dB, 19 dB over threshold; at 10:1 we expect heavy
        // gain reduction once the envelope settles.
        assert!(compressor.min_gain < -10.0, "min gain {}", compressor.min_gain);
        let view = buffer.as_ref();
        let tail_peak = (6000..8192).map(|i| view.sample(i, 0).abs()).fold(0.0f32, f32::max);
        assert!(tail_peak < 0.3, "tail peak {tail_peak}");
    }

    #[test]
    fn compressor_leaves_quiet_signal_alone() {
        let mut compressor = Compressor::new(CompressorConfig {
            threshold: -6.0,
            ratio: 10.0,
            attack: 1.0,
            decay: 50.0,
            gain: 0.0,
        });
        let mut buffer = loud_then_quiet(4096, 0.05, 0.05);
        compressor.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        let view = buffer.as_ref();
        for i in 2048..4096 {
            assert!((view.sample(i, 0).abs() - 0.05).abs() < 1e-3);
        }
    }

    #[test]
    fn gate_closes_on_silence_and_opens_on_signal() {
        let mut gate = Gate::new(GateConfig { threshold: -30.0, attack: 1.0, decay: 1.0 });
        let mut buffer = loud_then_quiet(16384, 0.5, 0.001);
        gate.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        let view = buffer.as_ref();
        // Open while loud.
        let open_peak = (4096..8192).map(|i| view.sample(i, 0).abs()).fold(0.0f32, f32::max);
        assert!(open_peak > 0.4, "gate strangled the signal: {open_peak}");
        // Closed once the quiet tail settles.
        let closed_peak = (12000..16384).map(|i| view.sample(i, 0).abs()).fold(0.0f32, f32::max);
        assert!(closed_peak < 1e-4, "gate failed to close: {closed_peak}");
    }
}
