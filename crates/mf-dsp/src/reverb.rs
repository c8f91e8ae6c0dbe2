//! Schroeder-style reverb: a parallel bank of comb filters.

use mf_core::math::{db_to_amp, samples_to_ms};
use mf_core::{BufferMut, Result, push_scratch, push_scratch_zero};

use crate::delay::{Delay, DelayConfig};
use crate::filter::{Filter, FilterConfig, FilterKind};
use crate::{Meters, Plugin, PluginHeader, ProcessFlags};

/// Number of parallel comb taps.
pub const REVERB_TAP_COUNT: usize = 30;

/// Tap lengths in samples at 48 kHz, chosen prime-ish so the combs don't
/// reinforce each other. Scaled to the active samplerate via ms.
const TAP_SAMPLES_48K: [u32; REVERB_TAP_COUNT] = [
    2111, 2129, 2017, 2029, 1753, 1733, 1699, 1621, 1447, 1429, 1361, 1319, 1201, 1171, 1129,
    1117, 1063, 1051, 1039, 1009, 977, 919, 857, 773, 743, 719, 643, 641, 631, 619,
];

#[derive(Debug, Clone, Copy)]
pub struct ReverbConfig {
    pub gain_wet: f32,
    pub gain_dry: f32,
    pub mute_wet: bool,
    pub mute_dry: bool,
    /// Bigger rooms decay slower. Reasonable range is about 1..=100.
    pub roomsize: f32,
    /// Scales the comb filters' low-pass cutoffs; 1.0 puts the early taps
    /// at 4 kHz.
    pub color: f32,
    /// Pre-delay before the room responds, in ms.
    pub delay_ms: f32,
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            gain_wet: -9.0,
            gain_dry: 0.0,
            mute_wet: false,
            mute_dry: false,
            roomsize: 5.0,
            color: 1.0,
            delay_ms: 50.0,
        }
    }
}

pub struct Reverb {
    header: PluginHeader,
    pub config: ReverbConfig,
    input_delay: Delay,
    taps: Vec<(Delay, Filter)>,
    pub meters_input: Meters,
    pub meters_output: Meters,
}

impl Reverb {
    pub fn new(config: ReverbConfig) -> Self {
        let input_delay = Delay::new(DelayConfig {
            gain_wet: 0.0,
            mute_dry: true,
            delay_ms: config.delay_ms,
            feedback: 0.0,
            pingpong: 0.0,
            ..Default::default()
        });
        let taps = TAP_SAMPLES_48K
            .iter()
            .map(|&samples| {
                let delay = Delay::new(DelayConfig {
                    gain_wet: 0.0,
                    mute_dry: true,
                    delay_ms: samples_to_ms(samples as f32, 48000.0),
                    feedback: 0.0,
                    pingpong: 0.05,
                    ..Default::default()
                });
                let filter = Filter::new(FilterConfig {
                    kind: FilterKind::LowPass,
                    poles: 1,
                    frequency: 1000.0,
                    ..Default::default()
                });
                (delay, filter)
            })
            .collect();
        Self {
            header: PluginHeader::new("Reverb"),
            config,
            input_delay,
            taps,
            meters_input: Meters::default(),
            meters_output: Meters::default(),
        }
    }
}

impl Plugin for Reverb {
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
        let frames = buffer.frames();
        let channels = buffer.channels();
        let samplerate = buffer.samplerate;
        let mut input = push_scratch(frames, 0, 0, channels, samplerate);
        if self.config.delay_ms != 0.0 {
            self.input_delay.config.delay_ms = self.config.delay_ms;
            self.input_delay.process_dual(&mut input.as_mut(), &buffer.as_ref(), flags)?;
        } else {
            input.as_mut().copy_from(&buffer.as_ref());
        }
        let mut combined = push_scratch_zero(frames, 0, 0, channels, samplerate);
        let mut stage = push_scratch(frames, 0, 0, channels, samplerate);
        let feedback = 0.985 - 0.2 / self.config.roomsize;
        let color = self.config.color * 4000.0;
        let amount_wet = if self.config.mute_wet { 0.0 } else { db_to_amp(self.config.gain_wet) };
        let amount_dry = if self.config.mute_dry { 0.0 } else { db_to_amp(self.config.gain_dry) };
        let early_taps = REVERB_TAP_COUNT * 2 / 3;
        let tap_amount = 1.0 / REVERB_TAP_COUNT as f32;
        for (tap, (delay, filter)) in self.taps.iter_mut().enumerate() {
            if tap < early_taps {
                delay.config.feedback = feedback;
                filter.config.frequency = color;
                stage.as_mut().copy_from(&input.as_ref());
            } else {
                // Late taps re-circulate the combined early field to build
                // the diffuse tail, with a feedback ramp toward unity.
                delay.config.feedback = (tap + REVERB_TAP_COUNT) as f32 / (REVERB_TAP_COUNT * 2) as f32;
                filter.config.frequency = color * 4.0;
                stage.as_mut().copy_from(&combined.as_ref());
            }
            filter.process(&mut stage.as_mut(), flags)?;
            delay.process(&mut stage.as_mut(), flags)?;
            combined.as_mut().mix(1.0, &stage.as_ref(), tap_amount);
        }
        buffer.mix(amount_dry, &combined.as_ref(), amount_wet);
        drop(stage);
        drop(combined);
        drop(input);
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.input_delay.reset();
        for (delay, filter) in &mut self.taps {
            delay.reset();
            filter.reset();
        }
        self.meters_input.reset();
        self.meters_output.reset();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        self.input_delay.reset_channels(first, count);
        for (delay, filter) in &mut self.taps {
            delay.reset_channels(first, count);
            filter.reset_channels(first, count);
        }
        self.meters_input.reset_channels(first, count);
        self.meters_output.reset_channels(first, count);
    }
}
