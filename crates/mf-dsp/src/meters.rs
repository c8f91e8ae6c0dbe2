//! Metering and parameter smoothing primitives.

use mf_core::{BufferRef, MAX_CHANNELS};
use mf_core::math::{db_to_amp, lerp};

/// Per-channel RMS and peak metering for display.
#[derive(Debug, Clone, Default)]
pub struct Meters {
    pub rms_squared_avg: [f32; MAX_CHANNELS],
    /// Persistent peaks, cleared only by `reset`.
    pub peaks: [f32; MAX_CHANNELS],
    /// Peaks over the most recent block.
    pub peaks_short_term: [f32; MAX_CHANNELS],
    pub active_meters: usize,
    rms_frames: u32,
}

/// Cap on the RMS averaging history, in frames.
const METER_RMS_FRAMES_MAX: u32 = 512;

impl Meters {
    pub fn reset(&mut self) {
        *self = Meters::default();
    }

    pub fn reset_channels(&mut self, first: usize, count: usize) {
        for c in first..(first + count).min(MAX_CHANNELS) {
            self.rms_squared_avg[c] = 0.0;
            self.peaks[c] = 0.0;
            self.peaks_short_term[c] = 0.0;
        }
    }

    /// Folds one block into the meters, with `input_amp` applied to the
    /// measured signal.
    pub fn update(&mut self, buffer: &BufferRef, input_amp: f32) {
        let channels = buffer.channels().min(MAX_CHANNELS);
        for c in self.active_meters..channels {
            self.rms_squared_avg[c] = 0.0;
            self.peaks[c] = 0.0;
        }
        self.active_meters = channels;
        let frames = buffer.frames();
        for c in 0..channels {
            self.peaks_short_term[c] = 0.0;
            let mut rms_squared = 0.0f32;
            let mut peak = 0.0f32;
            for i in 0..frames {
                let sample = buffer.sample(i, c);
                rms_squared += sample * sample;
                peak = peak.max(sample.abs());
            }
            rms_squared /= frames as f32;
            rms_squared *= input_amp * input_amp;
            peak *= input_amp;
            let mix = frames as f32 / (self.rms_frames as f32 + frames as f32);
            self.rms_squared_avg[c] = lerp(self.rms_squared_avg[c], rms_squared, mix);
            self.peaks[c] = self.peaks[c].max(peak);
            self.peaks_short_term[c] = self.peaks_short_term[c].max(peak);
        }
        self.rms_frames = (self.rms_frames + frames as u32).min(METER_RMS_FRAMES_MAX);
    }
}

/// A scalar that follows a target linearly over a configured span,
/// automagically handling a moving target.
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowerLinear {
    start: f32,
    end: f32,
    progress: f32,
}

impl FollowerLinear {
    #[inline]
    pub fn value(&self) -> f32 {
        lerp(self.start, self.end, self.progress)
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.end
    }

    /// Retargets; the current value becomes the new start.
    pub fn set_target(&mut self, target: f32) {
        if target != self.end {
            self.start = self.value();
            self.end = target;
            self.progress = 0.0;
        }
    }

    /// Returns the value before advancing by `delta_t` (a fraction of the
    /// full transition).
    pub fn update(&mut self, delta_t: f32) -> f32 {
        let result = self.value();
        self.progress = (self.progress + delta_t).min(1.0);
        result
    }

    pub fn update_target(&mut self, target: f32, delta_t: f32) -> f32 {
        self.set_target(target);
        self.update(delta_t)
    }

    /// Jumps straight to `target` with no transition.
    pub fn jump(&mut self, target: f32) {
        self.start = target;
        self.end = target;
        self.progress = 1.0;
    }
}

/// ADSR envelope configuration. Times in ms, sustain in dB (0 dB is full
/// volume).
#[derive(Debug, Clone, Copy)]
pub struct AdsrConfig {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrConfig {
    fn default() -> Self {
        Self { attack: 5.0, decay: 50.0, sustain: 0.0, release: 100.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdsrStage {
    #[default]
    Stop,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// One envelope instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Adsr {
    pub stage: AdsrStage,
    /// Progress along the current stage in [0, 1].
    progress: f32,
    /// An early release doesn't necessarily start at the sustain volume.
    release_start_amp: f32,
}

impl Adsr {
    pub fn start(&mut self) {
        self.stage = AdsrStage::Attack;
        self.progress = 0.0;
        self.release_start_amp = 0.0;
    }

    pub fn stop(&mut self) {
        self.stage = AdsrStage::Release;
        self.progress = 0.0;
    }

    pub fn value(&self, config: &AdsrConfig) -> f32 {
        match self.stage {
            AdsrStage::Attack => self.progress,
            AdsrStage::Decay => lerp(1.0, db_to_amp(config.sustain), self.progress),
            AdsrStage::Sustain => db_to_amp(config.sustain),
            AdsrStage::Release => self.release_start_amp * (1.0 - self.progress),
            AdsrStage::Stop => 0.0,
        }
    }

    /// Advances by `delta_ms` and returns the resulting amplitude.
    pub fn update(&mut self, config: &AdsrConfig, delta_ms: f32) -> f32 {
        let mut delta_ms = delta_ms;
        if self.stage == AdsrStage::Attack {
            if config.attack > 0.0 {
                self.progress += delta_ms / config.attack;
                if self.progress >= 1.0 {
                    delta_ms = (self.progress - 1.0) * config.attack;
                    self.progress = 0.0;
                    self.stage = AdsrStage::Decay;
                }
            } else {
                self.stage = AdsrStage::Decay;
            }
        }
        if self.stage == AdsrStage::Decay {
            if config.decay > 0.0 {
                self.progress += delta_ms / config.decay;
                if self.progress >= 1.0 {
                    self.stage = AdsrStage::Sustain;
                }
            } else {
                self.stage = AdsrStage::Sustain;
            }
        }
        // Nothing happens during sustain; we wait for release.
        if self.stage == AdsrStage::Release {
            if config.release > 0.0 {
                self.progress += delta_ms / config.release;
                if self.progress >= 1.0 {
                    self.stage = AdsrStage::Stop;
                }
            } else {
                self.stage = AdsrStage::Stop;
            }
        }
        let result = self.value(config);
        if self.stage != AdsrStage::Release {
            self.release_start_amp = result;
        }
        result
    }
}
