//! Voice-based sampler with ADSR envelopes and rate-adapted resampling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use mf_core::math::db_to_amp;
use mf_core::{Buffer, BufferMut, MAX_CHANNELS, Result};

use crate::kernel::{default_lanczos, radius_for_rate, sample_with_kernel};
use crate::meters::{Adsr, AdsrConfig, AdsrStage, FollowerLinear};
use crate::{Meters, Plugin, PluginHeader, ProcessFlags};

/// Hard cap on concurrent voices; `play` calls beyond it are rejected.
pub const SAMPLER_MAX_VOICES: usize = 32;

/// Kernel radius targeted at unity playback rate.
const DESIRED_KERNEL_RADIUS: usize = 13;

/// Top of the band we care about preserving, in Hz. The resampling
/// low-pass sits below the source nyquist with room for the transition
/// band to alias onto itself outside hearing range.
const STOP_BAND: f32 = 20000.0;

#[derive(Clone)]
pub struct SamplerConfig {
    /// The source audio. Must outlive every voice, which the `Arc`
    /// guarantees.
    pub source: Option<Arc<Buffer>>,
    pub speed_transition_ms: f32,
    pub volume_transition_ms: f32,
    /// First frame of the loop region.
    pub loop_start: i64,
    /// One past the last frame of the loop region; values at or below
    /// `loop_start` mean the whole source.
    pub loop_end: i64,
    pub looping: bool,
    /// Reflect at the loop boundaries instead of jumping.
    pub pingpong: bool,
    pub envelope: AdsrConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            source: None,
            speed_transition_ms: 50.0,
            volume_transition_ms: 50.0,
            loop_start: 0,
            loop_end: 0,
            looping: false,
            pingpong: false,
            envelope: AdsrConfig::default(),
        }
    }
}

/// One playing voice.
#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    id: u64,
    frame: i64,
    fraction: f32,
    reverse: bool,
    speed: FollowerLinear,
    volume: FollowerLinear,
    envelope: Adsr,
}

/// A voice's publicly visible playback state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceState {
    pub frame: i64,
    pub fraction: f32,
    pub reverse: bool,
}

/// Plays a source buffer at variable speed with per-voice envelopes.
/// `play` and `stop` may be called from any thread; the voice list is the
/// only state they share with the audio thread, guarded by a mutex held
/// just long enough to mutate it.
pub struct Sampler {
    header: PluginHeader,
    pub config: SamplerConfig,
    voices: Mutex<Vec<Voice>>,
    next_id: AtomicU64,
    pub meters_output: Meters,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            header: PluginHeader::new("Sampler"),
            config,
            voices: Mutex::new(Vec::with_capacity(SAMPLER_MAX_VOICES)),
            next_id: AtomicU64::new(1),
            meters_output: Meters::default(),
        }
    }

    /// Starts a voice at the given speed (negative plays in reverse from
    /// the end) and gain in dB. Returns the voice id, or `None` when the
    /// voice set is full or there is no source.
    pub fn play(&self, speed: f32, gain_db: f32) -> Option<u64> {
        let source = self.config.source.as_ref()?;
        let mut voices = self.voices.lock();
        if voices.len() >= SAMPLER_MAX_VOICES {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut voice = Voice { id, ..Default::default() };
        let mut speed = speed;
        if speed < 0.0 {
            voice.frame = source.frames() as i64 - 1;
            voice.reverse = true;
            speed = -speed;
        }
        voice.envelope.start();
        voice.speed.jump(speed);
        voice.volume.jump(db_to_amp(gain_db));
        voices.push(voice);
        Some(id)
    }

    /// Releases a voice's envelope; it is removed once the release tail
    /// finishes.
    pub fn stop(&self, id: u64) {
        let mut voices = self.voices.lock();
        if let Some(voice) = voices.iter_mut().find(|voice| voice.id == id) {
            voice.envelope.stop();
        }
    }

    pub fn stop_all(&self) {
        let mut voices = self.voices.lock();
        for voice in voices.iter_mut() {
            voice.envelope.stop();
        }
    }

    pub fn voice_count(&self) -> usize {
        self.voices.lock().len()
    }

    pub fn voice_state(&self, id: u64) -> Option<VoiceState> {
        let voices = self.voices.lock();
        voices.iter().find(|voice| voice.id == id).map(|voice| VoiceState {
            frame: voice.frame,
            fraction: voice.fraction,
            reverse: voice.reverse,
        })
    }
}

impl Plugin for Sampler {
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
        let Some(source) = self.config.source.clone() else {
            // Without a source we are nothing.
            return Ok(());
        };
        let source_view = Buffer::as_ref(&source);
        let channels = buffer.channels().min(source.channels());
        let src_frames = source.frames() as i64;
        let samplerate_factor = source.samplerate() as f32 / buffer.samplerate as f32;
        let delta_ms = 1000.0 / source.samplerate() as f32;
        let loop_start = if self.config.loop_start >= src_frames { 0 } else { self.config.loop_start };
        let loop_end =
            if self.config.loop_end <= loop_start { src_frames } else { self.config.loop_end };
        let loop_length = loop_end - loop_start;
        let stop_band_factor = (2.0 * STOP_BAND / buffer.samplerate as f32).clamp(0.25, 1.0);
        let mut voices = self.voices.lock();
        let mut voice_index = 0;
        'voices: while voice_index < voices.len() {
            for i in 0..buffer.frames() {
                let voice = &mut voices[voice_index];
                let volume_envelope = voice.envelope.update(&self.config.envelope, delta_ms);
                if voice.envelope.stage == AdsrStage::Stop {
                    voices.remove(voice_index);
                    continue 'voices;
                }
                let volume_gain =
                    voice.volume.update(delta_ms / self.config.volume_transition_ms.max(1e-3));
                let volume = volume_envelope * volume_gain;
                let mut speed =
                    voice.speed.update(delta_ms / self.config.speed_transition_ms.max(1e-3));
                speed *= samplerate_factor;
                if volume != 0.0 {
                    if speed == 1.0 && voice.fraction == 0.0 {
                        // No resampling necessary.
                        let frame = voice.frame.clamp(0, src_frames - 1) as usize;
                        for c in 0..channels {
                            buffer.add_sample(i, c, source_view.sample(frame, c) * volume);
                        }
                    } else {
                        let rate = (stop_band_factor / speed).min(1.0);
                        let kernel = default_lanczos(radius_for_rate(rate, DESIRED_KERNEL_RADIUS));
                        let mut frame_out = [0.0f32; MAX_CHANNELS];
                        sample_with_kernel(
                            &mut frame_out,
                            channels,
                            kernel,
                            source_view.raw(),
                            source_view.stride(),
                            0,
                            src_frames,
                            self.config.looping,
                            voice.frame,
                            voice.fraction,
                            rate,
                        );
                        for c in 0..channels {
                            buffer.add_sample(i, c, frame_out[c] * volume);
                        }
                    }
                }
                // Advance, then handle loop boundaries.
                let started_before_loop_end = voice.frame <= loop_end;
                let started_after_loop_start = voice.frame >= loop_start;
                if voice.reverse {
                    voice.fraction -= speed;
                } else {
                    voice.fraction += speed;
                }
                let frames_to_add = voice.fraction.trunc() as i64;
                voice.frame += frames_to_add;
                voice.fraction -= frames_to_add as f32;
                if self.config.looping {
                    if self.config.pingpong {
                        if !voice.reverse && started_before_loop_end && voice.frame >= loop_end {
                            // loop_end itself is not part of the range.
                            voice.frame = loop_end + loop_end - voice.frame - 1;
                            voice.fraction = -voice.fraction;
                            voice.reverse = true;
                        } else if voice.reverse
                            && started_after_loop_start
                            && voice.frame <= loop_start
                        {
                            // loop_start is part of the range.
                            voice.frame = loop_start + loop_start - voice.frame;
                            voice.fraction = -voice.fraction;
                            voice.reverse = false;
                        }
                    } else if !voice.reverse && started_before_loop_end && voice.frame >= loop_end {
                        voice.frame -= loop_length;
                    } else if voice.reverse && started_after_loop_start && voice.frame <= loop_start
                    {
                        voice.frame += loop_length - 1;
                    }
                }
                if (!voice.reverse && voice.frame >= src_frames) || (voice.reverse && voice.frame < 0)
                {
                    voice.envelope.stage = AdsrStage::Stop;
                }
            }
            voice_index += 1;
        }
        drop(voices);
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.meters_output.reset();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        self.meters_output.reset_channels(first, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::ChannelLayout;

    fn source(frames: usize) -> Arc<Buffer> {
        let samples: Vec<f32> = (0..frames).map(|i| (i as f32 * 0.07).sin() * 0.5).collect();
        Arc::new(Buffer::from_samples(samples, ChannelLayout::mono(), 48000).unwrap())
    }

    fn instant_config(frames: usize) -> SamplerConfig {
        SamplerConfig {
            source: Some(source(frames)),
            // Instant envelope so tests see steady state immediately.
            envelope: AdsrConfig { attack: 0.0, decay: 0.0, sustain: 0.0, release: 0.0 },
            speed_transition_ms: 0.0,
            volume_transition_ms: 0.0,
            ..Default::default()
        }
    }

    fn run(sampler: &mut Sampler, frames: usize) -> Buffer {
        let mut buffer = Buffer::new(frames, 0, 0, ChannelLayout::mono(), 48000).unwrap();
        sampler.process(&mut buffer.as_mut(), ProcessFlags::NONE).unwrap();
        buffer
    }

    #[test]
    fn unity_speed_reproduces_source() {
        let mut sampler = Sampler::new(instant_config(1000));
        let id = sampler.play(1.0, 0.0).unwrap();
        let buffer = run(&mut sampler, 256);
        let source = sampler.config.source.clone().unwrap();
        let source_view = Buffer::as_ref(&source);
        for i in 0..256 {
            assert_eq!(buffer.as_ref().sample(i, 0), source_view.sample(i, 0), "frame {i}");
        }
        assert_eq!(sampler.voice_state(id).unwrap().frame, 256);
    }

    #[test]
    fn non_looping_voice_ends_after_source() {
        let mut sampler = Sampler::new(instant_config(100));
        sampler.play(1.0, 0.0).unwrap();
        assert_eq!(sampler.voice_count(), 1);
        run(&mut sampler, 256);
        assert_eq!(sampler.voice_count(), 0);
    }

    #[test]
    fn pingpong_reflects_at_loop_end() {
        let mut config = instant_config(100);
        config.looping = true;
        config.pingpong = true;
        let mut sampler = Sampler::new(config);
        let id = sampler.play(1.0, 0.0).unwrap();
        run(&mut sampler, 150);
        let state = sampler.voice_state(id).unwrap();
        assert!(state.reverse, "voice should be moving in reverse");
        assert_eq!(state.frame, 49);
    }

    #[test]
    fn reverse_play_starts_at_the_end() {
        let mut sampler = Sampler::new(instant_config(100));
        let id = sampler.play(-1.0, 0.0).unwrap();
        let state = sampler.voice_state(id).unwrap();
        assert!(state.reverse);
        assert_eq!(state.frame, 99);
        // Runs off the start and stops.
        run(&mut sampler, 256);
        assert_eq!(sampler.voice_count(), 0);
    }

    #[test]
    fn voice_cap_rejects_extras() {
        let mut config = instant_config(48000);
        config.looping = true;
        let sampler = Sampler::new(config);
        for _ in 0..SAMPLER_MAX_VOICES {
            assert!(sampler.play(1.0, 0.0).is_some());
        }
        assert!(sampler.play(1.0, 0.0).is_none());
    }

    #[test]
    fn stop_releases_voice() {
        let mut config = instant_config(48000);
        config.looping = true;
        let mut sampler = Sampler::new(config);
        let id = sampler.play(1.0, 0.0).unwrap();
        sampler.stop(id);
        run(&mut sampler, 64);
        assert_eq!(sampler.voice_count(), 0);
    }
}
