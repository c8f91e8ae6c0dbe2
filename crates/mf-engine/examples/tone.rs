//! Plays a short tone through the mixer on the default output device.
//!
//! Run with `cargo run -p mf-engine --example tone`. Set
//! `MIXFORGE_LOG_LEVEL=trace` to watch the SIMD dispatch and stream
//! negotiation.

use std::sync::Arc;
use std::time::Duration;

use mf_core::{Buffer, ChannelLayout, Result};
use mf_dsp::limiter::{LookaheadLimiter, LookaheadLimiterConfig};
use mf_dsp::sampler::{Sampler, SamplerConfig};
use mf_engine::{MixerConfig, MixerStream, TrackId};

fn main() -> Result<()> {
    let mut logger = env_logger::Builder::from_default_env();
    if let Some(level) = mf_core::log_level_from_env() {
        logger.filter_level(level);
    }
    logger.init();

    let stream = MixerStream::open(
        MixerConfig::default(),
        mf_audio::StreamConfig::default(),
        false,
    )?;
    let format = stream.format();
    println!(
        "MixForge {} on \"{}\" at {} Hz, {} channels",
        mf_core::VERSION,
        stream.device_name(),
        format.samplerate,
        format.channels
    );

    // One second of a 220 Hz triangle as the sampler source.
    let samplerate = format.samplerate;
    let samples: Vec<f32> = (0..samplerate as usize)
        .map(|i| mf_core::math::osc_triangle(i as f32 * 220.0 / samplerate as f32) * 0.4)
        .collect();
    let source = Arc::new(Buffer::from_samples(samples, ChannelLayout::mono(), samplerate)?);

    let mixer = stream.mixer();
    let track = mixer.add_track(Some(ChannelLayout::mono()), true)?;
    let sampler = Sampler::new(SamplerConfig {
        source: Some(source),
        looping: true,
        pingpong: true,
        ..Default::default()
    });
    let _ = sampler.play(1.0, -6.0);
    mixer.with_track(track, |track| {
        track.chain.append(Box::new(sampler));
    });
    mixer.with_track(TrackId::MASTER, |track| {
        track.chain.append(Box::new(LookaheadLimiter::new(LookaheadLimiterConfig::default())));
    });

    stream.set_active(true)?;
    std::thread::sleep(Duration::from_secs(2));
    println!("cpu: {:.2}%", mixer.cpu_percent());
    stream.set_active(false)?;
    Ok(())
}
