//! Output stream management.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig as CpalStreamConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mf_core::{BufferMut, ChannelLayout, Error, Result};

/// Requested stream parameters. Zero/None fields let the device choose;
/// `open` commits the negotiated values back so the caller can query them.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub device_name: Option<String>,
    /// 0 lets the device choose.
    pub samplerate: u32,
    /// 0 lets the device choose.
    pub channels: usize,
}

/// The format a stream actually runs at.
#[derive(Debug, Clone, Copy)]
pub struct StreamFormat {
    pub samplerate: u32,
    pub channels: usize,
}

/// The process callback: fill `dst` with one interleaved float block.
pub type ProcessCallback = Box<dyn FnMut(&mut BufferMut) -> Result<()> + Send>;

struct StreamState {
    callback: Mutex<ProcessCallback>,
    active: AtomicBool,
}

/// An open output stream. Audio flows while active; dropping the stream
/// closes the device.
pub struct OutputStream {
    stream: Stream,
    state: Arc<StreamState>,
    format: StreamFormat,
    device_name: String,
}

impl OutputStream {
    /// Opens an output stream on the configured (or default) device. The
    /// chosen samplerate and channel count are committed into `format()`.
    /// The stream starts inactive; call `set_active(true)`.
    pub fn open(config: StreamConfig, callback: ProcessCallback) -> Result<OutputStream> {
        let device = crate::device::find_output_device(config.device_name.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "<unknown>".into());
        let supported = negotiate_output_config(&device, &config)?;
        let channels = supported.channels() as usize;
        let samplerate = supported.sample_rate();
        let cpal_config = CpalStreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let state = Arc::new(StreamState {
            callback: Mutex::new(callback),
            active: AtomicBool::new(false),
        });
        let callback_state = Arc::clone(&state);
        let layout = ChannelLayout::standard(channels as u8);
        let mut denormals_configured = false;
        let stream = device
            .build_output_stream(
                &cpal_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !denormals_configured {
                        // Flush denormals on the audio thread; quiet tails
                        // are brutal on the FPU otherwise.
                        mf_dsp::simd::set_denormals_zero();
                        denormals_configured = true;
                    }
                    data.fill(0.0);
                    if !callback_state.active.load(Ordering::Acquire) {
                        return;
                    }
                    let mut buffer = BufferMut::from_interleaved(data, layout, samplerate);
                    let mut callback = callback_state.callback.lock();
                    if let Err(err) = callback(&mut buffer) {
                        log::error!("process callback failed: {err}");
                    }
                },
                move |err| {
                    log::error!("output stream error: {err}");
                },
                None,
            )
            .map_err(|err| {
                log::error!("failed to build output stream: {err}");
                Error::BackendLoadError
            })?;
        Ok(OutputStream {
            stream,
            state,
            format: StreamFormat { samplerate, channels },
            device_name,
        })
    }

    /// Starts or pauses audio flow.
    pub fn set_active(&self, active: bool) -> Result<()> {
        if active {
            self.stream.play().map_err(|err| {
                log::error!("failed to start stream: {err}");
                Error::BackendError
            })?;
        } else {
            self.stream.pause().map_err(|err| {
                log::error!("failed to pause stream: {err}");
                Error::BackendError
            })?;
        }
        self.state.active.store(active, Ordering::Release);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    /// The committed format the device chose.
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

fn negotiate_output_config(
    device: &cpal::Device,
    config: &StreamConfig,
) -> Result<cpal::SupportedStreamConfig> {
    if config.samplerate == 0 && config.channels == 0 {
        return device.default_output_config().map_err(|err| {
            log::error!("failed to get default output config: {err}");
            Error::BackendError
        });
    }
    let supported = device.supported_output_configs().map_err(|err| {
        log::error!("failed to query output configs: {err}");
        Error::BackendError
    })?;
    for candidate in supported {
        if candidate.sample_format() != SampleFormat::F32 {
            continue;
        }
        if config.channels != 0 && candidate.channels() as usize != config.channels {
            continue;
        }
        if config.samplerate != 0 {
            let wanted: SampleRate = config.samplerate;
            if candidate.min_sample_rate() <= wanted && wanted <= candidate.max_sample_rate() {
                return Ok(candidate.with_sample_rate(wanted));
            }
        } else {
            return Ok(candidate.with_max_sample_rate());
        }
    }
    log::error!(
        "no output config for {} channels at {} Hz",
        config.channels,
        config.samplerate
    );
    Err(Error::BackendError)
}
