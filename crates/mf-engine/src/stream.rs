//! Running a mixer on a hardware stream.

use std::sync::Arc;

use parking_lot::Mutex;

use mf_core::{ChannelLayout, Result};
use mf_audio::{OutputStream, StreamConfig, StreamFormat};

use crate::mixer::{Mixer, MixerConfig};

/// A mixer driven by a hardware output stream. The device picks the block
/// size and samplerate; the mixer is sized to the committed format before
/// any audio flows.
pub struct MixerStream {
    mixer: Arc<Mixer>,
    stream: OutputStream,
}

impl MixerStream {
    /// Opens an output stream, builds a mixer matching the committed
    /// format, and wires the mixer in as the process callback. Passing
    /// `activate: false` leaves the stream paused so DSP can be configured
    /// against the device-chosen samplerate and channel count first.
    pub fn open(
        config: MixerConfig,
        stream_config: StreamConfig,
        activate: bool,
    ) -> Result<MixerStream> {
        // The stream needs its callback before the format is known, so the
        // mixer arrives through a slot filled in below, before activation.
        let slot: Arc<Mutex<Option<Arc<Mixer>>>> = Arc::new(Mutex::new(None));
        let callback_slot = Arc::clone(&slot);
        let stream = OutputStream::open(
            stream_config,
            Box::new(move |dst| {
                if let Some(mixer) = callback_slot.lock().as_ref() {
                    mixer.process_block(dst)
                } else {
                    Ok(())
                }
            }),
        )?;
        let format = stream.format();
        let config = MixerConfig {
            // The device chooses block sizes; leave generous headroom.
            buffer_frames: config.buffer_frames.max(4096),
        };
        let mixer = Mixer::new(
            config,
            ChannelLayout::standard(format.channels as u8),
            format.samplerate,
        )?;
        *slot.lock() = Some(Arc::clone(&mixer));
        if activate {
            stream.set_active(true)?;
        }
        log::info!(
            "mixer stream open on \"{}\": {} Hz, {} channels",
            stream.device_name(),
            format.samplerate,
            format.channels
        );
        Ok(MixerStream { mixer, stream })
    }

    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    pub fn set_active(&self, active: bool) -> Result<()> {
        self.stream.set_active(active)
    }

    pub fn format(&self) -> StreamFormat {
        self.stream.format()
    }

    pub fn device_name(&self) -> &str {
        self.stream.device_name()
    }
}
