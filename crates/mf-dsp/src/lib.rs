//! mf-dsp: DSP processing for MixForge
//!
//! The plugin contract, the DSP chain, the resampling kernel with runtime
//! SIMD dispatch, and the effect catalog:
//! - `rms` - sliding-window RMS with mono sidechain mode
//! - `limiter` - cubic soft clip and lookahead limiter
//! - `filter` - multi-pole one-pole cascade (LP/HP/BP)
//! - `dynamics` - compressor and gate with RMS sidechains
//! - `delay` - static per-channel delay, ping-pong, sample-aligned delay
//! - `delay_dynamic` - kernel-sampled variable delay (doppler)
//! - `reverb` - parallel comb bank
//! - `sampler` - voice-based sampler with ADSR envelopes
//! - `spatial` - 3D spatializer composing delay and filter per channel
//! - `monitor` - FFT spectrum monitor

pub mod chain;
pub mod delay;
pub mod delay_dynamic;
pub mod dynamics;
pub mod filter;
pub mod kernel;
pub mod limiter;
pub mod meters;
pub mod monitor;
pub mod registry;
pub mod reverb;
pub mod rms;
pub mod sampler;
pub mod simd;
pub mod spatial;

pub use chain::DspChain;
pub use meters::{Adsr, AdsrConfig, AdsrStage, FollowerLinear, Meters};

use mf_core::{BufferMut, BufferRef, Error, Result};

/// Flags passed to every `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessFlags(u32);

impl ProcessFlags {
    pub const NONE: ProcessFlags = ProcessFlags(0);
    /// The host discontinued audio (transport jump, seek). Plugins must
    /// reset delay lines, followers, and meters before processing.
    pub const CUT: ProcessFlags = ProcessFlags(1);

    #[inline]
    pub fn contains(self, other: ProcessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ProcessFlags {
    type Output = ProcessFlags;
    fn bitor(self, rhs: ProcessFlags) -> ProcessFlags {
        ProcessFlags(self.0 | rhs.0)
    }
}

/// A plugin's contribution to overall delay and the guard frames it wants
/// on its input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginSpecs {
    pub latency_frames: u32,
    pub leading_frames: u32,
    pub trailing_frames: u32,
}

impl PluginSpecs {
    /// Specs of two stages run one after the other.
    pub fn combine_serial(self, other: PluginSpecs) -> PluginSpecs {
        PluginSpecs {
            latency_frames: self.latency_frames + other.latency_frames,
            leading_frames: self.leading_frames.max(other.leading_frames),
            trailing_frames: self.trailing_frames.max(other.trailing_frames),
        }
    }

    /// Specs of two stages run side by side and summed.
    pub fn combine_parallel(self, other: PluginSpecs) -> PluginSpecs {
        PluginSpecs {
            latency_frames: self.latency_frames.max(other.latency_frames),
            leading_frames: self.leading_frames.max(other.leading_frames),
            trailing_frames: self.trailing_frames.max(other.trailing_frames),
        }
    }
}

/// State common to every plugin node.
#[derive(Debug, Default)]
pub struct PluginHeader {
    pub name: &'static str,
    /// Pass audio through untouched, with no side effects on meters.
    pub bypass: bool,
    /// A GUI is looking at this node; keep its meters updated.
    pub observed: bool,
    /// Last processing error, latched for display and cleared by the GUI.
    pub error: Option<Error>,
    /// Channel count seen on the previous process call. When it grows, the
    /// newly-added channels' state is reset so stale memory doesn't bleed
    /// into new outputs.
    pub prev_channels: usize,
}

impl PluginHeader {
    pub fn new(name: &'static str) -> Self {
        Self { name, ..Default::default() }
    }

    /// Records the channel count for this call and reports the range of
    /// channels that need a state reset, if any.
    pub fn track_channels(&mut self, channels: usize) -> Option<(usize, usize)> {
        let prev = self.prev_channels;
        self.prev_channels = channels;
        if channels > prev { Some((prev, channels - prev)) } else { None }
    }
}

/// Uniform DSP node interface.
///
/// Every node processes interleaved float32 audio in place; the few nodes
/// that meaningfully read from a distinct source (RMS sidechain mode, the
/// sample-aligned delay) also implement `process_dual`. `Send` because the
/// mixer hands chains to the audio thread.
pub trait Plugin: Send {
    fn header(&self) -> &PluginHeader;
    fn header_mut(&mut self) -> &mut PluginHeader;

    /// Processes `buffer` in place. Honors `ProcessFlags::CUT` by resetting
    /// internal history first.
    fn process(&mut self, buffer: &mut BufferMut, flags: ProcessFlags) -> Result<()>;

    /// Processes from `src` into `dst`. The default copies and runs the
    /// in-place path.
    fn process_dual(
        &mut self,
        dst: &mut BufferMut,
        src: &BufferRef,
        flags: ProcessFlags,
    ) -> Result<()> {
        check_buffers(dst, src, true, true)?;
        dst.copy_from(src);
        self.process(dst, flags)
    }

    /// Latency and guard-frame requirements at `samplerate`.
    fn get_specs(&self, _samplerate: u32) -> PluginSpecs {
        PluginSpecs::default()
    }

    /// Full state reset: delay lines zeroed, followers jumped to target,
    /// meters cleared.
    fn reset(&mut self);

    /// Resets state for channels `first..first + count` only.
    fn reset_channels(&mut self, _first: usize, _count: usize) {}
}

/// Validates a dst/src pair the way the engine does before processing.
pub fn check_buffers(
    dst: &BufferMut,
    src: &BufferRef,
    same_frame_count: bool,
    same_channel_count: bool,
) -> Result<()> {
    dst.check()?;
    src.check()?;
    if same_frame_count && dst.frames() != src.frames() {
        log::error!(
            "dst and src frame counts do not match ({} vs {})",
            dst.frames(),
            src.frames()
        );
        return Err(Error::MismatchedFrameCount);
    }
    if same_channel_count && dst.channels() != src.channels() {
        log::error!(
            "dst and src channel counts do not match ({} vs {})",
            dst.channels(),
            src.channels()
        );
        return Err(Error::MismatchedChannelCount);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let flags = ProcessFlags::NONE | ProcessFlags::CUT;
        assert!(flags.contains(ProcessFlags::CUT));
        assert!(!ProcessFlags::NONE.contains(ProcessFlags::CUT));
    }

    #[test]
    fn specs_combine() {
        let a = PluginSpecs { latency_frames: 10, leading_frames: 4, trailing_frames: 0 };
        let b = PluginSpecs { latency_frames: 5, leading_frames: 2, trailing_frames: 8 };
        let serial = a.combine_serial(b);
        assert_eq!(serial.latency_frames, 15);
        assert_eq!(serial.leading_frames, 4);
        assert_eq!(serial.trailing_frames, 8);
        let parallel = a.combine_parallel(b);
        assert_eq!(parallel.latency_frames, 10);
    }

    #[test]
    fn header_tracks_channel_growth() {
        let mut header = PluginHeader::new("test");
        assert_eq!(header.track_channels(2), Some((0, 2)));
        assert_eq!(header.track_channels(2), None);
        assert_eq!(header.track_channels(6), Some((2, 4)));
        assert_eq!(header.track_channels(1), None);
    }
}
