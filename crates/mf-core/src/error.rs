//! Error taxonomy shared by every MixForge crate.

use thiserror::Error;

/// Everything that can go wrong inside the engine.
///
/// Validation failures surface immediately from `process`. Allocation
/// failures inside a plugin leave its state consistent for the next call.
/// Routing cycles are handled at the mixer callback by silencing the master
/// rather than aborting the stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("a memory allocation failed")]
    OutOfMemory,

    #[error("no audio backend is available on this system")]
    BackendUnavailable,

    #[error("failed to initialize the audio backend")]
    BackendLoadError,

    #[error("the audio backend produced an error")]
    BackendError,

    #[error("there are no sound devices available")]
    NoDevicesAvailable,

    #[error("a buffer has no samples")]
    NullPointer,

    #[error("a buffer has no channels, or more than the supported maximum")]
    InvalidChannelCount,

    #[error("a buffer has no frames, or the total sample count overflows")]
    InvalidFrameCount,

    #[error("something wasn't configured right")]
    InvalidConfiguration,

    #[error("two buffers were expected to have the same channel count")]
    MismatchedChannelCount,

    #[error("two buffers were expected to have the same frame count")]
    MismatchedFrameCount,

    #[error("two buffers were expected to have the same samplerate")]
    MismatchedSamplerate,

    #[error("the mixer's track routing contains a cycle")]
    MixerRoutingCycle,
}

pub type Result<T> = std::result::Result<T, Error>;
