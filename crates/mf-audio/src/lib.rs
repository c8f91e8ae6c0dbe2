//! mf-audio: hardware audio streams over cpal.
//!
//! The backend owns the device and calls the process callback with an
//! interleaved float block wrapped in a `BufferMut`. Stream init commits
//! the negotiated format back into the config so callers can size their
//! mixers before audio starts.

mod device;
mod stream;

pub use device::*;
pub use stream::*;
