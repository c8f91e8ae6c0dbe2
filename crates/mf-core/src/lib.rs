//! mf-core: Shared types for MixForge
//!
//! The foundation every other MixForge crate builds on:
//! - `buffer` - interleaved float frames with guard regions and channel views
//! - `channel` - speaker positions and channel layouts
//! - `matrix` - channel routing matrices with proximity-based generation
//! - `scratch` - thread-local scratch buffer stack for allocation-free callbacks
//! - `math` - dB conversion, windowed sinc, easing, small vector math
//! - `error` - the library-wide error taxonomy

mod buffer;
mod channel;
mod error;
pub mod math;
mod matrix;
mod scratch;

pub use buffer::*;
pub use channel::*;
pub use error::*;
pub use matrix::*;
pub use scratch::*;

/// Library version, `major.minor.patch-note` where note is one of
/// `rel` (release), `rc` (release candidate), or `dev` (development build).
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", "dev");

/// What kind of build the current version is.
pub const VERSION_NOTE: &str = "dev";

/// Reads `MIXFORGE_LOG_LEVEL` (`none`, `error`, `info`, `trace`) into a
/// `log::LevelFilter`. Returns `None` when unset or unrecognized.
pub fn log_level_from_env() -> Option<log::LevelFilter> {
    let value = std::env::var("MIXFORGE_LOG_LEVEL").ok()?;
    match value.to_ascii_lowercase().as_str() {
        "none" => Some(log::LevelFilter::Off),
        "error" => Some(log::LevelFilter::Error),
        "info" => Some(log::LevelFilter::Info),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_has_note_suffix() {
        let note = VERSION.rsplit('-').next().unwrap();
        assert!(matches!(note, "rel" | "rc" | "dev"));
    }
}
