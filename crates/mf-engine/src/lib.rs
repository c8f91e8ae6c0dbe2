//! mf-engine: the MixForge mixer.
//!
//! Tracks own an effect chain and a buffer; receives route other tracks'
//! output into them through channel matrices, forming a DAG that is walked
//! leaves-first every callback. Cycles are detected per block and silence
//! the master rather than killing the stream, so live routing edits stay
//! recoverable.

mod mixer;
mod stream;
mod track;

pub use mixer::*;
pub use stream::*;
pub use track::*;
