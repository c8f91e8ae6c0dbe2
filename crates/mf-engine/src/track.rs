//! Tracks and receives.

use mf_core::{Buffer, ChannelLayout, ChannelMatrix, Result};
use mf_dsp::{DspChain, Meters};

/// Index of a track within its mixer. The master is always `TrackId::MASTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub(crate) usize);

impl TrackId {
    pub const MASTER: TrackId = TrackId(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A directed edge in the mixer graph: the source track's output is summed
/// into the owning track's input through a routing matrix at a gain.
#[derive(Debug, Clone)]
pub struct Receive {
    pub source: TrackId,
    pub gain_db: f32,
    pub mute: bool,
    pub matrix: ChannelMatrix,
}

/// A mixing bus: a buffer, an effect chain, and the receives feeding it.
pub struct Track {
    pub name: String,
    pub(crate) buffer: Buffer,
    pub chain: DspChain,
    pub(crate) receives: Vec<Receive>,
    pub gain_db: f32,
    pub mute: bool,
    pub meters: Meters,
    /// Keep meters updated even without a GUI attached.
    pub observed: bool,
    pub(crate) processed: bool,
    pub(crate) mark: u8,
}

impl Track {
    pub(crate) fn new(
        buffer_frames: usize,
        layout: ChannelLayout,
        samplerate: u32,
    ) -> Result<Self> {
        Ok(Self {
            name: String::new(),
            buffer: Buffer::new(buffer_frames, 0, 0, layout, samplerate)?,
            chain: DspChain::new(),
            receives: Vec::new(),
            gain_db: 0.0,
            mute: false,
            meters: Meters::default(),
            observed: false,
            processed: false,
            mark: 0,
        })
    }

    pub fn layout(&self) -> &ChannelLayout {
        self.buffer.layout()
    }

    /// The track's most recent output block.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn receives(&self) -> &[Receive] {
        &self.receives
    }

    pub fn receive_from(&self, source: TrackId) -> Option<&Receive> {
        self.receives.iter().find(|receive| receive.source == source)
    }

    pub fn receive_from_mut(&mut self, source: TrackId) -> Option<&mut Receive> {
        self.receives.iter_mut().find(|receive| receive.source == source)
    }
}

impl Default for Track {
    fn default() -> Self {
        Self {
            name: String::new(),
            buffer: Buffer::default(),
            chain: DspChain::new(),
            receives: Vec::new(),
            gain_db: 0.0,
            mute: false,
            meters: Meters::default(),
            observed: false,
            processed: false,
            mark: 0,
        }
    }
}
