//! Speaker positions and channel layouts.

/// Hard cap on channels per buffer. Plugin state uses inline arrays of this
/// size so the common case never touches the heap.
pub const MAX_CHANNELS: usize = 22;

/// Closed enumeration of speaker positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPosition {
    #[default]
    Unknown,
    FrontLeft,
    FrontCenter,
    FrontRight,
    /// Between front-left and front-center.
    MidFrontLeft,
    /// Between front-right and front-center.
    MidFrontRight,
    Subwoofer,
    SideLeft,
    SideRight,
    BackLeft,
    BackCenter,
    BackRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopBackLeft,
    TopBackCenter,
    TopBackRight,
}

impl ChannelPosition {
    /// Nominal (azimuth, elevation) in degrees. Azimuth is signed from front
    /// center, elevation from the horizontal plane. The subwoofer is
    /// direction-less and treated as front center for proximity purposes.
    pub fn angles(self) -> (i32, i32) {
        use ChannelPosition::*;
        match self {
            Unknown | FrontCenter | Subwoofer => (0, 0),
            FrontLeft => (-30, 0),
            FrontRight => (30, 0),
            MidFrontLeft => (-15, 0),
            MidFrontRight => (15, 0),
            SideLeft => (-90, 0),
            SideRight => (90, 0),
            BackLeft => (-135, 0),
            BackRight => (135, 0),
            BackCenter => (180, 0),
            TopCenter => (0, 90),
            TopFrontLeft => (-30, 55),
            TopFrontCenter => (0, 55),
            TopFrontRight => (30, 55),
            TopBackLeft => (-135, 55),
            TopBackCenter => (180, 55),
            TopBackRight => (135, 55),
        }
    }

    pub fn is_aerial(self) -> bool {
        use ChannelPosition::*;
        matches!(
            self,
            TopCenter
                | TopFrontLeft
                | TopFrontCenter
                | TopFrontRight
                | TopBackLeft
                | TopBackCenter
                | TopBackRight
        )
    }
}

/// Angular distance between two positions, in degrees.
pub fn position_distance(a: ChannelPosition, b: ChannelPosition) -> u16 {
    let (az_a, el_a) = a.angles();
    let (az_b, el_b) = b.angles();
    let mut az = (az_a - az_b).abs();
    if az > 180 {
        az = 360 - az;
    }
    let el = (el_a - el_b).abs();
    (az + el) as u16
}

/// What the output channels are physically attached to. Affects
/// spatialization (headphones keep a floor amplitude on every channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormFactor {
    #[default]
    Unknown,
    Speakers,
    Headphones,
}

/// A channel count with per-channel speaker positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelLayout {
    count: u8,
    positions: [ChannelPosition; MAX_CHANNELS],
    pub form_factor: FormFactor,
}

impl ChannelLayout {
    /// A layout of `count` channels with unknown positions.
    pub fn unknown(count: u8) -> Self {
        debug_assert!(count as usize <= MAX_CHANNELS);
        Self {
            count,
            positions: [ChannelPosition::Unknown; MAX_CHANNELS],
            form_factor: FormFactor::Unknown,
        }
    }

    pub fn from_positions(positions: &[ChannelPosition]) -> Self {
        debug_assert!(positions.len() <= MAX_CHANNELS);
        let mut layout = Self::unknown(positions.len() as u8);
        layout.positions[..positions.len()].copy_from_slice(positions);
        layout
    }

    pub fn mono() -> Self {
        Self::from_positions(&[ChannelPosition::FrontCenter])
    }

    pub fn stereo() -> Self {
        use ChannelPosition::*;
        Self::from_positions(&[FrontLeft, FrontRight])
    }

    pub fn headphones() -> Self {
        let mut layout = Self::stereo();
        layout.form_factor = FormFactor::Headphones;
        layout
    }

    pub fn stereo_2_1() -> Self {
        use ChannelPosition::*;
        Self::from_positions(&[FrontLeft, FrontRight, Subwoofer])
    }

    pub fn surround_5_1() -> Self {
        use ChannelPosition::*;
        Self::from_positions(&[FrontLeft, FrontRight, FrontCenter, Subwoofer, BackLeft, BackRight])
    }

    pub fn surround_7_1() -> Self {
        use ChannelPosition::*;
        Self::from_positions(&[
            FrontLeft, FrontRight, FrontCenter, Subwoofer, BackLeft, BackRight, SideLeft, SideRight,
        ])
    }

    pub fn surround_9_1() -> Self {
        use ChannelPosition::*;
        Self::from_positions(&[
            FrontLeft,
            FrontRight,
            FrontCenter,
            Subwoofer,
            BackLeft,
            BackRight,
            SideLeft,
            SideRight,
            MidFrontLeft,
            MidFrontRight,
        ])
    }

    /// The standard layout for a channel count, or unknown positions when
    /// there is no standard.
    pub fn standard(count: u8) -> Self {
        match count {
            1 => Self::mono(),
            2 => Self::stereo(),
            3 => Self::stereo_2_1(),
            6 => Self::surround_5_1(),
            8 => Self::surround_7_1(),
            10 => Self::surround_9_1(),
            _ => Self::unknown(count),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn position(&self, channel: usize) -> ChannelPosition {
        self.positions[channel]
    }

    #[inline]
    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions[..self.count as usize]
    }

    /// A single-channel layout preserving one position of this layout.
    pub fn one_channel(&self, channel: usize) -> Self {
        Self::from_positions(&[self.positions[channel]])
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::unknown(0)
    }
}
