//! 3D spatialization: per-source-channel composition of dynamic delay (for
//! doppler and path length) and low-pass filtering (for head shadow),
//! summed into destination channels weighted by direction.

use std::sync::Arc;

use mf_core::math::{Vec3, Mat3, linstep, samples_to_ms};
use mf_core::{
    BufferMut, BufferRef, ChannelLayout, ChannelPosition, Error, FormFactor, MAX_CHANNELS, Result,
    push_scratch, push_scratch_copy, push_scratch_zero,
};

use crate::delay_dynamic::{DelayDynamic, DelayDynamicConfig, set_delay_ramps};
use crate::filter::{Filter, FilterConfig, FilterKind};
use crate::meters::FollowerLinear;
use crate::{Meters, Plugin, PluginHeader, PluginSpecs, ProcessFlags, check_buffers};

/// The listener's coordinate frame. Positions handed to the spatializer
/// are transformed by this before panning.
#[derive(Debug, Clone, Copy)]
pub struct World {
    pub origin: Vec3,
    pub orientation: Mat3,
    /// Meters per second; must be positive.
    pub speed_of_sound: f32,
}

impl Default for World {
    fn default() -> Self {
        Self { origin: Vec3::ZERO, orientation: Mat3::IDENTITY, speed_of_sound: 343.0 }
    }
}

impl World {
    #[inline]
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.orientation.transform(point - self.origin)
    }
}

/// Target placement for one source channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatializeChannelConfig {
    pub position: Vec3,
    pub amplitude: f32,
}

#[derive(Clone)]
pub struct SpatializeConfig {
    /// Listener frame; `None` uses the default world.
    pub world: Option<Arc<World>>,
    pub do_doppler: bool,
    pub do_filter: bool,
    /// Delay each destination channel by its own ear's path length.
    pub use_per_channel_delay: bool,
    /// Filter each destination channel at its own head-shadow cutoff.
    pub use_per_channel_filter: bool,
    /// How many source channels are live; 0 means all of them.
    pub num_src_channels_active: usize,
    /// How long position/amplitude changes take to settle, in ms.
    pub target_follow_time_ms: f32,
    /// Upper bound for the internal dynamic delays, in ms; 0 picks 500.
    pub delay_max_ms: f32,
    /// Distance from head center to each ear, in meters.
    pub ear_distance: f32,
    pub channels: [SpatializeChannelConfig; MAX_CHANNELS],
}

impl Default for SpatializeConfig {
    fn default() -> Self {
        Self {
            world: None,
            do_doppler: true,
            do_filter: true,
            use_per_channel_delay: true,
            use_per_channel_filter: true,
            num_src_channels_active: 1,
            target_follow_time_ms: 20.0,
            delay_max_ms: 0.0,
            ear_distance: 0.085,
            channels: [SpatializeChannelConfig::default(); MAX_CHANNELS],
        }
    }
}

struct SpatializeChannel {
    filter: Filter,
    delay: DelayDynamic,
    position: Follower3,
    amplitude: FollowerLinear,
}

/// Linear follower over a 3D position.
#[derive(Debug, Clone, Copy, Default)]
struct Follower3 {
    x: FollowerLinear,
    y: FollowerLinear,
    z: FollowerLinear,
}

impl Follower3 {
    fn value(&self) -> Vec3 {
        Vec3::new(self.x.value(), self.y.value(), self.z.value())
    }

    fn set_target(&mut self, target: Vec3) {
        self.x.set_target(target.x);
        self.y.set_target(target.y);
        self.z.set_target(target.z);
    }

    fn update(&mut self, delta_t: f32) -> Vec3 {
        Vec3::new(self.x.update(delta_t), self.y.update(delta_t), self.z.update(delta_t))
    }

    fn jump(&mut self, target: Vec3) {
        self.x.jump(target.x);
        self.y.jump(target.y);
        self.z.jump(target.z);
    }
}

/// Per-destination-channel panning data for one end of a block.
#[derive(Debug, Clone, Copy, Default)]
struct ChannelWeight {
    channel: usize,
    amp: f32,
    dot: f32,
}

pub struct Spatialize {
    header: PluginHeader,
    pub config: SpatializeConfig,
    channels: Vec<SpatializeChannel>,
    pub meters_input: Meters,
    pub meters_output: Meters,
}

impl Spatialize {
    pub fn new(config: SpatializeConfig) -> Self {
        let delay_max_ms = if config.delay_max_ms != 0.0 { config.delay_max_ms } else { 500.0 };
        let channels = (0..MAX_CHANNELS)
            .map(|_| SpatializeChannel {
                filter: Filter::new(FilterConfig {
                    kind: FilterKind::LowPass,
                    poles: 1,
                    frequency: 15000.0,
                    ..Default::default()
                }),
                delay: DelayDynamic::new(DelayDynamicConfig {
                    gain_wet: 0.0,
                    gain_dry: 0.0,
                    mute_wet: false,
                    mute_dry: true,
                    delay_max_ms,
                    delay_follow_time_ms: 10.0,
                    feedback: 0.0,
                    pingpong: 0.0,
                    ..Default::default()
                }),
                position: Follower3::default(),
                amplitude: FollowerLinear::default(),
            })
            .collect();
        Self {
            header: PluginHeader::new("Spatializer"),
            config,
            channels,
            meters_input: Meters::default(),
            meters_output: Meters::default(),
        }
    }

    /// Jumps a source channel's followers to `start` and targets `end`,
    /// spanning exactly one block of `frames` at `samplerate`. Hosts that
    /// know both endpoints per block (game engines interpolating object
    /// positions) use this instead of letting the followers drift.
    pub fn set_ramps(
        &mut self,
        channel_count: usize,
        start: &[SpatializeChannelConfig],
        end: &[SpatializeChannelConfig],
        frames: usize,
        samplerate: u32,
    ) {
        self.config.target_follow_time_ms = samples_to_ms(frames as f32, samplerate as f32);
        self.config.num_src_channels_active = channel_count;
        for c in 0..channel_count.min(MAX_CHANNELS) {
            self.channels[c].position.jump(start[c].position);
            self.config.channels[c].position = end[c].position;
            self.channels[c].amplitude.jump(start[c].amplitude);
            self.config.channels[c].amplitude = end[c].amplitude;
        }
    }
}

fn filter_cutoff(delay_ms: f32, dot: f32) -> f32 {
    192000.0 / delay_ms.max(1.0) * (dot * 0.35 + 0.65)
}

/// `linstep` that tolerates a degenerate range (the top channels tying
/// exactly, e.g. a source dead behind a symmetric layout).
#[inline]
fn remap_amp(amp: f32, min: f32, max: f32) -> f32 {
    if max - min <= f32::EPSILON {
        if amp >= max { 1.0 } else { 0.0 }
    } else {
        linstep(amp, min, max)
    }
}

/// Presence flags over a destination layout, used to pick speaker angles.
#[derive(Default)]
struct LayoutPresence {
    front: bool,
    mid_front: bool,
    back: bool,
    side: bool,
    aerial: bool,
    sub: bool,
}

fn gather_presence(layout: &ChannelLayout) -> LayoutPresence {
    use ChannelPosition::*;
    let mut presence = LayoutPresence::default();
    for &position in layout.positions() {
        match position {
            FrontLeft | FrontCenter | FrontRight => presence.front = true,
            MidFrontLeft | MidFrontRight => presence.mid_front = true,
            Subwoofer => presence.sub = true,
            BackLeft | BackCenter | BackRight => presence.back = true,
            SideLeft | SideRight => presence.side = true,
            TopCenter => presence.aerial = true,
            TopFrontLeft | TopFrontCenter | TopFrontRight => {
                presence.front = true;
                presence.aerial = true;
            }
            TopBackLeft | TopBackCenter | TopBackRight => {
                presence.back = true;
                presence.aerial = true;
            }
            Unknown => {}
        }
    }
    presence
}

/// Unit vectors toward each speaker, adapted to which groups the layout
/// actually has, plus the non-sub channel count and aerial flag.
fn channel_metadata(layout: &ChannelLayout, vectors: &mut [Vec3; MAX_CHANNELS]) -> (usize, bool) {
    use ChannelPosition::*;
    let presence = gather_presence(layout);
    let non_sub = if presence.sub { layout.count() - 1 } else { layout.count() };
    // Angles relative to front center, signed per side below.
    let (mut front, mut mid_front, side, mut back) =
        (75.0f32, 30.0f32, 90.0f32, 130.0f32);
    if presence.front && presence.mid_front && presence.side && presence.back {
        // Standard 8 or 9 speaker layout.
        front = 60.0;
        back = 140.0;
    } else if presence.front && presence.side && presence.back {
        // Standard 6 or 7 speaker layout.
        front = 60.0;
        back = 140.0;
    } else if presence.front && presence.back {
        // Standard 4 or 5 speaker layout.
        front = 60.0;
        back = 115.0;
    } else if presence.front {
        // Standard 2 or 3 speaker layout.
        front = 75.0;
    } else if presence.back {
        // Weird, but we can work with it.
        back = 110.0;
    } else {
        // We're confused; just do anything sensible.
        front = 45.0;
        mid_front = 22.5;
        back = 120.0;
    }
    let radians = |deg: f32| deg.to_radians();
    for (i, &position) in layout.positions().iter().enumerate() {
        vectors[i] = match position {
            FrontLeft => Vec3::new((-radians(front)).sin(), 0.0, (-radians(front)).cos()),
            FrontCenter => Vec3::new(0.0, 0.0, 1.0),
            FrontRight => Vec3::new(radians(front).sin(), 0.0, radians(front).cos()),
            MidFrontLeft => Vec3::new((-radians(mid_front)).sin(), 0.0, (-radians(mid_front)).cos()),
            MidFrontRight => Vec3::new(radians(mid_front).sin(), 0.0, radians(mid_front).cos()),
            BackLeft => Vec3::new((-radians(back)).sin(), 0.0, (-radians(back)).cos()),
            BackCenter => Vec3::new(0.0, 0.0, -1.0),
            BackRight => Vec3::new(radians(back).sin(), 0.0, radians(back).cos()),
            SideLeft => Vec3::new((-radians(side)).sin(), 0.0, (-radians(side)).cos()),
            SideRight => Vec3::new(radians(side).sin(), 0.0, radians(side).cos()),
            TopCenter => Vec3::new(0.0, 1.0, 0.0),
            TopFrontLeft => {
                Vec3::new((-radians(front)).sin(), 1.0, (-radians(front)).cos()).normalized()
            }
            TopFrontCenter => Vec3::new(0.0, 1.0, 1.0).normalized(),
            TopFrontRight => {
                Vec3::new(radians(front).sin(), 1.0, radians(front).cos()).normalized()
            }
            TopBackLeft => {
                Vec3::new((-radians(back)).sin(), 1.0, (-radians(back)).cos()).normalized()
            }
            TopBackCenter => Vec3::new(0.0, 1.0, -1.0).normalized(),
            TopBackRight => Vec3::new(radians(back).sin(), 1.0, radians(back).cos()).normalized(),
            // Includes the subwoofer, which has no direction.
            Unknown | Subwoofer => continue,
        };
    }
    (non_sub, presence.aerial)
}

impl Spatialize {
    fn spatialize_into(
        &mut self,
        dst: &mut BufferMut,
        src: &BufferRef,
        flags: ProcessFlags,
    ) -> Result<()> {
        let world = self.config.world.clone();
        let default_world = World::default();
        let world: &World = world.as_deref().unwrap_or(&default_world);
        if world.speed_of_sound <= 0.0 {
            log::error!(
                "spatializer: speed of sound ({}) must be positive",
                world.speed_of_sound
            );
            return Err(Error::InvalidConfiguration);
        }
        let src_channels = if self.config.num_src_channels_active != 0 {
            src.channels().min(self.config.num_src_channels_active)
        } else {
            src.channels()
        };
        let dst_channels = dst.channels();
        let frames = dst.frames();
        let samplerate = dst.samplerate;

        let mut ear_normals = [Vec3::ZERO; MAX_CHANNELS];
        let (non_sub_channels, has_aerials) = channel_metadata(dst.layout(), &mut ear_normals);
        let channel_count_denominator = non_sub_channels.max(1) as f32;

        // Per-ear minimum keeps per-channel delays from going negative.
        let min_delay_ms = self.config.ear_distance / world.speed_of_sound * 1000.0;
        let buffer_len_ms = samples_to_ms(frames as f32, samplerate as f32);
        let follower_delta_t = buffer_len_ms / self.config.target_follow_time_ms.max(1e-3);
        let min_amp =
            if dst.layout().form_factor == FormFactor::Headphones { 0.5 } else { 0.0 };
        let ear_distance =
            if self.config.ear_distance > 0.0 { self.config.ear_distance } else { 0.085 };

        let mut side = push_scratch_zero(frames, 0, 0, dst_channels, samplerate);
        for src_c in 0..src_channels {
            side.as_mut().zero();
            let state = &mut self.channels[src_c];
            state.amplitude.set_target(self.config.channels[src_c].amplitude);
            state.position.set_target(self.config.channels[src_c].position);
            let pos_start = world.transform_point(state.position.update(follower_delta_t));
            let amp_start = state.amplitude.update(follower_delta_t);
            let pos_end = world.transform_point(state.position.value());
            let amp_end = state.amplitude.value();
            let delay_start_ms = pos_start.norm() / world.speed_of_sound * 1000.0;
            let delay_end_ms = pos_end.norm() / world.speed_of_sound * 1000.0;

            let mut avg_delay_start = min_delay_ms;
            let mut avg_delay_end = min_delay_ms;
            if self.config.do_doppler {
                avg_delay_start += delay_start_ms;
                avg_delay_end += delay_end_ms;
            }

            if dst_channels == 1 {
                // Nothing to pan; fade the amplitude in and run the chain.
                let src_channel = src.one_channel(src_c);
                side.as_mut().mix_fade_linear(1.0, 1.0, &src_channel, amp_start, amp_end);
                if self.config.do_filter {
                    state.filter.config.frequency = filter_cutoff(delay_start_ms, 1.0);
                    state.filter.process(&mut side.as_mut(), flags)?;
                }
                if self.config.do_doppler {
                    set_delay_ramps(
                        &mut state.delay,
                        1,
                        &[avg_delay_start],
                        &[avg_delay_end],
                        frames,
                        samplerate,
                    );
                    state.delay.process(&mut side.as_mut(), flags)?;
                }
                dst.mix(1.0, &side.as_ref(), 1.0);
                continue;
            }

            // Proximity blending: a source crossing close to the head leaks
            // into every channel.
            let mut all_channel_amp_start = 0.0;
            let mut all_channel_amp_end = 0.0;
            let norm_start = pos_start.norm();
            let src_normal_start = if norm_start < 0.5 {
                all_channel_amp_start = (0.5 - norm_start) * 2.0;
                pos_start
            } else {
                pos_start / norm_start
            };
            let norm_end = pos_end.norm();
            let src_normal_end = if norm_end < 0.5 {
                all_channel_amp_end = (0.5 - norm_end) * 2.0;
                pos_end
            } else {
                pos_end / norm_end
            };

            let mut weights_start = [ChannelWeight::default(); MAX_CHANNELS];
            let mut weights_end = [ChannelWeight::default(); MAX_CHANNELS];
            let mut total_magnitude_start = 0.0;
            let mut total_magnitude_end = 0.0;
            for i in 0..dst_channels {
                weights_start[i].channel = i;
                weights_end[i].channel = i;
                weights_start[i].dot = ear_normals[i].dot(src_normal_start);
                weights_end[i].dot = ear_normals[i].dot(src_normal_end);
                weights_start[i].amp = 0.5 * norm_start
                    + 0.5 * weights_start[i].dot
                    + all_channel_amp_start / channel_count_denominator;
                weights_end[i].amp = 0.5 * norm_end
                    + 0.5 * weights_end[i].dot
                    + all_channel_amp_end / channel_count_denominator;
                total_magnitude_start += weights_start[i].amp;
                total_magnitude_end += weights_end[i].amp;
            }

            // Use the minimum channels needed for surround by remapping the
            // amps so only the top two (or three, with aerials) stay
            // audible.
            if dst_channels > 2 {
                let min_channels = if dst_channels > 3 && has_aerials { 3 } else { 2 };
                weights_start[..dst_channels]
                    .sort_unstable_by(|a, b| b.amp.partial_cmp(&a.amp).unwrap());
                weights_end[..dst_channels]
                    .sort_unstable_by(|a, b| b.amp.partial_cmp(&a.amp).unwrap());
                let max_range_start = weights_start[0].amp;
                let max_range_end = weights_end[0].amp;
                let min_range_start = weights_start[min_channels - 1].amp;
                let min_range_end = weights_end[min_channels - 1].amp;
                total_magnitude_start = 0.0;
                total_magnitude_end = 0.0;
                for i in 0..dst_channels {
                    weights_start[i].amp = remap_amp(weights_start[i].amp, min_range_start, max_range_start)
                        + all_channel_amp_start / channel_count_denominator;
                    weights_end[i].amp = remap_amp(weights_end[i].amp, min_range_end, max_range_end)
                        + all_channel_amp_end / channel_count_denominator;
                    total_magnitude_start += weights_start[i].amp;
                    total_magnitude_end += weights_end[i].amp;
                }
                weights_start[..dst_channels].sort_unstable_by_key(|weight| weight.channel);
                weights_end[..dst_channels].sort_unstable_by_key(|weight| weight.channel);
            }

            // Fan the source channel into the side buffer at the blended
            // per-channel amps.
            let src_channel = src.one_channel(src_c);
            for c in 0..dst_channels {
                let mut amp_start = amp_start;
                let mut amp_end = amp_end;
                if dst.layout().position(c) != ChannelPosition::Subwoofer {
                    amp_start *= (weights_start[c].amp / total_magnitude_start) * (1.0 - min_amp)
                        + min_amp / channel_count_denominator;
                    amp_end *= (weights_end[c].amp / total_magnitude_end) * (1.0 - min_amp)
                        + min_amp / channel_count_denominator;
                }
                let mut side_view = side.as_mut();
                let mut side_channel = side_view.one_channel(c);
                side_channel.mix_fade_linear(1.0, 1.0, &src_channel, amp_start, amp_end);
            }

            if self.config.do_filter {
                if self.config.use_per_channel_filter {
                    for c in 0..dst_channels {
                        state.filter.config.channel_frequency_override[c] =
                            filter_cutoff(delay_start_ms, weights_start[c].dot);
                    }
                } else {
                    state.filter.config.frequency = filter_cutoff(avg_delay_start, 1.0);
                }
                state.filter.process(&mut side.as_mut(), flags)?;
            }

            if self.config.do_doppler || self.config.use_per_channel_delay {
                let mut start_delay = [0.0f32; MAX_CHANNELS];
                let mut end_delay = [0.0f32; MAX_CHANNELS];
                if self.config.use_per_channel_delay {
                    for c in 0..dst_channels {
                        let ear_pos = ear_normals[c] * ear_distance;
                        start_delay[c] = min_delay_ms
                            + (pos_start - ear_pos).norm() / world.speed_of_sound * 1000.0;
                        end_delay[c] = min_delay_ms
                            + (pos_end - ear_pos).norm() / world.speed_of_sound * 1000.0;
                    }
                } else {
                    start_delay[..dst_channels].fill(avg_delay_start);
                    end_delay[..dst_channels].fill(avg_delay_end);
                }
                set_delay_ramps(
                    &mut state.delay,
                    dst_channels,
                    &start_delay,
                    &end_delay,
                    frames,
                    samplerate,
                );
                state.delay.process(&mut side.as_mut(), flags)?;
            }

            dst.mix(1.0, &side.as_ref(), 1.0);
        }
        Ok(())
    }
}

impl Plugin for Spatialize {
    fn header(&self) -> &PluginHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut PluginHeader {
        &mut self.header
    }

    fn process(&mut self, buffer: &mut BufferMut, flags: ProcessFlags) -> Result<()> {
        if flags.contains(ProcessFlags::CUT) {
            self.reset();
        }
        buffer.check()?;
        if let Some((first, count)) = self.header.track_channels(buffer.channels()) {
            self.reset_channels(first, count);
        }
        if self.header.observed {
            self.meters_input.update(&buffer.as_ref(), 1.0);
        }
        // src and dst alias; copy the live source channels out, silence the
        // destination, and spatialize into it.
        let src_channels = if self.config.num_src_channels_active != 0 {
            buffer.channels().min(self.config.num_src_channels_active)
        } else {
            buffer.channels()
        };
        let mut source = push_scratch(buffer.frames(), 0, 0, src_channels, buffer.samplerate);
        for c in 0..src_channels {
            source.as_mut().copy_channel(c, &buffer.as_ref(), c);
        }
        buffer.zero();
        self.spatialize_into(buffer, &source.as_ref(), flags)?;
        drop(source);
        if self.header.observed {
            self.meters_output.update(&buffer.as_ref(), 1.0);
        }
        Ok(())
    }

    fn process_dual(
        &mut self,
        dst: &mut BufferMut,
        src: &BufferRef,
        flags: ProcessFlags,
    ) -> Result<()> {
        if flags.contains(ProcessFlags::CUT) {
            self.reset();
        }
        check_buffers(dst, src, true, false)?;
        if let Some((first, count)) = self.header.track_channels(dst.channels()) {
            self.reset_channels(first, count);
        }
        if self.header.observed {
            self.meters_input.update(src, 1.0);
        }
        let source = push_scratch_copy(src);
        dst.zero();
        self.spatialize_into(dst, &source.as_ref(), flags)?;
        drop(source);
        if self.header.observed {
            self.meters_output.update(&dst.as_ref(), 1.0);
        }
        Ok(())
    }

    fn get_specs(&self, samplerate: u32) -> PluginSpecs {
        if self.config.do_doppler || self.config.use_per_channel_delay {
            self.channels[0].delay.get_specs(samplerate)
        } else {
            PluginSpecs::default()
        }
    }

    fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.filter.reset();
            channel.delay.reset();
            let position = channel.position.value();
            channel.position.jump(position);
            let amplitude = channel.amplitude.value();
            channel.amplitude.jump(amplitude);
        }
        self.meters_input.reset();
        self.meters_output.reset();
    }

    fn reset_channels(&mut self, first: usize, count: usize) {
        for channel in &mut self.channels {
            channel.delay.reset_channels(first, count);
        }
        for c in first..(first + count).min(MAX_CHANNELS) {
            self.channels[c].filter.reset();
        }
        self.meters_input.reset_channels(first, count);
        self.meters_output.reset_channels(first, count);
    }
}
