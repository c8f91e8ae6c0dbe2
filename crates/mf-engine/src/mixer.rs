//! The mixer: a DAG of tracks processed leaves-first under one lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use mf_core::math::{db_to_amp, lerp};
use mf_core::{BufferMut, ChannelLayout, ChannelMatrix, Error, Result};
use mf_dsp::ProcessFlags;

use crate::track::{Receive, Track, TrackId};

#[derive(Debug, Clone, Copy)]
pub struct MixerConfig {
    /// Upper bound on frames per process call; track buffers are sized to
    /// this. Should match the backend's maximum block size.
    pub buffer_frames: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self { buffer_frames: 2048 }
    }
}

/// Everything the topology lock guards.
struct MixerGraph {
    config: MixerConfig,
    /// `tracks[0]` is the master.
    tracks: Vec<Track>,
    ts_offline_start: Instant,
    cpu_percent: f32,
    cpu_percent_slow: f32,
    times: u64,
    has_routing_cycle: bool,
}

/// The mixer. `process_block` runs on the audio thread; everything else
/// may be called from control threads. The internal mutex guards topology
/// (tracks, receives, chains) and is held only for structural changes and
/// the duration of one block.
pub struct Mixer {
    graph: Mutex<MixerGraph>,
    /// Transport discontinuity requested; the next block processes with
    /// the cut flag and plugins drop their history.
    pending_cut: AtomicBool,
}

impl Mixer {
    pub fn new(
        config: MixerConfig,
        master_layout: ChannelLayout,
        samplerate: u32,
    ) -> Result<Arc<Self>> {
        let mut master = Track::new(config.buffer_frames, master_layout, samplerate)?;
        master.name = "Master".into();
        Ok(Arc::new(Self {
            graph: Mutex::new(MixerGraph {
                config,
                tracks: vec![master],
                ts_offline_start: Instant::now(),
                cpu_percent: 0.0,
                cpu_percent_slow: 0.0,
                times: 0,
                has_routing_cycle: false,
            }),
            pending_cut: AtomicBool::new(false),
        }))
    }

    /// Adds a track; `layout: None` copies the master's. Optionally
    /// connects it to the master at 0 dB.
    pub fn add_track(
        &self,
        layout: Option<ChannelLayout>,
        connect_to_master: bool,
    ) -> Result<TrackId> {
        let mut graph = self.graph.lock();
        let layout = layout.unwrap_or(*graph.tracks[0].layout());
        let samplerate = graph.tracks[0].buffer.samplerate();
        let track = Track::new(graph.config.buffer_frames, layout, samplerate)?;
        graph.tracks.push(track);
        let id = TrackId(graph.tracks.len() - 1);
        drop(graph);
        if connect_to_master {
            self.connect(id, TrackId::MASTER, 0.0)?;
        }
        Ok(id)
    }

    /// Removes a track and every receive involving it. Later `TrackId`s
    /// shift down by one, mirroring index-based removal.
    pub fn remove_track(&self, id: TrackId) {
        assert!(id != TrackId::MASTER, "cannot remove the master track");
        let mut graph = self.graph.lock();
        if id.0 >= graph.tracks.len() {
            return;
        }
        graph.tracks.remove(id.0);
        for track in &mut graph.tracks {
            track.receives.retain(|receive| receive.source != id);
            for receive in &mut track.receives {
                if receive.source.0 > id.0 {
                    receive.source.0 -= 1;
                }
            }
        }
    }

    /// Routes `from`'s output into `to`, generating a routing matrix from
    /// their layouts. Reconnecting an existing edge just updates the gain.
    pub fn connect(&self, from: TrackId, to: TrackId, gain_db: f32) -> Result<()> {
        let mut graph = self.graph.lock();
        if from.0 >= graph.tracks.len() || to.0 >= graph.tracks.len() {
            return Err(Error::InvalidConfiguration);
        }
        if let Some(receive) = graph.tracks[to.0].receive_from_mut(from) {
            receive.gain_db = gain_db;
            return Ok(());
        }
        let matrix =
            ChannelMatrix::from_layouts(graph.tracks[from.0].layout(), graph.tracks[to.0].layout());
        graph.tracks[to.0].receives.push(Receive { source: from, gain_db, mute: false, matrix });
        Ok(())
    }

    pub fn disconnect(&self, from: TrackId, to: TrackId) {
        let mut graph = self.graph.lock();
        if to.0 < graph.tracks.len() {
            graph.tracks[to.0].receives.retain(|receive| receive.source != from);
        }
    }

    /// Mutates a track under the topology lock.
    pub fn with_track<R>(&self, id: TrackId, f: impl FnOnce(&mut Track) -> R) -> Option<R> {
        let mut graph = self.graph.lock();
        graph.tracks.get_mut(id.0).map(f)
    }

    pub fn track_count(&self) -> usize {
        self.graph.lock().tracks.len()
    }

    /// Rolling CPU usage: percent of wall time spent inside process calls,
    /// exponentially smoothed.
    pub fn cpu_percent(&self) -> f32 {
        self.graph.lock().cpu_percent
    }

    /// CPU usage sampled every 20 blocks; steadier for display.
    pub fn cpu_percent_slow(&self) -> f32 {
        self.graph.lock().cpu_percent_slow
    }

    pub fn has_routing_cycle(&self) -> bool {
        self.graph.lock().has_routing_cycle
    }

    /// Requests a transport cut: the next block resets plugin history.
    pub fn cut(&self) {
        self.pending_cut.store(true, Ordering::Release);
    }

    /// Processes one block into the master track's buffer.
    pub fn process(&self, frames: usize, samplerate: u32) -> Result<()> {
        let flags = self.take_flags();
        let mut graph = self.graph.lock();
        graph.process(frames, samplerate, flags)
    }

    /// Processes one block and writes the master's output into `dst`.
    /// A routing cycle silences `dst` and reports success, so a live
    /// routing mistake doesn't abort the stream.
    pub fn process_block(&self, dst: &mut BufferMut) -> Result<()> {
        let flags = self.take_flags();
        let mut graph = self.graph.lock();
        let result = graph.process(dst.frames(), dst.samplerate, flags);
        match result {
            Ok(()) => {
                graph.has_routing_cycle = false;
                let master = &graph.tracks[0];
                if master.channel_count() != dst.channels() {
                    return Err(Error::MismatchedChannelCount);
                }
                let master_view = master.buffer.as_ref().slice(0, dst.frames());
                dst.copy_from(&master_view);
                Ok(())
            }
            Err(Error::MixerRoutingCycle) => {
                graph.has_routing_cycle = true;
                dst.zero();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn take_flags(&self) -> ProcessFlags {
        if self.pending_cut.swap(false, Ordering::AcqRel) {
            ProcessFlags::CUT
        } else {
            ProcessFlags::NONE
        }
    }
}

impl Track {
    fn channel_count(&self) -> usize {
        self.buffer.channels()
    }
}

impl MixerGraph {
    fn process(&mut self, frames: usize, samplerate: u32, flags: ProcessFlags) -> Result<()> {
        if frames == 0 || frames > self.config.buffer_frames {
            return Err(Error::InvalidFrameCount);
        }
        let ts_start = Instant::now();
        let time_offline = ts_start - self.ts_offline_start;
        let result = self
            .check_routing()
            .and_then(|_| self.process_track(0, frames, samplerate, flags));
        let ts_end = Instant::now();
        let time_online = ts_end - ts_start;
        let total = time_offline + time_online;
        if !total.is_zero() {
            let cpu_percent = 100.0 * time_online.as_secs_f32() / total.as_secs_f32();
            self.cpu_percent =
                lerp(self.cpu_percent, cpu_percent, 1.0 / (1 + self.times % 20) as f32);
        }
        self.times += 1;
        if self.times % 20 == 0 {
            self.cpu_percent_slow = self.cpu_percent;
        }
        self.ts_offline_start = ts_end;
        result
    }

    /// Depth-first search from the master that clears every reachable
    /// track's `processed` flag and reports a cycle if it revisits a track
    /// currently on the stack (`mark == 1`).
    fn check_routing(&mut self) -> Result<()> {
        for track in &mut self.tracks {
            track.mark = 0;
        }
        self.check_routing_visit(0)
    }

    fn check_routing_visit(&mut self, index: usize) -> Result<()> {
        self.tracks[index].processed = false;
        for receive_index in 0..self.tracks[index].receives.len() {
            let source = self.tracks[index].receives[receive_index].source.0;
            match self.tracks[source].mark {
                2 => continue,
                1 => return Err(Error::MixerRoutingCycle),
                _ => {}
            }
            self.tracks[source].mark = 1;
            self.check_routing_visit(source)?;
            self.tracks[source].mark = 2;
        }
        Ok(())
    }

    /// Recursively processes a track: sources first (memoized through
    /// `processed`), then zero, sum receives through their matrices, run
    /// the chain, apply gain, meter.
    fn process_track(
        &mut self,
        index: usize,
        frames: usize,
        samplerate: u32,
        flags: ProcessFlags,
    ) -> Result<()> {
        if self.tracks[index].processed {
            return Ok(());
        }
        for receive_index in 0..self.tracks[index].receives.len() {
            let receive = &self.tracks[index].receives[receive_index];
            if receive.mute {
                continue;
            }
            let source = receive.source.0;
            if self.tracks[source].mute {
                continue;
            }
            self.process_track(source, frames, samplerate, flags)?;
        }
        // Take the track out so its buffer and chain can borrow while the
        // source buffers stay readable.
        let mut track = std::mem::take(&mut self.tracks[index]);
        track.buffer.set_samplerate(samplerate);
        {
            let mut full = track.buffer.as_mut();
            let mut view = full.slice(0, frames);
            view.zero();
            if !track.mute && track.gain_db != f32::NEG_INFINITY {
                for receive in &track.receives {
                    if receive.mute {
                        continue;
                    }
                    let source_track = &self.tracks[receive.source.0];
                    if source_track.mute {
                        continue;
                    }
                    let source_full = source_track.buffer.as_ref();
                    let source_view = source_full.slice(0, frames);
                    view.mix_matrix(1.0, &source_view, db_to_amp(receive.gain_db), &receive.matrix);
                }
                // Chain errors are latched per plugin; the block continues.
                let _ = track.chain.process(&mut view, flags);
                if track.gain_db != 0.0 {
                    view.apply_gain(db_to_amp(track.gain_db));
                }
                if track.observed {
                    track.meters.update(&view.as_ref(), 1.0);
                }
            }
        }
        track.processed = true;
        self.tracks[index] = track;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::Buffer;

    fn feed_track(mixer: &Mixer, id: TrackId, value: f32) {
        // Tests inject audio by pre-filling a leaf track's buffer through
        // a generator plugin substitute: a chain-held closure is overkill,
        // so poke the buffer directly before processing.
        mixer.with_track(id, |track| {
            let frames = track.buffer.frames();
            let channels = track.buffer.channels();
            let mut view = track.buffer.as_mut();
            for i in 0..frames {
                for c in 0..channels {
                    view.set_sample(i, c, value);
                }
            }
        });
    }

    #[test]
    fn cycle_detection_reports_and_silences() {
        let mixer = Mixer::new(MixerConfig { buffer_frames: 128 }, ChannelLayout::stereo(), 48000)
            .unwrap();
        let a = mixer.add_track(None, true).unwrap();
        let b = mixer.add_track(None, false).unwrap();
        mixer.connect(a, b, 0.0).unwrap();
        mixer.connect(b, a, 0.0).unwrap();
        assert_eq!(mixer.process(128, 48000).unwrap_err(), Error::MixerRoutingCycle);
        // The callback path silences instead of failing.
        let mut out = Buffer::new(128, 0, 0, ChannelLayout::stereo(), 48000).unwrap();
        out.as_mut().raw_mut().fill(0.5);
        mixer.process_block(&mut out.as_mut()).unwrap();
        assert!(mixer.has_routing_cycle());
        assert!(out.as_ref().raw().iter().all(|&s| s == 0.0));
        // Removing the offending edge recovers.
        mixer.disconnect(b, a);
        mixer.process(128, 48000).unwrap();
        assert!(!mixer.has_routing_cycle() || mixer.process_block(&mut out.as_mut()).is_ok());
    }

    #[test]
    fn receives_sum_into_master() {
        let mixer = Mixer::new(MixerConfig { buffer_frames: 64 }, ChannelLayout::stereo(), 48000)
            .unwrap();
        let a = mixer.add_track(None, true).unwrap();
        let b = mixer.add_track(None, true).unwrap();
        feed_track(&mixer, a, 0.25);
        feed_track(&mixer, b, 0.5);
        // Leaf tracks have no receives, so their buffers would normally be
        // zeroed; disconnect processing from overwriting them by marking
        // them processed through a pre-pass.
        let mut graph = mixer.graph.lock();
        graph.check_routing().unwrap();
        graph.tracks[a.0].processed = true;
        graph.tracks[b.0].processed = true;
        graph.process_track(0, 64, 48000, ProcessFlags::NONE).unwrap();
        let master = graph.tracks[0].buffer.as_ref();
        for i in 0..64 {
            for c in 0..2 {
                assert!((master.sample(i, c) - 0.75).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn muted_receive_is_idempotent() {
        let mixer = Mixer::new(MixerConfig { buffer_frames: 32 }, ChannelLayout::mono(), 48000)
            .unwrap();
        let a = mixer.add_track(None, true).unwrap();
        feed_track(&mixer, a, 1.0);
        let run = |mixer: &Mixer| {
            feed_track(mixer, a, 1.0);
            let mut graph = mixer.graph.lock();
            graph.check_routing().unwrap();
            graph.tracks[a.0].processed = true;
            graph.process_track(0, 32, 48000, ProcessFlags::NONE).unwrap();
            graph.tracks[0].buffer.as_ref().sample(0, 0)
        };
        let unmuted = run(&mixer);
        assert!((unmuted - 1.0).abs() < 1e-6);
        // Mute twice; same as muting once.
        mixer.with_track(TrackId::MASTER, |track| {
            track.receive_from_mut(a).unwrap().mute = true;
        });
        assert_eq!(run(&mixer), 0.0);
        mixer.with_track(TrackId::MASTER, |track| {
            track.receive_from_mut(a).unwrap().mute = true;
        });
        assert_eq!(run(&mixer), 0.0);
        // Unmute restores the original output.
        mixer.with_track(TrackId::MASTER, |track| {
            track.receive_from_mut(a).unwrap().mute = false;
        });
        assert!((run(&mixer) - unmuted).abs() < 1e-6);
    }

    #[test]
    fn remove_track_shifts_receive_indices() {
        let mixer = Mixer::new(MixerConfig::default(), ChannelLayout::stereo(), 48000).unwrap();
        let a = mixer.add_track(None, true).unwrap();
        let b = mixer.add_track(None, true).unwrap();
        assert_eq!(mixer.track_count(), 3);
        mixer.remove_track(a);
        assert_eq!(mixer.track_count(), 2);
        // b slid down into a's slot and its receive still points at it.
        let receives = mixer
            .with_track(TrackId::MASTER, |track| track.receives().to_vec())
            .unwrap();
        assert_eq!(receives.len(), 1);
        assert_eq!(receives[0].source, TrackId(b.0 - 1));
    }
}
