//! Thread-local scratch buffer stack.
//!
//! DSP processing frequently needs a temporary buffer. Allocating on the
//! audio thread is off the table, so each thread keeps a small stack of
//! reusable buffers that grows lazily during the first few callbacks and
//! never shrinks for the life of the stream. Acquisition returns a guard
//! that pushes the buffer back on drop; guards must drop in LIFO order,
//! which scoped use gives for free.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

use crate::buffer::{Buffer, BufferRef};
use crate::channel::ChannelLayout;

/// Upper bound on simultaneously-held scratch buffers per thread.
pub const MAX_SCRATCH_BUFFERS: usize = 64;

struct ScratchStack {
    slots: Vec<Option<Buffer>>,
    in_use: usize,
}

impl ScratchStack {
    const fn new() -> Self {
        Self { slots: Vec::new(), in_use: 0 }
    }
}

thread_local! {
    static SCRATCH: RefCell<ScratchStack> = const { RefCell::new(ScratchStack::new()) };
}

/// A scratch buffer checked out of the thread-local pool. Derefs to
/// `Buffer`; returns itself to the pool on drop.
pub struct ScratchBuffer {
    buffer: Option<Buffer>,
    slot: usize,
}

impl Deref for ScratchBuffer {
    type Target = Buffer;
    #[inline]
    fn deref(&self) -> &Buffer {
        self.buffer.as_ref().unwrap()
    }
}

impl DerefMut for ScratchBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer.as_mut().unwrap()
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        let buffer = self.buffer.take().unwrap();
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            assert_eq!(self.slot + 1, scratch.in_use, "scratch buffers must pop in LIFO order");
            scratch.slots[self.slot] = Some(buffer);
            scratch.in_use -= 1;
        });
    }
}

/// Checks a buffer of at least the requested dimensions out of the pool,
/// growing the slot's capacity if this is the biggest request it has seen.
/// Contents are unspecified; use `push_scratch_zero` for a cleared buffer.
pub fn push_scratch(
    frames: usize,
    leading: usize,
    trailing: usize,
    channels: usize,
    samplerate: u32,
) -> ScratchBuffer {
    SCRATCH.with(|scratch| {
        let mut scratch = scratch.borrow_mut();
        assert!(scratch.in_use < MAX_SCRATCH_BUFFERS, "scratch buffer stack overflow");
        let slot = scratch.in_use;
        if scratch.slots.len() <= slot {
            scratch.slots.resize_with(slot + 1, || None);
        }
        let layout = ChannelLayout::standard(channels as u8);
        let mut buffer = scratch.slots[slot].take().unwrap_or_default();
        buffer.reshape(frames, leading, trailing, layout, samplerate).expect("scratch reshape");
        scratch.in_use += 1;
        ScratchBuffer { buffer: Some(buffer), slot }
    })
}

/// Like `push_scratch` but zeroed.
pub fn push_scratch_zero(
    frames: usize,
    leading: usize,
    trailing: usize,
    channels: usize,
    samplerate: u32,
) -> ScratchBuffer {
    let mut buffer = push_scratch(frames, leading, trailing, channels, samplerate);
    buffer.zero();
    buffer
}

/// A scratch copy of `src` (body and guards).
pub fn push_scratch_copy(src: &BufferRef) -> ScratchBuffer {
    let mut buffer =
        push_scratch(src.frames(), src.leading(), src.trailing(), src.channels(), src.samplerate);
    buffer.as_mut().extended().copy_from(&src.extended());
    buffer
}
