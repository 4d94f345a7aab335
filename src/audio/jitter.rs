//! Re-chunks network-sized PCM fragments into fixed-duration playback blocks.
//!
//! Fragments are queued in arrival order; whenever enough bytes are queued,
//! exactly one block of `block_bytes` is assembled from the head, splitting
//! the head fragment when the block boundary falls inside it.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;

use super::codec::{BYTES_PER_SAMPLE, PcmFrame};
use crate::error::{AudioError, Result};

/// Target playback block duration.
pub const TARGET_BLOCK_DURATION: Duration = Duration::from_millis(100);

/// Smallest block the buffer will ever assemble.
pub const MIN_BLOCK_BYTES: usize = 256;

/// Block size in bytes for a sample rate and duration: sample-aligned,
/// rounded down, never below `MIN_BLOCK_BYTES`.
pub fn target_block_bytes(sample_rate: u32, duration: Duration) -> usize {
    let samples = (f64::from(sample_rate) * duration.as_secs_f64()) as usize;
    align_block_bytes(samples * BYTES_PER_SAMPLE)
}

fn align_block_bytes(bytes: usize) -> usize {
    (bytes & !1).max(MIN_BLOCK_BYTES)
}

/// One fixed-size unit handed to the playback scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackBlock {
    /// Assembly order within the session, starting at 0.
    pub seq: u64,
    pub frame: PcmFrame,
}

impl PlaybackBlock {
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }
}

#[derive(Debug)]
pub struct JitterBuffer {
    fragments: VecDeque<Bytes>,
    queued: usize,
    block_bytes: usize,
    next_seq: u64,
}

impl JitterBuffer {
    /// Buffer sized for `TARGET_BLOCK_DURATION` at the playback rate.
    pub fn new(sample_rate: u32) -> Self {
        Self::with_block_bytes(target_block_bytes(sample_rate, TARGET_BLOCK_DURATION))
    }

    /// Explicit block size; aligned and floored like computed sizes.
    pub fn with_block_bytes(block_bytes: usize) -> Self {
        Self {
            fragments: VecDeque::new(),
            queued: 0,
            block_bytes: align_block_bytes(block_bytes),
            next_seq: 0,
        }
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    /// Bytes currently queued and not yet assembled into a block.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Whether a full block can be assembled right now.
    pub fn has_block(&self) -> bool {
        self.queued >= self.block_bytes
    }

    /// Queue an inbound fragment. Empty or odd-length fragments are refused
    /// and leave the queue exactly as it was.
    pub fn push(&mut self, fragment: impl Into<Bytes>) -> Result<()> {
        let fragment = fragment.into();
        if fragment.is_empty() || fragment.len() % BYTES_PER_SAMPLE != 0 {
            return Err(AudioError::Alignment {
                len: fragment.len(),
            });
        }
        self.queued += fragment.len();
        self.fragments.push_back(fragment);
        Ok(())
    }

    /// Assemble the next full block, if enough bytes are queued.
    pub fn pop_block(&mut self) -> Option<PlaybackBlock> {
        if !self.has_block() {
            return None;
        }

        let bytes = self.take_exact(self.block_bytes);
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(PlaybackBlock {
            seq,
            frame: PcmFrame::from_aligned(bytes),
        })
    }

    /// Discard everything queued. Returns the number of bytes dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queued;
        self.fragments.clear();
        self.queued = 0;
        dropped
    }

    /// Caller guarantees `self.queued >= want`.
    fn take_exact(&mut self, want: usize) -> Bytes {
        // A head fragment of exactly the right size is handed over without copying
        if let Some(head) = self.fragments.front() {
            if head.len() == want {
                self.queued -= want;
                return self.fragments.pop_front().unwrap_or_default();
            }
        }

        let mut block = BytesMut::with_capacity(want);
        while block.len() < want {
            let Some(head) = self.fragments.front_mut() else {
                break;
            };
            let needed = want - block.len();
            if head.len() > needed {
                // Boundary falls inside the head; keep the remainder in place
                let part = head.split_to(needed);
                block.extend_from_slice(&part);
            } else if let Some(whole) = self.fragments.pop_front() {
                block.extend_from_slice(&whole);
            }
        }
        self.queued -= block.len();
        block.freeze()
    }
}
