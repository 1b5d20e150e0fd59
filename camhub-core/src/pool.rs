/*
 * Copyright 2025 The Camhub Contributors
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Fixed-capacity pool of image buffers shared between a backend's
//! acquisition thread and frame consumers.
//!
//! The pool is an arena of equal-size slots sized to the negotiated format.
//! Each slot moves through a single-owner transfer protocol enforced by the
//! API, never by convention:
//!
//! idle → leased ([`BufferLease`], exclusive write) → published
//! ([`MemoryBuffer`], shared read) → idle (last handle dropped)
//!
//! [`BufferPool::acquire`] never blocks on consumers: when no slot is idle,
//! the oldest published slot is revoked (its generation is bumped) and
//! reused, so acquisition favors continuity over frame completeness and a
//! slow consumer only ever loses its own frames. Handles that outlive a
//! revocation read back as [`CamhubError::BufferReclaimed`]; a slot whose
//! data is currently borrowed for read is skipped by revocation, so a reader
//! never races a refill.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::CamhubError;
use crate::types::VideoFormat;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Idle,
    Leased,
    Published,
}

struct Slot {
    data: Mutex<Vec<u8>>,
    // Mirrors the slot's metadata generation. Only written while the data
    // lock is held, so a reader that holds the lock sees the bump of any
    // revocation that preceded its read.
    generation: AtomicU64,
}

struct SlotMeta {
    state: SlotState,
    generation: u64,
    /// Live `MemoryBuffer` handles of the current generation.
    handles: usize,
    len: usize,
    frame_id: u64,
}

struct PoolInner {
    meta: Vec<SlotMeta>,
    idle: VecDeque<usize>,
    /// Published slots in publish order; the front is the oldest and the
    /// first revocation candidate.
    published: VecDeque<usize>,
    next_frame_id: u64,
    revoked: u64,
}

struct PoolShared {
    format: VideoFormat,
    slot_size: usize,
    slots: Vec<Slot>,
    inner: Mutex<PoolInner>,
}

/// Occupancy counters of a [`BufferPool`].
///
/// `idle + leased + published` always equals `capacity`; the slot count is
/// constant for the life of a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    pub published: usize,
    /// Total revocations since the pool was created.
    pub revoked: u64,
}

/// Fixed-capacity arena of image buffers. Cheap to clone; all clones share
/// the same slots.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool of `capacity` slots, each sized to the worst-case
    /// frame size of `format`.
    #[must_use]
    pub fn new(format: VideoFormat, capacity: usize) -> Self {
        let slot_size = format.frame_size();
        let slots = (0..capacity)
            .map(|_| Slot {
                data: Mutex::new(vec![0u8; slot_size]),
                generation: AtomicU64::new(0),
            })
            .collect();
        let meta = (0..capacity)
            .map(|_| SlotMeta {
                state: SlotState::Idle,
                generation: 0,
                handles: 0,
                len: 0,
                frame_id: 0,
            })
            .collect();
        BufferPool {
            shared: Arc::new(PoolShared {
                format,
                slot_size,
                slots,
                inner: Mutex::new(PoolInner {
                    meta,
                    idle: (0..capacity).collect(),
                    published: VecDeque::new(),
                    next_frame_id: 0,
                    revoked: 0,
                }),
            }),
        }
    }

    /// Takes an exclusive write lease on a slot. Non-blocking: prefers an
    /// idle slot, otherwise revokes the oldest published slot that is not
    /// currently borrowed for read. Returns `None` only when every slot is
    /// leased or under an active read borrow.
    #[must_use]
    pub fn acquire(&self) -> Option<BufferLease> {
        let mut inner = self.shared.inner.lock();

        if let Some(slot) = inner.idle.pop_front() {
            inner.meta[slot].state = SlotState::Leased;
            let generation = inner.meta[slot].generation;
            return Some(BufferLease {
                pool: Arc::clone(&self.shared),
                slot,
                generation,
                len: 0,
                published: false,
            });
        }

        let picked = inner.published.iter().enumerate().find_map(|(pos, &slot)| {
            self.shared.slots[slot]
                .data
                .try_lock()
                .map(|guard| (pos, slot, guard))
        });
        let (pos, slot, _data_guard) = picked?;
        inner.published.remove(pos);
        inner.revoked += 1;
        let meta = &mut inner.meta[slot];
        meta.generation += 1;
        meta.state = SlotState::Leased;
        meta.handles = 0;
        meta.len = 0;
        // Published while the data lock is held; stale readers see the bump.
        self.shared.slots[slot]
            .generation
            .store(meta.generation, Ordering::Release);
        let generation = meta.generation;
        Some(BufferLease {
            pool: Arc::clone(&self.shared),
            slot,
            generation,
            len: 0,
            published: false,
        })
    }

    /// The format this pool was sized for.
    #[must_use]
    pub fn format(&self) -> VideoFormat {
        self.shared.format
    }

    /// Byte capacity of each slot.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        let capacity = self.shared.slots.len();
        let idle = inner.idle.len();
        let published = inner.published.len();
        PoolStats {
            capacity,
            idle,
            leased: capacity - idle - published,
            published,
            revoked: inner.revoked,
        }
    }
}

impl Debug for BufferPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("format", &self.shared.format)
            .field("capacity", &self.shared.slots.len())
            .finish()
    }
}

/// Exclusive write access to one pool slot.
///
/// Filled by the acquisition path, then turned into a shared-read
/// [`MemoryBuffer`] with [`publish`](Self::publish). Dropping an unpublished
/// lease returns the slot to the idle set untouched.
pub struct BufferLease {
    pool: Arc<PoolShared>,
    slot: usize,
    generation: u64,
    len: usize,
    published: bool,
}

impl BufferLease {
    /// Byte capacity of the leased slot.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.slot_size
    }

    #[must_use]
    pub fn format(&self) -> VideoFormat {
        self.pool.format
    }

    /// Copies `data` into the slot and records it as the valid length.
    pub fn write(&mut self, data: &[u8]) -> Result<(), CamhubError> {
        if data.len() > self.pool.slot_size {
            return Err(CamhubError::Unsupported(format!(
                "frame of {} bytes exceeds slot capacity {}",
                data.len(),
                self.pool.slot_size
            )));
        }
        let mut guard = self.pool.slots[self.slot].data.lock();
        guard[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// Fills the slot in place. `fill` receives the whole slot and returns
    /// the number of valid bytes it produced.
    pub fn fill_with(&mut self, fill: impl FnOnce(&mut [u8]) -> usize) {
        let mut guard = self.pool.slots[self.slot].data.lock();
        let len = fill(&mut guard);
        self.len = len.min(self.pool.slot_size);
    }

    /// Publishes the filled slot, transferring it to shared-read ownership.
    /// The frame id is assigned here, from a single per-pool counter, so ids
    /// are strictly increasing in publish order.
    #[must_use]
    pub fn publish(mut self, timestamp: SystemTime) -> MemoryBuffer {
        let mut inner = self.pool.inner.lock();
        let frame_id = inner.next_frame_id;
        inner.next_frame_id += 1;
        let meta = &mut inner.meta[self.slot];
        meta.state = SlotState::Published;
        meta.handles = 1;
        meta.len = self.len;
        meta.frame_id = frame_id;
        inner.published.push_back(self.slot);
        drop(inner);
        self.published = true;
        MemoryBuffer {
            pool: Arc::clone(&self.pool),
            slot: self.slot,
            generation: self.generation,
            len: self.len,
            format: self.pool.format,
            frame_id,
            timestamp,
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        let mut inner = self.pool.inner.lock();
        inner.meta[self.slot].state = SlotState::Idle;
        inner.idle.push_back(self.slot);
    }
}

impl Debug for BufferLease {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

/// Shared read handle to one published frame.
///
/// Clones share the slot; the slot returns to the idle set when the last
/// clone drops. The frame id, timestamp, and length are recorded at publish
/// time and stay readable even after the pool revokes the slot, but data
/// access on a revoked handle fails with [`CamhubError::BufferReclaimed`].
pub struct MemoryBuffer {
    pool: Arc<PoolShared>,
    slot: usize,
    generation: u64,
    len: usize,
    format: VideoFormat,
    frame_id: u64,
    timestamp: SystemTime,
}

impl MemoryBuffer {
    /// Valid payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn format(&self) -> VideoFormat {
        self.format
    }

    /// Strictly increasing per stream, assigned at publish.
    #[must_use]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Whether the pool has revoked this frame's slot.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.pool.slots[self.slot].generation.load(Ordering::Acquire) != self.generation
    }

    /// Borrows the frame data for the duration of `read`. The slot cannot be
    /// revoked while the borrow is held.
    pub fn with_data<R>(&self, read: impl FnOnce(&[u8]) -> R) -> Result<R, CamhubError> {
        let guard = self.pool.slots[self.slot].data.lock();
        if self.pool.slots[self.slot].generation.load(Ordering::Acquire) != self.generation {
            return Err(CamhubError::BufferReclaimed);
        }
        Ok(read(&guard[..self.len]))
    }

    /// Copies the frame out into an owned [`Bytes`]. This is how a sink
    /// keeps a frame past its callback.
    pub fn copy_to_bytes(&self) -> Result<Bytes, CamhubError> {
        self.with_data(Bytes::copy_from_slice)
    }
}

impl Clone for MemoryBuffer {
    fn clone(&self) -> Self {
        let mut inner = self.pool.inner.lock();
        let meta = &mut inner.meta[self.slot];
        if meta.generation == self.generation {
            meta.handles += 1;
        }
        drop(inner);
        MemoryBuffer {
            pool: Arc::clone(&self.pool),
            slot: self.slot,
            generation: self.generation,
            len: self.len,
            format: self.format,
            frame_id: self.frame_id,
            timestamp: self.timestamp,
        }
    }
}

impl Drop for MemoryBuffer {
    fn drop(&mut self) {
        let mut inner = self.pool.inner.lock();
        let meta = &mut inner.meta[self.slot];
        if meta.generation != self.generation {
            // Revoked while we held the handle; the slot was reused already.
            return;
        }
        meta.handles = meta.handles.saturating_sub(1);
        if meta.handles == 0 && meta.state == SlotState::Published {
            meta.state = SlotState::Idle;
            let slot = self.slot;
            if let Some(pos) = inner.published.iter().position(|&s| s == slot) {
                inner.published.remove(pos);
            }
            inner.idle.push_back(slot);
        }
    }
}

impl Debug for MemoryBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("slot", &self.slot)
            .field("frame_id", &self.frame_id)
            .field("len", &self.len)
            .field("format", &self.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelEncoding;

    fn make_pool(capacity: usize) -> BufferPool {
        BufferPool::new(
            VideoFormat::new(PixelEncoding::Mono8, 8, 8, 30),
            capacity,
        )
    }

    fn publish_frame(pool: &BufferPool, byte: u8) -> MemoryBuffer {
        let mut lease = pool.acquire().unwrap();
        lease.fill_with(|buf| {
            buf.fill(byte);
            buf.len()
        });
        lease.publish(SystemTime::now())
    }

    fn assert_conserved(pool: &BufferPool) {
        let stats = pool.stats();
        assert_eq!(stats.idle + stats.leased + stats.published, stats.capacity);
    }

    #[test]
    fn slot_count_is_conserved_through_the_lifecycle() {
        let pool = make_pool(4);
        assert_conserved(&pool);

        let lease = pool.acquire().unwrap();
        assert_eq!(pool.stats().leased, 1);
        assert_conserved(&pool);

        let frame = lease.publish(SystemTime::now());
        assert_eq!(pool.stats().published, 1);
        assert_conserved(&pool);

        let clone = frame.clone();
        drop(frame);
        assert_eq!(pool.stats().published, 1);
        assert_conserved(&pool);

        drop(clone);
        assert_eq!(pool.stats().idle, 4);
        assert_conserved(&pool);
    }

    #[test]
    fn abandoned_lease_returns_to_idle() {
        let pool = make_pool(2);
        let lease = pool.acquire().unwrap();
        drop(lease);
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn frame_ids_increase_in_publish_order() {
        let pool = make_pool(3);
        let a = publish_frame(&pool, 1);
        let b = publish_frame(&pool, 2);
        let c = publish_frame(&pool, 3);
        assert!(a.frame_id() < b.frame_id());
        assert!(b.frame_id() < c.frame_id());
    }

    #[test]
    fn exhaustion_revokes_the_oldest_published_frame() {
        let pool = make_pool(2);
        let oldest = publish_frame(&pool, 1);
        let newer = publish_frame(&pool, 2);
        assert_eq!(pool.stats().idle, 0);

        // No idle slot left: the oldest published frame loses its slot.
        let lease = pool.acquire().unwrap();
        assert!(oldest.is_stale());
        assert!(!newer.is_stale());
        assert_eq!(oldest.with_data(|_| ()), Err(CamhubError::BufferReclaimed));
        assert_eq!(oldest.copy_to_bytes(), Err(CamhubError::BufferReclaimed));
        assert_eq!(pool.stats().revoked, 1);
        assert_conserved(&pool);

        // The stale handle's drop must not disturb the reused slot.
        drop(oldest);
        assert_conserved(&pool);
        drop(lease);
        drop(newer);
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn acquire_returns_none_when_every_slot_is_leased() {
        let pool = make_pool(1);
        let _lease = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn active_read_borrow_blocks_revocation() {
        let pool = make_pool(1);
        let frame = publish_frame(&pool, 7);
        let inside = frame
            .with_data(|data| {
                assert_eq!(data[0], 7);
                // The only candidate slot is borrowed for read right now.
                pool.acquire().is_none()
            })
            .unwrap();
        assert!(inside);
        // Borrow released: revocation may proceed again.
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn data_written_is_data_read() {
        let pool = make_pool(2);
        let mut lease = pool.acquire().unwrap();
        lease.write(&[1, 2, 3]).unwrap();
        let frame = lease.publish(SystemTime::now());
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.copy_to_bytes().unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let pool = make_pool(1);
        let mut lease = pool.acquire().unwrap();
        let too_big = vec![0u8; pool.slot_size() + 1];
        assert!(lease.write(&too_big).is_err());
    }
}
