//! Per-node shared-memory segment holding the inbound queues
//!
//! Every node owns one segment. Remote senders attach it, claim one inbound
//! queue each (one writer per queue) and push framed packets through the
//! queue's ring; the owner's receive loop drains all claimed queues. The
//! segment header carries the liveness and reference-count state the cleanup
//! protocol relies on.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use log::{debug, warn};

use crate::directory::{
    clear_atomic_string, now_millis, read_atomic_string, write_atomic_string,
    ATOMIC_STRING_SLOTS,
};
use crate::error::{LrpcError, Result};
use crate::notify::SharedSemaphore;
use crate::ring::{RingBuffer, RingHeader, RingStats};
use crate::shm::ShmRegion;

/// Magic number identifying a node segment ("LRPS")
pub const SEGMENT_MAGIC: u32 = 0x4C52_5053;

/// Node segment schema version
pub const SEGMENT_VERSION: u32 = 1;

/// Queue slot holds a claim
pub const QUEUE_FLAG_VALID: u32 = 0x1;
/// Queue claim is live; cleared on orderly release
pub const QUEUE_FLAG_ACTIVE: u32 = 0x2;

#[inline]
fn align64(n: usize) -> usize {
    (n + 63) & !63
}

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU32,
    version: u32,
    num_queues: AtomicU32,
    max_queues: u32,
    ready: AtomicU32,
    owner_pid: AtomicI32,
    ref_count: AtomicI32,
    ring_bytes: u32,
    queue_stride: u32,
    _r0: u32,
    writer_heartbeat: AtomicU64,
    _pad: [u8; 16],
}

#[repr(C)]
struct QueueHeader {
    flags: AtomicU32,
    congestion_level: AtomicU32,
    pending_messages: AtomicU64,
    corrupt_frames: AtomicU64,
    sender_id: [AtomicU64; ATOMIC_STRING_SLOTS],
    notify: SharedSemaphore,
    ring: RingHeader,
    // ring data area follows within the queue stride
}

/// A node's inbound shared-memory segment
#[derive(Debug)]
pub struct NodeSegment {
    region: ShmRegion,
    header: NonNull<SegmentHeader>,
    max_queues: u32,
    ring_bytes: usize,
    queue_stride: usize,
}

unsafe impl Send for NodeSegment {}
unsafe impl Sync for NodeSegment {}

impl NodeSegment {
    const HEADER_SPAN: usize = 64; // align64(size_of::<SegmentHeader>())

    fn queue_stride(ring_bytes: usize) -> usize {
        align64(std::mem::size_of::<QueueHeader>() + ring_bytes)
    }

    /// Create and initialize a fresh segment owned by this process
    ///
    /// A leftover segment with the same name (crashed predecessor) is
    /// unlinked first.
    pub fn create(name: &str, max_queues: u32, ring_bytes: usize) -> Result<Self> {
        if max_queues == 0 {
            return Err(LrpcError::invalid_argument("max_queues", "must be > 0"));
        }
        if ring_bytes % 8 != 0 || ring_bytes < 4096 {
            return Err(LrpcError::invalid_argument(
                "ring_bytes",
                "must be a multiple of 8 and at least 4096",
            ));
        }

        ShmRegion::unlink(name)?;
        let stride = Self::queue_stride(ring_bytes);
        let size = Self::HEADER_SPAN + max_queues as usize * stride;
        let region = ShmRegion::create_exclusive(name, size)?;

        // Pages arrive zero-filled; the non-atomic geometry fields are only
        // ever written here, before `ready` is published
        let raw = region.as_ptr() as *mut SegmentHeader;
        unsafe {
            (*raw).version = SEGMENT_VERSION;
            (*raw).max_queues = max_queues;
            (*raw).ring_bytes = ring_bytes as u32;
            (*raw).queue_stride = stride as u32;
        }

        let segment = Self {
            header: NonNull::new(raw).ok_or_else(|| LrpcError::memory("null segment mapping"))?,
            region,
            max_queues,
            ring_bytes,
            queue_stride: stride,
        };

        let hdr = segment.header();
        hdr.owner_pid.store(std::process::id() as i32, Ordering::Relaxed);
        hdr.ref_count.store(1, Ordering::Relaxed);
        hdr.writer_heartbeat.store(now_millis(), Ordering::Relaxed);

        for i in 0..max_queues as usize {
            let queue = segment.queue_header(i);
            unsafe {
                SharedSemaphore::init_in_place(&queue.notify as *const _ as *mut SharedSemaphore)?;
            }
        }

        hdr.ready.store(1, Ordering::Release);
        hdr.magic.store(SEGMENT_MAGIC, Ordering::Release);
        debug!("created node segment {} ({} bytes)", name, size);
        Ok(segment)
    }

    /// Attach to a peer's segment for writing
    pub fn open(name: &str) -> Result<Self> {
        let region = ShmRegion::open(name)?;
        if region.size() < Self::HEADER_SPAN {
            return Err(LrpcError::corruption(format!("segment {} too small", name)));
        }
        let header = NonNull::new(region.as_ptr() as *mut SegmentHeader)
            .ok_or_else(|| LrpcError::memory("null segment mapping"))?;

        // Wait briefly for the creator to publish the header
        let hdr = unsafe { header.as_ref() };
        let mut ok = false;
        for _ in 0..100 {
            if hdr.magic.load(Ordering::Acquire) == SEGMENT_MAGIC
                && hdr.ready.load(Ordering::Acquire) == 1
            {
                ok = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        if !ok {
            return Err(LrpcError::corruption(format!(
                "segment {} never became ready",
                name
            )));
        }
        if hdr.version != SEGMENT_VERSION {
            return Err(LrpcError::corruption("segment version mismatch"));
        }

        let max_queues = hdr.max_queues;
        let ring_bytes = hdr.ring_bytes as usize;
        let stride = hdr.queue_stride as usize;
        let expected = Self::HEADER_SPAN + max_queues as usize * stride;
        if region.size() < expected {
            return Err(LrpcError::corruption(format!(
                "segment {} truncated: {} < {}",
                name,
                region.size(),
                expected
            )));
        }

        hdr.ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            region,
            header,
            max_queues,
            ring_bytes,
            queue_stride: stride,
        })
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { self.header.as_ref() }
    }

    fn queue_header(&self, index: usize) -> &QueueHeader {
        debug_assert!(index < self.max_queues as usize);
        unsafe {
            &*(self
                .region
                .as_ptr()
                .add(Self::HEADER_SPAN + index * self.queue_stride) as *const QueueHeader)
        }
    }

    fn ring_data_ptr(&self, index: usize) -> *mut u8 {
        unsafe {
            self.region
                .as_ptr()
                .add(Self::HEADER_SPAN + index * self.queue_stride + std::mem::size_of::<QueueHeader>())
        }
    }

    /// Number of queue slots in this segment
    pub fn max_queues(&self) -> u32 {
        self.max_queues
    }

    /// Monotonic count of queue claims, used to invalidate receiver caches
    pub fn num_queues(&self) -> u32 {
        self.header().num_queues.load(Ordering::Acquire)
    }

    /// Segment name in the shm namespace
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Pid of the owning process
    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Acquire).max(0) as u32
    }

    /// Owner heartbeat in milliseconds since the epoch
    pub fn writer_heartbeat(&self) -> u64 {
        self.header().writer_heartbeat.load(Ordering::Acquire)
    }

    /// Refresh the owner heartbeat
    pub fn beat(&self) {
        self.header()
            .writer_heartbeat
            .store(now_millis(), Ordering::Release);
    }

    /// Current attachment count
    pub fn ref_count(&self) -> i32 {
        self.header().ref_count.load(Ordering::Acquire)
    }

    /// Handle on one inbound queue
    pub fn queue(&self, index: usize) -> Result<InboundQueue<'_>> {
        if index >= self.max_queues as usize {
            return Err(LrpcError::invalid_argument("index", "queue index out of range"));
        }
        Ok(InboundQueue {
            header: self.queue_header(index),
            ring: unsafe {
                RingBuffer::from_raw(
                    NonNull::new_unchecked(
                        &self.queue_header(index).ring as *const RingHeader as *mut RingHeader,
                    ),
                    NonNull::new_unchecked(self.ring_data_ptr(index)),
                    self.ring_bytes,
                )?
            },
            index,
        })
    }

    /// Claim a free queue slot for `sender_id` (idempotent per sender)
    pub fn claim_queue(&self, sender_id: &str) -> Result<usize> {
        // Reclaim a slot this sender already holds
        for i in 0..self.max_queues as usize {
            let queue = self.queue_header(i);
            if queue.flags.load(Ordering::Acquire) & QUEUE_FLAG_VALID != 0
                && read_atomic_string(&queue.sender_id) == sender_id
            {
                queue
                    .flags
                    .store(QUEUE_FLAG_VALID | QUEUE_FLAG_ACTIVE, Ordering::Release);
                return Ok(i);
            }
        }

        for i in 0..self.max_queues as usize {
            let queue = self.queue_header(i);
            if queue
                .flags
                .compare_exchange(
                    0,
                    QUEUE_FLAG_VALID | QUEUE_FLAG_ACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                write_atomic_string(&queue.sender_id, sender_id);
                self.header().num_queues.fetch_add(1, Ordering::AcqRel);
                debug!("claimed queue {} in {} for {}", i, self.name(), sender_id);
                return Ok(i);
            }
        }

        Err(LrpcError::network(format!(
            "no free inbound queue in {}",
            self.name()
        )))
    }

    /// Orderly release of a claimed slot: clears ACTIVE, keeps VALID
    pub fn release_queue(&self, index: usize) {
        if index >= self.max_queues as usize {
            return;
        }
        let queue = self.queue_header(index);
        queue
            .flags
            .fetch_and(!QUEUE_FLAG_ACTIVE, Ordering::AcqRel);
    }

    /// Forcibly reclaim a slot whose writer is gone
    pub fn reclaim_queue(&self, index: usize) {
        if index >= self.max_queues as usize {
            return;
        }
        let queue = self.queue_header(index);
        if queue.flags.swap(0, Ordering::AcqRel) != 0 {
            clear_atomic_string(&queue.sender_id);
            queue.pending_messages.store(0, Ordering::Release);
            self.header().num_queues.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Read a segment's liveness header without touching its ref count
    ///
    /// The orphan sweeper uses this to judge segments it does not attach to;
    /// an unreadable or never-initialized header reports `valid = false`.
    pub fn inspect(name: &str) -> Result<SegmentInspection> {
        let region = ShmRegion::open(name)?;
        if region.size() < Self::HEADER_SPAN {
            return Err(LrpcError::corruption(format!("segment {} too small", name)));
        }
        let hdr = unsafe { &*(region.as_ptr() as *const SegmentHeader) };
        Ok(SegmentInspection {
            valid: hdr.magic.load(Ordering::Acquire) == SEGMENT_MAGIC,
            owner_pid: hdr.owner_pid.load(Ordering::Acquire).max(0) as u32,
            ref_count: hdr.ref_count.load(Ordering::Acquire),
            writer_heartbeat: hdr.writer_heartbeat.load(Ordering::Acquire),
        })
    }

    /// Drop one reference; the last holder unlinks the segment
    fn release_ref(&self) {
        let name = self.region.name().to_string();
        if self.header().ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Err(e) = ShmRegion::unlink(&name) {
                warn!("failed to unlink segment {}: {}", name, e);
            }
        }
    }
}

impl Drop for NodeSegment {
    fn drop(&mut self) {
        self.release_ref();
    }
}

/// Liveness snapshot of a segment header, for the orphan sweeper
#[derive(Debug, Clone, Copy)]
pub struct SegmentInspection {
    pub valid: bool,
    pub owner_pid: u32,
    pub ref_count: i32,
    pub writer_heartbeat: u64,
}

/// Handle on one inbound queue slot of a segment
pub struct InboundQueue<'a> {
    header: &'a QueueHeader,
    ring: RingBuffer,
    index: usize,
}

impl<'a> InboundQueue<'a> {
    /// Queue slot index within the segment
    pub fn index(&self) -> usize {
        self.index
    }

    /// Raw flag bits
    pub fn flags(&self) -> u32 {
        self.header.flags.load(Ordering::Acquire)
    }

    /// Whether the queue is claimed and live
    pub fn is_addressable(&self) -> bool {
        self.flags() & (QUEUE_FLAG_VALID | QUEUE_FLAG_ACTIVE)
            == (QUEUE_FLAG_VALID | QUEUE_FLAG_ACTIVE)
    }

    /// Node id of the claiming sender
    pub fn sender_id(&self) -> String {
        read_atomic_string(&self.header.sender_id)
    }

    /// Messages written but not yet drained
    pub fn pending(&self) -> u64 {
        self.header.pending_messages.load(Ordering::Acquire)
    }

    /// Congestion level 0..=3 derived from ring occupancy
    pub fn congestion_level(&self) -> u32 {
        self.header.congestion_level.load(Ordering::Relaxed)
    }

    /// Corrupt frames observed by the receiver on this queue
    pub fn corrupt_frames(&self) -> u64 {
        self.header.corrupt_frames.load(Ordering::Relaxed)
    }

    /// Ring statistics snapshot
    pub fn ring_stats(&self) -> RingStats {
        self.ring.stats()
    }

    /// Producer path: write one framed message and signal on the 0→1 edge
    pub fn push(&self, payload: &[u8]) -> Result<()> {
        if !self.ring.try_write(payload) {
            self.header.congestion_level.store(3, Ordering::Relaxed);
            return Err(LrpcError::queue_full(format!(
                "inbound queue {} full",
                self.index
            )));
        }

        let occupancy = self.ring.occupied() * 4 / self.ring.capacity().max(1);
        self.header
            .congestion_level
            .store(occupancy.min(3) as u32, Ordering::Relaxed);

        // A receiver that has not drained yet needs no second wake-up
        let previous = self.header.pending_messages.fetch_add(1, Ordering::Release);
        if previous == 0 {
            self.header.notify.post()?;
        }
        Ok(())
    }

    /// Consumer path: drain up to `max` messages, handing each to `deliver`
    ///
    /// Returns the number of messages drained. Corrupt frames mark the count
    /// and poison the queue for the caller via `Err`.
    pub fn drain<F: FnMut(&[u8])>(
        &self,
        max: usize,
        scratch: &mut [u8],
        mut deliver: F,
    ) -> Result<usize> {
        let mut drained = 0;
        while drained < max {
            match self.ring.try_read(scratch) {
                Ok(Some(len)) => {
                    deliver(&scratch[..len]);
                    drained += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    self.header.corrupt_frames.fetch_add(1, Ordering::Relaxed);
                    self.sub_pending(drained);
                    return Err(e);
                }
            }
        }
        self.sub_pending(drained);
        Ok(drained)
    }

    fn sub_pending(&self, drained: usize) {
        if drained > 0 {
            // Saturating: a producer that died between ring write and counter
            // increment must not drive the counter negative
            let _ = self
                .header
                .pending_messages
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                    Some(p.saturating_sub(drained as u64))
                });
        }
    }

    /// Wait on this queue's notification primitive
    pub fn wait(&self, timeout_ms: u64) -> Result<bool> {
        self.header.notify.timed_wait(timeout_ms)
    }

    /// Post this queue's notification primitive (shutdown kick)
    pub fn kick(&self) -> Result<()> {
        self.header.notify.post()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::MAX_MSG_SIZE;

    fn test_segment(tag: &str) -> NodeSegment {
        let name = format!("/librpc_test_seg_{}_{}", tag, std::process::id());
        NodeSegment::create(&name, 8, 64 * 1024).unwrap()
    }

    #[test]
    fn test_create_and_open() {
        let segment = test_segment("co");
        assert_eq!(segment.max_queues(), 8);
        assert_eq!(segment.ref_count(), 1);
        assert_eq!(segment.owner_pid(), std::process::id());

        let attached = NodeSegment::open(segment.name()).unwrap();
        assert_eq!(attached.max_queues(), 8);
        assert_eq!(segment.ref_count(), 2);
        drop(attached);
        assert_eq!(segment.ref_count(), 1);
    }

    #[test]
    fn test_claim_is_idempotent_per_sender() {
        let segment = test_segment("claim");
        let a = segment.claim_queue("sender_a").unwrap();
        let b = segment.claim_queue("sender_b").unwrap();
        assert_ne!(a, b);
        // Same sender gets its existing slot back
        assert_eq!(segment.claim_queue("sender_a").unwrap(), a);
        assert_eq!(segment.num_queues(), 2);

        let queue = segment.queue(a).unwrap();
        assert!(queue.is_addressable());
        assert_eq!(queue.sender_id(), "sender_a");
    }

    #[test]
    fn test_claim_exhaustion() {
        let name = format!("/librpc_test_seg_exh_{}", std::process::id());
        let segment = NodeSegment::create(&name, 2, 64 * 1024).unwrap();
        segment.claim_queue("s1").unwrap();
        segment.claim_queue("s2").unwrap();
        assert!(matches!(
            segment.claim_queue("s3"),
            Err(LrpcError::Network { .. })
        ));
    }

    #[test]
    fn test_push_drain_pending() {
        let segment = test_segment("pd");
        let index = segment.claim_queue("producer").unwrap();
        let queue = segment.queue(index).unwrap();

        queue.push(b"one").unwrap();
        queue.push(b"two").unwrap();
        assert_eq!(queue.pending(), 2);

        let mut scratch = vec![0u8; MAX_MSG_SIZE];
        let mut seen = Vec::new();
        let drained = queue
            .drain(16, &mut scratch, |bytes| seen.push(bytes.to_vec()))
            .unwrap();
        assert_eq!(drained, 2);
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_signal_only_on_first_pending() {
        let segment = test_segment("sig");
        let index = segment.claim_queue("producer").unwrap();
        let queue = segment.queue(index).unwrap();

        queue.push(b"a").unwrap();
        queue.push(b"b").unwrap();
        queue.push(b"c").unwrap();

        // Only the 0→1 transition posted the semaphore
        assert!(queue.wait(10).unwrap());
        assert!(!queue.wait(10).unwrap());
    }

    #[test]
    fn test_release_and_reclaim() {
        let segment = test_segment("rel");
        let index = segment.claim_queue("producer").unwrap();

        segment.release_queue(index);
        let queue = segment.queue(index).unwrap();
        assert!(!queue.is_addressable());
        assert_eq!(queue.flags(), QUEUE_FLAG_VALID);

        segment.reclaim_queue(index);
        let queue = segment.queue(index).unwrap();
        assert_eq!(queue.flags(), 0);
        assert_eq!(queue.sender_id(), "");
    }

    #[test]
    fn test_backpressure_surfaces_queue_full() {
        let name = format!("/librpc_test_seg_bp_{}", std::process::id());
        let segment = NodeSegment::create(&name, 2, 4096).unwrap();
        let index = segment.claim_queue("producer").unwrap();
        let queue = segment.queue(index).unwrap();

        let payload = vec![0u8; 1024];
        let mut wrote = 0;
        loop {
            match queue.push(&payload) {
                Ok(()) => wrote += 1,
                Err(e) => {
                    assert!(e.is_backpressure());
                    break;
                }
            }
            assert!(wrote < 100, "ring never filled");
        }
        assert!(wrote >= 3);
        assert_eq!(queue.congestion_level(), 3);
    }
}
