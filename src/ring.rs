//! Framed lock-free SPSC ring buffer backing inter-process delivery
//!
//! One producer and one consumer share a byte ring. Every message is a frame:
//! an 8-byte header (length + magic) followed by the payload, padded to an
//! 8-byte boundary. Frames never straddle the capacity boundary; when a frame
//! does not fit at the end, the producer writes a padding frame and wraps to
//! offset 0. Head and tail are byte offsets on separate cache lines.

use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::error::{LrpcError, Result};

/// Maximum payload accepted by a single frame
pub const MAX_MSG_SIZE: usize = 2040;

/// Frame carries a valid payload of `length` bytes
pub const MAGIC_VALID: u32 = 0xCAFE_BABE;

/// Frame spans `length` unused bytes up to the capacity boundary
pub const MAGIC_PADDING: u32 = 0xDEAD_BEEF;

/// Size of the on-wire frame header
pub const FRAME_HEADER_SIZE: usize = 8;

#[inline]
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Shared-memory resident ring state: offsets and statistics
///
/// Head and tail each own a cache line so the producer and consumer do not
/// false-share. The data area follows separately.
#[repr(C)]
pub struct RingHeader {
    /// Next write offset (producer-owned)
    head: AtomicU64,
    _pad0: [u8; 56],
    /// Next read offset (consumer-owned)
    tail: AtomicU64,
    _pad1: [u8; 56],
    messages_written: AtomicU64,
    messages_read: AtomicU64,
    messages_dropped: AtomicU64,
    _pad2: [u8; 40],
}

impl RingHeader {
    /// Size of the header in bytes (three cache lines)
    pub const SIZE: usize = std::mem::size_of::<RingHeader>();

    /// Initialize a header in place (e.g. freshly mapped shared memory)
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `RingHeader::SIZE` bytes and not
    /// concurrently accessed.
    pub unsafe fn init_in_place(ptr: *mut RingHeader) {
        std::ptr::write_bytes(ptr as *mut u8, 0, Self::SIZE);
    }
}

/// Snapshot of ring statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub messages_written: u64,
    pub messages_read: u64,
    pub messages_dropped: u64,
    pub occupied_bytes: usize,
}

/// Lock-free single-producer single-consumer framed byte ring
///
/// The handle does not enforce the single-producer/single-consumer roles; the
/// queue claim protocol above it does.
#[derive(Debug)]
pub struct RingBuffer {
    header: NonNull<RingHeader>,
    data: NonNull<u8>,
    capacity: usize,
    /// Heap backing when self-allocated; shared-memory rings borrow
    owned: Option<Layout>,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a heap-backed ring (tests and in-process use)
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < FRAME_HEADER_SIZE * 2 || capacity % 8 != 0 {
            return Err(LrpcError::invalid_argument(
                "capacity",
                "capacity must be a multiple of 8 and at least 16",
            ));
        }

        let layout = Layout::from_size_align(RingHeader::SIZE + capacity, 64)
            .map_err(|_| LrpcError::memory("bad ring layout"))?;
        let base = unsafe {
            let ptr = std::alloc::alloc_zeroed(layout);
            NonNull::new(ptr).ok_or_else(|| LrpcError::memory("ring allocation failed"))?
        };

        let header = base.cast::<RingHeader>();
        let data = unsafe { NonNull::new_unchecked(base.as_ptr().add(RingHeader::SIZE)) };

        Ok(Self {
            header,
            data,
            capacity,
            owned: Some(layout),
        })
    }

    /// Wrap ring state living in shared memory
    ///
    /// # Safety
    /// `header` and `data` must point into a mapping that outlives the handle,
    /// with at least `capacity` bytes at `data`. The header must have been
    /// initialized exactly once (`RingHeader::init_in_place` or zero-filled
    /// pages).
    pub unsafe fn from_raw(
        header: NonNull<RingHeader>,
        data: NonNull<u8>,
        capacity: usize,
    ) -> Result<Self> {
        if capacity < FRAME_HEADER_SIZE * 2 || capacity % 8 != 0 {
            return Err(LrpcError::invalid_argument(
                "capacity",
                "capacity must be a multiple of 8 and at least 16",
            ));
        }
        Ok(Self {
            header,
            data,
            capacity,
            owned: None,
        })
    }

    /// Ring data capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        unsafe { self.header.as_ref() }
    }

    /// Try to write one message; returns `false` when the ring is full or the
    /// size is out of range
    pub fn try_write(&self, payload: &[u8]) -> bool {
        let size = payload.len();
        if size == 0 || size > MAX_MSG_SIZE {
            return false;
        }

        let needed = align8(FRAME_HEADER_SIZE + size);
        let hdr = self.header();
        let h = hdr.head.load(Ordering::Relaxed) as usize;
        let t = hdr.tail.load(Ordering::Acquire) as usize;

        if h >= t {
            // Free space at the end, then at the start up to tail
            if h + needed <= self.capacity {
                unsafe { self.write_frame(h, payload) };
                hdr.head.store((h + needed) as u64, Ordering::Release);
                hdr.messages_written.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            // needed < tail keeps head != tail, which means empty
            if needed < t {
                let pad_len = self.capacity - h;
                if pad_len >= FRAME_HEADER_SIZE {
                    unsafe { self.write_frame_header(h, pad_len as u32, MAGIC_PADDING) };
                }
                unsafe { self.write_frame(0, payload) };
                hdr.head.store(needed as u64, Ordering::Release);
                hdr.messages_written.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        } else {
            // Free space is [head, tail)
            if h + needed < t {
                unsafe { self.write_frame(h, payload) };
                hdr.head.store((h + needed) as u64, Ordering::Release);
                hdr.messages_written.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }

        hdr.messages_dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Try to read one message into `out`
    ///
    /// Returns `Ok(None)` when the ring is empty and `Ok(Some(len))` with the
    /// payload length on success. A frame whose magic or length is invalid is
    /// reported as corruption; the caller treats the queue as poisoned.
    pub fn try_read(&self, out: &mut [u8]) -> Result<Option<usize>> {
        let hdr = self.header();
        loop {
            let t = hdr.tail.load(Ordering::Relaxed) as usize;
            let h = hdr.head.load(Ordering::Acquire) as usize;
            if t == h {
                return Ok(None);
            }
            // A frame that ended exactly at the boundary leaves tail == capacity
            if t == self.capacity {
                hdr.tail.store(0, Ordering::Release);
                continue;
            }

            let (length, magic) = unsafe { self.read_frame_header(t) };
            if magic == MAGIC_PADDING {
                hdr.tail.store(0, Ordering::Release);
                continue;
            }
            if magic != MAGIC_VALID {
                return Err(LrpcError::corruption(format!(
                    "bad frame magic {:#010x} at offset {}",
                    magic, t
                )));
            }

            let len = length as usize;
            if len == 0 || len > MAX_MSG_SIZE {
                return Err(LrpcError::corruption(format!(
                    "bad frame length {} at offset {}",
                    len, t
                )));
            }
            if out.len() < len {
                return Err(LrpcError::invalid_argument(
                    "out",
                    "output buffer smaller than MAX_MSG_SIZE",
                ));
            }

            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.data.as_ptr().add(t + FRAME_HEADER_SIZE),
                    out.as_mut_ptr(),
                    len,
                );
            }

            hdr.tail
                .store((t + align8(FRAME_HEADER_SIZE + len)) as u64, Ordering::Release);
            hdr.messages_read.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(len));
        }
    }

    /// Approximate number of occupied bytes
    pub fn occupied(&self) -> usize {
        let hdr = self.header();
        let h = hdr.head.load(Ordering::Acquire) as usize;
        let t = hdr.tail.load(Ordering::Acquire) as usize;
        if h >= t {
            h - t
        } else {
            self.capacity - (t - h)
        }
    }

    /// Whether the ring currently holds no frames
    pub fn is_empty(&self) -> bool {
        let hdr = self.header();
        hdr.head.load(Ordering::Acquire) == hdr.tail.load(Ordering::Acquire)
    }

    /// Snapshot the statistics counters
    pub fn stats(&self) -> RingStats {
        let hdr = self.header();
        RingStats {
            messages_written: hdr.messages_written.load(Ordering::Relaxed),
            messages_read: hdr.messages_read.load(Ordering::Relaxed),
            messages_dropped: hdr.messages_dropped.load(Ordering::Relaxed),
            occupied_bytes: self.occupied(),
        }
    }

    unsafe fn write_frame(&self, offset: usize, payload: &[u8]) {
        self.write_frame_header(offset, payload.len() as u32, MAGIC_VALID);
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            self.data.as_ptr().add(offset + FRAME_HEADER_SIZE),
            payload.len(),
        );
    }

    unsafe fn write_frame_header(&self, offset: usize, length: u32, magic: u32) {
        let ptr = self.data.as_ptr().add(offset);
        std::ptr::copy_nonoverlapping(length.to_le_bytes().as_ptr(), ptr, 4);
        std::ptr::copy_nonoverlapping(magic.to_le_bytes().as_ptr(), ptr.add(4), 4);
    }

    unsafe fn read_frame_header(&self, offset: usize) -> (u32, u32) {
        let ptr = self.data.as_ptr().add(offset);
        let mut length = [0u8; 4];
        let mut magic = [0u8; 4];
        std::ptr::copy_nonoverlapping(ptr, length.as_mut_ptr(), 4);
        std::ptr::copy_nonoverlapping(ptr.add(4), magic.as_mut_ptr(), 4);
        (u32::from_le_bytes(length), u32::from_le_bytes(magic))
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if let Some(layout) = self.owned.take() {
            unsafe {
                std::alloc::dealloc(self.header.as_ptr() as *mut u8, layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let ring = RingBuffer::new(4096).unwrap();
        let mut out = vec![0u8; MAX_MSG_SIZE];

        assert!(ring.try_write(b"hello ring"));
        let len = ring.try_read(&mut out).unwrap().unwrap();
        assert_eq!(&out[..len], b"hello ring");
        assert!(ring.try_read(&mut out).unwrap().is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_size_limits() {
        let ring = RingBuffer::new(8192).unwrap();
        assert!(!ring.try_write(&[]));
        assert!(!ring.try_write(&vec![0u8; MAX_MSG_SIZE + 1]));
        assert!(ring.try_write(&vec![7u8; MAX_MSG_SIZE]));

        let mut out = vec![0u8; MAX_MSG_SIZE];
        let len = ring.try_read(&mut out).unwrap().unwrap();
        assert_eq!(len, MAX_MSG_SIZE);
        assert!(out[..len].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_fifo_order() {
        let ring = RingBuffer::new(1024).unwrap();
        let mut out = vec![0u8; MAX_MSG_SIZE];

        for i in 0..10u32 {
            assert!(ring.try_write(&i.to_le_bytes()));
        }
        for i in 0..10u32 {
            let len = ring.try_read(&mut out).unwrap().unwrap();
            assert_eq!(len, 4);
            assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), i);
        }
    }

    #[test]
    fn test_full_rejects_and_counts_drops() {
        // 64-byte ring: each 8-byte payload frame occupies 16 bytes.
        // With tail at 0 the ring accepts frames up to the exact end.
        let ring = RingBuffer::new(64).unwrap();
        assert!(ring.try_write(&[1u8; 8]));
        assert!(ring.try_write(&[2u8; 8]));
        assert!(ring.try_write(&[3u8; 8]));
        assert!(ring.try_write(&[4u8; 8]));
        assert!(!ring.try_write(&[5u8; 8]));
        assert_eq!(ring.stats().messages_dropped, 1);

        let mut out = vec![0u8; MAX_MSG_SIZE];
        assert_eq!(ring.try_read(&mut out).unwrap(), Some(8));
        assert_eq!(out[0], 1);
        // One freed frame is not enough: a wrapped frame ending exactly at
        // tail would make head == tail read as empty, so it must still fail.
        assert!(!ring.try_write(&[6u8; 8]));

        assert_eq!(ring.try_read(&mut out).unwrap(), Some(8));
        assert!(ring.try_write(&[7u8; 8]));

        // Remaining frames drain in order
        assert_eq!(ring.try_read(&mut out).unwrap(), Some(8));
        assert_eq!(out[0], 3);
        assert_eq!(ring.try_read(&mut out).unwrap(), Some(8));
        assert_eq!(out[0], 4);
        assert_eq!(ring.try_read(&mut out).unwrap(), Some(8));
        assert_eq!(out[0], 7);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wrap_with_padding() {
        let ring = RingBuffer::new(128).unwrap();
        let mut out = vec![0u8; MAX_MSG_SIZE];

        // Fill with three 40-byte frames (48 bytes each on the ring)
        // then drain two so the head is near the end with free space at 0.
        assert!(ring.try_write(&[1u8; 40]));
        assert!(ring.try_write(&[2u8; 40]));
        assert_eq!(ring.try_read(&mut out).unwrap(), Some(40));
        assert_eq!(ring.try_read(&mut out).unwrap(), Some(40));

        // head = 96, tail = 96; 40-byte frame fits at the end exactly? 96+48 > 128,
        // so this wraps: padding at 96, frame at 0.
        assert!(ring.try_write(&[3u8; 40]));
        let len = ring.try_read(&mut out).unwrap().unwrap();
        assert_eq!(len, 40);
        assert!(out[..40].iter().all(|&b| b == 3));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_boundary_exact_fit() {
        let ring = RingBuffer::new(64).unwrap();
        let mut out = vec![0u8; MAX_MSG_SIZE];

        // 56-byte payload -> 64-byte frame, exactly the capacity
        assert!(ring.try_write(&[9u8; 56]));
        assert_eq!(ring.try_read(&mut out).unwrap(), Some(56));

        // head == tail == 64 now; the next write must wrap cleanly
        assert!(ring.try_write(&[8u8; 8]));
        assert_eq!(ring.try_read(&mut out).unwrap(), Some(8));
        assert_eq!(out[0], 8);
    }

    #[test]
    fn test_spsc_threads() {
        use std::sync::Arc;

        let ring = Arc::new(RingBuffer::new(4096).unwrap());
        let producer_ring = ring.clone();

        let producer = std::thread::spawn(move || {
            let mut written = 0u32;
            while written < 1000 {
                if producer_ring.try_write(&written.to_le_bytes()) {
                    written += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut out = vec![0u8; MAX_MSG_SIZE];
        let mut expected = 0u32;
        while expected < 1000 {
            match ring.try_read(&mut out).unwrap() {
                Some(len) => {
                    assert_eq!(len, 4);
                    assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}
