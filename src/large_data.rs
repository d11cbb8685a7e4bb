//! Large-data channels: shared-memory rings for payloads over the frame cap
//!
//! A channel is a separately named segment written by one producer and read by
//! many consumers. Blocks are framed with a magic, size, sequence and CRC and
//! never wrap mid-block; consumers are directed to blocks by notification
//! records published as normal messages on the main bus.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::directory::is_process_alive;
use crate::error::{LrpcError, Result};
use crate::shm::{channel_segment_name, ShmRegion};

/// Magic number identifying a channel segment ("LRCH")
pub const CHANNEL_MAGIC: u32 = 0x4C52_4348;

/// Channel schema version
pub const CHANNEL_VERSION: u32 = 1;

/// Magic number heading every block ("LRLD")
pub const BLOCK_MAGIC: u32 = 0x4C52_4C44;

/// Reader slots per channel
pub const MAX_CHANNEL_READERS: usize = 16;

/// Fixed topic field width inside a block header
pub const BLOCK_TOPIC_LEN: usize = 64;

/// On-ring block header: magic, size, sequence, crc32, then the topic field
pub const BLOCK_HEADER_SIZE: usize = 16 + BLOCK_TOPIC_LEN;

#[inline]
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Ring-relative distance from a reader position to the writer position
#[inline]
fn ring_lag(write_pos: u64, read_pos: u64, size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    (write_pos % size + size - read_pos % size) % size
}

/// Notification record published on the main bus for every written block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeDataNotice {
    pub channel: String,
    pub sequence: u32,
    pub size: u64,
}

impl LargeDataNotice {
    /// Serialize for the payload of a normal bus message
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a notice out of a received payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[repr(C)]
struct ReaderSlot {
    active: AtomicU32,
    pid: AtomicU32,
    read_pos: AtomicU64,
}

#[repr(C)]
struct ChannelHeader {
    magic: AtomicU32,
    version: u32,
    buffer_size: u64,
    max_block_size: u64,
    owner_pid: AtomicI32,
    ref_count: AtomicI32,
    sequence: AtomicU32,
    _r0: u32,
    write_pos: AtomicU64,
    last_block_offset: AtomicU64,
    last_sequence: AtomicU32,
    _r1: u32,
    readers: [ReaderSlot; MAX_CHANNEL_READERS],
}

/// Liveness snapshot of a channel header, for the orphan sweeper
#[derive(Debug, Clone, Copy)]
pub struct ChannelInspection {
    pub valid: bool,
    pub owner_pid: u32,
    pub ref_count: i32,
    pub readers_cleared: usize,
    /// Worst distance between the writer and any surviving reader, in bytes
    pub max_reader_lag: u64,
}

/// One large-data channel mapping
///
/// The producer side is single-writer by construction (the sending node owns
/// the channel); consumers attach on demand when a notice arrives.
#[derive(Debug)]
pub struct LargeDataChannel {
    region: ShmRegion,
    header: NonNull<ChannelHeader>,
    data_offset: usize,
    data_size: usize,
    reader_slot: Option<usize>,
}

unsafe impl Send for LargeDataChannel {}
unsafe impl Sync for LargeDataChannel {}

impl LargeDataChannel {
    const HEADER_SPAN: usize = 512; // generous, keeps data area cache-aligned

    /// Open a channel by logical name, creating it if absent
    pub fn open_or_create(
        channel: &str,
        buffer_size: usize,
        max_block_size: usize,
    ) -> Result<Self> {
        if channel.is_empty() || channel.len() > BLOCK_TOPIC_LEN - 1 {
            return Err(LrpcError::invalid_argument("channel", "empty or too long"));
        }
        if std::mem::size_of::<ChannelHeader>() > Self::HEADER_SPAN {
            return Err(LrpcError::memory("channel header overflows its span"));
        }
        if buffer_size < BLOCK_HEADER_SIZE * 2 || max_block_size == 0 {
            return Err(LrpcError::invalid_argument(
                "buffer_size",
                "too small for any block",
            ));
        }

        let shm_name = channel_segment_name(channel);
        let total = Self::HEADER_SPAN + buffer_size;
        let (region, created) = ShmRegion::open_or_create(&shm_name, total)?;
        let header = NonNull::new(region.as_ptr() as *mut ChannelHeader)
            .ok_or_else(|| LrpcError::memory("null channel mapping"))?;

        let mut chan = Self {
            region,
            header,
            data_offset: Self::HEADER_SPAN,
            data_size: buffer_size,
            reader_slot: None,
        };

        if created {
            unsafe {
                let raw = chan.header.as_ptr();
                (*raw).version = CHANNEL_VERSION;
                (*raw).buffer_size = buffer_size as u64;
                (*raw).max_block_size = max_block_size as u64;
            }
            let hdr = chan.header();
            hdr.owner_pid.store(std::process::id() as i32, Ordering::Relaxed);
            hdr.ref_count.store(1, Ordering::Relaxed);
            hdr.magic.store(CHANNEL_MAGIC, Ordering::Release);
            debug!("created large-data channel {} ({} bytes)", shm_name, total);
        } else {
            chan.validate()?;
            let actual_size = {
                let hdr = chan.header();
                hdr.ref_count.fetch_add(1, Ordering::AcqRel);
                hdr.buffer_size as usize
            };
            chan.data_size = actual_size;
        }

        Ok(chan)
    }

    fn validate(&self) -> Result<()> {
        for _ in 0..100 {
            if self.header().magic.load(Ordering::Acquire) == CHANNEL_MAGIC {
                if self.header().version != CHANNEL_VERSION {
                    return Err(LrpcError::corruption("channel version mismatch"));
                }
                if self.region.size() < Self::HEADER_SPAN + self.header().buffer_size as usize {
                    return Err(LrpcError::corruption("channel region truncated"));
                }
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(LrpcError::corruption("channel magic never became valid"))
    }

    fn header(&self) -> &ChannelHeader {
        unsafe { self.header.as_ref() }
    }

    fn data_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.data_size);
        unsafe { self.region.as_ptr().add(self.data_offset + offset) }
    }

    /// Largest payload this channel accepts
    pub fn max_block_size(&self) -> usize {
        self.header().max_block_size as usize
    }

    /// Write one block and return the notice to publish
    pub fn write_block(&self, topic: &str, payload: &[u8]) -> Result<LargeDataNotice> {
        if topic.is_empty() || topic.len() > BLOCK_TOPIC_LEN - 1 {
            return Err(LrpcError::invalid_argument("topic", "empty or too long"));
        }
        if payload.is_empty() || payload.len() > self.max_block_size() {
            return Err(LrpcError::invalid_argument(
                "payload",
                "empty or over the channel block cap",
            ));
        }

        let needed = align8(BLOCK_HEADER_SIZE + payload.len());
        if needed > self.data_size {
            return Err(LrpcError::invalid_argument("payload", "exceeds channel size"));
        }

        let hdr = self.header();
        let mut pos = hdr.write_pos.load(Ordering::Relaxed) as usize;
        if pos + needed > self.data_size {
            // Blocks never straddle the end; restart at offset 0
            pos = 0;
        }

        let sequence = hdr.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let crc = crc32fast::hash(payload);

        unsafe {
            let ptr = self.data_ptr(pos);
            std::ptr::copy_nonoverlapping(BLOCK_MAGIC.to_le_bytes().as_ptr(), ptr, 4);
            std::ptr::copy_nonoverlapping(
                (payload.len() as u32).to_le_bytes().as_ptr(),
                ptr.add(4),
                4,
            );
            std::ptr::copy_nonoverlapping(sequence.to_le_bytes().as_ptr(), ptr.add(8), 4);
            std::ptr::copy_nonoverlapping(crc.to_le_bytes().as_ptr(), ptr.add(12), 4);

            let mut topic_field = [0u8; BLOCK_TOPIC_LEN];
            topic_field[..topic.len()].copy_from_slice(topic.as_bytes());
            std::ptr::copy_nonoverlapping(topic_field.as_ptr(), ptr.add(16), BLOCK_TOPIC_LEN);

            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                ptr.add(BLOCK_HEADER_SIZE),
                payload.len(),
            );
        }

        hdr.write_pos.store((pos + needed) as u64, Ordering::Relaxed);
        hdr.last_block_offset.store(pos as u64, Ordering::Release);
        // The release store below publishes the block to readers
        hdr.last_sequence.store(sequence, Ordering::Release);

        Ok(LargeDataNotice {
            channel: self.channel_name().to_string(),
            sequence,
            size: payload.len() as u64,
        })
    }

    /// Read the block a notice refers to
    ///
    /// Returns the block topic and payload. Fails with `NotFound` when the
    /// block has already been overwritten, `Corruption` on CRC mismatch.
    pub fn read_block(&self, sequence: u32) -> Result<(String, Vec<u8>)> {
        let hdr = self.header();
        let published = hdr.last_sequence.load(Ordering::Acquire);
        if published < sequence {
            return Err(LrpcError::not_found(format!(
                "block sequence {} not yet visible",
                sequence
            )));
        }
        if published != sequence {
            return Err(LrpcError::not_found(format!(
                "block sequence {} overwritten (latest {})",
                sequence, published
            )));
        }

        let offset = hdr.last_block_offset.load(Ordering::Acquire) as usize;
        if offset + BLOCK_HEADER_SIZE > self.data_size {
            return Err(LrpcError::corruption("block offset out of range"));
        }

        let (magic, size, block_seq, crc) = unsafe {
            let ptr = self.data_ptr(offset);
            let mut word = [0u8; 4];
            std::ptr::copy_nonoverlapping(ptr, word.as_mut_ptr(), 4);
            let magic = u32::from_le_bytes(word);
            std::ptr::copy_nonoverlapping(ptr.add(4), word.as_mut_ptr(), 4);
            let size = u32::from_le_bytes(word);
            std::ptr::copy_nonoverlapping(ptr.add(8), word.as_mut_ptr(), 4);
            let seq = u32::from_le_bytes(word);
            std::ptr::copy_nonoverlapping(ptr.add(12), word.as_mut_ptr(), 4);
            let crc = u32::from_le_bytes(word);
            (magic, size, seq, crc)
        };

        if magic != BLOCK_MAGIC {
            return Err(LrpcError::corruption("bad block magic"));
        }
        if block_seq != sequence {
            return Err(LrpcError::not_found(format!(
                "block sequence {} replaced by {}",
                sequence, block_seq
            )));
        }
        let size = size as usize;
        if size > self.max_block_size() || offset + BLOCK_HEADER_SIZE + size > self.data_size {
            return Err(LrpcError::corruption("block size out of range"));
        }

        let mut topic_field = [0u8; BLOCK_TOPIC_LEN];
        let mut payload = vec![0u8; size];
        unsafe {
            let ptr = self.data_ptr(offset);
            std::ptr::copy_nonoverlapping(ptr.add(16), topic_field.as_mut_ptr(), BLOCK_TOPIC_LEN);
            std::ptr::copy_nonoverlapping(
                ptr.add(BLOCK_HEADER_SIZE),
                payload.as_mut_ptr(),
                size,
            );
        }

        if crc32fast::hash(&payload) != crc {
            return Err(LrpcError::corruption("block CRC mismatch"));
        }

        if let Some(slot) = self.reader_slot {
            hdr.readers[slot]
                .read_pos
                .store((offset + align8(BLOCK_HEADER_SIZE + size)) as u64, Ordering::Release);
        }

        let topic_len = topic_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(BLOCK_TOPIC_LEN);
        let topic = String::from_utf8_lossy(&topic_field[..topic_len]).into_owned();
        Ok((topic, payload))
    }

    /// Register this process in a reader slot (for crash cleanup)
    pub fn attach_reader(&mut self) -> Result<()> {
        if self.reader_slot.is_some() {
            return Ok(());
        }
        let claimed = {
            let hdr = self.header();
            let write_pos = hdr.write_pos.load(Ordering::Acquire);
            let mut claimed = None;
            for (i, slot) in hdr.readers.iter().enumerate() {
                if slot
                    .active
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.pid.store(std::process::id(), Ordering::Release);
                    // A new reader is not behind blocks written before it attached
                    slot.read_pos.store(write_pos, Ordering::Release);
                    claimed = Some(i);
                    break;
                }
            }
            claimed
        };
        match claimed {
            Some(i) => {
                self.reader_slot = Some(i);
                Ok(())
            }
            None => Err(LrpcError::network(format!(
                "no free reader slot on channel {}",
                self.region.name()
            ))),
        }
    }

    /// Release this process's reader slot
    pub fn detach_reader(&mut self) {
        if let Some(i) = self.reader_slot.take() {
            let slot = &self.header().readers[i];
            slot.pid.store(0, Ordering::Release);
            slot.active.store(0, Ordering::Release);
        }
    }

    /// Clear reader slots whose process is dead; returns how many
    pub fn sweep_dead_readers(&self) -> usize {
        let mut cleared = 0;
        for slot in &self.header().readers {
            if slot.active.load(Ordering::Acquire) == 1 {
                let pid = slot.pid.load(Ordering::Acquire);
                if !is_process_alive(pid) {
                    slot.pid.store(0, Ordering::Release);
                    slot.active.store(0, Ordering::Release);
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Worst-case distance between the writer and any active reader, in bytes
    ///
    /// Zero when every reader has consumed up to the writer position. The
    /// value is ring-relative and never exceeds the channel size.
    pub fn max_reader_lag(&self) -> u64 {
        let hdr = self.header();
        let write_pos = hdr.write_pos.load(Ordering::Acquire);
        hdr.readers
            .iter()
            .filter(|slot| slot.active.load(Ordering::Acquire) == 1)
            .map(|slot| {
                ring_lag(
                    write_pos,
                    slot.read_pos.load(Ordering::Acquire),
                    self.data_size as u64,
                )
            })
            .max()
            .unwrap_or(0)
    }

    /// Inspect a channel by shm name and clear its dead reader slots
    ///
    /// Used by the orphan sweeper; does not touch the channel ref count.
    pub fn inspect_and_sweep(shm_name: &str) -> Result<ChannelInspection> {
        let region = ShmRegion::open(shm_name)?;
        if region.size() < Self::HEADER_SPAN {
            return Err(LrpcError::corruption(format!("channel {} too small", shm_name)));
        }
        let hdr = unsafe { &*(region.as_ptr() as *const ChannelHeader) };
        let valid = hdr.magic.load(Ordering::Acquire) == CHANNEL_MAGIC;

        let mut readers_cleared = 0;
        let mut max_reader_lag = 0;
        if valid {
            let write_pos = hdr.write_pos.load(Ordering::Acquire);
            let size = hdr.buffer_size;
            for slot in &hdr.readers {
                if slot.active.load(Ordering::Acquire) == 1 {
                    let pid = slot.pid.load(Ordering::Acquire);
                    if !is_process_alive(pid) {
                        slot.pid.store(0, Ordering::Release);
                        slot.active.store(0, Ordering::Release);
                        readers_cleared += 1;
                    } else {
                        let lag = ring_lag(write_pos, slot.read_pos.load(Ordering::Acquire), size);
                        max_reader_lag = max_reader_lag.max(lag);
                    }
                }
            }
        }

        Ok(ChannelInspection {
            valid,
            owner_pid: hdr.owner_pid.load(Ordering::Acquire).max(0) as u32,
            ref_count: hdr.ref_count.load(Ordering::Acquire),
            readers_cleared,
            max_reader_lag,
        })
    }

    /// Logical channel name (without the shm prefix)
    pub fn channel_name(&self) -> &str {
        self.region
            .name()
            .strip_prefix("/librpc_channel_")
            .unwrap_or(self.region.name())
    }

    /// Pid of the producing process
    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Acquire).max(0) as u32
    }

    /// Current attachment count
    pub fn ref_count(&self) -> i32 {
        self.header().ref_count.load(Ordering::Acquire)
    }
}

impl Drop for LargeDataChannel {
    fn drop(&mut self) {
        self.detach_reader();
        let name = self.region.name().to_string();
        if self.header().ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Err(e) = ShmRegion::unlink(&name) {
                warn!("failed to unlink channel {}: {}", name, e);
            }
        }
    }
}
