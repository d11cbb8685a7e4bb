//! Global node directory: node id → segment name, in shared memory
//!
//! A single bounded region (`librpc_registry`) that every process maps. Reads
//! are lock-free: the node id and segment name of each entry live in 8×u64
//! atomic slots so a reader either sees a previously written string in full or
//! a NUL-terminated prefix of one, never interleaved bytes from two writers.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::error::{LrpcError, Result};
use crate::shm::{ShmRegion, DIRECTORY_SHM_NAME};

/// Magic number identifying the directory region ("LRRG")
pub const DIRECTORY_MAGIC: u32 = 0x4C52_5247;

/// Directory schema version
pub const DIRECTORY_VERSION: u32 = 1;

/// Fixed number of entries in the directory
pub const DIRECTORY_CAPACITY: usize = 256;

/// u64 slots per atomic string (64 bytes)
pub const ATOMIC_STRING_SLOTS: usize = 8;

/// Longest representable name: 64 bytes minus the NUL terminator
pub const MAX_NAME_LEN: usize = ATOMIC_STRING_SLOTS * 8 - 1;

/// Entry holds a registration
pub const ENTRY_FLAG_VALID: u32 = 0x1;
/// Entry's node is live (cleared on orderly shutdown)
pub const ENTRY_FLAG_ACTIVE: u32 = 0x2;

/// Milliseconds since the UNIX epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether a process with this pid is currently alive
pub(crate) fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // EPERM means the process exists but belongs to someone else
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Write a string into an atomic 8×u64 slot array
///
/// The string is zero-padded to 64 bytes and stored slot by slot with release
/// ordering. Strings longer than [`MAX_NAME_LEN`] are truncated.
pub(crate) fn write_atomic_string(slots: &[AtomicU64; ATOMIC_STRING_SLOTS], s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(MAX_NAME_LEN);
    let mut buf = [0u8; ATOMIC_STRING_SLOTS * 8];
    buf[..len].copy_from_slice(&bytes[..len]);

    for (i, slot) in slots.iter().enumerate() {
        let word = u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        slot.store(word, Ordering::Release);
    }
}

/// Read a string from an atomic slot array; stops at the first NUL
pub(crate) fn read_atomic_string(slots: &[AtomicU64; ATOMIC_STRING_SLOTS]) -> String {
    let mut buf = [0u8; ATOMIC_STRING_SLOTS * 8];
    for (i, slot) in slots.iter().enumerate() {
        let word = slot.load(Ordering::Acquire);
        buf[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Clear an atomic slot array back to "not yet written"
pub(crate) fn clear_atomic_string(slots: &[AtomicU64; ATOMIC_STRING_SLOTS]) {
    for slot in slots {
        slot.store(0, Ordering::Release);
    }
}

#[repr(C)]
struct DirectoryHeader {
    magic: AtomicU32,
    version: AtomicU32,
    num_entries: AtomicU32,
    capacity: AtomicU32,
    ref_count: AtomicI32,
    _pad: [u8; 44],
}

#[repr(C)]
struct DirectoryEntry {
    flags: AtomicU32,
    pid: AtomicU32,
    last_heartbeat: AtomicU64,
    node_id: [AtomicU64; ATOMIC_STRING_SLOTS],
    segment_name: [AtomicU64; ATOMIC_STRING_SLOTS],
    _pad: [u8; 16],
}

/// Snapshot of one live directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub node_id: String,
    pub segment_name: String,
    pub pid: u32,
    pub last_heartbeat: u64,
}

/// Handle on the global node directory region
#[derive(Debug)]
pub struct NodeDirectory {
    region: ShmRegion,
    header: NonNull<DirectoryHeader>,
    entries: NonNull<DirectoryEntry>,
}

unsafe impl Send for NodeDirectory {}
unsafe impl Sync for NodeDirectory {}

impl NodeDirectory {
    const HEADER_SIZE: usize = std::mem::size_of::<DirectoryHeader>();
    const REGION_SIZE: usize =
        Self::HEADER_SIZE + DIRECTORY_CAPACITY * std::mem::size_of::<DirectoryEntry>();

    /// Open (or create) the process-wide default directory
    pub fn open_default() -> Result<Self> {
        Self::open_named(DIRECTORY_SHM_NAME)
    }

    /// Open or create a directory region with an explicit name
    ///
    /// Tests use private names to stay isolated; production code uses
    /// [`open_default`](Self::open_default).
    pub fn open_named(name: &str) -> Result<Self> {
        let (region, created) = ShmRegion::open_or_create(name, Self::REGION_SIZE)?;
        let header = NonNull::new(region.as_ptr() as *mut DirectoryHeader)
            .ok_or_else(|| LrpcError::memory("null directory mapping"))?;
        let entries = unsafe {
            NonNull::new_unchecked(region.as_ptr().add(Self::HEADER_SIZE) as *mut DirectoryEntry)
        };

        let dir = Self {
            region,
            header,
            entries,
        };

        if created {
            let hdr = dir.header();
            hdr.version.store(DIRECTORY_VERSION, Ordering::Relaxed);
            hdr.capacity.store(DIRECTORY_CAPACITY as u32, Ordering::Relaxed);
            hdr.num_entries.store(0, Ordering::Relaxed);
            hdr.ref_count.store(1, Ordering::Relaxed);
            // Publishing the magic last makes the region valid for attachers
            hdr.magic.store(DIRECTORY_MAGIC, Ordering::Release);
            debug!("created node directory {}", dir.region.name());
        } else {
            dir.validate()?;
            dir.header().ref_count.fetch_add(1, Ordering::AcqRel);
        }

        Ok(dir)
    }

    fn validate(&self) -> Result<()> {
        // The creator may still be between ftruncate and header init
        for _ in 0..100 {
            if self.header().magic.load(Ordering::Acquire) == DIRECTORY_MAGIC {
                if self.header().version.load(Ordering::Relaxed) != DIRECTORY_VERSION {
                    return Err(LrpcError::corruption("directory version mismatch"));
                }
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(LrpcError::corruption("directory magic never became valid"))
    }

    fn header(&self) -> &DirectoryHeader {
        unsafe { self.header.as_ref() }
    }

    fn entry(&self, index: usize) -> &DirectoryEntry {
        debug_assert!(index < DIRECTORY_CAPACITY);
        unsafe { &*self.entries.as_ptr().add(index) }
    }

    fn find_index(&self, node_id: &str) -> Option<usize> {
        for i in 0..DIRECTORY_CAPACITY {
            let entry = self.entry(i);
            if entry.flags.load(Ordering::Acquire) & ENTRY_FLAG_VALID == 0 {
                continue;
            }
            if read_atomic_string(&entry.node_id) == node_id {
                return Some(i);
            }
        }
        None
    }

    /// Register a node, writing into the first free slot
    pub fn register(&self, node_id: &str, segment_name: &str) -> Result<()> {
        if node_id.is_empty() || node_id.len() > MAX_NAME_LEN {
            return Err(LrpcError::invalid_argument("node_id", "empty or too long"));
        }
        if segment_name.len() > MAX_NAME_LEN {
            return Err(LrpcError::invalid_argument("segment_name", "too long"));
        }

        // A stale entry for the same id (crashed predecessor) is taken over
        if let Some(i) = self.find_index(node_id) {
            let entry = self.entry(i);
            let pid = entry.pid.load(Ordering::Acquire);
            if is_process_alive(pid) && pid != std::process::id() {
                return Err(LrpcError::already_exists(format!("node id {}", node_id)));
            }
            warn!("taking over stale directory entry for {}", node_id);
            entry.pid.store(std::process::id(), Ordering::Release);
            entry.last_heartbeat.store(now_millis(), Ordering::Release);
            write_atomic_string(&entry.segment_name, segment_name);
            entry
                .flags
                .store(ENTRY_FLAG_VALID | ENTRY_FLAG_ACTIVE, Ordering::Release);
            return Ok(());
        }

        for i in 0..DIRECTORY_CAPACITY {
            let entry = self.entry(i);
            if entry
                .flags
                .compare_exchange(
                    0,
                    ENTRY_FLAG_VALID | ENTRY_FLAG_ACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                entry.pid.store(std::process::id(), Ordering::Release);
                entry.last_heartbeat.store(now_millis(), Ordering::Release);
                write_atomic_string(&entry.node_id, node_id);
                write_atomic_string(&entry.segment_name, segment_name);
                self.header().num_entries.fetch_add(1, Ordering::AcqRel);
                debug!("registered node {} -> {}", node_id, segment_name);
                return Ok(());
            }
        }

        Err(LrpcError::DirectoryFull {
            capacity: DIRECTORY_CAPACITY,
        })
    }

    /// Remove a node's registration
    pub fn unregister(&self, node_id: &str) -> Result<()> {
        let i = self
            .find_index(node_id)
            .ok_or_else(|| LrpcError::not_found(format!("node id {}", node_id)))?;
        let entry = self.entry(i);
        clear_atomic_string(&entry.node_id);
        clear_atomic_string(&entry.segment_name);
        entry.pid.store(0, Ordering::Release);
        entry.flags.store(0, Ordering::Release);
        self.header().num_entries.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Look up a node by id
    ///
    /// A concurrent writer can leave a torn (empty-prefix) read; such entries
    /// are retried a bounded number of passes before being reported missing.
    pub fn find(&self, node_id: &str) -> Option<NodeEntry> {
        for _ in 0..3 {
            if let Some(i) = self.find_index(node_id) {
                let entry = self.entry(i);
                let segment_name = read_atomic_string(&entry.segment_name);
                if segment_name.is_empty() {
                    // Writer has claimed the slot but not finished; retry
                    std::hint::spin_loop();
                    continue;
                }
                return Some(NodeEntry {
                    node_id: node_id.to_string(),
                    segment_name,
                    pid: entry.pid.load(Ordering::Acquire),
                    last_heartbeat: entry.last_heartbeat.load(Ordering::Acquire),
                });
            }
            return None;
        }
        None
    }

    /// Refresh the heartbeat timestamp of a node
    pub fn update_heartbeat(&self, node_id: &str) -> Result<()> {
        let i = self
            .find_index(node_id)
            .ok_or_else(|| LrpcError::not_found(format!("node id {}", node_id)))?;
        self.entry(i)
            .last_heartbeat
            .store(now_millis(), Ordering::Release);
        Ok(())
    }

    /// Whether a node is registered and active
    pub fn node_exists(&self, node_id: &str) -> bool {
        self.find_index(node_id)
            .map(|i| self.entry(i).flags.load(Ordering::Acquire) & ENTRY_FLAG_ACTIVE != 0)
            .unwrap_or(false)
    }

    /// Snapshot every live entry
    pub fn all_nodes(&self) -> Vec<NodeEntry> {
        let mut nodes = Vec::new();
        for i in 0..DIRECTORY_CAPACITY {
            let entry = self.entry(i);
            let flags = entry.flags.load(Ordering::Acquire);
            if flags & (ENTRY_FLAG_VALID | ENTRY_FLAG_ACTIVE)
                != (ENTRY_FLAG_VALID | ENTRY_FLAG_ACTIVE)
            {
                continue;
            }
            let node_id = read_atomic_string(&entry.node_id);
            if node_id.is_empty() {
                continue;
            }
            nodes.push(NodeEntry {
                node_id,
                segment_name: read_atomic_string(&entry.segment_name),
                pid: entry.pid.load(Ordering::Acquire),
                last_heartbeat: entry.last_heartbeat.load(Ordering::Acquire),
            });
        }
        nodes
    }

    /// Number of live entries
    pub fn active_node_count(&self) -> usize {
        self.all_nodes().len()
    }

    /// Evict entries whose heartbeat is stale and whose process is gone
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self, timeout_ms: u64) -> usize {
        let now = now_millis();
        let mut evicted = 0;
        for i in 0..DIRECTORY_CAPACITY {
            let entry = self.entry(i);
            if entry.flags.load(Ordering::Acquire) & ENTRY_FLAG_VALID == 0 {
                continue;
            }
            let heartbeat = entry.last_heartbeat.load(Ordering::Acquire);
            let pid = entry.pid.load(Ordering::Acquire);
            if now.saturating_sub(heartbeat) > timeout_ms && !is_process_alive(pid) {
                let node_id = read_atomic_string(&entry.node_id);
                warn!("evicting stale directory entry {} (pid {})", node_id, pid);
                clear_atomic_string(&entry.node_id);
                clear_atomic_string(&entry.segment_name);
                entry.pid.store(0, Ordering::Release);
                entry.flags.store(0, Ordering::Release);
                self.header().num_entries.fetch_sub(1, Ordering::AcqRel);
                evicted += 1;
            }
        }
        evicted
    }

    /// Directory region name
    pub fn region_name(&self) -> &str {
        self.region.name()
    }
}

impl Drop for NodeDirectory {
    fn drop(&mut self) {
        // Last detach unlinks the region
        let name = self.region.name().to_string();
        if self.header().ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Err(e) = ShmRegion::unlink(&name) {
                warn!("failed to unlink directory {}: {}", name, e);
            }
        }
    }
}
