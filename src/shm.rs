//! POSIX shared-memory region management
//!
//! Segments are named objects under `/dev/shm` following the bus naming
//! convention: `librpc_node_<pid>_<nodeid>` for node segments,
//! `librpc_channel_<name>` for large-data channels and `librpc_registry` for
//! the global node directory.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use nix::{
    fcntl::OFlag,
    sys::mman::{shm_open, shm_unlink},
    sys::stat::Mode,
};

use crate::error::{LrpcError, Result};

/// Name of the global node directory segment
pub const DIRECTORY_SHM_NAME: &str = "/librpc_registry";

/// Prefix shared by every segment the bus creates
pub const SHM_PREFIX: &str = "librpc_";

/// Shared-memory name for a node's inbound segment
pub fn node_segment_name(pid: u32, node_id: &str) -> String {
    format!("/librpc_node_{}_{}", pid, node_id)
}

/// Shared-memory name for a large-data channel
pub fn channel_segment_name(channel: &str) -> String {
    format!("/librpc_channel_{}", channel)
}

/// A mapped POSIX shared-memory object
#[derive(Debug)]
pub struct ShmRegion {
    name: String,
    mmap: MmapMut,
    _file: File,
    size: usize,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new segment, failing if one with the same name exists
    pub fn create_exclusive(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(LrpcError::invalid_argument("size", "size must be non-zero"));
        }
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )
        .map_err(|e| match e {
            nix::errno::Errno::EEXIST => LrpcError::already_exists(name.to_string()),
            other => LrpcError::platform(format!("shm_open({}) failed: {}", name, other)),
        })?;

        let file = File::from(fd);
        file.set_len(size as u64)
            .map_err(|e| LrpcError::from_io(e, "ftruncate on shm object"))?;

        Self::map(name.to_string(), file, size)
    }

    /// Open an existing segment read-write, taking its size from the object
    pub fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| match e {
            nix::errno::Errno::ENOENT => LrpcError::not_found(name.to_string()),
            other => LrpcError::platform(format!("shm_open({}) failed: {}", name, other)),
        })?;

        let file = File::from(fd);
        let size = file
            .metadata()
            .map_err(|e| LrpcError::from_io(e, "fstat on shm object"))?
            .len() as usize;
        if size == 0 {
            return Err(LrpcError::memory(format!("segment {} has zero size", name)));
        }

        Self::map(name.to_string(), file, size)
    }

    /// Open an existing segment or create it; returns whether it was created
    pub fn open_or_create(name: &str, size: usize) -> Result<(Self, bool)> {
        match Self::create_exclusive(name, size) {
            Ok(region) => Ok((region, true)),
            Err(LrpcError::AlreadyExists { .. }) => Ok((Self::open(name)?, false)),
            Err(e) => Err(e),
        }
    }

    fn map(name: String, file: File, size: usize) -> Result<Self> {
        let mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .map_err(|e| LrpcError::from_io(e, "mmap on shm object"))?
        };
        Ok(Self {
            name,
            mmap,
            _file: file,
            size,
        })
    }

    /// Segment name (with the leading slash)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Base pointer of the mapping
    ///
    /// The mapping is shared: interior mutability through atomics is the rule,
    /// plain writes are only valid during single-owner initialization.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Remove the name from the namespace; mappings stay valid until unmapped
    pub fn unlink(name: &str) -> Result<()> {
        match shm_unlink(name) {
            Ok(()) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(LrpcError::platform(format!(
                "shm_unlink({}) failed: {}",
                name, e
            ))),
        }
    }

    /// Whether a segment with this name currently exists
    pub fn exists(name: &str) -> bool {
        std::path::Path::new("/dev/shm")
            .join(name.trim_start_matches('/'))
            .exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!(
            "/librpc_test_{}_{}_{:?}",
            tag,
            std::process::id(),
            std::thread::current().id()
        )
        .replace(['(', ')'], "")
    }

    #[test]
    fn test_create_open_unlink() {
        let name = unique_name("region");
        let region = ShmRegion::create_exclusive(&name, 4096).unwrap();
        assert_eq!(region.size(), 4096);
        assert!(ShmRegion::exists(&name));

        // Exclusive create refuses an existing name
        assert!(matches!(
            ShmRegion::create_exclusive(&name, 4096),
            Err(LrpcError::AlreadyExists { .. })
        ));

        let attached = ShmRegion::open(&name).unwrap();
        assert_eq!(attached.size(), 4096);

        ShmRegion::unlink(&name).unwrap();
        assert!(!ShmRegion::exists(&name));
        // Idempotent
        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_shared_mapping_visibility() {
        let name = unique_name("vis");
        let writer = ShmRegion::create_exclusive(&name, 4096).unwrap();
        let reader = ShmRegion::open(&name).unwrap();

        unsafe {
            std::ptr::write_volatile(writer.as_ptr(), 0xAB);
        }
        let seen = unsafe { std::ptr::read_volatile(reader.as_ptr()) };
        assert_eq!(seen, 0xAB);

        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_naming_convention() {
        assert_eq!(node_segment_name(42, "nav"), "/librpc_node_42_nav");
        assert_eq!(channel_segment_name("lidar"), "/librpc_channel_lidar");
        assert!(DIRECTORY_SHM_NAME.starts_with("/librpc_"));
    }

    #[test]
    fn test_open_missing() {
        assert!(matches!(
            ShmRegion::open("/librpc_test_definitely_missing"),
            Err(LrpcError::NotFound { .. })
        ));
    }
}
