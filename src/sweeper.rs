//! Orphan sweeper: reclaims shared memory left behind by crashed processes
//!
//! One low-rate background task per process (owned by the bus context) walks
//! the `librpc_` namespace under `/dev/shm`. Node segments are unlinked when
//! nobody references them, their owner is dead or their heartbeat has gone
//! stale; large-data channels additionally get dead reader slots cleared.
//! Every eviction is idempotent: losing a race to another sweeper is fine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::directory::{is_process_alive, now_millis, NodeDirectory};
use crate::large_data::LargeDataChannel;
use crate::segment::NodeSegment;
use crate::shm::ShmRegion;

/// Pause between sweep passes
const SWEEP_INTERVAL_MS: u64 = 3_000;

/// What one sweep pass reclaimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub segments_unlinked: usize,
    pub channels_unlinked: usize,
    pub reader_slots_cleared: usize,
    pub directory_entries_evicted: usize,
    /// Worst writer-to-reader distance seen on any live channel, in bytes
    pub max_reader_lag_bytes: u64,
}

impl SweepReport {
    /// Whether the pass reclaimed anything
    pub fn reclaimed_any(&self) -> bool {
        self.segments_unlinked
            + self.channels_unlinked
            + self.reader_slots_cleared
            + self.directory_entries_evicted
            > 0
    }
}

/// Background task reclaiming orphaned bus segments
pub struct OrphanSweeper {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl OrphanSweeper {
    /// Start the sweeper thread
    pub fn start(directory: Arc<NodeDirectory>, node_timeout_ms: u64) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = std::thread::Builder::new()
            .name("lrpc-sweeper".to_string())
            .spawn(move || {
                let step = Duration::from_millis(100);
                let mut last_sweep = Instant::now() - Duration::from_millis(SWEEP_INTERVAL_MS);
                while flag.load(Ordering::Acquire) {
                    if last_sweep.elapsed() >= Duration::from_millis(SWEEP_INTERVAL_MS) {
                        let report = sweep_once(&directory, node_timeout_ms);
                        if report.reclaimed_any() {
                            info!(
                                "sweep reclaimed {} segments, {} channels, {} reader slots, {} directory entries (worst reader lag {} bytes)",
                                report.segments_unlinked,
                                report.channels_unlinked,
                                report.reader_slots_cleared,
                                report.directory_entries_evicted,
                                report.max_reader_lag_bytes
                            );
                        }
                        last_sweep = Instant::now();
                    }
                    std::thread::sleep(step);
                }
            })
            .expect("failed to spawn sweeper thread");

        Self {
            running,
            thread: Some(thread),
        }
    }

    /// Stop the sweeper; idempotent
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OrphanSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run one sweep pass over the shm namespace
pub fn sweep_once(directory: &NodeDirectory, node_timeout_ms: u64) -> SweepReport {
    let mut report = SweepReport {
        directory_entries_evicted: directory.cleanup_stale(node_timeout_ms),
        ..SweepReport::default()
    };

    let entries = match std::fs::read_dir("/dev/shm") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot scan /dev/shm: {}", e);
            return report;
        }
    };

    let now = now_millis();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else { continue };

        if let Some(_rest) = name.strip_prefix("librpc_node_") {
            let shm_name = format!("/{}", name);
            if sweep_node_segment(&shm_name, now, node_timeout_ms) {
                report.segments_unlinked += 1;
            }
        } else if name.strip_prefix("librpc_channel_").is_some() {
            let shm_name = format!("/{}", name);
            let (unlinked, cleared, lag) = sweep_channel(&shm_name);
            if unlinked {
                report.channels_unlinked += 1;
            }
            report.reader_slots_cleared += cleared;
            report.max_reader_lag_bytes = report.max_reader_lag_bytes.max(lag);
        }
    }

    report
}

fn sweep_node_segment(shm_name: &str, now: u64, node_timeout_ms: u64) -> bool {
    let inspection = match NodeSegment::inspect(shm_name) {
        Ok(inspection) => inspection,
        Err(_) => return false,
    };

    let orphaned = if !inspection.valid {
        // Crashed mid-initialization; the owner field decides
        !is_process_alive(inspection.owner_pid)
    } else {
        inspection.ref_count <= 0
            || !is_process_alive(inspection.owner_pid)
            || now.saturating_sub(inspection.writer_heartbeat) > node_timeout_ms.saturating_mul(3)
    };

    if orphaned {
        debug!(
            "unlinking orphan segment {} (valid={}, refs={}, owner={})",
            shm_name, inspection.valid, inspection.ref_count, inspection.owner_pid
        );
        let _ = ShmRegion::unlink(shm_name);
    }
    orphaned
}

fn sweep_channel(shm_name: &str) -> (bool, usize, u64) {
    let inspection = match LargeDataChannel::inspect_and_sweep(shm_name) {
        Ok(inspection) => inspection,
        Err(_) => return (false, 0, 0),
    };

    let orphaned = if !inspection.valid {
        !is_process_alive(inspection.owner_pid)
    } else {
        inspection.ref_count <= 0 || !is_process_alive(inspection.owner_pid)
    };

    if orphaned {
        debug!("unlinking orphan channel {}", shm_name);
        let _ = ShmRegion::unlink(shm_name);
    }
    (orphaned, inspection.readers_cleared, inspection.max_reader_lag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::node_segment_name;

    fn test_directory(tag: &str) -> NodeDirectory {
        let name = format!("/librpc_test_swdir_{}_{}", tag, std::process::id());
        let _ = ShmRegion::unlink(&name);
        NodeDirectory::open_named(&name).unwrap()
    }

    #[test]
    fn test_live_segment_survives_sweep() {
        let directory = test_directory("live");
        let name = node_segment_name(std::process::id(), "sweep_live");
        let _segment = NodeSegment::create(&name, 8, 64 * 1024).unwrap();

        sweep_once(&directory, 5_000);
        assert!(ShmRegion::exists(&name));
    }

    #[test]
    fn test_orphan_segment_is_unlinked() {
        let _directory = test_directory("orphan");
        // A stale-heartbeat orphan: build it, then lie about the heartbeat by
        // using a zero timeout so even a fresh beat counts as stale.
        let name = node_segment_name(std::process::id(), "sweep_orphan");
        let segment = NodeSegment::create(&name, 8, 64 * 1024).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let report_before = sweep_node_segment(&name, now_millis(), 0);
        assert!(report_before, "stale segment should be evicted");
        assert!(!ShmRegion::exists(&name));
        drop(segment);
    }

    #[test]
    fn test_sweep_reports_directory_cleanup() {
        let directory = test_directory("dirstale");
        directory.register("sweep_node", "/librpc_node_0_sweep").unwrap();
        // No heartbeat refresh and no such pid: entry must go
        let report = sweep_once(&directory, 0);
        // The entry's pid is this live process, so it is NOT evicted
        assert_eq!(report.directory_entries_evicted, 0);
        assert!(directory.node_exists("sweep_node"));
    }
}
