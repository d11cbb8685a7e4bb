//! Shared-memory transport: peer segment cache, send path and receive loop
//!
//! The transport owns the local node segment, publishes it in the directory,
//! attaches peer segments on demand (claiming one inbound queue per peer) and
//! runs the single receive thread that drains every claimed queue in the
//! local segment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::config::BusConfig;
use crate::directory::{is_process_alive, now_millis, NodeDirectory};
use crate::error::{LrpcError, Result};
use crate::ring::MAX_MSG_SIZE;
use crate::segment::{NodeSegment, QUEUE_FLAG_VALID};
use crate::shm::node_segment_name;

/// Frames drained from one queue per pass, bounding peer starvation
const DRAIN_BATCH: usize = 16;

/// Queue cache rebuild period, in receive-loop iterations
const CACHE_REFRESH_ITERATIONS: u32 = 100;

/// Idle wait when the loop has seen work recently
const IDLE_TIMEOUT_SHORT_MS: u64 = 5;

/// Idle wait after a long quiet stretch
const IDLE_TIMEOUT_LONG_MS: u64 = 50;

/// Consecutive empty wakeups before switching to the long timeout
const IDLE_THRESHOLD: u32 = 100;

/// Corrupt frames tolerated before a queue is forcibly reclaimed
const CORRUPT_FRAME_LIMIT: u64 = 8;

/// Receives every frame drained from the local segment
pub type FrameDispatcher = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Notified with the node id of a peer found dead
pub type PeerLostCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Transport delivery counters
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub send_failures: u64,
    pub frames_received: u64,
    pub peers_lost: u64,
}

struct PeerConnection {
    segment: Arc<NodeSegment>,
    queue_index: usize,
}

struct TransportShared {
    node_id: String,
    local: NodeSegment,
    directory: Arc<NodeDirectory>,
    peers: Mutex<HashMap<String, PeerConnection>>,
    running: AtomicBool,
    heartbeat_interval_ms: u64,
    node_timeout_ms: u64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    frames_received: AtomicU64,
    peers_lost: AtomicU64,
}

/// Shared-memory transport bound to one node
pub struct ShmTransport {
    shared: Arc<TransportShared>,
    recv_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    heartbeat_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ShmTransport {
    /// Create the local segment and register it in the directory
    pub fn new(node_id: &str, config: &BusConfig, directory: Arc<NodeDirectory>) -> Result<Self> {
        let segment_name = node_segment_name(std::process::id(), node_id);
        let local = NodeSegment::create(
            &segment_name,
            config.max_inbound_queues,
            config.ring_bytes(),
        )?;
        directory.register(node_id, &segment_name)?;

        Ok(Self {
            shared: Arc::new(TransportShared {
                node_id: node_id.to_string(),
                local,
                directory,
                peers: Mutex::new(HashMap::new()),
                running: AtomicBool::new(true),
                heartbeat_interval_ms: config.heartbeat_interval_ms,
                node_timeout_ms: config.node_timeout_ms,
                frames_sent: AtomicU64::new(0),
                send_failures: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                peers_lost: AtomicU64::new(0),
            }),
            recv_thread: Mutex::new(None),
            heartbeat_thread: Mutex::new(None),
        })
    }

    /// Start the receive loop and the heartbeat ticker
    pub fn start(&self, dispatcher: FrameDispatcher, on_peer_lost: PeerLostCallback) {
        let shared = self.shared.clone();
        *self.recv_thread.lock().unwrap() = Some(
            std::thread::Builder::new()
                .name(format!("lrpc-recv-{}", self.shared.node_id))
                .spawn(move || receive_loop(shared, dispatcher, on_peer_lost))
                .expect("failed to spawn receive thread"),
        );

        let shared = self.shared.clone();
        *self.heartbeat_thread.lock().unwrap() = Some(
            std::thread::Builder::new()
                .name(format!("lrpc-beat-{}", self.shared.node_id))
                .spawn(move || heartbeat_loop(shared))
                .expect("failed to spawn heartbeat thread"),
        );
    }

    /// Send one framed packet to a peer node
    ///
    /// Payload copies happen with no transport lock held; only the peer-cache
    /// lookup takes the mutex.
    pub fn send(&self, dest_node_id: &str, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_MSG_SIZE {
            return Err(LrpcError::invalid_argument("bytes", "exceeds frame cap"));
        }
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(LrpcError::NotInitialized);
        }

        let (segment, queue_index) = self.connection_for(dest_node_id)?;
        let queue = segment.queue(queue_index)?;
        match queue.push(bytes) {
            Ok(()) => {
                self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.shared.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn connection_for(&self, dest_node_id: &str) -> Result<(Arc<NodeSegment>, usize)> {
        {
            let peers = self.shared.peers.lock().unwrap();
            if let Some(conn) = peers.get(dest_node_id) {
                return Ok((conn.segment.clone(), conn.queue_index));
            }
        }

        // Cache miss: consult the directory and attach, outside the lock
        let entry = self
            .shared
            .directory
            .find(dest_node_id)
            .ok_or_else(|| LrpcError::network(format!("peer {} not in directory", dest_node_id)))?;
        let segment = Arc::new(NodeSegment::open(&entry.segment_name)?);
        let queue_index = segment.claim_queue(&self.shared.node_id)?;
        debug!(
            "connected to peer {} via {} (queue {})",
            dest_node_id, entry.segment_name, queue_index
        );

        let mut peers = self.shared.peers.lock().unwrap();
        let conn = peers
            .entry(dest_node_id.to_string())
            .or_insert(PeerConnection {
                segment,
                queue_index,
            });
        Ok((conn.segment.clone(), conn.queue_index))
    }

    /// Drop a peer connection, releasing the claimed queue slot
    pub fn forget_peer(&self, node_id: &str) {
        let removed = self.shared.peers.lock().unwrap().remove(node_id);
        if let Some(conn) = removed {
            conn.segment.release_queue(conn.queue_index);
            debug!("released queue {} at peer {}", conn.queue_index, node_id);
        }
    }

    /// Node ids with live outbound connections
    pub fn connected_peers(&self) -> Vec<String> {
        self.shared.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Name of the local segment in the shm namespace
    pub fn local_segment_name(&self) -> String {
        self.shared.local.name().to_string()
    }

    /// Delivery counters snapshot
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            send_failures: self.shared.send_failures.load(Ordering::Relaxed),
            frames_received: self.shared.frames_received.load(Ordering::Relaxed),
            peers_lost: self.shared.peers_lost.load(Ordering::Relaxed),
        }
    }

    /// Stop threads, release claimed peer queues, unregister; idempotent
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        // Unblock the receive loop wherever it may be waiting
        for i in 0..self.shared.local.max_queues() as usize {
            if let Ok(queue) = self.shared.local.queue(i) {
                let _ = queue.kick();
            }
        }
        if let Some(handle) = self.recv_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.heartbeat_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        let peers: Vec<(String, PeerConnection)> =
            self.shared.peers.lock().unwrap().drain().collect();
        for (node_id, conn) in peers {
            conn.segment.release_queue(conn.queue_index);
            trace!("released claimed queue at {}", node_id);
        }

        if let Err(e) = self.shared.directory.unregister(&self.shared.node_id) {
            debug!("directory unregister on shutdown: {}", e);
        }
        info!("transport for {} stopped", self.shared.node_id);
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn heartbeat_loop(shared: Arc<TransportShared>) {
    let step = Duration::from_millis(100);
    let mut last_beat = Instant::now();
    shared.local.beat();

    while shared.running.load(Ordering::Acquire) {
        std::thread::sleep(step);
        if last_beat.elapsed() >= Duration::from_millis(shared.heartbeat_interval_ms) {
            shared.local.beat();
            if let Err(e) = shared.directory.update_heartbeat(&shared.node_id) {
                debug!("heartbeat update failed: {}", e);
            }
            last_beat = Instant::now();
        }
    }
}

fn receive_loop(
    shared: Arc<TransportShared>,
    dispatcher: FrameDispatcher,
    on_peer_lost: PeerLostCallback,
) {
    let mut scratch = vec![0u8; MAX_MSG_SIZE];
    let mut cached_queues: Vec<usize> = Vec::new();
    let mut cached_claims = u32::MAX;
    let mut iterations: u32 = 0;
    let mut idle_wakeups: u32 = 0;
    let mut last_maintenance = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        iterations = iterations.wrapping_add(1);

        // Rebuild the queue cache when claims changed or periodically; the
        // cache spares a full scan of every slot each pass
        let claims = shared.local.num_queues();
        if claims != cached_claims || iterations % CACHE_REFRESH_ITERATIONS == 0 {
            cached_queues.clear();
            for i in 0..shared.local.max_queues() as usize {
                if let Ok(queue) = shared.local.queue(i) {
                    if queue.flags() & QUEUE_FLAG_VALID != 0 {
                        cached_queues.push(i);
                    }
                }
            }
            cached_claims = claims;
        }

        let mut drained_total = 0;
        for &i in &cached_queues {
            let queue = match shared.local.queue(i) {
                Ok(queue) => queue,
                Err(_) => continue,
            };
            // Flags are validated every pass, independently of the cache
            if !queue.is_addressable() {
                if queue.flags() == 0 {
                    // Slot was reclaimed; rebuild the cache next pass
                    cached_claims = u32::MAX;
                }
                continue;
            }
            match queue.drain(DRAIN_BATCH, &mut scratch, |frame| {
                shared.frames_received.fetch_add(1, Ordering::Relaxed);
                dispatcher(frame);
            }) {
                Ok(n) => drained_total += n,
                Err(e) => {
                    warn!("corrupt frame on queue {}: {}", i, e);
                    if queue.corrupt_frames() >= CORRUPT_FRAME_LIMIT {
                        warn!("queue {} poisoned, reclaiming", i);
                        shared.local.reclaim_queue(i);
                        cached_claims = u32::MAX;
                    }
                }
            }
        }

        if last_maintenance.elapsed() >= Duration::from_millis(shared.heartbeat_interval_ms) {
            check_peer_liveness(&shared, &on_peer_lost);
            reclaim_dead_senders(&shared);
            last_maintenance = Instant::now();
        }

        if drained_total == 0 {
            idle_wakeups = idle_wakeups.saturating_add(1);
            let timeout = if idle_wakeups > IDLE_THRESHOLD {
                IDLE_TIMEOUT_LONG_MS
            } else {
                IDLE_TIMEOUT_SHORT_MS
            };
            // Block on the designated queue; the timeout bounds latency for
            // messages arriving on any other queue
            if let Ok(queue) = shared.local.queue(0) {
                if queue.pending() == 0 {
                    let _ = queue.wait(timeout);
                }
            }
        } else {
            idle_wakeups = 0;
        }
    }
}

/// Detect dead or stalled outbound peers and drop their connections
fn check_peer_liveness(shared: &Arc<TransportShared>, on_peer_lost: &PeerLostCallback) {
    let now = now_millis();
    let mut lost: Vec<(String, PeerConnection)> = Vec::new();

    {
        let mut peers = shared.peers.lock().unwrap();
        let dead: Vec<String> = peers
            .iter()
            .filter(|(_, conn)| {
                let heartbeat = conn.segment.writer_heartbeat();
                let stale = now.saturating_sub(heartbeat) > shared.node_timeout_ms;
                stale || !is_process_alive(conn.segment.owner_pid())
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            if let Some(conn) = peers.remove(&id) {
                lost.push((id, conn));
            }
        }
    }

    for (node_id, conn) in lost {
        warn!("peer {} is gone (stale heartbeat or dead pid)", node_id);
        conn.segment.release_queue(conn.queue_index);
        shared.peers_lost.fetch_add(1, Ordering::Relaxed);
        on_peer_lost(&node_id);
    }
}

/// Reclaim local inbound queues whose claiming sender has died
fn reclaim_dead_senders(shared: &Arc<TransportShared>) {
    for i in 0..shared.local.max_queues() as usize {
        let queue = match shared.local.queue(i) {
            Ok(queue) => queue,
            Err(_) => continue,
        };
        if queue.flags() & QUEUE_FLAG_VALID == 0 {
            continue;
        }
        let sender = queue.sender_id();
        if sender.is_empty() {
            continue;
        }
        match shared.directory.find(&sender) {
            Some(entry) if is_process_alive(entry.pid) => {}
            _ => {
                debug!("reclaiming queue {} from dead sender {}", i, sender);
                shared.local.reclaim_queue(i);
            }
        }
    }
}
