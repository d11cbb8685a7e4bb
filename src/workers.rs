//! Bounded worker pool delivering messages to user callbacks
//!
//! Incoming messages are dispatched to a worker by hashing `(group, topic)`,
//! so delivery order per subject is preserved. Each worker owns one bounded
//! queue with a configurable overflow policy.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::config::OverflowPolicy;

/// One message awaiting callback delivery
#[derive(Debug)]
pub struct WorkItem {
    pub source_node_id: String,
    pub group: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
}

/// Invoked as `(group, topic, dropped_total)` when a queue sheds an item
pub type OverflowCallback = dyn Fn(&str, &str, u64) + Send + Sync;

/// Handler executing one work item on a worker thread
pub type WorkHandler = dyn Fn(WorkItem) + Send + Sync;

/// How long a `Block` enqueue waits before degrading to drop-oldest
const BLOCK_DEGRADE_MS: u64 = 50;

struct WorkerQueue {
    items: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
    space: Condvar,
    dropped: AtomicU64,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            space: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }
}

/// Fixed pool of worker threads with bounded per-worker queues
pub struct WorkerPool {
    queues: Vec<Arc<WorkerQueue>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    capacity: usize,
    overflow_callback: Option<Arc<OverflowCallback>>,
}

impl WorkerPool {
    /// Spawn `num_workers` threads delivering items through `handler`
    pub fn new(
        num_workers: usize,
        capacity: usize,
        handler: Arc<WorkHandler>,
        overflow_callback: Option<Arc<OverflowCallback>>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let queues: Vec<Arc<WorkerQueue>> =
            (0..num_workers.max(1)).map(|_| Arc::new(WorkerQueue::new())).collect();

        let threads = queues
            .iter()
            .enumerate()
            .map(|(i, queue)| {
                let queue = queue.clone();
                let running = running.clone();
                let handler = handler.clone();
                std::thread::Builder::new()
                    .name(format!("lrpc-worker-{}", i))
                    .spawn(move || worker_loop(queue, running, handler))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            queues,
            threads: Mutex::new(threads),
            running,
            capacity: capacity.max(1),
            overflow_callback,
        }
    }

    fn queue_for(&self, group: &str, topic: &str) -> &Arc<WorkerQueue> {
        let mut hasher = DefaultHasher::new();
        group.hash(&mut hasher);
        topic.hash(&mut hasher);
        &self.queues[(hasher.finish() as usize) % self.queues.len()]
    }

    /// Enqueue one item according to the overflow policy
    ///
    /// Never blocks indefinitely: the `Block` policy degrades to drop-oldest
    /// after a short wait so transport threads keep making progress.
    pub fn dispatch(&self, item: WorkItem, policy: OverflowPolicy) {
        let queue = self.queue_for(&item.group, &item.topic).clone();
        let mut items = queue.items.lock().unwrap();

        if items.len() >= self.capacity {
            match policy {
                OverflowPolicy::DropNewest => {
                    drop(items);
                    self.record_drop(&queue, &item.group, &item.topic);
                    return;
                }
                OverflowPolicy::Block => {
                    let deadline = Duration::from_millis(BLOCK_DEGRADE_MS);
                    let (guard, timeout) = queue
                        .space
                        .wait_timeout_while(items, deadline, |q| q.len() >= self.capacity)
                        .unwrap();
                    items = guard;
                    if timeout.timed_out() && items.len() >= self.capacity {
                        items.pop_front();
                        self.record_drop(&queue, &item.group, &item.topic);
                    }
                }
                OverflowPolicy::DropOldest => {
                    items.pop_front();
                    self.record_drop(&queue, &item.group, &item.topic);
                }
            }
        }

        items.push_back(item);
        drop(items);
        queue.available.notify_one();
    }

    fn record_drop(&self, queue: &WorkerQueue, group: &str, topic: &str) {
        let total = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("worker queue shed a message on ({}, {})", group, topic);
        if let Some(cb) = &self.overflow_callback {
            cb(group, topic, total);
        }
    }

    /// Total items shed across all queues
    pub fn dropped(&self) -> u64 {
        self.queues
            .iter()
            .map(|q| q.dropped.load(Ordering::Relaxed))
            .sum()
    }

    /// Items currently waiting across all queues
    pub fn backlog(&self) -> usize {
        self.queues.iter().map(|q| q.items.lock().unwrap().len()).sum()
    }

    /// Stop the pool: workers finish their queued backlog, then exit
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for queue in &self.queues {
            queue.available.notify_all();
            queue.space.notify_all();
        }
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("worker pool stopped ({} dropped in total)", self.dropped());
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: Arc<WorkerQueue>, running: Arc<AtomicBool>, handler: Arc<WorkHandler>) {
    loop {
        let item = {
            let mut items = queue.items.lock().unwrap();
            loop {
                if let Some(item) = items.pop_front() {
                    break item;
                }
                if !running.load(Ordering::Acquire) {
                    return;
                }
                items = queue.available.wait(items).unwrap();
            }
        };
        queue.space.notify_one();
        handler(item);
    }
}
