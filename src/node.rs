//! Node runtime: the user-visible endpoint of the bus
//!
//! A node subscribes to `(group, topic)` subjects, publishes to them, and
//! reconciles the in-process fast path with the shared-memory transport.
//! Process-wide collaborators (router, service registry, directory, orphan
//! sweeper) live in a [`BusContext`] created once per program and injected
//! into every node.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::config::{BusConfig, OverflowPolicy};
use crate::directory::NodeDirectory;
use crate::error::{LrpcError, Result};
use crate::large_data::{LargeDataChannel, LargeDataNotice};
use crate::packet::{MessageType, Packet, MAX_NODE_ID_LEN};
use crate::router::{InProcessEndpoint, InProcessRouter};
use crate::services::{
    RegisterPayload, ServiceDescriptor, ServiceRegistry, ServiceType, TransportKind,
};
use crate::sweeper::OrphanSweeper;
use crate::transport::{ShmTransport, TransportStats};
use crate::workers::{OverflowCallback, WorkItem, WorkerPool};

/// User callback receiving `(group, topic, payload)`
pub type MessageCallback = dyn Fn(&str, &str, &[u8]) + Send + Sync;

/// Process-wide bus state, created once and injected into every node
///
/// Holding the router and service registry here (instead of hidden globals)
/// gives them an explicit lifecycle: they exist from context creation to
/// context drop, and tests can run several isolated buses side by side.
pub struct BusContext {
    config: BusConfig,
    router: InProcessRouter,
    services: ServiceRegistry,
    directory: Arc<NodeDirectory>,
    /// One cleanup master per process
    _sweeper: OrphanSweeper,
}

impl BusContext {
    /// Create a context from `LRPC_*` environment variables
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(BusConfig::from_env())
    }

    /// Create a context with an explicit configuration
    pub fn with_config(config: BusConfig) -> Result<Arc<Self>> {
        let directory = Arc::new(NodeDirectory::open_default()?);
        Ok(Self::build(config, directory))
    }

    /// Create a context bound to a non-default directory segment
    ///
    /// Exists for tests that need isolated bus instances on one machine.
    #[doc(hidden)]
    pub fn with_directory_name(config: BusConfig, directory_name: &str) -> Result<Arc<Self>> {
        let directory = Arc::new(NodeDirectory::open_named(directory_name)?);
        Ok(Self::build(config, directory))
    }

    fn build(mut config: BusConfig, directory: Arc<NodeDirectory>) -> Arc<Self> {
        config.clamp();
        let sweeper = OrphanSweeper::start(directory.clone(), config.node_timeout_ms);
        Arc::new(Self {
            config,
            router: InProcessRouter::new(),
            services: ServiceRegistry::new(),
            directory,
            _sweeper: sweeper,
        })
    }

    /// Effective (clamped) configuration
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// In-process node router
    pub fn router(&self) -> &InProcessRouter {
        &self.router
    }

    /// Process-wide service registry
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Global node directory
    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }
}

struct Subscription {
    topics: HashSet<String>,
    callback: Arc<MessageCallback>,
    policy: OverflowPolicy,
}

/// Counters exposed by [`Node::stats`]
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStats {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub worker_dropped: u64,
    pub worker_backlog: usize,
    pub transport: TransportStats,
}

/// Shared node state; the public [`Node`] wraps it in an `Arc`
pub struct NodeShared {
    node_id: String,
    ctx: Arc<BusContext>,
    running: AtomicBool,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    transport: ShmTransport,
    workers: OnceLock<WorkerPool>,
    channels: Mutex<HashMap<String, Arc<Mutex<LargeDataChannel>>>>,
    /// Large-data advertisements to replay for late joiners
    advertised_channels: Mutex<Vec<(String, String, RegisterPayload)>>,
    overflow_callback: Mutex<Option<Arc<OverflowCallback>>>,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
}

fn generate_node_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("node_{:012x}_{}", crate::directory::now_millis(), seq)
}

fn validate_node_id(node_id: &str) -> Result<()> {
    if node_id.is_empty() || node_id.len() > MAX_NODE_ID_LEN {
        return Err(LrpcError::invalid_argument(
            "node_id",
            format!("must be 1..={} bytes", MAX_NODE_ID_LEN),
        ));
    }
    if !node_id.chars().all(|c| c.is_ascii_graphic()) {
        return Err(LrpcError::invalid_argument(
            "node_id",
            "must be printable ASCII without spaces",
        ));
    }
    Ok(())
}

impl NodeShared {
    fn check_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LrpcError::NotInitialized)
        }
    }

    /// Entry point for every frame the transport drains
    fn handle_frame(&self, bytes: &[u8]) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping malformed frame: {}", e);
                return;
            }
        };
        // A node never observes its own messages
        if packet.source_node_id == self.node_id {
            return;
        }
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        match packet.msg_type {
            MessageType::Data => self.handle_data(packet),
            MessageType::ServiceRegister => self.handle_service_register(packet),
            MessageType::ServiceUnregister => {
                self.ctx.services().unregister(
                    &packet.source_node_id,
                    &packet.group,
                    &packet.topic,
                );
            }
            MessageType::NodeJoin => self.announce_services_to(&packet.source_node_id),
            MessageType::NodeLeave => {
                debug!("node {} left", packet.source_node_id);
                self.ctx.services().remove_node(&packet.source_node_id);
                self.transport.forget_peer(&packet.source_node_id);
            }
            MessageType::Heartbeat => {}
            MessageType::Subscribe
            | MessageType::Unsubscribe
            | MessageType::QuerySubscriptions
            | MessageType::SubscriptionReply => {
                trace!("ignoring datagram discovery message {:?}", packet.msg_type);
            }
        }
    }

    fn handle_data(&self, packet: Packet) {
        let policy = {
            let subs = self.subscriptions.lock().unwrap();
            match subs.get(&packet.group) {
                Some(sub) if sub.topics.contains(&packet.topic) => sub.policy,
                _ => return,
            }
        };
        if let Some(workers) = self.workers.get() {
            workers.dispatch(
                WorkItem {
                    source_node_id: packet.source_node_id,
                    group: packet.group,
                    topic: packet.topic,
                    payload: packet.payload,
                    enqueued_at: Instant::now(),
                },
                policy,
            );
        }
    }

    fn handle_service_register(&self, packet: Packet) {
        let payload: RegisterPayload = match bincode::deserialize(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                trace!("dropping register with bad payload: {}", e);
                return;
            }
        };
        self.ctx.services().register(ServiceDescriptor {
            node_id: packet.source_node_id,
            group: packet.group,
            topic: packet.topic,
            service_type: payload.service_type,
            transport: payload.transport,
            channel_name: payload.channel_name,
            udp_endpoint: payload.udp_endpoint,
        });
    }

    /// Worker-thread delivery of one queued message
    fn deliver(&self, item: WorkItem) {
        let callback = {
            let subs = self.subscriptions.lock().unwrap();
            match subs.get(&item.group) {
                // Re-checked at delivery: the subscription may be gone by now
                Some(sub) if sub.topics.contains(&item.topic) => sub.callback.clone(),
                _ => return,
            }
        };
        callback(&item.group, &item.topic, &item.payload);
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn on_peer_lost(&self, node_id: &str) {
        self.ctx.services().remove_node(node_id);
    }

    /// Send a system packet to every remote peer in the directory
    ///
    /// Same-process nodes are skipped: they share the context and are covered
    /// by the in-process paths.
    fn broadcast_system(&self, msg_type: MessageType, group: &str, topic: &str, payload: &[u8]) {
        let encoded = match Packet::encode(msg_type, &self.node_id, group, topic, payload, 0) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("cannot encode {:?} packet: {}", msg_type, e);
                return;
            }
        };
        for entry in self.ctx.directory().all_nodes() {
            if entry.node_id == self.node_id || self.ctx.router().contains(&entry.node_id) {
                continue;
            }
            if let Err(e) = self.transport.send(&entry.node_id, &encoded) {
                trace!("system {:?} to {} failed: {}", msg_type, entry.node_id, e);
            }
        }
    }

    fn send_system_to(
        &self,
        dest: &str,
        msg_type: MessageType,
        group: &str,
        topic: &str,
        payload: &[u8],
    ) {
        match Packet::encode(msg_type, &self.node_id, group, topic, payload, 0) {
            Ok(encoded) => {
                if let Err(e) = self.transport.send(dest, &encoded) {
                    trace!("system {:?} to {} failed: {}", msg_type, dest, e);
                }
            }
            Err(e) => warn!("cannot encode {:?} packet: {}", msg_type, e),
        }
    }

    /// Replay all local advertisements to a late joiner
    fn announce_services_to(&self, joiner: &str) {
        debug!("announcing services to joiner {}", joiner);
        let subjects: Vec<(String, String)> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter()
                .flat_map(|(group, sub)| {
                    sub.topics
                        .iter()
                        .map(|topic| (group.clone(), topic.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let register = RegisterPayload {
            service_type: ServiceType::NormalMessage,
            transport: TransportKind::SharedMemory,
            channel_name: None,
            udp_endpoint: None,
        };
        if let Ok(payload) = bincode::serialize(&register) {
            for (group, topic) in subjects {
                self.send_system_to(joiner, MessageType::ServiceRegister, &group, &topic, &payload);
            }
        }

        let channels = self.advertised_channels.lock().unwrap().clone();
        for (group, topic, register) in channels {
            if let Ok(payload) = bincode::serialize(&register) {
                self.send_system_to(joiner, MessageType::ServiceRegister, &group, &topic, &payload);
            }
        }
    }

    fn channel(&self, channel_name: &str) -> Result<Arc<Mutex<LargeDataChannel>>> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(chan) = channels.get(channel_name) {
            return Ok(chan.clone());
        }
        let chan = Arc::new(Mutex::new(LargeDataChannel::open_or_create(
            channel_name,
            self.ctx.config().large_data_buffer_size,
            self.ctx.config().large_data_max_block_size,
        )?));
        channels.insert(channel_name.to_string(), chan.clone());
        Ok(chan)
    }
}

impl InProcessEndpoint for NodeShared {
    fn endpoint_id(&self) -> &str {
        &self.node_id
    }

    fn matches_subscription(&self, group: &str, topic: &str) -> bool {
        let subs = self.subscriptions.lock().unwrap();
        subs.get(group)
            .map(|sub| sub.topics.contains(topic))
            .unwrap_or(false)
    }

    fn enqueue_delivery(&self, source_node_id: &str, group: &str, topic: &str, payload: &[u8]) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let policy = {
            let subs = self.subscriptions.lock().unwrap();
            match subs.get(group) {
                Some(sub) if sub.topics.contains(topic) => sub.policy,
                _ => return,
            }
        };
        if let Some(workers) = self.workers.get() {
            workers.dispatch(
                WorkItem {
                    source_node_id: source_node_id.to_string(),
                    group: group.to_string(),
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    enqueued_at: Instant::now(),
                },
                policy,
            );
        }
    }
}

/// A bus endpoint with a stable identity
///
/// Dropping the node shuts it down; shutdown is also callable explicitly and
/// is idempotent.
pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    /// Create a node; an empty id gets a generated one
    pub fn create(ctx: &Arc<BusContext>, node_id: &str) -> Result<Node> {
        let node_id = if node_id.is_empty() {
            generate_node_id()
        } else {
            node_id.to_string()
        };
        validate_node_id(&node_id)?;

        if ctx.router().contains(&node_id) {
            return Err(LrpcError::already_exists(format!("node id {}", node_id)));
        }

        let transport = ShmTransport::new(&node_id, ctx.config(), ctx.directory().clone())?;
        let shared = Arc::new(NodeShared {
            node_id: node_id.clone(),
            ctx: ctx.clone(),
            running: AtomicBool::new(true),
            subscriptions: Mutex::new(HashMap::new()),
            transport,
            workers: OnceLock::new(),
            channels: Mutex::new(HashMap::new()),
            advertised_channels: Mutex::new(Vec::new()),
            overflow_callback: Mutex::new(None),
            messages_published: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
        });

        // Worker pool and transport threads hold weak handles only, so a
        // dropped node unblocks and the threads exit instead of dangling
        let weak = Arc::downgrade(&shared);
        let handler = Arc::new(move |item: WorkItem| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(item);
            }
        });
        let weak = Arc::downgrade(&shared);
        let overflow = Arc::new(move |group: &str, topic: &str, total: u64| {
            if let Some(shared) = weak.upgrade() {
                let callback = shared.overflow_callback.lock().unwrap().clone();
                if let Some(cb) = callback {
                    cb(group, topic, total);
                }
            }
        });
        let pool = WorkerPool::new(
            ctx.config().num_processing_threads as usize,
            ctx.config().max_queue_size,
            handler,
            Some(overflow),
        );
        if shared.workers.set(pool).is_err() {
            return Err(LrpcError::unexpected("worker pool initialized twice"));
        }

        let weak = Arc::downgrade(&shared);
        let dispatcher = Box::new(move |frame: &[u8]| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_frame(frame);
            }
        });
        let weak = Arc::downgrade(&shared);
        let peer_lost = Box::new(move |peer: &str| {
            if let Some(shared) = weak.upgrade() {
                shared.on_peer_lost(peer);
            }
        });
        shared.transport.start(dispatcher, peer_lost);

        let endpoint: Arc<dyn InProcessEndpoint> = shared.clone();
        ctx.router().register(&node_id, Arc::downgrade(&endpoint));

        // Late joiners learn existing services through the join broadcast
        shared.broadcast_system(MessageType::NodeJoin, "", "", &[]);

        info!("node {} is up", node_id);
        Ok(Node { shared })
    }

    /// This node's identifier
    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// Publish a payload to every subscriber of `(group, topic)`
    ///
    /// Fan-out covers same-process siblings through the in-process fast path
    /// and remote consumers through shared memory. A destination present in
    /// both is delivered exactly once (the in-process path wins). The caller
    /// sees `Timeout` when some remote queue applied backpressure.
    pub fn publish(&self, group: &str, topic: &str, payload: &[u8]) -> Result<()> {
        if group.is_empty() || topic.is_empty() {
            return Err(LrpcError::invalid_argument("subject", "group and topic required"));
        }
        self.shared.check_running()?;
        let shared = &self.shared;

        // In-process fast path: zero-copy hand-off into sibling work queues
        for sibling in shared.ctx.router().live_nodes() {
            if sibling.endpoint_id() == shared.node_id {
                continue;
            }
            if sibling.matches_subscription(group, topic) {
                sibling.enqueue_delivery(&shared.node_id, group, topic, payload);
            }
        }

        // Remote consumers, deduplicated against the in-process path
        let remote: Vec<ServiceDescriptor> = shared
            .ctx
            .services()
            .consumers(group, topic, ServiceType::NormalMessage)
            .into_iter()
            .filter(|svc| {
                svc.node_id != shared.node_id && !shared.ctx.router().contains(&svc.node_id)
            })
            .collect();

        let mut backpressure = None;
        if !remote.is_empty() {
            if !Packet::fits_in_frame(group, topic, payload.len()) {
                return Err(LrpcError::invalid_argument(
                    "payload",
                    "too large for a frame; use send_large_data",
                ));
            }
            let encoded = Packet::encode(
                MessageType::Data,
                &shared.node_id,
                group,
                topic,
                payload,
                0,
            )?;
            for svc in remote {
                if svc.transport != TransportKind::SharedMemory {
                    trace!("skipping consumer {} (no datagram transport)", svc.node_id);
                    continue;
                }
                match shared.transport.send(&svc.node_id, &encoded) {
                    Ok(()) => {}
                    Err(e) if e.is_backpressure() => backpressure = Some(e),
                    Err(e) => debug!("publish to {} failed: {}", svc.node_id, e),
                }
            }
        }

        shared.messages_published.fetch_add(1, Ordering::Relaxed);
        match backpressure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Subscribe to topics in a group with the default overflow policy
    pub fn subscribe<F>(&self, group: &str, topics: &[&str], callback: F) -> Result<()>
    where
        F: Fn(&str, &str, &[u8]) + Send + Sync + 'static,
    {
        let policy = self.shared.ctx.config().overflow_policy;
        self.subscribe_with_policy(group, topics, policy, callback)
    }

    /// Subscribe with an explicit worker-queue overflow policy
    ///
    /// Repeated calls union the topics and replace the group's callback.
    pub fn subscribe_with_policy<F>(
        &self,
        group: &str,
        topics: &[&str],
        policy: OverflowPolicy,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&str, &str, &[u8]) + Send + Sync + 'static,
    {
        if group.is_empty() || topics.is_empty() || topics.iter().any(|t| t.is_empty()) {
            return Err(LrpcError::invalid_argument(
                "subscription",
                "group and topics must be non-empty",
            ));
        }
        self.shared.check_running()?;
        let shared = &self.shared;

        let callback: Arc<MessageCallback> = Arc::new(callback);
        {
            let mut subs = shared.subscriptions.lock().unwrap();
            let sub = subs
                .entry(group.to_string())
                .or_insert_with(|| Subscription {
                    topics: HashSet::new(),
                    callback: callback.clone(),
                    policy,
                });
            for topic in topics {
                sub.topics.insert(topic.to_string());
            }
            sub.callback = callback;
            sub.policy = policy;
        }

        let register = RegisterPayload {
            service_type: ServiceType::NormalMessage,
            transport: TransportKind::SharedMemory,
            channel_name: None,
            udp_endpoint: None,
        };
        let payload = bincode::serialize(&register)?;
        for topic in topics {
            // The process-wide table records the in-process reachability;
            // remote peers learn the shared-memory route from the broadcast
            shared.ctx.services().register(ServiceDescriptor {
                node_id: shared.node_id.clone(),
                group: group.to_string(),
                topic: topic.to_string(),
                service_type: ServiceType::NormalMessage,
                transport: TransportKind::InProcess,
                channel_name: None,
                udp_endpoint: None,
            });
            shared.broadcast_system(MessageType::ServiceRegister, group, topic, &payload);
        }
        Ok(())
    }

    /// Remove topics from a group subscription; an empty list removes all
    pub fn unsubscribe(&self, group: &str, topics: &[&str]) -> Result<()> {
        if group.is_empty() {
            return Err(LrpcError::invalid_argument("group", "must be non-empty"));
        }
        self.shared.check_running()?;
        let shared = &self.shared;

        let removed: Vec<String> = {
            let mut subs = shared.subscriptions.lock().unwrap();
            let Some(sub) = subs.get_mut(group) else {
                return Err(LrpcError::not_found(format!("subscription to {}", group)));
            };
            let removed: Vec<String> = if topics.is_empty() {
                sub.topics.drain().collect()
            } else {
                topics
                    .iter()
                    .filter(|t| sub.topics.remove(**t))
                    .map(|t| t.to_string())
                    .collect()
            };
            if sub.topics.is_empty() {
                subs.remove(group);
            }
            removed
        };

        for topic in &removed {
            shared.ctx.services().unregister(&shared.node_id, group, topic);
            shared.broadcast_system(MessageType::ServiceUnregister, group, topic, &[]);
        }
        Ok(())
    }

    /// Whether this node subscribes to `(group, topic)`
    pub fn is_subscribed(&self, group: &str, topic: &str) -> bool {
        self.shared.matches_subscription(group, topic)
    }

    /// Snapshot of `(group, topics)` subscriptions
    pub fn subscriptions(&self) -> Vec<(String, Vec<String>)> {
        let subs = self.shared.subscriptions.lock().unwrap();
        subs.iter()
            .map(|(group, sub)| {
                let mut topics: Vec<String> = sub.topics.iter().cloned().collect();
                topics.sort();
                (group.clone(), topics)
            })
            .collect()
    }

    /// Query the service registry; an empty group returns everything
    pub fn discover_services(&self, group: &str) -> Vec<ServiceDescriptor> {
        self.shared.ctx.services().find(group)
    }

    /// Ship an oversized payload through a named large-data channel
    ///
    /// The block lands in the channel ring; subscribers of `(group, topic)`
    /// receive a [`LargeDataNotice`] as a normal message and read the block
    /// with [`read_large_data`](Self::read_large_data).
    pub fn send_large_data(
        &self,
        group: &str,
        channel_name: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<()> {
        if group.is_empty() || topic.is_empty() || channel_name.is_empty() {
            return Err(LrpcError::invalid_argument(
                "subject",
                "group, channel and topic required",
            ));
        }
        self.shared.check_running()?;
        let shared = &self.shared;

        let channel = shared.channel(channel_name)?;
        let notice = channel.lock().unwrap().write_block(topic, payload)?;

        // First use of a channel on a subject advertises it to the bus
        let already = {
            let advertised = shared.advertised_channels.lock().unwrap();
            advertised
                .iter()
                .any(|(g, t, r)| g == group && t == topic && r.channel_name.as_deref() == Some(channel_name))
        };
        if !already {
            let register = RegisterPayload {
                service_type: ServiceType::LargeData,
                transport: TransportKind::SharedMemory,
                channel_name: Some(channel_name.to_string()),
                udp_endpoint: None,
            };
            shared.ctx.services().register(ServiceDescriptor {
                node_id: shared.node_id.clone(),
                group: group.to_string(),
                topic: topic.to_string(),
                service_type: ServiceType::LargeData,
                transport: TransportKind::InProcess,
                channel_name: Some(channel_name.to_string()),
                udp_endpoint: None,
            });
            if let Ok(payload) = bincode::serialize(&register) {
                shared.broadcast_system(MessageType::ServiceRegister, group, topic, &payload);
            }
            shared
                .advertised_channels
                .lock()
                .unwrap()
                .push((group.to_string(), topic.to_string(), register));
        }

        self.publish(group, topic, &notice.to_bytes()?)
    }

    /// Fetch the block a received notice refers to
    pub fn read_large_data(&self, notice: &LargeDataNotice) -> Result<(String, Vec<u8>)> {
        self.shared.check_running()?;
        let channel = self.shared.channel(&notice.channel)?;
        let mut channel = channel.lock().unwrap();
        channel.attach_reader()?;
        channel.read_block(notice.sequence)
    }

    /// Install a callback invoked as `(group, topic, dropped_total)` on
    /// worker-queue overflow
    pub fn set_overflow_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str, u64) + Send + Sync + 'static,
    {
        *self.shared.overflow_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Counters snapshot
    pub fn stats(&self) -> NodeStats {
        let workers = self.shared.workers.get();
        NodeStats {
            messages_published: self.shared.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.shared.messages_delivered.load(Ordering::Relaxed),
            worker_dropped: workers.map(WorkerPool::dropped).unwrap_or(0),
            worker_backlog: workers.map(WorkerPool::backlog).unwrap_or(0),
            transport: self.shared.transport.stats(),
        }
    }

    /// Orderly shutdown; safe to call more than once
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        // Peers drop our descriptors on the leave message; it must go out
        // while the transport still runs
        shared.broadcast_system(MessageType::NodeLeave, "", "", &[]);
        shared.ctx.services().remove_node(&shared.node_id);

        shared.transport.shutdown();
        if let Some(workers) = shared.workers.get() {
            workers.shutdown();
        }
        shared.ctx.router().unregister(&shared.node_id);
        info!("node {} is down", shared.node_id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
