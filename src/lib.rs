//! # lrpc - peer-to-peer topic pub/sub over shared memory
//!
//! lrpc is a topic-oriented publish/subscribe bus for processes on one
//! machine. Endpoints are *nodes* with stable identifiers; nodes advertise
//! which `(group, topic)` subjects they consume and publishers deliver only
//! to advertised consumers. Two transports cooperate behind one publish API:
//!
//! - **In-process**: direct hand-off into sibling nodes' work queues
//! - **Shared memory**: lock-free per-sender ring buffers in POSIX shared
//!   memory, one inbound queue per sender→receiver pair
//!
//! Oversized payloads travel through separately named multi-reader
//! *large-data channels*, announced on the bus by notification records.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Node                            │
//! │  subscriptions │ publish routing │ bounded worker pool │
//! └───────┬──────────────────┬─────────────────┬───────────┘
//!         │                  │                 │
//!   InProcessRouter   ServiceRegistry   SharedMemoryTransport
//!         │                  │                 │
//!    sibling nodes    register/unregister   NodeSegment
//!                      join/leave msgs     (SPSC rings + sems)
//!                                               │
//!                                        GlobalNodeDirectory
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use lrpc::{BusContext, Node};
//!
//! let ctx = BusContext::new().unwrap();
//! let consumer = Node::create(&ctx, "consumer").unwrap();
//! consumer
//!     .subscribe("sensor", &["temp"], |group, topic, payload| {
//!         println!("{}/{}: {} bytes", group, topic, payload.len());
//!     })
//!     .unwrap();
//!
//! let producer = Node::create(&ctx, "producer").unwrap();
//! producer.publish("sensor", "temp", b"25.5C").unwrap();
//! ```

// Core modules
pub mod config;
pub mod directory;
pub mod error;
pub mod large_data;
pub mod node;
pub mod notify;
pub mod packet;
pub mod ring;
pub mod router;
pub mod segment;
pub mod services;
pub mod shm;
pub mod sweeper;
pub mod transport;
pub mod workers;

// Main API re-exports
pub use config::{BusConfig, OverflowPolicy};
pub use directory::{NodeDirectory, NodeEntry};
pub use error::{LrpcError, Result};
pub use large_data::{LargeDataChannel, LargeDataNotice};
pub use node::{BusContext, MessageCallback, Node, NodeStats};
pub use packet::{MessageType, Packet};
pub use ring::{RingBuffer, RingStats, MAX_MSG_SIZE};
pub use router::InProcessRouter;
pub use segment::{InboundQueue, NodeSegment};
pub use services::{ServiceDescriptor, ServiceRegistry, ServiceType, TransportKind};
pub use sweeper::{sweep_once, OrphanSweeper, SweepReport};
pub use transport::{ShmTransport, TransportStats};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
