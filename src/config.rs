//! Bus configuration with environment overrides and range clamping

use serde::{Deserialize, Serialize};

use crate::ring::MAX_MSG_SIZE;

/// Aligned size of a maximum-size frame (8-byte header + payload, 8-aligned)
const FRAME_SLOT_BYTES: usize = (8 + MAX_MSG_SIZE + 7) & !7;

/// Overflow policy for bounded worker queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room (default)
    DropOldest,
    /// Drop the incoming item
    DropNewest,
    /// Wait for space; degrades to DropOldest when the enqueuer must not block
    Block,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropOldest
    }
}

/// Configuration for a bus context and its nodes
///
/// Every field has a sane default and a clamped range; `from_env` reads
/// `LRPC_*` environment variables and falls back to the default on missing or
/// unparsable values before clamping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Inbound queue slots per node segment (clamp 8..=64)
    pub max_inbound_queues: u32,
    /// Per-queue ring capacity in maximum-size message slots (clamp 64..=1024)
    pub queue_capacity: u32,
    /// Worker threads delivering user callbacks (clamp 1..=16)
    pub num_processing_threads: u32,
    /// Bounded length of each worker queue, in items
    pub max_queue_size: usize,
    /// Interval between writer/directory heartbeats, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Peer considered dead when its heartbeat is older than this
    pub node_timeout_ms: u64,
    /// Total byte size of a large-data channel ring
    pub large_data_buffer_size: usize,
    /// Maximum single block accepted by a large-data channel
    pub large_data_max_block_size: usize,
    /// Worker-queue overflow policy
    pub overflow_policy: OverflowPolicy,
    /// Log level filter name ("error", "warn", "info", "debug", "trace")
    pub log_level: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_inbound_queues: 32,
            queue_capacity: 1024,
            num_processing_threads: 4,
            max_queue_size: 25_000,
            heartbeat_interval_ms: 1_000,
            node_timeout_ms: 5_000,
            large_data_buffer_size: 64 * 1024 * 1024,
            large_data_max_block_size: 8 * 1024 * 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            log_level: "info".to_string(),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl BusConfig {
    /// Build a configuration from `LRPC_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut config = Self {
            max_inbound_queues: env_u64(
                "LRPC_MAX_INBOUND_QUEUES",
                defaults.max_inbound_queues as u64,
            ) as u32,
            queue_capacity: env_u64("LRPC_QUEUE_CAPACITY", defaults.queue_capacity as u64) as u32,
            num_processing_threads: env_u64(
                "LRPC_NUM_PROCESSING_THREADS",
                defaults.num_processing_threads as u64,
            ) as u32,
            max_queue_size: env_u64("LRPC_MAX_QUEUE_SIZE", defaults.max_queue_size as u64)
                as usize,
            heartbeat_interval_ms: env_u64(
                "LRPC_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            node_timeout_ms: env_u64("LRPC_NODE_TIMEOUT_MS", defaults.node_timeout_ms),
            large_data_buffer_size: env_u64(
                "LRPC_LARGE_DATA_BUFFER_SIZE",
                defaults.large_data_buffer_size as u64,
            ) as usize,
            large_data_max_block_size: env_u64(
                "LRPC_LARGE_DATA_MAX_BLOCK_SIZE",
                defaults.large_data_max_block_size as u64,
            ) as usize,
            overflow_policy: defaults.overflow_policy,
            log_level: std::env::var("LRPC_LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.clamp();
        config
    }

    /// Clamp every field into its supported range
    pub fn clamp(&mut self) {
        self.max_inbound_queues = self.max_inbound_queues.clamp(8, 64);
        self.queue_capacity = self.queue_capacity.clamp(64, 1024);
        self.num_processing_threads = self.num_processing_threads.clamp(1, 16);
        self.max_queue_size = self.max_queue_size.max(1);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(100);
        self.node_timeout_ms = self.node_timeout_ms.max(self.heartbeat_interval_ms);
        self.large_data_max_block_size = self
            .large_data_max_block_size
            .min(self.large_data_buffer_size / 2);
    }

    /// Per-queue ring data area in bytes
    pub fn ring_bytes(&self) -> usize {
        self.queue_capacity as usize * FRAME_SLOT_BYTES
    }

    /// Log level filter corresponding to `log_level`
    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.log_level.to_ascii_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.max_inbound_queues, 32);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.num_processing_threads, 4);
        assert_eq!(config.max_queue_size, 25_000);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_clamping() {
        let mut config = BusConfig {
            max_inbound_queues: 1,
            queue_capacity: 10,
            num_processing_threads: 100,
            ..BusConfig::default()
        };
        config.clamp();
        assert_eq!(config.max_inbound_queues, 8);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.num_processing_threads, 16);

        let mut config = BusConfig {
            max_inbound_queues: 100,
            queue_capacity: 2000,
            ..BusConfig::default()
        };
        config.clamp();
        assert_eq!(config.max_inbound_queues, 64);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn test_ring_bytes() {
        let config = BusConfig::default();
        // 1024 slots of 2048 bytes each
        assert_eq!(config.ring_bytes(), 1024 * 2048);
    }

    #[test]
    fn test_log_level_filter() {
        let mut config = BusConfig::default();
        assert_eq!(config.log_level_filter(), log::LevelFilter::Info);
        config.log_level = "debug".to_string();
        assert_eq!(config.log_level_filter(), log::LevelFilter::Debug);
        config.log_level = "bogus".to_string();
        assert_eq!(config.log_level_filter(), log::LevelFilter::Info);
    }
}
