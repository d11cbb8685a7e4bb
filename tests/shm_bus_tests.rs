//! Scenarios across bus contexts: the shared-memory path end to end
//!
//! Two `BusContext` instances sharing one directory segment behave like two
//! processes: their nodes are invisible to each other's in-process router, so
//! every delivery crosses the shared-memory transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lrpc::{BusConfig, BusContext, Node, TransportKind};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn paired_contexts(tag: &str) -> (Arc<BusContext>, Arc<BusContext>) {
    init_logging();
    let name = format!("/librpc_test_xbus_{}_{}", tag, std::process::id());
    let config = BusConfig {
        max_inbound_queues: 8,
        queue_capacity: 256,
        num_processing_threads: 2,
        heartbeat_interval_ms: 100,
        node_timeout_ms: 1_000,
        ..BusConfig::default()
    };
    let first = BusContext::with_directory_name(config.clone(), &name).unwrap();
    let second = BusContext::with_directory_name(config, &name).unwrap();
    (first, second)
}

fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..2000 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for: {}", what);
}

#[test]
fn test_cross_context_fanout_in_order() {
    let (ctx_a, ctx_b) = paired_contexts("fan");
    let node_a = Node::create(&ctx_a, "xfan_a").unwrap();
    let node_b = Node::create(&ctx_b, "xfan_b").unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    node_b
        .subscribe("sensor", &["temp"], move |_, _, payload| {
            sink.lock()
                .unwrap()
                .push(u32::from_le_bytes(payload.try_into().unwrap()));
        })
        .unwrap();

    // The subscribe broadcast must reach A's registry before publishing
    wait_until("A learns B's subscription", || {
        node_a
            .discover_services("sensor")
            .iter()
            .any(|s| s.node_id == "xfan_b" && s.transport == TransportKind::SharedMemory)
    });

    for i in 0..1000u32 {
        node_a.publish("sensor", "temp", &i.to_le_bytes()).unwrap();
    }

    wait_until("1000 deliveries", || received.lock().unwrap().len() == 1000);
    let received = received.lock().unwrap();
    assert_eq!(*received, (0..1000).collect::<Vec<u32>>());

    // The publisher itself saw nothing
    assert_eq!(node_a.stats().messages_delivered, 0);
}

#[test]
fn test_late_joiner_learns_existing_services() {
    let (ctx_a, ctx_b) = paired_contexts("join");
    let node_a = Node::create(&ctx_a, "xjoin_a").unwrap();
    node_a.subscribe("nav", &["pose"], |_, _, _| {}).unwrap();

    // B joins after A's register broadcast already happened; the NODE_JOIN
    // handshake replays A's advertisements to B
    let node_b = Node::create(&ctx_b, "xjoin_b").unwrap();
    wait_until("B learns A's subscription", || {
        node_b
            .discover_services("nav")
            .iter()
            .any(|s| s.node_id == "xjoin_a")
    });
}

#[test]
fn test_orderly_leave_removes_services() {
    let (ctx_a, ctx_b) = paired_contexts("leave");
    let node_a = Node::create(&ctx_a, "xleave_a").unwrap();

    {
        let node_b = Node::create(&ctx_b, "xleave_b").unwrap();
        node_b.subscribe("g", &["t"], |_, _, _| {}).unwrap();
        wait_until("A learns B", || {
            !node_a.discover_services("g").is_empty()
        });
        node_b.shutdown();
    }

    wait_until("A forgets B after leave", || {
        node_a.discover_services("g").is_empty()
    });
}

#[test]
fn test_unsubscribe_propagates() {
    let (ctx_a, ctx_b) = paired_contexts("unsub");
    let node_a = Node::create(&ctx_a, "xunsub_a").unwrap();
    let node_b = Node::create(&ctx_b, "xunsub_b").unwrap();

    node_b.subscribe("g", &["t"], |_, _, _| {}).unwrap();
    wait_until("A learns B", || !node_a.discover_services("g").is_empty());

    node_b.unsubscribe("g", &[]).unwrap();
    wait_until("A forgets the subscription", || {
        node_a.discover_services("g").is_empty()
    });
}

#[test]
fn test_large_data_across_contexts() {
    let (ctx_a, ctx_b) = paired_contexts("large");
    let node_a = Node::create(&ctx_a, "xlarge_a").unwrap();
    let node_b = Node::create(&ctx_b, "xlarge_b").unwrap();

    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    node_b
        .subscribe("g", &["frame"], move |_, _, payload| {
            sink.lock()
                .unwrap()
                .push(lrpc::LargeDataNotice::from_bytes(payload).unwrap());
        })
        .unwrap();
    wait_until("A learns B", || !node_a.discover_services("g").is_empty());

    let payload: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 233) as u8).collect();
    node_a
        .send_large_data("g", "xframe_chan", "frame", &payload)
        .unwrap();

    wait_until("notice arrives", || !notices.lock().unwrap().is_empty());
    let notice = notices.lock().unwrap()[0].clone();
    let (topic, block) = node_b.read_large_data(&notice).unwrap();
    assert_eq!(topic, "frame");
    assert_eq!(block, payload);

    // The channel advertisement travelled too
    wait_until("channel advertised", || {
        node_b.discover_services("g").iter().any(|s| {
            s.service_type == lrpc::ServiceType::LargeData
                && s.channel_name.as_deref() == Some("xframe_chan")
        })
    });
}
