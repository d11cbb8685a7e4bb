//! End-to-end scenarios for nodes sharing one process

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lrpc::{BusConfig, BusContext, Node, OverflowPolicy};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_context(tag: &str) -> Arc<BusContext> {
    init_logging();
    let name = format!("/librpc_test_bus_{}_{}", tag, std::process::id());
    let config = BusConfig {
        max_inbound_queues: 8,
        queue_capacity: 64,
        num_processing_threads: 2,
        heartbeat_interval_ms: 100,
        node_timeout_ms: 1_000,
        ..BusConfig::default()
    };
    BusContext::with_directory_name(config, &name).unwrap()
}

fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for: {}", what);
}

#[test]
fn test_in_process_single_hop() {
    let ctx = test_context("hop");
    let node_a = Node::create(&ctx, "hop_a").unwrap();
    let node_b = Node::create(&ctx, "hop_b").unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    node_b
        .subscribe("sensor", &["temp"], move |group, topic, payload| {
            sink.lock()
                .unwrap()
                .push((group.to_string(), topic.to_string(), payload.to_vec()));
        })
        .unwrap();

    node_a.publish("sensor", "temp", b"25.5C").unwrap();

    wait_until("delivery to B", || !received.lock().unwrap().is_empty());
    std::thread::sleep(Duration::from_millis(50));

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "sensor");
    assert_eq!(received[0].1, "temp");
    assert_eq!(received[0].2, b"25.5C");

    // The publisher saw nothing
    assert_eq!(node_a.stats().messages_delivered, 0);
}

#[test]
fn test_publisher_never_hears_itself() {
    let ctx = test_context("selfmute");
    let node = Node::create(&ctx, "self_sub").unwrap();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let count = deliveries.clone();
    node.subscribe("g", &["t"], move |_, _, _| {
        count.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    for _ in 0..20 {
        node.publish("g", "t", b"echo?").unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(deliveries.load(Ordering::SeqCst), 0);
}

#[test]
fn test_no_duplicate_delivery_for_local_siblings() {
    // B is both in the router and (as in-process descriptor) in the service
    // registry: 200 publishes must arrive exactly 200 times, never 400
    let ctx = test_context("dedup");
    let node_a = Node::create(&ctx, "dedup_a").unwrap();
    let node_b = Node::create(&ctx, "dedup_b").unwrap();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let count = deliveries.clone();
    node_b
        .subscribe("t", &["x"], move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    for i in 0..200u32 {
        node_a.publish("t", "x", &i.to_le_bytes()).unwrap();
    }

    wait_until("200 deliveries", || deliveries.load(Ordering::SeqCst) >= 200);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(deliveries.load(Ordering::SeqCst), 200);
}

#[test]
fn test_per_subject_ordering() {
    let ctx = test_context("order");
    let node_a = Node::create(&ctx, "order_a").unwrap();
    let node_b = Node::create(&ctx, "order_b").unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    node_b
        .subscribe("seq", &["nums"], move |_, _, payload| {
            sink.lock()
                .unwrap()
                .push(u32::from_le_bytes(payload.try_into().unwrap()));
        })
        .unwrap();

    for i in 0..500u32 {
        node_a.publish("seq", "nums", &i.to_le_bytes()).unwrap();
    }

    wait_until("500 deliveries", || received.lock().unwrap().len() == 500);
    let received = received.lock().unwrap();
    assert_eq!(*received, (0..500).collect::<Vec<u32>>());
}

#[test]
fn test_queue_full_drop_oldest_keeps_order() {
    init_logging();
    let name = format!("/librpc_test_bus_full_{}", std::process::id());
    let config = BusConfig {
        num_processing_threads: 1,
        max_queue_size: 10,
        ..BusConfig::default()
    };
    let ctx = BusContext::with_directory_name(config, &name).unwrap();

    let node_a = Node::create(&ctx, "full_a").unwrap();
    let node_b = Node::create(&ctx, "full_b").unwrap();

    let gate = Arc::new(Mutex::new(()));
    let blocker = gate.lock().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = received.clone();
    let worker_gate = gate.clone();
    node_b
        .subscribe_with_policy("burst", &["data"], OverflowPolicy::DropOldest, move |_, _, payload| {
            let _held = worker_gate.lock().unwrap();
            sink.lock()
                .unwrap()
                .push(u32::from_le_bytes(payload.try_into().unwrap()));
        })
        .unwrap();

    // The single worker parks on the gate while 50 messages pour in
    for i in 0..50u32 {
        node_a.publish("burst", "data", &i.to_le_bytes()).unwrap();
    }
    wait_until("queue overflow", || node_b.stats().worker_dropped >= 35);
    drop(blocker);

    wait_until("drain", || node_b.stats().worker_backlog == 0);
    std::thread::sleep(Duration::from_millis(50));

    let received = received.lock().unwrap();
    // A suffix survived, in order, ending with the newest message
    assert!(received.len() < 50);
    assert!(!received.is_empty());
    assert_eq!(*received.last().unwrap(), 49);
    assert!(received.windows(2).all(|w| w[0] < w[1]));
    assert!(node_b.stats().worker_dropped >= 35);
}

#[test]
fn test_overflow_callback_fires() {
    init_logging();
    let name = format!("/librpc_test_bus_ofcb_{}", std::process::id());
    let config = BusConfig {
        num_processing_threads: 1,
        max_queue_size: 5,
        ..BusConfig::default()
    };
    let ctx = BusContext::with_directory_name(config, &name).unwrap();
    let node_a = Node::create(&ctx, "ofcb_a").unwrap();
    let node_b = Node::create(&ctx, "ofcb_b").unwrap();

    let gate = Arc::new(Mutex::new(()));
    let blocker = gate.lock().unwrap();
    let worker_gate = gate.clone();
    node_b
        .subscribe("g", &["t"], move |_, _, _| {
            let _held = worker_gate.lock().unwrap();
        })
        .unwrap();

    let overflows = Arc::new(AtomicUsize::new(0));
    let overflow_count = overflows.clone();
    node_b.set_overflow_callback(move |group, topic, _total| {
        assert_eq!(group, "g");
        assert_eq!(topic, "t");
        overflow_count.fetch_add(1, Ordering::SeqCst);
    });

    for i in 0..30u32 {
        node_a.publish("g", "t", &i.to_le_bytes()).unwrap();
    }
    wait_until("overflow callback", || overflows.load(Ordering::SeqCst) > 0);
    drop(blocker);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let ctx = test_context("unsub");
    let node_a = Node::create(&ctx, "unsub_a").unwrap();
    let node_b = Node::create(&ctx, "unsub_b").unwrap();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let count = deliveries.clone();
    node_b
        .subscribe("g", &["t1", "t2"], move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    node_a.publish("g", "t1", b"first").unwrap();
    wait_until("first delivery", || deliveries.load(Ordering::SeqCst) == 1);

    node_b.unsubscribe("g", &["t1"]).unwrap();
    assert!(!node_b.is_subscribed("g", "t1"));
    assert!(node_b.is_subscribed("g", "t2"));

    node_a.publish("g", "t1", b"ignored").unwrap();
    node_a.publish("g", "t2", b"heard").unwrap();
    wait_until("t2 delivery", || deliveries.load(Ordering::SeqCst) == 2);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
}

#[test]
fn test_callback_replaced_on_resubscribe() {
    let ctx = test_context("recb");
    let node_a = Node::create(&ctx, "recb_a").unwrap();
    let node_b = Node::create(&ctx, "recb_b").unwrap();

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let count = first.clone();
    node_b
        .subscribe("g", &["t"], move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let count = second.clone();
    node_b
        .subscribe("g", &["t"], move |_, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    node_a.publish("g", "t", b"who hears this?").unwrap();
    wait_until("second callback", || second.load(Ordering::SeqCst) == 1);
    assert_eq!(first.load(Ordering::SeqCst), 0);
}

#[test]
fn test_large_data_roundtrip_in_process() {
    let ctx = test_context("large");
    let node_a = Node::create(&ctx, "large_a").unwrap();
    let node_b = Node::create(&ctx, "large_b").unwrap();

    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    node_b
        .subscribe("g", &["cloud"], move |_, _, payload| {
            sink.lock()
                .unwrap()
                .push(lrpc::LargeDataNotice::from_bytes(payload).unwrap());
        })
        .unwrap();

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();
    node_a
        .send_large_data("g", "pc_chan", "cloud", &payload)
        .unwrap();

    wait_until("notice", || !notices.lock().unwrap().is_empty());
    let notice = notices.lock().unwrap()[0].clone();
    assert_eq!(notice.channel, "pc_chan");
    assert_eq!(notice.size, payload.len() as u64);

    let (topic, block) = node_b.read_large_data(&notice).unwrap();
    assert_eq!(topic, "cloud");
    assert_eq!(block.len(), payload.len());
    assert_eq!(block, payload);
}
