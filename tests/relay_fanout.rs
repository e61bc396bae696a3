//! Relay fan-out: bounded subscriber queues, late attach, broker outages.

use bluesky_bridge::bridge_core::{
    ChannelSchema, DType, DataKey, DescriptorDoc, Document, EventDoc, RelayRecord, Sample,
    SampleValue, ScanDefaults, ScanInfo, StartDoc, StopDoc, StreamKey,
};
use bluesky_bridge::bridge_storage::{MemoryArchive, StreamStore};
use bluesky_bridge::config::{BridgeConfig, RelayMode, StorageBackend};
use bluesky_bridge::context::BridgeContext;
use bluesky_bridge::relay::{
    BrokerServer, RelayBroker, RelayMessage, RelayPump, RemoteBrokerSink, RemoteSubscriber,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn record(seq: u64) -> RelayRecord {
    RelayRecord {
        run_id: "r1".to_string(),
        channel: "det1".to_string(),
        sample: Sample::new(seq, seq as f64, SampleValue::Float(seq as f64)),
    }
}

fn drain_seqs(sub: &bluesky_bridge::relay::Subscription) -> (Vec<u64>, u64) {
    let mut seqs = Vec::new();
    let mut dropped = 0;
    while let Some(message) = sub.try_recv() {
        match message {
            RelayMessage::Record(r) => seqs.push(r.sample.seq),
            RelayMessage::Dropped { count } => dropped += count,
        }
    }
    (seqs, dropped)
}

#[test]
fn test_slow_subscriber_never_blocks_publisher() {
    let broker = RelayBroker::new(8);
    let slow = broker.attach(None);

    let started = Instant::now();
    for seq in 0..10_000 {
        broker.publish_records(&[record(seq)]);
    }
    // Nobody drained `slow`; publishing still completed without waiting on it
    assert!(started.elapsed() < Duration::from_secs(5));

    let (seqs, dropped) = drain_seqs(&slow);
    assert_eq!(seqs, (9_992..10_000).collect::<Vec<_>>());
    assert_eq!(dropped, 9_992);
    assert_eq!(slow.dropped_total(), 9_992);
}

#[test]
fn test_late_subscriber_sees_in_order_live_subsequence() {
    let broker = RelayBroker::new(1024);
    let early = broker.attach(None);
    for seq in 0..50 {
        broker.publish_records(&[record(seq)]);
    }
    let late = broker.attach(None);
    for seq in 50..100 {
        broker.publish_records(&[record(seq)]);
    }

    let (early_seqs, early_dropped) = drain_seqs(&early);
    let (late_seqs, late_dropped) = drain_seqs(&late);
    assert_eq!(early_seqs, (0..100).collect::<Vec<_>>());
    assert_eq!(late_seqs, (50..100).collect::<Vec<_>>());
    assert_eq!(early_dropped + late_dropped, 0);
}

#[tokio::test]
async fn test_local_relay_follows_pipeline() {
    let mut config = BridgeConfig::default();
    config.storage.backend = StorageBackend::Memory;
    config.relay.mode = RelayMode::Local;
    let ctx = BridgeContext::build(config).unwrap();
    let mut sub = ctx.broker().unwrap().attach(Some("R1".to_string()));

    let desc = DescriptorDoc::new("R1", "primary").with_data_key("det1", DataKey::number("sim"));
    let desc_uid = desc.uid.clone();
    let handle = ctx.handle();
    handle
        .submit(Document::Start(StartDoc::new("count").with_uid("R1")))
        .await
        .unwrap();
    handle.submit(Document::Descriptor(desc)).await.unwrap();
    for i in 0..5u64 {
        handle
            .submit(Document::Event(EventDoc::new(&desc_uid, i + 1).with_datum("det1", i as f64)))
            .await
            .unwrap();
    }
    handle.submit(Document::Stop(StopDoc::success("R1"))).await.unwrap();
    handle.drain().await.unwrap();

    // det1 and the implicit time channel, 5 samples each, order kept per channel
    let mut per_channel: std::collections::BTreeMap<String, Vec<u64>> = Default::default();
    while per_channel.values().map(Vec::len).sum::<usize>() < 10 {
        let message = timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("relay delivered in time");
        match message {
            Some(RelayMessage::Record(r)) => per_channel.entry(r.channel).or_default().push(r.sample.seq),
            other => panic!("unexpected {:?}", other),
        }
    }
    for seqs in per_channel.values() {
        assert_eq!(seqs, &(0..5).collect::<Vec<_>>());
    }

    drop(handle);
    drop(sub);
    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_broker_outage_resumes_without_gaps() {
    let store = Arc::new(StreamStore::new(Arc::new(MemoryArchive::new()), 4));
    let start = StartDoc::new("count").with_uid("r1");
    store
        .open_scan(ScanInfo::from_start(&start, &ScanDefaults::default()))
        .unwrap();
    store
        .create_channel("r1", ChannelSchema::scalar("det1", DType::Float64))
        .unwrap();
    let key = StreamKey::new("r1", "det1");

    // Reserve a publish port with nothing listening on it yet
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let publish_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let broker = RelayBroker::new(1024);
    let server = BrokerServer::new(broker.clone());
    let cancel = CancellationToken::new();
    let subscribe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let subscribe_addr = subscribe.local_addr().unwrap().to_string();
    tokio::spawn(server.clone().serve_subscribers(subscribe, cancel.clone()));
    let mut subscriber = RemoteSubscriber::connect(&subscribe_addr, None).await.unwrap();
    timeout(Duration::from_secs(2), async {
        while broker.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let pump = RelayPump::new(
        store.clone(),
        Arc::new(RemoteBrokerSink::new(publish_addr.to_string())),
        4,
        Duration::from_millis(5),
        Duration::from_millis(50),
    );
    tokio::spawn(pump.run(cancel.clone()));

    // Written while the broker is down; the ring only keeps 4 of them
    for seq in 0..20 {
        store
            .append(&key, Sample::new(seq, 0.0, SampleValue::Float(seq as f64)))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    let publish = TcpListener::bind(publish_addr).await.unwrap();
    tokio::spawn(server.serve_publishers(publish, cancel.clone()));

    let mut seqs = Vec::new();
    while seqs.len() < 20 {
        let message = timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .expect("relay resumed in time")
            .unwrap();
        match message {
            Some(RelayMessage::Record(r)) => seqs.push(r.sample.seq),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    cancel.cancel();
}
