use minerwatch_rs::adapters::{AdapterSet, CgminerTcpAdapter, HttpDigestAdapter, HttpJsonAdapter};
use minerwatch_rs::config::PollerConfig;
use minerwatch_rs::device::{Device, DeviceRegistry, DeviceType, InMemoryRegistry};
use minerwatch_rs::monitoring::{MonitorEvent, PollOutcome, PollScheduler};
use minerwatch_rs::protocol::CgminerClient;
use minerwatch_rs::telemetry::MemorySink;
use minerwatch_rs::{DetectionOutcome, DeviceDetector};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

const HOUR_MS: u64 = 3_600_000;

/// 模拟 CGMiner API：每个连接读一条命令，回一段响应后关闭
struct MockMiner {
    healthy: AtomicBool,
    best_share: AtomicU64,
    connections: AtomicUsize,
}

impl MockMiner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            best_share: AtomicU64::new(262_144),
            connections: AtomicUsize::new(0),
        })
    }

    fn status_response(&self) -> String {
        let status = json!([{"STATUS": "S", "Code": 11, "Msg": "Summary"}]);
        json!({
            "summary": [{
                "STATUS": status,
                "SUMMARY": [{
                    "Elapsed": 5400,
                    "MHS 5s": "95000000.00",
                    "Accepted": 2210,
                    "Rejected": 4,
                    "Best Share": self.best_share.load(Ordering::SeqCst)
                }],
                "id": 1
            }],
            "pools": [{
                "STATUS": status,
                "POOLS": [{
                    "POOL": 0,
                    "URL": "stratum+tcp://pool.example.com:3333",
                    "User": "farm.s19",
                    "Status": "Alive",
                    "Stratum Difficulty": 65536.0
                }],
                "id": 1
            }],
            "stats": [{
                "STATUS": status,
                "STATS": [
                    {"CGMiner": "4.11.1", "Type": "Antminer S19"},
                    {"temp_num": 3, "temp1": 61, "temp2_1": 77, "fan_num": 2, "fan1": 5400, "fan2": 5520}
                ],
                "id": 1
            }],
            "id": 1
        })
        .to_string()
    }

    fn version_response() -> String {
        json!({
            "STATUS": [{"STATUS": "S", "Code": 22}],
            "VERSION": [{"CGMiner": "4.11.1", "API": "3.7"}],
            "id": 1
        })
        .to_string()
    }
}

async fn spawn_mock(miner: Arc<MockMiner>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let miner = miner.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                miner.connections.fetch_add(1, Ordering::SeqCst);

                // 故障时直接断开，不回任何数据
                if !miner.healthy.load(Ordering::SeqCst) {
                    return;
                }

                let body = if request.contains("\"version\"") {
                    MockMiner::version_response()
                } else {
                    miner.status_response()
                };
                let _ = socket.write_all(body.as_bytes()).await;
                let _ = socket.write_all(b"\0").await;
                let _ = socket.shutdown().await;
            });
        }
    });

    address
}

fn tcp_adapter() -> CgminerTcpAdapter {
    let client = CgminerClient::new(4028, Duration::from_secs(2), Duration::from_millis(100));
    CgminerTcpAdapter::new(client, 34.0)
}

fn drain(rx: &mut UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_cgminer_device_lifecycle() {
    let miner = MockMiner::new();
    let address = spawn_mock(miner.clone()).await;

    let device = Device::new(1, address.clone(), DeviceType::CgminerTcp).with_poll_interval(HOUR_MS);
    let registry = Arc::new(InMemoryRegistry::with_devices(vec![device.clone()]));
    let sink = Arc::new(MemorySink::new(10));
    let scheduler = PollScheduler::new(
        registry.clone(),
        sink.clone(),
        AdapterSet::new(vec![Arc::new(tcp_adapter())]),
        PollerConfig {
            failure_threshold: 2,
            ..PollerConfig::default()
        },
    );
    let mut rx = scheduler.subscribe();

    scheduler.start_polling(&device).await;
    assert!(scheduler.is_polling(1).await);

    // 首次成功：上线、新纪录、快照
    let snapshot = match scheduler.poll_device(1).await {
        PollOutcome::Online { snapshot } => snapshot,
        other => panic!("expected online, got {:?}", other),
    };
    assert_eq!(snapshot.vendor, DeviceType::CgminerTcp);
    assert_eq!(snapshot.hashrate, 95_000.0);
    assert_eq!(snapshot.power, 3230.0);
    assert_eq!(snapshot.model, "Antminer S19");
    assert_eq!(snapshot.firmware_version, "4.11.1");
    assert_eq!(snapshot.temperature, 77.0);
    assert_eq!(snapshot.fan_rpm, 5520.0);
    assert_eq!(snapshot.pool_host, "pool.example.com");
    assert_eq!(snapshot.pool_port, 3333);
    assert_eq!(snapshot.pool_difficulty, 65536.0);
    assert_eq!(snapshot.hostname, address);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], MonitorEvent::StatusChanged { online: true, .. }));
    assert!(matches!(events[1], MonitorEvent::NewRecord { difficulty, .. } if difficulty == 262_144.0));
    assert!(matches!(events[2], MonitorEvent::Snapshot { .. }));

    let stored = registry.get_device(1).await.unwrap();
    assert!(stored.online);
    assert_eq!(stored.best_difficulty, 262_144.0);
    assert_eq!(sink.count(1).await, 1);

    // 第一次失败只计数
    miner.healthy.store(false, Ordering::SeqCst);
    let outcome = scheduler.poll_device(1).await;
    assert!(matches!(
        outcome,
        PollOutcome::Failed { consecutive_failures: 1, offline: false, .. }
    ));
    assert!(registry.get_device(1).await.unwrap().online);

    // 第二次失败达到阈值
    let outcome = scheduler.poll_device(1).await;
    assert!(matches!(
        outcome,
        PollOutcome::Failed { consecutive_failures: 2, offline: true, .. }
    ));
    assert!(!registry.get_device(1).await.unwrap().online);
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], MonitorEvent::StatusChanged { online: false, .. }));

    // 恢复后重新上线，计数清零
    miner.healthy.store(true, Ordering::SeqCst);
    let outcome = scheduler.poll_device(1).await;
    assert!(outcome.is_success());
    assert_eq!(scheduler.failure_count(1).await, Some(0));
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, MonitorEvent::StatusChanged { online: true, .. })));
    // 最佳难度未变，不产生新纪录
    assert!(!events.iter().any(|e| matches!(e, MonitorEvent::NewRecord { .. })));

    assert!(scheduler.latest_snapshot(1).await.is_some());
    assert_eq!(sink.count(1).await, 2);

    scheduler.stop_all().await;
    assert!(matches!(scheduler.poll_device(1).await, PollOutcome::NotPolling));
}

#[tokio::test]
async fn test_timer_polls_mock_device() {
    let miner = MockMiner::new();
    let address = spawn_mock(miner.clone()).await;

    let device = Device::new(7, address, DeviceType::CgminerTcp).with_poll_interval(150);
    let registry = Arc::new(InMemoryRegistry::with_devices(vec![device.clone()]));
    let sink = Arc::new(MemorySink::new(100));
    let scheduler = PollScheduler::new(
        registry,
        sink.clone(),
        AdapterSet::new(vec![Arc::new(tcp_adapter())]),
        PollerConfig::default(),
    );

    scheduler.start_polling(&device).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    scheduler.stop_polling(7).await;

    let stored = sink.count(7).await;
    assert!(stored >= 2, "expected several timed polls, got {}", stored);

    // 停止后不再有新的连接
    tokio::time::sleep(Duration::from_millis(200)).await;
    let connections = miner.connections.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(miner.connections.load(Ordering::SeqCst), connections);
}

#[tokio::test]
async fn test_detector_falls_through_to_cgminer() {
    let miner = MockMiner::new();
    let address = spawn_mock(miner).await;

    let timeout = Duration::from_secs(2);
    let detector = DeviceDetector::new(AdapterSet::new(vec![
        Arc::new(HttpJsonAdapter::new(timeout)),
        Arc::new(HttpDigestAdapter::new(timeout)),
        Arc::new(tcp_adapter()),
    ]));

    // HTTP 探测拿到的不是 HTTP 响应，最终按 CGMiner 识别
    let outcome = detector.detect(&address, None).await;
    assert_eq!(outcome.device_type(), Some(DeviceType::CgminerTcp));
    let DetectionOutcome::Detected { snapshot, .. } = outcome else {
        panic!("expected detection");
    };
    assert_eq!(snapshot.model, "Antminer S19");
}

#[tokio::test]
async fn test_detector_nothing_listening() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let timeout = Duration::from_secs(1);
    let detector = DeviceDetector::new(AdapterSet::new(vec![
        Arc::new(HttpJsonAdapter::new(timeout)),
        Arc::new(HttpDigestAdapter::new(timeout)),
        Arc::new(tcp_adapter()),
    ]));

    let outcome = detector.detect(&address, None).await;
    assert!(matches!(outcome, DetectionOutcome::NotFound));
    assert!(!outcome.is_detected());
}
