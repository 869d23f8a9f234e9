//! 设备轮询调度
//!
//! 每台设备一个会话：独立定时任务、连续失败计数、一次性重新识别标记、
//! 进行中标记和最近一次快照。重启轮询总是先销毁旧会话再新建。

use super::events::{EventBus, MonitorEvent};
use crate::adapters::AdapterSet;
use crate::config::PollerConfig;
use crate::detector::{DetectionOutcome, DeviceDetector};
use crate::device::{Device, DeviceId, DeviceRegistry, DeviceType};
use crate::error::{FailureKind, FetchError, RegistryError};
use crate::telemetry::sink::TelemetrySink;
use crate::telemetry::TelemetrySnapshot;
use crate::{device_debug, device_error, device_info, device_warn};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 单次轮询结果
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// 拉取成功
    Online { snapshot: Arc<TelemetrySnapshot> },
    /// 拉取失败，`offline` 表示已达到阈值
    Failed {
        consecutive_failures: u32,
        offline: bool,
        error: FetchError,
    },
    /// 重新识别出不同类型，会话已按新类型重建
    Reclassified {
        from: DeviceType,
        to: DeviceType,
        snapshot: Arc<TelemetrySnapshot>,
    },
    /// 上一次轮询尚未结束
    Skipped,
    /// 设备没有轮询会话
    NotPolling,
    /// 注册表中已没有该设备，会话已停止
    DeviceMissing,
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Online { .. } | PollOutcome::Reclassified { .. })
    }
}

/// 轮询会话
struct PollSession {
    generation: u64,
    handle: JoinHandle<()>,
    consecutive_failures: u32,
    redetect_attempted: bool,
    in_flight: Arc<AtomicBool>,
    latest: Option<Arc<TelemetrySnapshot>>,
}

/// 进行中标记，离开作用域时清除
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SchedulerInner {
    registry: Arc<dyn DeviceRegistry>,
    sink: Arc<dyn TelemetrySink>,
    adapters: AdapterSet,
    detector: DeviceDetector,
    events: EventBus,
    config: PollerConfig,
    sessions: RwLock<HashMap<DeviceId, PollSession>>,
    next_generation: AtomicU64,
}

/// 轮询调度器
///
/// 克隆只复制句柄，所有克隆共享同一组会话。
#[derive(Clone)]
pub struct PollScheduler {
    inner: Arc<SchedulerInner>,
}

impl PollScheduler {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn TelemetrySink>,
        adapters: AdapterSet,
        config: PollerConfig,
    ) -> Self {
        let detector = DeviceDetector::new(adapters.clone());
        Self::with_detector(registry, sink, adapters, detector, config)
    }

    pub fn with_detector(
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn TelemetrySink>,
        adapters: AdapterSet,
        detector: DeviceDetector,
        config: PollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                sink,
                adapters,
                detector,
                events: EventBus::new(),
                config,
                sessions: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// 开始轮询，已有会话会被替换
    pub async fn start_polling(&self, device: &Device) {
        let mut sessions = self.inner.sessions.write().await;
        self.install_session(&mut sessions, device);
    }

    /// 停止轮询，丢弃失败计数和缓存快照，不修改注册表
    pub async fn stop_polling(&self, device_id: DeviceId) {
        if let Some(session) = self.inner.sessions.write().await.remove(&device_id) {
            session.handle.abort();
            device_info!(device_id, "⏹ Stopped polling");
        }
    }

    pub async fn stop_all(&self) {
        let mut sessions = self.inner.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.handle.abort();
        }
        info!("All polling sessions stopped");
    }

    pub async fn is_polling(&self, device_id: DeviceId) -> bool {
        self.inner.sessions.read().await.contains_key(&device_id)
    }

    pub async fn polling_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.inner.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn latest_snapshot(&self, device_id: DeviceId) -> Option<Arc<TelemetrySnapshot>> {
        self.inner
            .sessions
            .read()
            .await
            .get(&device_id)
            .and_then(|s| s.latest.clone())
    }

    pub async fn failure_count(&self, device_id: DeviceId) -> Option<u32> {
        self.inner
            .sessions
            .read()
            .await
            .get(&device_id)
            .map(|s| s.consecutive_failures)
    }

    /// 执行一次轮询
    pub async fn poll_device(&self, device_id: DeviceId) -> PollOutcome {
        let (generation, in_flight) = match self.inner.sessions.read().await.get(&device_id) {
            Some(session) => (session.generation, session.in_flight.clone()),
            None => return PollOutcome::NotPolling,
        };

        let Some(_guard) = InFlightGuard::acquire(in_flight) else {
            device_debug!(device_id, "Previous poll still in flight, skipping tick");
            return PollOutcome::Skipped;
        };

        let device = match self.inner.registry.get_device(device_id).await {
            Ok(device) => device,
            Err(RegistryError::NotFound { .. }) => {
                device_warn!(device_id, "Device removed from registry, stopping");
                self.remove_session_if_current(device_id, generation).await;
                return PollOutcome::DeviceMissing;
            }
            // 存储故障不影响会话，下个周期再试
            Err(e) => {
                device_warn!(device_id, "Registry unavailable, skipping tick: {}", e);
                return PollOutcome::Skipped;
            }
        };

        let result = match self.inner.adapters.get(device.device_type) {
            Some(adapter) => adapter.fetch(&device.address, device.credentials.as_ref()).await,
            None => Err(FetchError::ProtocolMismatch {
                address: device.address.clone(),
                reason: format!("no adapter registered for {}", device.device_type),
            }),
        };

        match result {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.handle_success(&device, generation, snapshot.clone()).await;
                PollOutcome::Online { snapshot }
            }
            Err(error) => {
                self.log_failure(&device, &error);
                if self.claim_redetection(device_id, generation).await {
                    if let Some(outcome) = self.try_reclassify(&device, generation).await {
                        return outcome;
                    }
                }
                self.handle_failure(&device, generation, error).await
            }
        }
    }

    fn log_failure(&self, device: &Device, error: &FetchError) {
        let device_id = device.id;
        match error.failure_kind() {
            FailureKind::Authentication => {
                device_warn!(
                    device_id,
                    "🔐 {} requires valid credentials ({}); update the device login",
                    device.address,
                    error
                );
            }
            FailureKind::ProtocolMismatch => {
                device_warn!(device_id, "{} does not look like {}: {}", device.address, device.device_type, error);
            }
            FailureKind::Transient => {
                device_debug!(device_id, "Poll of {} failed: {}", device.address, error);
            }
        }
    }

    /// 会话内第一次失败时占用重新识别机会
    async fn claim_redetection(&self, device_id: DeviceId, generation: u64) -> bool {
        if !self.inner.config.redetect_on_failure {
            return false;
        }
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get_mut(&device_id) {
            Some(session) if session.generation == generation && !session.redetect_attempted => {
                session.redetect_attempted = true;
                true
            }
            _ => false,
        }
    }

    async fn try_reclassify(&self, device: &Device, generation: u64) -> Option<PollOutcome> {
        let device_id = device.id;
        device_debug!(device_id, "Re-detecting type of {}", device.address);

        let DetectionOutcome::Detected { device_type, snapshot } = self
            .inner
            .detector
            .detect(&device.address, device.credentials.as_ref())
            .await
        else {
            return None;
        };
        if device_type == device.device_type {
            return None;
        }

        device_info!(device_id, "🔄 Reclassified {} from {} to {}", device.address, device.device_type, device_type);
        if let Err(e) = self
            .inner
            .registry
            .set_device_type(device_id, device_type, device.credentials.clone())
            .await
        {
            device_warn!(device_id, "Failed to persist reclassification: {}", e);
            return None;
        }

        let mut updated = device.clone();
        updated.device_type = device_type;
        let snapshot: Arc<TelemetrySnapshot> = Arc::from(snapshot);
        self.handle_success(&updated, generation, snapshot.clone()).await;

        // 最后一步：重建会话。之后不能再有 await，当前任务可能正是被替换的定时任务
        let mut sessions = self.inner.sessions.write().await;
        if sessions.get(&device_id).map(|s| s.generation) == Some(generation) {
            self.install_session(&mut sessions, &updated);
            if let Some(session) = sessions.get_mut(&device_id) {
                session.latest = Some(snapshot.clone());
            }
        }

        Some(PollOutcome::Reclassified {
            from: device.device_type,
            to: device_type,
            snapshot,
        })
    }

    async fn handle_success(&self, device: &Device, generation: u64, snapshot: Arc<TelemetrySnapshot>) {
        let device_id = device.id;
        let inner = &self.inner;

        {
            let mut sessions = inner.sessions.write().await;
            if let Some(session) = sessions.get_mut(&device_id) {
                if session.generation == generation {
                    session.consecutive_failures = 0;
                    session.latest = Some(snapshot.clone());
                }
            }
        }

        if let Err(e) = inner.registry.set_online(device_id, true).await {
            device_warn!(device_id, "Failed to mark online: {}", e);
        }
        if !device.online {
            device_info!(device_id, "🟢 {} is online ({})", device.address, crate::hashrate!(snapshot.hashrate));
            inner.events.emit(MonitorEvent::StatusChanged {
                device_id,
                online: true,
                snapshot: Some(snapshot.clone()),
                timestamp: Utc::now(),
            });
        }

        if snapshot.best_difficulty > 0.0 {
            match inner
                .registry
                .record_best_difficulty(device_id, snapshot.best_difficulty)
                .await
            {
                Ok(true) => {
                    device_info!(
                        device_id,
                        "🏆 New best difficulty {}",
                        crate::utils::format_difficulty(snapshot.best_difficulty)
                    );
                    inner.events.emit(MonitorEvent::NewRecord {
                        device_id,
                        difficulty: snapshot.best_difficulty,
                        timestamp: Utc::now(),
                    });
                }
                Ok(false) => {}
                Err(e) => device_warn!(device_id, "Failed to record best difficulty: {}", e),
            }
        }

        if let Err(e) = inner.sink.store(device_id, &snapshot).await {
            device_error!(device_id, "Failed to store snapshot: {}", e);
        }

        inner.events.emit(MonitorEvent::Snapshot { device_id, snapshot });
    }

    async fn handle_failure(&self, device: &Device, generation: u64, error: FetchError) -> PollOutcome {
        let device_id = device.id;
        let threshold = self.inner.config.failure_threshold;

        let failures = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get_mut(&device_id) {
                Some(session) if session.generation == generation => {
                    session.consecutive_failures = session.consecutive_failures.saturating_add(1);
                    session.consecutive_failures
                }
                // 会话已被替换或停止，这次结果作废
                _ => return PollOutcome::Skipped,
            }
        };

        // 从未上线的设备没有状态变化可报
        if failures == threshold && device.online {
            device_warn!(device_id, "🔴 {} offline after {} consecutive failures", device.address, failures);
            if let Err(e) = self.inner.registry.set_online(device_id, false).await {
                device_warn!(device_id, "Failed to mark offline: {}", e);
            }
            self.inner.events.emit(MonitorEvent::StatusChanged {
                device_id,
                online: false,
                snapshot: None,
                timestamp: Utc::now(),
            });
        } else if failures < threshold {
            device_debug!(device_id, "Failure {}/{} for {}", failures, threshold, device.address);
        }

        PollOutcome::Failed {
            consecutive_failures: failures,
            offline: failures >= threshold,
            error,
        }
    }

    async fn remove_session_if_current(&self, device_id: DeviceId, generation: u64) {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.get(&device_id).map(|s| s.generation) == Some(generation) {
            if let Some(session) = sessions.remove(&device_id) {
                session.handle.abort();
            }
        }
    }

    /// 销毁旧会话并创建新会话，返回新会话的代号
    ///
    /// 全程同步，调用方持有写锁。
    fn install_session(&self, sessions: &mut HashMap<DeviceId, PollSession>, device: &Device) -> u64 {
        let device_id = device.id;
        if let Some(old) = sessions.remove(&device_id) {
            old.handle.abort();
            device_debug!(device_id, "Replaced existing polling session");
        }

        let interval = if device.poll_interval_ms == 0 {
            Duration::from_millis(self.inner.config.default_interval_ms.max(1))
        } else {
            device.poll_interval()
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_timer(Arc::downgrade(&self.inner), device_id, interval);

        sessions.insert(
            device_id,
            PollSession {
                generation,
                handle,
                consecutive_failures: 0,
                redetect_attempted: false,
                in_flight: Arc::new(AtomicBool::new(false)),
                latest: None,
            },
        );

        device_info!(device_id, "▶ Polling {} ({}) every {:?}", device.address, device.device_type, interval);
        generation
    }
}

/// 会话定时任务，首次触发在一个间隔之后
fn spawn_timer(inner: Weak<SchedulerInner>, device_id: DeviceId, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                debug!("Scheduler dropped, timer for device {} exits", device_id);
                break;
            };
            let outcome = PollScheduler { inner }.poll_device(device_id).await;
            if matches!(outcome, PollOutcome::NotPolling | PollOutcome::DeviceMissing) {
                break;
            }
        }
    })
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut();
        if !sessions.is_empty() {
            warn!("Scheduler dropped with {} active sessions", sessions.len());
        }
        for (_, session) in sessions.drain() {
            session.handle.abort();
        }
    }
}
