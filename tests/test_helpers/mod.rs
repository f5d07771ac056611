// ==========================================
// 集成测试共享工具
// ==========================================
// 提供: 临时数据库 / 可编排的模拟后端 / 快速组装 AppState
// ==========================================

#![allow(dead_code)]

use async_trait::async_trait;
use iot_scan_bridge::backend::{
    BackendError, BackendResult, ManufacturingBackend, SubmitAck,
};
use iot_scan_bridge::domain::types::RemoteWorkOrderState;
use iot_scan_bridge::domain::work_order::ComponentRequirement;
use iot_scan_bridge::domain::BufferedRecord;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// 创建测试用临时数据库,返回 (目录守卫, 数据库路径)
///
/// TempDir 守卫存活期间文件保留;drop 即清理。
pub fn create_test_db() -> (TempDir, String) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir
        .path()
        .join("test_bridge.db")
        .to_string_lossy()
        .to_string();
    (dir, path)
}

// ==========================================
// MockBackend - 可编排的模拟后端
// ==========================================
// - 连通性开关: 离线时所有调用返回 Transient
// - 失败注入: 接下来 N 次提交返回 Transient
// - 拒绝注入: 指定 event_id 的提交恒返回 Rejected
// - 查询延迟: 工单/BoM 查询挂起指定时长（模拟慢后端）
// - 幂等去重: 以 event_id 去重,重复提交计 Duplicate 且不产生新效果
pub struct MockBackend {
    online: AtomicBool,
    fail_next_submits: AtomicU32,
    rejected: Mutex<HashSet<Uuid>>,
    fetch_delay_ms: AtomicU64,
    work_orders: Mutex<HashMap<String, RemoteWorkOrderState>>,
    boms: Mutex<HashMap<String, Vec<ComponentRequirement>>>,
    /// 首次受理的事件（后端侧效果计数,按受理顺序）
    received: Mutex<Vec<Uuid>>,
    seen: Mutex<HashSet<Uuid>>,
    submit_calls: AtomicU32,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            fail_next_submits: AtomicU32::new(0),
            rejected: Mutex::new(HashSet::new()),
            fetch_delay_ms: AtomicU64::new(0),
            work_orders: Mutex::new(HashMap::new()),
            boms: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            seen: Mutex::new(HashSet::new()),
            submit_calls: AtomicU32::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// 注入: 接下来 n 次提交返回传输失败
    pub fn fail_next_submits(&self, n: u32) {
        self.fail_next_submits.store(n, Ordering::SeqCst);
    }

    /// 注入: 指定事件的提交恒返回后端拒绝（非传输类失败）
    pub fn reject_event(&self, event_id: Uuid) {
        self.rejected.lock().unwrap().insert(event_id);
    }

    /// 注入: 工单/BoM 查询挂起指定毫秒数
    pub fn set_fetch_delay_ms(&self, ms: u64) {
        self.fetch_delay_ms.store(ms, Ordering::SeqCst);
    }

    async fn fetch_delay(&self) {
        let ms = self.fetch_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub fn add_work_order(
        &self,
        work_order_id: &str,
        state: RemoteWorkOrderState,
        bom: Vec<(&str, u32)>,
    ) {
        self.work_orders
            .lock()
            .unwrap()
            .insert(work_order_id.to_string(), state);
        self.boms.lock().unwrap().insert(
            work_order_id.to_string(),
            bom.into_iter()
                .map(|(code, qty)| ComponentRequirement::new(code, qty))
                .collect(),
        );
    }

    /// 后端侧实际产生效果的事件序列
    pub fn received_events(&self) -> Vec<Uuid> {
        self.received.lock().unwrap().clone()
    }

    pub fn submit_call_count(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> BackendResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Transient("模拟离线".to_string()))
        }
    }
}

#[async_trait]
impl ManufacturingBackend for MockBackend {
    async fn fetch_bom(&self, work_order_id: &str) -> BackendResult<Vec<ComponentRequirement>> {
        self.fetch_delay().await;
        self.check_online()?;
        self.boms
            .lock()
            .unwrap()
            .get(work_order_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(work_order_id.to_string()))
    }

    async fn fetch_work_order_state(
        &self,
        work_order_id: &str,
    ) -> BackendResult<RemoteWorkOrderState> {
        self.fetch_delay().await;
        self.check_online()?;
        self.work_orders
            .lock()
            .unwrap()
            .get(work_order_id)
            .copied()
            .ok_or_else(|| BackendError::NotFound(work_order_id.to_string()))
    }

    async fn submit_outcome(&self, record: &BufferedRecord) -> BackendResult<SubmitAck> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let remaining = self.fail_next_submits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_submits.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Transient("模拟提交失败".to_string()));
        }
        if self.rejected.lock().unwrap().contains(&record.event_id) {
            return Err(BackendError::Rejected("模拟后端拒绝".to_string()));
        }

        let mut seen = self.seen.lock().unwrap();
        if seen.contains(&record.event_id) {
            return Ok(SubmitAck::Duplicate);
        }
        seen.insert(record.event_id);
        self.received.lock().unwrap().push(record.event_id);
        Ok(SubmitAck::Accepted)
    }

    async fn ping(&self) -> BackendResult<()> {
        self.check_online()
    }
}

/// 构造一条物料接受决策（缓冲区测试用）
pub fn make_outcome(
    device_id: &str,
    work_order_id: &str,
    component_code: &str,
) -> iot_scan_bridge::domain::ValidationOutcome {
    use iot_scan_bridge::domain::types::{Decision, ScanKind};
    iot_scan_bridge::domain::ValidationOutcome {
        event_id: Uuid::new_v4(),
        device_id: device_id.to_string(),
        decision: Decision::Accepted,
        scan_kind: ScanKind::Barcode,
        raw_payload: component_code.to_string(),
        work_order_id: Some(work_order_id.to_string()),
        operator_id: Some("OP-1".to_string()),
        component_code: Some(component_code.to_string()),
        consumed_quantity: Some(1),
        required_quantity: Some(2),
        context_unverified: false,
        detail: None,
        decided_at: chrono::Utc::now(),
    }
}

/// 快速同步配置: 极短间隔,便于测试快速收敛
pub fn fast_sync_config() -> iot_scan_bridge::config::SyncConfig {
    iot_scan_bridge::config::SyncConfig {
        batch_size: 50,
        drain_interval_ms: 10,
        probe_interval_ms: 20,
        retry_base_ms: 10,
        retry_max_ms: 100,
        max_attempts: 5,
    }
}
