// ==========================================
// 车间扫码追溯网关 - 设备适配器接口
// ==========================================
// 职责: 定义规范化扫码事件的产出契约
// 说明: 具体硬件驱动（USB/蓝牙/网络）在核心之外实现;
//       核心只消费 next_event 产出的规范化事件
// 红线: 不按设备类继承建模（条码/RFID 是事件上的类型,不是子类）
// ==========================================

use crate::domain::scan_event::ScanEvent;
use crate::domain::types::ScanKind;
use crate::engine::dispatcher::EventDispatcher;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

// ==========================================
// DeviceAdapter - 设备适配器契约
// ==========================================
#[async_trait]
pub trait DeviceAdapter: Send {
    /// 阻塞等待下一个规范化扫码事件;None 表示流结束
    async fn next_event(&mut self) -> Option<ScanEvent>;

    /// 适配器对应的设备ID
    fn device_id(&self) -> &str;
}

// ==========================================
// SimulatedDevice - 通道驱动的模拟设备
// ==========================================
// 测试与演示用: 从 mpsc 通道接收 (载荷, 类型),
// 负责加盖 event_id / 时间戳 / 设备内递增序号
pub struct SimulatedDevice {
    device_id: String,
    rx: mpsc::Receiver<(String, ScanKind)>,
    next_sequence: u64,
}

impl SimulatedDevice {
    /// 创建模拟设备与其注入端
    pub fn channel(
        device_id: impl Into<String>,
        capacity: usize,
    ) -> (mpsc::Sender<(String, ScanKind)>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                device_id: device_id.into(),
                rx,
                next_sequence: 0,
            },
        )
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedDevice {
    async fn next_event(&mut self) -> Option<ScanEvent> {
        let (payload, kind) = self.rx.recv().await?;
        self.next_sequence += 1;
        Some(ScanEvent::new(
            self.device_id.clone(),
            payload,
            kind,
            self.next_sequence,
        ))
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// 设备事件泵: 将一个适配器的事件流灌入分发器,直至关停或流结束
///
/// 关停语义: 信号到达后不再取新事件;正在处理的事件完成落盘后退出。
/// 落盘失败即"扫码未保存",记录告警（操作员界面由 API 层提示）。
pub async fn run_device<A: DeviceAdapter>(
    mut adapter: A,
    dispatcher: Arc<EventDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let device_id = adapter.device_id().to_string();
    info!(device_id = %device_id, "设备事件泵启动");

    loop {
        let event = tokio::select! {
            event = adapter.next_event() => event,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(event) = event else {
            info!(device_id = %device_id, "设备事件流结束");
            break;
        };

        match dispatcher.handle(event).await {
            Ok(outcome) => {
                if !outcome.decision.is_accepted() {
                    warn!(
                        device_id = %device_id,
                        reason = outcome.reason_code(),
                        "扫码被拒绝"
                    );
                }
            }
            Err(e) => {
                // 持久化失败: 事件不可认为已安全,必须提示重扫
                error!(device_id = %device_id, error = %e, "扫码未保存");
            }
        }
    }

    info!(device_id = %device_id, "设备事件泵退出");
}
