// ==========================================
// 车间扫码追溯网关 - 同步引擎
// ==========================================
// 职责: 后台排空持久化缓冲区,按 seq 顺序投递到制造后端
// 连通性状态机: Online ⇄ Offline
//   - Online: 持续排空,传输失败即转 Offline
//   - Offline: 仅低频探测,探测成功转回 Online
// 顺序规则: 同设备严格 FIFO;某设备队头记录失败退避期间,
//   该设备后续记录被阻塞,其他设备不受影响
// 重试: 指数退避 base * 2^(n-1),±50% 抖动,有界上限;
//   超过 max_attempts 移入死信,不再阻塞该设备
// ==========================================

use crate::backend::{ManufacturingBackend, SubmitAck};
use crate::config::SyncConfig;
use crate::domain::outcome::BufferedRecord;
use crate::domain::types::DeliveryStatus;
use crate::repository::buffer_repo::BufferRepository;
use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 后端连通性状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// 第 attempt 次失败后的基础退避时长（毫秒,未加抖动）
pub fn base_delay_ms(attempt: u32, config: &SyncConfig) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exp = attempt.saturating_sub(1).min(20);
    config
        .retry_base_ms
        .saturating_mul(1u64 << exp)
        .min(config.retry_max_ms)
}

/// 加抖动的退避时长（±50%）
fn jittered_delay_ms(attempt: u32, config: &SyncConfig) -> u64 {
    let base = base_delay_ms(attempt, config);
    if base == 0 {
        return 0;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    ((base as f64) * factor) as u64
}

/// 失败记录当前是否到达重试时点
///
/// 退避窗口上界为 1.5 倍基础时长;窗口内按抖动概率放行,
/// 避免多记录在同一时点齐发。
fn is_retry_eligible(record: &BufferedRecord, config: &SyncConfig) -> bool {
    let last = match record.last_attempt_at {
        Some(t) => t,
        None => return true,
    };
    let elapsed_ms = (Utc::now() - last).num_milliseconds().max(0) as u64;
    elapsed_ms >= jittered_delay_ms(record.attempt_count, config)
}

// ==========================================
// SyncEngine - 同步引擎
// ==========================================
pub struct SyncEngine {
    buffer: Arc<BufferRepository>,
    backend: Arc<dyn ManufacturingBackend>,
    config: SyncConfig,
    /// 对外暴露的连通性标志（/api/status）
    online: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl SyncEngine {
    pub fn new(
        buffer: Arc<BufferRepository>,
        backend: Arc<dyn ManufacturingBackend>,
        config: SyncConfig,
        online: Arc<AtomicBool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        online.store(false, Ordering::Relaxed);
        Self {
            buffer,
            backend,
            config,
            online,
            shutdown,
        }
    }

    /// 主循环（长生命周期后台任务）
    ///
    /// 关停信号到达后,完成当前记录的投递簿记再退出;
    /// 进程崩溃遗留的 IN_FLIGHT 由启动时 reset_in_flight 兜底。
    pub async fn run(mut self) {
        info!("同步引擎启动");
        let mut state = Connectivity::Offline;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match state {
                Connectivity::Offline => {
                    state = self.probe_once().await;
                    if state == Connectivity::Offline {
                        if self
                            .wait_or_shutdown(Duration::from_millis(self.config.probe_interval_ms))
                            .await
                        {
                            break;
                        }
                    }
                }
                Connectivity::Online => {
                    state = self.drain_once().await;
                    if state == Connectivity::Online
                        && self
                            .wait_or_shutdown(Duration::from_millis(self.config.drain_interval_ms))
                            .await
                    {
                        break;
                    }
                }
            }
        }

        self.online.store(false, Ordering::Relaxed);
        info!("同步引擎已退出");
    }

    /// 等待指定时长;期间收到关停信号返回 true
    async fn wait_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.changed() => *self.shutdown.borrow(),
        }
    }

    /// 离线探测
    async fn probe_once(&self) -> Connectivity {
        match self.backend.ping().await {
            Ok(()) => {
                info!("后端连通性恢复,转入在线模式");
                self.online.store(true, Ordering::Relaxed);
                Connectivity::Online
            }
            Err(e) => {
                debug!(error = %e, "后端探测失败,保持离线");
                self.online.store(false, Ordering::Relaxed);
                Connectivity::Offline
            }
        }
    }

    /// 排空缓冲区直至见底或全部设备阻塞
    ///
    /// 按 seq 升序逐条投递;维护被阻塞设备集合实现同设备队头阻塞,
    /// 再以该集合为过滤条件续取下一窗口 —— 单设备深积压占满一个
    /// 检索窗口时,其他设备的记录仍会被取到并投递。
    /// 传输类失败立即转离线并结束本轮。
    async fn drain_once(&self) -> Connectivity {
        let mut blocked_devices: HashSet<String> = HashSet::new();

        loop {
            let exclude: Vec<String> = blocked_devices.iter().cloned().collect();
            let batch = match self.buffer.peek_batch(self.config.batch_size, &exclude) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "缓冲区批量读取失败");
                    return Connectivity::Online;
                }
            };
            if batch.is_empty() {
                return Connectivity::Online;
            }

            debug!(batch_len = batch.len(), "开始排空缓冲区");
            for record in batch {
                if *self.shutdown.borrow() {
                    return Connectivity::Online;
                }
                if blocked_devices.contains(&record.device_id) {
                    continue;
                }

                // 死信判定先于重试资格: 到达上限的失败记录移出队列
                if record.delivery_status == DeliveryStatus::Failed {
                    if record.attempt_count >= self.config.max_attempts {
                        warn!(
                            event_id = %record.event_id,
                            device_id = %record.device_id,
                            attempt_count = record.attempt_count,
                            "重试次数耗尽,移入死信等待人工对账"
                        );
                        if let Err(e) = self.buffer.mark_dead_letter(&record.event_id) {
                            error!(event_id = %record.event_id, error = %e, "死信标记失败");
                            blocked_devices.insert(record.device_id.clone());
                        }
                        continue;
                    }
                    if !is_retry_eligible(&record, &self.config) {
                        // 退避未到时点: 该设备后续记录一并阻塞,保持 FIFO
                        blocked_devices.insert(record.device_id.clone());
                        continue;
                    }
                }

                match self.deliver(&record).await {
                    DeliverResult::Delivered => {}
                    DeliverResult::Failed => {
                        blocked_devices.insert(record.device_id.clone());
                    }
                    DeliverResult::WentOffline => {
                        self.online.store(false, Ordering::Relaxed);
                        return Connectivity::Offline;
                    }
                }
            }
        }
    }

    /// 投递单条记录: IN_FLIGHT → DELIVERED / FAILED
    async fn deliver(&self, record: &BufferedRecord) -> DeliverResult {
        if let Err(e) = self.buffer.mark_in_flight(&record.event_id) {
            error!(event_id = %record.event_id, error = %e, "IN_FLIGHT 标记失败");
            return DeliverResult::Failed;
        }

        match self.backend.submit_outcome(record).await {
            Ok(ack) => {
                if ack == SubmitAck::Duplicate {
                    debug!(event_id = %record.event_id, "后端幂等去重,按已送达处理");
                }
                match self.buffer.mark_delivered(&record.event_id) {
                    Ok(()) => {
                        debug!(
                            event_id = %record.event_id,
                            seq = record.seq,
                            "记录已送达后端"
                        );
                        DeliverResult::Delivered
                    }
                    Err(e) => {
                        error!(event_id = %record.event_id, error = %e, "DELIVERED 标记失败");
                        DeliverResult::Failed
                    }
                }
            }
            Err(e) => {
                let transient = e.is_transient();
                if let Err(mark_err) = self.buffer.mark_failed(&record.event_id, &e.to_string()) {
                    error!(event_id = %record.event_id, error = %mark_err, "FAILED 标记失败");
                }
                if transient {
                    warn!(
                        event_id = %record.event_id,
                        error = %e,
                        "传输失败,转入离线模式"
                    );
                    DeliverResult::WentOffline
                } else {
                    warn!(event_id = %record.event_id, error = %e, "后端拒绝,按失败计数重试");
                    DeliverResult::Failed
                }
            }
        }
    }
}

enum DeliverResult {
    Delivered,
    Failed,
    WentOffline,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig {
            retry_base_ms: 500,
            retry_max_ms: 60_000,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let cfg = config();
        assert_eq!(base_delay_ms(0, &cfg), 0);
        assert_eq!(base_delay_ms(1, &cfg), 500);
        assert_eq!(base_delay_ms(2, &cfg), 1_000);
        assert_eq!(base_delay_ms(3, &cfg), 2_000);
        assert_eq!(base_delay_ms(10, &cfg), 60_000); // 已达上限
        assert_eq!(base_delay_ms(u32::MAX, &cfg), 60_000); // 不溢出
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let cfg = config();
        for _ in 0..100 {
            let d = jittered_delay_ms(3, &cfg);
            assert!((1_000..3_000).contains(&d), "jittered delay {} out of bounds", d);
        }
    }
}
