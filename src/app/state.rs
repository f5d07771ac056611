// ==========================================
// 车间扫码追溯网关 - 应用状态
// ==========================================
// 职责: 组装仓储/引擎/API,管理后台任务生命周期
// 生命周期: 进程启动时初始化,关停时优雅排空
// 红线: 全局可变状态只存在于此处注入的组件内,不做环境全局量
// ==========================================

use crate::adapter::{run_device, DeviceAdapter};
use crate::api::ScanApi;
use crate::backend::ManufacturingBackend;
use crate::config::{BridgeConfig, ConfigManager};
use crate::db;
use crate::engine::{
    ConsumptionLedger, ContextTracker, EventDispatcher, SyncEngine, ValidationEngine,
};
use crate::repository::{BufferRepository, SnapshotRepository};
use anyhow::Context;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 应用状态
///
/// 持有所有组件实例与共享资源,注入而非环境访问
pub struct AppState {
    /// 数据库路径
    pub db_path: String,

    /// 网关配置
    pub config: Arc<BridgeConfig>,

    /// 持久化缓冲区仓储
    pub buffer_repo: Arc<BufferRepository>,

    /// 工单/BoM 快照仓储
    pub snapshot_repo: Arc<SnapshotRepository>,

    /// 消耗台账
    pub ledger: Arc<ConsumptionLedger>,

    /// 工单上下文追踪器
    pub tracker: Arc<ContextTracker>,

    /// 事件分发器
    pub dispatcher: Arc<EventDispatcher>,

    /// 核心业务 API
    pub scan_api: Arc<ScanApi>,

    backend: Arc<dyn ManufacturingBackend>,
    backend_online: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// 初始化应用状态
    ///
    /// 打开数据库、恢复崩溃遗留状态、加载配置并组装全部组件。
    pub fn new(db_path: &str, backend: Arc<dyn ManufacturingBackend>) -> anyhow::Result<Self> {
        let conn = db::open_and_init(db_path)
            .with_context(|| format!("无法打开数据库: {}", db_path))?;
        let conn = Arc::new(Mutex::new(conn));

        let config = Arc::new(
            ConfigManager::new(conn.clone())
                .load_bridge_config()
                .context("配置加载失败")?,
        );

        let buffer_repo = Arc::new(BufferRepository::new(conn.clone()));
        let snapshot_repo = Arc::new(SnapshotRepository::new(conn.clone()));

        // 崩溃恢复: 上次进程遗留的 IN_FLIGHT 记录回退为 FAILED
        let recovered = buffer_repo
            .reset_in_flight()
            .context("IN_FLIGHT 记录恢复失败")?;
        if recovered > 0 {
            warn!(recovered = recovered, "恢复崩溃遗留的投递中记录");
        }

        let ledger = Arc::new(ConsumptionLedger::new(snapshot_repo.clone()));
        let tracker = Arc::new(ContextTracker::new(
            backend.clone(),
            snapshot_repo.clone(),
            ledger.clone(),
            config.snapshot_ttl_secs,
        ));
        let validator = Arc::new(ValidationEngine::new(ledger.clone()));
        let dispatcher = Arc::new(EventDispatcher::new(
            tracker.clone(),
            validator,
            buffer_repo.clone(),
            config.clone(),
        ));

        let backend_online = Arc::new(AtomicBool::new(false));
        let scan_api = Arc::new(ScanApi::new(
            dispatcher.clone(),
            tracker.clone(),
            buffer_repo.clone(),
            config.default_line.clone(),
            backend_online.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        info!(db_path = %db_path, "应用状态初始化完成");
        Ok(Self {
            db_path: db_path.to_string(),
            config,
            buffer_repo,
            snapshot_repo,
            ledger,
            tracker,
            dispatcher,
            scan_api,
            backend,
            backend_online,
            shutdown_tx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// 关停信号接收端（自定义后台任务使用）
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// 启动后台任务: 同步引擎 / 缓冲区压缩 / 快照刷新
    pub async fn start_background(&self) {
        let mut tasks = self.tasks.lock().await;

        // 同步引擎
        let sync = SyncEngine::new(
            self.buffer_repo.clone(),
            self.backend.clone(),
            self.config.sync.clone(),
            self.backend_online.clone(),
            self.shutdown_tx.subscribe(),
        );
        tasks.push(tokio::spawn(sync.run()));

        // 缓冲区压缩
        {
            let buffer = self.buffer_repo.clone();
            let retention = self.config.retention();
            let interval = self.config.compact_interval();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    match buffer.compact(retention) {
                        Ok(0) => {}
                        Ok(n) => info!(purged = n, "缓冲区压缩完成"),
                        Err(e) => error!(error = %e, "缓冲区压缩失败"),
                    }
                }
            }));
        }

        // 激活工单快照定时刷新
        {
            let tracker = self.tracker.clone();
            let interval = std::time::Duration::from_secs(self.config.snapshot_ttl_secs.max(1));
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    tracker.refresh_active().await;
                }
            }));
        }

        info!("后台任务已启动");
    }

    /// 挂载一个设备适配器（每个设备一个事件泵任务）
    pub async fn attach_device<A>(&self, adapter: A)
    where
        A: DeviceAdapter + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(run_device(adapter, dispatcher, shutdown)));
    }

    /// 优雅关停
    ///
    /// 停止接收新事件,等待进行中的落盘/投递簿记完成后退出。
    pub async fn shutdown(&self) {
        info!("开始优雅关停");
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "后台任务退出异常");
            }
        }
        info!("优雅关停完成");
    }
}
