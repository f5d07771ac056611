// ==========================================
// 校验流程集成测试
// ==========================================
// 测试目标: 决策顺序 / 消耗上限 / 并发不超耗 / 拒绝入账
// ==========================================

mod test_helpers;

use iot_scan_bridge::api::{ScanRequest, SetContextRequest, TraceabilityQuery};
use iot_scan_bridge::app::AppState;
use iot_scan_bridge::domain::types::{Decision, RemoteWorkOrderState, ScanKind};
use iot_scan_bridge::domain::ScanEvent;
use iot_scan_bridge::logging;
use std::sync::Arc;
use test_helpers::MockBackend;

fn scan_request(device_id: &str, payload: &str) -> ScanRequest {
    ScanRequest {
        device_id: device_id.to_string(),
        scan_data: payload.to_string(),
        scan_type: Some("barcode".to_string()),
        sequence_number: None,
    }
}

async fn build_app(db_path: &str, backend: Arc<MockBackend>) -> AppState {
    AppState::new(db_path, backend).expect("AppState 初始化失败")
}

// ==========================================
// 典型操作序列: WO001 需求 2 单位 CMP-001
// [setContext, scan, scan, scan] →
// [ContextSet, Accepted, Accepted, RejectedQuantityExceeded]
// ==========================================
#[tokio::test]
async fn test_quantity_limit_scenario() {
    logging::init_test();
    let (_dir, db_path) = test_helpers::create_test_db();
    let backend = Arc::new(MockBackend::new());
    backend.add_work_order("WO001", RemoteWorkOrderState::Progress, vec![("CMP-001", 2)]);

    let app = build_app(&db_path, backend).await;
    let api = &app.scan_api;

    let decisions = [
        api.scan(scan_request("DEV-1", "WO001")).await.unwrap().decision,
        api.scan(scan_request("DEV-1", "CMP-001")).await.unwrap().decision,
        api.scan(scan_request("DEV-1", "CMP-001")).await.unwrap().decision,
        api.scan(scan_request("DEV-1", "CMP-001")).await.unwrap().decision,
    ];
    assert_eq!(
        decisions,
        [
            Decision::ContextSet,
            Decision::Accepted,
            Decision::Accepted,
            Decision::RejectedQuantityExceeded,
        ]
    );

    // 台账计数恰好等于需求
    let req = app.ledger.get("WO001", "CMP-001").unwrap();
    assert_eq!(req.consumed_quantity, 2);
    assert_eq!(req.required_quantity, 2);

    // 4 个事件 1:1 入账,含拒绝
    let rows = api.traceability(TraceabilityQuery::default()).unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.unsynced));
}

#[tokio::test]
async fn test_no_context_scan_rejected_but_traceable() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let backend = Arc::new(MockBackend::new());
    let app = build_app(&db_path, backend).await;

    let outcome = app
        .scan_api
        .scan(scan_request("DEV-9", "CMP-B01"))
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::RejectedWrongContext);

    // 拒绝决策同样出现在追溯查询中
    let rows = app
        .scan_api
        .traceability(TraceabilityQuery::default())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].device_id, "DEV-9");
    assert_eq!(rows[0].reason_code, "REJECTED_WRONG_CONTEXT");
    assert!(rows[0].unsynced);
}

#[tokio::test]
async fn test_unknown_component_and_malformed_payload() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let backend = Arc::new(MockBackend::new());
    backend.add_work_order("WO002", RemoteWorkOrderState::Confirmed, vec![("CMP-001", 1)]);
    let app = build_app(&db_path, backend).await;

    app.scan_api
        .set_work_order_context(SetContextRequest {
            work_order_id: "WO002".to_string(),
            operator_id: Some("OP-7".to_string()),
            line_id: None,
        })
        .await
        .unwrap();

    // 不在 BoM 中的物料
    let outcome = app
        .scan_api
        .scan(scan_request("DEV-1", "CMP-X99"))
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::RejectedUnknownComponent);
    assert_eq!(outcome.operator_id.as_deref(), Some("OP-7"));

    // 非法载荷（条码必须含数字）
    let outcome = app
        .scan_api
        .scan(scan_request("DEV-1", "ABCDEF"))
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::RejectedMalformedPayload);
}

#[tokio::test]
async fn test_unknown_work_order_rejected() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let backend = Arc::new(MockBackend::new());
    let app = build_app(&db_path, backend).await;

    // 后端在线但工单不存在: 扫码激活产生拒绝决策
    let outcome = app
        .scan_api
        .scan(scan_request("DEV-1", "WO999"))
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::RejectedContextChange);
    assert!(outcome.detail.is_some());

    // API 路径同样拒绝,以错误形式返回
    let err = app
        .scan_api
        .set_work_order_context(SetContextRequest {
            work_order_id: "WO999".to_string(),
            operator_id: None,
            line_id: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_WORK_ORDER");
}

// ==========================================
// 并发不超耗: 多设备同时扫同一物料
// ==========================================
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_scans_never_exceed_required() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let backend = Arc::new(MockBackend::new());
    backend.add_work_order("WO003", RemoteWorkOrderState::Progress, vec![("CMP-001", 10)]);
    let app = build_app(&db_path, backend).await;

    app.scan_api
        .set_work_order_context(SetContextRequest {
            work_order_id: "WO003".to_string(),
            operator_id: Some("OP-1".to_string()),
            line_id: None,
        })
        .await
        .unwrap();

    // 8 台设备各扫 5 次,共 40 次,仅 10 次应被接受
    let mut handles = Vec::new();
    for device in 0..8 {
        let dispatcher = app.dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let mut accepted = 0u32;
            for seq in 0..5u64 {
                let event = ScanEvent::new(
                    format!("DEV-{}", device),
                    "CMP-001",
                    ScanKind::Barcode,
                    seq,
                );
                let outcome = dispatcher.handle(event).await.expect("落盘不应失败");
                if outcome.decision == Decision::Accepted {
                    accepted += 1;
                }
            }
            accepted
        }));
    }

    let mut total_accepted = 0u32;
    for handle in handles {
        total_accepted += handle.await.unwrap();
    }
    assert_eq!(total_accepted, 10, "接受总数必须恰好等于需求数量");

    let req = app.ledger.get("WO003", "CMP-001").unwrap();
    assert_eq!(req.consumed_quantity, 10);

    // 40 个事件全部入账
    let rows = app
        .scan_api
        .traceability(TraceabilityQuery::default())
        .unwrap();
    // API 激活不产生扫码事件,缓冲区恰好 40 条
    assert_eq!(rows.len(), 40);
}

// ==========================================
// 离线兜底: 过期快照激活,决策标注 unverified
// ==========================================
#[tokio::test]
async fn test_stale_snapshot_fallback_marks_unverified() {
    let (_dir, db_path) = test_helpers::create_test_db();

    // 快照 TTL 置 0: 每次激活都强制刷新
    {
        let conn = iot_scan_bridge::db::open_and_init(&db_path).unwrap();
        let mgr = iot_scan_bridge::config::ConfigManager::new(Arc::new(std::sync::Mutex::new(conn)));
        mgr.set_config_value("bridge.general", r#"{"snapshot_ttl_secs":0}"#)
            .unwrap();
    }

    let backend = Arc::new(MockBackend::new());
    backend.add_work_order("WO004", RemoteWorkOrderState::Progress, vec![("CMP-001", 5)]);
    let app = build_app(&db_path, backend.clone()).await;

    // 在线激活一次,落下本地快照
    let ctx = app
        .scan_api
        .set_work_order_context(SetContextRequest {
            work_order_id: "WO004".to_string(),
            operator_id: Some("OP-1".to_string()),
            line_id: None,
        })
        .await
        .unwrap();
    assert!(ctx.verified);
    app.scan_api.clear_work_order_context(None).await.unwrap();

    // 离线重新激活: 刷新失败,过期快照兜底
    backend.set_online(false);
    let ctx = app
        .scan_api
        .set_work_order_context(SetContextRequest {
            work_order_id: "WO004".to_string(),
            operator_id: Some("OP-1".to_string()),
            line_id: None,
        })
        .await
        .unwrap();
    assert!(!ctx.verified, "离线兜底激活必须标记为未验证");

    let outcome = app
        .scan_api
        .scan(scan_request("DEV-1", "CMP-001"))
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Accepted);
    assert!(outcome.context_unverified, "兜底上下文的决策必须带 unverified 标注");

    // 无本地快照的工单在离线时无法激活
    let err = app
        .scan_api
        .set_work_order_context(SetContextRequest {
            work_order_id: "WO005".to_string(),
            operator_id: None,
            line_id: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_WORK_ORDER");
}

// ==========================================
// BoM 刷新: 远端移除的物料行同步删除,存活行保留消耗计数
// ==========================================
#[test]
fn test_bom_refresh_prunes_removed_lines() {
    use iot_scan_bridge::domain::ComponentRequirement;
    use iot_scan_bridge::repository::SnapshotRepository;

    let (_dir, db_path) = test_helpers::create_test_db();
    let conn = iot_scan_bridge::db::open_and_init(&db_path).unwrap();
    let repo = SnapshotRepository::new(Arc::new(std::sync::Mutex::new(conn)));

    repo.upsert_bom(
        "WO020",
        &[
            ComponentRequirement::new("CMP-001", 2),
            ComponentRequirement::new("CMP-002", 1),
        ],
    )
    .unwrap();
    repo.set_consumed("WO020", "CMP-001", 1).unwrap();

    // 刷新后 CMP-002 已从远端 BoM 移除
    repo.upsert_bom("WO020", &[ComponentRequirement::new("CMP-001", 3)])
        .unwrap();

    let bom = repo.get_bom("WO020").unwrap();
    assert_eq!(bom.len(), 1, "移除的物料行必须删除");
    assert_eq!(bom[0].component_code, "CMP-001");
    assert_eq!(bom[0].required_quantity, 3);
    assert_eq!(bom[0].consumed_quantity, 1, "存活行的消耗计数不得回退");
}

#[tokio::test]
async fn test_component_removed_by_refresh_is_rejected() {
    let (_dir, db_path) = test_helpers::create_test_db();

    // 快照 TTL 置 0: 每次激活都强制刷新
    {
        let conn = iot_scan_bridge::db::open_and_init(&db_path).unwrap();
        let mgr = iot_scan_bridge::config::ConfigManager::new(Arc::new(std::sync::Mutex::new(conn)));
        mgr.set_config_value("bridge.general", r#"{"snapshot_ttl_secs":0}"#)
            .unwrap();
    }

    let backend = Arc::new(MockBackend::new());
    backend.add_work_order(
        "WO021",
        RemoteWorkOrderState::Progress,
        vec![("CMP-001", 2), ("CMP-002", 1)],
    );
    let app = build_app(&db_path, backend.clone()).await;

    app.scan_api
        .set_work_order_context(SetContextRequest {
            work_order_id: "WO021".to_string(),
            operator_id: Some("OP-1".to_string()),
            line_id: None,
        })
        .await
        .unwrap();
    let outcome = app
        .scan_api
        .scan(scan_request("DEV-1", "CMP-002"))
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Accepted);

    // 远端 BoM 移除 CMP-002 后重新激活: 陈旧行不再可消耗
    backend.add_work_order("WO021", RemoteWorkOrderState::Progress, vec![("CMP-001", 2)]);
    app.scan_api.clear_work_order_context(None).await.unwrap();
    app.scan_api
        .set_work_order_context(SetContextRequest {
            work_order_id: "WO021".to_string(),
            operator_id: Some("OP-1".to_string()),
            line_id: None,
        })
        .await
        .unwrap();

    let outcome = app
        .scan_api
        .scan(scan_request("DEV-1", "CMP-002"))
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::RejectedUnknownComponent);
    assert!(app.ledger.get("WO021", "CMP-002").is_none(), "台账条目必须同步移除");
}

// ==========================================
// 上下文变更互斥: 变更进行中的并发请求立即失败,不排队
// ==========================================
#[tokio::test]
async fn test_concurrent_context_change_fails_fast_with_busy() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let backend = Arc::new(MockBackend::new());
    backend.add_work_order("WO010", RemoteWorkOrderState::Progress, vec![("CMP-001", 1)]);
    // 慢后端: 首次激活需远端确认,变更互斥在确认期间保持持有
    backend.set_fetch_delay_ms(300);
    let app = build_app(&db_path, backend).await;

    let tracker = app.tracker.clone();
    let first = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.set_context("WC-01", "WO010", "OP-1").await }
    });

    // 等首个变更进入后端确认阶段
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let err = tracker
        .set_context("WC-01", "WO010", "OP-2")
        .await
        .unwrap_err();
    assert!(
        matches!(err, iot_scan_bridge::ContextError::ContextBusy(_)),
        "变更进行中的并发激活必须立即返回 ContextBusy"
    );

    // 首个变更不受影响,正常完成
    let ctx = first.await.unwrap().unwrap();
    assert_eq!(ctx.operator_id, "OP-1");
    assert_eq!(
        app.scan_api.current_context(None).unwrap().operator_id,
        "OP-1"
    );
}

// ==========================================
// 上下文状态机
// ==========================================
#[tokio::test]
async fn test_context_state_machine_transitions() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let backend = Arc::new(MockBackend::new());
    backend.add_work_order("WO006", RemoteWorkOrderState::Progress, vec![("CMP-001", 1)]);
    backend.add_work_order("WO007", RemoteWorkOrderState::Draft, vec![]);
    let app = build_app(&db_path, backend).await;
    let tracker = &app.tracker;

    // Draft 状态不允许开工
    let err = tracker.set_context("WC-01", "WO007", "OP-1").await.unwrap_err();
    assert!(matches!(
        err,
        iot_scan_bridge::ContextError::NotActivatable { .. }
    ));

    tracker.set_context("WC-01", "WO006", "OP-1").await.unwrap();

    // Active → Suspended → Active
    tracker.suspend("WC-01").await.unwrap();
    // 暂停中不允许完工
    assert!(tracker.complete("WC-01").await.is_err());
    // 暂停中物料扫码被拒绝
    let outcome = app
        .scan_api
        .scan(scan_request("DEV-1", "CMP-001"))
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::RejectedWrongContext);
    tracker.resume("WC-01").await.unwrap();

    // 完工后清除
    let ctx = tracker.complete("WC-01").await.unwrap();
    assert_eq!(ctx.state, iot_scan_bridge::ContextState::Completed);
    tracker.clear_context("WC-01").await.unwrap();
    assert!(tracker.current_context("WC-01").is_none());
}
