// ==========================================
// 持久化缓冲区集成测试
// ==========================================
// 测试目标: 崩溃往返 / 回放顺序 / 状态迁移守卫 / 压缩安全性
// ==========================================

mod test_helpers;

use iot_scan_bridge::db;
use iot_scan_bridge::domain::types::DeliveryStatus;
use iot_scan_bridge::logging;
use iot_scan_bridge::repository::BufferRepository;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn open_repo(db_path: &str) -> BufferRepository {
    let conn = db::open_and_init(db_path).expect("Failed to open db");
    BufferRepository::new(Arc::new(Mutex::new(conn)))
}

#[test]
fn test_crash_roundtrip_preserves_order_and_status() {
    logging::init_test();
    let (_dir, db_path) = test_helpers::create_test_db();

    // 阶段 1: 写入 20 条记录并做部分状态迁移
    let mut event_ids = Vec::new();
    {
        let repo = open_repo(&db_path);
        for i in 0..20 {
            let outcome = test_helpers::make_outcome("DEV-1", "WO001", &format!("CMP-{:03}", i));
            let record = repo.append(&outcome).expect("append 应该成功");
            assert_eq!(record.delivery_status, DeliveryStatus::Pending);
            event_ids.push(record.event_id);
        }
        // 前两条: 投递成功
        for id in &event_ids[0..2] {
            repo.mark_in_flight(id).unwrap();
            repo.mark_delivered(id).unwrap();
        }
        // 第三条: 投递失败一次
        repo.mark_in_flight(&event_ids[2]).unwrap();
        repo.mark_failed(&event_ids[2], "网络超时").unwrap();
    } // 连接关闭,模拟进程退出

    // 阶段 2: 重新打开,记录与顺序必须完整保留
    let repo = open_repo(&db_path);
    let all = repo.query_records(None, None, None).unwrap();
    assert_eq!(all.len(), 20, "崩溃重启后记录不得丢失");

    // seq 严格升序,与写入顺序一致
    for (i, record) in all.iter().enumerate() {
        assert_eq!(record.event_id, event_ids[i], "回放顺序必须与写入顺序一致");
        if i > 0 {
            assert!(record.seq > all[i - 1].seq);
        }
    }

    assert_eq!(all[0].delivery_status, DeliveryStatus::Delivered);
    assert_eq!(all[1].delivery_status, DeliveryStatus::Delivered);
    assert_eq!(all[2].delivery_status, DeliveryStatus::Failed);
    assert_eq!(all[2].attempt_count, 1);
    assert_eq!(all[2].last_error.as_deref(), Some("网络超时"));
    for record in &all[3..] {
        assert_eq!(record.delivery_status, DeliveryStatus::Pending);
    }
}

#[test]
fn test_peek_batch_ascending_and_excludes_terminal() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let repo = open_repo(&db_path);

    let mut ids = Vec::new();
    for i in 0..5 {
        let outcome = test_helpers::make_outcome("DEV-A", "WO001", &format!("CMP-{}", i));
        ids.push(repo.append(&outcome).unwrap().event_id);
    }
    // 第一条送达,第二条死信
    repo.mark_in_flight(&ids[0]).unwrap();
    repo.mark_delivered(&ids[0]).unwrap();
    repo.mark_in_flight(&ids[1]).unwrap();
    repo.mark_failed(&ids[1], "err").unwrap();
    repo.mark_dead_letter(&ids[1]).unwrap();

    let batch = repo.peek_batch(10, &[]).unwrap();
    let batch_ids: Vec<Uuid> = batch.iter().map(|r| r.event_id).collect();
    assert_eq!(batch_ids, ids[2..].to_vec(), "终态记录不进同步批次");

    // 排除设备过滤: 指定设备的记录不进窗口
    let batch = repo.peek_batch(10, &["DEV-A".to_string()]).unwrap();
    assert!(batch.is_empty(), "被排除设备的记录不得出现在窗口中");
}

#[test]
fn test_status_transition_guards() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let repo = open_repo(&db_path);

    let outcome = test_helpers::make_outcome("DEV-1", "WO001", "CMP-A");
    let id = repo.append(&outcome).unwrap().event_id;

    // PENDING 不能直接 DELIVERED
    assert!(repo.mark_delivered(&id).is_err());
    // PENDING 不能直接 DEAD_LETTER
    assert!(repo.mark_dead_letter(&id).is_err());

    repo.mark_in_flight(&id).unwrap();
    // IN_FLIGHT 不能再次 IN_FLIGHT
    assert!(repo.mark_in_flight(&id).is_err());
    repo.mark_failed(&id, "e1").unwrap();
    // FAILED 可以重新 IN_FLIGHT
    repo.mark_in_flight(&id).unwrap();
    repo.mark_delivered(&id).unwrap();

    let record = repo.get(&id).unwrap().unwrap();
    assert_eq!(record.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(record.attempt_count, 1);
    assert!(record.delivered_at.is_some());
}

#[test]
fn test_reset_in_flight_recovers_crash_leftovers() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let id;
    {
        let repo = open_repo(&db_path);
        let outcome = test_helpers::make_outcome("DEV-1", "WO001", "CMP-A");
        id = repo.append(&outcome).unwrap().event_id;
        repo.mark_in_flight(&id).unwrap();
    } // 进程"崩溃",遗留 IN_FLIGHT

    let repo = open_repo(&db_path);
    let recovered = repo.reset_in_flight().unwrap();
    assert_eq!(recovered, 1);

    let record = repo.get(&id).unwrap().unwrap();
    assert_eq!(record.delivery_status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 1, "未知结果按一次失败尝试计入");
}

#[test]
fn test_compact_only_purges_delivered_beyond_retention() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let repo = open_repo(&db_path);

    let delivered = repo
        .append(&test_helpers::make_outcome("DEV-1", "WO001", "CMP-A"))
        .unwrap()
        .event_id;
    let pending = repo
        .append(&test_helpers::make_outcome("DEV-1", "WO001", "CMP-B"))
        .unwrap()
        .event_id;
    let failed = repo
        .append(&test_helpers::make_outcome("DEV-1", "WO001", "CMP-C"))
        .unwrap()
        .event_id;

    repo.mark_in_flight(&delivered).unwrap();
    repo.mark_delivered(&delivered).unwrap();
    repo.mark_in_flight(&failed).unwrap();
    repo.mark_failed(&failed, "err").unwrap();

    // 保留窗口未过: 不清除
    let purged = repo.compact(chrono::Duration::hours(1)).unwrap();
    assert_eq!(purged, 0);

    // 窗口为负(一切已过期): 仅清除 DELIVERED
    let purged = repo.compact(chrono::Duration::seconds(-1)).unwrap();
    assert_eq!(purged, 1);

    assert!(repo.get(&delivered).unwrap().is_none());
    assert!(repo.get(&pending).unwrap().is_some(), "未送达记录永不删除");
    assert!(repo.get(&failed).unwrap().is_some(), "失败记录永不删除");
}

#[test]
fn test_stats_counts_by_status() {
    let (_dir, db_path) = test_helpers::create_test_db();
    let repo = open_repo(&db_path);

    for i in 0..3 {
        repo.append(&test_helpers::make_outcome(
            "DEV-1",
            "WO001",
            &format!("CMP-{}", i),
        ))
        .unwrap();
    }
    let stats = repo.stats().unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.delivered, 0);
}
