use chrono::{Duration, Utc};
use scheduler_domain::{
    entities::{FilterTracker, MetaStatus, TaskStatus, TaskTransition, TrackerStatus},
    repositories::{
        CreateOutcome, FilterRepository, MetaCriteria, MetaStore, TaskQuery, TaskStore,
    },
};
use scheduler_infrastructure::{
    DatabaseManager, SqliteFilterRepository, SqliteMetaStore, SqliteTaskStore,
};
use scheduler_testing_utils::{feed_expression, FilterBuilder, MetaRecordBuilder};

async fn setup() -> DatabaseManager {
    let db = DatabaseManager::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    db
}

fn criteria(min_id: i64, max_matches: usize) -> MetaCriteria {
    MetaCriteria {
        min_id,
        min_create_time: None,
        max_create_time: None,
        max_matches,
    }
}

#[tokio::test]
async fn test_filter_crud_and_tracker() {
    let db = setup().await;
    let repo = SqliteFilterRepository::new(db.pool().clone());

    let filter = repo
        .create(
            &FilterBuilder::new().with_name("events").with_max_processing_tasks(4).build(),
            20,
            "alice",
        )
        .await
        .unwrap();
    assert_eq!(filter.priority, 20);
    assert_eq!(filter.run_as, "alice");
    assert_eq!(filter.max_processing_tasks, Some(4));
    assert_eq!(filter.expression, feed_expression("TEST_FEED"));

    let mut changed = filter.clone();
    changed.enabled = false;
    changed.priority = 5;
    let updated = repo.update(&changed).await.unwrap();
    assert!(!updated.enabled);
    assert_eq!(updated.priority, 5);

    let tracker = repo.get_tracker(filter.id).await.unwrap();
    assert_eq!(tracker, FilterTracker::new(filter.id));

    let mut tracker = tracker;
    tracker.min_meta_id = 42;
    tracker.meta_count = 7;
    tracker.last_poll_at = Some(Utc::now());
    tracker.mark_error("表达式没有任何条件");
    repo.save_tracker(&tracker).await.unwrap();

    let stored = repo.get_tracker(filter.id).await.unwrap();
    assert_eq!(stored.min_meta_id, 42);
    assert_eq!(stored.meta_count, 7);
    assert_eq!(stored.status, TrackerStatus::Error);

    assert!(repo.delete(filter.id).await.unwrap());
    assert!(repo.get_by_id(filter.id).await.unwrap().is_none());
    assert!(repo.save_tracker(&tracker).await.is_err());
    assert!(!repo.delete(filter.id).await.unwrap());
}

#[tokio::test]
async fn test_meta_scan_window_status_and_order() {
    let db = setup().await;
    let store = SqliteMetaStore::new(db.pool().clone());
    let base = Utc::now() - Duration::hours(1);

    for i in 0..6 {
        store
            .append(
                MetaRecordBuilder::new()
                    .with_create_time(base + Duration::minutes(i))
                    .build(),
            )
            .await
            .unwrap();
    }
    store
        .append(MetaRecordBuilder::new().with_feed("OTHER").build())
        .await
        .unwrap();
    store.set_status(2, MetaStatus::Deleted).await.unwrap();
    store.set_status(3, MetaStatus::Locked).await.unwrap();

    let scan = store
        .scan(&feed_expression("TEST_FEED"), &criteria(0, 100))
        .await
        .unwrap();
    let ids: Vec<i64> = scan.matches.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 3, 4, 5, 6]);
    assert!(scan.exhausted);
    assert_eq!(scan.last_examined_id, Some(7));

    let windowed = MetaCriteria {
        min_id: 0,
        min_create_time: Some(base + Duration::minutes(3)),
        max_create_time: Some(base + Duration::minutes(5)),
        max_matches: 100,
    };
    let scan = store
        .scan(&feed_expression("TEST_FEED"), &windowed)
        .await
        .unwrap();
    let ids: Vec<i64> = scan.matches.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![4, 5]);

    let capped = store
        .scan(&feed_expression("TEST_FEED"), &criteria(4, 2))
        .await
        .unwrap();
    let ids: Vec<i64> = capped.matches.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![4, 5]);
    assert!(!capped.exhausted);

    assert_eq!(store.max_id().await.unwrap(), Some(7));
    assert_eq!(store.get_by_id(7).await.unwrap().unwrap().feed_name, "OTHER");
}

#[tokio::test]
async fn test_meta_scan_spans_multiple_batches() {
    let db = setup().await;
    let store = SqliteMetaStore::new(db.pool().clone());
    for _ in 0..1200 {
        store.append(MetaRecordBuilder::new().build()).await.unwrap();
    }

    let scan = store
        .scan(&feed_expression("TEST_FEED"), &criteria(0, 1100))
        .await
        .unwrap();
    assert_eq!(scan.matches.len(), 1100);
    assert_eq!(scan.last_examined_id, Some(1100));
    assert!(!scan.exhausted);
}

#[tokio::test]
async fn test_meta_scan_skips_unreadable_record() {
    let db = setup().await;
    let store = SqliteMetaStore::new(db.pool().clone());
    for _ in 0..5 {
        store.append(MetaRecordBuilder::new().build()).await.unwrap();
    }
    sqlx::query("UPDATE meta_records SET attributes = 'not-json' WHERE id = 3")
        .execute(db.pool())
        .await
        .unwrap();

    let scan = store
        .scan(&feed_expression("TEST_FEED"), &criteria(0, 100))
        .await
        .unwrap();
    let ids: Vec<i64> = scan.matches.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 2, 4, 5]);
    assert_eq!(scan.examined, 5);
    assert_eq!(scan.last_examined_id, Some(5));
    assert!(scan.exhausted);
    assert_eq!(scan.evaluation_errors.len(), 1);
    assert_eq!(scan.evaluation_errors[0].meta_id, 3);

    // 命中上限先于损坏记录达到时不计入
    let capped = store
        .scan(&feed_expression("TEST_FEED"), &criteria(0, 2))
        .await
        .unwrap();
    assert!(capped.evaluation_errors.is_empty());
    assert_eq!(capped.last_examined_id, Some(2));
}

#[tokio::test]
async fn test_task_create_dedupes_and_cas() {
    let db = setup().await;
    let store = SqliteTaskStore::new(db.pool().clone());
    let now = Utc::now();

    let CreateOutcome::Created(task) = store.create(1, 10, now).await.unwrap() else {
        panic!("任务应当被创建");
    };
    assert_eq!(task.status, TaskStatus::Unassigned);
    assert_eq!(store.create(1, 10, now).await.unwrap(), CreateOutcome::Duplicate);

    let assign = TaskTransition::Assign {
        node_name: "node-a".to_string(),
        at: now,
    };
    let assigned = store.compare_and_swap(&task, &assign).await.unwrap().unwrap();
    assert_eq!(assigned.version, 1);
    assert_eq!(assigned.node_name.as_deref(), Some("node-a"));

    // 旧版本的第二次领取失败
    assert!(store.compare_and_swap(&task, &assign).await.unwrap().is_none());

    let failed = store
        .compare_and_swap(
            &assigned,
            &TaskTransition::Fail {
                at: now,
                stats: scheduler_domain::entities::OutcomeStats {
                    records_read: 3,
                    records_written: 0,
                    error_markers: vec!["解析失败".to_string()],
                },
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_markers, vec!["解析失败".to_string()]);

    // FAILED 的组合不会被重新创建
    assert_eq!(store.create(1, 10, now).await.unwrap(), CreateOutcome::Duplicate);
}

#[tokio::test]
async fn test_task_queries() {
    let db = setup().await;
    let store = SqliteTaskStore::new(db.pool().clone());
    let now = Utc::now();

    let mut tasks = Vec::new();
    for meta_id in 1..=4 {
        if let CreateOutcome::Created(task) = store.create(7, meta_id, now).await.unwrap() {
            tasks.push(task);
        }
    }

    let old = store
        .compare_and_swap(
            &tasks[0],
            &TaskTransition::Assign {
                node_name: "node-a".to_string(),
                at: now - Duration::minutes(30),
            },
        )
        .await
        .unwrap()
        .unwrap();
    store
        .compare_and_swap(
            &tasks[1],
            &TaskTransition::Assign {
                node_name: "node-b".to_string(),
                at: now,
            },
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(store.count(7, TaskStatus::Unassigned).await.unwrap(), 2);
    assert_eq!(store.count(7, TaskStatus::Assigned).await.unwrap(), 2);

    let unassigned = store.find(&TaskQuery::unassigned_for_filter(7, 1)).await.unwrap();
    assert_eq!(unassigned.len(), 1);
    assert_eq!(unassigned[0].meta_id, 3);

    let stale = store
        .find(&TaskQuery::assigned_before(now - Duration::minutes(10), 100))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, old.id);

    let node_b = store.find(&TaskQuery::assigned_to_node("node-b")).await.unwrap();
    assert_eq!(node_b.len(), 1);
    assert_eq!(node_b[0].meta_id, 2);
}
