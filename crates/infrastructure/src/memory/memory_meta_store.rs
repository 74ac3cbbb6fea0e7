use async_trait::async_trait;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{MetaRecord, MetaStatus, NewMetaRecord},
    expression::ExpressionOperator,
    repositories::{MetaCriteria, MetaScan, MetaStore},
};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::lock;

#[derive(Debug, Default)]
struct MetaState {
    last_id: i64,
    records: BTreeMap<i64, MetaRecord>,
}

/// 内存元数据存储
///
/// 记录由外部写入方通过 [`InMemoryMetaStore::append`] 追加，ID 单调递增。
#[derive(Debug, Default)]
pub struct InMemoryMetaStore {
    state: Mutex<MetaState>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: NewMetaRecord) -> SchedulerResult<MetaRecord> {
        let mut state = lock(&self.state)?;
        state.last_id += 1;
        let record = MetaRecord::from_new(state.last_id, record);
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    pub fn set_status(&self, id: i64, status: MetaStatus) -> SchedulerResult<()> {
        let mut state = lock(&self.state)?;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::InvalidParams(format!("元数据记录 {id} 不存在")))?;
        record.status = status;
        Ok(())
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn scan(
        &self,
        expression: &ExpressionOperator,
        criteria: &MetaCriteria,
    ) -> SchedulerResult<MetaScan> {
        let state = lock(&self.state)?;
        let mut scan = MetaScan::new();

        let candidates = state.records.range(criteria.min_id..).map(|(_, r)| r).filter(|r| {
            r.status.is_selectable()
                && r.in_window(criteria.min_create_time, criteria.max_create_time)
        });

        for record in candidates {
            if scan.offer(record.clone(), expression, criteria) {
                break;
            }
        }

        Ok(scan.finish(criteria))
    }

    async fn max_id(&self) -> SchedulerResult<Option<i64>> {
        Ok(lock(&self.state)?.records.keys().next_back().copied())
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<MetaRecord>> {
        Ok(lock(&self.state)?.records.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scheduler_domain::expression::{fields, Condition, ExpressionTerm};

    fn new_record(feed: &str) -> NewMetaRecord {
        NewMetaRecord {
            feed_name: feed.to_string(),
            type_name: "Raw Events".to_string(),
            status: MetaStatus::Unlocked,
            create_time: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    fn feed_expr(feed: &str) -> ExpressionOperator {
        ExpressionOperator::and(vec![
            ExpressionTerm::new(fields::FEED, Condition::Equals, feed).into()
        ])
    }

    #[tokio::test]
    async fn test_scan_respects_min_id_and_skips_deleted() {
        let store = InMemoryMetaStore::new();
        for _ in 0..5 {
            store.append(new_record("A")).unwrap();
        }
        store.set_status(4, MetaStatus::Deleted).unwrap();
        store.set_status(5, MetaStatus::Locked).unwrap();

        let criteria = MetaCriteria {
            min_id: 2,
            min_create_time: None,
            max_create_time: None,
            max_matches: 10,
        };
        let scan = store.scan(&feed_expr("A"), &criteria).await.unwrap();
        let ids: Vec<i64> = scan.matches.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3, 5]);
        assert!(scan.exhausted);
        assert_eq!(store.max_id().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_scan_collects_evaluation_errors() {
        let store = InMemoryMetaStore::new();
        let mut bad = new_record("A");
        bad.attributes.insert("Size".to_string(), "big".to_string());
        store.append(bad).unwrap();
        let mut good = new_record("A");
        good.attributes.insert("Size".to_string(), "12".to_string());
        store.append(good).unwrap();

        let expr = ExpressionOperator::and(vec![
            ExpressionTerm::new("Size", Condition::GreaterThan, "10").into()
        ]);
        let criteria = MetaCriteria {
            min_id: 0,
            min_create_time: None,
            max_create_time: None,
            max_matches: 10,
        };
        let scan = store.scan(&expr, &criteria).await.unwrap();
        assert_eq!(scan.matches.len(), 1);
        assert_eq!(scan.evaluation_errors.len(), 1);
        assert_eq!(scan.evaluation_errors[0].meta_id, 1);
        assert_eq!(scan.examined, 2);
    }
    #[tokio::test]
    async fn test_scan_matches_attributes_of_unlocked_and_locked_records() {
        use scheduler_testing_utils::MetaRecordBuilder;

        let store = InMemoryMetaStore::new();
        store
            .append(MetaRecordBuilder::new().with_attribute("Region", "eu").build())
            .unwrap();
        store
            .append(
                MetaRecordBuilder::new()
                    .with_attribute("Region", "eu")
                    .with_status(MetaStatus::Locked)
                    .build(),
            )
            .unwrap();
        store
            .append(
                MetaRecordBuilder::new()
                    .with_attribute("Region", "eu")
                    .with_status(MetaStatus::Deleted)
                    .build(),
            )
            .unwrap();
        store
            .append(MetaRecordBuilder::new().with_attribute("Region", "us").build())
            .unwrap();

        let expr = ExpressionOperator::and(vec![
            ExpressionTerm::new("Region", Condition::Equals, "eu").into()
        ]);
        let criteria = MetaCriteria {
            min_id: 0,
            min_create_time: None,
            max_create_time: None,
            max_matches: 10,
        };
        let scan = store.scan(&expr, &criteria).await.unwrap();
        let ids: Vec<i64> = scan.matches.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
