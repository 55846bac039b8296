//! Hot to warm transition and TTL retention.

mod common;

use activity_journal::config::{ImportanceWeights, TransitionPolicy};
use activity_journal::core::{EntityId, EventKind, Frn, PipelineError, VolumeId};
use activity_journal::storage::{DocumentStore, InMemoryDocumentStore};
use activity_journal::tier::{ActivityRecord, BatchOutcome, HotTierWriter, TransitionEngine, WarmStore};
use activity_journal::Pipeline;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::*;
use std::sync::Arc;
use tempfile::TempDir;

struct Tiers {
    engine: TransitionEngine,
    hot: Arc<HotTierWriter>,
    warm: Arc<WarmStore>,
}

fn tiers_on(store: Arc<dyn DocumentStore>, max_batch_size: usize) -> Tiers {
    let hot = Arc::new(HotTierWriter::new(Arc::clone(&store), Duration::days(7).num_milliseconds()));
    let warm = Arc::new(WarmStore::new(Arc::clone(&store)));
    let policy = TransitionPolicy {
        batch_window_secs: 3600,
        max_batch_size,
        settle_delay_secs: 300,
        ..TransitionPolicy::default()
    };
    let engine = TransitionEngine::new(
        store,
        Arc::clone(&hot),
        Arc::clone(&warm),
        policy,
        ImportanceWeights::default(),
    );
    Tiers { engine, hot, warm }
}

fn tiers(max_batch_size: usize) -> Tiers {
    tiers_on(Arc::new(InMemoryDocumentStore::new()), max_batch_size)
}

fn hour() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

fn record(entity: &EntityId, seq: u64, kind: EventKind, at: DateTime<Utc>, ttl: Duration) -> ActivityRecord {
    ActivityRecord {
        entity_id: entity.clone(),
        event_kind: kind,
        timestamp: at,
        sequence_no: seq,
        volume_id: VolumeId::new("C:"),
        frn: Frn::from(seq),
        unresolved: false,
        expires_at: at + ttl,
    }
}

async fn fill_hour(hot: &HotTierWriter, entity: &EntityId, count: u64) {
    for seq in 0..count {
        let kind = if seq % 10 == 0 { EventKind::Close } else { EventKind::Modify };
        let at = hour() + Duration::milliseconds((seq * 3_000) as i64);
        hot.write(&record(entity, seq + 1, kind, at, Duration::days(7))).await.unwrap();
    }
}

#[tokio::test]
async fn test_thousand_records_become_one_summary() {
    let t = tiers(5_000);
    let entity = EntityId::from_raw("busy-file");
    fill_hour(&t.hot, &entity, 1_000).await;

    let report = t
        .engine
        .run_until_idle(hour() + Duration::hours(2), 100)
        .await
        .unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.records, 1_000);
    assert_eq!(report.summaries, 1);
    assert_eq!(t.hot.count().await.unwrap(), 0);

    let summaries = t.warm.for_entity(&entity).await.unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.window_start, hour());
    assert_eq!(summary.window_end, hour() + Duration::hours(1));
    assert_eq!(summary.total_events(), 1_000);
    assert_eq!(summary.event_counts_by_kind[&EventKind::Close], 100);
    assert_eq!(summary.event_counts_by_kind[&EventKind::Modify], 900);
    assert!(summary.importance_score > 0.0);
}

#[tokio::test]
async fn test_small_batches_merge_into_the_same_summary() {
    let t = tiers(300);
    let entity = EntityId::from_raw("busy-file");
    fill_hour(&t.hot, &entity, 1_000).await;

    let report = t
        .engine
        .run_until_idle(hour() + Duration::hours(2), 100)
        .await
        .unwrap();
    assert_eq!(report.batches, 4);
    assert_eq!(report.records, 1_000);

    let summaries = t.warm.for_entity(&entity).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_events(), 1_000);
    assert_eq!(
        summaries[0].applied_batches.iter().copied().collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );

    let checkpoint = t.engine.checkpoint().await.unwrap();
    assert_eq!(checkpoint.next_batch_id, 5);
    assert!(checkpoint.in_flight.is_none());
    assert!(checkpoint.watermark_timestamp.unwrap() >= hour() + Duration::hours(1));
}

#[tokio::test]
async fn test_interrupted_batch_resumes_without_double_counting() {
    let store: Arc<dyn DocumentStore> = Arc::new(FlakyStore::new(1));
    let t = tiers_on(store, 5_000);
    let entity = EntityId::from_raw("flaky");
    fill_hour(&t.hot, &entity, 50).await;
    let now = hour() + Duration::hours(2);

    let err = t.engine.run_batch(now).await.unwrap_err();
    assert!(matches!(err, PipelineError::StorageUnavailable(_)));
    let checkpoint = t.engine.checkpoint().await.unwrap();
    let claim = checkpoint.in_flight.clone().unwrap();
    assert_eq!(claim.batch_id, 1);
    assert_eq!(claim.record_keys.len(), 50);
    assert_eq!(checkpoint.watermark_timestamp, None);
    // the summary was written before the failure
    assert_eq!(t.warm.for_entity(&entity).await.unwrap()[0].total_events(), 50);

    match t.engine.run_batch(now).await.unwrap() {
        BatchOutcome::Applied(batch) => {
            assert!(batch.resumed);
            assert_eq!(batch.batch_id, 1);
            assert_eq!(batch.records, 50);
            assert_eq!(batch.skipped, 1);
            assert_eq!(batch.summaries, 0);
        }
        other => panic!("expected the claim to be resumed, got {other:?}"),
    }

    let summaries = t.warm.for_entity(&entity).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_events(), 50);
    assert_eq!(t.hot.count().await.unwrap(), 0);
    let checkpoint = t.engine.checkpoint().await.unwrap();
    assert!(checkpoint.in_flight.is_none());
    assert_eq!(checkpoint.watermark_timestamp, Some(hour() + Duration::hours(1)));
}

#[tokio::test]
async fn test_unsettled_records_stay_hot() {
    let t = tiers(5_000);
    let entity = EntityId::from_raw("recent");
    let now = hour() + Duration::minutes(30);
    t.hot
        .write(&record(&entity, 1, EventKind::Create, now - Duration::minutes(20), Duration::days(7)))
        .await
        .unwrap();
    t.hot
        .write(&record(&entity, 2, EventKind::Modify, now - Duration::minutes(1), Duration::days(7)))
        .await
        .unwrap();

    let report = t.engine.run_until_idle(now, 10).await.unwrap();
    assert_eq!(report.records, 1);
    assert_eq!(t.hot.count().await.unwrap(), 1);
    let watermark = t.engine.watermark().await.unwrap().unwrap();
    assert!(watermark <= now - Duration::minutes(5));
}

#[tokio::test]
async fn test_sweep_only_removes_expired_records_behind_watermark() {
    let t = tiers(5_000);
    let entity = EntityId::from_raw("old");
    let day = Duration::days(1);
    let now = hour() + Duration::days(10);

    // nothing transitioned yet: expired or not, records are kept
    t.hot
        .write(&record(&entity, 1, EventKind::Modify, hour(), day))
        .await
        .unwrap();
    assert_eq!(t.engine.sweep_expired(now).await.unwrap(), 0);

    t.engine.run_until_idle(now, 1_000).await.unwrap();
    let watermark = t.engine.watermark().await.unwrap().unwrap();
    assert!(watermark > hour());

    // late arrivals below the watermark: one expired, one still live
    t.hot
        .write(&record(&entity, 2, EventKind::Modify, hour(), day))
        .await
        .unwrap();
    t.hot
        .write(&record(&entity, 3, EventKind::Modify, hour(), Duration::days(30)))
        .await
        .unwrap();
    assert_eq!(t.engine.sweep_expired(now).await.unwrap(), 1);
    let left = t.hot.for_entity(&entity).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].sequence_no, 3);
}

#[tokio::test]
async fn test_pipeline_moves_settled_activity_to_warm_tier() {
    let dir = TempDir::new().unwrap();
    let spool = spool_at(dir.path()).await;
    let pipeline = Pipeline::builder(test_config())
        .spool(spool.clone())
        .build()
        .await
        .unwrap();
    prime(&pipeline).await;

    let earlier = Utc::now() - Duration::hours(3);
    spool
        .append(
            &volume(),
            &[
                change(100, ROOT, 10, "docs").create().dir().at(earlier).build(),
                change(200, 100, 20, "a.txt").create().at(earlier).build(),
                change(200, 100, 30, "a.txt").modify().at(earlier + Duration::seconds(5)).build(),
                change(200, 100, 40, "a.txt").modify().at(earlier + Duration::seconds(9)).build(),
            ],
        )
        .await
        .unwrap();

    let report = pipeline.run_once().await.unwrap();
    assert_eq!(report.passes[0].written, 4);
    assert_eq!(report.transition.records, 4);
    assert_eq!(pipeline.hot().count().await.unwrap(), 0);

    let file = pipeline
        .entities()
        .get(&activity_journal::EntityKey::new(volume(), Frn::from(200u64)))
        .await
        .unwrap()
        .unwrap();
    let summaries = pipeline.warm().for_entity(&file.entity_id).await.unwrap();
    let total: u64 = summaries.iter().map(|s| s.total_events()).sum();
    assert_eq!(total, 3);
    assert!(summaries.iter().all(|s| s.window_end <= Utc::now()));

    let status = pipeline.status().await.unwrap();
    assert_eq!(status.hot_records, 0);
    assert!(status.warm_summaries >= 2);
    assert!(status.checkpoint.watermark_timestamp.is_some());
    assert_eq!(pipeline.stats().records_transitioned, 4);
}
