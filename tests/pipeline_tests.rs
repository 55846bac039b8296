//! End-to-end runs over a spool journal: capture, resolution, restart.

mod common;

use activity_journal::core::{EntityKey, EventKind, Frn, Usn};
use activity_journal::{Pipeline, PipelineConfig};
use common::*;
use tempfile::TempDir;

async fn pipeline(config: PipelineConfig, spool: &activity_journal::SpoolJournal) -> Pipeline {
    Pipeline::builder(config).spool(spool.clone()).build().await.unwrap()
}

fn key(frn: u64) -> EntityKey {
    EntityKey::new(volume(), Frn::from(frn))
}

#[tokio::test]
async fn test_create_modify_rename_delete_lifecycle() {
    let spool_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let pipeline = pipeline(test_config(), &spool).await;
    prime(&pipeline).await;

    spool
        .append(
            &volume(),
            &[
                change(100, ROOT, 10, "docs").create().dir().build(),
                change(200, 100, 20, "a.txt").create().build(),
                change(200, 100, 30, "a.txt").modify().build(),
                change(200, 100, 40, "a.txt").rename_old().build(),
                change(200, 100, 50, "b.txt").rename_new().build(),
                change(200, 100, 60, "b.txt").delete().build(),
            ],
        )
        .await
        .unwrap();

    let report = pipeline.run_once().await.unwrap();
    assert!(report.is_clean());
    let pass = &report.passes[0];
    assert_eq!(pass.events, 6);
    // the old-name half is folded into the rename
    assert_eq!(pass.written, 5);
    assert_eq!(pass.buffered, 0);
    assert_eq!(pass.committed, Some(Usn(60)));
    assert_eq!(report.resolution.resolved, 0);

    let docs = pipeline.entities().get(&key(100)).await.unwrap().unwrap();
    let file = pipeline.entities().get(&key(200)).await.unwrap().unwrap();
    assert_eq!(file.path_hint, "docs\\b.txt");
    assert_eq!(file.parent_entity_id, Some(docs.entity_id.clone()));
    assert!(file.deleted);

    let mut records = pipeline.hot().for_entity(&file.entity_id).await.unwrap();
    records.sort_by_key(|r| r.sequence_no);
    let kinds: Vec<EventKind> = records.iter().map(|r| r.event_kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Create, EventKind::Modify, EventKind::Rename, EventKind::Delete]
    );
    assert_eq!(
        records.iter().map(|r| r.sequence_no).collect::<Vec<_>>(),
        vec![20, 30, 50, 60]
    );
    assert!(records.iter().all(|r| !r.unresolved));

    let cursor = pipeline.cursors().load(&volume()).await.unwrap();
    assert_eq!(cursor.last_usn, Usn(60));
    assert_eq!(pipeline.queue().counts().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_unknown_reference_is_held_then_flushed_in_order() {
    let spool_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let pipeline = pipeline(test_config(), &spool).await;
    prime(&pipeline).await;

    spool
        .append(
            &volume(),
            &[
                change(100, ROOT, 10, "docs").create().dir().build(),
                // a file that existed before capture started
                change(300, 100, 20, "report.txt").modify().build(),
                change(300, 100, 30, "report.txt").modify().build(),
                change(300, 100, 40, "report.txt").build(),
            ],
        )
        .await
        .unwrap();

    let first = pipeline.run_once().await.unwrap();
    let pass = &first.passes[0];
    assert_eq!(pass.written, 1);
    assert_eq!(pass.buffered, 3);
    // held events pin the cursor just below the oldest of them
    assert_eq!(pass.committed, Some(Usn(19)));
    assert_eq!(first.resolution.resolved, 1);

    let entity = pipeline.entities().get(&key(300)).await.unwrap().unwrap();
    assert_eq!(entity.path_hint, "docs\\report.txt");
    let mut records = pipeline.hot().for_entity(&entity.entity_id).await.unwrap();
    records.sort_by_key(|r| r.sequence_no);
    assert_eq!(
        records.iter().map(|r| r.sequence_no).collect::<Vec<_>>(),
        vec![20, 30, 40]
    );
    assert_eq!(records[2].event_kind, EventKind::Close);
    assert_eq!(pipeline.cursors().load(&volume()).await.unwrap().last_usn, Usn(19));

    // the re-read range is recognized, not written twice
    let second = pipeline.run_once().await.unwrap();
    let pass = &second.passes[0];
    assert_eq!(pass.events, 3);
    assert_eq!(pass.written, 0);
    assert_eq!(pass.duplicates, 3);
    assert_eq!(pass.committed, Some(Usn(40)));
    assert_eq!(pipeline.hot().count().await.unwrap(), 4);
    assert_eq!(pipeline.resolver().held_keys().unwrap(), 0);
}

#[tokio::test]
async fn test_rename_split_across_passes_is_recorded_once() {
    let spool_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let pipeline = pipeline(test_config(), &spool).await;
    prime(&pipeline).await;

    spool
        .append(
            &volume(),
            &[
                change(200, ROOT, 10, "a.txt").create().build(),
                change(200, ROOT, 20, "a.txt").rename_old().build(),
            ],
        )
        .await
        .unwrap();
    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.passes[0].written, 1);
    // the waiting old-name half keeps its record unread
    assert_eq!(first.passes[0].committed, Some(Usn(19)));

    spool
        .append(&volume(), &[change(200, ROOT, 30, "b.txt").rename_new().build()])
        .await
        .unwrap();
    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.passes[0].events, 2);
    assert_eq!(second.passes[0].written, 1);
    assert_eq!(second.passes[0].committed, Some(Usn(30)));

    let file = pipeline.entities().get(&key(200)).await.unwrap().unwrap();
    assert_eq!(file.path_hint, "b.txt");
    let mut records = pipeline.hot().for_entity(&file.entity_id).await.unwrap();
    records.sort_by_key(|r| r.sequence_no);
    assert_eq!(
        records.iter().map(|r| (r.sequence_no, r.event_kind)).collect::<Vec<_>>(),
        vec![(10, EventKind::Create), (30, EventKind::Rename)]
    );
}

#[tokio::test]
async fn test_rereading_held_events_does_not_fill_the_buffer() {
    let spool_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let mut config = test_config();
    config.resolver.pending_buffer_capacity = 2;
    let pipeline = pipeline(config, &spool).await;
    prime(&pipeline).await;

    spool
        .append(&volume(), &[change(700, 600, 10, "held.txt").modify().build()])
        .await
        .unwrap();

    let mut buffered = Vec::new();
    for _ in 0..3 {
        let (passes, _) = pipeline.read_volumes().await.unwrap();
        buffered.push(passes[0].buffered);
        assert_eq!(pipeline.cursors().load(&volume()).await.unwrap().last_usn, Usn(9));
    }
    assert_eq!(buffered, vec![1, 0, 0]);
    assert_eq!(pipeline.resolver().held_keys().unwrap(), 1);

    let placeholder = activity_journal::EntityId::placeholder(&volume(), Frn::from(700u64));
    assert!(pipeline.hot().for_entity(&placeholder).await.unwrap().is_empty());
    assert_eq!(pipeline.hot().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_parent_directory_resolves_before_child() {
    let spool_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let pipeline = pipeline(test_config(), &spool).await;
    prime(&pipeline).await;

    spool
        .append(
            &volume(),
            &[
                change(500, 400, 10, "plan.txt").modify().build(),
                change(400, ROOT, 20, "projects").dir().build(),
            ],
        )
        .await
        .unwrap();

    let report = pipeline.run_once().await.unwrap();
    assert_eq!(report.passes[0].buffered, 2);
    assert_eq!(report.resolution.resolved, 2);
    assert_eq!(report.resolution.dead_lettered, 0);

    let dir = pipeline.entities().get(&key(400)).await.unwrap().unwrap();
    let file = pipeline.entities().get(&key(500)).await.unwrap().unwrap();
    assert_eq!(dir.path_hint, "projects");
    assert_eq!(file.path_hint, "projects\\plan.txt");
    assert_eq!(file.parent_entity_id, Some(dir.entity_id));
    assert_eq!(pipeline.hot().for_entity(&file.entity_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_records_straddling_decode_chunks() {
    let spool_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let mut config = test_config();
    config.journal.read_chunk_bytes = 200;
    config.journal.decode_chunk_bytes = 7;
    let pipeline = pipeline(config, &spool).await;
    prime(&pipeline).await;

    let events: Vec<_> = (0..10u64)
        .map(|i| {
            let name = format!("{}.log", "x".repeat(i as usize + 1));
            change(1_000 + i, ROOT, (i as i64 + 1) * 10, &name).create().build()
        })
        .collect();
    spool.append(&volume(), &events).await.unwrap();

    let report = pipeline.run_once().await.unwrap();
    let pass = &report.passes[0];
    assert_eq!(pass.events, 10);
    assert_eq!(pass.written, 10);
    assert_eq!(pass.malformed, 0);
    assert_eq!(pass.committed, Some(Usn(100)));

    let entity = pipeline.entities().get(&key(1_009)).await.unwrap().unwrap();
    assert_eq!(entity.path_hint, format!("{}.log", "x".repeat(10)));
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let spool_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let pipeline = pipeline(test_config(), &spool).await;
    prime(&pipeline).await;

    spool
        .append(
            &volume(),
            &[
                change(1_001, ROOT, 10, "one.txt").create().build(),
                change(1_002, ROOT, 20, "odd.txt").reason(0x4000_0000).build(),
                change(1_003, ROOT, 30, "three.txt").create().build(),
            ],
        )
        .await
        .unwrap();
    spool.append_raw(&volume(), &[0xFF; 16]).await.unwrap();

    let report = pipeline.run_once().await.unwrap();
    let pass = &report.passes[0];
    assert_eq!(pass.events, 2);
    assert_eq!(pass.written, 2);
    assert_eq!(pass.malformed, 2);
    assert_eq!(pass.committed, Some(Usn(30)));
    assert!(pipeline.entities().get(&key(1_002)).await.unwrap().is_none());

    let again = pipeline.run_once().await.unwrap();
    assert_eq!(again.passes[0].events, 0);
    assert_eq!(again.passes[0].malformed, 0);
    assert_eq!(pipeline.stats().malformed_records, 2);
}

#[tokio::test]
async fn test_restart_resumes_from_durable_cursor() {
    let spool_dir = TempDir::new().unwrap();
    let data_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let config = test_config().data_dir(data_dir.path());

    let entity_id = {
        let pipeline = pipeline(config.clone(), &spool).await;
        prime(&pipeline).await;
        spool
            .append(
                &volume(),
                &[
                    change(100, ROOT, 10, "docs").create().dir().build(),
                    change(200, 100, 20, "a.txt").create().build(),
                    change(200, 100, 30, "a.txt").modify().build(),
                ],
            )
            .await
            .unwrap();
        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.passes[0].written, 3);
        pipeline.entities().get(&key(200)).await.unwrap().unwrap().entity_id
    };

    let pipeline = pipeline(config, &spool).await;
    let status = pipeline.status().await.unwrap();
    assert_eq!(status.cursors.len(), 1);
    assert_eq!(status.cursors[0].last_usn, Usn(30));
    assert_eq!(status.hot_records, 3);
    assert_eq!(status.entities, 3);

    let report = pipeline.run_once().await.unwrap();
    assert!(report.passes[0].rescan.is_none());
    assert_eq!(report.passes[0].events, 0);

    spool
        .append(&volume(), &[change(200, 100, 40, "a.txt").modify().build()])
        .await
        .unwrap();
    let report = pipeline.run_once().await.unwrap();
    assert_eq!(report.passes[0].written, 1);
    let records = pipeline.hot().for_entity(&entity_id).await.unwrap();
    assert_eq!(records.len(), 3);
    pipeline.checkpoint().await.unwrap();
}

#[tokio::test]
async fn test_missing_volume_is_reported_not_fatal() {
    let spool_dir = TempDir::new().unwrap();
    let spool = spool_at(spool_dir.path()).await;
    let config = test_config().volumes(["C:", "Z:"]);
    let pipeline = pipeline(config, &spool).await;

    let report = pipeline.run_once().await.unwrap();
    assert_eq!(report.passes.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].volume_id, "Z:");
    assert_eq!(report.failures[0].error_kind, "not_found");
    assert!(!report.is_clean());
}
