//! Online index building: backfill, progress, pause and resume.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taxis::prelude::*;
use taxis_memory::{MemoryKv, MemoryTransaction};
use taxis_testing::{
    sample_users, test_store, write_record_bytes, TestAccess, TestRecord, USER,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn email_index() -> Index {
    Index::new(
        "by_email",
        IndexKind::Value,
        KeyExpression::field("email"),
        vec![USER.into()],
    )
}

fn seed_records(kv: &MemoryKv, layout: &StoreLayout, count: usize) {
    let mut txn = kv.begin().unwrap();
    for user in sample_users(count) {
        write_record_bytes(&mut txn, layout, &user.into());
    }
    txn.commit().unwrap();
}

fn indexer(kv: &MemoryKv, layout: &StoreLayout) -> OnlineIndexer<TestRecord, MemoryKv> {
    OnlineIndexer::new(
        kv.clone(),
        layout.clone(),
        email_index(),
        Arc::new(TestAccess),
        IndexerConfig {
            batch_size: 32,
            throttle_delay: Duration::ZERO,
            ..Default::default()
        },
    )
    .unwrap()
}

fn count_entries(kv: &MemoryKv, layout: &StoreLayout) -> usize {
    let txn = kv.begin().unwrap();
    let (begin, end) = layout.index("by_email").range();
    taxis_core::kvs::read_range(&txn, &begin, &end, RangeOptions::default())
        .unwrap()
        .len()
}

/// Reports cancelled after a fixed number of polls.
#[derive(Clone)]
struct CancelAfter(Arc<AtomicI64>);

impl CancelAfter {
    fn polls(n: i64) -> Self {
        Self(Arc::new(AtomicI64::new(n)))
    }
}

impl CancelToken for CancelAfter {
    async fn cancelled(&self) {
        std::future::pending::<()>().await
    }

    fn is_cancelled(&self) -> bool {
        self.0.fetch_sub(1, Ordering::SeqCst) <= 0
    }
}

#[tokio::test]
async fn backfill_builds_a_readable_index() {
    init_tracing();
    let (kv, layout) = test_store();
    seed_records(&kv, &layout, 250);

    let indexer = indexer(&kv, &layout);
    let stats = indexer.build_index(false, &NeverCancel).await.unwrap();

    assert_eq!(stats.records_scanned, 250);
    assert!(stats.batches >= 8);
    assert_eq!(indexer.state(), BuildState::Completed);
    assert_eq!(count_entries(&kv, &layout), 250);

    let txn = kv.begin().unwrap();
    layout
        .state_manager()
        .expect_readable("by_email", &txn)
        .unwrap();

    let progress = indexer.get_progress().unwrap();
    assert!(progress.fraction > 0.99);
}

#[tokio::test]
async fn cancelled_build_pauses_and_resumes() {
    init_tracing();
    let (kv, layout) = test_store();
    seed_records(&kv, &layout, 200);

    let indexer = indexer(&kv, &layout);

    // let three batches through, then interrupt
    let err = indexer
        .build_index(false, &CancelAfter::polls(3))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Cancelled));
    assert!(indexer.state().can_resume());

    let partial = count_entries(&kv, &layout);
    assert!(partial > 0 && partial < 200, "partial build of {partial}");

    // the index is write-only while unfinished
    {
        let txn = kv.begin().unwrap();
        assert!(layout
            .state_manager()
            .expect_readable("by_email", &txn)
            .is_err());
    }

    let stats = indexer.resume_build(&NeverCancel).await.unwrap();
    assert_eq!(count_entries(&kv, &layout), 200);

    // the session total covers every record exactly once: the range set
    // kept the resumed scan off the completed slices
    assert_eq!(stats.records_scanned, 200);
}

#[tokio::test]
async fn writers_overlap_the_build_without_duplicates() {
    let (kv, layout) = test_store();
    seed_records(&kv, &layout, 120);

    let indexer = indexer(&kv, &layout);

    // interrupt mid-build, then write a record through the manager while
    // the index is write-only
    let _ = indexer.build_index(false, &CancelAfter::polls(1)).await;

    let manager: IndexManager<TestRecord, MemoryTransaction> =
        IndexManager::new(layout.clone(), vec![email_index()]).unwrap();

    let fresh: TestRecord = taxis_testing::User::new(9_000, "late@x").into();
    let mut txn = kv.begin().unwrap();
    write_record_bytes(&mut txn, &layout, &fresh);
    manager
        .update(None, Some(&fresh), &TestAccess, &mut txn)
        .unwrap();
    txn.commit().unwrap();

    indexer.resume_build(&NeverCancel).await.unwrap();

    // 120 backfilled plus the concurrent write, no duplicate for the
    // record that was both written live and rescanned
    assert_eq!(count_entries(&kv, &layout), 121);
}

#[tokio::test]
async fn clear_first_discards_previous_state() {
    let (kv, layout) = test_store();
    seed_records(&kv, &layout, 50);

    let indexer = indexer(&kv, &layout);
    indexer.build_index(false, &NeverCancel).await.unwrap();
    assert_eq!(count_entries(&kv, &layout), 50);

    // plant a stray entry, then rebuild with clear_first
    {
        let mut txn = kv.begin().unwrap();
        let stray = layout
            .index("by_email")
            .pack(&Tuple::new().with("stray@x").with(777i64));
        txn.set(&stray, &[]);
        txn.commit().unwrap();
    }
    assert_eq!(count_entries(&kv, &layout), 51);

    indexer.build_index(true, &NeverCancel).await.unwrap();
    assert_eq!(count_entries(&kv, &layout), 50);
}

#[tokio::test]
async fn cancel_clears_progress_markers() {
    let (kv, layout) = test_store();
    seed_records(&kv, &layout, 100);

    let indexer = indexer(&kv, &layout);
    let _ = indexer.build_index(false, &CancelAfter::polls(1)).await;

    indexer.cancel().unwrap();
    assert_eq!(indexer.state(), BuildState::NotStarted);

    // with markers gone, a fresh build rescans everything
    let stats = indexer.build_index(false, &NeverCancel).await.unwrap();
    assert_eq!(stats.records_scanned, 100);
}
