//! Scrubber detection and repair of index corruption.

use std::sync::Arc;

use taxis::prelude::*;
use taxis_memory::{MemoryKv, MemoryTransaction};
use taxis_testing::{
    clear_record_bytes, sample_users, test_store, write_record_bytes, TestAccess, TestRecord,
    USER,
};

type Manager = IndexManager<TestRecord, MemoryTransaction>;

fn email_index() -> Index {
    Index::new(
        "by_email",
        IndexKind::Value,
        KeyExpression::field("email"),
        vec![USER.into()],
    )
}

/// A store with the index active and `count` indexed users.
fn healthy_store(count: usize) -> (MemoryKv, StoreLayout, Manager, Vec<TestRecord>) {
    let (kv, layout) = test_store();
    let manager = Manager::new(layout.clone(), vec![email_index()]).unwrap();

    let states = layout.state_manager();
    let mut txn = kv.begin().unwrap();
    states.enable("by_email", &mut txn).unwrap();
    states.make_readable("by_email", &mut txn).unwrap();
    txn.commit().unwrap();

    let records: Vec<TestRecord> = sample_users(count).into_iter().map(Into::into).collect();

    let mut txn = kv.begin().unwrap();
    for record in &records {
        write_record_bytes(&mut txn, &layout, record);
        manager
            .update(None, Some(record), &TestAccess, &mut txn)
            .unwrap();
    }
    txn.commit().unwrap();

    (kv, layout, manager, records)
}

fn scrubber(
    kv: &MemoryKv,
    layout: &StoreLayout,
    config: ScrubberConfig,
) -> Scrubber<TestRecord, MemoryKv> {
    Scrubber::new(
        kv.clone(),
        layout.clone(),
        email_index(),
        Arc::new(TestAccess),
        config,
    )
    .unwrap()
}

#[tokio::test]
async fn healthy_index_scrubs_clean() {
    let (kv, layout, _manager, _records) = healthy_store(25);

    let scrub = scrubber(&kv, &layout, ScrubberConfig::default());
    let result = scrub.scrub_index(&NeverCancel).await;

    assert!(result.is_healthy);
    assert!(result.completed_successfully);
    assert!(result.error.is_none());
    assert_eq!(result.summary.entries_scanned, 25);
    assert_eq!(result.summary.records_scanned, 25);
    assert_eq!(result.summary.dangling, IssueCounts::default());
    assert_eq!(result.summary.missing, IssueCounts::default());
}

#[tokio::test]
async fn dangling_entry_is_detected_and_repaired() {
    let (kv, layout, _manager, records) = healthy_store(10);

    // delete one record behind the maintainers' back
    {
        let mut txn = kv.begin().unwrap();
        clear_record_bytes(&mut txn, &layout, &records[3]);
        txn.commit().unwrap();
    }

    let scrub = scrubber(&kv, &layout, ScrubberConfig::aggressive());
    let result = scrub.scrub_index(&NeverCancel).await;

    assert!(!result.is_healthy);
    assert!(result.completed_successfully);
    assert_eq!(result.summary.dangling.detected, 1);
    assert_eq!(result.summary.dangling.repaired, 1);
    assert_eq!(result.summary.missing.detected, 0);

    // the repaired index now scrubs clean
    let result = scrubber(&kv, &layout, ScrubberConfig::default())
        .scrub_index(&NeverCancel)
        .await;
    assert!(result.is_healthy);
    assert!(result.completed_successfully);
}

#[tokio::test]
async fn missing_entry_is_detected_and_repaired() {
    let (kv, layout, _manager, records) = healthy_store(10);

    // erase one index entry directly
    {
        let record = &records[5];
        let email = match record {
            TestRecord::User(user) => user.email.clone(),
            other => panic!("unexpected record {other:?}"),
        };
        let key = layout
            .index("by_email")
            .pack(&Tuple::new().with(email.as_str()).concat(&record.primary_key()));

        let mut txn = kv.begin().unwrap();
        txn.clear(&key);
        txn.commit().unwrap();
    }

    let scrub = scrubber(&kv, &layout, ScrubberConfig::aggressive());
    let result = scrub.scrub_index(&NeverCancel).await;

    assert!(!result.is_healthy);
    assert!(result.completed_successfully);
    assert_eq!(result.summary.missing.detected, 1);
    assert_eq!(result.summary.missing.repaired, 1);

    let result = scrubber(&kv, &layout, ScrubberConfig::default())
        .scrub_index(&NeverCancel)
        .await;
    assert!(result.is_healthy);
}

#[tokio::test]
async fn report_only_mode_detects_without_touching() {
    let (kv, layout, _manager, records) = healthy_store(10);

    {
        let mut txn = kv.begin().unwrap();
        clear_record_bytes(&mut txn, &layout, &records[0]);
        txn.commit().unwrap();
    }

    // default preset reports but does not repair
    let result = scrubber(&kv, &layout, ScrubberConfig::default())
        .scrub_index(&NeverCancel)
        .await;
    assert!(!result.is_healthy);
    assert_eq!(result.summary.dangling.detected, 1);
    assert_eq!(result.summary.dangling.repaired, 0);

    // so a second run still sees the damage
    let result = scrubber(&kv, &layout, ScrubberConfig::default())
        .scrub_index(&NeverCancel)
        .await;
    assert_eq!(result.summary.dangling.detected, 1);
}

#[tokio::test]
async fn tiny_budgets_still_make_forward_progress() {
    let (kv, layout, _manager, _records) = healthy_store(40);

    // a byte budget smaller than any entry forces one-entry batches
    let config = ScrubberConfig {
        entries_scan_limit: 3,
        max_transaction_bytes: 1,
        ..ScrubberConfig::default()
    };

    let result = scrubber(&kv, &layout, config).scrub_index(&NeverCancel).await;

    assert!(result.is_healthy);
    assert!(result.completed_successfully);
    assert_eq!(result.summary.entries_scanned, 40);
    assert_eq!(result.summary.records_scanned, 40);
}

#[test]
fn scrubbing_requires_a_readable_index() {
    let (kv, layout) = test_store();

    // index exists but was never made readable
    let err = Scrubber::<TestRecord, _>::new(
        kv.clone(),
        layout.clone(),
        email_index(),
        Arc::new(TestAccess),
        ScrubberConfig::default(),
    )
    .unwrap_err();

    assert!(matches!(err, IndexError::IndexNotReadable(_)));
}

#[test]
fn scrubbing_rejects_unsupported_kinds() {
    let (kv, layout) = test_store();

    let rank_index = Index::new(
        "leaderboard",
        IndexKind::Rank,
        KeyExpression::field("score"),
        vec![USER.into()],
    );

    let err = Scrubber::<TestRecord, _>::new(
        kv,
        layout,
        rank_index,
        Arc::new(TestAccess),
        ScrubberConfig::default(),
    )
    .unwrap_err();

    assert!(matches!(err, IndexError::InvalidArgument(_)));
}

#[tokio::test]
async fn cancellation_preserves_partial_progress() {
    let (kv, layout, _manager, _records) = healthy_store(60);

    #[derive(Clone)]
    struct CancelImmediately;

    impl CancelToken for CancelImmediately {
        async fn cancelled(&self) {}

        fn is_cancelled(&self) -> bool {
            true
        }
    }

    let config = ScrubberConfig {
        entries_scan_limit: 10,
        ..ScrubberConfig::default()
    };

    let result = scrubber(&kv, &layout, config.clone())
        .scrub_index(&CancelImmediately)
        .await;
    assert!(!result.completed_successfully);
    assert!(result.termination_reason.is_some());
    assert!(result.error.is_none());

    // a later run finishes the job
    let result = scrubber(&kv, &layout, config).scrub_index(&NeverCancel).await;
    assert!(result.completed_successfully);
    assert!(result.is_healthy);
}
