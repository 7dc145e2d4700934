//! Optimistic concurrency over the version index.

use taxis::prelude::*;
use taxis_memory::{MemoryKv, MemoryTransaction};
use taxis_testing::{test_store, write_record_bytes, TestAccess, TestRecord, User, USER};

type Manager = IndexManager<TestRecord, MemoryTransaction>;

fn version_index() -> Index {
    Index::new(
        "user_versions",
        IndexKind::Version,
        KeyExpression::Empty,
        vec![USER.into()],
    )
}

fn setup() -> (MemoryKv, StoreLayout, Manager, VersionMaintainer) {
    let (kv, layout) = test_store();
    let manager = Manager::new(layout.clone(), vec![version_index()]).unwrap();

    let states = layout.state_manager();
    let mut txn = kv.begin().unwrap();
    states.enable("user_versions", &mut txn).unwrap();
    states.make_readable("user_versions", &mut txn).unwrap();
    txn.commit().unwrap();

    let maintainer = VersionMaintainer::new(version_index(), layout.index("user_versions"));
    (kv, layout, manager, maintainer)
}

fn write(kv: &MemoryKv, layout: &StoreLayout, manager: &Manager, user: &User) {
    let record: TestRecord = user.clone().into();
    let mut txn = kv.begin().unwrap();
    write_record_bytes(&mut txn, layout, &record);
    manager
        .update(None, Some(&record), &TestAccess, &mut txn)
        .unwrap();
    txn.commit().unwrap();
}

#[test]
fn optimistic_writers_race_on_the_version() {
    let (kv, layout, manager, versions) = setup();
    let user = User::new(7, "seven@x");
    let pk = Tuple::new().with(7i64);

    // first write establishes v1
    write(&kv, &layout, &manager, &user);

    let v1 = {
        let txn = kv.begin().unwrap();
        versions.current_version(&txn, &pk).unwrap().unwrap().stamp
    };

    // second writer checks v1, succeeds, yields v2
    {
        let txn = kv.begin().unwrap();
        versions.check_version(&txn, &pk, v1).unwrap();
    }
    write(&kv, &layout, &manager, &user.clone().with_score(1));

    let v2 = {
        let txn = kv.begin().unwrap();
        versions.current_version(&txn, &pk).unwrap().unwrap().stamp
    };
    assert!(v1 < v2);

    // third writer still expects v1 and is turned away
    let txn = kv.begin().unwrap();
    let err = versions.check_version(&txn, &pk, v1).unwrap_err();
    match err {
        IndexError::VersionMismatch { expected, actual } => {
            assert_eq!(expected, v1);
            assert_eq!(actual, v2);
        }
        other => panic!("expected a version mismatch, got {other}"),
    }
}

#[test]
fn history_is_ordered_and_complete() {
    let (kv, layout, manager, versions) = setup();
    let user = User::new(1, "one@x");
    let pk = Tuple::new().with(1i64);

    for i in 0..4 {
        write(&kv, &layout, &manager, &user.clone().with_score(i));
    }

    let txn = kv.begin().unwrap();
    let history = versions.versions(&txn, &pk).unwrap();
    assert_eq!(history.len(), 4);
    for window in history.windows(2) {
        assert!(window[0].stamp < window[1].stamp);
    }

    let current = versions.current_version(&txn, &pk).unwrap().unwrap();
    assert_eq!(current.stamp, history.last().unwrap().stamp);
}

#[test]
fn deleting_the_record_drops_its_history() {
    let (kv, layout, manager, versions) = setup();
    let user = User::new(1, "one@x");
    let record: TestRecord = user.clone().into();
    let pk = Tuple::new().with(1i64);

    write(&kv, &layout, &manager, &user);
    write(&kv, &layout, &manager, &user);

    let mut txn = kv.begin().unwrap();
    taxis_testing::clear_record_bytes(&mut txn, &layout, &record);
    manager
        .update(Some(&record), None, &TestAccess, &mut txn)
        .unwrap();
    txn.commit().unwrap();

    let txn = kv.begin().unwrap();
    assert!(versions.versions(&txn, &pk).unwrap().is_empty());
    assert!(matches!(
        versions.check_version(&txn, &pk, Versionstamp::complete(1, 0)),
        Err(IndexError::VersionNotFound(_))
    ));
}

#[test]
fn neighboring_histories_do_not_bleed() {
    let (kv, layout, manager, versions) = setup();

    write(&kv, &layout, &manager, &User::new(1, "one@x"));
    write(&kv, &layout, &manager, &User::new(2, "two@x"));

    // the boundary read for pk 1 must not pick up pk 2's stamps
    let txn = kv.begin().unwrap();
    let one = versions
        .current_version(&txn, &Tuple::new().with(1i64))
        .unwrap()
        .unwrap();
    let two = versions
        .current_version(&txn, &Tuple::new().with(2i64))
        .unwrap()
        .unwrap();

    assert!(one.stamp < two.stamp);
    assert!(versions
        .current_version(&txn, &Tuple::new().with(3i64))
        .unwrap()
        .is_none());
}
