//! End-to-end maintenance of value and aggregate indexes through the
//! manager.

use taxis::prelude::*;
use taxis_memory::{MemoryKv, MemoryTransaction};
use taxis_testing::{
    sample_users, test_store, write_record_bytes, TestAccess, TestRecord, User, USER,
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

fn region_count_index() -> Index {
    Index::new(
        "count_by_region",
        IndexKind::Count,
        KeyExpression::field("region"),
        vec![USER.into()],
    )
}

fn balance_sum_index() -> Index {
    Index::new(
        "balance_by_region",
        IndexKind::Sum,
        KeyExpression::concat(vec![
            KeyExpression::field("region"),
            KeyExpression::field("balance_cents"),
        ]),
        vec![USER.into()],
    )
}

fn activate(kv: &MemoryKv, layout: &StoreLayout, names: &[&str]) {
    let states = layout.state_manager();
    let mut txn = kv.begin().unwrap();
    for name in names {
        states.enable(name, &mut txn).unwrap();
        states.make_readable(name, &mut txn).unwrap();
    }
    txn.commit().unwrap();
}

fn save(kv: &MemoryKv, layout: &StoreLayout, manager: &Manager, record: &TestRecord) {
    let mut txn = kv.begin().unwrap();
    write_record_bytes(&mut txn, layout, record);
    manager
        .update(None, Some(record), &TestAccess, &mut txn)
        .unwrap();
    txn.commit().unwrap();
}

fn delete(kv: &MemoryKv, layout: &StoreLayout, manager: &Manager, record: &TestRecord) {
    let mut txn = kv.begin().unwrap();
    taxis_testing::clear_record_bytes(&mut txn, layout, record);
    manager
        .update(Some(record), None, &TestAccess, &mut txn)
        .unwrap();
    txn.commit().unwrap();
}

fn value_entries(kv: &MemoryKv, layout: &StoreLayout, index: &Index) -> Vec<(Tuple, Tuple)> {
    let maintainer = ValueMaintainer::new(index.clone(), layout.index(&index.name));
    let txn = kv.begin().unwrap();
    maintainer
        .scan(&txn, &Tuple::new(), RangeOptions::default())
        .unwrap()
}

#[test]
fn value_index_tracks_inserts_and_deletes() {
    let (kv, layout) = test_store();
    let manager = Manager::new(layout.clone(), vec![email_index()]).unwrap();
    activate(&kv, &layout, &["by_email"]);

    let alice: TestRecord = User::new(1, "a@x").into();
    let bob: TestRecord = User::new(2, "b@x").into();
    save(&kv, &layout, &manager, &alice);
    save(&kv, &layout, &manager, &bob);

    let entries = value_entries(&kv, &layout, &email_index());
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0.get(0).unwrap().as_str(), Some("a@x"));
    assert_eq!(entries[0].1.get(0).unwrap().as_int(), Some(1));
    assert_eq!(entries[1].0.get(0).unwrap().as_str(), Some("b@x"));

    delete(&kv, &layout, &manager, &alice);

    let entries = value_entries(&kv, &layout, &email_index());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0.get(0).unwrap().as_str(), Some("b@x"));
    assert_eq!(entries[0].1.get(0).unwrap().as_int(), Some(2));
}

#[test]
fn value_index_update_moves_the_entry() {
    let (kv, layout) = test_store();
    let manager = Manager::new(layout.clone(), vec![email_index()]).unwrap();
    activate(&kv, &layout, &["by_email"]);

    let before: TestRecord = User::new(1, "old@x").into();
    save(&kv, &layout, &manager, &before);

    let after: TestRecord = User::new(1, "new@x").into();
    let mut txn = kv.begin().unwrap();
    write_record_bytes(&mut txn, &layout, &after);
    manager
        .update(Some(&before), Some(&after), &TestAccess, &mut txn)
        .unwrap();
    txn.commit().unwrap();

    let entries = value_entries(&kv, &layout, &email_index());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0.get(0).unwrap().as_str(), Some("new@x"));
}

#[test]
fn self_update_is_a_no_op() {
    let (kv, layout) = test_store();
    let manager = Manager::new(
        layout.clone(),
        vec![email_index(), region_count_index(), balance_sum_index()],
    )
    .unwrap();
    activate(
        &kv,
        &layout,
        &["by_email", "count_by_region", "balance_by_region"],
    );

    let user: TestRecord = User::new(1, "a@x").with_region("eu").with_balance(500).into();
    save(&kv, &layout, &manager, &user);
    let before = kv.len();

    // old == new leaves every index byte-identical
    let mut txn = kv.begin().unwrap();
    manager
        .update(Some(&user), Some(&user), &TestAccess, &mut txn)
        .unwrap();
    txn.commit().unwrap();

    assert_eq!(kv.len(), before);

    let counts = CountMaintainer::new(region_count_index(), layout.index("count_by_region"));
    let txn = kv.begin().unwrap();
    assert_eq!(counts.get(&txn, &Tuple::new().with("eu")).unwrap(), Some(1));
}

#[test]
fn disabled_index_receives_no_maintenance() {
    let (kv, layout) = test_store();
    let manager = Manager::new(layout.clone(), vec![email_index()]).unwrap();

    // never enabled: stays disabled
    let user: TestRecord = User::new(1, "a@x").into();
    save(&kv, &layout, &manager, &user);

    assert!(value_entries(&kv, &layout, &email_index()).is_empty());

    // once write-only, maintenance kicks in
    let mut txn = kv.begin().unwrap();
    layout.state_manager().enable("by_email", &mut txn).unwrap();
    txn.commit().unwrap();

    let other: TestRecord = User::new(2, "b@x").into();
    save(&kv, &layout, &manager, &other);

    let entries = value_entries(&kv, &layout, &email_index());
    assert_eq!(entries.len(), 1);
}

#[test]
fn null_fields_are_not_indexed() {
    let (kv, layout) = test_store();
    let index = Index::new(
        "by_region",
        IndexKind::Value,
        KeyExpression::field("region"),
        vec![USER.into()],
    );
    let manager = Manager::new(layout.clone(), vec![index.clone()]).unwrap();
    activate(&kv, &layout, &["by_region"]);

    // region is None: the record projects to no entries at all
    let user: TestRecord = User::new(1, "a@x").into();
    save(&kv, &layout, &manager, &user);

    assert!(value_entries(&kv, &layout, &index).is_empty());
}

#[test]
fn count_and_sum_follow_the_records() {
    let (kv, layout) = test_store();
    let manager = Manager::new(
        layout.clone(),
        vec![region_count_index(), balance_sum_index()],
    )
    .unwrap();
    activate(&kv, &layout, &["count_by_region", "balance_by_region"]);

    let users = sample_users(9);
    for user in &users {
        save(&kv, &layout, &manager, &user.clone().into());
    }

    let counts = CountMaintainer::new(
        region_count_index(),
        layout.index("count_by_region"),
    );
    let sums = SumMaintainer::new(
        balance_sum_index(),
        layout.index("balance_by_region"),
    );

    let txn = kv.begin().unwrap();
    let eu = Tuple::new().with("eu");

    let expected_count = users.iter().filter(|u| u.region.as_deref() == Some("eu")).count();
    let expected_sum: i64 = users
        .iter()
        .filter(|u| u.region.as_deref() == Some("eu"))
        .map(|u| u.balance_cents)
        .sum();

    assert_eq!(counts.get(&txn, &eu).unwrap(), Some(expected_count as i64));
    assert_eq!(sums.get(&txn, &eu).unwrap(), Some(expected_sum));
    drop(txn);

    // deleting a record walks the aggregates back
    let doomed: TestRecord = users[0].clone().into();
    delete(&kv, &layout, &manager, &doomed);

    let txn = kv.begin().unwrap();
    assert_eq!(
        counts.get(&txn, &eu).unwrap(),
        Some(expected_count as i64 - 1)
    );
    assert_eq!(
        sums.get(&txn, &eu).unwrap(),
        Some(expected_sum - users[0].balance_cents)
    );
}

#[test]
fn min_max_track_group_extremes() {
    let (kv, layout) = test_store();

    let min_index = Index::new(
        "min_score",
        IndexKind::Min,
        KeyExpression::concat(vec![
            KeyExpression::field("region"),
            KeyExpression::field("score"),
        ]),
        vec![USER.into()],
    );
    let max_index = Index::new(
        "max_score",
        IndexKind::Max,
        KeyExpression::concat(vec![
            KeyExpression::field("region"),
            KeyExpression::field("score"),
        ]),
        vec![USER.into()],
    );

    let manager =
        Manager::new(layout.clone(), vec![min_index.clone(), max_index.clone()]).unwrap();
    activate(&kv, &layout, &["min_score", "max_score"]);

    for (id, score) in [(1, 40), (2, 10), (3, 75)] {
        let user: TestRecord = User::new(id, &format!("u{id}@x"))
            .with_region("eu")
            .with_score(score)
            .into();
        save(&kv, &layout, &manager, &user);
    }

    let min = ExtremumMaintainer::new(min_index, layout.index("min_score")).unwrap();
    let max = ExtremumMaintainer::new(max_index, layout.index("max_score")).unwrap();

    let txn = kv.begin().unwrap();
    let eu = Tuple::new().with("eu");
    assert_eq!(min.get(&txn, &eu).unwrap(), Some(10));
    assert_eq!(max.get(&txn, &eu).unwrap(), Some(75));

    let empty = Tuple::new().with("mars");
    assert_eq!(min.get(&txn, &empty).unwrap(), None);
}

#[test]
fn avg_divides_sum_by_count() {
    let (kv, layout) = test_store();

    let avg_index = Index::new(
        "avg_balance",
        IndexKind::Avg,
        KeyExpression::concat(vec![
            KeyExpression::field("region"),
            KeyExpression::field("balance_cents"),
        ]),
        vec![USER.into()],
    );

    let manager = Manager::new(layout.clone(), vec![avg_index.clone()]).unwrap();
    activate(&kv, &layout, &["avg_balance"]);

    for (id, cents) in [(1, 100), (2, 200), (3, 600)] {
        let user: TestRecord = User::new(id, &format!("u{id}@x"))
            .with_region("eu")
            .with_balance(cents)
            .into();
        save(&kv, &layout, &manager, &user);
    }

    let avg = AvgMaintainer::new(avg_index, layout.index("avg_balance"));

    let txn = kv.begin().unwrap();
    assert_eq!(
        avg.average(&txn, &Tuple::new().with("eu")).unwrap(),
        Some(300.0)
    );
    assert_eq!(avg.average(&txn, &Tuple::new().with("mars")).unwrap(), None);
}

#[test]
fn state_transitions_are_validated() {
    let (kv, layout) = test_store();
    let states = layout.state_manager();

    // an unknown index reads as disabled
    {
        let txn = kv.begin().unwrap();
        assert_eq!(states.state("by_email", &txn).unwrap(), IndexState::Disabled);
    }

    // readable is only reachable through write-only
    {
        let mut txn = kv.begin().unwrap();
        let err = states.make_readable("by_email", &mut txn).unwrap_err();
        assert!(matches!(err, IndexError::InvalidStateTransition { .. }));
    }

    let mut txn = kv.begin().unwrap();
    states.enable("by_email", &mut txn).unwrap();
    states.make_readable("by_email", &mut txn).unwrap();
    txn.commit().unwrap();

    // ensure_readable is idempotent from any state
    let mut txn = kv.begin().unwrap();
    states.ensure_readable("by_email", &mut txn).unwrap();
    states.ensure_readable("by_email", &mut txn).unwrap();
    assert_eq!(states.state("by_email", &txn).unwrap(), IndexState::Readable);
    txn.commit().unwrap();

    // disable is legal from anywhere and leaves the data alone
    let mut txn = kv.begin().unwrap();
    states.disable("by_email", &mut txn).unwrap();
    assert_eq!(states.state("by_email", &txn).unwrap(), IndexState::Disabled);
    txn.commit().unwrap();

    // and an index can come straight back
    let mut txn = kv.begin().unwrap();
    states.ensure_readable("by_email", &mut txn).unwrap();
    assert_eq!(states.state("by_email", &txn).unwrap(), IndexState::Readable);
}

#[test]
fn permuted_index_reorders_columns() {
    let (kv, layout) = test_store();

    let mut index = Index::new(
        "score_then_region",
        IndexKind::Permuted,
        KeyExpression::concat(vec![
            KeyExpression::field("region"),
            KeyExpression::field("score"),
        ]),
        vec![USER.into()],
    );
    index.options.permutation = Some(vec![1, 0]);

    let manager = Manager::new(layout.clone(), vec![index.clone()]).unwrap();
    activate(&kv, &layout, &["score_then_region"]);

    let user: TestRecord = User::new(1, "a@x").with_region("eu").with_score(42).into();
    save(&kv, &layout, &manager, &user);

    let maintainer =
        PermutedMaintainer::new(index, layout.index("score_then_region")).unwrap();
    let txn = kv.begin().unwrap();
    let (begin, end) = maintainer.subspace().range();
    let entries =
        taxis_core::kvs::read_range(&txn, &begin, &end, RangeOptions::default()).unwrap();

    assert_eq!(entries.len(), 1);
    let tuple = maintainer.subspace().unpack(&entries[0].0).unwrap();
    // score leads, region follows, pk trails
    assert_eq!(tuple.get(0).unwrap().as_int(), Some(42));
    assert_eq!(tuple.get(1).unwrap().as_str(), Some("eu"));
    assert_eq!(tuple.get(2).unwrap().as_int(), Some(1));
}
