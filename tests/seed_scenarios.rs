//! End-to-end coverage of the database's public `Database` API, one test
//! per seed scenario.

use smallvec::SmallVec;
use tracedb::{ArgValue, ContextInfo, Database, DbEvent, EventTypeFlags, QueryMatch, RawEvent};

/// Routes the crate's `tracing` output (batch boundaries, dropped-event
/// warnings) to the test harness's captured output. Safe to call from
/// every test; only the first call actually installs a subscriber.
fn init_tracing() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

fn enter(time: i64, zone_key: u64) -> RawEvent {
    RawEvent { type_name: "wtf.scope#enter".into(), time, zone_key, args: SmallVec::new() }
}
fn leave(time: i64, zone_key: u64) -> RawEvent {
    RawEvent { type_name: "wtf.scope#leave".into(), time, zone_key, args: SmallVec::new() }
}
fn zone_create(time: i64, zone_key: u64, name: &str) -> RawEvent {
    let mut args = SmallVec::<[ArgValue; 4]>::new();
    args.push(ArgValue::Str(name.into()));
    args.push(ArgValue::Str("thread".into()));
    args.push(ArgValue::Str("main".into()));
    RawEvent { type_name: "wtf.zone#create".into(), time, zone_key, args }
}

#[test]
fn s1_single_zone_nested_scopes_report_correct_durations() {
    init_tracing();
    let mut db = Database::default();
    db.begin_event_batch(ContextInfo::default()).unwrap();
    db.trace_event(zone_create(0, 1, "main")).unwrap();
    db.trace_event(enter(10, 1)).unwrap();
    db.trace_event(enter(20, 1)).unwrap();
    db.trace_event(leave(30, 1)).unwrap();
    db.trace_event(leave(50, 1)).unwrap();
    db.end_event_batch().unwrap();

    let zone = &db.zone_indices()[0];
    let outer = zone.scope(zone.get_root_scopes()[0]);
    assert_eq!(outer.total_duration, Some(40));
    assert_eq!(outer.user_duration, Some(30));
    let inner = zone.scope(outer.children[0]);
    assert_eq!(inner.total_duration, Some(10));
    assert_eq!(inner.user_duration, Some(10));
}

#[test]
fn s2_out_of_order_arrival_within_a_batch_reaches_the_same_forest() {
    let mut in_order = Database::default();
    in_order.begin_event_batch(ContextInfo::default()).unwrap();
    in_order.trace_event(zone_create(0, 1, "main")).unwrap();
    in_order.trace_event(enter(10, 1)).unwrap();
    in_order.trace_event(enter(20, 1)).unwrap();
    in_order.trace_event(leave(30, 1)).unwrap();
    in_order.trace_event(leave(50, 1)).unwrap();
    in_order.end_event_batch().unwrap();

    let mut shuffled = Database::default();
    shuffled.begin_event_batch(ContextInfo::default()).unwrap();
    shuffled.trace_event(zone_create(0, 1, "main")).unwrap();
    shuffled.trace_event(leave(50, 1)).unwrap();
    shuffled.trace_event(leave(30, 1)).unwrap();
    shuffled.trace_event(enter(20, 1)).unwrap();
    shuffled.trace_event(enter(10, 1)).unwrap();
    shuffled.end_event_batch().unwrap();

    let a = &in_order.zone_indices()[0];
    let b = &shuffled.zone_indices()[0];
    let outer_a = a.scope(a.get_root_scopes()[0]);
    let outer_b = b.scope(b.get_root_scopes()[0]);
    assert_eq!(outer_a.total_duration, outer_b.total_duration);
    assert_eq!(outer_a.user_duration, outer_b.user_duration);
}

#[test]
fn s3_an_unmatched_leave_is_dropped_and_reported_not_fatal() {
    init_tracing();
    let mut db = Database::default();
    db.begin_event_batch(ContextInfo::default()).unwrap();
    db.trace_event(zone_create(0, 1, "main")).unwrap();
    db.trace_event(leave(10, 1)).unwrap();
    db.end_event_batch().unwrap();

    assert!(db.zone_indices()[0].get_root_scopes().is_empty());
    let notifications = db.drain_events();
    assert!(notifications.iter().any(|e| matches!(e, DbEvent::SourceError { .. })));
}

#[test]
fn s4_a_zone_created_mid_batch_still_receives_its_own_events() {
    init_tracing();
    let mut db = Database::default();
    db.begin_event_batch(ContextInfo::default()).unwrap();
    db.trace_event(enter(0, 0)).unwrap(); // an unrelated, zoneless event first
    db.trace_event(zone_create(5, 7, "late-zone")).unwrap();
    db.trace_event(enter(10, 7)).unwrap();
    db.trace_event(leave(20, 7)).unwrap();
    db.end_event_batch().unwrap();

    assert_eq!(db.zone_indices().len(), 1);
    let zone = &db.zone_indices()[0];
    assert_eq!(&*zone.zone.name, "late-zone");
    assert_eq!(zone.event_count(), 2);
    assert_eq!(zone.get_root_scopes().len(), 1);

    let notifications = db.drain_events();
    assert!(notifications.iter().any(|e| matches!(e, DbEvent::ZonesAdded(z) if z.len() == 1)));
}

#[test]
fn s5_a_filter_query_matches_by_substring_and_excludes_internal_events() {
    let mut db = Database::default();
    db.begin_event_batch(ContextInfo::default()).unwrap();
    db.trace_event(zone_create(0, 1, "main")).unwrap();
    db.trace_event(enter(10, 1)).unwrap();
    db.trace_event(leave(20, 1)).unwrap();
    db.end_event_batch().unwrap();

    let result = db.query("scope#enter").unwrap();
    assert_eq!(result.results.len(), 1);

    // zone#create is INTERNAL and must never surface in a filter result,
    // even though its name contains "zone".
    let result = db.query("zone#create").unwrap();
    assert_eq!(result.results.len(), 0);
}

#[test]
fn s5_a_tree_expression_selects_zones_by_attribute() {
    let mut db = Database::default();
    db.begin_event_batch(ContextInfo::default()).unwrap();
    db.trace_event(zone_create(0, 1, "main")).unwrap();
    db.trace_event(zone_create(0, 2, "worker")).unwrap();
    db.trace_event(enter(10, 1)).unwrap();
    db.trace_event(leave(20, 1)).unwrap();
    db.end_event_batch().unwrap();

    let result = db.query("/zone[@name='main']/scope").unwrap();
    assert_eq!(result.results.len(), 1);
}

#[test]
fn s6_flow_branch_extend_terminate_and_data_left_fold() {
    let mut db = Database::default();
    db.begin_event_batch(ContextInfo::default()).unwrap();

    let mut branch_args = SmallVec::<[ArgValue; 4]>::new();
    branch_args.push(ArgValue::Int(42));
    branch_args.push(ArgValue::Int(0));
    db.trace_event(RawEvent { type_name: "wtf.flow#branch".into(), time: 0, zone_key: 0, args: branch_args })
        .unwrap();

    let mut data_args = SmallVec::<[ArgValue; 4]>::new();
    data_args.push(ArgValue::Int(42));
    data_args.push(ArgValue::Str("status".into()));
    data_args.push(ArgValue::Str("started".into()));
    db.trace_event(RawEvent { type_name: "wtf.flow#data".into(), time: 1, zone_key: 0, args: data_args }).unwrap();

    let mut extend_args = SmallVec::<[ArgValue; 4]>::new();
    extend_args.push(ArgValue::Int(42));
    db.trace_event(RawEvent { type_name: "wtf.flow#extend".into(), time: 2, zone_key: 0, args: extend_args })
        .unwrap();

    let mut terminate_args = SmallVec::<[ArgValue; 4]>::new();
    terminate_args.push(ArgValue::Int(42));
    db.trace_event(RawEvent { type_name: "wtf.flow#terminate".into(), time: 3, zone_key: 0, args: terminate_args })
        .unwrap();

    db.end_event_batch().unwrap();

    let flow = db.flow_tracker().get(tracedb::FlowId(42)).expect("flow 42 tracked");
    assert!(flow.branch.is_some());
    assert_eq!(flow.extends.len(), 1);
    assert!(flow.terminate.is_some());
    let data = flow.data(db.registry());
    assert_eq!(data.get("status"), Some(&ArgValue::Str("started".into())));
}

#[test]
fn s1_a_filter_match_on_a_pre_registered_named_scope_yields_its_reconstructed_scope() {
    let mut db = Database::default();
    db.register_event_type("app.render#enter", vec![], EventTypeFlags::SCOPE_ENTER);

    db.begin_event_batch(ContextInfo::default()).unwrap();
    db.trace_event(zone_create(0, 1, "main")).unwrap();
    db.trace_event(RawEvent { type_name: "app.render#enter".into(), time: 10, zone_key: 1, args: SmallVec::new() })
        .unwrap();
    db.trace_event(leave(30, 1)).unwrap();
    db.end_event_batch().unwrap();

    let result = db.query("render#enter").unwrap();
    assert_eq!(result.results.len(), 1);
    match &result.results[0] {
        QueryMatch::Scope { enter_time, leave_time, .. } => {
            assert_eq!(*enter_time, 10);
            assert_eq!(*leave_time, Some(30));
        }
        other => panic!("expected QueryMatch::Scope, got {other:?}"),
    }
}

#[test]
fn database_rejects_batch_protocol_misuse() {
    let mut db = Database::default();
    assert!(db.trace_event(enter(0, 0)).is_err());
    db.begin_event_batch(ContextInfo::default()).unwrap();
    assert!(db.begin_event_batch(ContextInfo::default()).is_err());
}
