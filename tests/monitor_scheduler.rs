// tests/monitor_scheduler.rs
mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Utc};

use common::{fast_config, primary_payload, sha_nyc_in, MockSink, ScriptedAdapter};
use fare_radar::aggregator::Aggregator;
use fare_radar::cache::ResultCache;
use fare_radar::error::{MonitorError, NotifyError, SourceError};
use fare_radar::model::{SearchQuery, SourceId};
use fare_radar::monitor::{CheckOutcome, MonitorScheduler, MonitorStatus, SchedulerConfig};
use fare_radar::notify::{
    Channel, ChannelTarget, DeliveryStatus, NotificationDispatcher, NotificationKind, NotifyConfig,
};
use fare_radar::quota::{Metric, Principal, QuotaEnforcer, QuotaLimits, Tier};
use fare_radar::store::{MemoryStore, MonitorStore, NotificationLog};

struct Rig {
    store: Arc<MemoryStore>,
    engine: Arc<ScriptedAdapter>,
    sink: Arc<MockSink>,
    sched: MonitorScheduler,
}

fn rig_with(limits: QuotaLimits, cfg: SchedulerConfig) -> Rig {
    let store = Arc::new(MemoryStore::new());
    let engine = ScriptedAdapter::ok(SourceId::Primary, primary_payload(&[(3500.0, "a1")]));
    // zero TTL: every check reaches the engine
    let cache = Arc::new(ResultCache::new(Duration::ZERO, Duration::from_secs(5)));
    let mut agg_cfg = fast_config();
    agg_cfg.source_timeout = Duration::from_secs(2);
    let agg = Arc::new(Aggregator::new(
        fare_radar::sources::SourceRegistry::new().with_primary(engine.clone()),
        cache,
        agg_cfg,
    ));
    let sink = MockSink::new(Channel::Email);
    let dispatcher = NotificationDispatcher::new(
        store.clone(),
        NotifyConfig {
            max_attempts: 2,
            base_backoff: Duration::from_millis(5),
            send_timeout: Duration::from_secs(1),
        },
    )
    .with_sender(sink.clone());
    let quota = Arc::new(QuotaEnforcer::new(store.clone(), store.clone(), limits));
    let sched = MonitorScheduler::new(store.clone(), agg, Arc::new(dispatcher), quota, cfg);
    Rig {
        store,
        engine,
        sink,
        sched,
    }
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        workers: 2,
        tick: Duration::from_millis(50),
        lease_ttl: Duration::from_secs(5),
        failure_threshold: 5,
        alert_cooldown_secs: 10_800,
        price_bucket: 50.0,
        min_interval_secs: 60,
    }
}

fn rig() -> Rig {
    rig_with(QuotaLimits::default(), test_config())
}

fn user() -> Principal {
    Principal::new("traveller", Tier::Plus)
}

fn email() -> Vec<ChannelTarget> {
    vec![ChannelTarget {
        channel: Channel::Email,
        recipient: "traveller@example.com".into(),
    }]
}

async fn create(r: &Rig, query: SearchQuery) -> u64 {
    r.sched
        .create_monitor(&user(), query, 3000.0, 3600, email())
        .await
        .unwrap()
        .id
}

/// Pulls `next_check_at` into the past so the next `run_check` is due.
async fn make_due(r: &Rig, id: u64) {
    let mut t = r.store.get_monitor(id).await.unwrap().unwrap();
    t.next_check_at = Utc::now() - chrono::Duration::seconds(1);
    r.store.save_monitor(&t).await.unwrap();
}

#[tokio::test]
async fn price_below_threshold_notifies_exactly_once() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    let mut t = r.store.get_monitor(id).await.unwrap().unwrap();
    t.last_known_price = Some(3500.0);
    r.store.save_monitor(&t).await.unwrap();

    r.engine.set_result(Ok(primary_payload(&[(2800.0, "cheap"), (3300.0, "other")])));
    let out = r.sched.run_check(id).await.unwrap();
    assert_eq!(out, CheckOutcome::Checked { price: Some(2800.0), alerted: 1 });

    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.last_known_price, Some(2800.0));
    assert_eq!(t.status, MonitorStatus::Active);
    assert!(t.last_check_at.is_some());
    assert!(t.next_check_at > Utc::now());

    let sent = r.sink.delivered();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "traveller@example.com");
    assert_eq!(sent[0].1.kind, NotificationKind::PriceDrop);
    assert!(sent[0].1.text.contains("2800"));

    let records = r.store.records_for(id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Sent);

    // same price again: not a new drop, nothing sent
    make_due(&r, id).await;
    let out = r.sched.run_check(id).await.unwrap();
    assert_eq!(out, CheckOutcome::Checked { price: Some(2800.0), alerted: 0 });
    assert_eq!(r.sink.delivered().len(), 1);
}

#[tokio::test]
async fn price_above_threshold_only_updates_last_known() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    r.engine.set_result(Ok(primary_payload(&[(3200.0, "a1")])));

    let out = r.sched.run_check(id).await.unwrap();
    assert_eq!(out, CheckOutcome::Checked { price: Some(3200.0), alerted: 0 });
    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.last_known_price, Some(3200.0));
    assert!(r.sink.delivered().is_empty());
}

#[tokio::test]
async fn five_failures_suspend_with_one_notice() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    r.engine.set_result(Err(SourceError::Upstream("502".into())));

    for n in 1..=4 {
        make_due(&r, id).await;
        assert_eq!(r.sched.run_check(id).await.unwrap(), CheckOutcome::Failed { failures: n });
    }
    make_due(&r, id).await;
    assert_eq!(r.sched.run_check(id).await.unwrap(), CheckOutcome::Suspended);

    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.status, MonitorStatus::Suspended);
    assert_eq!(t.consecutive_failures, 5);
    let sent = r.sink.delivered();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.kind, NotificationKind::MonitorDegraded);

    // suspended monitors are not checked until reactivated
    make_due(&r, id).await;
    assert_eq!(r.sched.run_check(id).await.unwrap(), CheckOutcome::Skipped);
    assert_eq!(r.sink.delivered().len(), 1);

    r.engine.set_result(Ok(primary_payload(&[(3200.0, "a1")])));
    let t = r.sched.reactivate_monitor(&user(), id).await.unwrap();
    assert_eq!(t.status, MonitorStatus::Active);
    assert_eq!(t.consecutive_failures, 0);
    assert!(matches!(
        r.sched.run_check(id).await.unwrap(),
        CheckOutcome::Checked { .. }
    ));
}

#[tokio::test]
async fn success_resets_the_failure_counter() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    r.engine.set_result(Err(SourceError::Timeout(100)));
    for _ in 0..3 {
        make_due(&r, id).await;
        r.sched.run_check(id).await.unwrap();
    }
    r.engine.set_result(Ok(primary_payload(&[(3200.0, "a1")])));
    make_due(&r, id).await;
    r.sched.run_check(id).await.unwrap();

    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.consecutive_failures, 0);
    assert!(t.last_error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_check_in_flight_per_monitor() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    r.engine.set_delay(Duration::from_millis(200));

    let (x, y) = tokio::join!(r.sched.run_check(id), r.sched.run_check(id));
    let mut outcomes = vec![x.unwrap(), y.unwrap()];
    outcomes.retain(|o| *o != CheckOutcome::Skipped);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(r.engine.calls(), 1);
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let mut cfg = test_config();
    cfg.lease_ttl = Duration::from_millis(50);
    let r = rig_with(QuotaLimits::default(), cfg);

    let first = r.sched.try_lease(7).unwrap();
    assert!(r.sched.try_lease(7).is_none());
    tokio::time::sleep(Duration::from_millis(80)).await;
    let second = r.sched.try_lease(7).unwrap();
    assert_ne!(first, second);

    // a stale holder cannot release the new lease
    r.sched.release_lease(7, first);
    assert!(r.sched.try_lease(7).is_none());
    r.sched.release_lease(7, second);
    assert!(r.sched.try_lease(7).is_some());
}

#[tokio::test]
async fn active_monitor_cap_is_enforced() {
    let mut limits = QuotaLimits::default();
    limits.set(Tier::Plus, Metric::Monitor, 1);
    let r = rig_with(limits, test_config());

    let id = create(&r, sha_nyc_in(30)).await;
    let err = r
        .sched
        .create_monitor(&user(), sha_nyc_in(31), 3000.0, 3600, email())
        .await
        .unwrap_err();
    assert_eq!(err, MonitorError::QuotaExceeded { active: 1, limit: 1 });

    r.sched.deactivate_monitor(&user(), id).await.unwrap();
    assert!(r
        .sched
        .create_monitor(&user(), sha_nyc_in(31), 3000.0, 3600, email())
        .await
        .is_ok());
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let r = rig();
    let q = sha_nyc_in(30);
    let bad = [
        r.sched.create_monitor(&user(), q.clone(), 0.0, 3600, email()).await,
        r.sched.create_monitor(&user(), q.clone(), 3000.0, 10, email()).await,
        r.sched.create_monitor(&user(), q, 3000.0, 3600, vec![]).await,
    ];
    for res in bad {
        assert!(matches!(res, Err(MonitorError::Invalid(_))));
    }
}

#[tokio::test]
async fn departed_monitor_is_deactivated() {
    let r = rig();
    let yesterday = Utc::now().date_naive().checked_sub_days(Days::new(1)).unwrap();
    let id = create(&r, SearchQuery::one_way("SHA", "NYC", yesterday)).await;

    assert_eq!(r.sched.run_check(id).await.unwrap(), CheckOutcome::Expired);
    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.status, MonitorStatus::Deactivated);
    assert_eq!(r.engine.calls(), 0);
}

#[tokio::test]
async fn delivery_failure_is_recorded_on_the_monitor() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    r.sink
        .fail_with(Some(NotifyError::ChannelUnavailable("smtp down".into())));
    r.engine.set_result(Ok(primary_payload(&[(2800.0, "cheap")])));

    let out = r.sched.run_check(id).await.unwrap();
    assert_eq!(out, CheckOutcome::Checked { price: Some(2800.0), alerted: 0 });
    assert_eq!(r.sink.attempts(), 2);

    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.status, MonitorStatus::Active);
    assert!(t.last_notify_error.as_deref().unwrap_or("").contains("smtp down"));
    let records = r.store.records_for(id).await.unwrap();
    assert_eq!(records[0].status, DeliveryStatus::Failed);
}

#[tokio::test]
async fn tick_runs_due_monitors_on_the_pool() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;

    assert_eq!(r.sched.tick(), 1);
    for _ in 0..100 {
        let t = r.store.get_monitor(id).await.unwrap().unwrap();
        if t.last_check_at.is_some() {
            assert_eq!(r.sched.queued(), 1);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tick did not check the monitor");
}

#[tokio::test]
async fn other_users_cannot_see_a_monitor() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    let stranger = Principal::new("someone-else", Tier::Plus);
    assert_eq!(
        r.sched.get_monitor(&stranger, id).await.unwrap_err(),
        MonitorError::NotFound(id)
    );
    assert!(r.sched.get_monitor(&Principal::admin("ops"), id).await.is_ok());
}

#[tokio::test]
async fn load_requeues_persisted_monitors() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    let mut t = r.store.get_monitor(id).await.unwrap().unwrap();
    t.status = MonitorStatus::Checking;
    r.store.save_monitor(&t).await.unwrap();

    assert_eq!(r.sched.load().await.unwrap(), 1);
    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.status, MonitorStatus::Active);
}

#[tokio::test]
async fn deactivation_during_alert_delivery_sticks() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    r.engine.set_result(Ok(primary_payload(&[(2800.0, "cheap")])));
    r.sink.set_delay(Duration::from_millis(300));

    let sched = r.sched.clone();
    let check = tokio::spawn(async move { sched.run_check(id).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(r.sink.attempts(), 1, "alert should be in delivery");

    let t = r.sched.deactivate_monitor(&user(), id).await.unwrap();
    assert_eq!(t.status, MonitorStatus::Deactivated);

    assert_eq!(check.await.unwrap().unwrap(), CheckOutcome::Skipped);
    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.status, MonitorStatus::Deactivated);
    // only the entry from creation; the check did not requeue
    assert_eq!(r.sched.queued(), 1);
    assert_eq!(r.sink.delivered().len(), 1);

    make_due(&r, id).await;
    assert_eq!(r.sched.run_check(id).await.unwrap(), CheckOutcome::Skipped);
    assert_eq!(r.engine.calls(), 1);
}

#[tokio::test]
async fn undelivered_alert_is_sent_on_the_next_check() {
    let r = rig();
    let id = create(&r, sha_nyc_in(30)).await;
    let mut t = r.store.get_monitor(id).await.unwrap().unwrap();
    t.last_known_price = Some(3500.0);
    r.store.save_monitor(&t).await.unwrap();
    r.engine.set_result(Ok(primary_payload(&[(2800.0, "cheap")])));
    r.sink
        .fail_with(Some(NotifyError::ChannelUnavailable("smtp down".into())));

    let out = r.sched.run_check(id).await.unwrap();
    assert_eq!(out, CheckOutcome::Checked { price: Some(2800.0), alerted: 0 });
    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.last_known_price, Some(3500.0));
    assert!(t.last_alert.is_none());

    r.sink.fail_with(None);
    make_due(&r, id).await;
    let out = r.sched.run_check(id).await.unwrap();
    assert_eq!(out, CheckOutcome::Checked { price: Some(2800.0), alerted: 1 });
    assert_eq!(r.sink.delivered().len(), 1);

    let t = r.store.get_monitor(id).await.unwrap().unwrap();
    assert_eq!(t.last_known_price, Some(2800.0));
    assert!(t.last_alert.is_some());
    assert!(t.last_notify_error.is_none());
    let records = r.store.records_for(id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Sent);
    assert_eq!(records[0].attempts, 2);
}
