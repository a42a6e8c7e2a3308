// tests/quota_concurrency.rs
use std::sync::Arc;

use fare_radar::quota::{Metric, Principal, QuotaEnforcer, QuotaLimits, Tier, Window};
use fare_radar::store::MemoryStore;

fn enforcer(limits: QuotaLimits) -> Arc<QuotaEnforcer> {
    let store = Arc::new(MemoryStore::new());
    Arc::new(QuotaEnforcer::new(store.clone(), store, limits))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_callers_never_exceed_the_limit() {
    let mut limits = QuotaLimits::default();
    limits.set(Tier::Plus, Metric::Search, 25);
    let q = enforcer(limits);

    let mut handles = Vec::new();
    for _ in 0..100 {
        let q = q.clone();
        handles.push(tokio::spawn(async move {
            let p = Principal::new("busy-user", Tier::Plus);
            q.check_and_increment(&p, Metric::Search, Window::Daily)
                .await
                .unwrap()
        }));
    }
    let mut allowed = 0;
    for h in handles {
        if h.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 25);

    let status = q
        .quota_status(&Principal::new("busy-user", Tier::Plus), Metric::Search, Window::Daily)
        .await
        .unwrap();
    assert_eq!(status.used, 25);
    assert_eq!(status.remaining, 0);
    assert!(!status.unlimited);
}

#[tokio::test]
async fn users_and_metrics_are_counted_separately() {
    let mut limits = QuotaLimits::default();
    limits.set(Tier::User, Metric::Search, 1);
    limits.set(Tier::User, Metric::Export, 1);
    let q = enforcer(limits);
    let a = Principal::new("a", Tier::User);
    let b = Principal::new("b", Tier::User);

    assert!(q.check_and_increment(&a, Metric::Search, Window::Daily).await.unwrap());
    assert!(!q.check_and_increment(&a, Metric::Search, Window::Daily).await.unwrap());
    assert!(q.check_and_increment(&a, Metric::Export, Window::Monthly).await.unwrap());
    assert!(q.check_and_increment(&b, Metric::Search, Window::Daily).await.unwrap());
}

#[tokio::test]
async fn unlimited_tier_reports_unlimited_status() {
    let q = enforcer(QuotaLimits::default());
    let status = q
        .quota_status(&Principal::new("m", Tier::Max), Metric::AiSearch, Window::Daily)
        .await
        .unwrap();
    assert!(status.unlimited);
    assert_eq!(status.limit, -1);
    assert_eq!(status.remaining, -1);
}
