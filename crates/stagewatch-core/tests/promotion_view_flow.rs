use std::sync::Arc;

use chrono::{TimeZone, Utc};
use stagewatch_core::{
    CloseReason, Config, LocalService, PromotionsView, ReconcilerState, ScopeKey, ViewState,
};
use stagewatch_events::Bus;
use stagewatch_protocol::{Promotion, WatchPromotionEvent};
use stagewatch_topics as topics;
use tokio::time::{timeout, Duration};

fn promo(stage: &str, name: &str, secs: i64) -> Promotion {
    Promotion::new("demo", name)
        .with_stage(stage)
        .with_freight(format!("{name}-0123456789"))
        .with_phase("Running")
        .with_created_at(Utc.timestamp_opt(secs, 0).unwrap())
}

fn row_names(state: &ViewState) -> Vec<String> {
    match state {
        ViewState::Ready { rows, .. } => rows
            .iter()
            .map(|r| r.promotion.metadata.name.clone())
            .collect(),
        other => panic!("expected ready view, got {other:?}"),
    }
}

fn drain_kinds(rx: &mut tokio::sync::broadcast::Receiver<stagewatch_events::Envelope>) -> Vec<String> {
    let mut kinds = Vec::new();
    while let Ok(env) = rx.try_recv() {
        kinds.push(env.kind);
    }
    kinds
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_stream_error_and_reopen() {
    let svc = LocalService::with_channel_capacity(4);
    svc.seed_promotions([promo("prod", "p1", 10), promo("prod", "p2", 20)]);
    let bus = Bus::new(256);
    let mut events = bus.subscribe();
    let mut view = PromotionsView::new(Arc::new(svc.clone()), bus.clone(), &Config::default());
    let scope = ScopeKey::new("demo", Some("prod"));

    let state = view.open(scope.clone()).await.expect("open");
    assert_eq!(state, ReconcilerState::Streaming);
    assert_eq!(row_names(&view.state()), vec!["p2", "p1"]);

    for i in 0..20 {
        svc.emit(WatchPromotionEvent::upsert(promo("prod", &format!("n{i:02}"), 100 + i)))
            .await;
    }
    svc.emit(WatchPromotionEvent::deleted(promo("prod", "p1", 10)))
        .await;
    svc.fail_watchers("connection reset").await;

    let reason = timeout(Duration::from_secs(5), view.join())
        .await
        .expect("reconciler stops");
    assert!(matches!(reason, Some(CloseReason::StreamError(msg)) if msg.contains("connection reset")));

    // last published collection stays readable after the stream is gone
    let names = row_names(&view.state());
    assert_eq!(names.len(), 21);
    assert_eq!(names[0], "n19");
    assert!(!names.iter().any(|n| n == "p1"));

    let kinds = drain_kinds(&mut events);
    assert!(kinds.contains(&topics::TOPIC_PROMOTIONS_LIST_LOADED.to_string()));
    assert!(kinds.contains(&topics::TOPIC_PROMOTIONS_WATCH_CLOSED.to_string()));
    assert_eq!(
        kinds
            .iter()
            .filter(|k| *k == topics::TOPIC_PROMOTIONS_LIST_PATCHED)
            .count(),
        22
    );

    // no reconnect on its own; opening again restarts from a fresh snapshot
    assert!(view.reconciler_state().expect("state").is_closed());
    assert_eq!(svc.watcher_count(), 0);
    view.open(scope).await.expect("reopen");
    assert_eq!(svc.watcher_count(), 1);
    assert_eq!(row_names(&view.state()).len(), 21);
    view.close().await;
    assert_eq!(svc.watcher_count(), 0);
}

#[tokio::test]
async fn switching_stage_isolates_collections() {
    let svc = LocalService::new();
    svc.seed_promotions([promo("prod", "p1", 1), promo("uat", "u1", 2)]);
    let mut view = PromotionsView::new(Arc::new(svc.clone()), Bus::default(), &Config::default());

    view.open(ScopeKey::new("demo", Some("prod"))).await.expect("open prod");
    assert_eq!(row_names(&view.state()), vec!["p1"]);
    assert!(view.hover_freight(&promo("prod", "p1", 1)));

    view.open(ScopeKey::new("demo", Some("uat"))).await.expect("open uat");
    assert_eq!(svc.watcher_count(), 1);
    assert_eq!(view.freight().view().key, None);

    let before = view.version();
    svc.emit(WatchPromotionEvent::upsert(promo("prod", "p2", 3))).await;
    svc.emit(WatchPromotionEvent::upsert(promo("uat", "u2", 4))).await;
    let after = view.wait_for_version(before, Duration::from_secs(2)).await;
    assert_eq!(after, before + 1);
    assert_eq!(row_names(&view.state()), vec!["u2", "u1"]);
    view.close().await;
}

#[tokio::test]
async fn retry_leaves_the_list_to_the_stream() {
    let svc = LocalService::new();
    let failed = promo("prod", "p1", 1).with_phase("Failed");
    svc.seed_promotions([failed.clone()]);
    let mut view = PromotionsView::new(Arc::new(svc.clone()), Bus::default(), &Config::default());
    view.open(ScopeKey::new("demo", Some("prod"))).await.expect("open");
    let version = view.version();

    view.retry(&failed).await.expect("retry accepted");
    assert_eq!(view.version(), version);
    assert_eq!(svc.retry_requests().len(), 1);

    svc.emit(WatchPromotionEvent::upsert(failed.clone().with_phase("Running")))
        .await;
    view.wait_for_version(version, Duration::from_secs(2)).await;
    match view.state() {
        ViewState::Ready { rows, .. } => {
            assert_eq!(rows.len(), 1);
            assert!(!rows[0].retryable);
        }
        other => panic!("expected ready view, got {other:?}"),
    }
    view.close().await;
}
