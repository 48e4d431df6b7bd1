//! Live reconciliation of a promotion snapshot with its watch stream.
//!
//! One [`LiveReconciler`] owns the state machine for one scope:
//! `Idle → Subscribing → Streaming → Closed`. The snapshot is loaded before
//! the subscription opens, events are applied one at a time in arrival order
//! by a dedicated task, and every step republishes the full collection to the
//! shared cache under the scope's query key. There is no reconnect: once
//! closed, a consumer restarts the machine by attaching again.

mod collection;
mod registry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use stagewatch_events::Bus;
use stagewatch_protocol::{ListPromotionsRequest, ListPromotionsResponse, Promotion};
use stagewatch_topics as topics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::query_cache::{PromotionListCache, QueryKey};
use crate::transport::{PromotionService, WatchStream};

pub use collection::{apply_event, Applied};
pub use registry::ReconcilerRegistry;

/// `(project, stage?)`: the snapshot query, the subscription, and the cache
/// key are all derived from this one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ScopeKey {
    pub fn new(project: impl Into<String>, stage: Option<&str>) -> Self {
        Self {
            project: project.into(),
            stage: stage.map(str::to_string),
        }
    }

    pub fn list_request(&self) -> ListPromotionsRequest {
        ListPromotionsRequest {
            project: self.project.clone(),
            stage: self.stage.clone(),
        }
    }

    pub fn query_key(&self) -> QueryKey {
        QueryKey::list_promotions(self.list_request())
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "{}/{}", self.project, stage),
            None => write!(f, "{}/*", self.project),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    Cancelled,
    RemoteClosed,
    StreamError(String),
    SubscribeFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconcilerState {
    Idle,
    Subscribing,
    Streaming,
    Closed { reason: CloseReason },
}

impl ReconcilerState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReconcilerState::Closed { .. })
    }
}

/// Shared between the handle and its stream task.
#[derive(Clone)]
struct Context {
    scope: ScopeKey,
    key: QueryKey,
    cache: Arc<PromotionListCache>,
    bus: Bus,
    state: Arc<watch::Sender<ReconcilerState>>,
    cancel: CancellationToken,
}

impl Context {
    fn transition(&self, next: ReconcilerState) {
        let prev = self.state.send_replace(next.clone());
        if prev != next {
            debug!(scope = %self.scope, from = ?prev, to = ?next, "reconciler transition");
            self.bus.publish(
                topics::TOPIC_PROMOTIONS_WATCH_STATE,
                &json!({"scope": &self.scope, "state": &next}),
            );
        }
    }

    /// Write the collection unless cancellation has been observed; the token is
    /// checked under the cache lock, so no write lands after `cancel()` returns.
    fn publish(&self, promotions: &[Promotion]) -> Option<u64> {
        let version = self.cache.set_if(
            &self.key,
            ListPromotionsResponse {
                promotions: promotions.to_vec(),
            },
            || !self.cancel.is_cancelled(),
        )?;
        self.bus.publish(
            topics::TOPIC_PROMOTIONS_LIST_PATCHED,
            &json!({"scope": &self.scope, "version": version, "count": promotions.len()}),
        );
        Some(version)
    }
}

/// State machine instance for one scope.
pub struct LiveReconciler {
    ctx: Context,
    service: Arc<dyn PromotionService>,
    cancel: CancellationToken,
    task: Option<JoinHandle<CloseReason>>,
}

impl LiveReconciler {
    pub fn new(
        scope: ScopeKey,
        service: Arc<dyn PromotionService>,
        cache: Arc<PromotionListCache>,
        bus: Bus,
    ) -> Self {
        let (state, _rx) = watch::channel(ReconcilerState::Idle);
        let cancel = CancellationToken::new();
        Self {
            ctx: Context {
                key: scope.query_key(),
                scope,
                cache,
                bus,
                state: Arc::new(state),
                cancel: cancel.clone(),
            },
            service,
            cancel,
            task: None,
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.ctx.scope
    }

    pub fn state(&self) -> ReconcilerState {
        self.ctx.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReconcilerState> {
        self.ctx.state.subscribe()
    }

    /// Token that stops this reconciler when cancelled from anywhere.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load the snapshot, publish it, then open the subscription and hand the
    /// stream to a dedicated task.
    ///
    /// A failed snapshot leaves the machine `Idle` so the caller may try again.
    pub async fn start(&mut self) -> Result<(), ReconcileError> {
        if self.state() != ReconcilerState::Idle || self.task.is_some() {
            return Err(ReconcileError::AlreadyStarted(self.ctx.scope.clone()));
        }
        let scope = self.ctx.scope.clone();
        let req = self.ctx.scope.list_request();

        let snapshot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.ctx.transition(ReconcilerState::Closed { reason: CloseReason::Cancelled });
                return Ok(());
            }
            res = self.service.list_promotions(&req) => res,
        };
        let snapshot = snapshot.map_err(|source| {
            warn!(%scope, error = %source, "promotion snapshot failed");
            ReconcileError::Snapshot {
                scope: scope.clone(),
                source,
            }
        })?;
        let promotions = snapshot.promotions;
        let Some(version) = self.ctx.publish(&promotions) else {
            self.ctx.transition(ReconcilerState::Closed { reason: CloseReason::Cancelled });
            return Ok(());
        };
        self.ctx.bus.publish(
            topics::TOPIC_PROMOTIONS_LIST_LOADED,
            &json!({"scope": &scope, "version": version, "count": promotions.len()}),
        );
        info!(%scope, count = promotions.len(), "promotion snapshot loaded");

        self.ctx.transition(ReconcilerState::Subscribing);
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.ctx.transition(ReconcilerState::Closed { reason: CloseReason::Cancelled });
                return Ok(());
            }
            res = self.service.watch_promotions(&req, self.cancel.child_token()) => res,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(source) => {
                warn!(%scope, error = %source, "promotion watch failed to open");
                self.ctx.transition(ReconcilerState::Closed {
                    reason: CloseReason::SubscribeFailed(source.to_string()),
                });
                return Err(ReconcileError::Subscribe { scope, source });
            }
        };

        self.ctx.transition(ReconcilerState::Streaming);
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(stream_loop(ctx, promotions, stream, cancel)));
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the stream task to exit. Once this returns no
    /// further event can reach the cache for this scope.
    pub async fn shutdown(&mut self) -> Option<CloseReason> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the stream task to finish on its own (remote close or error).
    pub async fn join(&mut self) -> Option<CloseReason> {
        let Some(task) = self.task.take() else {
            if !self.state().is_closed() && self.cancel.is_cancelled() {
                self.ctx.transition(ReconcilerState::Closed {
                    reason: CloseReason::Cancelled,
                });
            }
            return match self.state() {
                ReconcilerState::Closed { reason } => Some(reason),
                _ => None,
            };
        };
        match task.await {
            Ok(reason) => Some(reason),
            Err(err) => {
                warn!(scope = %self.ctx.scope, %err, "reconciler task aborted");
                let reason = CloseReason::StreamError(err.to_string());
                self.ctx.transition(ReconcilerState::Closed {
                    reason: reason.clone(),
                });
                Some(reason)
            }
        }
    }
}

impl Drop for LiveReconciler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn stream_loop(
    ctx: Context,
    mut promotions: Vec<Promotion>,
    mut stream: WatchStream,
    cancel: CancellationToken,
) -> CloseReason {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break CloseReason::Cancelled,
            next = stream.recv() => next,
        };
        match next {
            Some(Ok(event)) => {
                if cancel.is_cancelled() {
                    break CloseReason::Cancelled;
                }
                let applied = apply_event(&mut promotions, event);
                let Some(version) = ctx.publish(&promotions) else {
                    break CloseReason::Cancelled;
                };
                debug!(scope = %ctx.scope, ?applied, version, "applied promotion event");
            }
            Some(Err(err)) => {
                warn!(scope = %ctx.scope, error = %err, "promotion watch terminated");
                break CloseReason::StreamError(err.to_string());
            }
            None => {
                info!(scope = %ctx.scope, "promotion watch closed by remote");
                break CloseReason::RemoteClosed;
            }
        }
    };
    drop(stream);
    ctx.transition(ReconcilerState::Closed {
        reason: reason.clone(),
    });
    ctx.bus.publish(
        topics::TOPIC_PROMOTIONS_WATCH_CLOSED,
        &json!({"scope": &ctx.scope, "reason": &reason}),
    );
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::test_support::{names, promo};
    use crate::transport::{LocalService, WatchSender};
    use stagewatch_protocol::{Freight, GetFreightRequest, PromoteToStageRequest, WatchPromotionEvent};
    use std::time::Duration;

    fn scope() -> ScopeKey {
        ScopeKey::new("demo", Some("prod"))
    }

    fn setup(svc: &LocalService) -> (LiveReconciler, Arc<PromotionListCache>) {
        let cache = Arc::new(PromotionListCache::new());
        let reconciler = LiveReconciler::new(
            scope(),
            Arc::new(svc.clone()),
            Arc::clone(&cache),
            Bus::new(64),
        );
        (reconciler, cache)
    }

    fn cached_names(cache: &PromotionListCache) -> Vec<String> {
        cache
            .get(&scope().query_key())
            .map(|r| {
                r.promotions
                    .iter()
                    .map(|p| p.metadata.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Service whose watch stream is fed directly by the test.
    struct ManualWatch {
        snapshot: Vec<Promotion>,
        sender: parking_lot::Mutex<Option<WatchSender>>,
    }

    #[async_trait::async_trait]
    impl PromotionService for ManualWatch {
        async fn list_promotions(
            &self,
            _req: &ListPromotionsRequest,
        ) -> Result<ListPromotionsResponse, ServiceError> {
            Ok(ListPromotionsResponse {
                promotions: self.snapshot.clone(),
            })
        }

        async fn watch_promotions(
            &self,
            _req: &ListPromotionsRequest,
            _cancel: CancellationToken,
        ) -> Result<WatchStream, ServiceError> {
            let (tx, stream) = WatchStream::channel(16);
            *self.sender.lock() = Some(tx);
            Ok(stream)
        }

        async fn get_freight(&self, req: &GetFreightRequest) -> Result<Freight, ServiceError> {
            Err(ServiceError::NotFound(req.name.clone()))
        }

        async fn promote_to_stage(&self, _req: &PromoteToStageRequest) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn snapshot_is_published_before_streaming() {
        let svc = LocalService::new();
        svc.seed_promotions([promo("a", 1), promo("b", 2)]);
        let (mut rec, cache) = setup(&svc);
        let mut states = rec.subscribe_state();
        assert_eq!(rec.state(), ReconcilerState::Idle);

        rec.start().await.expect("start");
        assert_eq!(rec.state(), ReconcilerState::Streaming);
        assert_eq!(cached_names(&cache), vec!["a", "b"]);
        assert_eq!(cache.version(&scope().query_key()), 1);
        assert!(states.has_changed().unwrap_or(false));
        assert_eq!(*states.borrow_and_update(), ReconcilerState::Streaming);
        assert_eq!(svc.watcher_count(), 1);

        rec.shutdown().await;
    }

    #[tokio::test]
    async fn events_patch_the_cache_in_arrival_order() {
        let svc = LocalService::new();
        svc.seed_promotions([promo("a", 1), promo("b", 2), promo("c", 3)]);
        let (mut rec, cache) = setup(&svc);
        rec.start().await.expect("start");
        let key = scope().query_key();

        svc.emit(WatchPromotionEvent::upsert(promo("b", 2).with_phase("Succeeded")))
            .await;
        svc.emit(WatchPromotionEvent::deleted(promo("a", 1))).await;
        svc.emit(WatchPromotionEvent::upsert(promo("d", 4))).await;
        svc.emit(WatchPromotionEvent::deleted(promo("zz", 9))).await;
        svc.close_watchers();

        assert_eq!(rec.join().await, Some(CloseReason::RemoteClosed));
        assert_eq!(cached_names(&cache), vec!["b", "c", "d"]);
        assert_eq!(cache.version(&key), 5);
        let b = &cache.get(&key).unwrap().promotions[0];
        assert_eq!(b.status.as_ref().unwrap().phase, "Succeeded");
        assert_eq!(
            rec.state(),
            ReconcilerState::Closed {
                reason: CloseReason::RemoteClosed
            }
        );
    }

    #[tokio::test]
    async fn upsert_before_sort_keeps_position() {
        let svc = LocalService::new();
        svc.seed_promotions([promo("a", 1), promo("b", 2), promo("c", 3)]);
        let (mut rec, cache) = setup(&svc);
        rec.start().await.expect("start");
        svc.emit(WatchPromotionEvent::upsert(promo("b", 2).with_message("b'")))
            .await;
        svc.close_watchers();
        rec.join().await;
        let list = cache.get(&scope().query_key()).unwrap();
        assert_eq!(names(&list.promotions), vec!["a", "b", "c"]);
        assert_eq!(
            list.promotions[1].status.as_ref().unwrap().message.as_deref(),
            Some("b'")
        );
    }

    #[tokio::test]
    async fn snapshot_failure_leaves_machine_idle() {
        let svc = LocalService::new();
        svc.fail_list_with(Some(ServiceError::Unavailable("down".into())));
        let (mut rec, cache) = setup(&svc);
        let err = rec.start().await.expect_err("snapshot must fail");
        assert!(matches!(err, ReconcileError::Snapshot { .. }));
        assert_eq!(rec.state(), ReconcilerState::Idle);
        assert!(cache.get(&scope().query_key()).is_none());
        assert_eq!(svc.watcher_count(), 0);

        svc.fail_list_with(None);
        rec.start().await.expect("second attempt");
        assert_eq!(rec.state(), ReconcilerState::Streaming);
        rec.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_failure_closes() {
        let svc = LocalService::new();
        svc.fail_watch_with(Some(ServiceError::Unavailable("no stream".into())));
        let (mut rec, cache) = setup(&svc);
        let err = rec.start().await.expect_err("subscribe must fail");
        assert!(matches!(err, ReconcileError::Subscribe { .. }));
        assert!(rec.state().is_closed());
        // the snapshot itself is still visible
        assert!(cache.get(&scope().query_key()).is_some());
        assert!(matches!(
            rec.start().await,
            Err(ReconcileError::AlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn stream_error_terminates_without_reconnect() {
        let svc = LocalService::new();
        let (mut rec, _cache) = setup(&svc);
        rec.start().await.expect("start");
        svc.fail_watchers("connection reset").await;
        let reason = rec.join().await.expect("closed");
        assert!(matches!(reason, CloseReason::StreamError(ref m) if m.contains("connection reset")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(svc.watcher_count(), 0);
    }

    #[tokio::test]
    async fn late_events_after_cancel_are_discarded() {
        let svc = Arc::new(ManualWatch {
            snapshot: vec![promo("a", 1), promo("b", 2), promo("c", 3)],
            sender: parking_lot::Mutex::new(None),
        });
        let cache = Arc::new(PromotionListCache::new());
        let mut rec = LiveReconciler::new(scope(), svc.clone(), Arc::clone(&cache), Bus::new(8));
        rec.start().await.expect("start");
        let tx = svc.sender.lock().clone().expect("subscribed");
        let key = scope().query_key();
        let before = cache.get_versioned(&key).expect("snapshot");

        // queued before cancellation, but not yet consumed by the task
        tx.send(Ok(WatchPromotionEvent::deleted(promo("a", 1))))
            .await
            .unwrap();
        rec.cancel();
        assert_eq!(rec.join().await, Some(CloseReason::Cancelled));

        // arrives after teardown
        let _ = tx.send(Ok(WatchPromotionEvent::upsert(promo("z", 9)))).await;
        tokio::task::yield_now().await;

        let after = cache.get_versioned(&key).expect("snapshot");
        assert_eq!(after.1, before.1);
        assert_eq!(names(&after.0.promotions), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn no_publish_once_the_token_is_cancelled() {
        let svc = LocalService::new();
        svc.seed_promotions([promo("a", 1)]);
        let (mut rec, cache) = setup(&svc);
        rec.start().await.expect("start");
        let key = scope().query_key();
        assert_eq!(cache.version(&key), 1);

        // the external token fires while the task still holds a patched list
        rec.cancellation().cancel();
        assert_eq!(rec.ctx.publish(&[promo("a", 1), promo("late", 9)]), None);
        assert_eq!(cache.version(&key), 1);
        assert_eq!(cached_names(&cache), vec!["a"]);
        assert_eq!(rec.join().await, Some(CloseReason::Cancelled));
    }

    #[tokio::test]
    async fn cancel_during_snapshot_closes_without_subscribing() {
        let svc = LocalService::new();
        let (mut rec, cache) = setup(&svc);
        rec.cancel();
        rec.start().await.expect("cancelled start is not an error");
        assert_eq!(
            rec.state(),
            ReconcilerState::Closed {
                reason: CloseReason::Cancelled
            }
        );
        assert!(cache.is_empty());
        assert_eq!(svc.watcher_count(), 0);
    }

    #[test]
    fn scope_key_derives_matching_request_and_cache_key() {
        let scope = ScopeKey::new("demo", None);
        assert_eq!(scope.to_string(), "demo/*");
        assert_eq!(scope.query_key().input, scope.list_request());
        assert_eq!(ScopeKey::new("demo", Some("prod")).to_string(), "demo/prod");
    }
}
