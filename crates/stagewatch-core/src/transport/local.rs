use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use stagewatch_protocol::{
    Freight, GetFreightRequest, ListPromotionsRequest, ListPromotionsResponse,
    PromoteToStageRequest, Promotion, WatchPromotionEvent,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{PromotionService, WatchSender, WatchStream};
use crate::error::ServiceError;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// In-memory promotion service for single-process runs and tests.
#[derive(Clone)]
pub struct LocalService {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    promotions: Mutex<Vec<Promotion>>,
    freight: Mutex<HashMap<(String, String), Freight>>,
    watchers: Mutex<Vec<Watcher>>,
    retries: Mutex<Vec<PromoteToStageRequest>>,
    faults: Mutex<Faults>,
    channel_capacity: usize,
}

struct Watcher {
    scope: ListPromotionsRequest,
    tx: WatchSender,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Faults {
    list: Option<ServiceError>,
    watch: Option<ServiceError>,
    retry: Option<ServiceError>,
}

fn in_scope(scope: &ListPromotionsRequest, promotion: &Promotion) -> bool {
    promotion.metadata.namespace == scope.project
        && scope
            .stage
            .as_deref()
            .is_none_or(|stage| promotion.spec.stage == stage)
}

fn with_uid(mut promotion: Promotion) -> Promotion {
    if promotion.metadata.uid.is_none() {
        promotion.metadata.uid = Some(Uuid::new_v4().to_string());
    }
    promotion
}

impl LocalService {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                promotions: Mutex::new(Vec::new()),
                freight: Mutex::new(HashMap::new()),
                watchers: Mutex::new(Vec::new()),
                retries: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                channel_capacity: capacity.max(1),
            }),
        }
    }

    pub fn seed_promotions(&self, promotions: impl IntoIterator<Item = Promotion>) {
        let mut store = self.inner.promotions.lock();
        for p in promotions {
            let p = with_uid(p);
            match store.iter().position(|existing| existing.same_identity(&p)) {
                Some(i) => store[i] = p,
                None => store.push(p),
            }
        }
    }

    pub fn insert_freight(&self, freight: Freight) {
        let key = (
            freight.metadata.namespace.clone(),
            freight.metadata.name.clone(),
        );
        self.inner.freight.lock().insert(key, freight);
    }

    /// Apply `event` to the backing store and fan it out, in order, to every
    /// live watcher whose scope covers it. Returns the number of deliveries.
    pub async fn emit(&self, mut event: WatchPromotionEvent) -> usize {
        event.promotion = with_uid(event.promotion);
        {
            let mut store = self.inner.promotions.lock();
            let index = store.iter().position(|p| p.same_identity(&event.promotion));
            match (event.is_delete(), index) {
                (true, Some(i)) => {
                    store.remove(i);
                }
                (true, None) => {}
                (false, Some(i)) => store[i] = event.promotion.clone(),
                (false, None) => store.push(event.promotion.clone()),
            }
        }
        let targets: Vec<WatchSender> = {
            let mut watchers = self.inner.watchers.lock();
            watchers.retain(|w| !w.cancel.is_cancelled() && !w.tx.is_closed());
            watchers
                .iter()
                .filter(|w| in_scope(&w.scope, &event.promotion))
                .map(|w| w.tx.clone())
                .collect()
        };
        let mut delivered = 0;
        for tx in targets {
            if tx.send(Ok(event.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Terminate every open subscription with an error item.
    pub async fn fail_watchers(&self, message: &str) {
        let targets: Vec<WatchSender> = {
            let mut watchers = self.inner.watchers.lock();
            watchers.drain(..).map(|w| w.tx).collect()
        };
        for tx in targets {
            let _ = tx.send(Err(ServiceError::Stream(message.to_string()))).await;
        }
    }

    /// Close every open subscription from the remote side.
    pub fn close_watchers(&self) {
        self.inner.watchers.lock().clear();
    }

    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.inner.watchers.lock();
        watchers.retain(|w| !w.cancel.is_cancelled() && !w.tx.is_closed());
        watchers.len()
    }

    pub fn fail_list_with(&self, err: Option<ServiceError>) {
        self.inner.faults.lock().list = err;
    }

    pub fn fail_watch_with(&self, err: Option<ServiceError>) {
        self.inner.faults.lock().watch = err;
    }

    pub fn fail_retry_with(&self, err: Option<ServiceError>) {
        self.inner.faults.lock().retry = err;
    }

    /// Retry requests received so far, oldest first.
    pub fn retry_requests(&self) -> Vec<PromoteToStageRequest> {
        self.inner.retries.lock().clone()
    }
}

impl Default for LocalService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PromotionService for LocalService {
    async fn list_promotions(
        &self,
        req: &ListPromotionsRequest,
    ) -> Result<ListPromotionsResponse, ServiceError> {
        if let Some(err) = self.inner.faults.lock().list.clone() {
            return Err(err);
        }
        let promotions = self
            .inner
            .promotions
            .lock()
            .iter()
            .filter(|p| in_scope(req, p))
            .cloned()
            .collect();
        Ok(ListPromotionsResponse { promotions })
    }

    async fn watch_promotions(
        &self,
        req: &ListPromotionsRequest,
        cancel: CancellationToken,
    ) -> Result<WatchStream, ServiceError> {
        if let Some(err) = self.inner.faults.lock().watch.clone() {
            return Err(err);
        }
        let (tx, stream) = WatchStream::channel(self.inner.channel_capacity);
        self.inner.watchers.lock().push(Watcher {
            scope: req.clone(),
            tx,
            cancel,
        });
        Ok(stream)
    }

    async fn get_freight(&self, req: &GetFreightRequest) -> Result<Freight, ServiceError> {
        self.inner
            .freight
            .lock()
            .get(&(req.project.clone(), req.name.clone()))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("freight {}/{}", req.project, req.name)))
    }

    async fn promote_to_stage(&self, req: &PromoteToStageRequest) -> Result<(), ServiceError> {
        if let Some(err) = self.inner.faults.lock().retry.clone() {
            return Err(err);
        }
        self.inner.retries.lock().push(req.clone());
        Ok(())
    }
}
