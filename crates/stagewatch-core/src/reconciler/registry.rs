use std::collections::HashMap;
use std::sync::Arc;

use stagewatch_events::Bus;
use tracing::info;

use super::{CloseReason, LiveReconciler, ReconcilerState, ScopeKey};
use crate::error::ReconcileError;
use crate::query_cache::PromotionListCache;
use crate::transport::PromotionService;

/// Arena of reconcilers keyed by scope. Each scope gets its own state machine
/// and its own collection; teardown is explicit and awaited.
pub struct ReconcilerRegistry {
    service: Arc<dyn PromotionService>,
    cache: Arc<PromotionListCache>,
    bus: Bus,
    reconcilers: HashMap<ScopeKey, LiveReconciler>,
}

impl ReconcilerRegistry {
    pub fn new(service: Arc<dyn PromotionService>, cache: Arc<PromotionListCache>, bus: Bus) -> Self {
        Self {
            service,
            cache,
            bus,
            reconcilers: HashMap::new(),
        }
    }

    pub fn cache(&self) -> &Arc<PromotionListCache> {
        &self.cache
    }

    /// Start reconciling `scope` unless it is already live. A closed machine
    /// for the scope is torn down and started again from `Idle`.
    pub async fn attach(&mut self, scope: ScopeKey) -> Result<ReconcilerState, ReconcileError> {
        if let Some(existing) = self.reconcilers.get(&scope) {
            let state = existing.state();
            if !state.is_closed() {
                return Ok(state);
            }
        }
        self.teardown(&scope).await;

        let mut reconciler = LiveReconciler::new(
            scope.clone(),
            Arc::clone(&self.service),
            Arc::clone(&self.cache),
            self.bus.clone(),
        );
        reconciler.start().await?;
        let state = reconciler.state();
        self.reconcilers.insert(scope, reconciler);
        Ok(state)
    }

    /// Cancel and join the reconciler for `scope`, if any, and drop its
    /// cached collection.
    pub async fn detach(&mut self, scope: &ScopeKey) -> Option<CloseReason> {
        let reason = self.teardown(scope).await;
        self.cache.remove(&scope.query_key());
        info!(%scope, ?reason, "reconciler detached");
        reason
    }

    /// Restarts go through here: the cached list stays readable and its
    /// version keeps counting up until the new snapshot replaces it.
    async fn teardown(&mut self, scope: &ScopeKey) -> Option<CloseReason> {
        let mut reconciler = self.reconcilers.remove(scope)?;
        reconciler.shutdown().await
    }

    /// Tear down `from` completely before `to` starts.
    pub async fn switch(
        &mut self,
        from: &ScopeKey,
        to: ScopeKey,
    ) -> Result<ReconcilerState, ReconcileError> {
        if from != &to {
            self.detach(from).await;
        }
        self.attach(to).await
    }

    /// Wait until the reconciler for `scope` stops on its own.
    pub async fn join(&mut self, scope: &ScopeKey) -> Option<CloseReason> {
        self.reconcilers.get_mut(scope)?.join().await
    }

    pub fn state(&self, scope: &ScopeKey) -> Option<ReconcilerState> {
        self.reconcilers.get(scope).map(LiveReconciler::state)
    }

    pub fn scopes(&self) -> Vec<ScopeKey> {
        let mut scopes: Vec<ScopeKey> = self.reconcilers.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    pub async fn shutdown_all(&mut self) {
        for scope in self.scopes() {
            self.detach(&scope).await;
        }
    }
}
