//! Top-level handle a presentation layer holds for one promotion list.
//!
//! Wires the active scope, shared cache, freight lookup and retry gateway
//! together and exposes a single [`ViewState`] to render.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use stagewatch_events::Bus;
use stagewatch_protocol::{GetFreightRequest, PromoteToStageRequest, Promotion};
use tracing::info;

use crate::config::Config;
use crate::error::{ReconcileError, RetryError};
use crate::freight::{FreightLookup, FreightView};
use crate::gateway::RetryGateway;
use crate::projection::{compose_rows, DeepLinkRegistry, ProjectionOptions, PromotionRow};
use crate::query_cache::PromotionListCache;
use crate::reconciler::{CloseReason, ReconcilerRegistry, ReconcilerState, ScopeKey};
use crate::transport::PromotionService;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ViewState {
    Loading,
    Failed {
        message: String,
    },
    Ready {
        rows: Vec<PromotionRow>,
        hide_pagination: bool,
    },
}

pub struct PromotionsView {
    registry: ReconcilerRegistry,
    cache: Arc<PromotionListCache>,
    freight: FreightLookup,
    gateway: RetryGateway,
    links: DeepLinkRegistry,
    config: Config,
    scope: Option<ScopeKey>,
    snapshot_error: Option<String>,
}

impl PromotionsView {
    pub fn new(service: Arc<dyn PromotionService>, bus: Bus, config: &Config) -> Self {
        let cache = Arc::new(PromotionListCache::new());
        Self {
            registry: ReconcilerRegistry::new(Arc::clone(&service), Arc::clone(&cache), bus.clone()),
            freight: FreightLookup::new(Arc::clone(&service), bus.clone()),
            gateway: RetryGateway::new(service, bus),
            cache,
            links: DeepLinkRegistry::new(),
            config: config.clone(),
            scope: None,
            snapshot_error: None,
        }
    }

    pub fn with_deep_links(mut self, links: DeepLinkRegistry) -> Self {
        self.links = links;
        self
    }

    pub fn scope(&self) -> Option<&ScopeKey> {
        self.scope.as_ref()
    }

    pub fn cache(&self) -> &Arc<PromotionListCache> {
        &self.cache
    }

    pub fn freight(&self) -> &FreightLookup {
        &self.freight
    }

    pub fn gateway(&self) -> &RetryGateway {
        &self.gateway
    }

    /// Point the view at `scope`. The previous scope's reconciler is torn
    /// down before the new one loads, and freight interest is dropped.
    pub async fn open(&mut self, scope: ScopeKey) -> Result<ReconcilerState, ReconcileError> {
        if self.scope.as_ref() != Some(&scope) {
            self.freight.clear();
        }
        let result = match self.scope.take() {
            Some(prev) => self.registry.switch(&prev, scope.clone()).await,
            None => self.registry.attach(scope.clone()).await,
        };
        info!(%scope, ok = result.is_ok(), "promotion view opened");
        self.scope = Some(scope);
        self.snapshot_error = match &result {
            Err(ReconcileError::Snapshot { source, .. }) => Some(source.to_string()),
            _ => None,
        };
        result
    }

    pub async fn close(&mut self) {
        if let Some(scope) = self.scope.take() {
            self.registry.detach(&scope).await;
        }
        self.freight.clear();
        self.snapshot_error = None;
    }

    /// Wait for the active scope's stream to end on its own.
    pub async fn join(&mut self) -> Option<CloseReason> {
        let scope = self.scope.clone()?;
        self.registry.join(&scope).await
    }

    pub fn reconciler_state(&self) -> Option<ReconcilerState> {
        self.scope.as_ref().and_then(|s| self.registry.state(s))
    }

    /// Hover/open intent on a row's freight.
    pub fn hover_freight(&self, promotion: &Promotion) -> bool {
        self.freight.request(GetFreightRequest {
            project: promotion.metadata.namespace.clone(),
            name: promotion.spec.freight.clone(),
        })
    }

    pub async fn retry(&self, promotion: &Promotion) -> Result<PromoteToStageRequest, RetryError> {
        let scope = self
            .scope
            .clone()
            .unwrap_or_else(|| ScopeKey::new(promotion.metadata.namespace.clone(), None));
        self.gateway.retry(&scope, promotion).await
    }

    pub fn version(&self) -> u64 {
        self.scope
            .as_ref()
            .map(|s| self.cache.version(&s.query_key()))
            .unwrap_or(0)
    }

    /// Block until the active scope's list moves past `last_seen` or
    /// `max_wait` elapses; returns the version then current.
    pub async fn wait_for_version(&self, last_seen: u64, max_wait: Duration) -> u64 {
        match &self.scope {
            Some(scope) => {
                self.cache
                    .wait_for_change(&scope.query_key(), last_seen, max_wait)
                    .await
            }
            None => 0,
        }
    }

    pub fn state(&self) -> ViewState {
        self.state_with(&self.freight.view())
    }

    fn state_with(&self, freight: &FreightView) -> ViewState {
        if let Some(message) = &self.snapshot_error {
            return ViewState::Failed {
                message: message.clone(),
            };
        }
        let Some(scope) = &self.scope else {
            return ViewState::Loading;
        };
        let Some(list) = self.cache.get(&scope.query_key()) else {
            return ViewState::Loading;
        };
        let options = ProjectionOptions {
            freight_short_len: self.config.view.freight_short_len,
            argocd_shard_url: self.config.view.argocd_shard_url.clone(),
            retry_pending: self.gateway.is_pending(),
        };
        let rows = compose_rows(&list.promotions, freight, &self.links, &options);
        let hide_pagination = rows.len() <= self.config.view.page_size;
        ViewState::Ready {
            rows,
            hide_pagination,
        }
    }
}
