//! Render-ready rows assembled from the reconciled list. No I/O happens here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stagewatch_protocol::Promotion;

use crate::freight::{FreightState, FreightView};
use crate::ordering::sorted_promotions;
use crate::status::{self, PromotionPhase};

pub const DEFAULT_FREIGHT_SHORT_LEN: usize = 7;

/// What a deep-link renderer gets to look at for one row.
#[derive(Debug, Clone, Copy)]
pub struct DeepLinkContext<'a> {
    pub promotion: &'a Promotion,
    pub is_latest_promotion: bool,
    pub argocd_shard_url: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeepLink {
    pub label: String,
    pub url: String,
}

/// Late-bound contribution of links to a promotion row.
pub trait DeepLinkRenderer: Send + Sync {
    fn should_render(&self, ctx: &DeepLinkContext<'_>) -> bool;
    fn render(&self, ctx: &DeepLinkContext<'_>) -> DeepLink;
}

#[derive(Clone, Default)]
pub struct DeepLinkRegistry {
    renderers: Vec<Arc<dyn DeepLinkRenderer>>,
}

impl DeepLinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, renderer: Arc<dyn DeepLinkRenderer>) {
        self.renderers.push(renderer);
    }

    pub fn len(&self) -> usize {
        self.renderers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renderers.is_empty()
    }

    /// Links from every renderer that accepts `ctx`, in registration order.
    pub fn resolve(&self, ctx: &DeepLinkContext<'_>) -> Vec<DeepLink> {
        self.renderers
            .iter()
            .filter(|r| r.should_render(ctx))
            .map(|r| r.render(ctx))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FreightCell {
    /// The row's freight is not the active lookup.
    Inactive,
    Loading,
    Ready { alias: Option<String> },
    Unavailable,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectionOptions {
    pub freight_short_len: usize,
    pub argocd_shard_url: Option<String>,
    /// A retry is in flight somewhere; no row may offer another one.
    pub retry_pending: bool,
}

impl ProjectionOptions {
    pub fn new() -> Self {
        Self {
            freight_short_len: DEFAULT_FREIGHT_SHORT_LEN,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionRow {
    /// Stable row key: the uid, or empty when the record has none.
    pub key: String,
    /// Display copy; the abort overlay may replace its status message.
    pub promotion: Promotion,
    pub phase: PromotionPhase,
    pub terminal: bool,
    pub retryable: bool,
    pub can_retry: bool,
    pub abort_pending: bool,
    pub created_by: String,
    pub created_at: Option<DateTime<Utc>>,
    pub freight_short: String,
    pub freight: FreightCell,
    pub is_latest: bool,
    pub deep_links: Vec<DeepLink>,
}

fn freight_cell(view: &FreightView, promotion: &Promotion) -> FreightCell {
    match view.state_for(&promotion.metadata.namespace, &promotion.spec.freight) {
        None | Some(FreightState::Idle) => FreightCell::Inactive,
        Some(FreightState::Loading) => FreightCell::Loading,
        Some(FreightState::Ready(freight)) => FreightCell::Ready {
            alias: freight.alias.clone(),
        },
        Some(FreightState::Unavailable) => FreightCell::Unavailable,
    }
}

pub fn compose_rows(
    promotions: &[Promotion],
    freight: &FreightView,
    links: &DeepLinkRegistry,
    options: &ProjectionOptions,
) -> Vec<PromotionRow> {
    sorted_promotions(promotions)
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let flags = status::classify(&record);
            let is_latest = index == 0;
            let deep_links = links.resolve(&DeepLinkContext {
                promotion: &record,
                is_latest_promotion: is_latest,
                argocd_shard_url: options.argocd_shard_url.as_deref(),
            });
            let freight_short = record
                .spec
                .freight
                .chars()
                .take(options.freight_short_len)
                .collect();
            let mut display = record.clone();
            display.status = status::display_status(&record);
            PromotionRow {
                key: record.metadata.uid.clone().unwrap_or_default(),
                phase: flags.phase,
                terminal: flags.terminal,
                retryable: flags.retryable,
                can_retry: flags.retryable && !options.retry_pending,
                abort_pending: flags.abort_pending,
                created_by: status::created_by(&record),
                created_at: record.metadata.creation_timestamp,
                freight: freight_cell(freight, &record),
                freight_short,
                is_latest,
                deep_links,
                promotion: display,
            }
        })
        .collect()
}
