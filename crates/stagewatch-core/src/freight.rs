//! Read-through lookup of freight details, driven by hover/open intent.
//!
//! Only one key is of interest at a time. Moving interest to another key
//! supersedes the previous lookup: its task is aborted and, should it still
//! complete, its result is discarded by a generation check. Failures degrade
//! to [`FreightState::Unavailable`] and are not retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use stagewatch_events::Bus;
use stagewatch_protocol::{Freight, GetFreightRequest};
use stagewatch_topics as topics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::PromotionService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreightState {
    Idle,
    Loading,
    Ready(Freight),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreightView {
    pub key: Option<GetFreightRequest>,
    pub state: FreightState,
}

impl Default for FreightView {
    fn default() -> Self {
        Self {
            key: None,
            state: FreightState::Idle,
        }
    }
}

impl FreightView {
    /// State for `name` in `project` when that is the active interest.
    pub fn state_for(&self, project: &str, name: &str) -> Option<&FreightState> {
        match &self.key {
            Some(key) if key.project == project && key.name == name => Some(&self.state),
            _ => None,
        }
    }
}

pub struct FreightLookup {
    service: Arc<dyn PromotionService>,
    bus: Bus,
    view: Arc<watch::Sender<FreightView>>,
    generation: Arc<AtomicU64>,
    inflight: Mutex<Option<JoinHandle<()>>>,
}

impl FreightLookup {
    pub fn new(service: Arc<dyn PromotionService>, bus: Bus) -> Self {
        let (view, _rx) = watch::channel(FreightView::default());
        Self {
            service,
            bus,
            view: Arc::new(view),
            generation: Arc::new(AtomicU64::new(0)),
            inflight: Mutex::new(None),
        }
    }

    pub fn view(&self) -> FreightView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FreightView> {
        self.view.subscribe()
    }

    /// Express interest in `key`. Re-requesting the active key is a no-op; an
    /// empty name is ignored. Returns whether a fetch was started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(&self, key: GetFreightRequest) -> bool {
        if key.name.is_empty() {
            return false;
        }
        // Key check, generation bump, view write and task swap happen under
        // one lock so the last caller owns both the newest generation and the key.
        let mut inflight = self.inflight.lock();
        if self.view.borrow().key.as_ref() == Some(&key) {
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.view.send_replace(FreightView {
            key: Some(key.clone()),
            state: FreightState::Loading,
        });

        let service = Arc::clone(&self.service);
        let bus = self.bus.clone();
        let view = Arc::clone(&self.view);
        let current = Arc::clone(&self.generation);
        let task = tokio::spawn(async move {
            let result = service.get_freight(&key).await;
            let applied = view.send_if_modified(|v| {
                if current.load(Ordering::SeqCst) != generation || v.key.as_ref() != Some(&key) {
                    return false;
                }
                v.state = match &result {
                    Ok(freight) => FreightState::Ready(freight.clone()),
                    Err(_) => FreightState::Unavailable,
                };
                true
            });
            if !applied {
                debug!(project = %key.project, name = %key.name, "discarding stale freight lookup");
                return;
            }
            match result {
                Ok(_) => bus.publish(
                    topics::TOPIC_FREIGHT_LOOKUP_RESOLVED,
                    &json!({"project": key.project, "name": key.name}),
                ),
                Err(err) => {
                    debug!(project = %key.project, name = %key.name, error = %err, "freight lookup failed");
                    bus.publish(
                        topics::TOPIC_FREIGHT_LOOKUP_UNAVAILABLE,
                        &json!({"project": key.project, "name": key.name, "error": err.to_string()}),
                    );
                }
            }
        });
        if let Some(prev) = inflight.replace(task) {
            prev.abort();
        }
        true
    }

    /// Drop the current interest.
    pub fn clear(&self) {
        let mut inflight = self.inflight.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(prev) = inflight.take() {
            prev.abort();
        }
        self.view.send_replace(FreightView::default());
    }
}

impl Drop for FreightLookup {
    fn drop(&mut self) {
        if let Some(task) = self.inflight.get_mut().take() {
            task.abort();
        }
    }
}
