//! Transport seam: the remote promotion service as seen by the engine.

mod local;

use stagewatch_protocol::{
    Freight, GetFreightRequest, ListPromotionsRequest, ListPromotionsResponse,
    PromoteToStageRequest, WatchPromotionEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;

pub use local::LocalService;

pub type WatchItem = Result<WatchPromotionEvent, ServiceError>;
pub type WatchSender = mpsc::Sender<WatchItem>;

/// Receiving half of a watch subscription.
///
/// Items arrive strictly in send order. `None` means the remote side closed
/// the stream; an `Err` item terminates it.
pub struct WatchStream {
    rx: mpsc::Receiver<WatchItem>,
}

impl WatchStream {
    /// Bounded channel; a slow consumer backs pressure up to the sender.
    pub fn channel(capacity: usize) -> (WatchSender, WatchStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, WatchStream { rx })
    }

    pub async fn recv(&mut self) -> Option<WatchItem> {
        self.rx.recv().await
    }
}

/// Remote promotion service.
#[async_trait::async_trait]
pub trait PromotionService: Send + Sync {
    /// Unordered snapshot for a scope.
    async fn list_promotions(
        &self,
        req: &ListPromotionsRequest,
    ) -> Result<ListPromotionsResponse, ServiceError>;
    /// Open a live subscription for the same scope; `cancel` tears it down.
    async fn watch_promotions(
        &self,
        req: &ListPromotionsRequest,
        cancel: CancellationToken,
    ) -> Result<WatchStream, ServiceError>;
    async fn get_freight(&self, req: &GetFreightRequest) -> Result<Freight, ServiceError>;
    /// Ask the controller to promote `freight` to `stage` again.
    async fn promote_to_stage(&self, req: &PromoteToStageRequest) -> Result<(), ServiceError>;
}
