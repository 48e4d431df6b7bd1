//! Retry mutations, guarded by a single in-flight flag for the whole gateway.
//!
//! A successful retry does not touch any local collection; the resulting
//! status change arrives later through the watch stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use stagewatch_events::Bus;
use stagewatch_protocol::{PromoteToStageRequest, Promotion};
use stagewatch_topics as topics;
use tracing::{info, warn};

use crate::error::RetryError;
use crate::reconciler::ScopeKey;
use crate::status;
use crate::transport::PromotionService;

pub struct RetryGateway {
    service: Arc<dyn PromotionService>,
    bus: Bus,
    in_flight: AtomicBool,
}

/// Releases the in-flight flag on drop, whatever the outcome.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RetryGateway {
    pub fn new(service: Arc<dyn PromotionService>, bus: Bus) -> Self {
        Self {
            service,
            bus,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn can_retry(&self, promotion: &Promotion) -> bool {
        !self.is_pending() && status::phase(promotion).is_retryable()
    }

    /// The stage comes from the viewing scope when it has one, otherwise
    /// from the Promotion itself.
    pub fn build_request(
        scope: &ScopeKey,
        promotion: &Promotion,
    ) -> Result<PromoteToStageRequest, RetryError> {
        let name = &promotion.metadata.name;
        let stage = scope
            .stage
            .clone()
            .unwrap_or_else(|| promotion.spec.stage.clone());
        let missing = |field| RetryError::Incomplete {
            name: name.clone(),
            field,
        };
        if stage.is_empty() {
            return Err(missing("stage"));
        }
        if promotion.metadata.namespace.is_empty() {
            return Err(missing("project"));
        }
        if promotion.spec.freight.is_empty() {
            return Err(missing("freight"));
        }
        Ok(PromoteToStageRequest {
            stage,
            project: promotion.metadata.namespace.clone(),
            freight: promotion.spec.freight.clone(),
        })
    }

    /// Submit a retry for `promotion`. Rejected while any other retry is in
    /// flight or when the phase is not a terminal failure.
    pub async fn retry(
        &self,
        scope: &ScopeKey,
        promotion: &Promotion,
    ) -> Result<PromoteToStageRequest, RetryError> {
        let phase = status::phase(promotion);
        if !phase.is_retryable() {
            return Err(RetryError::NotRetryable {
                name: promotion.metadata.name.clone(),
                phase,
            });
        }
        let request = Self::build_request(scope, promotion)?;
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RetryError::InFlight);
        }
        let _guard = InFlight(&self.in_flight);

        match self.service.promote_to_stage(&request).await {
            Ok(()) => {
                info!(
                    promotion = %promotion.metadata.name,
                    stage = %request.stage,
                    freight = %request.freight,
                    "promotion retry submitted"
                );
                self.bus
                    .publish(topics::TOPIC_PROMOTIONS_RETRY_SUBMITTED, &request);
                Ok(request)
            }
            Err(err) => {
                warn!(promotion = %promotion.metadata.name, error = %err, "promotion retry failed");
                self.bus.publish(
                    topics::TOPIC_PROMOTIONS_RETRY_FAILED,
                    &json!({"request": &request, "error": err.to_string()}),
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::status::PromotionPhase;
    use crate::transport::{LocalService, WatchStream};
    use stagewatch_protocol::{
        Freight, GetFreightRequest, ListPromotionsRequest, ListPromotionsResponse,
    };
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    fn failed(name: &str) -> Promotion {
        Promotion::new("demo", name)
            .with_stage("prod")
            .with_freight("abc1234")
            .with_phase("Failed")
    }

    fn scope() -> ScopeKey {
        ScopeKey::new("demo", Some("prod"))
    }

    /// Retry endpoint that parks every call until released.
    struct HeldRetry {
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl PromotionService for HeldRetry {
        async fn list_promotions(
            &self,
            _req: &ListPromotionsRequest,
        ) -> Result<ListPromotionsResponse, ServiceError> {
            Ok(ListPromotionsResponse::default())
        }

        async fn watch_promotions(
            &self,
            _req: &ListPromotionsRequest,
            _cancel: CancellationToken,
        ) -> Result<WatchStream, ServiceError> {
            Err(ServiceError::Unavailable("not watched".into()))
        }

        async fn get_freight(&self, req: &GetFreightRequest) -> Result<Freight, ServiceError> {
            Err(ServiceError::NotFound(req.name.clone()))
        }

        async fn promote_to_stage(&self, _req: &PromoteToStageRequest) -> Result<(), ServiceError> {
            self.entered.notify_one();
            self.release.notified().await;
            Err(ServiceError::Rejected("controller refused".into()))
        }
    }

    #[tokio::test]
    async fn builds_request_from_scope_and_record() {
        let svc = LocalService::new();
        let gw = RetryGateway::new(Arc::new(svc.clone()), Bus::new(8));
        let req = gw.retry(&scope(), &failed("p1")).await.expect("retry");
        assert_eq!(
            req,
            PromoteToStageRequest {
                stage: "prod".into(),
                project: "demo".into(),
                freight: "abc1234".into(),
            }
        );
        assert_eq!(svc.retry_requests(), vec![req]);
        assert!(!gw.is_pending());
    }

    #[tokio::test]
    async fn non_terminal_phases_are_refused() {
        let svc = LocalService::new();
        let gw = RetryGateway::new(Arc::new(svc.clone()), Bus::new(8));
        let running = failed("p1").with_phase("Running");
        let err = gw.retry(&scope(), &running).await.expect_err("refused");
        assert_eq!(
            err,
            RetryError::NotRetryable {
                name: "p1".into(),
                phase: PromotionPhase::Running
            }
        );
        assert!(!gw.can_retry(&running));
        assert!(svc.retry_requests().is_empty());
    }

    #[tokio::test]
    async fn second_retry_is_rejected_while_first_in_flight() {
        let svc = Arc::new(HeldRetry {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let gw = Arc::new(RetryGateway::new(svc.clone(), Bus::new(8)));

        let first_gw = Arc::clone(&gw);
        let first = tokio::spawn(async move { first_gw.retry(&scope(), &failed("p1")).await });
        svc.entered.notified().await;
        assert!(gw.is_pending());

        // a different record is blocked too
        let second = gw.retry(&scope(), &failed("p2")).await;
        assert_eq!(second, Err(RetryError::InFlight));
        assert!(!gw.can_retry(&failed("p2")));

        svc.release.notify_one();
        let first = first.await.expect("join");
        assert!(matches!(first, Err(RetryError::Service(ServiceError::Rejected(_)))));
        // guard released after failure
        assert!(!gw.is_pending());
        assert!(gw.can_retry(&failed("p2")));
    }

    #[test]
    fn missing_fields_are_reported() {
        let no_freight = Promotion::new("demo", "p").with_phase("Failed");
        assert_eq!(
            RetryGateway::build_request(&scope(), &no_freight),
            Err(RetryError::Incomplete {
                name: "p".into(),
                field: "freight"
            })
        );
        let unscoped = ScopeKey::new("demo", None);
        let req = RetryGateway::build_request(&unscoped, &failed("p")).expect("request");
        assert_eq!(req.stage, "prod");
    }
}
