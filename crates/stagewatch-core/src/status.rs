//! Lifecycle classification derived from a Promotion's raw status.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use stagewatch_protocol::{
    AbortAction, AbortPromotionRequest, Promotion, PromotionStatus, ANNOTATION_CREATE_ACTOR,
};

/// Display-only message shown while an abort request waits on the controller.
pub const ABORT_PENDING_MESSAGE: &str = "Promotion Abort Request is in Queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum PromotionPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Errored,
    Aborted,
    Unknown,
}

impl PromotionPhase {
    pub const ALL: [PromotionPhase; 7] = [
        PromotionPhase::Pending,
        PromotionPhase::Running,
        PromotionPhase::Succeeded,
        PromotionPhase::Failed,
        PromotionPhase::Errored,
        PromotionPhase::Aborted,
        PromotionPhase::Unknown,
    ];

    /// An empty raw phase means the controller has not picked the Promotion up yet.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return PromotionPhase::Pending;
        }
        Self::ALL
            .into_iter()
            .filter(|p| *p != PromotionPhase::Unknown)
            .find(|p| p.as_str().eq_ignore_ascii_case(raw))
            .unwrap_or(PromotionPhase::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionPhase::Pending => "Pending",
            PromotionPhase::Running => "Running",
            PromotionPhase::Succeeded => "Succeeded",
            PromotionPhase::Failed => "Failed",
            PromotionPhase::Errored => "Errored",
            PromotionPhase::Aborted => "Aborted",
            PromotionPhase::Unknown => "Unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PromotionPhase::Succeeded
                | PromotionPhase::Failed
                | PromotionPhase::Errored
                | PromotionPhase::Aborted
        )
    }

    /// Terminal failure phases only.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PromotionPhase::Failed | PromotionPhase::Errored | PromotionPhase::Aborted
        )
    }
}

impl fmt::Display for PromotionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn phase(promotion: &Promotion) -> PromotionPhase {
    promotion
        .status
        .as_ref()
        .map(|s| PromotionPhase::parse(&s.phase))
        .unwrap_or(PromotionPhase::Pending)
}

pub fn has_abort_request(promotion: &Promotion) -> bool {
    AbortPromotionRequest::from_annotations(&promotion.metadata.annotations)
        .is_some_and(|req| req.action == AbortAction::Terminate)
}

/// Abort requested but not yet reflected as a terminal phase.
pub fn is_abort_pending(promotion: &Promotion) -> bool {
    has_abort_request(promotion) && !phase(promotion).is_terminal()
}

/// Copy of the status with the abort overlay applied; the record itself is never touched.
pub fn display_status(promotion: &Promotion) -> Option<PromotionStatus> {
    let mut status = promotion.status.clone()?;
    if is_abort_pending(promotion) {
        status.message = Some(ABORT_PENDING_MESSAGE.to_string());
    }
    Some(status)
}

/// Identifier half of the `kind:identifier` create-actor annotation.
pub fn created_by(promotion: &Promotion) -> String {
    match promotion.annotation(ANNOTATION_CREATE_ACTOR) {
        None => "N/A".to_string(),
        Some(actor) => match actor.split(':').nth(1) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => actor.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    pub phase: PromotionPhase,
    pub terminal: bool,
    pub retryable: bool,
    pub abort_pending: bool,
}

pub fn classify(promotion: &Promotion) -> StatusFlags {
    let phase = phase(promotion);
    StatusFlags {
        phase,
        terminal: phase.is_terminal(),
        retryable: phase.is_retryable(),
        abort_pending: has_abort_request(promotion) && !phase.is_terminal(),
    }
}
