use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation recording who created a Promotion, formatted `kind:identifier`.
pub const ANNOTATION_CREATE_ACTOR: &str = "kargo.akuity.io/create-actor";
/// Annotation carrying a JSON encoded [`AbortPromotionRequest`].
pub const ANNOTATION_ABORT: &str = "kargo.akuity.io/abort";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// Owning project.
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromotionSpec {
    #[serde(default)]
    pub stage: String,
    /// Opaque freight token.
    #[serde(default)]
    pub freight: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromotionStatus {
    /// Raw phase string as reported by the controller.
    #[serde(default)]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PromotionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PromotionStatus>,
}

impl Promotion {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..ObjectMeta::default()
            },
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.spec.stage = stage.into();
        self
    }

    pub fn with_freight(mut self, freight: impl Into<String>) -> Self {
        self.spec.freight = freight.into();
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.status.get_or_insert_with(PromotionStatus::default).phase = phase.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status.get_or_insert_with(PromotionStatus::default).message = Some(message.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.metadata.creation_timestamp = Some(at);
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.metadata.uid = Some(uid.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    /// Namespace-qualified identity; unique within one subscription scope.
    pub fn identity(&self) -> (&str, &str) {
        (&self.metadata.namespace, &self.metadata.name)
    }

    pub fn same_identity(&self, other: &Promotion) -> bool {
        self.identity() == other.identity()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AbortAction {
    Terminate,
    #[serde(other)]
    Unknown,
}

/// Abort request stored in the [`ANNOTATION_ABORT`] annotation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AbortPromotionRequest {
    pub action: AbortAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<bool>,
}

impl AbortPromotionRequest {
    /// Parse the abort annotation; a missing or malformed value yields `None`.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let raw = annotations.get(ANNOTATION_ABORT)?;
        serde_json::from_str(raw).ok()
    }

    pub fn terminate() -> Self {
        Self {
            action: AbortAction::Terminate,
            actor: None,
            control_plane: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    #[serde(other)]
    Unknown,
}

/// One item of the promotion watch stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
pub struct WatchPromotionEvent {
    #[serde(rename = "type")]
    pub kind: WatchEventType,
    pub promotion: Promotion,
}

impl WatchPromotionEvent {
    pub fn upsert(promotion: Promotion) -> Self {
        Self {
            kind: WatchEventType::Modified,
            promotion,
        }
    }

    pub fn deleted(promotion: Promotion) -> Self {
        Self {
            kind: WatchEventType::Deleted,
            promotion,
        }
    }

    /// Only `DELETED` removes; every other type is applied as an upsert.
    pub fn is_delete(&self) -> bool {
        self.kind == WatchEventType::Deleted
    }
}

/// Input shared by the list snapshot and the watch subscription.
#[derive(
    Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
pub struct ListPromotionsRequest {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct ListPromotionsResponse {
    #[serde(default)]
    pub promotions: Vec<Promotion>,
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
pub struct GetFreightRequest {
    pub project: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Freight {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Freight {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..ObjectMeta::default()
            },
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct PromoteToStageRequest {
    pub stage: String,
    pub project: String,
    pub freight: String,
}
