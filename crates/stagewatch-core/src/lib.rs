//! Promotion list synchronisation engine.
//!
//! A finite snapshot of a stage's Promotions is merged with the live watch
//! stream into a shared, versioned cache; rows for presentation are composed
//! from that cache together with the freight lookup and retry gateway state.

mod config;
pub use config::{config_schema_json, load_config, write_schema_file, Config, ViewConfig, WatchConfig};
pub mod error;
pub mod freight;
pub mod gateway;
pub mod ordering;
pub mod projection;
pub mod query_cache;
pub mod reconciler;
pub mod status;
pub mod transport;
pub mod view;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{ReconcileError, RetryError, ServiceError};
pub use freight::{FreightLookup, FreightState, FreightView};
pub use gateway::RetryGateway;
pub use ordering::{compare_promotions, sorted_promotions};
pub use projection::{
    compose_rows, DeepLink, DeepLinkContext, DeepLinkRegistry, DeepLinkRenderer, FreightCell,
    ProjectionOptions, PromotionRow,
};
pub use query_cache::{Cardinality, PromotionListCache, QueryCache, QueryKey};
pub use reconciler::{
    apply_event, Applied, CloseReason, LiveReconciler, ReconcilerRegistry, ReconcilerState,
    ScopeKey,
};
pub use status::{PromotionPhase, StatusFlags};
pub use transport::{LocalService, PromotionService, WatchSender, WatchStream};
pub use view::{PromotionsView, ViewState};
