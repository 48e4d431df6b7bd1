//! Canonical event topic constants shared across the workspace.
//!
//! Every crate that publishes on the event bus takes its topic names from
//! here so subscribers can match on a single source of truth.
//! Keep this list alphabetized within sections and favor dot.case names.

// Promotion list (snapshot + live reconciliation)
pub const TOPIC_PROMOTIONS_LIST_LOADED: &str = "promotions.list.loaded";
pub const TOPIC_PROMOTIONS_LIST_PATCHED: &str = "promotions.list.patched";
pub const TOPIC_PROMOTIONS_WATCH_CLOSED: &str = "promotions.watch.closed";
pub const TOPIC_PROMOTIONS_WATCH_STATE: &str = "promotions.watch.state";

// Retry mutations
pub const TOPIC_PROMOTIONS_RETRY_FAILED: &str = "promotions.retry.failed";
pub const TOPIC_PROMOTIONS_RETRY_SUBMITTED: &str = "promotions.retry.submitted";

// Freight lookup
pub const TOPIC_FREIGHT_LOOKUP_RESOLVED: &str = "freight.lookup.resolved";
pub const TOPIC_FREIGHT_LOOKUP_UNAVAILABLE: &str = "freight.lookup.unavailable";
