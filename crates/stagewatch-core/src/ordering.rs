use std::cmp::Ordering;

use stagewatch_protocol::Promotion;

/// Total order used for every sorted view of a promotion list.
///
/// Newest creation timestamp first; records without a timestamp trail the
/// ones that have one. Ties fall back to name, then namespace, so two distinct
/// identities never compare equal.
pub fn compare_promotions(a: &Promotion, b: &Promotion) -> Ordering {
    let by_time = match (
        a.metadata.creation_timestamp,
        b.metadata.creation_timestamp,
    ) {
        (Some(a_ts), Some(b_ts)) => b_ts.cmp(&a_ts),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        .then_with(|| a.metadata.namespace.cmp(&b.metadata.namespace))
}

/// Stable sort into a new vector; the input slice is left untouched.
pub fn sorted_promotions(items: &[Promotion]) -> Vec<Promotion> {
    let mut out = items.to_vec();
    out.sort_by(compare_promotions);
    out
}
