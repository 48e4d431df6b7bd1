use stagewatch_protocol::{Promotion, WatchPromotionEvent};

/// Effect of one watch event on the local collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Appended { index: usize },
    Replaced { index: usize },
    Removed { index: usize },
    /// Delete for an identity that is not present.
    Ignored,
}

/// Apply a single delta by identity.
///
/// Deletes keep the relative order of the remaining records; upserts replace
/// in place so a record never jumps to the end before the next sort.
pub fn apply_event(collection: &mut Vec<Promotion>, event: WatchPromotionEvent) -> Applied {
    let index = collection
        .iter()
        .position(|p| p.same_identity(&event.promotion));
    if event.is_delete() {
        return match index {
            Some(index) => {
                collection.remove(index);
                Applied::Removed { index }
            }
            None => Applied::Ignored,
        };
    }
    match index {
        Some(index) => {
            collection[index] = event.promotion;
            Applied::Replaced { index }
        }
        None => {
            collection.push(event.promotion);
            Applied::Appended {
                index: collection.len() - 1,
            }
        }
    }
}
