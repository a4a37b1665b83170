//! Cross-builder priority ordering.
//!
//! The dispatcher sorts its pending builder set through a `Prioritizer`
//! before each drain. The default encodes the waterfall convention of
//! numeric category prefixes: `"0nightly"` builders run before
//! `"5android"` builders, lexicographically. The trait is the seam
//! behind which a typed priority scheme can be swapped in later without
//! touching the dispatcher.

use crate::types::BuilderName;

/// Orders pending builder names for dispatch.
///
/// `order` must be stable: builders that compare equal keep their
/// insertion order.
pub trait Prioritizer: Send + Sync {
    fn order(&self, pending: &mut Vec<BuilderName>, category_of: &dyn Fn(&str) -> String);
}

/// Default prioritizer: ascending lexicographic by category string.
#[derive(Debug, Default, Clone, Copy)]
pub struct CategoryPrioritizer;

impl Prioritizer for CategoryPrioritizer {
    fn order(&self, pending: &mut Vec<BuilderName>, category_of: &dyn Fn(&str) -> String) {
        // sort_by_key is stable, so equal categories keep arrival order.
        pending.sort_by_key(|name| category_of(name));
    }
}
