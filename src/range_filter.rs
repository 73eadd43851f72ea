//! Narrows the broker's process instance keys to those allocated inside a
//! lost range.

use crate::core::{EntityKey, LostRanges, Result};

/// Lazily keeps the keys of `keys` that fall inside `ranges`, preserving
/// encounter order. Errors are passed through unfiltered.
pub fn affected_keys<'r, I>(
    ranges: &'r LostRanges,
    keys: I,
) -> impl Iterator<Item = Result<EntityKey>> + 'r
where
    I: IntoIterator<Item = Result<EntityKey>>,
    I::IntoIter: 'r,
{
    keys.into_iter().filter(move |key| match key {
        Ok(key) => ranges.is_affected(*key),
        Err(_) => true,
    })
}

/// Collects the affected keys of `keys`.
pub fn filter_affected<I>(ranges: &LostRanges, keys: I) -> Result<Vec<EntityKey>>
where
    I: IntoIterator<Item = Result<EntityKey>>,
{
    affected_keys(ranges, keys).collect()
}
