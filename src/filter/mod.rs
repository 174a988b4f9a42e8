//! Pluggable filters used to skip data blocks that cannot contain a key.

mod bloom;

pub use bloom::BloomFilterPolicy;

/// Builds and probes per-block probabilistic filters.
///
/// `key_may_match` may return false positives but never false negatives:
/// a `false` answer guarantees the key was not in the set the filter was
/// built from.
pub trait FilterPolicy: Send + Sync {
    /// Identifies the policy; stored in the table's meta-index block as
    /// `filter.<name>` so readers can tell whether they understand it.
    fn name(&self) -> &'static str;

    /// Builds a filter summarising `keys` and returns its byte encoding.
    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8>;

    /// Probes `filter` (as produced by `create_filter`) for `key`.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}
