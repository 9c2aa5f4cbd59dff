//! Genomic-index-guided iteration.
//!
//! The catalog's `idx_gidx` row names a `gidx_query_table`/`gidx_data_table`
//! pair (see `Source::gidx_query_table`/`gidx_data_table`) that is meant to
//! answer "which record ids overlap this genomic range" without a full
//! table scan. The on-disk layout of those tables is not specified anywhere
//! beyond their name, so no overlap algorithm is implemented here; this
//! module only wraps a base `TsfIterator` with the query surface a
//! caller-supplied overlap resolver would drive.

use tsf_base::Result;

use crate::iter::TsfIterator;

/// Drives a base iterator from a caller-supplied stream of overlapping
/// record ids, rather than scanning sequentially.
pub struct GenomicIndexQuery<'a, 'f> {
    base: &'a mut TsfIterator<'f>,
}

impl<'a, 'f> GenomicIndexQuery<'a, 'f> {
    pub fn new(base: &'a mut TsfIterator<'f>) -> Self {
        GenomicIndexQuery { base }
    }

    /// Seeks the wrapped iterator to the next id yielded by `record_ids`,
    /// stopping at the first one that is still in range. Returns `false` once
    /// the id stream (or the base iterator) is exhausted.
    pub fn seek_next(&mut self, record_ids: &mut dyn Iterator<Item = i64>) -> Result<bool> {
        for id in record_ids {
            if self.base.seek(id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn base(&mut self) -> &mut TsfIterator<'f> {
        self.base
    }

    pub fn close(self) {}
}
