//! Cursor-style iteration over a source's fields: one column group
//! (`LocusAttribute`/`EntityAttribute`/`Matrix`/`SparseArray`) advanced
//! record-by-record or entity-by-entity, with per-slot chunk caching.
//! Grounded on `tsf_query_table`/`tsf_iter_next`/`tsf_iter_id` in the
//! original implementation.

use tracing::info_span;
use tsf_base::{Result, TsfError};

use crate::catalog::TsfFile;
use crate::chunk::Chunk;
use crate::indirect::read_chunk_with_idxmap;
use crate::schema::{Field, FieldLayout, Source};
use crate::value::ValueView;

/// A live cursor over one or more fields of a single field layout.
///
/// For `Matrix` fields, `next()` walks entities innermost and records
/// outermost: it advances through every queried entity at the current
/// record before moving to the next record.
pub struct TsfIterator<'a> {
    file: &'a TsfFile,
    fields: Vec<&'a Field>,
    layout: FieldLayout,
    is_matrix: bool,
    max_record_id: i64,
    cur_record_id: i64,
    entity_ids: Vec<i64>,
    cur_entity_idx: i64,
    chunks: Vec<Option<Chunk>>,
    chunk_cache_bytes: Option<usize>,
}

/// Builds an iterator over `field_symbols` (or, if `None`, every field of
/// `layout`) of `source`. All selected fields must share one field layout.
pub fn query_table<'a>(
    file: &'a TsfFile,
    source: &'a Source,
    field_symbols: Option<&[&str]>,
    layout: FieldLayout,
    entity_ids: Option<&[i64]>,
) -> Result<TsfIterator<'a>> {
    let span = info_span!("tsf_query_table", source = %source.name, layout = layout.name());
    let _enter = span.enter();

    let (fields, layout) = match field_symbols {
        None => {
            let fields: Vec<&Field> = source.fields.iter().filter(|f| f.layout == layout).collect();
            (fields, layout)
        }
        Some(symbols) => {
            let mut fields = Vec::with_capacity(symbols.len());
            for symbol in symbols {
                let field = source
                    .field_by_symbol(symbol)
                    .ok_or_else(|| TsfError::unknown_field(*symbol))?;
                fields.push(field);
            }
            let resolved_layout = fields.first().map(|f| f.layout).unwrap_or(layout);
            for field in &fields {
                if field.layout != resolved_layout {
                    return Err(TsfError::inconsistent_field_types(
                        resolved_layout.name(),
                        field.layout.name(),
                    ));
                }
            }
            (fields, resolved_layout)
        }
    };

    let is_matrix = layout == FieldLayout::Matrix;
    let max_record_id = if layout == FieldLayout::EntityAttribute {
        source.entity_count
    } else {
        source.locus_count
    };

    // `source.entity_count == -1` means "unknown" (normalized from the
    // catalog's `0`); without an explicit entity list there is nothing to
    // default to, so this yields an empty list rather than a bogus range.
    // `load_current` refuses to step into the per-field loop when a matrix
    // iterator's entity list is empty, so this never reaches the
    // entity-indexed chunk lookup below.
    let entity_ids: Vec<i64> = if is_matrix {
        match entity_ids {
            Some(ids) if !ids.is_empty() => ids.to_vec(),
            _ if source.entity_count > 0 => (0..source.entity_count).collect(),
            _ => Vec::new(),
        }
    } else {
        Vec::new()
    };

    let chunk_count = if is_matrix {
        fields.len() * entity_ids.len().max(1)
    } else {
        fields.len()
    };

    Ok(TsfIterator {
        file,
        fields,
        layout,
        is_matrix,
        max_record_id,
        cur_record_id: -1,
        entity_ids,
        cur_entity_idx: -1,
        chunks: (0..chunk_count).map(|_| None).collect(),
        chunk_cache_bytes: file.chunk_cache_bytes(),
    })
}

impl<'a> TsfIterator<'a> {
    pub fn layout(&self) -> FieldLayout {
        self.layout
    }

    pub fn fields(&self) -> &[&'a Field] {
        &self.fields
    }

    pub fn entity_ids(&self) -> &[i64] {
        &self.entity_ids
    }

    pub fn current_record_id(&self) -> i64 {
        self.cur_record_id
    }

    pub fn current_entity_idx(&self) -> i64 {
        self.cur_entity_idx
    }

    /// Advances to the next element: the next record for non-matrix fields,
    /// or the next (record, entity) pair -- entity innermost -- for matrix
    /// fields. Returns `false` once iteration is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        if !self.is_matrix {
            self.cur_record_id += 1;
        } else {
            self.cur_entity_idx += 1;
            if self.cur_entity_idx >= self.entity_ids.len() as i64 {
                self.cur_entity_idx = 0;
            }
            if self.cur_entity_idx == 0 {
                self.cur_record_id += 1;
            }
        }

        if self.cur_record_id >= self.max_record_id {
            return Ok(false);
        }
        self.load_current()
    }

    /// Seeks directly to `id`, preserving (for matrix iterators) whichever
    /// entity index was last current, reset to `0` if `id` differs from the
    /// current record.
    pub fn seek(&mut self, id: i64) -> Result<bool> {
        if self.cur_record_id == id {
            return Ok(true);
        }
        if id < 0 {
            return Ok(false);
        }
        if self.is_matrix {
            self.cur_entity_idx = 0;
        }
        self.cur_record_id = id;
        if self.cur_record_id >= self.max_record_id {
            return Ok(false);
        }
        self.load_current()
    }

    /// Seeks directly to the `(id, entity_idx)` pair of a matrix iterator.
    pub fn seek_matrix(&mut self, id: i64, entity_idx: i64) -> Result<bool> {
        debug_assert!(self.is_matrix, "seek_matrix called on a non-matrix iterator");
        if self.cur_record_id == id && self.cur_entity_idx == entity_idx {
            return Ok(true);
        }
        if id < 0 || entity_idx < 0 {
            return Ok(false);
        }
        self.cur_record_id = id;
        self.cur_entity_idx = entity_idx;
        if self.cur_record_id >= self.max_record_id {
            return Ok(false);
        }
        self.load_current()
    }

    /// Consumes the iterator. Present for parity with the original API;
    /// the backing sqlite connection is not touched until `TsfFile` drops.
    pub fn close(self) {}

    fn slot(&self, field_idx: usize) -> usize {
        if self.is_matrix {
            field_idx * self.entity_ids.len() + self.cur_entity_idx as usize
        } else {
            field_idx
        }
    }

    fn load_current(&mut self) -> Result<bool> {
        // A matrix iterator with no entities to visit (source.entity_count
        // was unknown and no explicit subset was given) has no valid record
        // to land on; the per-field loop below indexes `entity_ids` by
        // `cur_entity_idx`, which would panic on an empty list.
        if self.is_matrix && self.entity_ids.is_empty() {
            return Ok(false);
        }

        let mut touched_slots = Vec::with_capacity(self.fields.len());
        for field_idx in 0..self.fields.len() {
            let field = self.fields[field_idx];
            let table_field_idx = if self.is_matrix {
                self.entity_ids[self.cur_entity_idx as usize]
            } else {
                field.table_field_idx
            };
            let t = &self.file.chunk_tables()[field.chunk_table];
            let chunk_id = t.chunk_id(self.cur_record_id, table_field_idx);
            let slot = self.slot(field_idx);
            touched_slots.push(slot);

            let needs_fetch = match &self.chunks[slot] {
                Some(c) => c.chunk_id != chunk_id,
                None => true,
            };
            if needs_fetch {
                match read_chunk_with_idxmap(self.file, field, self.cur_record_id, table_field_idx)? {
                    Some(chunk) => self.chunks[slot] = Some(chunk),
                    None => return Ok(false),
                }
            }
        }

        if let Some(budget) = self.chunk_cache_bytes {
            let total: usize = self.chunks.iter().flatten().map(|c| c.byte_len()).sum();
            if total > budget {
                for (slot_idx, slot) in self.chunks.iter_mut().enumerate() {
                    if !touched_slots.contains(&slot_idx) {
                        *slot = None;
                    }
                }
            }
        }

        Ok(true)
    }

    /// Reads the current row's value for the `field_idx`-th queried field.
    /// Must only be called after `next()`/`seek()`/`seek_matrix()` returned
    /// `true`.
    pub fn value(&mut self, field_idx: usize) -> Result<(ValueView<'_>, bool)> {
        let field = self.fields[field_idx];
        let chunk_size = self.file.chunk_tables()[field.chunk_table].chunk_size;
        let offset = self.cur_record_id % chunk_size;
        let slot = self.slot(field_idx);
        let chunk = self.chunks[slot]
            .as_mut()
            .expect("value() called before a successful next()/seek()");
        chunk.value_at(offset)
    }
}
