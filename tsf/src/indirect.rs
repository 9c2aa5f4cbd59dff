//! Indirection resolver: when a field's locus dimension is keyed through
//! another chunk table's index column, collates a synthetic `Int32` chunk by
//! resolving each index entry against its backend chunk. Mirrors
//! `read_chunk_with_idxmap` in the original implementation.

use tracing::warn;
use tsf_base::{Result, TsfError};

use crate::catalog::TsfFile;
use crate::chunk::Chunk;
use crate::schema::{Field, ValueType};
use crate::value::{ValueView, INT32_MISSING};

/// Resolves the chunk backing `field` at `record_id`/`field_idx`, routing
/// through the locus index map when the field has one. Returns `None` when
/// a direct (non-indirected) field's chunk is simply absent from the
/// catalog; for indirected fields, a missing index or backend chunk is
/// instead substituted with the missing-value sentinel per record.
pub fn read_chunk_with_idxmap(
    file: &TsfFile,
    field: &Field,
    record_id: i64,
    field_idx: i64,
) -> Result<Option<Chunk>> {
    let t = &file.chunk_tables()[field.chunk_table];
    let chunk_id = t.chunk_id(record_id, field_idx);

    let Some((idx_table, idx_field)) = field.locus_idx_map else {
        return file.fetch_chunk(field.chunk_table, chunk_id, field.value_type);
    };

    if field.value_type != ValueType::Int32 && field.value_type != ValueType::Enum {
        return Err(TsfError::unsupported_indirection(
            field.symbol.clone(),
            field.value_type.name(),
        ));
    }

    let idx_chunk_table = &file.chunk_tables()[idx_table];

    // The synthetic chunk must cover the same record span as `chunk_id` does
    // in the field's own chunk table, not whatever span the index table's own
    // geometry happens to give its chunk -- the two tables are independently
    // chunked and can disagree on chunk_bits.
    let chunk_base = (record_id >> t.chunk_bits) << t.chunk_bits;
    let record_count = t.chunk_size;
    let mut data = Vec::with_capacity(record_count as usize * 4);
    let mut idx_chunks: Vec<Chunk> = Vec::new();
    let mut backend_chunks: Vec<Chunk> = Vec::new();

    for i in 0..record_count {
        let rid = chunk_base + i;
        let idx_chunk_id = idx_chunk_table.chunk_id(rid, idx_field);
        let idx_offset = rid % idx_chunk_table.chunk_size;

        let idx_slot = match idx_chunks.iter().position(|c| c.chunk_id == idx_chunk_id) {
            Some(slot) => Some(slot),
            None => match file.fetch_chunk(idx_table, idx_chunk_id, ValueType::Int32)? {
                Some(c) => {
                    idx_chunks.push(c);
                    Some(idx_chunks.len() - 1)
                }
                None => None,
            },
        };

        let idx = match idx_slot {
            Some(slot) => {
                let (view, _) = idx_chunks[slot].value_at(idx_offset)?;
                match view {
                    ValueView::Int32(v) => v,
                    _ => unreachable!("index chunk is always read as Int32"),
                }
            }
            None => {
                warn!(target: "tsf", chunk_id = idx_chunk_id, "index chunk missing, substituting missing value");
                data.extend_from_slice(&INT32_MISSING.to_le_bytes());
                continue;
            }
        };

        let backend_chunk_id = t.chunk_id(idx as i64, field_idx);
        let offset = (idx as i64) % t.chunk_size;

        let existing = backend_chunks.iter().position(|c| c.chunk_id == backend_chunk_id);
        let resolved = match existing {
            Some(slot) => Some(slot),
            None => match file.fetch_chunk(field.chunk_table, backend_chunk_id, field.value_type)? {
                Some(c) => {
                    backend_chunks.push(c);
                    Some(backend_chunks.len() - 1)
                }
                None => {
                    warn!(target: "tsf", chunk_id = backend_chunk_id, "indirected backend chunk missing, substituting missing value");
                    None
                }
            },
        };

        let v = match resolved {
            Some(slot) => {
                let (bv, _) = backend_chunks[slot].value_at(offset)?;
                match bv {
                    ValueView::Int32(v) => v,
                    ValueView::Enum(v) => v,
                    _ => unreachable!("backend field is always Int32 or Enum here"),
                }
            }
            None => INT32_MISSING,
        };
        data.extend_from_slice(&v.to_le_bytes());
    }

    Ok(Some(Chunk::synthetic(
        chunk_id,
        ValueType::Int32,
        4,
        record_count,
        data,
    )))
}
