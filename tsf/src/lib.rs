//! Read-only access to TSF catalogs: SQLite-backed schema metadata plus
//! compressed, chunked columnar data.
//!
//! A `TsfFile` opens the catalog and its `source`/`field`/`tbl`/`idx`
//! tables; `query_table` then returns a `TsfIterator` that walks one field
//! layout (locus attribute, entity attribute, matrix, or sparse array) a
//! record at a time, decompressing and caching chunks as it goes.

pub mod catalog;
pub mod chunk;
pub mod gidx;
pub mod indirect;
pub mod iter;
pub mod schema;
pub mod store;
pub mod value;

pub use catalog::{OpenOptions, TsfFile};
pub use gidx::GenomicIndexQuery;
pub use iter::{query_table, TsfIterator};
pub use schema::{ChunkTable, EnumEntry, Field, FieldLayout, Source, ValueType};
pub use value::{FixedArrayView, StringArrayView, ValueView};

pub use tsf_base::{Result, TsfError};
