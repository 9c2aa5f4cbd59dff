//! Catalog loader: opens the SQLite-backed catalog, reads `source`, `field`,
//! `tbl`, and `idx`, and assembles the schema types plus one prepared
//! `ChunkStore` per chunk table.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, info_span, warn};
use tsf_base::{Result, TsfError};

use crate::schema::{str_to_code_identifier, ChunkTable, EnumEntry, Field, FieldLayout, Source, ValueType};
use crate::store::ChunkStore;

/// Tunables for opening a catalog beyond the zero-configuration default.
///
/// `chunk_cache_bytes` bounds how much decompressed chunk data an iterator
/// keeps resident at once: once a `query_table` iterator's cached chunks
/// exceed the budget, slots not touched by the current record/entity are
/// dropped rather than grown without limit. `busy_timeout` overrides the
/// catalog connection's SQLite busy handler.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    chunk_cache_bytes: Option<usize>,
    busy_timeout: Option<Duration>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_cache_bytes(mut self, bytes: usize) -> Self {
        self.chunk_cache_bytes = Some(bytes);
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<TsfFile> {
        TsfFile::open_with(path, self)
    }
}

/// An open TSF catalog: the source/field schema plus one blob-fetch
/// statement per chunk table. Holds the SQLite connection for the lifetime
/// of the file; closing it (`drop`ing the `TsfFile`) releases it.
///
/// Opening a catalog never fails outright: a connection or schema-load
/// failure yields a handle with no sources and `errmsg` set, matching the
/// original library's convention of always returning a usable (if inert)
/// file handle so callers can introspect what went wrong and still `close`
/// it cleanly.
pub struct TsfFile {
    conn: Option<Connection>,
    pub sources: Vec<Source>,
    pub(crate) chunk_tables: Vec<ChunkTable>,
    pub errmsg: Option<String>,
    chunk_cache_bytes: Option<usize>,
}

impl TsfFile {
    pub fn open(path: impl AsRef<Path>) -> Result<TsfFile> {
        TsfFile::open_with(path, &OpenOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: &OpenOptions) -> Result<TsfFile> {
        let path = path.as_ref();
        let span = info_span!("tsf_open", path = %path.display());
        let _enter = span.enter();

        let conn = match Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                let err = TsfError::open_failed(path, e.to_string());
                return Ok(TsfFile {
                    conn: None,
                    sources: Vec::new(),
                    chunk_tables: Vec::new(),
                    errmsg: Some(err.to_string()),
                    chunk_cache_bytes: options.chunk_cache_bytes,
                });
            }
        };

        if let Some(timeout) = options.busy_timeout {
            let _ = conn.busy_timeout(timeout);
        }

        info!(target: "tsf", path = %path.display(), "opening catalog");

        let schema: Result<(Vec<ChunkTable>, Vec<Source>)> = (|| {
            let chunk_tables = load_chunk_tables(&conn)?;
            let sources = load_sources(&conn, &chunk_tables)?;
            Ok((chunk_tables, sources))
        })();

        let (chunk_tables, sources, errmsg) = match schema {
            Ok((chunk_tables, sources)) => (chunk_tables, sources, None),
            Err(e) => {
                warn!(target: "tsf", path = %path.display(), error = %e, "failed to load catalog schema, returning handle with no sources");
                (Vec::new(), Vec::new(), Some(e.to_string()))
            }
        };

        Ok(TsfFile {
            conn: Some(conn),
            sources,
            chunk_tables,
            errmsg,
            chunk_cache_bytes: options.chunk_cache_bytes,
        })
    }

    pub fn source_by_name(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn chunk_tables(&self) -> &[ChunkTable] {
        &self.chunk_tables
    }

    pub fn errmsg(&self) -> Option<&str> {
        self.errmsg.as_deref()
    }

    pub(crate) fn chunk_cache_bytes(&self) -> Option<usize> {
        self.chunk_cache_bytes
    }

    pub(crate) fn store_for(&self, chunk_table: usize) -> Option<ChunkStore<'_>> {
        let conn = self.conn.as_ref()?;
        let t = &self.chunk_tables[chunk_table];
        Some(ChunkStore::new(conn, t.name.clone(), t.statement_sql.clone()))
    }

    /// Fetches and decompresses one chunk, or `None` if no row exists for
    /// `chunk_id` (or the file has no usable connection).
    pub(crate) fn fetch_chunk(
        &self,
        chunk_table: usize,
        chunk_id: i64,
        value_type: ValueType,
    ) -> Result<Option<crate::chunk::Chunk>> {
        let Some(store) = self.store_for(chunk_table) else {
            return Ok(None);
        };
        let Some(raw) = store.fetch(chunk_id)? else {
            return Ok(None);
        };
        let chunk = crate::chunk::Chunk::from_raw(&store.table_name, chunk_id, value_type, &raw)?;
        Ok(Some(chunk))
    }
}

fn load_chunk_tables(conn: &Connection) -> Result<Vec<ChunkTable>> {
    let mut stmt = conn
        .prepare("SELECT id, table_uri, table_format, table_meta FROM tbl")
        .map_err(|e| TsfError::prepare_failed("tbl", e.to_string()))?;

    let mut tables = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let uri: String = row.get(1)?;
        let format: String = row.get(2)?;
        let meta: String = row.get(3)?;

        let is_chunk_table = format == "chunk_table";
        if !is_chunk_table {
            tables.push(ChunkTable {
                id,
                is_chunk_table: false,
                name: String::new(),
                chunk_bits: 0,
                chunk_size: 0,
                field_count: 0,
                record_count: 0,
                statement_sql: String::new(),
            });
            continue;
        }

        let name = match parse_table_uri(&uri) {
            Some(n) => n,
            None => {
                warn!(target: "tsf", %uri, "unable to parse chunk table name from uri");
                tables.push(ChunkTable {
                    id,
                    is_chunk_table: false,
                    name: String::new(),
                    chunk_bits: 0,
                    chunk_size: 0,
                    field_count: 0,
                    record_count: 0,
                    statement_sql: String::new(),
                });
                continue;
            }
        };

        let statement_sql = format!("SELECT chunk FROM {name} WHERE chunk_id = ?");
        // Confirm the statement is preparable now, rather than on first fetch.
        conn.prepare(&statement_sql)
            .map_err(|e| TsfError::prepare_failed(&name, e.to_string()))?;

        let mut chunk_bits = 0u32;
        let mut field_count = 0i64;
        let mut record_count = 0i64;
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&meta) {
            if let Some(obj) = v.as_object() {
                if let Some(x) = obj.get("chunk_bits").and_then(|v| v.as_u64()) {
                    chunk_bits = x as u32;
                }
                if let Some(x) = obj.get("field_count").and_then(|v| v.as_i64()) {
                    field_count = x;
                }
                if let Some(x) = obj.get("record_count").and_then(|v| v.as_i64()) {
                    record_count = x;
                }
            }
        }

        tables.push(ChunkTable {
            id,
            is_chunk_table: true,
            name,
            chunk_bits,
            chunk_size: 1i64 << chunk_bits,
            field_count,
            record_count,
            statement_sql,
        });
    }
    Ok(tables)
}

/// Extracts the table name out of a `key=value&...` query-string URI, the
/// value associated with the first `=` up to the next `&`.
fn parse_table_uri(uri: &str) -> Option<String> {
    let after_eq = uri.split_once('=')?.1;
    let name = match after_eq.split_once('&') {
        Some((name, _)) => name,
        None => after_eq,
    };
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn load_sources(conn: &Connection, chunk_tables: &[ChunkTable]) -> Result<Vec<Source>> {
    let mut q_src = conn
        .prepare("SELECT id, name, entity_dim, locus_dim, uuid, curated, docs, source_meta FROM source")
        .map_err(|e| TsfError::prepare_failed("source", e.to_string()))?;
    let mut q_field = conn
        .prepare(
            "SELECT field_id, table_id, locus_idx_map, entity_idx_map, field_table_idx, \
             field_type, field_meta FROM field WHERE source_id = ?",
        )
        .map_err(|e| TsfError::prepare_failed("field", e.to_string()))?;
    let mut q_idx = conn
        .prepare("SELECT field_id, idx_type, query_table_name, data_table_id, idx_meta FROM idx WHERE source_id = ?")
        .ok();

    let mut sources = Vec::new();
    let mut rows = q_src.query([])?;
    while let Some(row) = rows.next()? {
        let source_id: i64 = row.get(0)?;
        let name: String = row.get(1)?;
        let mut entity_count: i64 = row.get(2)?;
        if entity_count == 0 {
            entity_count = -1;
        }
        let mut locus_count: i64 = row.get(3)?;
        if locus_count == 0 {
            locus_count = -1;
        }
        let uuid: String = row.get(4)?;
        let date_curated: String = row.get(5)?;
        let docs_json: Option<String> = row.get(6)?;
        let meta_json: Option<String> = row.get(7)?;

        let mut source = Source {
            source_id,
            name,
            uuid,
            err: None,
            fields: Vec::new(),
            entity_count,
            locus_count,
            date_curated,
            curated_by: None,
            series_name: None,
            source_version: None,
            description_html: None,
            credit_html: None,
            notes_html: None,
            header_lines: None,
            primary_source_uuid: None,
            coord_sys_id: None,
            gidx_query_table: None,
            gidx_data_table: None,
            records_in_genomic_order: false,
        };

        apply_docs_json(&mut source, docs_json.as_deref());
        apply_meta_json(&mut source, meta_json.as_deref());

        if let Some(q_idx) = q_idx.as_mut() {
            let mut idx_rows = q_idx.query([source_id])?;
            while let Some(row) = idx_rows.next()? {
                let idx_type: String = row.get(1)?;
                let query_table: String = row.get(2)?;
                let data_table: String = row.get(3)?;
                let idx_meta: Option<String> = row.get(4)?;
                if idx_type == "idx_gidx" {
                    source.gidx_query_table = Some(query_table);
                    source.gidx_data_table = Some(data_table);
                    if let Some(idx_meta) = idx_meta {
                        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&idx_meta) {
                            if let Some(c) = v.get("coordSysId").and_then(|v| v.as_str()) {
                                source.coord_sys_id = Some(c.to_string());
                            }
                        }
                    }
                }
            }
        }

        let mut field_rows = q_field.query([source_id])?;
        while let Some(row) = field_rows.next()? {
            match build_field(row, chunk_tables) {
                Ok(field) => source.fields.push(field),
                Err(e) => {
                    warn!(target: "tsf", source = %source.name, error = %e, "failed to load field, marking source unreadable");
                    source.err = Some(e.to_string());
                }
            }
        }

        backfill_symbols(&mut source.fields);

        debug!(target: "tsf", source = %source.name, fields = source.fields.len(), "loaded source");
        sources.push(source);
    }
    Ok(sources)
}

fn apply_docs_json(source: &mut Source, docs_json: Option<&str>) {
    let Some(docs_json) = docs_json else { return };
    let Ok(v) = serde_json::from_str::<serde_json::Value>(docs_json) else {
        return;
    };
    let Some(obj) = v.as_object() else { return };
    let as_string = |k: &str| obj.get(k).and_then(|v| v.as_str()).map(str::to_string);
    source.curated_by = as_string("curatedBy");
    source.series_name = as_string("seriesName");
    source.source_version = as_string("sourceVersion");
    source.description_html = as_string("descriptionHtml");
    source.credit_html = as_string("sourceCreditHtml");
    source.notes_html = as_string("curationNotesHtml");
    source.primary_source_uuid = as_string("primarySourceUuid");
    if let Some(lines) = obj.get("headerLines").and_then(|v| v.as_array()) {
        let joined = lines
            .iter()
            .filter_map(|e| e.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !joined.is_empty() {
            source.header_lines = Some(joined);
        }
    }
}

fn apply_meta_json(source: &mut Source, meta_json: Option<&str>) {
    let Some(meta_json) = meta_json else { return };
    let Ok(v) = serde_json::from_str::<serde_json::Value>(meta_json) else {
        return;
    };
    if let Some(b) = v.get("FeaturesInGenomicOrder").and_then(|v| v.as_bool()) {
        source.records_in_genomic_order = b;
    }
}

fn build_field(row: &rusqlite::Row<'_>, chunk_tables: &[ChunkTable]) -> Result<Field> {
    let table_id: i64 = row.get(1)?;
    let locus_idx_map_str: String = row.get(2)?;
    let entity_idx_map_str: String = row.get(3)?;
    let table_field_idx: i64 = row.get(4)?;
    let value_type_tag: String = row.get(5)?;
    let field_meta: Option<String> = row.get(6)?;

    let chunk_table = (table_id - 1) as usize;
    if chunk_table >= chunk_tables.len() || !chunk_tables[chunk_table].is_chunk_table {
        return Err(TsfError::prepare_failed(
            "field",
            format!("field references chunk table id {table_id}, which is not a chunk table"),
        ));
    }

    let value_type = ValueType::from_format_tag(&value_type_tag);

    let layout = if !locus_idx_map_str.is_empty() && locus_idx_map_str == "SPARSE_ARRAY" {
        FieldLayout::SparseArray
    } else if !locus_idx_map_str.is_empty() && !entity_idx_map_str.is_empty() {
        FieldLayout::Matrix
    } else if !locus_idx_map_str.is_empty() {
        FieldLayout::LocusAttribute
    } else {
        FieldLayout::EntityAttribute
    };

    let locus_idx_map = if locus_idx_map_str.is_empty() || locus_idx_map_str == "IDX_IS_ID" {
        None
    } else {
        parse_idx_map(&locus_idx_map_str)
    };

    let mut field = Field {
        value_type,
        layout,
        chunk_table,
        table_field_idx,
        locus_idx_map,
        name: String::new(),
        symbol: String::new(),
        doc: String::new(),
        url_template: None,
        enum_entries: Vec::new(),
        extents_min: None,
        extents_max: None,
    };

    if let Some(field_meta) = field_meta {
        apply_field_meta(&mut field, &field_meta)?;
    }

    Ok(field)
}

/// Parses a `"<chunk_table_id>:<field_idx>"` indirection reference, where
/// `chunk_table_id` is 1-based. Returns `None` if the string does not match
/// that grammar (left un-indirected, matching the original's silent
/// fallback).
fn parse_idx_map(s: &str) -> Option<(usize, i64)> {
    let (table_part, field_part) = s.split_once(':')?;
    let table_id: i64 = table_part.trim().parse().ok()?;
    let field_idx: i64 = field_part.trim().parse().ok()?;
    if table_id < 1 {
        return None;
    }
    Some(((table_id - 1) as usize, field_idx))
}

fn apply_field_meta(field: &mut Field, field_meta: &str) -> Result<()> {
    let v: serde_json::Value = serde_json::from_str(field_meta)?;
    let Some(obj) = v.as_object() else { return Ok(()) };

    if let Some(s) = obj.get("name").and_then(|v| v.as_str()) {
        field.name = s.to_string();
    }
    if let Some(s) = obj.get("symbol").and_then(|v| v.as_str()) {
        field.symbol = s.to_string();
    }
    if let Some(s) = obj.get("doc").and_then(|v| v.as_str()) {
        field.doc = s.to_string();
    }
    if let Some(s) = obj.get("urlTemplate").and_then(|v| v.as_str()) {
        field.url_template = Some(s.to_string());
    }

    if let Some(enums) = obj.get("enum").and_then(|v| v.as_array()) {
        for e in enums {
            let Some(pair) = e.as_array() else { continue };
            if pair.len() < 2 {
                field.enum_entries.push(EnumEntry::default());
                continue;
            }
            let label = pair[0].as_str().unwrap_or("").to_string();
            let mut doc = String::new();
            if let Some(params) = pair[1].as_array() {
                for kv in params {
                    let Some(kv) = kv.as_array() else { continue };
                    if kv.len() < 2 {
                        continue;
                    }
                    // Fixed indexing: the original reads kv[0] twice where it
                    // meant to read the key at kv[0] and the value at kv[1].
                    if kv[0].as_str() == Some("doc") {
                        doc = kv[1].as_str().unwrap_or("").to_string();
                    }
                }
            }
            field.enum_entries.push(EnumEntry { label, doc });
        }
    }

    if let Some(props) = obj.get("props").and_then(|v| v.as_array()) {
        for kv in props {
            let Some(kv) = kv.as_array() else { continue };
            if kv.len() < 2 {
                continue;
            }
            let key = kv[0].as_str().unwrap_or("");
            match key {
                "ExtentsMin" => field.extents_min = kv[1].as_f64(),
                "ExtentsMax" => field.extents_max = kv[1].as_f64(),
                _ => {}
            }
        }
    }

    Ok(())
}

/// Assigns a code-identifier `symbol` to every field whose catalog metadata
/// did not supply one, uniquifying collisions with a numeric suffix starting
/// at `2`.
fn backfill_symbols(fields: &mut [Field]) {
    for i in 0..fields.len() {
        if !fields[i].symbol.is_empty() {
            continue;
        }
        let base = str_to_code_identifier(&fields[i].name);
        let mut candidate = base.clone();
        let mut count = 2;
        while fields[..i].iter().any(|f| f.symbol == candidate) {
            candidate = format!("{base}{count}");
            count += 1;
        }
        fields[i].symbol = candidate;
    }
}
