//! Immutable schema types produced by the catalog loader (see `catalog.rs`).
//!
//! Everything here is built once, while opening a file, by collecting into
//! growable `Vec`s and then freezing them into the structures below -- there
//! is no further mutation once `open` returns.

/// The closed set of element types a chunk column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Unknown,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    String,
    Enum,
    Int32Array,
    Float32Array,
    Float64Array,
    BoolArray,
    StringArray,
    EnumArray,
}

impl ValueType {
    /// Parses the 3-byte (null-padded) format tag stored in a chunk header,
    /// accepting both the short and long aliases documented for the catalog.
    pub fn from_format_tag(tag: &str) -> ValueType {
        match tag {
            "?" => ValueType::Bool,
            "i4" | "i" => ValueType::Int32,
            "i8" => ValueType::Int64,
            "f4" | "f" => ValueType::Float32,
            "f8" => ValueType::Float64,
            "s" => ValueType::String,
            "e" => ValueType::Enum,
            "@i4" | "@i" => ValueType::Int32Array,
            "@f4" | "@f" => ValueType::Float32Array,
            "@f8" => ValueType::Float64Array,
            "@?" => ValueType::BoolArray,
            "@s" => ValueType::StringArray,
            "@e" => ValueType::EnumArray,
            _ => ValueType::Unknown,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            ValueType::Int32Array
                | ValueType::Float32Array
                | ValueType::Float64Array
                | ValueType::BoolArray
                | ValueType::StringArray
                | ValueType::EnumArray
        )
    }

    /// `true` for the 4-byte-scalar array kinds, whose variable-length size
    /// prefix is padded out to a 4-byte boundary before the payload.
    pub fn uses_padded_array_layout(&self) -> bool {
        matches!(
            self,
            ValueType::Int32Array | ValueType::Float32Array | ValueType::EnumArray
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Unknown => "Unknown",
            ValueType::Int32 => "Int32",
            ValueType::Int64 => "Int64",
            ValueType::Float32 => "Float32",
            ValueType::Float64 => "Float64",
            ValueType::Bool => "Bool",
            ValueType::String => "String",
            ValueType::Enum => "Enum",
            ValueType::Int32Array => "Int32Array",
            ValueType::Float32Array => "Float32Array",
            ValueType::Float64Array => "Float64Array",
            ValueType::BoolArray => "BoolArray",
            ValueType::StringArray => "StringArray",
            ValueType::EnumArray => "EnumArray",
        }
    }
}

/// The shape a field's records take relative to a source's two dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldLayout {
    LocusAttribute,
    EntityAttribute,
    Matrix,
    SparseArray,
}

impl FieldLayout {
    pub fn name(&self) -> &'static str {
        match self {
            FieldLayout::LocusAttribute => "LocusAttribute",
            FieldLayout::EntityAttribute => "EntityAttribute",
            FieldLayout::Matrix => "Matrix",
            FieldLayout::SparseArray => "SparseArray",
        }
    }
}

/// A per-enum-value label with its own short documentation string.
#[derive(Debug, Clone, Default)]
pub struct EnumEntry {
    pub label: String,
    pub doc: String,
}

/// A typed column of a `Source`.
#[derive(Debug, Clone)]
pub struct Field {
    pub value_type: ValueType,
    pub layout: FieldLayout,

    /// Index into `TsfFile::chunk_tables` of the chunk table backing this field.
    pub chunk_table: usize,
    /// Column slot within that chunk table (the low 32 bits of a chunk id).
    pub table_field_idx: i64,

    /// `Some((chunk_table_index, field_column_slot))` when reads must go
    /// through the indirection resolver; `None` for `IDX_IS_ID`.
    pub locus_idx_map: Option<(usize, i64)>,

    pub name: String,
    pub symbol: String,
    pub doc: String,
    pub url_template: Option<String>,

    pub enum_entries: Vec<EnumEntry>,

    pub extents_min: Option<f64>,
    pub extents_max: Option<f64>,
}

impl Field {
    pub fn enum_label(&self, value: i32) -> Option<&str> {
        if value < 0 {
            return None;
        }
        self.enum_entries
            .get(value as usize)
            .map(|e| e.label.as_str())
    }
}

/// A logical table described by one row of the catalog's `source` table.
#[derive(Debug, Clone)]
pub struct Source {
    pub source_id: i64,
    pub name: String,
    pub uuid: String,
    /// Non-empty iff the source failed to load correctly; such a source
    /// cannot be queried.
    pub err: Option<String>,

    pub fields: Vec<Field>,

    /// `-1` means "unknown" (the catalog stored `0`).
    pub entity_count: i64,
    /// `-1` means "unknown" (the catalog stored `0`).
    pub locus_count: i64,

    pub date_curated: String,

    pub curated_by: Option<String>,
    pub series_name: Option<String>,
    pub source_version: Option<String>,
    pub description_html: Option<String>,
    pub credit_html: Option<String>,
    pub notes_html: Option<String>,
    pub header_lines: Option<String>,
    pub primary_source_uuid: Option<String>,

    pub coord_sys_id: Option<String>,
    pub gidx_query_table: Option<String>,
    pub gidx_data_table: Option<String>,
    pub records_in_genomic_order: bool,
}

impl Source {
    pub fn is_readable(&self) -> bool {
        self.err.is_none()
    }

    pub fn field_by_symbol(&self, symbol: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.symbol == symbol)
    }
}

/// Metadata and prepared query for one chunk-backed table in the catalog.
pub struct ChunkTable {
    pub id: i64,
    pub is_chunk_table: bool,
    pub name: String,
    pub chunk_bits: u32,
    pub chunk_size: i64,
    pub field_count: i64,
    pub record_count: i64,
    pub(crate) statement_sql: String,
}

impl ChunkTable {
    pub fn chunk_id(&self, record_id: i64, column_slot: i64) -> i64 {
        ((record_id >> self.chunk_bits) << 32) | (column_slot & 0xFFFF_FFFF)
    }
}

impl std::fmt::Debug for ChunkTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTable")
            .field("id", &self.id)
            .field("is_chunk_table", &self.is_chunk_table)
            .field("name", &self.name)
            .field("chunk_bits", &self.chunk_bits)
            .field("chunk_size", &self.chunk_size)
            .field("field_count", &self.field_count)
            .field("record_count", &self.record_count)
            .finish()
    }
}

/// Returns `true` when `str` matches the code-identifier grammar
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_code_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Projects an arbitrary display name onto the identifier grammar, dropping
/// invalid characters and prepending `col` if the result would not start
/// with a letter or underscore (or would be empty).
pub fn str_to_code_identifier(name: &str) -> String {
    if is_code_identifier(name) {
        return name.to_string();
    }
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c == &'_')
        .collect();
    if cleaned.is_empty() {
        return "col".to_string();
    }
    let first = cleaned.chars().next().unwrap();
    if first.is_ascii_alphabetic() || first == '_' {
        cleaned
    } else {
        format!("col{cleaned}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn code_identifier_accepts_letters_digits_underscore() {
        assert!(is_code_identifier("chr1"));
        assert!(is_code_identifier("_hidden"));
        assert!(is_code_identifier("a1_b2"));
        assert!(!is_code_identifier("1start"));
        assert!(!is_code_identifier("has space"));
        assert!(!is_code_identifier(""));
    }

    #[test]
    fn str_to_code_identifier_passes_through_valid_names() {
        assert_eq!(str_to_code_identifier("chr"), "chr");
    }

    #[test]
    fn str_to_code_identifier_strips_invalid_chars() {
        assert_eq!(str_to_code_identifier("Allele Freq (%)"), "AlleleFreq");
    }

    #[test]
    fn str_to_code_identifier_prepends_col_when_leading_digit() {
        assert_eq!(str_to_code_identifier("1000 Genomes"), "col1000Genomes");
    }

    #[test]
    fn str_to_code_identifier_falls_back_to_col_when_empty() {
        assert_eq!(str_to_code_identifier("!!!"), "col");
    }

    #[test]
    fn value_type_round_trips_format_tags() {
        assert_eq!(ValueType::from_format_tag("i4"), ValueType::Int32);
        assert_eq!(ValueType::from_format_tag("@f8"), ValueType::Float64Array);
        assert_eq!(ValueType::from_format_tag("bogus"), ValueType::Unknown);
    }

    #[test]
    fn chunk_id_packs_record_shift_and_column_slot() {
        let t = ChunkTable {
            id: 1,
            is_chunk_table: true,
            name: "t1".to_string(),
            chunk_bits: 4,
            chunk_size: 16,
            field_count: 1,
            record_count: 100,
            statement_sql: String::new(),
        };
        assert_eq!(t.chunk_id(0, 3), 3);
        assert_eq!(t.chunk_id(16, 3), (1i64 << 32) | 3);
        assert_eq!(t.chunk_id(31, 3), (1i64 << 32) | 3);
        assert_eq!(t.chunk_id(32, 3), (2i64 << 32) | 3);
    }
}
