//! Chunk binary format: fixed 16-byte header, two compression envelopes, and
//! the positional `value_at` accessor that amortizes sequential scans over
//! variable-length payloads.

use std::io::Read;

use tracing::debug_span;
use tsf_base::{Result, TsfError};

use crate::schema::ValueType;
use crate::value::{FixedArrayView, StringArrayView, ValueView};
use crate::value::{BOOL_MISSING, FLOAT32_MISSING, FLOAT64_MISSING, INT32_MISSING, INT64_MISSING};

pub const HEADER_SIZE: usize = 16;
const MAGIC: [u8; 2] = [0xFA, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Invalid,
    Zlib,
    Blosc,
}

impl CompressionMethod {
    fn from_bits(bits: u8) -> CompressionMethod {
        match bits & 0b11 {
            1 => CompressionMethod::Zlib,
            2 => CompressionMethod::Blosc,
            _ => CompressionMethod::Invalid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkHeader {
    pub compression_method: CompressionMethod,
    pub format_tag: String,
    pub type_size: i16,
    pub n: i32,
}

/// Parses the fixed 16-byte chunk header from the front of `raw`, returning
/// the header and the offset at which the (still-compressed) body begins.
pub fn parse_header(table: &str, chunk_id: i64, raw: &[u8]) -> Result<(ChunkHeader, usize)> {
    if raw.len() < HEADER_SIZE {
        return Err(TsfError::corrupt_header(
            table,
            chunk_id,
            format!("chunk has {} bytes, need at least {HEADER_SIZE}", raw.len()),
        ));
    }
    if raw[0] != MAGIC[0] || raw[1] != MAGIC[1] {
        return Err(TsfError::corrupt_header(
            table,
            chunk_id,
            "magic bytes did not match 0xFA01",
        ));
    }
    let compression_method = CompressionMethod::from_bits(raw[2]);
    let format_tag = {
        let end = raw[3..6].iter().position(|&b| b == 0).unwrap_or(3);
        String::from_utf8_lossy(&raw[3..3 + end]).into_owned()
    };
    let type_size = i16::from_le_bytes([raw[6], raw[7]]);
    let n = i32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
    let header = ChunkHeader {
        compression_method,
        format_tag,
        type_size,
        n,
    };
    Ok((header, HEADER_SIZE))
}

fn zlib_decompress(table: &str, chunk_id: i64, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 4 {
        return Ok(Vec::new());
    }
    let expected_size = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let mut out = Vec::new();
    out.try_reserve_exact(expected_size)
        .map_err(|_| TsfError::out_of_memory(table, chunk_id))?;
    out.resize(expected_size, 0);
    let mut decoder = flate2::read::ZlibDecoder::new(&body[4..]);
    match decoder.read_exact(&mut out) {
        Ok(()) => Ok(out),
        Err(e) => match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Err(TsfError::ShortBuffer {
                table: table.to_string(),
                chunk_id,
            }),
            _ => Err(TsfError::corrupt_data(table, chunk_id, e.to_string())),
        },
    }
}

fn blosc_decompress(table: &str, chunk_id: i64, body: &[u8]) -> Result<Vec<u8>> {
    const BLOSC_MIN_HEADER_LENGTH: usize = 16;
    if body.len() < BLOSC_MIN_HEADER_LENGTH {
        return Ok(Vec::new());
    }
    let decoded: Vec<u8> = unsafe {
        blosc::decompress_bytes(body).map_err(|e| {
            TsfError::corrupt_data(table, chunk_id, format!("blosc error: {e:?}"))
        })?
    };
    Ok(decoded)
}

/// Dispatches on `header.compression_method` and returns the decompressed
/// element bytes. A body too short for its codec's minimum framing is not an
/// error; it yields an empty buffer (an `n=0` chunk).
pub fn decompress(table: &str, chunk_id: i64, header: &ChunkHeader, body: &[u8]) -> Result<Vec<u8>> {
    match header.compression_method {
        CompressionMethod::Zlib => zlib_decompress(table, chunk_id, body),
        CompressionMethod::Blosc => blosc_decompress(table, chunk_id, body),
        CompressionMethod::Invalid => Err(TsfError::UnknownCompression {
            table: table.to_string(),
            chunk_id,
            method: 0,
        }),
    }
}

/// A decompressed chunk: `header.n` consecutive values of one column, plus
/// the amortized forward cursor used for variable-length element types.
pub struct Chunk {
    pub chunk_id: i64,
    pub value_type: ValueType,
    pub type_size: i16,
    pub record_count: i64,
    data: Vec<u8>,
    cur_offset: i64,
    cur_byte: usize,
}

impl Chunk {
    pub fn from_raw(table: &str, chunk_id: i64, value_type: ValueType, raw: &[u8]) -> Result<Chunk> {
        let span = debug_span!("decompress_chunk", table, chunk_id);
        let _enter = span.enter();

        let (header, body_off) = parse_header(table, chunk_id, raw)?;
        if ValueType::from_format_tag(&header.format_tag) == ValueType::Unknown {
            return Err(TsfError::unknown_format(table, chunk_id, header.format_tag.clone()));
        }
        let data = decompress(table, chunk_id, &header, &raw[body_off..])?;
        Ok(Chunk {
            chunk_id,
            value_type,
            type_size: header.type_size,
            record_count: header.n as i64,
            data,
            cur_offset: 0,
            cur_byte: 0,
        })
    }

    /// Builds a chunk directly from already-decompressed bytes, used by the
    /// indirection resolver to collate a synthetic `Int32` chunk.
    pub fn synthetic(chunk_id: i64, value_type: ValueType, type_size: i16, record_count: i64, data: Vec<u8>) -> Chunk {
        Chunk {
            chunk_id,
            value_type,
            type_size,
            record_count,
            data,
            cur_offset: 0,
            cur_byte: 0,
        }
    }

    /// Size in bytes of the decompressed backing buffer, used to budget a
    /// cache of live chunks against a byte ceiling.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn check_bounds(&self, offset: i64) -> Result<()> {
        if offset < 0 || offset >= self.record_count {
            return Err(TsfError::out_of_range(offset, self.record_count));
        }
        Ok(())
    }

    /// Reads the logical element at `offset`, returning its typed view and
    /// whether it represents the missing-value sentinel. Array element types
    /// are never null (an empty array is represented by `size == 0`).
    pub fn value_at(&mut self, offset: i64) -> Result<(ValueView<'_>, bool)> {
        self.check_bounds(offset)?;
        let type_size = self.type_size as usize;
        match self.value_type {
            ValueType::Int32 => {
                let b = self.fixed_slice(offset as usize, 4);
                let v = i32::from_le_bytes(b.try_into().unwrap());
                Ok((ValueView::Int32(v), v == INT32_MISSING))
            }
            ValueType::Enum => {
                let b = self.fixed_slice(offset as usize, 4);
                let v = i32::from_le_bytes(b.try_into().unwrap());
                Ok((ValueView::Enum(v), v == INT32_MISSING))
            }
            ValueType::Int64 => {
                let b = self.fixed_slice(offset as usize, 8);
                let v = i64::from_le_bytes(b.try_into().unwrap());
                Ok((ValueView::Int64(v), v == INT64_MISSING))
            }
            ValueType::Float32 => {
                let b = self.fixed_slice(offset as usize, 4);
                let v = f32::from_le_bytes(b.try_into().unwrap());
                Ok((ValueView::Float32(v), v == FLOAT32_MISSING))
            }
            ValueType::Float64 => {
                let b = self.fixed_slice(offset as usize, 8);
                let v = f64::from_le_bytes(b.try_into().unwrap());
                Ok((ValueView::Float64(v), v == FLOAT64_MISSING))
            }
            ValueType::Bool => {
                let b = self.fixed_slice(offset as usize, 1);
                let v = b[0];
                Ok((ValueView::Bool(v != 0), v == BOOL_MISSING))
            }
            ValueType::String => {
                if type_size > 0 {
                    let b = self.fixed_slice(offset as usize, type_size);
                    let s = cstr_from_bytes(b);
                    let missing = crate::value::string_is_missing(s);
                    Ok((ValueView::Str(s), missing))
                } else {
                    let s = self.advance_to_null_delimited_string(offset)?;
                    let missing = crate::value::string_is_missing(s);
                    Ok((ValueView::Str(s), missing))
                }
            }
            ValueType::Int32Array => {
                let v = self.advance_to_fixed_array(offset, 4, true)?;
                Ok((ValueView::Int32Array(v), false))
            }
            ValueType::Float32Array => {
                let v = self.advance_to_fixed_array(offset, 4, true)?;
                Ok((ValueView::Float32Array(v), false))
            }
            ValueType::EnumArray => {
                let v = self.advance_to_fixed_array(offset, 4, true)?;
                Ok((ValueView::EnumArray(v), false))
            }
            ValueType::Float64Array => {
                let v = self.advance_to_fixed_array(offset, 8, false)?;
                Ok((ValueView::Float64Array(v), false))
            }
            ValueType::BoolArray => {
                let v = self.advance_to_fixed_array(offset, 1, false)?;
                Ok((ValueView::BoolArray(v), false))
            }
            ValueType::StringArray => {
                let v = self.advance_to_string_array(offset)?;
                Ok((ValueView::StringArray(v), false))
            }
            ValueType::Unknown => Err(TsfError::unknown_format("", self.chunk_id, "")),
        }
    }

    fn fixed_slice(&self, offset: usize, elem_size: usize) -> &[u8] {
        let start = offset * elem_size;
        &self.data[start..start + elem_size]
    }

    /// Amortized sequential access to a null-delimited string stream:
    /// advances forward from the cursor when `offset >= cur_offset`, or
    /// resets to the start and re-advances otherwise.
    fn advance_to_null_delimited_string(&mut self, offset: i64) -> Result<&str> {
        if self.cur_offset > offset {
            self.cur_offset = 0;
            self.cur_byte = 0;
        }
        while self.cur_offset < offset {
            let rest = &self.data[self.cur_byte..];
            let nul = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            self.cur_byte += nul + 1;
            self.cur_offset += 1;
        }
        let rest = &self.data[self.cur_byte..];
        let nul = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Ok(std::str::from_utf8(&rest[..nul]).unwrap_or(""))
    }

    fn advance_to_fixed_array(
        &mut self,
        offset: i64,
        elem_size: usize,
        padded: bool,
    ) -> Result<FixedArrayView<'_>> {
        if self.cur_offset > offset {
            self.cur_offset = 0;
            self.cur_byte = 0;
        }
        while self.cur_offset < offset {
            let size = self.read_u16(self.cur_byte) as usize;
            let header_skip = if padded { elem_size } else { 2 };
            self.cur_byte += header_skip + size * elem_size;
            self.cur_offset += 1;
        }
        let size = self.read_u16(self.cur_byte) as usize;
        let header_skip = if padded { elem_size } else { 2 };
        let payload_start = self.cur_byte + header_skip;
        let payload = &self.data[payload_start..payload_start + size * elem_size];
        Ok(FixedArrayView::new(size, payload, elem_size))
    }

    fn advance_to_string_array(&mut self, offset: i64) -> Result<StringArrayView<'_>> {
        if self.cur_offset > offset {
            self.cur_offset = 0;
            self.cur_byte = 0;
        }
        while self.cur_offset < offset {
            let size = self.read_u16(self.cur_byte) as usize;
            let mut pos = self.cur_byte + 2;
            for _ in 0..size {
                let rest = &self.data[pos..];
                let nul = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                pos += nul + 1;
            }
            self.cur_byte = pos;
            self.cur_offset += 1;
        }
        let size = self.read_u16(self.cur_byte) as usize;
        let payload = &self.data[self.cur_byte + 2..];
        Ok(StringArrayView::new(size, payload))
    }

    fn read_u16(&self, byte_offset: usize) -> u16 {
        u16::from_le_bytes([self.data[byte_offset], self.data[byte_offset + 1]])
    }
}

fn cstr_from_bytes(b: &[u8]) -> &str {
    let nul = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    std::str::from_utf8(&b[..nul]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_log::test;

    fn zlib_chunk(format_tag: &str, type_size: i16, n: i32, body: &[u8]) -> Vec<u8> {
        let mut compressed = Vec::new();
        let mut encoder = flate2::write::ZlibEncoder::new(&mut compressed, flate2::Compression::default());
        encoder.write_all(body).unwrap();
        encoder.finish().unwrap();

        let mut raw = Vec::with_capacity(HEADER_SIZE + 4 + compressed.len());
        raw.extend_from_slice(&MAGIC);
        raw.push(1u8); // low 2 bits = 1 (zlib)
        let mut tag = [0u8; 3];
        tag[..format_tag.len()].copy_from_slice(format_tag.as_bytes());
        raw.extend_from_slice(&tag);
        raw.extend_from_slice(&type_size.to_le_bytes());
        raw.extend_from_slice(&n.to_le_bytes());
        raw.extend_from_slice(&[0u8; 4]);
        raw.extend_from_slice(&(body.len() as u32).to_be_bytes());
        raw.extend_from_slice(&compressed);
        raw
    }

    #[test]
    fn parse_header_rejects_bad_magic() {
        let raw = vec![0u8; HEADER_SIZE];
        let err = parse_header("t", 0, &raw).unwrap_err();
        assert!(matches!(err, TsfError::CorruptHeader { .. }));
    }

    #[test]
    fn parse_header_rejects_short_buffer() {
        let err = parse_header("t", 0, &[0xFA, 0x01, 1]).unwrap_err();
        assert!(matches!(err, TsfError::CorruptHeader { .. }));
    }

    #[test]
    fn int32_chunk_reads_values_and_missing_sentinel() {
        let mut body = Vec::new();
        body.extend_from_slice(&10i32.to_le_bytes());
        body.extend_from_slice(&INT32_MISSING.to_le_bytes());
        body.extend_from_slice(&(-7i32).to_le_bytes());
        let raw = zlib_chunk("i4", 4, 3, &body);

        let mut chunk = Chunk::from_raw("t", 0, ValueType::Int32, &raw).unwrap();
        let (v, is_null) = chunk.value_at(0).unwrap();
        assert!(matches!(v, ValueView::Int32(10)));
        assert!(!is_null);

        let (_, is_null) = chunk.value_at(1).unwrap();
        assert!(is_null);

        let (v, is_null) = chunk.value_at(2).unwrap();
        assert!(matches!(v, ValueView::Int32(-7)));
        assert!(!is_null);
    }

    #[test]
    fn value_at_rejects_out_of_range_offset() {
        let body = 5i32.to_le_bytes();
        let raw = zlib_chunk("i4", 4, 1, &body);
        let mut chunk = Chunk::from_raw("t", 0, ValueType::Int32, &raw).unwrap();
        assert!(chunk.value_at(1).is_err());
        assert!(chunk.value_at(-1).is_err());
    }

    #[test]
    fn null_delimited_string_chunk_supports_forward_and_reset_reads() {
        let mut body = Vec::new();
        body.extend_from_slice(b"rs1\0");
        body.extend_from_slice(b"\0"); // missing, represented as empty string
        body.extend_from_slice(b"rs3\0");
        let raw = zlib_chunk("s", 0, 3, &body);

        let mut chunk = Chunk::from_raw("t", 0, ValueType::String, &raw).unwrap();
        let (v, is_null) = chunk.value_at(0).unwrap();
        assert!(matches!(v, ValueView::Str("rs1")));
        assert!(!is_null);

        let (_, is_null) = chunk.value_at(1).unwrap();
        assert!(is_null);

        let (v, is_null) = chunk.value_at(2).unwrap();
        assert!(matches!(v, ValueView::Str("rs3")));
        assert!(!is_null);

        // Seeking backwards resets the cursor instead of asserting.
        let (v, _) = chunk.value_at(0).unwrap();
        assert!(matches!(v, ValueView::Str("rs1")));
    }

    #[test]
    fn padded_int32_array_chunk_reads_variable_sized_elements() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&[0, 0]); // padding to 4 bytes
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&[0, 0]);
        let raw = zlib_chunk("@i4", 4, 2, &body);

        let mut chunk = Chunk::from_raw("t", 0, ValueType::Int32Array, &raw).unwrap();
        let (v, _) = chunk.value_at(0).unwrap();
        let ValueView::Int32Array(arr) = v else {
            panic!("expected Int32Array");
        };
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.get_i32(0), 1);
        assert_eq!(arr.get_i32(1), 2);

        let (v, _) = chunk.value_at(1).unwrap();
        let ValueView::Int32Array(arr) = v else {
            panic!("expected Int32Array");
        };
        assert!(arr.is_empty());
    }
}
