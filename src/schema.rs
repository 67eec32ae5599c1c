// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! Schema collaborator: column/index/colgroup metadata, the row wire format,
//! memcomparable index-key encoding and JSON rendering.
//!
//! A row is a byte string: columns in schema order, fixed-length columns as
//! raw little-endian bytes, variable-length columns with a u32 length prefix.
//! Index keys are order-preserving byte strings so that key comparison is a
//! plain byte compare.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{StorageResult, TracedStorageError};
use crate::options::StorageOptions;

pub type ColumnId = usize;
pub type IndexId = usize;
pub type ColgroupId = usize;

/// Parsed row: raw value bytes per column, in schema order. Fixed columns
/// hold their little-endian representation, variable columns the payload.
pub type ColumnVec = Vec<Vec<u8>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
    Bytes,
}

impl ColumnType {
    /// Fixed byte width, or 0 for variable-length columns.
    pub fn fixed_len(self) -> usize {
        match self {
            ColumnType::Int8 => 1,
            ColumnType::Int16 => 2,
            ColumnType::Int32 => 4,
            ColumnType::Int64 => 8,
            ColumnType::Float32 => 4,
            ColumnType::Float64 => 8,
            ColumnType::Str | ColumnType::Bytes => 0,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::Int8 | ColumnType::Int16 | ColumnType::Int32 | ColumnType::Int64
        )
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || matches!(self, ColumnType::Float32 | ColumnType::Float64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawIndex {
    name: String,
    columns: Vec<String>,
    #[serde(default = "default_true")]
    ordered: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    enable_linear_scan: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawColgroup {
    name: String,
    columns: Vec<String>,
    #[serde(default)]
    dict_zip: bool,
}

/// `dbmeta.json` shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct DbMeta {
    columns: Vec<ColumnSchema>,
    indices: Vec<RawIndex>,
    #[serde(default)]
    colgroups: Vec<RawColgroup>,
    #[serde(default)]
    options: StorageOptions,
}

/// A compiled secondary index description.
#[derive(Clone, Debug)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<ColumnId>,
    pub ordered: bool,
    pub unique: bool,
    pub enable_linear_scan: bool,
    /// Fixed encoded-key width, 0 when any member column is variable-length.
    pub fixed_key_len: usize,
}

/// A compiled data column-group: columns stored together in one record store.
#[derive(Clone, Debug)]
pub struct ColgroupSchema {
    pub name: String,
    pub columns: Vec<ColumnId>,
    pub dict_zip: bool,
    /// Fixed record width, 0 when any member column is variable-length.
    pub fixed_len: usize,
}

/// The schema collaborator handed to the table engine. Column-group ids
/// `0..index_num` address the per-index key stores; `index_num..colgroup_num`
/// address the data column-groups.
pub struct SchemaConfig {
    meta: DbMeta,
    pub columns: Vec<ColumnSchema>,
    column_ids: HashMap<String, ColumnId>,
    pub indices: Vec<IndexSchema>,
    index_ids: HashMap<String, IndexId>,
    pub colgroups: Vec<ColgroupSchema>,
    pub uniq_indices: Vec<IndexId>,
    pub mult_indices: Vec<IndexId>,
    /// Data colgroups (global ids) with a fixed record width, eligible for
    /// in-place column updates.
    pub updatable_colgroups: Vec<ColgroupId>,
    /// Per column: owning data colgroup (local index) and position in it.
    col_to_cg: Vec<(usize, usize)>,
    pub options: StorageOptions,
}

pub const DBMETA_FILE_NAME: &str = "dbmeta.json";

impl SchemaConfig {
    pub fn load_json_file(path: impl AsRef<Path>) -> StorageResult<Arc<Self>> {
        let data = fs::read_to_string(path.as_ref())?;
        let meta: DbMeta = serde_json::from_str(&data)?;
        Ok(Arc::new(Self::compile(meta)?))
    }

    pub fn from_json(data: &str) -> StorageResult<Arc<Self>> {
        let meta: DbMeta = serde_json::from_str(data)?;
        Ok(Arc::new(Self::compile(meta)?))
    }

    pub fn save_json_file(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let data = serde_json::to_string_pretty(&self.meta)?;
        fs::write(path.as_ref(), data)?;
        Ok(())
    }

    fn compile(meta: DbMeta) -> StorageResult<Self> {
        if meta.columns.is_empty() {
            return Err(TracedStorageError::invalid_argument("schema has no columns"));
        }
        if meta.indices.is_empty() {
            return Err(TracedStorageError::invalid_argument("schema has no indices"));
        }
        let column_ids: HashMap<String, ColumnId> = meta
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        if column_ids.len() != meta.columns.len() {
            return Err(TracedStorageError::invalid_argument("duplicate column name"));
        }
        let resolve = |names: &[String]| -> StorageResult<Vec<ColumnId>> {
            names
                .iter()
                .map(|n| {
                    column_ids.get(n).copied().ok_or_else(|| {
                        TracedStorageError::invalid_argument(format!(
                            "colname = {} is not existed",
                            n
                        ))
                    })
                })
                .collect()
        };

        let mut indices = Vec::with_capacity(meta.indices.len());
        let mut index_ids = HashMap::new();
        for (i, raw) in meta.indices.iter().enumerate() {
            let columns = resolve(&raw.columns)?;
            let fixed_key_len = if columns
                .iter()
                .all(|&c| meta.columns[c].column_type.is_numeric())
            {
                columns.len() * 8
            } else {
                0
            };
            index_ids.insert(raw.name.clone(), i);
            indices.push(IndexSchema {
                name: raw.name.clone(),
                columns,
                ordered: raw.ordered,
                unique: raw.unique,
                enable_linear_scan: raw.enable_linear_scan,
                fixed_key_len,
            });
        }
        if index_ids.len() != indices.len() {
            return Err(TracedStorageError::invalid_argument("duplicate index name"));
        }

        let mut colgroups = Vec::new();
        let mut covered = vec![false; meta.columns.len()];
        for raw in &meta.colgroups {
            let columns = resolve(&raw.columns)?;
            for &c in &columns {
                if covered[c] {
                    return Err(TracedStorageError::invalid_argument(format!(
                        "column {} appears in more than one colgroup",
                        meta.columns[c].name
                    )));
                }
                covered[c] = true;
            }
            colgroups.push(make_colgroup(
                raw.name.clone(),
                columns,
                raw.dict_zip,
                &meta.columns,
            ));
        }
        let rest: Vec<ColumnId> = (0..meta.columns.len()).filter(|&c| !covered[c]).collect();
        if !rest.is_empty() {
            colgroups.push(make_colgroup("__default".into(), rest, false, &meta.columns));
        }

        let index_num = indices.len();
        let mut col_to_cg = vec![(0usize, 0usize); meta.columns.len()];
        for (cg_idx, cg) in colgroups.iter().enumerate() {
            for (pos, &c) in cg.columns.iter().enumerate() {
                col_to_cg[c] = (cg_idx, pos);
            }
        }
        let uniq_indices = (0..index_num).filter(|&i| indices[i].unique).collect();
        let mult_indices = (0..index_num).filter(|&i| !indices[i].unique).collect();
        let updatable_colgroups = colgroups
            .iter()
            .enumerate()
            .filter(|(_, cg)| cg.fixed_len > 0)
            .map(|(i, _)| index_num + i)
            .collect();

        Ok(Self {
            columns: meta.columns.clone(),
            column_ids,
            indices,
            index_ids,
            colgroups,
            uniq_indices,
            mult_indices,
            updatable_colgroups,
            col_to_cg,
            options: meta.options.clone(),
            meta,
        })
    }

    pub fn column_num(&self) -> usize {
        self.columns.len()
    }

    pub fn index_num(&self) -> usize {
        self.indices.len()
    }

    /// Total colgroup count: per-index key stores followed by data colgroups.
    pub fn colgroup_num(&self) -> usize {
        self.indices.len() + self.colgroups.len()
    }

    pub fn data_colgroup_num(&self) -> usize {
        self.colgroups.len()
    }

    pub fn get_column_id(&self, name: &str) -> StorageResult<ColumnId> {
        self.column_ids.get(name).copied().ok_or_else(|| {
            TracedStorageError::invalid_argument(format!("colname = {} is not existed", name))
        })
    }

    pub fn get_index_id(&self, name: &str) -> StorageResult<IndexId> {
        self.index_ids.get(name).copied().ok_or_else(|| {
            TracedStorageError::invalid_argument(format!("index: {} not exists", name))
        })
    }

    pub fn get_index_schema(&self, index_id: IndexId) -> &IndexSchema {
        &self.indices[index_id]
    }

    /// Data colgroup addressed by its local index (global id minus
    /// `index_num`).
    pub fn data_colgroup(&self, cg_idx: usize) -> &ColgroupSchema {
        &self.colgroups[cg_idx]
    }

    /// Owning data colgroup (local index) and member position of a column.
    pub fn column_colgroup(&self, col_id: ColumnId) -> (usize, usize) {
        self.col_to_cg[col_id]
    }

    /// Byte offset of a column inside its fixed-length colgroup record.
    pub fn column_offset_in_colgroup(&self, col_id: ColumnId) -> StorageResult<usize> {
        let (cg_idx, pos) = self.col_to_cg[col_id];
        let cg = &self.colgroups[cg_idx];
        if cg.fixed_len == 0 {
            return Err(TracedStorageError::invalid_argument(format!(
                "column {} lives in variable-length colgroup {}",
                self.columns[col_id].name, cg.name
            )));
        }
        Ok(cg.columns[..pos]
            .iter()
            .map(|&c| self.columns[c].column_type.fixed_len())
            .sum())
    }

    // ------------------------------------------------------------------
    // Row codec
    // ------------------------------------------------------------------

    pub fn parse_row(&self, row: &[u8]) -> StorageResult<ColumnVec> {
        let mut buf = row;
        let mut cols = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let fixed = col.column_type.fixed_len();
            let len = if fixed > 0 {
                fixed
            } else {
                if buf.remaining() < 4 {
                    return Err(TracedStorageError::decode(format!(
                        "row truncated at column {}",
                        col.name
                    )));
                }
                buf.get_u32_le() as usize
            };
            if buf.remaining() < len {
                return Err(TracedStorageError::decode(format!(
                    "row truncated at column {}",
                    col.name
                )));
            }
            cols.push(buf[..len].to_vec());
            buf.advance(len);
        }
        if buf.has_remaining() {
            return Err(TracedStorageError::decode("trailing bytes after last column"));
        }
        Ok(cols)
    }

    pub fn assemble_row(&self, cols: &ColumnVec) -> Vec<u8> {
        let mut out = Vec::new();
        for (col, value) in self.columns.iter().zip(cols) {
            if col.column_type.fixed_len() == 0 {
                out.put_u32_le(value.len() as u32);
            }
            out.extend_from_slice(value);
        }
        out
    }

    /// Projection of a data colgroup: member columns in colgroup order, fixed
    /// columns raw, variable columns u32-length-prefixed.
    pub fn colgroup_project(&self, cg_idx: usize, cols: &ColumnVec) -> Vec<u8> {
        let cg = &self.colgroups[cg_idx];
        let mut out = Vec::new();
        for &c in &cg.columns {
            let value = &cols[c];
            if self.columns[c].column_type.fixed_len() == 0 {
                out.put_u32_le(value.len() as u32);
            }
            out.extend_from_slice(value);
        }
        out
    }

    pub fn decode_colgroup(&self, cg_idx: usize, record: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
        let cg = &self.colgroups[cg_idx];
        let mut buf = record;
        let mut values = Vec::with_capacity(cg.columns.len());
        for &c in &cg.columns {
            let fixed = self.columns[c].column_type.fixed_len();
            let len = if fixed > 0 {
                fixed
            } else {
                if buf.remaining() < 4 {
                    return Err(TracedStorageError::decode(format!(
                        "colgroup {} record truncated",
                        cg.name
                    )));
                }
                buf.get_u32_le() as usize
            };
            if buf.remaining() < len {
                return Err(TracedStorageError::decode(format!(
                    "colgroup {} record truncated",
                    cg.name
                )));
            }
            values.push(buf[..len].to_vec());
            buf.advance(len);
        }
        Ok(values)
    }

    // ------------------------------------------------------------------
    // Index keys
    // ------------------------------------------------------------------

    /// Build the memcomparable key of an index from a parsed row.
    pub fn select_index_key(&self, index_id: IndexId, cols: &ColumnVec) -> Vec<u8> {
        let schema = &self.indices[index_id];
        let mut key = Vec::new();
        for &c in &schema.columns {
            encode_key_component(self.columns[c].column_type, &cols[c], &mut key);
        }
        key
    }

    /// Keys are order-preserving byte strings; comparison is a byte compare.
    pub fn compare_data(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        a.cmp(b)
    }

    /// Render an encoded index key as JSON for diagnostics.
    pub fn index_key_json(&self, index_id: IndexId, key: &[u8]) -> String {
        let schema = &self.indices[index_id];
        let mut buf = key;
        let mut parts = Vec::with_capacity(schema.columns.len());
        for &c in &schema.columns {
            match decode_key_component(self.columns[c].column_type, &mut buf) {
                Some(v) => parts.push(v),
                None => parts.push(serde_json::Value::Null),
            }
        }
        let value = if parts.len() == 1 {
            parts.pop().unwrap()
        } else {
            serde_json::Value::Array(parts)
        };
        value.to_string()
    }

    // ------------------------------------------------------------------
    // JSON rendering & numeric column access
    // ------------------------------------------------------------------

    pub fn row_to_json(&self, row: &[u8]) -> StorageResult<String> {
        let cols = self.parse_row(row)?;
        let mut obj = serde_json::Map::new();
        for (schema, value) in self.columns.iter().zip(&cols) {
            obj.insert(schema.name.clone(), column_value_json(schema.column_type, value));
        }
        Ok(serde_json::Value::Object(obj).to_string())
    }

    pub fn column_as_i64(&self, col_id: ColumnId, raw: &[u8]) -> StorageResult<i64> {
        let ty = self.columns[col_id].column_type;
        decode_numeric(ty, raw)
            .map(|v| v as i64)
            .ok_or_else(|| self.bad_column_type(col_id))
    }

    pub fn column_as_f64(&self, col_id: ColumnId, raw: &[u8]) -> StorageResult<f64> {
        let ty = self.columns[col_id].column_type;
        decode_numeric(ty, raw).ok_or_else(|| self.bad_column_type(col_id))
    }

    pub fn encode_column_i64(&self, col_id: ColumnId, v: i64) -> StorageResult<Vec<u8>> {
        let ty = self.columns[col_id].column_type;
        encode_numeric(ty, v as f64, v).ok_or_else(|| self.bad_column_type(col_id))
    }

    pub fn encode_column_f64(&self, col_id: ColumnId, v: f64) -> StorageResult<Vec<u8>> {
        let ty = self.columns[col_id].column_type;
        encode_numeric(ty, v, v as i64).ok_or_else(|| self.bad_column_type(col_id))
    }

    fn bad_column_type(&self, col_id: ColumnId) -> TracedStorageError {
        TracedStorageError::invalid_argument(format!(
            "Invalid column(id={}, name={}) which columnType={:?}",
            col_id, self.columns[col_id].name, self.columns[col_id].column_type
        ))
    }
}

fn make_colgroup(
    name: String,
    columns: Vec<ColumnId>,
    dict_zip: bool,
    all: &[ColumnSchema],
) -> ColgroupSchema {
    let fixed_len = if columns
        .iter()
        .all(|&c| all[c].column_type.fixed_len() > 0)
    {
        columns.iter().map(|&c| all[c].column_type.fixed_len()).sum()
    } else {
        0
    };
    ColgroupSchema {
        name,
        columns,
        dict_zip,
        fixed_len,
    }
}

// ----------------------------------------------------------------------
// Memcomparable key components
// ----------------------------------------------------------------------

fn widen_int(ty: ColumnType, raw: &[u8]) -> Option<i64> {
    Some(match ty {
        ColumnType::Int8 => i8::from_le_bytes(raw.try_into().ok()?) as i64,
        ColumnType::Int16 => i16::from_le_bytes(raw.try_into().ok()?) as i64,
        ColumnType::Int32 => i32::from_le_bytes(raw.try_into().ok()?) as i64,
        ColumnType::Int64 => i64::from_le_bytes(raw.try_into().ok()?),
        _ => return None,
    })
}

fn decode_numeric(ty: ColumnType, raw: &[u8]) -> Option<f64> {
    match ty {
        ColumnType::Float32 => Some(f32::from_le_bytes(raw.try_into().ok()?) as f64),
        ColumnType::Float64 => Some(f64::from_le_bytes(raw.try_into().ok()?)),
        _ => widen_int(ty, raw).map(|v| v as f64),
    }
}

fn encode_numeric(ty: ColumnType, f: f64, i: i64) -> Option<Vec<u8>> {
    Some(match ty {
        ColumnType::Int8 => (i as i8).to_le_bytes().to_vec(),
        ColumnType::Int16 => (i as i16).to_le_bytes().to_vec(),
        ColumnType::Int32 => (i as i32).to_le_bytes().to_vec(),
        ColumnType::Int64 => i.to_le_bytes().to_vec(),
        ColumnType::Float32 => (f as f32).to_le_bytes().to_vec(),
        ColumnType::Float64 => f.to_le_bytes().to_vec(),
        _ => return None,
    })
}

/// Integers are widened to 64 bits and stored big-endian with the sign bit
/// flipped; floats get the usual IEEE rotation; byte strings are 0x00-escaped
/// and 0x00 0x00-terminated so components stay prefix-free.
pub fn encode_key_component(ty: ColumnType, raw: &[u8], out: &mut Vec<u8>) {
    match ty {
        ColumnType::Float32 | ColumnType::Float64 => {
            let v = decode_numeric(ty, raw).unwrap_or(0.0);
            let bits = v.to_bits();
            let ordered = if bits & (1 << 63) != 0 {
                !bits
            } else {
                bits | (1 << 63)
            };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        ColumnType::Str | ColumnType::Bytes => {
            for &b in raw {
                if b == 0x00 {
                    out.extend_from_slice(&[0x00, 0xFF]);
                } else {
                    out.push(b);
                }
            }
            out.extend_from_slice(&[0x00, 0x00]);
        }
        _ => {
            let v = widen_int(ty, raw).unwrap_or(0);
            let unsigned = (v as u64) ^ (1 << 63);
            out.extend_from_slice(&unsigned.to_be_bytes());
        }
    }
}

fn decode_key_component(ty: ColumnType, buf: &mut &[u8]) -> Option<serde_json::Value> {
    match ty {
        ColumnType::Float32 | ColumnType::Float64 => {
            if buf.len() < 8 {
                return None;
            }
            let ordered = u64::from_be_bytes(buf[..8].try_into().unwrap());
            buf.advance(8);
            let bits = if ordered & (1 << 63) != 0 {
                ordered & !(1 << 63)
            } else {
                !ordered
            };
            serde_json::Number::from_f64(f64::from_bits(bits)).map(serde_json::Value::Number)
        }
        ColumnType::Str | ColumnType::Bytes => {
            let mut bytes = Vec::new();
            let mut i = 0;
            let mut consumed = buf.len();
            while i < buf.len() {
                if buf[i] == 0x00 {
                    if buf.get(i + 1) == Some(&0xFF) {
                        bytes.push(0x00);
                        i += 2;
                        continue;
                    }
                    consumed = (i + 2).min(buf.len()); // terminator
                    break;
                }
                bytes.push(buf[i]);
                i += 1;
            }
            buf.advance(consumed);
            Some(match ty {
                ColumnType::Str => serde_json::Value::String(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ),
                _ => serde_json::Value::String(
                    bytes.iter().map(|b| format!("{:02x}", b)).collect(),
                ),
            })
        }
        _ => {
            if buf.len() < 8 {
                return None;
            }
            let unsigned = u64::from_be_bytes(buf[..8].try_into().unwrap());
            buf.advance(8);
            Some(serde_json::Value::from((unsigned ^ (1 << 63)) as i64))
        }
    }
}

fn column_value_json(ty: ColumnType, raw: &[u8]) -> serde_json::Value {
    match ty {
        ColumnType::Str => serde_json::Value::String(String::from_utf8_lossy(raw).into_owned()),
        ColumnType::Bytes => {
            serde_json::Value::String(raw.iter().map(|b| format!("{:02x}", b)).collect())
        }
        ColumnType::Float32 | ColumnType::Float64 => decode_numeric(ty, raw)
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        _ => widen_int(ty, raw)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
    }
}

/// Builds a row in the wire format, validating column order and types.
pub struct RowBuilder<'a> {
    schema: &'a SchemaConfig,
    next_col: usize,
    buf: Vec<u8>,
}

impl<'a> RowBuilder<'a> {
    pub fn new(schema: &'a SchemaConfig) -> Self {
        Self {
            schema,
            next_col: 0,
            buf: Vec::new(),
        }
    }

    fn push_raw(&mut self, expect: ColumnType, raw: &[u8]) -> &mut Self {
        let col = &self.schema.columns[self.next_col];
        assert_eq!(
            col.column_type, expect,
            "column {} has type {:?}",
            col.name, col.column_type
        );
        if expect.fixed_len() == 0 {
            self.buf.put_u32_le(raw.len() as u32);
        }
        self.buf.extend_from_slice(raw);
        self.next_col += 1;
        self
    }

    pub fn push_i8(&mut self, v: i8) -> &mut Self {
        self.push_raw(ColumnType::Int8, &v.to_le_bytes())
    }

    pub fn push_i16(&mut self, v: i16) -> &mut Self {
        self.push_raw(ColumnType::Int16, &v.to_le_bytes())
    }

    pub fn push_i32(&mut self, v: i32) -> &mut Self {
        self.push_raw(ColumnType::Int32, &v.to_le_bytes())
    }

    pub fn push_i64(&mut self, v: i64) -> &mut Self {
        self.push_raw(ColumnType::Int64, &v.to_le_bytes())
    }

    pub fn push_f32(&mut self, v: f32) -> &mut Self {
        self.push_raw(ColumnType::Float32, &v.to_le_bytes())
    }

    pub fn push_f64(&mut self, v: f64) -> &mut Self {
        self.push_raw(ColumnType::Float64, &v.to_le_bytes())
    }

    pub fn push_str(&mut self, v: &str) -> &mut Self {
        self.push_raw(ColumnType::Str, v.as_bytes())
    }

    pub fn push_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.push_raw(ColumnType::Bytes, v)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        assert_eq!(
            self.next_col,
            self.schema.columns.len(),
            "row is missing columns"
        );
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn sample_schema() -> Arc<SchemaConfig> {
        SchemaConfig::from_json(
            r#"{
                "columns": [
                    {"name": "id", "type": "int32"},
                    {"name": "score", "type": "float64"},
                    {"name": "name", "type": "str"}
                ],
                "indices": [
                    {"name": "id_idx", "columns": ["id"], "ordered": true, "unique": true},
                    {"name": "name_idx", "columns": ["name"], "ordered": true}
                ],
                "colgroups": [
                    {"name": "nums", "columns": ["id", "score"]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_row_round_trip() {
        let schema = sample_schema();
        let row = RowBuilder::new(&schema)
            .push_i32(42)
            .push_f64(0.5)
            .push_str("hello")
            .finish();
        let cols = schema.parse_row(&row).unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[2], b"hello");
        assert_eq!(schema.assemble_row(&cols), row);
    }

    #[test]
    fn test_colgroup_layout() {
        let schema = sample_schema();
        // nums colgroup is fixed (4 + 8), __default holds the str column.
        assert_eq!(schema.data_colgroup_num(), 2);
        assert_eq!(schema.colgroups[0].fixed_len, 12);
        assert_eq!(schema.colgroups[1].fixed_len, 0);
        assert_eq!(schema.updatable_colgroups, vec![schema.index_num()]);
        assert_eq!(schema.column_offset_in_colgroup(1).unwrap(), 4);
    }

    #[test]
    fn test_colgroup_record_round_trip() {
        let schema = sample_schema();
        let row = RowBuilder::new(&schema)
            .push_i32(7)
            .push_f64(-2.5)
            .push_str("x")
            .finish();
        let cols = schema.parse_row(&row).unwrap();
        for cg_idx in 0..schema.data_colgroup_num() {
            let record = schema.colgroup_project(cg_idx, &cols);
            let values = schema.decode_colgroup(cg_idx, &record).unwrap();
            for (pos, &c) in schema.colgroups[cg_idx].columns.iter().enumerate() {
                assert_eq!(values[pos], cols[c]);
            }
        }
    }

    #[test]
    fn test_key_order() {
        let schema = sample_schema();
        let key_of = |v: i32| {
            let row = RowBuilder::new(&schema)
                .push_i32(v)
                .push_f64(0.0)
                .push_str("")
                .finish();
            schema.select_index_key(0, &schema.parse_row(&row).unwrap())
        };
        assert!(key_of(-5) < key_of(-1));
        assert!(key_of(-1) < key_of(0));
        assert!(key_of(0) < key_of(7));
        assert_eq!(schema.index_key_json(0, &key_of(7)), "7");
    }

    #[test]
    fn test_str_key_escaping() {
        let a = {
            let mut out = Vec::new();
            encode_key_component(ColumnType::Str, b"a\x00b", &mut out);
            out
        };
        let b = {
            let mut out = Vec::new();
            encode_key_component(ColumnType::Str, b"a", &mut out);
            out
        };
        // "a" terminates before "a\0b" continues.
        assert!(b < a);
    }

    #[test]
    fn test_row_json() {
        let schema = sample_schema();
        let row = RowBuilder::new(&schema)
            .push_i32(1)
            .push_f64(2.0)
            .push_str("n")
            .finish();
        let json = schema.row_to_json(&row).unwrap();
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"name\":\"n\""));
    }
}
