// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

#![feature(error_generic_member_access)]

//! Composite, segment-oriented table engine.
//!
//! Rows live in an ordered array of segments addressed by a dense 64-bit
//! logical id. Only the tail segment accepts writes; older segments are
//! frozen, flushed, converted to an encoded read-only form, and eventually
//! merged (optionally purging tombstoned rows) by a background pipeline
//! owned by the table. Secondary indexes are maintained synchronously on the
//! write path and searchable across all segments, with an ordered k-way
//! iterator for range scans.
//!
//! ```no_run
//! use segstore::{SegmentedTable, RowBuilder};
//!
//! # fn main() -> segstore::StorageResult<()> {
//! let meta = r#"{
//!     "columns": [
//!         {"name": "id", "type": "int64"},
//!         {"name": "name", "type": "str"}
//!     ],
//!     "indices": [
//!         {"name": "id_idx", "columns": ["id"], "ordered": true, "unique": true}
//!     ]
//! }"#;
//! let table = SegmentedTable::create("/tmp/demo-table", meta)?;
//! let mut ctx = table.new_context();
//! let row = RowBuilder::new(table.schema())
//!     .push_i64(1)
//!     .push_str("first")
//!     .finish();
//! let id = table.insert_row(&row, &mut ctx)?;
//! assert!(table.exists(id));
//! # Ok(())
//! # }
//! ```

// public modules and structures
mod context;
mod error;
mod index_iter;
mod options;
mod scan_iter;
mod schema;
mod table;

// internal modules and structures
mod index_store;
mod layout;
mod merge;
mod pipeline;
mod purge_bits;
mod segment;
mod store;
mod txn;

pub use context::TableContext;
pub use error::{StorageError, StorageResult, TracedStorageError};
pub use index_iter::{IndexEntry, TableIndexIter};
pub use options::{StorageOptions, COMPRESSION_THREADS_ENV};
pub use purge_bits::PurgeBits;
pub use scan_iter::TableScanIter;
pub use schema::{
    ColgroupId, ColgroupSchema, ColumnId, ColumnSchema, ColumnType, ColumnVec, IndexId,
    IndexSchema, RowBuilder, SchemaConfig, DBMETA_FILE_NAME,
};
pub use segment::Segment;
pub use table::{SegmentStat, SegmentedTable};
