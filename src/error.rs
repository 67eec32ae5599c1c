// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("duplicate key {key} (logic id = {logic_id}) in segment: {seg_dir}")]
    DupKey {
        key: String,
        seg_dir: String,
        logic_id: i64,
    },
    #[error("{op}: failed to read record, baseId={base_id}, subId={sub_id}, seg = {seg_dir}")]
    ReadRecord {
        op: &'static str,
        seg_dir: String,
        base_id: i64,
        sub_id: i64,
    },
    #[error("commit failed: {0}, caller should retry")]
    Commit(String),
    #[error("{0}")]
    LogicError(String),
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<std::io::Error> for TracedStorageError {
    #[inline]
    fn from(e: std::io::Error) -> TracedStorageError {
        StorageError::Io(e.into()).into()
    }
}

impl From<serde_json::Error> for TracedStorageError {
    #[inline]
    fn from(e: serde_json::Error) -> TracedStorageError {
        StorageError::JsonDecode(e).into()
    }
}

/// [`StorageError`] with backtrace.
#[derive(Error)]
#[error("{source:?}\n{backtrace}")]
pub struct TracedStorageError {
    #[from]
    source: StorageError,
    backtrace: Backtrace,
}

impl std::fmt::Debug for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl TracedStorageError {
    pub fn invalid_argument(message: impl ToString) -> Self {
        StorageError::InvalidArgument(message.to_string()).into()
    }

    pub fn dup_key(key: impl ToString, seg_dir: impl ToString, logic_id: i64) -> Self {
        StorageError::DupKey {
            key: key.to_string(),
            seg_dir: seg_dir.to_string(),
            logic_id,
        }
        .into()
    }

    pub fn read_record(
        op: &'static str,
        seg_dir: impl ToString,
        base_id: i64,
        sub_id: i64,
    ) -> Self {
        StorageError::ReadRecord {
            op,
            seg_dir: seg_dir.to_string(),
            base_id,
            sub_id,
        }
        .into()
    }

    pub fn commit(message: impl ToString) -> Self {
        StorageError::Commit(message.to_string()).into()
    }

    pub fn logic_error(message: impl ToString) -> Self {
        StorageError::LogicError(message.to_string()).into()
    }

    pub fn decode(message: impl ToString) -> Self {
        StorageError::Decode(message.to_string()).into()
    }

    pub fn kind(&self) -> &StorageError {
        &self.source
    }
}

pub type StorageResult<T> = std::result::Result<T, TracedStorageError>;
