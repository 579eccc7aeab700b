// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod lru;

use bytes::Bytes;
use thiserror::Error;

pub use crate::storage::lru::LruStorage;

/// Why a storage operation was rejected. Every variant maps onto one wire
/// reply code in the command layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// `len(key) + len(value)` exceeds the cache capacity; nothing is stored
    /// and nothing is evicted.
    #[error("entry of {size} bytes exceeds cache capacity of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("key is not present in the cache")]
    NotFound,

    #[error("key is already present in the cache")]
    AlreadyExists,
}

/// A capacity-bounded key/value store with most-recently-used ordering.
///
/// Implementations are single-writer: there is no internal locking, and
/// callers that share a storage across threads must serialise access
/// themselves (the multi-threaded server wraps the storage in a mutex).
pub trait Storage {
    /// Inserts `key` or, when it already exists, updates its value in place.
    /// The affected entry ends up at the MRU head.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Inserts `key` only when it is absent.
    fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Updates the value of an existing `key`; fails with [`StorageError::NotFound`]
    /// when the key is absent.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Removes `key`. Does not touch the recency of other entries.
    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// Reads the current value and promotes the entry to the MRU head.
    fn get(&mut self, key: &[u8]) -> Result<Bytes, StorageError>;

    /// Drops every entry and resets the byte accounting.
    fn clear(&mut self);

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of `len(key) + len(value)` over live entries.
    fn current_size(&self) -> usize;

    /// Capacity bound in bytes.
    fn max_size(&self) -> usize;
}
