// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Byte-bounded LRU cache backed by a slab arena.
//!
//! Nodes live in a [`Slab`] and form a doubly-linked list through slot
//! indices (`head` = most recently used, `tail` = least recently used).
//! The index maps a [`Bytes`] handle that shares the node's own key buffer,
//! so keys are never duplicated. All operations are O(1) amortised; an
//! insert or enlarging update evicts entries from the tail until the new
//! data fits.

use std::collections::HashMap;

use bytes::Bytes;
use slab::Slab;

use crate::storage::{Storage, StorageError};

/// Sentinel slot index terminating the recency list.
const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: Bytes,
    value: Bytes,
    prev: usize,
    next: usize,
}

/// See the [`Storage`] contract for operation semantics. The structure is
/// single-writer and carries no locks of its own.
#[derive(Debug)]
pub struct LruStorage {
    max_size: usize,
    current_size: usize,
    head: usize,
    tail: usize,
    nodes: Slab<Node>,
    index: HashMap<Bytes, usize>,
}

impl LruStorage {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            head: NIL,
            tail: NIL,
            nodes: Slab::new(),
            index: HashMap::new(),
        }
    }

    /// Keys in MRU → LRU order. Only used by tests and diagnostics; the hot
    /// paths never walk the list.
    pub fn keys(&self) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut slot = self.head;
        while slot != NIL {
            let node = &self.nodes[slot];
            out.push(node.key.clone());
            slot = node.next;
        }
        out
    }

    fn check_size(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let size = key.len() + value.len();
        if size > self.max_size {
            return Err(StorageError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = &self.nodes[slot];
            (node.prev, node.next)
        };
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[slot];
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.nodes[old_head].prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
    }

    fn promote(&mut self, slot: usize) {
        if self.head != slot {
            self.unlink(slot);
            self.link_front(slot);
        }
    }

    /// Removes the LRU tail entry and returns the bytes it released.
    fn evict_tail(&mut self) -> usize {
        let slot = self.tail;
        self.unlink(slot);
        let node = self.nodes.remove(slot);
        self.index.remove(&node.key);
        let released = node.key.len() + node.value.len();
        self.current_size -= released;
        released
    }

    fn insert_new(&mut self, key: &[u8], value: &[u8]) {
        let need = key.len() + value.len();
        while self.current_size + need > self.max_size {
            self.evict_tail();
        }
        let node = Node {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
            prev: NIL,
            next: NIL,
        };
        let index_key = node.key.clone();
        let slot = self.nodes.insert(node);
        self.link_front(slot);
        self.index.insert(index_key, slot);
        self.current_size += need;
    }

    /// Replaces the value of an existing node. The node is promoted first so
    /// the eviction loop can never reach it: once its old value is
    /// discounted, the remaining need fits by the oversize precondition.
    fn update(&mut self, slot: usize, value: &[u8]) {
        self.promote(slot);
        self.current_size -= self.nodes[slot].value.len();
        while self.current_size + value.len() > self.max_size {
            debug_assert_ne!(self.tail, slot);
            self.evict_tail();
        }
        self.nodes[slot].value = Bytes::copy_from_slice(value);
        self.current_size += value.len();
    }
}

impl Storage for LruStorage {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.check_size(key, value)?;
        match self.index.get(key).copied() {
            Some(slot) => self.update(slot, value),
            None => self.insert_new(key, value),
        }
        Ok(())
    }

    fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.check_size(key, value)?;
        if self.index.contains_key(key) {
            return Err(StorageError::AlreadyExists);
        }
        self.insert_new(key, value);
        Ok(())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.check_size(key, value)?;
        match self.index.get(key).copied() {
            Some(slot) => {
                self.update(slot, value);
                Ok(())
            },
            None => Err(StorageError::NotFound),
        }
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        match self.index.remove(key) {
            Some(slot) => {
                self.unlink(slot);
                let node = self.nodes.remove(slot);
                self.current_size -= node.key.len() + node.value.len();
                Ok(())
            },
            None => Err(StorageError::NotFound),
        }
    }

    fn get(&mut self, key: &[u8]) -> Result<Bytes, StorageError> {
        match self.index.get(key).copied() {
            Some(slot) => {
                self.promote(slot);
                Ok(self.nodes[slot].value.clone())
            },
            None => Err(StorageError::NotFound),
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
        self.current_size = 0;
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn current_size(&self) -> usize {
        self.current_size
    }

    fn max_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of(store: &LruStorage) -> Vec<Vec<u8>> {
        store.keys().iter().map(|k| k.to_vec()).collect()
    }

    #[test]
    fn test_put_get_round_trip() {
        let mut store = LruStorage::new(1024);
        store.put(b"foo", b"bar").expect("put failed");
        assert_eq!(store.get(b"foo").expect("get failed"), Bytes::from_static(b"bar"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_size(), 6);
    }

    #[test]
    fn test_put_updates_existing_value() {
        let mut store = LruStorage::new(1024);
        store.put(b"foo", b"bar").expect("put failed");
        store.put(b"foo", b"bazz").expect("second put failed");
        assert_eq!(store.get(b"foo").expect("get failed"), Bytes::from_static(b"bazz"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_size(), 7);
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let mut store = LruStorage::new(5);
        let err = store.put(b"foo", b"bar").expect_err("must not fit");
        assert_eq!(err, StorageError::TooLarge { size: 6, max: 5 });
        assert_eq!(store.len(), 0);
        assert_eq!(store.current_size(), 0);
    }

    #[test]
    fn test_get_missing_key() {
        let mut store = LruStorage::new(64);
        assert_eq!(store.get(b"foo"), Err(StorageError::NotFound));
    }

    #[test]
    fn test_delete_then_get_fails() {
        let mut store = LruStorage::new(64);
        store.put(b"foo", b"bar").expect("put failed");
        store.delete(b"foo").expect("delete failed");
        assert_eq!(store.get(b"foo"), Err(StorageError::NotFound));
        assert_eq!(store.current_size(), 0);
    }

    #[test]
    fn test_delete_missing_key() {
        let mut store = LruStorage::new(64);
        assert_eq!(store.delete(b"foo"), Err(StorageError::NotFound));
    }

    #[test]
    fn test_put_if_absent_second_call_fails() {
        let mut store = LruStorage::new(64);
        store.put_if_absent(b"foo", b"bar").expect("first insert failed");
        assert_eq!(
            store.put_if_absent(b"foo", b"baz"),
            Err(StorageError::AlreadyExists)
        );
        assert_eq!(store.get(b"foo").expect("get failed"), Bytes::from_static(b"bar"));
    }

    #[test]
    fn test_set_requires_existing_key() {
        let mut store = LruStorage::new(64);
        assert_eq!(store.set(b"foo", b"bar"), Err(StorageError::NotFound));
        store.put(b"foo", b"bar").expect("put failed");
        store.set(b"foo", b"qux").expect("set failed");
        assert_eq!(store.get(b"foo").expect("get failed"), Bytes::from_static(b"qux"));
    }

    #[test]
    fn test_capacity_bound_holds_under_churn() {
        let mut store = LruStorage::new(100);
        for i in 0..50u32 {
            let key = format!("key{i}");
            let value = vec![b'v'; (i as usize % 13) + 1];
            store.put(key.as_bytes(), &value).expect("put failed");
            assert!(store.current_size() <= store.max_size());
        }
    }

    #[test]
    fn test_eviction_removes_lru_tail_first() {
        // Ten 10-byte entries fill the cache; the next insert evicts exactly
        // the least recently used one.
        let mut store = LruStorage::new(100);
        for i in 0..10u32 {
            let key = format!("k{i}");
            store.put(key.as_bytes(), b"12345678").expect("put failed");
        }
        assert_eq!(store.current_size(), 100);

        store.put(b"ka", b"12345678").expect("put failed");
        assert_eq!(store.current_size(), 100);
        assert_eq!(store.get(b"k0"), Err(StorageError::NotFound));
        assert!(store.get(b"k1").is_ok());
    }

    #[test]
    fn test_get_promotes_to_mru_head() {
        let mut store = LruStorage::new(30);
        store.put(b"a", b"111111111").expect("put failed");
        store.put(b"b", b"111111111").expect("put failed");
        store.put(b"c", b"111111111").expect("put failed");
        assert_eq!(keys_of(&store), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);

        // Touching `a` moves it to the head without reordering the others.
        store.get(b"a").expect("get failed");
        assert_eq!(keys_of(&store), vec![b"a".to_vec(), b"c".to_vec(), b"b".to_vec()]);

        // The next insert evicts `b`, now the tail.
        store.put(b"d", b"111111111").expect("put failed");
        assert_eq!(store.get(b"b"), Err(StorageError::NotFound));
        assert!(store.get(b"a").is_ok());
    }

    #[test]
    fn test_eviction_takes_exact_tail_prefix() {
        let mut store = LruStorage::new(30);
        store.put(b"a", b"111111111").expect("put failed");
        store.put(b"b", b"111111111").expect("put failed");
        store.put(b"c", b"111111111").expect("put failed");

        // A 20-byte entry must displace the two oldest entries, and only them.
        store.put(b"dd", b"111111111111111111").expect("put failed");
        assert_eq!(store.get(b"a"), Err(StorageError::NotFound));
        assert_eq!(store.get(b"b"), Err(StorageError::NotFound));
        assert!(store.get(b"c").is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_set_never_evicts_the_updated_node() {
        // Growing the only entry to full capacity must not evict it.
        let mut store = LruStorage::new(10);
        store.put(b"k", b"v").expect("put failed");
        store.set(b"k", b"123456789").expect("set failed");
        assert_eq!(
            store.get(b"k").expect("get failed"),
            Bytes::from_static(b"123456789")
        );
        assert_eq!(store.current_size(), 10);
    }

    #[test]
    fn test_set_enlargement_evicts_older_entries() {
        let mut store = LruStorage::new(20);
        store.put(b"a", b"1111").expect("put failed");
        store.put(b"b", b"1111").expect("put failed");
        store.put(b"c", b"1111").expect("put failed");
        // Growing `c` to 14 bytes forces `a` (the tail) out.
        store.set(b"c", b"1111111111111").expect("set failed");
        assert_eq!(store.get(b"a"), Err(StorageError::NotFound));
        assert!(store.get(b"b").is_ok());
        assert!(store.current_size() <= store.max_size());
    }

    #[test]
    fn test_clear_resets_accounting() {
        let mut store = LruStorage::new(64);
        store.put(b"foo", b"bar").expect("put failed");
        store.put(b"baz", b"qux").expect("put failed");
        store.clear();
        assert_eq!(store.len(), 0);
        assert_eq!(store.current_size(), 0);
        assert!(store.is_empty());
        store.put(b"foo", b"bar").expect("put after clear failed");
        assert_eq!(store.len(), 1);
    }
}
