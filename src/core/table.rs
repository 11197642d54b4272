//! Sparse handle table with stable indices
//!
//! Rows live in a `Vec<Option<T>>`; erased rows push their index onto a free
//! list and are reused by later inserts. Indices stay stable for the lifetime
//! of a row, so handles can be stored by callers instead of references.

use std::marker::PhantomData;

use crate::core::types::TableKey;

/// Arena of rows addressed by typed handles
#[derive(Debug, Clone)]
pub struct HandleTable<K, T> {
    rows: Vec<Option<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: TableKey, T> Default for HandleTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TableKey, T> HandleTable<K, T> {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    /// Insert a row, reusing a freed index when one is available
    pub fn insert(&mut self, value: T) -> K {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            self.rows[index as usize] = Some(value);
            return K::from_index(index);
        }

        let index = self.rows.len() as u32;
        self.rows.push(Some(value));
        K::from_index(index)
    }

    /// Remove a row in O(1). Returns `None` for stale or unknown handles.
    pub fn remove(&mut self, key: K) -> Option<T> {
        let slot = self.rows.get_mut(key.index() as usize)?;
        let value = slot.take()?;
        self.free.push(key.index());
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: K) -> Option<&T> {
        self.rows.get(key.index() as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.rows.get_mut(key.index() as usize)?.as_mut()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate live rows in index order
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(index, row)| row.as_ref().map(|value| (K::from_index(index as u32), value)))
    }

    /// Handles of all live rows
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(key, _)| key).collect()
    }
}
