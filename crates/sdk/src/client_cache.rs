//! A local mirror of the subscribed rows of the database.
//!
//! Each table's cache maps a row's [`RowKey`] to the row and a reference
//! count: the number of active subscription result sets the row currently
//! appears in. A row is resident iff its count is at least one, so a row
//! shared by overlapping queries produces exactly one `insert` callback when
//! it first becomes visible and exactly one `delete` callback when the last
//! query containing it goes away.
//!
//! Applying a batch mutates the cache synchronously but does *not* invoke
//! callbacks; it returns them as `PendingRowCallback`s. The dispatcher fires
//! them only after the enclosing server message's subscription state
//! transitions have been applied, so callbacks always observe the
//! post-transaction cache.

use crate::module::{IndexRuntimeInfo, ModuleDef, TableRuntimeInfo};
use spacetimedb_sats::{AlgebraicValue, ProductValue, RowKey};
use std::collections::HashMap;
use std::sync::Arc;

/// One row change within a server-delivered batch.
#[derive(Clone, Debug)]
pub(crate) struct RowOp {
    pub(crate) kind: RowOpKind,
    pub(crate) key: RowKey,
    pub(crate) row: ProductValue,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum RowOpKind {
    Insert,
    Delete,
}

/// A row callback staged during `TableCache::apply_operations`.
#[derive(Clone, Debug)]
pub(crate) enum RowCallback {
    Insert(ProductValue),
    Delete(ProductValue),
    Update { old: ProductValue, new: ProductValue },
}

/// A staged callback plus the table it belongs to.
#[derive(Clone, Debug)]
pub(crate) struct PendingRowCallback {
    pub(crate) table_name: Box<str>,
    pub(crate) callback: RowCallback,
}

struct CachedRow {
    row: ProductValue,
    /// The number of active subscription result sets containing this row.
    /// Always at least one; a row that would drop to zero is removed.
    ref_count: usize,
}

/// The cache of one table's subscribed rows.
pub(crate) struct TableCache {
    info: Arc<TableRuntimeInfo>,
    entries: HashMap<RowKey, CachedRow>,
}

impl TableCache {
    fn new(info: Arc<TableRuntimeInfo>) -> Self {
        TableCache {
            info,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    /// Snapshots of all resident rows.
    ///
    /// Rows are cloned out because user iteration must not hold the cache
    /// lock.
    pub(crate) fn values(&self) -> Vec<ProductValue> {
        self.entries.values().map(|cached| cached.row.clone()).collect()
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self, key: &RowKey) -> Option<usize> {
        self.entries.get(key).map(|cached| cached.ref_count)
    }

    /// Apply a server-delivered batch of operations, staging callbacks into
    /// `callbacks`.
    ///
    /// For a table with a primary key, an insert and a delete of the same key
    /// within one batch are a single logical update, and the batch is
    /// partitioned into per-key insert and delete multisets so the pairing
    /// sees every duplicate the server sent. Without a primary key the
    /// operations apply one at a time.
    pub(crate) fn apply_operations(&mut self, ops: Vec<RowOp>, callbacks: &mut Vec<PendingRowCallback>) {
        if self.info.has_primary_key() {
            self.apply_with_primary_key(ops, callbacks);
        } else {
            for op in ops {
                match op.kind {
                    RowOpKind::Insert => self.insert(op.key, op.row, 1, callbacks),
                    RowOpKind::Delete => self.delete(op.key, op.row, 1, callbacks),
                }
            }
        }
    }

    fn apply_with_primary_key(&mut self, ops: Vec<RowOp>, callbacks: &mut Vec<PendingRowCallback>) {
        let mut inserts: HashMap<RowKey, (ProductValue, usize)> = HashMap::with_capacity(ops.len());
        let mut deletes: HashMap<RowKey, (ProductValue, usize)> = HashMap::with_capacity(ops.len());

        // The same key may appear several times on either side when the row
        // is in multiple overlapping query result sets of one transaction;
        // the multiplicity is the reference-count contribution.
        for op in ops {
            let map = match op.kind {
                RowOpKind::Insert => &mut inserts,
                RowOpKind::Delete => &mut deletes,
            };
            map.entry(op.key)
                .and_modify(|(_, count)| *count += 1)
                .or_insert((op.row, 1));
        }

        for (key, (new_row, insert_count)) in inserts {
            match deletes.remove(&key) {
                Some((_, delete_count)) => {
                    let ref_count_delta = insert_count as isize - delete_count as isize;
                    self.update(key, new_row, ref_count_delta, callbacks);
                }
                None => self.insert(key, new_row, insert_count, callbacks),
            }
        }

        for (key, (old_row, delete_count)) in deletes {
            self.delete(key, old_row, delete_count, callbacks);
        }
    }

    /// Make `key` visible to `n` more result sets.
    ///
    /// Only stages a callback when the row was not previously resident; a row
    /// entering another overlapping query's result set is already visible to
    /// the user.
    fn insert(&mut self, key: RowKey, row: ProductValue, n: usize, callbacks: &mut Vec<PendingRowCallback>) {
        match self.entries.get_mut(&key) {
            Some(cached) => cached.ref_count += n,
            None => {
                callbacks.push(PendingRowCallback {
                    table_name: self.info.table_name.clone(),
                    callback: RowCallback::Insert(row.clone()),
                });
                self.entries.insert(key, CachedRow { row, ref_count: n });
            }
        }
    }

    /// Remove `key` from `n` result sets, evicting the row and staging a
    /// `delete` callback when no result set contains it anymore.
    fn delete(&mut self, key: RowKey, _row: ProductValue, n: usize, callbacks: &mut Vec<PendingRowCallback>) {
        match self.entries.remove(&key) {
            Some(cached) if cached.ref_count <= n => {
                callbacks.push(PendingRowCallback {
                    table_name: self.info.table_name.clone(),
                    callback: RowCallback::Delete(cached.row),
                });
            }
            Some(mut cached) => {
                cached.ref_count -= n;
                self.entries.insert(key, cached);
            }
            None => {
                log::warn!(
                    "Received delete for table {} row we weren't subscribed to",
                    self.info.table_name
                );
            }
        }
    }

    /// Replace the resident row for `key` with `new_row`, staging an `update`
    /// callback. `ref_count_delta` is the net change in result-set
    /// membership, clamped so the count never drops below one.
    fn update(
        &mut self,
        key: RowKey,
        new_row: ProductValue,
        ref_count_delta: isize,
        callbacks: &mut Vec<PendingRowCallback>,
    ) {
        match self.entries.get_mut(&key) {
            Some(cached) => {
                cached.ref_count = (cached.ref_count as isize + ref_count_delta).max(1) as usize;
                let old = std::mem::replace(&mut cached.row, new_row.clone());
                callbacks.push(PendingRowCallback {
                    table_name: self.info.table_name.clone(),
                    callback: RowCallback::Update { old, new: new_row },
                });
            }
            None => {
                // Either the server replayed a transaction we missed or it
                // has a bug; recover by treating the new row as an insert.
                log::error!(
                    "Received update for table {} row we weren't subscribed to",
                    self.info.table_name
                );
                self.insert(key, new_row, ref_count_delta.max(1) as usize, callbacks);
            }
        }
    }

    /// Point lookup through a unique index. `key` carries one value per
    /// indexed column.
    pub(crate) fn find_unique(&self, index: &IndexRuntimeInfo, key: &[AlgebraicValue]) -> Option<ProductValue> {
        if key.len() != index.col_positions.len() {
            return None;
        }
        self.entries
            .values()
            .find(|cached| {
                index
                    .col_positions
                    .iter()
                    .zip(key)
                    .all(|(&pos, expected)| cached.row.field(pos) == Some(expected))
            })
            .map(|cached| cached.row.clone())
    }

    /// Range scan through a B-tree index.
    ///
    /// Scans every resident row and tests it against the range; correct, if
    /// not fast, and the cache holds only the subscribed subset anyway.
    pub(crate) fn scan_index(&self, index: &IndexRuntimeInfo, range: &IndexRange) -> Vec<ProductValue> {
        self.entries
            .values()
            .filter(|cached| range.matches(index, &cached.row))
            .map(|cached| cached.row.clone())
            .collect()
    }
}

/// One bound of a B-tree index scan.
#[derive(Clone, Debug)]
pub enum IndexBound {
    Included(AlgebraicValue),
    Excluded(AlgebraicValue),
    Unbounded,
}

/// A scan range over an N-column index: equality on a prefix of the columns,
/// then optional bounds on the next column. Columns beyond that are
/// unconstrained.
#[derive(Clone, Debug)]
pub struct IndexRange {
    pub eq_prefix: Vec<AlgebraicValue>,
    pub min: IndexBound,
    pub max: IndexBound,
}

impl IndexRange {
    /// Equality on a prefix of the indexed columns.
    pub fn eq(values: impl Into<Vec<AlgebraicValue>>) -> Self {
        IndexRange {
            eq_prefix: values.into(),
            min: IndexBound::Unbounded,
            max: IndexBound::Unbounded,
        }
    }

    fn matches(&self, index: &IndexRuntimeInfo, row: &ProductValue) -> bool {
        if self.eq_prefix.len() > index.col_positions.len() {
            return false;
        }
        for (expected, &pos) in self.eq_prefix.iter().zip(&index.col_positions) {
            if row.field(pos) != Some(expected) {
                return false;
            }
        }
        let Some(&bound_pos) = index.col_positions.get(self.eq_prefix.len()) else {
            // The prefix covers every column; bounds have nothing to apply to.
            return true;
        };
        let Some(value) = row.field(bound_pos) else {
            return false;
        };
        let min_ok = match &self.min {
            IndexBound::Unbounded => true,
            IndexBound::Included(min) => matches!(value.key_cmp(min), Some(ord) if ord.is_ge()),
            IndexBound::Excluded(min) => matches!(value.key_cmp(min), Some(ord) if ord.is_gt()),
        };
        let max_ok = match &self.max {
            IndexBound::Unbounded => true,
            IndexBound::Included(max) => matches!(value.key_cmp(max), Some(ord) if ord.is_le()),
            IndexBound::Excluded(max) => matches!(value.key_cmp(max), Some(ord) if ord.is_lt()),
        };
        min_ok && max_ok
    }
}

/// The per-connection collection of table caches, created lazily per table.
pub(crate) struct ClientCache {
    module: Arc<ModuleDef>,
    tables: HashMap<Box<str>, TableCache>,
}

impl ClientCache {
    pub(crate) fn new(module: Arc<ModuleDef>) -> Self {
        ClientCache {
            module,
            tables: HashMap::new(),
        }
    }

    /// The cache for `table_name`, created on first use.
    /// `None` if the module has no such table.
    pub(crate) fn table(&mut self, table_name: &str) -> Option<&mut TableCache> {
        if !self.tables.contains_key(table_name) {
            let info = self.module.table(table_name)?.clone();
            self.tables.insert(table_name.into(), TableCache::new(info));
        }
        self.tables.get_mut(table_name)
    }

    pub(crate) fn get_table(&self, table_name: &str) -> Option<&TableCache> {
        self.tables.get(table_name)
    }
}
