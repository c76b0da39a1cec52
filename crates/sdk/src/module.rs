//! Runtime descriptions of a module's tables and reducers.
//!
//! The CLI's codegen emits one [`TableRuntimeInfo`] per table and one
//! [`ReducerRuntimeInfo`] per reducer, gathered into a [`ModuleDef`] which the
//! connection consumes to decode rows and reducer arguments. The SDK never
//! produces these; it trusts them.

use spacetimedb_sats::algebraic_type::ProductType;
use spacetimedb_sats::bsatn::{DecodeError, Reader};
use spacetimedb_sats::row_key::InvalidKeyType;
use spacetimedb_sats::{ProductValue, RowKey};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModuleDefError {
    #[error("table {table_name} has no column named {column}")]
    UnknownColumn { table_name: Box<str>, column: Box<str> },
}

#[derive(Error, Debug)]
pub enum RowDecodeError {
    #[error("failed to decode row for table {table_name}: {source}")]
    Decode {
        table_name: Box<str>,
        source: DecodeError,
    },
    #[error("failed to derive key for table {table_name}: {source}")]
    Key {
        table_name: Box<str>,
        source: InvalidKeyType,
    },
}

/// Everything the SDK needs to know about one table at runtime.
#[derive(Clone, Debug)]
pub struct TableRuntimeInfo {
    pub table_name: Box<str>,
    /// The row type; columns in wire order.
    pub row_type: ProductType,
    pub primary_key: Option<PrimaryKeyInfo>,
    pub indexes: Vec<IndexRuntimeInfo>,
}

/// The primary-key column of a table, resolved to its position in the row.
#[derive(Clone, Debug)]
pub struct PrimaryKeyInfo {
    pub col_name: Box<str>,
    pub col_pos: usize,
}

/// A declared B-tree index. Unique constraints are unique indexes.
#[derive(Clone, Debug)]
pub struct IndexRuntimeInfo {
    pub index_name: Box<str>,
    /// Indexed columns, in index order, as positions into the row.
    pub col_positions: Vec<usize>,
    pub unique: bool,
}

impl TableRuntimeInfo {
    pub fn new(table_name: impl Into<Box<str>>, row_type: ProductType) -> Self {
        TableRuntimeInfo {
            table_name: table_name.into(),
            row_type,
            primary_key: None,
            indexes: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, col_name: &str) -> Result<Self, ModuleDefError> {
        let col_pos = self.column_position(col_name)?;
        self.primary_key = Some(PrimaryKeyInfo {
            col_name: col_name.into(),
            col_pos,
        });
        Ok(self)
    }

    pub fn with_index(
        mut self,
        index_name: &str,
        col_names: &[&str],
        unique: bool,
    ) -> Result<Self, ModuleDefError> {
        let col_positions = col_names
            .iter()
            .map(|col| self.column_position(col))
            .collect::<Result<_, _>>()?;
        self.indexes.push(IndexRuntimeInfo {
            index_name: index_name.into(),
            col_positions,
            unique,
        });
        Ok(self)
    }

    fn column_position(&self, col_name: &str) -> Result<usize, ModuleDefError> {
        self.row_type
            .index_of_field(col_name)
            .ok_or_else(|| ModuleDefError::UnknownColumn {
                table_name: self.table_name.clone(),
                column: col_name.into(),
            })
    }

    pub fn has_primary_key(&self) -> bool {
        self.primary_key.is_some()
    }

    pub fn index(&self, index_name: &str) -> Option<&IndexRuntimeInfo> {
        self.indexes.iter().find(|idx| &*idx.index_name == index_name)
    }

    /// Decode one row from its BSATN encoding and derive its cache key.
    ///
    /// With a primary key, the key is the decoded key column projected into
    /// the comparable-key domain. Without one, the exact bytes the decode
    /// consumed are the key, so byte-identical rows deduplicate under the
    /// reference count.
    pub fn decode_row(&self, bytes: &[u8]) -> Result<(ProductValue, RowKey), RowDecodeError> {
        let decode_err = |source| RowDecodeError::Decode {
            table_name: self.table_name.clone(),
            source,
        };
        let mut reader = Reader::new(bytes);
        let start = reader.pos();
        let row = ProductValue::decode(&self.row_type, &mut reader).map_err(decode_err)?;
        if reader.remaining() != 0 {
            return Err(decode_err(DecodeError::TrailingBytes {
                ty: "row",
                remaining: reader.remaining(),
            }));
        }
        let key = match &self.primary_key {
            Some(pk) => {
                // `col_pos` was resolved against `row_type`, so the field exists.
                let col = &row.elements[pk.col_pos];
                RowKey::from_primary_key(col).map_err(|source| RowDecodeError::Key {
                    table_name: self.table_name.clone(),
                    source,
                })?
            }
            None => RowKey::from_row_bytes(reader.consumed_since(start)),
        };
        Ok((row, key))
    }
}

/// Everything the SDK needs to know about one reducer at runtime.
#[derive(Clone, Debug)]
pub struct ReducerRuntimeInfo {
    pub reducer_name: Box<str>,
    /// The argument list as a product type; one field per positional argument.
    pub args_type: ProductType,
}

impl ReducerRuntimeInfo {
    pub fn new(reducer_name: impl Into<Box<str>>, args_type: ProductType) -> Self {
        ReducerRuntimeInfo {
            reducer_name: reducer_name.into(),
            args_type,
        }
    }
}

/// The full runtime schema of the module a connection talks to.
#[derive(Clone, Debug, Default)]
pub struct ModuleDef {
    tables: HashMap<Box<str>, Arc<TableRuntimeInfo>>,
    reducers: HashMap<Box<str>, Arc<ReducerRuntimeInfo>>,
}

impl ModuleDef {
    pub fn new(
        tables: impl IntoIterator<Item = TableRuntimeInfo>,
        reducers: impl IntoIterator<Item = ReducerRuntimeInfo>,
    ) -> Self {
        ModuleDef {
            tables: tables
                .into_iter()
                .map(|table| (table.table_name.clone(), Arc::new(table)))
                .collect(),
            reducers: reducers
                .into_iter()
                .map(|reducer| (reducer.reducer_name.clone(), Arc::new(reducer)))
                .collect(),
        }
    }

    pub fn table(&self, table_name: &str) -> Option<&Arc<TableRuntimeInfo>> {
        self.tables.get(table_name)
    }

    pub fn reducer(&self, reducer_name: &str) -> Option<&Arc<ReducerRuntimeInfo>> {
        self.reducers.get(reducer_name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|name| &**name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacetimedb_sats::AlgebraicType;
    use spacetimedb_sats::AlgebraicValue;

    fn user_table() -> TableRuntimeInfo {
        TableRuntimeInfo::new(
            "user",
            ProductType::new([("id", AlgebraicType::U32), ("name", AlgebraicType::String)]),
        )
        .with_primary_key("id")
        .unwrap()
    }

    #[test]
    fn primary_key_resolves_to_position() {
        let table = user_table();
        assert_eq!(table.primary_key.as_ref().unwrap().col_pos, 0);
    }

    #[test]
    fn unknown_primary_key_column_is_an_error() {
        let err = TableRuntimeInfo::new("user", ProductType::new([("id", AlgebraicType::U32)]))
            .with_primary_key("uid")
            .unwrap_err();
        assert!(matches!(err, ModuleDefError::UnknownColumn { .. }));
    }

    #[test]
    fn pk_row_keys_on_primary_key() {
        let table = user_table();
        let mut bytes = Vec::new();
        ProductValue::new([AlgebraicValue::U32(7), AlgebraicValue::String("a".into())]).encode(&mut bytes);
        let (row, key) = table.decode_row(&bytes).unwrap();
        assert_eq!(row.field(1).unwrap().as_string(), Some("a"));
        assert_eq!(key, RowKey::U32(7));
    }

    #[test]
    fn pk_less_row_keys_on_bytes() {
        let table = TableRuntimeInfo::new("log", ProductType::new([("msg", AlgebraicType::String)]));
        let mut bytes = Vec::new();
        ProductValue::new([AlgebraicValue::String("hi".into())]).encode(&mut bytes);
        let (_, key) = table.decode_row(&bytes).unwrap();
        let (_, key2) = table.decode_row(&bytes).unwrap();
        assert_eq!(key, key2);
    }
}
