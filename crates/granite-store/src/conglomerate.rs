//! Conglomerate descriptors.
//!
//! A conglomerate is one physical storage structure, a table heap or an
//! index. The descriptor carries what the access layer needs to open scans
//! and controllers against it: the column definitions, the key layout and
//! its declared sort directions.

use granite_common::prelude::*;
use granite_common::types::ColumnDef;
use serde::{Deserialize, Serialize};

/// Metadata for one conglomerate.
///
/// Columns occupy fixed storage positions for the life of the
/// conglomerate. Dropping a column removes it from the visible list but
/// never shifts stored rows; [`position_of`](Self::position_of) maps a
/// visible column index to its storage position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConglomerateDescriptor {
    /// Conglomerate id; `ConglomId(0)` until the registry assigns one
    pub id: ConglomId,
    /// Human-readable name, informational only
    pub name: String,
    /// Visible columns, in declaration order
    columns: Vec<ColumnDef>,
    /// Storage position of each visible column
    positions: Vec<usize>,
    /// Next free storage position
    next_position: usize,
    /// Storage positions of the key columns
    key_columns: Vec<usize>,
    /// Declared sort direction per key column
    sort_orders: Vec<SortOrder>,
    /// Bumped on every structural change
    pub version: u64,
}

impl ConglomerateDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ConglomId(0),
            name: name.into(),
            columns: Vec::new(),
            positions: Vec::new(),
            next_position: 0,
            key_columns: Vec::new(),
            sort_orders: Vec::new(),
            version: 0,
        }
    }

    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.push_column(column);
        self
    }

    /// Declare the key columns by storage position. Missing sort orders
    /// default to ascending.
    pub fn with_key(mut self, key_columns: Vec<usize>, mut sort_orders: Vec<SortOrder>) -> Self {
        sort_orders.resize(key_columns.len(), SortOrder::Ascending);
        self.key_columns = key_columns;
        self.sort_orders = sort_orders;
        self
    }

    fn push_column(&mut self, column: ColumnDef) {
        self.columns.push(column);
        self.positions.push(self.next_position);
        self.next_position += 1;
    }

    pub fn is_temporary(&self) -> bool {
        self.id.is_temporary()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&ColumnDef> {
        self.columns.get(index)
    }

    /// Find a visible column index by name.
    pub fn column_named(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Storage position of a visible column.
    pub fn position_of(&self, index: usize) -> Option<usize> {
        self.positions.get(index).copied()
    }

    pub fn key_columns(&self) -> &[usize] {
        &self.key_columns
    }

    pub fn sort_orders(&self) -> &[SortOrder] {
        &self.sort_orders
    }

    /// Width of a row in storage layout, including dropped column slots.
    pub fn storage_width(&self) -> usize {
        self.next_position
    }

    pub fn validate(&self) -> Result<()> {
        for &pos in &self.key_columns {
            if pos >= self.next_position {
                return Err(StoreError::ColumnOutOfRange(pos).into());
            }
        }
        if self.sort_orders.len() != self.key_columns.len() {
            return Err(Error::invalid_argument(format!(
                "conglomerate {} declares {} key columns but {} sort orders",
                self.name,
                self.key_columns.len(),
                self.sort_orders.len()
            )));
        }
        Ok(())
    }

    /// Append a column, assigning it a fresh storage position.
    pub fn add_column(&mut self, column: ColumnDef) {
        self.push_column(column);
        self.version += 1;
    }

    /// Remove a visible column. The key columns must stay intact, and
    /// stored rows keep their layout.
    pub fn drop_column(&mut self, index: usize) -> Result<()> {
        if index >= self.columns.len() {
            return Err(StoreError::ColumnOutOfRange(index).into());
        }
        let position = self.positions[index];
        if self.key_columns.contains(&position) {
            return Err(Error::invalid_argument(format!(
                "column {} is part of the key of {}",
                self.columns[index].name, self.name
            )));
        }
        self.columns.remove(index);
        self.positions.remove(index);
        self.version += 1;
        Ok(())
    }

    /// Value a row shows for a visible column whose storage slot predates
    /// the column, as happens after an add-column.
    pub fn default_for(&self, index: usize) -> Value {
        self.columns
            .get(index)
            .and_then(|c| c.default.clone())
            .unwrap_or(Value::Null)
    }

    /// Extract the key values of a row in storage layout.
    pub fn key_of(&self, row: &Row) -> Result<Vec<Value>> {
        self.key_columns
            .iter()
            .map(|&pos| {
                row.values
                    .get(pos)
                    .cloned()
                    .ok_or_else(|| StoreError::ColumnOutOfRange(pos).into())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granite_common::types::DataType;

    fn users() -> ConglomerateDescriptor {
        ConglomerateDescriptor::new("users_heap")
            .with_column(ColumnDef::new("id", DataType::Int64).not_null())
            .with_column(ColumnDef::new("name", DataType::String))
            .with_column(ColumnDef::new("active", DataType::Boolean))
            .with_key(vec![0], vec![SortOrder::Ascending])
    }

    #[test]
    fn test_builder() {
        let desc = users();
        assert_eq!(desc.column_count(), 3);
        assert_eq!(desc.column_named("name"), Some(1));
        assert_eq!(desc.position_of(1), Some(1));
        assert_eq!(desc.key_columns(), &[0]);
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_key_of() {
        let desc = users();
        let row = Row::new(vec![
            Value::Int64(7),
            Value::String("ada".into()),
            Value::Boolean(true),
        ]);
        assert_eq!(desc.key_of(&row).unwrap(), vec![Value::Int64(7)]);
    }

    #[test]
    fn test_drop_column_keeps_positions() {
        let mut desc = users();
        desc.drop_column(1).unwrap();

        assert_eq!(desc.column_count(), 2);
        assert_eq!(desc.column_named("active"), Some(1));
        // "active" still lives at storage position 2.
        assert_eq!(desc.position_of(1), Some(2));
        assert_eq!(desc.storage_width(), 3);
    }

    #[test]
    fn test_drop_key_column_is_refused() {
        let mut desc = users();
        assert!(desc.drop_column(0).is_err());
        assert_eq!(desc.column_count(), 3);
    }

    #[test]
    fn test_add_column_after_drop() {
        let mut desc = users();
        desc.drop_column(2).unwrap();
        desc.add_column(ColumnDef::new("email", DataType::String));

        // The new column gets a fresh position, not the dropped one.
        assert_eq!(desc.position_of(2), Some(3));
        assert_eq!(desc.version, 2);
    }

    #[test]
    fn test_validate_rejects_bad_key() {
        let desc = ConglomerateDescriptor::new("bad")
            .with_column(ColumnDef::new("a", DataType::Int64))
            .with_key(vec![5], vec![]);
        assert!(desc.validate().is_err());
    }
}
