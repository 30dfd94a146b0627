//! Testing utilities and fixtures

/// Test fixtures for common scenarios
pub mod fixtures {
    use crate::types::*;

    /// Generate sample rows for testing
    pub fn sample_rows(count: usize) -> Vec<Row> {
        (0..count)
            .map(|i| {
                Row::new(vec![
                    Value::Int64(i as i64),
                    Value::String(format!("name_{}", i)),
                    Value::Float64(i as f64 * 1.5),
                    Value::Boolean(i % 2 == 0),
                ])
            })
            .collect()
    }

    /// Column definitions matching [`sample_rows`]
    pub fn sample_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", DataType::Int64).not_null(),
            ColumnDef::new("name", DataType::String),
            ColumnDef::new("value", DataType::Float64),
            ColumnDef::new("active", DataType::Boolean),
        ]
    }

    /// Generate sample user rows keyed by id
    pub fn sample_users(count: usize) -> Vec<Row> {
        (0..count)
            .map(|i| {
                Row::new(vec![
                    Value::Int64(i as i64 + 1),
                    Value::String(format!("user_{}", i)),
                    Value::String(format!("user_{}@example.com", i)),
                    Value::Timestamp(1704067200000000 + i as i64 * 86400000000), // 2024-01-01 + i days
                ])
            })
            .collect()
    }

    /// Generate random bytes for testing
    pub fn random_bytes(len: usize) -> Vec<u8> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut result = Vec::with_capacity(len);
        let mut hasher = DefaultHasher::new();

        for i in 0..len {
            i.hash(&mut hasher);
            result.push(hasher.finish() as u8);
        }

        result
    }
}
