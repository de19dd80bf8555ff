use serde::{Deserialize, Serialize};

use crate::types::{DataType, SemanticType};

/// One named, typed output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub semantic_type: SemanticType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            semantic_type: SemanticType::None,
        }
    }

    pub fn with_semantic(mut self, semantic_type: SemanticType) -> Self {
        self.semantic_type = semantic_type;
        self
    }
}

/// Ordered, name-unique list of output columns describing an operator's
/// schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    columns: Vec<Column>,
}

impl Relation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Append a column. Panics on a duplicate name; callers are expected to
    /// check first (duplicates reachable from user input must be surfaced as
    /// compile errors before this point).
    pub fn add_column(&mut self, column: Column) {
        assert!(
            !self.has_column(&column.name),
            "duplicate column {}",
            column.name
        );
        self.columns.push(column);
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_type(&self, name: &str) -> Option<DataType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.data_type)
    }

    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn col_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Keep only the named columns, preserving this relation's order.
    pub fn restricted_to(&self, keep: &std::collections::HashSet<String>) -> Relation {
        Relation {
            columns: self
                .columns
                .iter()
                .filter(|c| keep.contains(&c.name))
                .cloned()
                .collect(),
        }
    }

    /// Check column-set-and-type compatibility regardless of column order.
    ///
    /// Returns which check failed so union mismatches can report it.
    pub fn check_compatible(&self, other: &Relation) -> CompatibilityCheck {
        if self.num_columns() != other.num_columns() {
            return CompatibilityCheck::ColumnCountMismatch;
        }
        for col in &self.columns {
            match other.column_type(&col.name) {
                None => return CompatibilityCheck::ColumnNameMismatch(col.name.clone()),
                Some(t) if t != col.data_type => {
                    return CompatibilityCheck::ColumnTypeMismatch(col.name.clone())
                }
                Some(_) => {}
            }
        }
        CompatibilityCheck::Compatible
    }

    pub fn debug_string(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        format!("[{cols}]")
    }
}

/// Outcome of an order-insensitive relation compatibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompatibilityCheck {
    Compatible,
    ColumnCountMismatch,
    ColumnNameMismatch(String),
    ColumnTypeMismatch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(cols: &[(&str, DataType)]) -> Relation {
        Relation::from_columns(
            cols.iter()
                .map(|(n, t)| Column::new(*n, *t))
                .collect(),
        )
    }

    #[test]
    fn compatibility_ignores_order() {
        let a = rel(&[
            ("count", DataType::Int64),
            ("cpu0", DataType::Float64),
            ("cpu1", DataType::Float64),
        ]);
        let b = rel(&[
            ("cpu1", DataType::Float64),
            ("count", DataType::Int64),
            ("cpu0", DataType::Float64),
        ]);
        assert_eq!(a.check_compatible(&b), CompatibilityCheck::Compatible);
    }

    #[test]
    fn compatibility_reports_failed_check() {
        let a = rel(&[("count", DataType::Int64), ("cpu0", DataType::Float64)]);
        let fewer = rel(&[("count", DataType::Int64)]);
        assert_eq!(
            a.check_compatible(&fewer),
            CompatibilityCheck::ColumnCountMismatch
        );

        let renamed = rel(&[("count", DataType::Int64), ("cpu9", DataType::Float64)]);
        assert_eq!(
            a.check_compatible(&renamed),
            CompatibilityCheck::ColumnNameMismatch("cpu0".to_string())
        );

        let retyped = rel(&[("count", DataType::Int64), ("cpu0", DataType::Int64)]);
        assert_eq!(
            a.check_compatible(&retyped),
            CompatibilityCheck::ColumnTypeMismatch("cpu0".to_string())
        );
    }

    #[test]
    #[should_panic(expected = "duplicate column")]
    fn duplicate_column_panics() {
        let mut r = rel(&[("a", DataType::Int64)]);
        r.add_column(Column::new("a", DataType::Float64));
    }
}
