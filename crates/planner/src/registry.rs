use std::collections::BTreeMap;

use crate::types::DataType;

/// Lookup key for a registered function: name plus argument type tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegistryKey {
    pub name: String,
    pub arg_types: Vec<DataType>,
}

impl RegistryKey {
    pub fn new(name: impl Into<String>, arg_types: Vec<DataType>) -> Self {
        Self {
            name: name.into(),
            arg_types,
        }
    }
}

/// Registered scalar (UDF) and aggregate (UDA) function signatures.
///
/// Built once before compilation and queried read-only by the type rules;
/// multiple compilations may share one registry.
#[derive(Debug, Clone, Default)]
pub struct FuncRegistry {
    scalar: BTreeMap<RegistryKey, DataType>,
    aggregate: BTreeMap<RegistryKey, DataType>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_scalar(
        &mut self,
        name: impl Into<String>,
        arg_types: Vec<DataType>,
        return_type: DataType,
    ) {
        self.scalar
            .insert(RegistryKey::new(name, arg_types), return_type);
    }

    pub fn register_aggregate(
        &mut self,
        name: impl Into<String>,
        arg_types: Vec<DataType>,
        return_type: DataType,
    ) {
        self.aggregate
            .insert(RegistryKey::new(name, arg_types), return_type);
    }

    /// Scalar signature lookup by name + argument type tuple.
    pub fn scalar_return_type(&self, name: &str, arg_types: &[DataType]) -> Option<DataType> {
        self.scalar
            .get(&RegistryKey::new(name, arg_types.to_vec()))
            .copied()
    }

    /// Aggregate signature lookup by name + argument type tuple.
    pub fn aggregate_return_type(&self, name: &str, arg_types: &[DataType]) -> Option<DataType> {
        self.aggregate
            .get(&RegistryKey::new(name, arg_types.to_vec()))
            .copied()
    }

    pub fn has_scalar_named(&self, name: &str) -> bool {
        self.scalar.keys().any(|k| k.name == name)
    }

    /// A small registry covering the arithmetic/comparison builtins; handy
    /// for tests and defaults.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for op in ["add", "subtract", "multiply", "divide"] {
            registry.register_scalar(op, vec![DataType::Int64, DataType::Int64], DataType::Int64);
            registry.register_scalar(
                op,
                vec![DataType::Float64, DataType::Float64],
                DataType::Float64,
            );
        }
        for op in ["equal", "not_equal", "less_than", "greater_than"] {
            for t in [DataType::Int64, DataType::Float64, DataType::String] {
                registry.register_scalar(op, vec![t, t], DataType::Boolean);
            }
        }
        registry.register_scalar(
            "logical_and",
            vec![DataType::Boolean, DataType::Boolean],
            DataType::Boolean,
        );
        registry.register_scalar(
            "logical_or",
            vec![DataType::Boolean, DataType::Boolean],
            DataType::Boolean,
        );
        registry.register_aggregate("count", vec![DataType::Int64], DataType::Int64);
        registry.register_aggregate("count", vec![DataType::Float64], DataType::Int64);
        registry.register_aggregate("count", vec![DataType::String], DataType::Int64);
        registry.register_aggregate("sum", vec![DataType::Int64], DataType::Int64);
        registry.register_aggregate("sum", vec![DataType::Float64], DataType::Float64);
        registry.register_aggregate("mean", vec![DataType::Int64], DataType::Float64);
        registry.register_aggregate("mean", vec![DataType::Float64], DataType::Float64);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_exact_on_arg_types() {
        let registry = FuncRegistry::with_builtins();
        assert_eq!(
            registry.scalar_return_type("add", &[DataType::Int64, DataType::Int64]),
            Some(DataType::Int64)
        );
        assert_eq!(
            registry.scalar_return_type("add", &[DataType::Int64, DataType::Float64]),
            None
        );
        assert_eq!(
            registry.aggregate_return_type("mean", &[DataType::Int64]),
            Some(DataType::Float64)
        );
    }
}
