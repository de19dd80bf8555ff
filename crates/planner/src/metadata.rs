use std::collections::BTreeMap;

use crate::types::{DataType, SemanticType};

/// Reserved prefix for internally-generated metadata columns.
pub const METADATA_COLUMN_PREFIX: &str = "_attr_";

/// One resolvable metadata property: its materialized column name, type,
/// the key columns it can be converted from, and the conversion UDF.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataProperty {
    pub name: String,
    pub data_type: DataType,
    pub semantic_type: SemanticType,
    /// Columns (in preference order) a conversion can start from.
    pub key_columns: Vec<String>,
    /// Scalar UDF converting a key column into this property.
    pub udf_name: String,
}

impl MetadataProperty {
    /// Column name this property materializes as (`_attr_pod_name`).
    pub fn column_repr(&self) -> String {
        format!("{METADATA_COLUMN_PREFIX}{}", self.name)
    }
}

/// Catalog of metadata properties resolvable during compilation.
///
/// Constructed once, then used read-only (never a process-wide singleton).
#[derive(Debug, Clone, Default)]
pub struct MetadataCatalog {
    properties: BTreeMap<String, MetadataProperty>,
}

impl MetadataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, property: MetadataProperty) {
        self.properties.insert(property.name.clone(), property);
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property(&self, name: &str) -> Option<&MetadataProperty> {
        self.properties.get(name)
    }

    /// Catalog of the standard kubernetes-flavored properties, keyed off the
    /// `upid` column.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.register(MetadataProperty {
            name: "pod_name".to_string(),
            data_type: DataType::String,
            semantic_type: SemanticType::PodName,
            key_columns: vec!["upid".to_string()],
            udf_name: "upid_to_pod_name".to_string(),
        });
        catalog.register(MetadataProperty {
            name: "service_name".to_string(),
            data_type: DataType::String,
            semantic_type: SemanticType::ServiceName,
            key_columns: vec!["upid".to_string()],
            udf_name: "upid_to_service_name".to_string(),
        });
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_repr_uses_reserved_prefix() {
        let catalog = MetadataCatalog::with_defaults();
        let prop = catalog.property("pod_name").expect("pod_name registered");
        assert_eq!(prop.column_repr(), "_attr_pod_name");
        assert!(!catalog.has_property("node_name"));
    }
}
