use std::collections::HashMap;

use crate::metadata::MetadataCatalog;
use crate::registry::FuncRegistry;
use crate::relation::Relation;

/// Per-compilation context: the table catalog, registered function
/// signatures, the metadata property catalog, the compiler's "now", and the
/// optional result row cap.
///
/// A new one is constructed for every query compiled and is immutable for
/// the duration of that compilation. Concurrent compilations may share the
/// underlying registry/catalog data by cloning.
#[derive(Debug, Clone)]
pub struct CompilerState {
    catalog: HashMap<String, Relation>,
    registry: FuncRegistry,
    metadata: MetadataCatalog,
    time_now_ns: i64,
    max_output_rows: Option<i64>,
}

impl CompilerState {
    pub fn new(
        catalog: HashMap<String, Relation>,
        registry: FuncRegistry,
        metadata: MetadataCatalog,
        time_now_ns: i64,
    ) -> Self {
        Self {
            catalog,
            registry,
            metadata,
            time_now_ns,
            max_output_rows: None,
        }
    }

    pub fn with_max_output_rows(mut self, max_output_rows: i64) -> Self {
        self.max_output_rows = Some(max_output_rows);
        self
    }

    pub fn table_relation(&self, table: &str) -> Option<&Relation> {
        self.catalog.get(table)
    }

    pub fn registry(&self) -> &FuncRegistry {
        &self.registry
    }

    pub fn metadata(&self) -> &MetadataCatalog {
        &self.metadata
    }

    pub fn time_now_ns(&self) -> i64 {
        self.time_now_ns
    }

    pub fn max_output_rows(&self) -> Option<i64> {
        self.max_output_rows
    }
}
