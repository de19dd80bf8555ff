//! Dataframe-style query builders over the Quiver IR graph.
//!
//! Architecture role:
//! - translates high-level dataframe calls (`table`, `map`, `filter`,
//!   `groupby().agg()`, `merge`, `append`, `display`, ...) into IR node
//!   construction
//! - provides the builder-side expression language ([`ExprDef`]) and
//!   standalone compile-time expression evaluation

pub mod dataframe;
pub mod evaluate;
pub mod expr;

pub use dataframe::{DataFrame, GroupedDataFrame, Query};
pub use evaluate::evaluate_compile_time;
pub use expr::{col, col_of, func, lit, metadata, ExprDef};
