pub mod analysis;
pub mod compiler;
pub mod dag;
pub mod explain;
pub mod ir;
pub mod metadata;
pub mod proto;
pub mod registry;
pub mod relation;
pub mod rewrites;
pub mod rules;
pub mod state;
pub mod types;

pub use analysis::*;
pub use compiler::*;
pub use dag::*;
pub use explain::*;
pub use ir::*;
pub use metadata::*;
pub use proto::*;
pub use registry::*;
pub use relation::*;
pub use rewrites::*;
pub use rules::*;
pub use state::*;
pub use types::*;
