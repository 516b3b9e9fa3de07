pub mod canvas;
mod commit;
pub mod engine;
pub mod graph;
pub mod lifecycle;
pub mod marketplace;
pub mod registry;
pub mod schema;
pub mod snapshots;
pub mod templates;

pub use canvas::*;
pub use engine::*;
pub use graph::*;
pub use lifecycle::*;
pub use marketplace::*;
pub use registry::*;
pub use schema::*;
pub use snapshots::*;
pub use templates::*;
