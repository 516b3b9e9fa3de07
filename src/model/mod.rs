pub mod block;
pub mod common;
pub mod instance;
pub mod marketplace;
pub mod snapshot;
pub mod template;
pub mod user_context;

pub use block::*;
pub use common::*;
pub use instance::*;
pub use marketplace::*;
pub use snapshot::*;
pub use template::*;
pub use user_context::*;
