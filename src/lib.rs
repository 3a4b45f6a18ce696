pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod service;
pub mod store;

pub use error::{DataError, ModelError};
pub use logic::{compile, plan_writes, WritePlan};
pub use model::*;
pub use service::DocumentService;
pub use store::{MemoryStore, RowStore};
