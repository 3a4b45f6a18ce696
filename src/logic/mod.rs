pub mod compile;
pub mod naming;
pub mod read_plan;
pub mod values;
pub mod write_plan;

pub use compile::{compile, storage_type};
pub use naming::NameRegistry;
pub use read_plan::*;
pub use values::{canonical_json, from_storage, to_storage};
pub use write_plan::*;
