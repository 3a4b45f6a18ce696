pub mod common;
pub mod compiled;
pub mod schema;
pub mod storage;
pub mod value;
pub mod view;

pub use common::*;
pub use compiled::*;
pub use schema::*;
pub use storage::*;
pub use value::*;
pub use view::*;
