pub mod query_validator;

pub use query_validator::*;
