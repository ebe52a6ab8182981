pub mod access;
pub mod endpoint;
pub mod job;
pub mod query;
pub mod row;
pub mod source;

pub use access::*;
pub use endpoint::*;
pub use job::*;
pub use query::*;
pub use row::*;
pub use source::*;
