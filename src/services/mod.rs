pub mod access_control;
pub mod connection_pool;
pub mod database; // Execution engines behind local sources
pub mod datafusion; // DataFusion sessions and record batch conversion
pub mod dispatcher;
pub mod job_store;
pub mod peer_client;
pub mod registry;
pub mod relay;
pub mod result_streamer;
pub mod template;
pub mod ticket_store; // Tickets and seen request ids, TTL with LRU eviction
pub mod topology;

#[cfg(test)]
pub mod testing;

pub use access_control::*;
pub use connection_pool::*;
pub use dispatcher::*;
pub use job_store::*;
pub use peer_client::*;
pub use registry::*;
pub use relay::*;
pub use result_streamer::*;
pub use template::*;
pub use ticket_store::*;
pub use topology::*;
