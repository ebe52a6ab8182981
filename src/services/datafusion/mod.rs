// DataFusion execution for file and in-memory sources
//
// Each such source gets its own session with the source's rows registered under
// its relation name. Expanded queries run there and come back as JSON rows.

pub mod converter; // DataFusionResultConverter
pub mod executor; // DataFusionRunner
pub mod session; // DataFusionSessionManager

pub use converter::DataFusionResultConverter;
pub use executor::DataFusionRunner;
pub use session::{DataFusionSessionManager, SessionConfig};
