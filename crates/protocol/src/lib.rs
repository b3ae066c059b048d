pub mod config;
pub mod messages;
pub mod metrics;

pub use config::*;
pub use messages::*;
pub use metrics::*;
