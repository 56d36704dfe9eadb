pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod pipeline;
pub mod policies;
pub mod stores;
pub mod upstream;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
