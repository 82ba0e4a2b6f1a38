pub mod broker;
pub mod config;
pub mod error;
pub mod types;

pub use broker::Broker;
pub use config::AppConfig;
pub use error::CrawlError;
pub use types::*;
