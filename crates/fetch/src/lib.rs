pub mod antiblock;
pub mod cache;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod user_agent;

pub use antiblock::{AntiBlockEngine, BlockSignal, HostState};
pub use cache::ResponseCache;
pub use pipeline::FetchPipeline;
pub use proxy::{ProxyEntry, ProxyPool};
pub use rate_limit::RateLimiter;
pub use user_agent::UserAgentPool;
