pub mod rate_limit;
pub mod security;

pub use rate_limit::RateLimiter;
pub use security::security_headers;
