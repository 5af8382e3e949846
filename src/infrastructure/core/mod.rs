pub mod circuit_breaker;
pub mod http;
pub mod rate_limiter;
