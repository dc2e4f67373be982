//! Fault tolerance shared by exchange clients
//!
//! - Circuit breaker turning repeated failures into fast "unavailable" errors
//! - Rate limiter spacing requests within exchange limits

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::RateLimiter;
