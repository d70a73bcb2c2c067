//! Request admission control: sliding-window rate limiting per client IP and
//! per authenticated user, backed by a bounded store behind a circuit breaker.

pub mod api;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod metrics;
pub mod middleware;
pub mod ratelimit;
pub mod upstream;
