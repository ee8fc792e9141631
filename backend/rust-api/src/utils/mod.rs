pub mod circuit_breaker;
pub mod retry;
pub mod time;
