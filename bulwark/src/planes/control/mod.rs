pub mod breaker_registry;
pub mod circuit_breaker;

pub use breaker_registry::BreakerRegistry;
pub use circuit_breaker::CircuitBreaker;
