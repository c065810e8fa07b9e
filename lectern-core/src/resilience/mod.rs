pub mod breaker;
pub mod registry;

pub use breaker::{
    BreakerOutcome, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState,
    CircuitState, COMPLETION_WRITE_OPERATION, PROGRESS_WRITE_OPERATION,
};
pub use registry::{ActiveInstance, InstanceRegistry, ManagedInstance};
