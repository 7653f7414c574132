//! Error tracking, recovery orchestration, and circuit breaking.

pub mod circuit_breaker;
pub mod error_monitor;
pub mod recovery;

pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitState,
    CircuitStateChanged,
};
pub use error_monitor::{ComponentError, ErrorMonitor, ErrorSource, Severity};
pub use recovery::{RecoveryManager, RecoveryStatus, RecoveryStrategy};
