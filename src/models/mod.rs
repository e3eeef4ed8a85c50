//! Backend identity and health state
//!
//! Circuit breakers and the availability cache, both persisted in the
//! shared state directory.

pub mod availability;
pub mod backend_id;
pub mod circuit;

pub use availability::{AvailabilityCache, AvailabilityEntry, ModelAvailability};
pub use backend_id::BackendId;
pub use circuit::{Admission, CircuitBreakerRegistry, CircuitRecord, CircuitState, CircuitStore};
