//! The routing engine: in-flight tracking, per-pool ordering/concurrency/rate
//! control, HTTP mediation behind a circuit breaker, and the declarative
//! config reconciliation that wires it all together at runtime.

pub mod circuit_breaker;
pub mod config;
pub mod mediator;
pub mod notification;
pub mod pool;
pub mod rate_limiter;
pub mod router;
pub mod tracker;
pub mod warning;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerRegistry};
pub use config::{ConfigSourceSettings, RouterConfigSource};
pub use mediator::{HttpMediator, Mediator};
pub use notification::{NoOpNotificationService, NotificationService, WebhookNotificationService};
pub use pool::MessagePool;
pub use rate_limiter::RateLimiter;
pub use router::Router;
pub use tracker::{InFlightTracker, StalledEntry, TrackOutcome, TrackedMessage};
pub use warning::WarningService;
