pub mod backend;
pub mod fallback;
pub mod retry;
pub mod service;

pub mod mock;

pub use backend::{EnrichmentBackend, HttpBackend};
pub use retry::{RetryPolicy, RetryingBackend};
pub use service::{ContextMessage, EnrichConfig, EnrichmentService};
