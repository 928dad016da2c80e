//! Telematics provider access: auth, retry, event retrieval.

pub mod client;
pub mod error;
pub mod events;
pub mod retry;
pub mod timestamps;
pub mod token;

pub use client::{EventSource, IncrementalBatch, ProviderClient, ProviderConfig};
pub use error::ApiError;
pub use retry::{CallStats, RetryExecutor, RetryPolicy};
pub use timestamps::SinceTokenAge;
pub use token::{AuthProvider, HttpAuthProvider, TokenConfig, TokenManager, TokenResponse};
