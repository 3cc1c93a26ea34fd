//! Shared leaf types for the sockmux streaming client.
//!
//! This crate carries the pieces that every layer of the client stack needs
//! but that have no behavior of their own: the error taxonomy, API
//! credentials, and token-bucket primitives consumed by the client-side
//! rate limiter.

pub mod credentials;
pub mod error;
pub mod rate_limit;

pub use credentials::ApiCredentials;
pub use error::{SocketError, SocketResult};
pub use rate_limit::{AcquireOutcome, BucketConfig, TokenBucket};
