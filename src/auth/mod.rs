//! Authentication module for devicegate
//!
//! Token issuance and rotation, request-rate admission control, and the
//! actix-web handlers and middleware that expose them.

pub mod admission;
pub mod handlers;
pub mod rate_limit;
pub mod service;

pub use admission::{Admission, AdmissionGate, AuthLevel, RouteRule};
pub use rate_limit::{RateLimitPolicy, RateLimiter, TokenBucket};
pub use service::{Claims, Identity, LoginOutcome, SessionConfig, SessionManager, TokenKind, TokenPair};
