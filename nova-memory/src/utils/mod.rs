//! Engine Utilities
//!
//! Hashing, time conversion and storage retry helpers shared by every tier.

mod hashing;
mod retry;
mod time;

pub use hashing::{content_hash, hash_parts, keyed_hash};
pub use retry::RetryPolicy;
pub use time::{from_millis, now_utc, to_millis};
