//! rekon queue: the controller's rate-limited work queue of object keys.

#![forbid(unsafe_code)]

pub mod limiter;
mod work;

pub use limiter::{default_controller_rate_limiter, ExponentialBackoff, FixedDelay, MaxOf, RateLimiter, TokenBucket};
pub use work::{QueueKey, WorkQueue};
