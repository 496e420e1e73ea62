//! Windowed admission control.

mod compute;
mod scope;
mod window;

pub use compute::{ComputeLimiter, ComputeRequest, ComputeRules};
pub use scope::{local_address, KeyScope};
pub use window::{Admission, FailurePolicy, LimitRules, WindowedRateLimiter};
