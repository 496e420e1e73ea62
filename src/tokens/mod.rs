//! Upstream credential pool and quota-aware issuance.

mod limited;
mod pool;

pub use limited::{ExhaustionPolicy, LimitedTokenFactory, TokenRules};
pub use pool::{Rotation, Token, TokenPool};
