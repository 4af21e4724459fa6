//! Ratewarden - Fixed-Window Request Rate Limiting
//!
//! This crate counts hits per key over fixed time windows and decides whether
//! a caller is within its limit. Counters live in one of three stores: an
//! in-process map, a host-local shared cache, or a remote Redis server shared
//! by every process. Handlers can declare rules that are keyed by client IP,
//! user or session, with an IP whitelist exempting trusted networks.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use ratelimit::{Limiter, RequestContext, RuleGuard, RuleTable};
