#![forbid(unsafe_code)]

//! `flint-gateway` — self-hosted gateway bridging messaging channels to
//! long-lived coding-agent subprocesses.
//!
//! The gateway resolves inbound messages to stable thread identities,
//! maintains a pool of per-thread agent runtimes backed by child processes,
//! serializes work per thread, enforces session-lifecycle reset policies,
//! and streams agent events back to callers over HTTP/SSE.

pub mod channels;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod http;
pub mod models;
pub mod persistence;
pub mod profiles;
pub mod protocol;
pub mod routing;

pub use errors::{AppError, Result};
