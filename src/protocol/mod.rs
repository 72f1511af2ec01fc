//! Agent Protocol client plumbing.
//!
//! This module manages bidirectional communication with agent child
//! processes spawned by the gateway. Each runtime owns a pair of read/write
//! tasks over the child's stdio plus a stderr drain and an exit monitor.
//!
//! # Submodules
//!
//! - [`codec`]: newline-delimited JSON framing with a 1 MiB per-line limit,
//!   auto-detecting Content-Length header framing on the inbound path.
//! - [`spawner`]: process spawning with piped stdio and `kill_on_drop`.
//! - [`stderr`]: bounded ring buffer over the child's stderr.
//! - [`peer`]: request/response correlation, notification fan-out, and
//!   server→client approval handling.
//! - [`translator`]: protocol notifications → [`AgentEvent`](crate::models::event::AgentEvent).
//! - [`provider`]: provider enum and per-provider wire mapping.

pub mod codec;
pub mod peer;
pub mod provider;
pub mod spawner;
pub mod stderr;
pub mod translator;
