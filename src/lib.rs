//! Turnstile — permission synchronization for chat-platform bots.
//!
//! Keeps a remote platform's per-command access grants in step with a
//! locally declared authority policy, reacting to live membership and
//! role-change notifications with minimal diffs. No state is persisted;
//! a restart rebuilds everything from the policy store and the remote
//! platform.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod gateway;
pub mod logging;
pub mod policy;
pub mod status;
pub mod store;
pub mod sync;
pub mod types;
