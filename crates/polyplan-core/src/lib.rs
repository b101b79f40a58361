#![forbid(unsafe_code)]
//! polyplan-core: plan model and shared types.
//!
//! Everything here is engine-agnostic: operators and channels, loop constructs,
//! data quanta, channel kinds, configuration, errors, and hashing. No async, no
//! IO beyond reading configuration.

pub mod channel;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod manifest;
pub mod plan;
pub mod prelude;
pub mod types;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
