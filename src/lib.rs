//! custodia - cloud governance engine
//!
//! Enumerates control-plane resources through declarative descriptors,
//! filters them, and acts on the selection under a resource-limit breaker.

pub mod actions;
pub mod config;
pub mod error;
pub mod filters;
pub mod policy;
pub mod provider;
pub mod resource;
pub mod retry;

pub use error::{Error, Result};

/// Version injected at compile time via CUSTODIA_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("CUSTODIA_VERSION") {
    Some(v) => v,
    None => "dev",
};
