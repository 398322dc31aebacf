//! rswvcdm - Widevine style content decryption session engine.
//!
//! This crate provides:
//! - [`cdm::CdmEngine`], the registry that routes license, provisioning,
//!   decrypt and query calls to open sessions and runs periodic maintenance.
//! - [`crypto_session::CryptoSession`], the per-session wrapper around a
//!   trusted crypto boundary ([`boundary::CryptoBoundary`]).
//! - Key sessions for content, entitlement and sub-license keys.
//! - Usage table header bookkeeping.
//!
//! Feature flags:
//! - `log` (default): log through the `log` facade.
//! - `tracing`: log through `tracing` instead.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Trusted crypto boundary interface.
pub mod boundary;
/// Session registry.
pub mod cdm;
/// Time source for expiry and usage periods.
pub mod clock;
/// Engine configuration.
pub mod config;
/// Crypto sessions over the boundary.
pub mod crypto_session;
/// Subsample decrypt parameters.
pub mod decrypt;
/// Common error types and Result alias.
pub mod error;
/// Content key representation.
pub mod key;
/// Key loading and selection strategies.
pub mod key_session;
/// License session interfaces.
pub mod session;
/// Usage table header state.
pub mod usage_table;

#[cfg(test)]
mod testing;

pub use cdm::CdmEngine;
pub use config::EngineConfig;
pub use error::{Error, Result};
