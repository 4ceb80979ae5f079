//! fbuild Core - Foundation types for the fbuild firmware build daemon.
//!
//! This crate provides:
//! - Typed identifiers for clients, devices, leases and requests
//! - The configuration-lock key (project, environment, port)
//! - Daemon home-directory scaffolding with the dev-mode switch
//! - SHA-256 hashing helpers used for archives, sources and device identity

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod hash;
pub mod home;
pub mod ids;

pub use hash::{sha256_file, sha256_hex};
pub use home::FbuildHome;
pub use ids::{ClientId, ConfigKey, DeviceId, LeaseId, RequestId};
