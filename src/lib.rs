//! Installer engine for prebuilt speech assets.
//!
//! Resolves a release manifest, selects one artifact for the host platform,
//! downloads and verifies it, then publishes it atomically and records it in
//! a per-root install store. [`installer::Installer`] is the entry point; the
//! `speechctl` binary is a thin shell around it.

pub mod cancel;
pub mod core;
pub mod error;
pub mod install;
pub mod installer;
pub mod manifest;
pub mod platform;
pub mod selector;
pub mod transport;

pub use cancel::CancelToken;
pub use error::{ErrorKind, ExitClass, InstallError, Result};
pub use installer::{InstallOutcome, InstallRequest, InstallStatus, Installer};
