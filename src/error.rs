use std::{io, path::PathBuf};

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = InstallError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("network access required for {source_url} but offline mode is set")]
    OfflineRequired { source_url: String },

    #[error("unsupported manifest: {0}")]
    UnsupportedManifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("no {component} artifact for platform {os}/{arch}")]
    NoArtifactForPlatform {
        component: String,
        os: String,
        arch: String,
    },

    #[error("device {device} unavailable for {component} variant {variant:?}")]
    DeviceUnavailable {
        component: String,
        variant: String,
        device: String,
    },

    #[error("variant {variant:?} not found for {component}")]
    VariantNotFound { component: String, variant: String },

    #[error("integrity check failed for {url}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("unsafe archive entry {entry:?}")]
    UnsafeArchiveEntry { entry: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("install store {path:?} is corrupt: {reason}; run `speechctl repair`")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("network error for {url} after {attempts} attempt(s): {message}")]
    Network {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("timed out waiting for lock {path:?}")]
    LockTimeout { path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OfflineRequired,
    UnsupportedManifest,
    InvalidManifest,
    NoArtifactForPlatform,
    DeviceUnavailable,
    VariantNotFound,
    IntegrityCheckFailed,
    UnsafeArchiveEntry,
    Cancelled,
    StoreCorrupt,
    Network,
    Http,
    LockTimeout,
    Io,
    Config,
}

/// Coarse outcome class used for process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    Usage,
    Network,
    Integrity,
    Internal,
    Cancelled,
}

impl ExitClass {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            ExitClass::Usage => 2,
            ExitClass::Network => 3,
            ExitClass::Integrity => 4,
            ExitClass::Internal => 5,
            ExitClass::Cancelled => 130,
        }
    }
}

impl InstallError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        InstallError::Io {
            context: context.into(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstallError::OfflineRequired { .. } => ErrorKind::OfflineRequired,
            InstallError::UnsupportedManifest(_) => ErrorKind::UnsupportedManifest,
            InstallError::InvalidManifest(_) => ErrorKind::InvalidManifest,
            InstallError::NoArtifactForPlatform { .. } => ErrorKind::NoArtifactForPlatform,
            InstallError::DeviceUnavailable { .. } => ErrorKind::DeviceUnavailable,
            InstallError::VariantNotFound { .. } => ErrorKind::VariantNotFound,
            InstallError::IntegrityCheckFailed { .. } => ErrorKind::IntegrityCheckFailed,
            InstallError::UnsafeArchiveEntry { .. } => ErrorKind::UnsafeArchiveEntry,
            InstallError::Cancelled => ErrorKind::Cancelled,
            InstallError::StoreCorrupt { .. } => ErrorKind::StoreCorrupt,
            InstallError::Network { .. } => ErrorKind::Network,
            InstallError::Http { .. } => ErrorKind::Http,
            InstallError::LockTimeout { .. } => ErrorKind::LockTimeout,
            InstallError::Io { .. } => ErrorKind::Io,
            InstallError::Config(_) => ErrorKind::Config,
        }
    }

    #[must_use]
    pub fn exit_class(&self) -> ExitClass {
        match self.kind() {
            ErrorKind::NoArtifactForPlatform
            | ErrorKind::DeviceUnavailable
            | ErrorKind::VariantNotFound
            | ErrorKind::Config => ExitClass::Usage,
            ErrorKind::OfflineRequired | ErrorKind::Network | ErrorKind::Http => {
                ExitClass::Network
            }
            ErrorKind::IntegrityCheckFailed
            | ErrorKind::UnsafeArchiveEntry
            | ErrorKind::UnsupportedManifest
            | ErrorKind::InvalidManifest => ExitClass::Integrity,
            ErrorKind::StoreCorrupt | ErrorKind::LockTimeout | ErrorKind::Io => {
                ExitClass::Internal
            }
            ErrorKind::Cancelled => ExitClass::Cancelled,
        }
    }
}

/// `anyhow`-style context for raw io results.
pub trait IoContext<T> {
    fn io_context<C, F>(self, context: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<C, F>(self, context: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| InstallError::io(context(), source))
    }
}
