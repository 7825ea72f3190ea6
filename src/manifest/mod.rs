mod cache;
mod fetch;
pub(crate) mod model;

pub use cache::{ManifestCache, CACHE_FILE};
pub use fetch::{ManifestFetcher, ManifestSource};
pub use model::{
    ArchiveFormat, Artifact, ArtifactKey, Component, Device, Manifest, Payload, Unpack,
    SUPPORTED_SCHEMA_VERSIONS,
};
