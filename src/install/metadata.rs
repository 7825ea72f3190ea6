use std::{
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{IoContext, Result};

pub const MARKER_FILE: &str = ".speechctl-install.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    UnknownAlgorithm(String),
    Malformed(String),
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestError::UnknownAlgorithm(algo) => write!(f, "unsupported digest algorithm {algo:?}"),
            DigestError::Malformed(raw) => write!(f, "malformed digest {raw:?}"),
        }
    }
}

/// Algorithm-tagged content hash, `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    pub fn parse(raw: &str) -> std::result::Result<Self, DigestError> {
        let (algo, hex) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| DigestError::Malformed(raw.to_string()))?;
        if !algo.eq_ignore_ascii_case("sha256") {
            return Err(DigestError::UnknownAlgorithm(algo.to_string()));
        }
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::Malformed(raw.to_string()));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }

    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Leading characters used in directory names.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hex)
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Digest::parse(&value).map_err(|err| err.to_string())
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// Incremental SHA-256 over a stream of chunks.
#[derive(Default)]
pub struct StreamHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn finish(self) -> Digest {
        Digest {
            hex: hex::encode(self.inner.finalize()),
        }
    }

    /// Feeds an existing file, used when resuming a partial download.
    pub fn update_from_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .io_context(|| format!("open file for hashing: {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut buffer = [0u8; 8192];
        loop {
            let read = reader.read(&mut buffer).io_context(|| "hash read")?;
            if read == 0 {
                break;
            }
            self.update(&buffer[..read]);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn digest_of(bytes: &[u8]) -> Digest {
    let mut hasher = StreamHasher::new();
    hasher.update(bytes);
    hasher.finish()
}
