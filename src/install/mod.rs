pub(crate) mod archive;
mod download;
pub mod lock;
pub mod metadata;
pub mod publish;
pub mod store;
mod transfer;

pub use download::{DownloadOutcome, Downloader};
pub use lock::InstallLock;
pub use metadata::{Digest, MARKER_FILE};
pub use store::{InstallRecord, InstallStore, RepairReport, STORE_FILE};
pub use transfer::{progress_fraction, TransferPool};
