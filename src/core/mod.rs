pub mod engine;
pub mod fingerprint;
pub mod lister;
pub mod outcome;
pub mod progress;

pub use engine::{RenameOptions, SyncConfig, SyncEngine, UploadOptions};
pub use fingerprint::{content_matches, local_checksum, probe_local, remote_checksum, LocalEntry};
pub use lister::{list_checksums, ChecksumListing};
pub use outcome::{BatchReport, ItemOutcome, ItemReport, Operation, SkipReason};
pub use progress::{ProgressSnapshot, SizeSource, TransferProgress};
