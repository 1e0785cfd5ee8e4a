pub mod blob;
pub mod build;
pub mod environment;
pub mod extract;
pub mod fetch;
pub mod install;
pub mod process;
pub mod progress;
pub mod receipt;
pub mod smoke;
pub mod traits;
pub mod wheel;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use blob::{BlobCache, CacheEntry};
pub use build::{CommandBackend, stage_source};
pub use environment::{Environment, ResourceInstall};
pub use extract::{ArchiveKind, detect_archive, extract_archive};
pub use fetch::FetchCache;
pub use install::{CancelToken, Installer};
pub use progress::{InstallProgress, ProgressCallback};
pub use receipt::{InstalledResource, LinkedEntryPoint};
pub use smoke::run_smoke_test;
pub use traits::{BuildBackend, Fetcher, HttpFetcher};
