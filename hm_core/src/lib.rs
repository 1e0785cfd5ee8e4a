pub mod config;
pub mod errors;
pub mod integrity;
pub mod manifest;
pub mod state;

pub use config::{BackendCommand, InstallerConfig};
pub use errors::Error;
pub use integrity::{digest_file, digest_hex, verify, verify_file};
pub use manifest::{HashAlgorithm, Manifest, PrimaryPackage, ResourceDescriptor, SmokeTest};
pub use state::{IllegalTransition, InstallState, InstallStep};
