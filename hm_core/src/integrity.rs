//! Content integrity checks.
//!
//! Every payload is hashed and compared against its pinned digest before it
//! is allowed anywhere near an environment. Comparison is on hex text and
//! ignores case.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{Error, HashAlgorithm};

/// Hex digest of `bytes`.
pub fn digest_hex(bytes: &[u8], algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            format!("{:x}", hasher.finalize())
        }
    }
}

/// Hex digest of a file, read in chunks.
pub fn digest_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 8192];

    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let bytes_read = file.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                hasher.update(&buffer[..bytes_read]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
    }
}

/// Verify `bytes` against the pinned `expected` digest.
///
/// `resource` only labels the error.
pub fn verify(
    resource: &str,
    bytes: &[u8],
    expected: &str,
    algorithm: HashAlgorithm,
) -> Result<(), Error> {
    let actual = digest_hex(bytes, algorithm);
    check(resource, expected, actual)
}

/// Verify a file on disk against the pinned `expected` digest.
pub fn verify_file(
    resource: &str,
    path: &Path,
    expected: &str,
    algorithm: HashAlgorithm,
) -> Result<(), Error> {
    let actual = digest_file(path, algorithm).map_err(|e| Error::InstallIo {
        resource: resource.to_string(),
        message: format!("failed to read {}: {e}", path.display()),
    })?;
    check(resource, expected, actual)
}

fn check(resource: &str, expected: &str, actual: String) -> Result<(), Error> {
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(Error::IntegrityFailure {
            resource: resource.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}
