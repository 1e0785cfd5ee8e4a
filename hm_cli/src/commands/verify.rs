use console::style;
use std::path::Path;

use hm_core::{Error, HashAlgorithm};

pub fn run(file: &Path, sha256: &str) -> Result<(), Error> {
    let label = file.display().to_string();
    hm_core::verify_file(&label, file, sha256, HashAlgorithm::Sha256)?;
    println!("{} {} matches {}", style("✓").green(), label, sha256.trim());
    Ok(())
}
