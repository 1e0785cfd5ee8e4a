use console::style;

use hm_core::Error;
use hm_io::FetchCache;

use crate::CacheAction;
use crate::display::{format_bytes, short_hash};

pub fn run(cache: &FetchCache, action: CacheAction) -> Result<(), Error> {
    match action {
        CacheAction::List => {
            let entries = cache.list()?;
            if entries.is_empty() {
                println!("Cache is empty.");
            }
            for entry in entries {
                println!("{}  {}", short_hash(&entry.key), format_bytes(entry.size));
            }
        }
        CacheAction::Size => {
            let entries = cache.list()?.len();
            println!("{} in {} entries", format_bytes(cache.total_size()?), entries);
        }
        CacheAction::Clear => {
            let (count, bytes) = cache.clear()?;
            println!(
                "{} Removed {} entries, freed {}",
                style("==>").cyan().bold(),
                count,
                format_bytes(bytes)
            );
        }
        CacheAction::Cleanup => {
            let (count, bytes) = cache.cleanup_temp_files()?;
            let corrupt = cache.audit()?;
            for key in &corrupt {
                cache.blobs().remove_blob(key).map_err(|e| Error::InstallIo {
                    resource: "cache".to_string(),
                    message: format!("failed to remove {key}: {e}"),
                })?;
            }
            println!(
                "{} Removed {} partial downloads ({}) and {} corrupt entries",
                style("==>").cyan().bold(),
                count,
                format_bytes(bytes),
                corrupt.len()
            );
        }
    }
    Ok(())
}
