use console::style;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use hm_core::Error;
use hm_io::Environment;

use crate::display::{format_age, short_hash};

pub fn run(env_root: &Path) -> Result<(), Error> {
    let env = Environment::open(env_root)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    let resources = env.installed_resources()?;
    println!(
        "{} {} ({} resources)",
        style("==>").cyan().bold(),
        env_root.display(),
        resources.len()
    );
    for resource in &resources {
        println!(
            "    {} {} {} {}",
            style(&resource.name).green(),
            style(resource.version.as_deref().unwrap_or("-")).dim(),
            short_hash(&resource.content_hash),
            style(format_age(resource.installed_at, now)).dim()
        );
    }

    let links = env.linked_entry_points()?;
    if !links.is_empty() {
        println!("{} Entry points", style("==>").cyan().bold());
        for (name, target) in &links {
            println!("    {} -> {}", style(name).bold(), target.display());
        }
    }

    Ok(())
}
