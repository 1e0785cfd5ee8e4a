use console::style;
use std::path::Path;
use std::time::Duration;

use hm_core::Error;
use hm_core::manifest::DEFAULT_SMOKE_ARGS;

/// Run an entry point of an existing environment.
pub async fn run(env: &Path, entry_point: &str, args: Vec<String>, timeout: Duration) -> Result<(), Error> {
    let args = if args.is_empty() {
        DEFAULT_SMOKE_ARGS.iter().map(|s| s.to_string()).collect()
    } else {
        args
    };

    hm_io::run_smoke_test(env, entry_point, &args, timeout).await?;
    println!(
        "{} {} {} exited 0",
        style("✓").green(),
        entry_point,
        args.join(" ")
    );
    Ok(())
}
