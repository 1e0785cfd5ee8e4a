//! Install command implementation.

use console::style;
use indicatif::MultiProgress;
use std::path::Path;
use std::time::Instant;

use hm_core::{Error, Manifest};
use hm_io::{CancelToken, Installer};

use crate::display::{ProgressStyles, create_progress_callback, finish_progress_bars};

/// Run the install command.
pub async fn run(
    installer: &Installer,
    manifest_path: &Path,
    env_root: &Path,
    smoke_test: bool,
) -> Result<(), Error> {
    let manifest = load_manifest(manifest_path)?;
    let start = Instant::now();

    println!(
        "{} Installing {} into {}",
        style("==>").cyan().bold(),
        style(manifest.primary_name()).bold(),
        env_root.display()
    );
    println!(
        "{} {} resources, build backend {}",
        style("==>").cyan().bold(),
        manifest.resources.len(),
        style(&manifest.build_backend).bold()
    );

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        let ctrl_c = || async { tokio::signal::ctrl_c().await.is_ok() };
        if watch_interrupts(ctrl_c, on_interrupt).await {
            std::process::exit(Error::Cancelled.exit_code());
        }
    });

    let multi = MultiProgress::new();
    let (progress, bars) = create_progress_callback(multi, ProgressStyles::default());

    let result = installer
        .install_with(&manifest, env_root, &cancel, Some(progress))
        .await;
    watcher.abort();
    finish_progress_bars(&bars);

    let env = result?;
    let resources = env.installed_resources()?.len();
    let links = env.linked_entry_points()?.len();
    drop(env);

    println!();
    println!(
        "{} Installed {} resources and linked {} entry points in {:.2}s",
        style("==>").cyan().bold(),
        resources,
        links,
        start.elapsed().as_secs_f64()
    );

    if !smoke_test {
        return Ok(());
    }

    let Some((entry_point, args)) = manifest.smoke_test_command() else {
        return Ok(());
    };

    println!(
        "{} Smoke test: {} {}",
        style("==>").cyan().bold(),
        entry_point,
        args.join(" ")
    );
    match hm_io::run_smoke_test(env_root, &entry_point, &args, installer.config().smoke_timeout()).await {
        Ok(()) => {
            println!("    {} passed", style("✓").green());
            Ok(())
        }
        Err(e) => {
            eprintln!(
                "{} smoke test failed; the environment was kept at {}",
                style("warning:").yellow().bold(),
                env_root.display()
            );
            Err(e)
        }
    }
}

/// Cancel the install on the first interrupt and wait for another one.
///
/// Returns `true` once a second interrupt arrives while rollback is still
/// running; the caller exits without waiting for it.
async fn watch_interrupts<F, Fut>(mut next_interrupt: F, cancel: CancelToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if !next_interrupt().await {
        return false;
    }
    eprintln!(
        "\n{} interrupted, rolling back (press Ctrl-C again to exit now)",
        style("==>").yellow().bold()
    );
    cancel.cancel();
    next_interrupt().await
}

fn load_manifest(path: &Path) -> Result<Manifest, Error> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        Error::validation(format!("failed to read manifest {}: {e}", path.display()))
    })?;
    Manifest::from_json(&json)
}
