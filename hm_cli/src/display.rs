//! Display utilities for progress bars and formatting helpers.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hm_io::{InstallProgress, ProgressCallback};

const BUILD_BAR: &str = "build";

/// Progress styles used by the install command.
pub struct ProgressStyles {
    pub spinner: ProgressStyle,
    pub done: ProgressStyle,
}

impl Default for ProgressStyles {
    fn default() -> Self {
        Self {
            spinner: ProgressStyle::default_spinner()
                .template("    {prefix:<20} {spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            done: ProgressStyle::default_spinner()
                .template("    {prefix:<20} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        }
    }
}

pub type ProgressBars = Arc<Mutex<HashMap<String, ProgressBar>>>;

/// Create a progress callback that keeps one spinner per resource plus one
/// for the build.
pub fn create_progress_callback(
    multi: MultiProgress,
    styles: ProgressStyles,
) -> (Arc<ProgressCallback>, ProgressBars) {
    let bars: ProgressBars = Arc::new(Mutex::new(HashMap::new()));

    let bars_clone = bars.clone();
    let spinner_style = styles.spinner;
    let done_style = styles.done;

    let spinner = move |multi: &MultiProgress, name: &str, message: String| {
        let pb = multi.add(ProgressBar::new_spinner());
        pb.set_style(spinner_style.clone());
        pb.set_prefix(name.to_string());
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    };

    let callback: Arc<ProgressCallback> = Arc::new(Box::new(move |event| {
        let mut bars = bars_clone.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            InstallProgress::StateChanged { .. } => {}
            InstallProgress::FetchCompleted { name } => {
                let pb = spinner(&multi, &name, "fetched".to_string());
                bars.insert(name, pb);
            }
            InstallProgress::InstallStarted { name } => {
                if let Some(pb) = bars.get(&name) {
                    pb.set_message("installing...");
                } else {
                    let pb = spinner(&multi, &name, "installing...".to_string());
                    bars.insert(name, pb);
                }
            }
            InstallProgress::HookStarted { name } => {
                if let Some(pb) = bars.get(&name) {
                    pb.set_message("running post-install hook...");
                }
            }
            InstallProgress::InstallCompleted { name } => {
                if let Some(pb) = bars.get(&name) {
                    pb.set_style(done_style.clone());
                    pb.set_message(format!("{} installed", style("✓").green()));
                    pb.finish();
                }
            }
            InstallProgress::BuildStarted { backend } => {
                let pb = spinner(&multi, BUILD_BAR, format!("building with {backend}..."));
                bars.insert(BUILD_BAR.to_string(), pb);
            }
            InstallProgress::BuildCompleted { artifact } => {
                if let Some(pb) = bars.get(BUILD_BAR) {
                    let file_name = artifact
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    pb.set_style(done_style.clone());
                    pb.set_message(format!("{} {file_name}", style("✓").green()));
                    pb.finish();
                }
            }
            InstallProgress::LinkCompleted { entry_point } => {
                let _ = multi.println(format!(
                    "    {} linked {}",
                    style("✓").green(),
                    style(entry_point).bold()
                ));
            }
            InstallProgress::RolledBack { step } => {
                for pb in bars.values().filter(|pb| !pb.is_finished()) {
                    pb.set_style(done_style.clone());
                    pb.set_message(format!("{} {step}", style("✗").red()));
                    pb.abandon();
                }
            }
        }
    }));

    (callback, bars)
}

/// Finish any remaining progress bars.
pub fn finish_progress_bars(bars: &ProgressBars) {
    let bars = bars.lock().unwrap_or_else(PoisonError::into_inner);
    for pb in bars.values() {
        if !pb.is_finished() {
            pb.finish();
        }
    }
}

/// Format bytes into a human-readable string (e.g., "1.5 GB").
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// First 12 hex digits of a content hash, enough to tell entries apart.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Seconds since an install as a coarse "N units ago" string.
pub fn format_age(installed_at: i64, now: i64) -> String {
    let secs = (now - installed_at).max(0);
    match secs {
        0..60 => "just now".to_string(),
        60..3600 => format!("{} min ago", secs / 60),
        3600..86400 => format!("{} h ago", secs / 3600),
        _ => format!("{} days ago", secs / 86400),
    }
}

pub fn print_error(error: &hm_core::Error) {
    eprintln!("{} {}", style("error:").red().bold(), error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_bytes() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(1023), "1023 bytes");
    }

    #[test]
    fn test_format_bytes_kilobytes() {
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
    }

    #[test]
    fn test_format_bytes_megabytes_and_gigabytes() {
        assert_eq!(format_bytes(1024 * 1024 + 512 * 1024), "1.5 MB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.0 GB");
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_hash("beef"), "beef");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(100, 100), "just now");
        assert_eq!(format_age(0, 120), "2 min ago");
        assert_eq!(format_age(0, 7200), "2 h ago");
        assert_eq!(format_age(0, 3 * 86400), "3 days ago");
        assert_eq!(format_age(500, 100), "just now");
    }

    #[test]
    fn test_progress_callback_tracks_resources() {
        let multi = MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        let (callback, bars) = create_progress_callback(multi, ProgressStyles::default());

        callback(InstallProgress::FetchCompleted { name: "six".into() });
        callback(InstallProgress::InstallStarted { name: "six".into() });
        callback(InstallProgress::InstallCompleted { name: "six".into() });
        callback(InstallProgress::BuildStarted { backend: "sh".into() });

        let bars = bars.lock().unwrap();
        assert!(bars["six"].is_finished());
        assert!(!bars[BUILD_BAR].is_finished());
    }
}
