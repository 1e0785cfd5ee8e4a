//! Wheel artifacts.
//!
//! The `poetry` and `python-build` backends produce a wheel, which is a zip
//! container with no executables in it: console scripts only exist as
//! declarations in `*.dist-info/entry_points.txt`. Before such an artifact
//! is installed it is unpacked with the interpreter the backend already
//! needed, given one launcher per console script under `bin/`, and packed
//! again as a gzipped tarball that installs like any other resource.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::process::Command;
use tracing::{debug, warn};

use hm_core::Error;
use hm_core::manifest::is_valid_name;

use crate::process::run_with_timeout;

const UNPACK_SCRIPT: &str = "import sys, zipfile; zipfile.ZipFile(sys.argv[1]).extractall(sys.argv[2])";

/// A `[console_scripts]` declaration: `name = module:attr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleScript {
    pub name: String,
    pub module: String,
    pub attr: String,
}

impl ConsoleScript {
    /// `sh` launcher that runs this script with `site_dir` on `PYTHONPATH`.
    pub fn launcher(&self, site_dir: &Path) -> String {
        let (head, rest) = self
            .attr
            .split_once('.')
            .map_or((self.attr.as_str(), String::new()), |(h, r)| (h, format!(".{r}")));
        format!(
            "#!/bin/sh\n\
             PYTHONPATH={site}${{PYTHONPATH:+:$PYTHONPATH}} exec python3 -c \
             'import sys; sys.argv[0] = \"{name}\"; from {module} import {head}; sys.exit({head}{rest}())' \"$@\"\n",
            site = sh_quote(&site_dir.to_string_lossy()),
            name = self.name,
            module = self.module,
        )
    }
}

/// Parse the `[console_scripts]` section of an `entry_points.txt`.
///
/// Entries whose name is not a plain file name or whose object reference
/// is not a dotted identifier path are skipped.
pub fn parse_console_scripts(text: &str) -> Vec<ConsoleScript> {
    let mut in_section = false;
    let mut scripts = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = section.trim() == "console_scripts";
            continue;
        }
        if !in_section {
            continue;
        }

        let Some((name, target)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim();
        // drop extras: `pkg.cli:main [color]`
        let target = target.split('[').next().unwrap_or(target).trim();
        let Some((module, attr)) = target.split_once(':') else {
            warn!(script = name, "console script without an attribute, skipping");
            continue;
        };
        let (module, attr) = (module.trim(), attr.trim());

        if !is_valid_name(name) || !is_dotted_path(module) || !is_dotted_path(attr) {
            warn!(script = name, target, "unusable console script, skipping");
            continue;
        }
        scripts.push(ConsoleScript {
            name: name.to_string(),
            module: module.to_string(),
            attr: attr.to_string(),
        });
    }

    scripts
}

fn is_dotted_path(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Unpack `wheel` into `work`, add launchers that expect the tree to end
/// up at `site_dir`, and repack it as `<work>/<stem>.tar.gz`.
pub async fn wheel_to_tarball(
    wheel: &Path,
    work: &Path,
    site_dir: &Path,
    timeout: Duration,
) -> Result<PathBuf, Error> {
    let stem = wheel
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wheel".to_string());
    let io_error = |message: String| Error::InstallIo {
        resource: stem.clone(),
        message,
    };

    let unpacked = work.join(format!("{stem}.unpacked"));
    fs::create_dir_all(&unpacked).map_err(|e| io_error(format!("failed to create {}: {e}", unpacked.display())))?;

    let mut command = Command::new("python3");
    command.arg("-c").arg(UNPACK_SCRIPT).arg(wheel).arg(&unpacked);
    let output = run_with_timeout(command, timeout, "unpack wheel").await?;
    if !output.success() {
        return Err(io_error(format!("failed to unpack wheel: {}", output.output.trim())));
    }

    let launched = add_launchers(&unpacked, site_dir).map_err(|e| io_error(format!("failed to write launchers: {e}")))?;
    debug!(wheel = %wheel.display(), launchers = launched, "prepared wheel");

    let tarball = work.join(format!("{stem}.tar.gz"));
    repack(&unpacked, &tarball).map_err(|e| io_error(format!("failed to repack wheel: {e}")))?;
    Ok(tarball)
}

/// Write `bin/` launchers for every console script declared in the
/// unpacked wheel, and move shipped `*.data/scripts/` files next to them.
/// Returns how many executables `bin/` ended up with.
pub fn add_launchers(unpacked: &Path, site_dir: &Path) -> io::Result<usize> {
    let bin = unpacked.join("bin");
    let mut count = 0;

    for entry in fs::read_dir(unpacked)? {
        let path = entry?.path();
        let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if dir_name.ends_with(".dist-info") {
            let entry_points = path.join("entry_points.txt");
            if !entry_points.is_file() {
                continue;
            }
            for script in parse_console_scripts(&fs::read_to_string(&entry_points)?) {
                fs::create_dir_all(&bin)?;
                let dest = bin.join(&script.name);
                fs::write(&dest, script.launcher(site_dir))?;
                make_executable(&dest)?;
                count += 1;
            }
        } else if dir_name.ends_with(".data") {
            let scripts = path.join("scripts");
            if !scripts.is_dir() {
                continue;
            }
            for shipped in fs::read_dir(&scripts)? {
                let shipped = shipped?.path();
                let Some(name) = shipped.file_name() else { continue };
                if !shipped.is_file() {
                    continue;
                }
                fs::create_dir_all(&bin)?;
                let dest = bin.join(name);
                fs::rename(&shipped, &dest)?;
                make_executable(&dest)?;
                count += 1;
            }
        }
    }

    Ok(count)
}

fn repack(dir: &Path, dest: &Path) -> io::Result<()> {
    let mut builder = tar::Builder::new(GzEncoder::new(File::create(dest)?, Compression::default()));
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_archive;
    use tempfile::TempDir;

    const ENTRY_POINTS: &str = "\
[gui_scripts]
viewer = pkg.gui:main

[console_scripts]
# the tool itself
tool = pkg.cli:main
tool-admin = pkg.admin:app.run [admin]
broken
no-attr = pkg.cli
../escape = pkg.cli:main
bad-module = pkg;rm:main
";

    #[test]
    fn only_usable_console_scripts_are_parsed() {
        let scripts = parse_console_scripts(ENTRY_POINTS);

        assert_eq!(
            scripts,
            vec![
                ConsoleScript {
                    name: "tool".to_string(),
                    module: "pkg.cli".to_string(),
                    attr: "main".to_string(),
                },
                ConsoleScript {
                    name: "tool-admin".to_string(),
                    module: "pkg.admin".to_string(),
                    attr: "app.run".to_string(),
                },
            ]
        );
    }

    #[test]
    fn launcher_puts_site_dir_on_pythonpath_and_calls_attr() {
        let script = ConsoleScript {
            name: "tool-admin".to_string(),
            module: "pkg.admin".to_string(),
            attr: "app.run".to_string(),
        };

        let launcher = script.launcher(Path::new("/envs/it's/lib/tool"));

        assert!(launcher.starts_with("#!/bin/sh\n"));
        assert!(launcher.contains(r"PYTHONPATH='/envs/it'\''s/lib/tool'${PYTHONPATH:+:$PYTHONPATH}"));
        assert!(launcher.contains("from pkg.admin import app; sys.exit(app.run())"));
        assert!(launcher.ends_with("\"$@\"\n"));
    }

    #[cfg(unix)]
    #[test]
    fn unpacked_wheel_gets_launchers_and_repacks_as_tarball() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let unpacked = tmp.path().join("tool-1.0-py3-none-any.unpacked");
        fs::create_dir_all(unpacked.join("pkg")).unwrap();
        fs::write(unpacked.join("pkg/cli.py"), "def main(): return 0\n").unwrap();
        fs::create_dir_all(unpacked.join("tool-1.0.dist-info")).unwrap();
        fs::write(unpacked.join("tool-1.0.dist-info/entry_points.txt"), ENTRY_POINTS).unwrap();
        fs::create_dir_all(unpacked.join("tool-1.0.data/scripts")).unwrap();
        fs::write(unpacked.join("tool-1.0.data/scripts/tool-sh"), "#!/bin/sh\n").unwrap();

        let count = add_launchers(&unpacked, Path::new("/env/lib/tool")).unwrap();
        assert_eq!(count, 3);
        let mode = fs::metadata(unpacked.join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        let tarball = tmp.path().join("tool.tar.gz");
        repack(&unpacked, &tarball).unwrap();
        let out = tmp.path().join("out");
        extract_archive(&tarball, &out).unwrap();

        assert!(out.join("pkg/cli.py").is_file());
        assert!(out.join("bin/tool").is_file());
        assert!(out.join("bin/tool-admin").is_file());
        assert!(out.join("bin/tool-sh").is_file());
        assert!(!out.join("tool-1.0.data/scripts/tool-sh").exists());
    }
}
