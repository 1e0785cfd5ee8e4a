use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use xz2::read::XzDecoder;

use hm_core::Error;

/// Payload format, sniffed from the leading bytes rather than the file name
/// (cache blobs carry no extension).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarXz,
    TarZst,
    Tar,
    /// Zip container, such as a wheel. Not unpacked here.
    Zip,
    /// Not an archive this module unpacks; installed as a single file.
    Opaque,
}

impl ArchiveKind {
    /// Whether `extract_archive` can unpack this kind.
    pub fn is_tar(self) -> bool {
        matches!(
            self,
            ArchiveKind::TarGz | ArchiveKind::TarXz | ArchiveKind::TarZst | ArchiveKind::Tar
        )
    }
}

pub fn detect_archive(path: &Path) -> io::Result<ArchiveKind> {
    let mut header = [0u8; 512];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(sniff(&header[..filled]))
}

fn sniff(header: &[u8]) -> ArchiveKind {
    if header.starts_with(&[0x1f, 0x8b]) {
        ArchiveKind::TarGz
    } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        ArchiveKind::TarXz
    } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        ArchiveKind::TarZst
    } else if header.len() >= 262 && &header[257..262] == b"ustar" {
        ArchiveKind::Tar
    } else if header.starts_with(b"PK\x03\x04") {
        ArchiveKind::Zip
    } else {
        ArchiveKind::Opaque
    }
}

/// Unpack a tar archive (optionally gzip/xz/zstd compressed) into `dest`.
///
/// Entry paths that would escape `dest` are skipped by `tar`'s own checks.
/// Symlinks and hard links whose target is absolute or climbs out of
/// `dest` fail the whole extraction.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ArchiveKind, Error> {
    let kind = detect_archive(archive).map_err(|e| extract_error(archive, e))?;
    let file = File::open(archive).map_err(|e| extract_error(archive, e))?;
    let reader = BufReader::new(file);

    fs::create_dir_all(dest).map_err(|e| extract_error(archive, e))?;

    let result = match kind {
        ArchiveKind::TarGz => unpack_entries(Archive::new(GzDecoder::new(reader)), dest),
        ArchiveKind::TarXz => unpack_entries(Archive::new(XzDecoder::new(reader)), dest),
        ArchiveKind::TarZst => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| extract_error(archive, e))?;
            unpack_entries(Archive::new(decoder), dest)
        }
        ArchiveKind::Tar => unpack_entries(Archive::new(reader), dest),
        ArchiveKind::Zip | ArchiveKind::Opaque => {
            return Err(Error::InstallIo {
                resource: archive.display().to_string(),
                message: "not a recognised archive".to_string(),
            });
        }
    };

    result.map_err(|e| extract_error(archive, e))?;
    Ok(kind)
}

fn unpack_entries<R: Read>(mut archive: Archive<R>, dest: &Path) -> io::Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_symlink() || entry_type.is_hard_link() {
            let path = entry.path()?.into_owned();
            let target = entry.link_name()?.map(|t| t.into_owned()).unwrap_or_default();
            // Hard link targets name another archive member; symlink
            // targets resolve against the link's own directory
            let base = if entry_type.is_symlink() {
                path.parent().map(Path::to_path_buf).unwrap_or_default()
            } else {
                PathBuf::new()
            };
            if !stays_inside(&base, &target) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "unsafe link {} -> {}",
                        path.display(),
                        target.display()
                    ),
                ));
            }
        }

        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Whether `target`, resolved against the relative directory `base`,
/// stays inside the extraction root.
fn stays_inside(base: &Path, target: &Path) -> bool {
    let mut depth: usize = 0;
    for component in base.components().chain(target.components()) {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Source archives usually wrap everything in one `name-version/`
/// directory; return it if so, otherwise `dest` itself.
pub fn single_top_level_dir(dest: &Path) -> Result<PathBuf, Error> {
    let entries: Vec<_> = fs::read_dir(dest)
        .map_err(|e| extract_error(dest, e))?
        .filter_map(|e| e.ok())
        .collect();

    if entries.len() == 1 && entries[0].path().is_dir() {
        Ok(entries[0].path())
    } else {
        Ok(dest.to_path_buf())
    }
}

fn extract_error(path: &Path, e: io::Error) -> Error {
    Error::InstallIo {
        resource: path.display().to_string(),
        message: format!("failed to extract: {e}"),
    }
}
