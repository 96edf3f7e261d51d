//! Archive extraction for zip and gzip'd tar packages.
//!
//! Entries are confined to the destination directory, and an archive whose
//! contents sit in a single top-level folder is unwrapped so the package
//! lands directly in its target directory.

use crate::catalog::last_url_segment;
use crate::{ManagerError, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Format of an archive URL, judged by its last path segment so that
    /// query strings like `?raw=true` do not hide the extension.
    pub fn from_url(url: &str) -> Option<Self> {
        Self::from_name(&last_url_segment(url))
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// Extract `archive` into `dest` (created if missing).
pub(crate) fn extract_archive(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    let unpack_dir = dest.with_extension("unpack");
    std::fs::create_dir_all(&unpack_dir).map_err(|e| ManagerError::io_with_path(e, &unpack_dir))?;

    let result = match format {
        ArchiveFormat::Zip => extract_zip(archive, &unpack_dir),
        ArchiveFormat::TarGz => extract_tarball(archive, &unpack_dir),
    }
    .and_then(|_| promote(&unpack_dir, dest));

    let _ = std::fs::remove_dir_all(&unpack_dir);
    result
}

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| ManagerError::io_with_path(e, archive_path))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
        ManagerError::AcquisitionFailed {
            url: archive_path.display().to_string(),
            message: format!("Failed to read zip: {}", e),
        }
    })?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| ManagerError::AcquisitionFailed {
            url: archive_path.display().to_string(),
            message: format!("Failed to read zip entry: {}", e),
        })?;

        // enclosed_name rejects absolute paths and `..` traversal.
        let Some(relative) = entry.enclosed_name() else {
            return Err(ManagerError::AcquisitionFailed {
                url: archive_path.display().to_string(),
                message: format!("zip entry escapes the destination: {}", entry.name()),
            });
        };
        let outpath = dest_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath).map_err(|e| ManagerError::io_with_path(e, &outpath))?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ManagerError::io_with_path(e, parent))?;
        }
        let mut outfile =
            File::create(&outpath).map_err(|e| ManagerError::io_with_path(e, &outpath))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|e| ManagerError::io_with_path(e, &outpath))?;
    }

    Ok(())
}

fn extract_tarball(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| ManagerError::io_with_path(e, archive_path))?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);
    // `unpack` refuses entries that would land outside dest_dir.
    archive
        .unpack(dest_dir)
        .map_err(|e| ManagerError::AcquisitionFailed {
            url: archive_path.display().to_string(),
            message: format!("Failed to extract tarball: {}", e),
        })
}

/// Move unpacked content to `dest`, unwrapping a lone top-level directory.
fn promote(unpack_dir: &Path, dest: &Path) -> Result<()> {
    let children: Vec<PathBuf> = std::fs::read_dir(unpack_dir)
        .map_err(|e| ManagerError::io_with_path(e, unpack_dir))?
        .flatten()
        .map(|e| e.path())
        .collect();

    let source = match children.as_slice() {
        [only] if only.is_dir() => only.clone(),
        [] => {
            return Err(ManagerError::AcquisitionFailed {
                url: unpack_dir.display().to_string(),
                message: "archive is empty".to_string(),
            })
        }
        _ => unpack_dir.to_path_buf(),
    };

    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| ManagerError::io_with_path(e, dest))?;
    }
    debug!("Promoting {} to {}", source.display(), dest.display());
    std::fs::rename(&source, dest).map_err(|e| ManagerError::io_with_path(e, dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_format_from_name() {
        assert_eq!(ArchiveFormat::from_name("a.ZIP"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_name("a.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("a.py"), None);
    }

    #[test]
    fn test_format_from_url_ignores_query() {
        assert_eq!(
            ArchiveFormat::from_url("https://example.com/dl/bar.zip?raw=true"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::from_url("https://example.com/bar.tar.gz#top"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(ArchiveFormat::from_url("https://example.com/bar.py?x=.zip"), None);
    }

    #[test]
    fn test_zip_single_root_is_unwrapped() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        write_zip(&archive, &[("pkg-main/__init__.py", "x"), ("pkg-main/nodes.py", "y")]);

        let dest = dir.path().join("out").join("pkg");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        extract_archive(&archive, ArchiveFormat::Zip, &dest).unwrap();

        assert!(dest.join("__init__.py").exists());
        assert!(dest.join("nodes.py").exists());
        assert!(!dir.path().join("out").join("pkg.unpack").exists());
    }

    #[test]
    fn test_tarball_multiple_roots_kept() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.tar.gz");
        write_tar_gz(&archive, &[("__init__.py", "x"), ("lib/util.py", "y")]);

        let dest = dir.path().join("pkg");
        extract_archive(&archive, ArchiveFormat::TarGz, &dest).unwrap();

        assert!(dest.join("__init__.py").exists());
        assert!(dest.join("lib/util.py").exists());
    }

    #[test]
    fn test_corrupt_archive_fails() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("bad.zip");
        std::fs::write(&archive, "not a zip").unwrap();
        let dest = dir.path().join("bad");
        assert!(extract_archive(&archive, ArchiveFormat::Zip, &dest).is_err());
        assert!(!dest.exists());
    }
}
