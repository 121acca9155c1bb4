//! tar.gz archive creation/extraction and single-file gzip helpers.
//!
//! Archives back the files/config/full backup types; the gzip helpers
//! compress SQL dumps. Extraction validates every entry path before
//! touching the filesystem and refuses absolute paths and traversal.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),
    #[error("Archive contains unsafe path: {0}")]
    UnsafePath(String),
    #[error("Source path does not exist: {0}")]
    MissingSource(PathBuf),
}

/// Create a tar.gz archive at `archive_path` containing each of
/// `sources`. Directory sources are added recursively; entries are stored
/// with their absolute path minus the leading `/`, matching how the
/// archive is later unpacked against a root. Sources that do not exist
/// are skipped so a partial install still backs up.
///
/// Returns the archive size in bytes.
pub fn create_tar_gz(archive_path: &Path, sources: &[PathBuf]) -> Result<u64, ArchiveError> {
    let file = File::create(archive_path)?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut tar = Builder::new(enc);

    for source in sources {
        if !source.exists() {
            debug!(path = %source.display(), "Skipping missing backup source");
            continue;
        }
        let name = source
            .to_string_lossy()
            .trim_start_matches('/')
            .to_string();
        if source.is_dir() {
            tar.append_dir_all(&name, source)?;
        } else {
            tar.append_path_with_name(source, &name)?;
        }
        debug!(path = %source.display(), "Added to archive");
    }

    let enc = tar.into_inner()?;
    enc.finish()?;

    let size = fs::metadata(archive_path)?.len();
    info!(path = %archive_path.display(), size, "Created archive");
    Ok(size)
}

/// True when an archive entry path is safe to extract: relative, with no
/// parent-directory components.
pub fn entry_path_is_safe(path: &Path) -> bool {
    !path.is_absolute()
        && !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

/// Extract a tar.gz archive beneath `dest_root`.
///
/// Every entry path is validated before anything is written; one unsafe
/// entry rejects the whole archive.
pub fn extract_tar_gz(archive_path: &Path, dest_root: &Path) -> Result<(), ArchiveError> {
    // Validation pass.
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive
        .entries()
        .map_err(|e| ArchiveError::InvalidArchive(e.to_string()))?
    {
        let entry = entry.map_err(|e| ArchiveError::InvalidArchive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| ArchiveError::InvalidArchive(e.to_string()))?;
        if !entry_path_is_safe(&path) {
            return Err(ArchiveError::UnsafePath(path.display().to_string()));
        }
    }

    // Extraction pass.
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest_root)
        .map_err(|e| ArchiveError::InvalidArchive(e.to_string()))?;

    info!(
        archive = %archive_path.display(),
        dest = %dest_root.display(),
        "Extracted archive"
    );
    Ok(())
}

/// gzip `src` to `dest`, returning the compressed size in bytes. The
/// source file is left in place; callers decide whether to remove it.
pub fn compress_file(src: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    if !src.exists() {
        return Err(ArchiveError::MissingSource(src.to_path_buf()));
    }

    let mut input = File::open(src)?;
    let output = File::create(dest)?;
    let mut encoder = GzEncoder::new(output, Compression::default());

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?;

    Ok(fs::metadata(dest)?.len())
}

/// gunzip `src` to `dest`, returning the decompressed size in bytes.
pub fn decompress_file(src: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    if !src.exists() {
        return Err(ArchiveError::MissingSource(src.to_path_buf()));
    }

    let input = File::open(src)?;
    let mut decoder = GzDecoder::new(input);
    let mut output = File::create(dest)?;

    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
        total += n as u64;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tar_gz_roundtrip() {
        let dir = TempDir::new().unwrap();
        let src_dir = dir.path().join("etc-redis");
        fs::create_dir_all(&src_dir).unwrap();
        fs::write(src_dir.join("redis.conf"), "maxmemory 2g\n").unwrap();
        fs::write(src_dir.join("users.acl"), "user default on\n").unwrap();

        let archive = dir.path().join("config.tar.gz");
        let size = create_tar_gz(&archive, &[src_dir.clone()]).unwrap();
        assert!(size > 0);

        let dest = dir.path().join("restore");
        fs::create_dir_all(&dest).unwrap();
        extract_tar_gz(&archive, &dest).unwrap();

        // Entries are stored with the leading '/' stripped.
        let restored = dest.join(src_dir.to_string_lossy().trim_start_matches('/'));
        assert_eq!(
            fs::read_to_string(restored.join("redis.conf")).unwrap(),
            "maxmemory 2g\n"
        );
        assert_eq!(
            fs::read_to_string(restored.join("users.acl")).unwrap(),
            "user default on\n"
        );
    }

    #[test]
    fn test_missing_sources_are_skipped() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present.txt");
        fs::write(&present, "here").unwrap();

        let archive = dir.path().join("mixed.tar.gz");
        let size = create_tar_gz(
            &archive,
            &[present, dir.path().join("absent-dir"), dir.path().join("absent.txt")],
        )
        .unwrap();
        assert!(size > 0);
    }

    #[test]
    fn test_entry_path_safety() {
        assert!(entry_path_is_safe(Path::new("etc/redis/redis.conf")));
        assert!(entry_path_is_safe(Path::new("single-file.txt")));
        assert!(!entry_path_is_safe(Path::new("/etc/passwd")));
        assert!(!entry_path_is_safe(Path::new("../escape.txt")));
        assert!(!entry_path_is_safe(Path::new("nested/../../escape.txt")));
    }

    #[test]
    fn test_gzip_roundtrip() {
        let dir = TempDir::new().unwrap();
        let sql = dir.path().join("appdb.sql");
        let dump = "CREATE TABLE t (id INT);\n".repeat(500);
        fs::write(&sql, &dump).unwrap();

        let gz = dir.path().join("appdb.sql.gz");
        let compressed_size = compress_file(&sql, &gz).unwrap();
        assert!(compressed_size > 0);
        assert!(compressed_size < dump.len() as u64);
        // Source stays in place.
        assert!(sql.exists());

        let restored = dir.path().join("restored.sql");
        let restored_size = decompress_file(&gz, &restored).unwrap();
        assert_eq!(restored_size, dump.len() as u64);
        assert_eq!(fs::read_to_string(&restored).unwrap(), dump);
    }

    #[test]
    fn test_compress_missing_source() {
        let dir = TempDir::new().unwrap();
        let result = compress_file(&dir.path().join("absent.sql"), &dir.path().join("out.gz"));
        assert!(matches!(result, Err(ArchiveError::MissingSource(_))));
    }
}
